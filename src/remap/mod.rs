//! Remap engine: ordered transforms from archive entry paths to
//! target-relative paths.
//!
//! A profile item may carry a list of rules, totally ordered by position:
//! `strip_components`, `select_subdir`, `dest_prefix`, `include_glob`,
//! `exclude_glob`. An empty rule list is the identity transform. Globs use
//! `/` separators with `*`, `?`, `**` and `[...]` classes, and are tested
//! against the entry path as transformed at that rule's position.
//! `dest_prefix` is prepended after include/exclude filtering.

use regex_lite::Regex;

use crate::errors::{Error, Result};

/// A glob pattern compiled to an anchored regex.
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    regex: Regex,
}

impl Glob {
    pub fn compile(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::validation("empty glob pattern"));
        }
        let regex_src = glob_to_regex(pattern)?;
        let regex = Regex::new(&regex_src)
            .map_err(|e| Error::validation(format!("invalid glob {pattern:?}: {e}")))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

impl PartialEq for Glob {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}
impl Eq for Glob {}

/// Translate a glob into regex source. `*` and `?` never cross a `/`;
/// `**` as a whole segment spans any number of segments.
fn glob_to_regex(pattern: &str) -> Result<String> {
    let mut out = String::from("^");
    let segments: Vec<&str> = pattern.split('/').collect();
    let last = segments.len() - 1;

    for (i, segment) in segments.iter().enumerate() {
        if *segment == "**" {
            if i == last {
                out.push_str(".*");
            } else {
                out.push_str("(?:[^/]+/)*");
            }
            continue;
        }

        let mut chars = segment.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' => out.push_str("[^/]*"),
                '?' => out.push_str("[^/]"),
                '[' => {
                    out.push('[');
                    if chars.peek() == Some(&'!') {
                        chars.next();
                        out.push('^');
                    }
                    let mut closed = false;
                    for cc in chars.by_ref() {
                        if cc == ']' {
                            closed = true;
                            break;
                        }
                        if cc == '\\' || cc == '^' {
                            out.push('\\');
                        }
                        out.push(cc);
                    }
                    if !closed {
                        return Err(Error::validation(format!(
                            "unclosed character class in glob {pattern:?}"
                        )));
                    }
                    out.push(']');
                }
                c if "\\.+()|{}^$".contains(c) => {
                    out.push('\\');
                    out.push(c);
                }
                c => out.push(c),
            }
        }
        if i != last {
            out.push('/');
        }
    }

    out.push('$');
    Ok(out)
}

/// One remap transform. Parameter requirements are enforced here, at
/// construction, never at apply time.
#[derive(Debug, Clone, PartialEq)]
pub enum RemapRule {
    /// Remove the first N path segments; entries with N or fewer segments
    /// are dropped.
    StripComponents(u32),
    /// Retain only entries under this subpath, removing the prefix.
    SelectSubdir(String),
    /// Prepend this prefix to every retained entry.
    DestPrefix(String),
    IncludeGlob(Glob),
    ExcludeGlob(Glob),
}

impl RemapRule {
    pub fn rule_type(&self) -> &'static str {
        match self {
            RemapRule::StripComponents(_) => "strip_components",
            RemapRule::SelectSubdir(_) => "select_subdir",
            RemapRule::DestPrefix(_) => "dest_prefix",
            RemapRule::IncludeGlob(_) => "include_glob",
            RemapRule::ExcludeGlob(_) => "exclude_glob",
        }
    }

    /// Reconstruct a rule from its stored union shape: a discriminant plus
    /// either an integer or a text parameter.
    pub fn from_stored(
        rule_type: &str,
        int_value: Option<i64>,
        text_value: Option<&str>,
    ) -> Result<Self> {
        match rule_type {
            "strip_components" => {
                let n = int_value.ok_or_else(|| {
                    Error::validation("strip_components requires an integer parameter")
                })?;
                if n < 0 {
                    return Err(Error::validation(format!(
                        "strip_components must be non-negative, got {n}"
                    )));
                }
                Ok(RemapRule::StripComponents(n as u32))
            }
            "select_subdir" => {
                let p = require_rel_subpath(rule_type, text_value)?;
                Ok(RemapRule::SelectSubdir(p))
            }
            "dest_prefix" => {
                let p = require_rel_subpath(rule_type, text_value)?;
                Ok(RemapRule::DestPrefix(p))
            }
            "include_glob" => {
                let g = text_value
                    .ok_or_else(|| Error::validation("include_glob requires a pattern"))?;
                Ok(RemapRule::IncludeGlob(Glob::compile(g)?))
            }
            "exclude_glob" => {
                let g = text_value
                    .ok_or_else(|| Error::validation("exclude_glob requires a pattern"))?;
                Ok(RemapRule::ExcludeGlob(Glob::compile(g)?))
            }
            other => Err(Error::validation(format!("unknown remap rule type: {other:?}"))),
        }
    }

    /// Stored union shape for this rule: `(rule_type, int_value, text_value)`.
    pub fn to_stored(&self) -> (&'static str, Option<i64>, Option<String>) {
        match self {
            RemapRule::StripComponents(n) => (self.rule_type(), Some(*n as i64), None),
            RemapRule::SelectSubdir(p) | RemapRule::DestPrefix(p) => {
                (self.rule_type(), None, Some(p.clone()))
            }
            RemapRule::IncludeGlob(g) | RemapRule::ExcludeGlob(g) => {
                (self.rule_type(), None, Some(g.pattern().to_string()))
            }
        }
    }
}

impl RemapRule {
    /// Parse the CLI shape `type=value`, e.g. `strip_components=1` or
    /// `include_glob=**/*.esp`.
    pub fn parse_cli(spec: &str) -> Result<Self> {
        let (rule_type, value) = spec.split_once('=').ok_or_else(|| {
            Error::validation(format!("invalid remap rule {spec:?} (expected type=value)"))
        })?;
        let rule_type = rule_type.trim();
        let value = value.trim();
        if rule_type == "strip_components" {
            let n: i64 = value.parse().map_err(|_| {
                Error::validation(format!("strip_components needs an integer, got {value:?}"))
            })?;
            RemapRule::from_stored(rule_type, Some(n), None)
        } else {
            RemapRule::from_stored(rule_type, None, Some(value))
        }
    }
}

fn require_rel_subpath(rule_type: &str, value: Option<&str>) -> Result<String> {
    let p = value
        .ok_or_else(|| Error::validation(format!("{rule_type} requires a relative subpath")))?
        .trim()
        .trim_matches('/');
    if p.is_empty() {
        return Err(Error::validation(format!(
            "{rule_type} requires a non-empty relative subpath"
        )));
    }
    if p.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(Error::validation(format!(
            "{rule_type} subpath {p:?} must not contain empty, '.' or '..' segments"
        )));
    }
    Ok(p.to_string())
}

/// Run one archive entry path through a rule list.
///
/// Returns the final target-relative path, or `None` when a rule drops the
/// entry. Path-safety validation happens afterwards, in the planner.
pub fn apply_rules(rules: &[RemapRule], entry_path: &str) -> Option<String> {
    let normalized = entry_path.trim_matches('/');
    if normalized.is_empty() {
        return None;
    }

    let mut current = normalized.to_string();
    let mut has_include = false;
    let mut matched_include = false;
    let mut prefixes: Vec<&str> = Vec::new();

    for rule in rules {
        match rule {
            RemapRule::StripComponents(n) => {
                let segments: Vec<&str> = current.split('/').collect();
                if segments.len() <= *n as usize {
                    return None;
                }
                current = segments[*n as usize..].join("/");
            }
            RemapRule::SelectSubdir(subdir) => {
                let prefix = format!("{subdir}/");
                match current.strip_prefix(&prefix) {
                    Some(rest) if !rest.is_empty() => current = rest.to_string(),
                    _ => return None,
                }
            }
            RemapRule::DestPrefix(prefix) => prefixes.push(prefix),
            RemapRule::IncludeGlob(glob) => {
                has_include = true;
                if glob.matches(&current) {
                    matched_include = true;
                }
            }
            RemapRule::ExcludeGlob(glob) => {
                if glob.matches(&current) {
                    return None;
                }
            }
        }
    }

    if has_include && !matched_include {
        return None;
    }

    for prefix in prefixes.iter().rev() {
        current = format!("{prefix}/{current}");
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glob(p: &str) -> Glob {
        Glob::compile(p).unwrap()
    }

    #[test]
    fn globs_match_within_segments() {
        assert!(glob("*.dds").matches("sky.dds"));
        assert!(!glob("*.dds").matches("textures/sky.dds"));
        assert!(glob("textures/*.dds").matches("textures/sky.dds"));
        assert!(glob("sky?.dds").matches("sky1.dds"));
        assert!(!glob("sky?.dds").matches("sky/a.dds"));
    }

    #[test]
    fn double_star_spans_segments() {
        let g = glob("**/*.esp");
        assert!(g.matches("mod.esp"));
        assert!(g.matches("a/b/c/mod.esp"));
        assert!(!g.matches("a/b/c/mod.esm"));

        let trailing = glob("docs/**");
        assert!(trailing.matches("docs/readme.txt"));
        assert!(trailing.matches("docs/a/b/c"));
        assert!(!trailing.matches("src/readme.txt"));
    }

    #[test]
    fn character_classes_work() {
        let g = glob("part[0-9].bin");
        assert!(g.matches("part3.bin"));
        assert!(!g.matches("partx.bin"));

        let neg = glob("[!a]*.txt");
        assert!(neg.matches("b1.txt"));
        assert!(!neg.matches("a1.txt"));
    }

    #[test]
    fn glob_escapes_regex_metachars() {
        let g = glob("file.name+(1).txt");
        assert!(g.matches("file.name+(1).txt"));
        assert!(!g.matches("fileXname+(1)Atxt"));
    }

    #[test]
    fn unclosed_class_is_rejected() {
        assert!(Glob::compile("part[0-9.bin").is_err());
    }

    #[test]
    fn empty_rules_are_identity() {
        assert_eq!(
            apply_rules(&[], "textures/sky.dds"),
            Some("textures/sky.dds".to_string())
        );
    }

    #[test]
    fn strip_components_drops_short_entries() {
        let rules = vec![RemapRule::StripComponents(1)];
        assert_eq!(
            apply_rules(&rules, "ModRoot/data/file.esp"),
            Some("data/file.esp".to_string())
        );
        assert_eq!(apply_rules(&rules, "file.esp"), None);
        // Exactly N segments leaves nothing
        let two = vec![RemapRule::StripComponents(2)];
        assert_eq!(apply_rules(&two, "a/b"), None);
    }

    #[test]
    fn select_subdir_filters_and_strips_prefix() {
        let rules = vec![RemapRule::SelectSubdir("Data".to_string())];
        assert_eq!(
            apply_rules(&rules, "Data/textures/sky.dds"),
            Some("textures/sky.dds".to_string())
        );
        assert_eq!(apply_rules(&rules, "Docs/readme.txt"), None);
        assert_eq!(apply_rules(&rules, "Data"), None);
        // "Database/x" must not match subdir "Data"
        assert_eq!(apply_rules(&rules, "Database/x"), None);
    }

    #[test]
    fn dest_prefix_applies_after_filters() {
        let rules = vec![
            RemapRule::DestPrefix("mods/pack".to_string()),
            RemapRule::IncludeGlob(glob("**/*.ini")),
        ];
        // The include glob sees the un-prefixed path.
        assert_eq!(
            apply_rules(&rules, "config/app.ini"),
            Some("mods/pack/config/app.ini".to_string())
        );
        assert_eq!(apply_rules(&rules, "config/app.txt"), None);
    }

    #[test]
    fn includes_union_excludes_union() {
        let rules = vec![
            RemapRule::IncludeGlob(glob("**/*.esp")),
            RemapRule::IncludeGlob(glob("**/*.ini")),
            RemapRule::ExcludeGlob(glob("docs/**")),
        ];
        assert!(apply_rules(&rules, "mod.esp").is_some());
        assert!(apply_rules(&rules, "config/app.ini").is_some());
        assert!(apply_rules(&rules, "readme.txt").is_none());
        assert!(apply_rules(&rules, "docs/extra.ini").is_none());
    }

    #[test]
    fn ordered_pipeline_composes() {
        // strip the archive's top folder, keep only Data/, drop loose docs
        let rules = vec![
            RemapRule::StripComponents(1),
            RemapRule::SelectSubdir("Data".to_string()),
            RemapRule::ExcludeGlob(glob("**/*.txt")),
            RemapRule::DestPrefix("game".to_string()),
        ];
        assert_eq!(
            apply_rules(&rules, "MyMod-1.0/Data/meshes/a.nif"),
            Some("game/meshes/a.nif".to_string())
        );
        assert_eq!(apply_rules(&rules, "MyMod-1.0/Data/readme.txt"), None);
        assert_eq!(apply_rules(&rules, "MyMod-1.0/Docs/readme.txt"), None);
    }

    #[test]
    fn cli_rules_parse() {
        assert_eq!(
            RemapRule::parse_cli("strip_components=2").unwrap(),
            RemapRule::StripComponents(2)
        );
        assert_eq!(
            RemapRule::parse_cli("select_subdir=Data").unwrap(),
            RemapRule::SelectSubdir("Data".to_string())
        );
        assert!(matches!(
            RemapRule::parse_cli("include_glob=**/*.esp").unwrap(),
            RemapRule::IncludeGlob(_)
        ));
        assert!(RemapRule::parse_cli("strip_components=x").is_err());
        assert!(RemapRule::parse_cli("no-equals").is_err());
    }

    #[test]
    fn stored_round_trip_validates_parameters() {
        let rule = RemapRule::from_stored("strip_components", Some(2), None).unwrap();
        assert_eq!(rule, RemapRule::StripComponents(2));
        assert_eq!(rule.to_stored(), ("strip_components", Some(2), None));

        assert!(RemapRule::from_stored("strip_components", Some(-1), None).is_err());
        assert!(RemapRule::from_stored("strip_components", None, None).is_err());
        assert!(RemapRule::from_stored("select_subdir", None, Some("a/../b")).is_err());
        assert!(RemapRule::from_stored("select_subdir", None, Some("")).is_err());
        assert!(RemapRule::from_stored("dest_prefix", None, Some("mods/x")).is_ok());
        assert!(RemapRule::from_stored("include_glob", None, Some("**/*.esp")).is_ok());
        assert!(RemapRule::from_stored("mystery", None, None).is_err());
    }
}
