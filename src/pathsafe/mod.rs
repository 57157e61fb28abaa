//! Path safety: normalization and containment for target-relative paths.
//!
//! Every path that came out of an archive or a remap rule passes through
//! here before the planner will accept it. The result is a canonical
//! `/`-separated relative path guaranteed to stay inside the target root.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::PathLimits;
use crate::errors::{Error, Result};

/// Which safety rule rejected a candidate path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathRule {
    Empty,
    Absolute,
    DriveLetter,
    Traversal,
    Reserved,
    TooLong,
    TooDeep,
    /// Symlink, hardlink, or device entries are never deployed.
    LinkEntry,
}

impl fmt::Display for PathRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PathRule::Empty => "empty path",
            PathRule::Absolute => "absolute path",
            PathRule::DriveLetter => "drive letter",
            PathRule::Traversal => "escapes target root",
            PathRule::Reserved => "reserved filename",
            PathRule::TooLong => "exceeds maximum length",
            PathRule::TooDeep => "exceeds maximum depth",
            PathRule::LinkEntry => "link or special entry",
        };
        f.write_str(s)
    }
}

/// A validated, normalized target-relative path. Always `/`-separated,
/// never empty, never escaping the root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SafeRelPath(String);

impl SafeRelPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_path_buf(&self) -> PathBuf {
        PathBuf::from(&self.0)
    }

    /// Number of path segments.
    pub fn depth(&self) -> usize {
        self.0.split('/').count()
    }
}

impl fmt::Display for SafeRelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn unsafe_path(candidate: &str, rule: PathRule) -> Error {
    Error::UnsafePath {
        path: candidate.to_string(),
        rule,
    }
}

/// Windows reserved device names; games frequently run under Proton so a
/// path that is undeployable there is rejected outright.
fn is_reserved_segment(segment: &str) -> bool {
    let stem = segment.split('.').next().unwrap_or(segment);
    let upper = stem.to_ascii_uppercase();
    matches!(
        upper.as_str(),
        "CON" | "PRN" | "AUX" | "NUL"
    ) || (upper.len() == 4
        && (upper.starts_with("COM") || upper.starts_with("LPT"))
        && upper.as_bytes()[3].is_ascii_digit()
        && upper.as_bytes()[3] != b'0')
}

/// Validate a candidate target-relative path and reduce it to canonical
/// form. Backslashes are treated as separators (archives built on Windows
/// use them), `.` segments are dropped, and `..` segments pop lexically;
/// popping past the root is a traversal rejection.
pub fn sanitize_rel_path(candidate: &str, limits: &PathLimits) -> Result<SafeRelPath> {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return Err(unsafe_path(candidate, PathRule::Empty));
    }

    let slashed = trimmed.replace('\\', "/");
    if slashed.starts_with('/') {
        return Err(unsafe_path(candidate, PathRule::Absolute));
    }

    // Drive letters: "C:" or "C:/..."
    let bytes = slashed.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(unsafe_path(candidate, PathRule::DriveLetter));
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in slashed.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if segments.pop().is_none() {
                    return Err(unsafe_path(candidate, PathRule::Traversal));
                }
            }
            _ => {
                if segment.contains('\0') {
                    return Err(unsafe_path(candidate, PathRule::Reserved));
                }
                if is_reserved_segment(segment) {
                    return Err(unsafe_path(candidate, PathRule::Reserved));
                }
                segments.push(segment);
            }
        }
    }

    if segments.is_empty() {
        return Err(unsafe_path(candidate, PathRule::Empty));
    }
    if segments.len() > limits.max_depth {
        return Err(unsafe_path(candidate, PathRule::TooDeep));
    }

    let normalized = segments.join("/");
    if normalized.len() > limits.max_len {
        return Err(unsafe_path(candidate, PathRule::TooLong));
    }

    Ok(SafeRelPath(normalized))
}

/// Lexically clean an absolute path: resolve `.` and `..` without touching
/// the filesystem.
fn clean_abs(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Reports whether `path` resides within directory `dir`.
///
/// Both are converted to absolute form and compared by the relative path
/// between them, never by string prefix (which would treat `/foo/bar-baz`
/// as inside `/foo/bar`). Symlinks are not resolved.
pub fn is_under_dir(path: &Path, dir: &Path) -> Result<bool> {
    let cwd = std::env::current_dir()?;
    let abs_path = clean_abs(&if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    });
    let abs_dir = clean_abs(&if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        cwd.join(dir)
    });

    Ok(abs_path.starts_with(&abs_dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> PathLimits {
        PathLimits::default()
    }

    #[test]
    fn accepts_plain_relative_paths() {
        let p = sanitize_rel_path("config/app.ini", &limits()).unwrap();
        assert_eq!(p.as_str(), "config/app.ini");
        assert_eq!(p.depth(), 2);
    }

    #[test]
    fn normalizes_backslashes_and_dot_segments() {
        let p = sanitize_rel_path("Data\\./textures\\sky.dds", &limits()).unwrap();
        assert_eq!(p.as_str(), "Data/textures/sky.dds");
    }

    #[test]
    fn inner_parent_segments_resolve_lexically() {
        let p = sanitize_rel_path("a/b/../c.txt", &limits()).unwrap();
        assert_eq!(p.as_str(), "a/c.txt");
    }

    #[test]
    fn rejects_escaping_paths() {
        for bad in ["../etc/passwd", "a/../../b", "..", "a/b/../../.."] {
            let err = sanitize_rel_path(bad, &limits()).unwrap_err();
            assert!(
                matches!(err, Error::UnsafePath { rule: PathRule::Traversal, .. }),
                "{bad} should be a traversal"
            );
        }
    }

    #[test]
    fn rejects_absolute_and_drive_paths() {
        assert!(matches!(
            sanitize_rel_path("/etc/passwd", &limits()).unwrap_err(),
            Error::UnsafePath { rule: PathRule::Absolute, .. }
        ));
        assert!(matches!(
            sanitize_rel_path("C:\\Games\\mod.dll", &limits()).unwrap_err(),
            Error::UnsafePath { rule: PathRule::DriveLetter, .. }
        ));
    }

    #[test]
    fn rejects_empty_and_dot_only() {
        for bad in ["", "   ", ".", "./.", "//"] {
            assert!(matches!(
                sanitize_rel_path(bad, &limits()).unwrap_err(),
                Error::UnsafePath { rule: PathRule::Empty, .. }
            ));
        }
    }

    #[test]
    fn rejects_reserved_names() {
        for bad in ["NUL", "con.txt", "textures/AUX", "COM1.dds", "lpt9"] {
            assert!(
                matches!(
                    sanitize_rel_path(bad, &limits()).unwrap_err(),
                    Error::UnsafePath { rule: PathRule::Reserved, .. }
                ),
                "{bad} should be reserved"
            );
        }
        // COM0 / LPT0 and longer names are not reserved
        assert!(sanitize_rel_path("COM0", &limits()).is_ok());
        assert!(sanitize_rel_path("COM10", &limits()).is_ok());
        assert!(sanitize_rel_path("console.log", &limits()).is_ok());
    }

    #[test]
    fn enforces_limits() {
        let tight = PathLimits {
            max_len: 10,
            max_depth: 2,
        };
        assert!(matches!(
            sanitize_rel_path("a/bbbbbbbbbbbb", &tight).unwrap_err(),
            Error::UnsafePath { rule: PathRule::TooLong, .. }
        ));
        assert!(matches!(
            sanitize_rel_path("a/b/c", &tight).unwrap_err(),
            Error::UnsafePath { rule: PathRule::TooDeep, .. }
        ));
    }

    #[test]
    fn sanitized_path_stays_under_root() {
        let root = Path::new("/tmp/game1");
        for candidate in ["a/b/c.txt", "x/../y.txt", "Data\\z.esp"] {
            let p = sanitize_rel_path(candidate, &limits()).unwrap();
            let joined = root.join(p.to_path_buf());
            assert!(is_under_dir(&joined, root).unwrap(), "{candidate}");
        }
    }

    #[test]
    fn under_dir_is_not_a_prefix_check() {
        assert!(!is_under_dir(Path::new("/foo/bar-baz"), Path::new("/foo/bar")).unwrap());
        assert!(is_under_dir(Path::new("/foo/bar/baz"), Path::new("/foo/bar")).unwrap());
        assert!(is_under_dir(Path::new("/foo/bar"), Path::new("/foo/bar")).unwrap());
        assert!(!is_under_dir(Path::new("/foo/bar/../qux"), Path::new("/foo/bar")).unwrap());
    }
}
