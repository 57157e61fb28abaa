//! Nexus Mods URL parsing.
//!
//! The importer accepts a `--nexus-url` so a locally downloaded archive
//! can be linked back to its mod page. Only the URL shape is handled
//! here; there is no API client.

use regex_lite::Regex;

use crate::errors::{Error, Result};

/// `(game_domain, mod_id)` identity of a Nexus mod page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModRef {
    pub game_domain: String,
    pub mod_id: i64,
}

/// Extract `(game_domain, mod_id)` from a mod page URL such as
/// `https://www.nexusmods.com/skyrimspecialedition/mods/266`.
/// Tolerates extra path segments after the mod id.
pub fn parse_mod_url(raw: &str) -> Result<ModRef> {
    let trimmed = raw.trim();
    let re = Regex::new(
        r"^https?://(?:[a-z0-9-]+\.)*nexusmods\.com/([a-z0-9_-]+)/mods/([0-9]+)(?:[/?#].*)?$",
    )
    .expect("static regex");

    let caps = re
        .captures(trimmed)
        .ok_or_else(|| Error::validation(format!("not a nexusmods.com mod url: {raw:?}")))?;

    let game_domain = caps[1].to_string();
    let mod_id: i64 = caps[2]
        .parse()
        .map_err(|_| Error::validation(format!("invalid nexus mod id in {raw:?}")))?;
    if mod_id <= 0 {
        return Err(Error::validation(format!("invalid nexus mod id in {raw:?}")));
    }

    Ok(ModRef {
        game_domain,
        mod_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_mod_urls() {
        let r = parse_mod_url("https://www.nexusmods.com/skyrimspecialedition/mods/266").unwrap();
        assert_eq!(r.game_domain, "skyrimspecialedition");
        assert_eq!(r.mod_id, 266);
    }

    #[test]
    fn tolerates_trailing_segments_and_queries() {
        let r = parse_mod_url("https://nexusmods.com/cyberpunk2077/mods/42/files?tab=files")
            .unwrap();
        assert_eq!(r.game_domain, "cyberpunk2077");
        assert_eq!(r.mod_id, 42);
    }

    #[test]
    fn rejects_foreign_hosts_and_bad_paths() {
        assert!(parse_mod_url("https://example.com/skyrim/mods/266").is_err());
        assert!(parse_mod_url("https://www.nexusmods.com/skyrim").is_err());
        assert!(parse_mod_url("https://www.nexusmods.com/skyrim/mods/abc").is_err());
        assert!(parse_mod_url("https://evilnexusmods.com.attacker.io/skyrim/mods/1").is_err());
        assert!(parse_mod_url("").is_err());
    }
}
