//! Game install selectors and resolution.
//!
//! Installs are addressed as `store:game_id[#instance]`, where the
//! instance defaults to `default`. A bare numeric argument is treated as
//! a raw install id.

use std::fmt::Write as _;

use crate::db::{Database, GameInstallRecord, UpsertGameInstall};
use crate::errors::{Error, Result};

/// Selector with the instance always present, even when `default`.
///
/// Example: `steam:1091500#default`
pub fn full_selector(store_id: &str, store_game_id: &str, instance_id: &str) -> String {
    let store_id = store_id.trim().to_lowercase();
    let store_game_id = store_game_id.trim();
    let mut instance_id = instance_id.trim();
    if instance_id.is_empty() {
        instance_id = "default";
    }
    format!("{store_id}:{store_game_id}#{instance_id}")
}

/// Selector with the instance only when it isn't `default`.
///
/// Example: `steam:1091500`, `steam:1091500#library_2`
pub fn short_selector(store_id: &str, store_game_id: &str, instance_id: &str) -> String {
    let store_id = store_id.trim().to_lowercase();
    let store_game_id = store_game_id.trim();
    let instance_id = instance_id.trim();
    if instance_id.is_empty() || instance_id == "default" {
        format!("{store_id}:{store_game_id}")
    } else {
        format!("{store_id}:{store_game_id}#{instance_id}")
    }
}

/// Parse `store:game` or `store:game#instance`; an omitted instance
/// resolves to `default`.
pub fn parse_selector(s: &str) -> Result<(String, String, String)> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::validation("empty selector"));
    }

    let colon = s.find(':').ok_or_else(|| {
        Error::validation(format!(
            "invalid selector {s:?} (expected store:game or store:game#instance)"
        ))
    })?;
    if colon == 0 || colon == s.len() - 1 {
        return Err(Error::validation(format!(
            "invalid selector {s:?} (expected store:game or store:game#instance)"
        )));
    }

    let store_id = s[..colon].trim().to_lowercase();
    let rest = s[colon + 1..].trim();
    if store_id.is_empty() || rest.is_empty() {
        return Err(Error::validation(format!("invalid selector {s:?}")));
    }

    let parts: Vec<&str> = rest.split('#').collect();
    if parts.len() > 2 {
        return Err(Error::validation(format!(
            "invalid selector {s:?} (multiple '#' characters)"
        )));
    }

    let store_game_id = parts[0].trim();
    if store_game_id.is_empty() {
        return Err(Error::validation(format!(
            "invalid selector {s:?} (missing game id)"
        )));
    }

    let instance_id = if parts.len() == 1 {
        "default"
    } else {
        let inst = parts[1].trim();
        if inst.is_empty() {
            return Err(Error::validation(format!(
                "invalid selector {s:?} (missing instance id after '#')"
            )));
        }
        inst
    };

    Ok((
        store_id,
        store_game_id.to_string(),
        instance_id.to_string(),
    ))
}

/// Resolve a user-supplied game argument: a raw install id, or a
/// selector. When the instance is omitted and only one install of the
/// game exists, that one is chosen; otherwise the candidates are listed
/// in the error.
pub fn resolve_game_install(db: &Database, arg: &str) -> Result<GameInstallRecord> {
    if let Ok(id) = arg.trim().parse::<i64>() {
        return db
            .get_game_install(id)?
            .ok_or_else(|| Error::not_found(format!("no game install with id {id}")));
    }

    let (store_id, store_game_id, instance_id) = parse_selector(arg)?;

    if let Some(gi) = db.find_game_install(&store_id, &store_game_id, &instance_id)? {
        return Ok(gi);
    }

    // An explicit instance that doesn't exist is simply not found.
    if arg.contains('#') {
        return Err(Error::not_found(format!(
            "no game install found for {}",
            full_selector(&store_id, &store_game_id, &instance_id)
        )));
    }

    // Instance omitted: a single candidate wins, several must be
    // disambiguated.
    let candidates = db.list_installs_for_game(&store_id, &store_game_id)?;
    match candidates.len() {
        0 => Err(Error::not_found(format!(
            "no game installs found for {store_id}:{store_game_id}"
        ))),
        1 => Ok(candidates.into_iter().next().expect("len checked")),
        _ => {
            let mut msg = format!(
                "Multiple installs found for {store_id}:{store_game_id}. Choose one:\n\n"
            );
            for gi in &candidates {
                let present = if gi.is_present { "present" } else { "missing" };
                let _ = writeln!(
                    msg,
                    "  {}  ({})  {}  {}",
                    full_selector(&gi.store_id, &gi.store_game_id, &gi.instance_id),
                    gi.display_name,
                    present,
                    gi.last_seen_at.as_deref().unwrap_or("")
                );
            }
            Err(Error::validation(msg))
        }
    }
}

/// Register a game install by hand and wire up its `game_dir` target and
/// default profile. The manual path exists because store discovery is a
/// pluggable collaborator, not a core capability.
pub fn register_install(
    db: &Database,
    selector: &str,
    display_name: &str,
    install_root: &str,
) -> Result<GameInstallRecord> {
    let (store_id, store_game_id, instance_id) = parse_selector(selector)?;
    if db.get_store(&store_id)?.is_none() {
        return Err(Error::not_found(format!("store {store_id:?} is not registered")));
    }

    let id = db.upsert_game_install(&UpsertGameInstall {
        store_id,
        store_game_id,
        instance_id,
        display_name: display_name.to_string(),
        install_root: install_root.to_string(),
        last_seen_at: Some(crate::db::now_iso()),
    })?;
    db.upsert_discovered_target(id, "game_dir", install_root)?;
    db.ensure_default_profile(id)?;

    db.get_game_install(id)?
        .ok_or_else(|| Error::not_found(format!("game install {id}")))
}

/// Walk the enabled stores and dispatch discovery to their handlers.
/// Store-specific discovery ships separately; unknown implementations are
/// only reported.
pub fn refresh_stores(db: &Database) -> Result<Vec<String>> {
    let mut warnings = Vec::new();
    for store in db.list_stores()? {
        if !store.enabled {
            continue;
        }
        tracing::warn!(
            store = %store.id,
            implementation = %store.implementation,
            "no discovery handler for this implementation"
        );
        warnings.push(format!(
            "store {}: discovery handler {:?} is not available in this build",
            store.id, store.implementation
        ));
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_install() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let gi = register_install(&db, "steam:1091500", "Cyber Game", "/tmp/game1").unwrap();
        (db, gi.id)
    }

    #[test]
    fn selectors_parse_and_format() {
        assert_eq!(
            parse_selector("steam:1091500").unwrap(),
            ("steam".to_string(), "1091500".to_string(), "default".to_string())
        );
        assert_eq!(
            parse_selector("Steam:1091500#library_2").unwrap(),
            ("steam".to_string(), "1091500".to_string(), "library_2".to_string())
        );

        assert_eq!(full_selector("steam", "1091500", ""), "steam:1091500#default");
        assert_eq!(short_selector("steam", "1091500", "default"), "steam:1091500");
        assert_eq!(
            short_selector("steam", "1091500", "library_2"),
            "steam:1091500#library_2"
        );
    }

    #[test]
    fn bad_selectors_are_validation_errors() {
        for bad in ["", ":", "steam:", ":123", "steam", "steam:1#2#3", "steam:1#"] {
            assert!(
                matches!(parse_selector(bad), Err(Error::Validation(_))),
                "{bad:?} should fail"
            );
        }
    }

    #[test]
    fn register_creates_target_and_default_profile() {
        let (db, id) = db_with_install();
        let target = db.get_target_by_name(id, "game_dir").unwrap().unwrap();
        assert_eq!(target.root_path, "/tmp/game1");
        let profile = db.get_profile_by_name(id, "default").unwrap().unwrap();
        assert!(profile.is_active);
    }

    #[test]
    fn register_requires_known_store() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            register_install(&db, "gog:123", "Game", "/tmp/g"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn resolve_by_id_selector_and_single_candidate() {
        let (db, id) = db_with_install();

        assert_eq!(resolve_game_install(&db, &id.to_string()).unwrap().id, id);
        assert_eq!(
            resolve_game_install(&db, "steam:1091500#default").unwrap().id,
            id
        );
        // omitted instance with one candidate
        assert_eq!(resolve_game_install(&db, "steam:1091500").unwrap().id, id);

        assert!(matches!(
            resolve_game_install(&db, "steam:1091500#library_9"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            resolve_game_install(&db, "steam:999"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn ambiguous_instance_lists_candidates() {
        let (db, _) = db_with_install();
        register_install(&db, "steam:1091500#library_2", "Cyber Game", "/mnt/lib2/game")
            .unwrap();

        let err = resolve_game_install(&db, "steam:1091500").unwrap_err();
        match err {
            Error::Validation(msg) => {
                assert!(msg.contains("steam:1091500#default"));
                assert!(msg.contains("steam:1091500#library_2"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}
