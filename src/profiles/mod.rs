//! Profile resolution helpers.

use crate::db::{Database, GameInstallRecord, ProfileRecord};
use crate::errors::{Error, Result};

/// Resolve `--profile` for a command: an explicit name must exist, and an
/// omitted one falls back to the install's active profile.
pub fn resolve_profile(
    db: &Database,
    install: &GameInstallRecord,
    arg: Option<&str>,
) -> Result<ProfileRecord> {
    match arg {
        Some(name) if !name.is_empty() => db
            .get_profile_by_name(install.id, name)?
            .ok_or_else(|| Error::not_found(format!("profile {name:?} not found for this game"))),
        _ => db.get_active_profile(install.id)?.ok_or_else(|| {
            Error::validation(
                "no active profile set; run `modctl profiles set-active <name>` or pass --profile",
            )
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::register_install;

    #[test]
    fn explicit_name_beats_active_profile() {
        let db = Database::open_in_memory().unwrap();
        let gi = register_install(&db, "steam:10", "Game", "/tmp/g").unwrap();
        let alt = db.create_profile(gi.id, "alt").unwrap();

        // default was created active by registration
        assert_eq!(resolve_profile(&db, &gi, None).unwrap().name, "default");
        assert_eq!(resolve_profile(&db, &gi, Some("alt")).unwrap().id, alt.id);
        assert!(matches!(
            resolve_profile(&db, &gi, Some("nope")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn missing_active_profile_is_a_validation_error() {
        let db = Database::open_in_memory().unwrap();
        let gi = register_install(&db, "steam:10", "Game", "/tmp/g").unwrap();
        let default = db.get_profile_by_name(gi.id, "default").unwrap().unwrap();
        db.delete_profile(default.id).unwrap();

        assert!(matches!(
            resolve_profile(&db, &gi, None),
            Err(Error::Validation(_))
        ));
    }
}
