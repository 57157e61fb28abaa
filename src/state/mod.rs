//! Active-selection sidecar.
//!
//! A small JSON record under the XDG state directory tracks which game
//! install and store the user last selected, so commands can omit
//! `--game`. Written atomically via temp-file + rename.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::Paths;
use crate::db::now_iso;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Active {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_game_install_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_store_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

pub fn active_file(paths: &Paths) -> PathBuf {
    paths.active_file()
}

pub fn load_active(path: &Path) -> Result<Active> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Active::default()),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}

pub fn save_active(path: &Path, mut active: Active) -> Result<()> {
    active.updated_at = Some(now_iso());

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut body = serde_json::to_vec_pretty(&active).context("serialize active selection")?;
    body.push(b'\n');

    // Atomic on POSIX when tmp and final share a filesystem.
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &body).with_context(|| format!("write {}", tmp.display()))?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err).with_context(|| format!("rename {} -> {}", tmp.display(), path.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_loads_as_default() {
        let tmp = TempDir::new().unwrap();
        let active = load_active(&tmp.path().join("active.json")).unwrap();
        assert!(active.active_game_install_id.is_none());
        assert!(active.active_store_id.is_none());
    }

    #[test]
    fn save_and_reload_round_trips() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("active.json");
        save_active(
            &path,
            Active {
                active_game_install_id: Some(7),
                active_store_id: Some("steam".to_string()),
                updated_at: None,
            },
        )
        .unwrap();

        let loaded = load_active(&path).unwrap();
        assert_eq!(loaded.active_game_install_id, Some(7));
        assert_eq!(loaded.active_store_id.as_deref(), Some("steam"));
        assert!(loaded.updated_at.is_some());

        // no temp file left behind
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_an_error_not_a_reset() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("active.json");
        fs::write(&path, b"{ not json").unwrap();
        assert!(load_active(&path).is_err());
    }
}
