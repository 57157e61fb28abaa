//! Filesystem locations derived from the XDG base directories.
//!
//! modctl persists three kinds of things: the config file under the XDG
//! config home, the state root (database, blob stores, scratch space)
//! under the XDG data home, and the active-selection sidecar under the
//! XDG state home. Everything below is a pure path computation;
//! `ensure_dirs` is the only method that touches the filesystem.

use directories::ProjectDirs;
use std::path::PathBuf;

/// Resolver for modctl's on-disk locations.
#[derive(Debug, Clone)]
pub struct Paths {
    dirs: ProjectDirs,
}

impl Paths {
    /// Resolve the per-user base directories. Panics only when the
    /// environment provides no home at all, which nothing downstream
    /// can recover from.
    pub fn new() -> Self {
        let dirs = ProjectDirs::from("", "", "modctl")
            .expect("no usable home directory for XDG paths");
        Self { dirs }
    }

    /// Config directory: ~/.config/modctl/
    pub fn config_dir(&self) -> PathBuf {
        self.dirs.config_dir().to_path_buf()
    }

    /// Main config file: ~/.config/modctl/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_dir().join("config.toml")
    }

    /// State root: ~/.local/share/modctl/
    pub fn state_root(&self) -> PathBuf {
        self.dirs.data_dir().to_path_buf()
    }

    /// Metadata store: ~/.local/share/modctl/modctl.db
    pub fn database_file(&self) -> PathBuf {
        self.state_root().join("modctl.db")
    }

    /// Archive blobs: ~/.local/share/modctl/archives/
    pub fn archives_dir(&self) -> PathBuf {
        self.state_root().join("archives")
    }

    /// Backup blobs: ~/.local/share/modctl/backups/
    pub fn backups_dir(&self) -> PathBuf {
        self.state_root().join("backups")
    }

    /// Override blobs: ~/.local/share/modctl/overrides/
    pub fn overrides_dir(&self) -> PathBuf {
        self.state_root().join("overrides")
    }

    /// Scratch space; safe to wipe on startup.
    pub fn tmp_dir(&self) -> PathBuf {
        self.state_root().join("tmp")
    }

    /// Ingest temp files: tmp/incoming/
    pub fn incoming_dir(&self) -> PathBuf {
        self.tmp_dir().join("incoming")
    }

    /// Per-install apply locks: tmp/locks/
    pub fn locks_dir(&self) -> PathBuf {
        self.tmp_dir().join("locks")
    }

    /// Log file directory (also under the state root)
    pub fn log_dir(&self) -> PathBuf {
        self.state_root().join("logs")
    }

    /// Active selection sidecar: ~/.local/state/modctl/active.json
    pub fn active_file(&self) -> PathBuf {
        self.dirs
            .state_dir()
            .map(|d| d.to_path_buf())
            .unwrap_or_else(|| self.state_root())
            .join("active.json")
    }

    /// Create every directory modctl expects to exist.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.state_root())?;
        std::fs::create_dir_all(self.archives_dir())?;
        std::fs::create_dir_all(self.backups_dir())?;
        std::fs::create_dir_all(self.overrides_dir())?;
        std::fs::create_dir_all(self.tmp_dir())?;
        std::fs::create_dir_all(self.incoming_dir())?;
        std::fs::create_dir_all(self.locks_dir())?;
        std::fs::create_dir_all(self.log_dir())?;
        if let Some(parent) = self.active_file().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
