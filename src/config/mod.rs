//! Configuration management for modctl
//!
//! Uses XDG-compliant paths:
//! - Config: ~/.config/modctl/config.toml
//! - State:  ~/.local/share/modctl/

mod paths;

pub use paths::Paths;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Override for the state root directory (db + blob stores + tmp)
    pub state_root_override: Option<String>,

    /// Archiver binary used for listing and extracting mod archives
    pub bsdtar: String,

    /// Timeout in seconds for archive listing
    pub list_timeout_secs: u64,

    /// Timeout in seconds for archive extraction
    pub extract_timeout_secs: u64,

    /// Path-safety limits applied to every target-relative path
    pub path_limits: PathLimits,

    /// Paths configuration
    #[serde(skip)]
    pub paths: Paths,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_root_override: None,
            bsdtar: "bsdtar".to_string(),
            list_timeout_secs: 60,
            extract_timeout_secs: 600,
            path_limits: PathLimits::default(),
            paths: Paths::new(),
        }
    }
}

/// Limits applied when validating target-relative paths.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PathLimits {
    /// Maximum total path length in bytes
    pub max_len: usize,
    /// Maximum number of path segments
    pub max_depth: usize,
}

impl Default for PathLimits {
    fn default() -> Self {
        Self {
            max_len: 1024,
            max_depth: 48,
        }
    }
}

impl Config {
    /// Resolve the state root (override or default XDG path)
    pub fn state_root(&self) -> PathBuf {
        self.state_root_override
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.paths.state_root())
    }

    pub fn database_file(&self) -> PathBuf {
        self.state_root().join("modctl.db")
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.state_root().join("archives")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.state_root().join("backups")
    }

    pub fn overrides_dir(&self) -> PathBuf {
        self.state_root().join("overrides")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.state_root().join("tmp")
    }

    pub fn incoming_dir(&self) -> PathBuf {
        self.tmp_dir().join("incoming")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.tmp_dir().join("locks")
    }

    /// Ensure the state directory layout exists, including overrides.
    pub fn ensure_dirs(&self) -> Result<()> {
        self.paths
            .ensure_dirs()
            .context("Failed to create default application directories")?;
        for dir in [
            self.state_root(),
            self.archives_dir(),
            self.backups_dir(),
            self.overrides_dir(),
            self.tmp_dir(),
            self.incoming_dir(),
            self.locks_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Load configuration from disk or create default
    pub async fn load() -> Result<Self> {
        let paths = Paths::new();
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            // Create default config
            let config = Config::default();
            config.save().await?;
            config
        };

        config.paths = paths;
        Ok(config)
    }

    /// Save configuration to disk
    pub async fn save(&self) -> Result<()> {
        let config_path = self.paths.config_file();

        // Ensure config directory exists
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&config_path, content)
            .await
            .context("Failed to write config file")?;

        Ok(())
    }
}
