//! Database record types

use rusqlite::Row;

use crate::errors::{Error, Result};

/// Game source registry entry (e.g. `steam`)
#[derive(Debug, Clone)]
pub struct StoreRecord {
    pub id: String,
    pub display_name: String,
    pub implementation: String,
    pub enabled: bool,
    pub config_json: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl StoreRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            display_name: row.get(1)?,
            implementation: row.get(2)?,
            enabled: row.get::<_, i64>(3)? != 0,
            config_json: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }
}

/// A concrete installation of a game under a store
#[derive(Debug, Clone)]
pub struct GameInstallRecord {
    pub id: i64,
    pub store_id: String,
    pub store_game_id: String,
    pub instance_id: String,
    pub display_name: String,
    pub install_root: String,
    pub is_present: bool,
    pub last_seen_at: Option<String>,
    pub applied_profile_id: Option<i64>,
    pub applied_operation_id: Option<i64>,
    pub applied_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl GameInstallRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            store_id: row.get(1)?,
            store_game_id: row.get(2)?,
            instance_id: row.get(3)?,
            display_name: row.get(4)?,
            install_root: row.get(5)?,
            is_present: row.get::<_, i64>(6)? != 0,
            last_seen_at: row.get(7)?,
            applied_profile_id: row.get(8)?,
            applied_operation_id: row.get(9)?,
            applied_at: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }
}

/// How a target row came to exist. Discovery never overwrites a
/// user_override target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOrigin {
    Discovered,
    UserOverride,
}

impl TargetOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetOrigin::Discovered => "discovered",
            TargetOrigin::UserOverride => "user_override",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "discovered" => Ok(TargetOrigin::Discovered),
            "user_override" => Ok(TargetOrigin::UserOverride),
            other => Err(Error::corruption(format!("unknown target origin: {other:?}"))),
        }
    }
}

/// A named install root within a game install (v1: exactly `game_dir`)
#[derive(Debug, Clone)]
pub struct TargetRecord {
    pub id: i64,
    pub game_install_id: i64,
    pub name: String,
    pub root_path: String,
    pub origin: TargetOrigin,
    pub created_at: String,
    pub updated_at: String,
}

impl TargetRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let origin: String = row.get(4)?;
        Ok(Self {
            id: row.get(0)?,
            game_install_id: row.get(1)?,
            name: row.get(2)?,
            root_path: row.get(3)?,
            origin: TargetOrigin::from_str(&origin).map_err(|_| {
                rusqlite::Error::InvalidColumnType(4, "origin".into(), rusqlite::types::Type::Text)
            })?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }
}

/// Content-addressed blob metadata
#[derive(Debug, Clone)]
pub struct BlobRecord {
    pub sha256: String,
    pub kind: String,
    pub size_bytes: i64,
    pub original_name: Option<String>,
    pub verified_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl BlobRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sha256: row.get(0)?,
            kind: row.get(1)?,
            size_bytes: row.get(2)?,
            original_name: row.get(3)?,
            verified_at: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }
}

/// Logical mod ("project") scoped to a game install
#[derive(Debug, Clone)]
pub struct ModPageRecord {
    pub id: i64,
    pub game_install_id: i64,
    pub name: String,
    pub source_kind: String,
    pub source_url: Option<String>,
    pub nexus_game_domain: Option<String>,
    pub nexus_mod_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl ModPageRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            game_install_id: row.get(1)?,
            name: row.get(2)?,
            source_kind: row.get(3)?,
            source_url: row.get(4)?,
            nexus_game_domain: row.get(5)?,
            nexus_mod_id: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}

/// A labeled variant under a mod page ("Main File", "Optional", ...)
#[derive(Debug, Clone)]
pub struct ModFileRecord {
    pub id: i64,
    pub mod_page_id: i64,
    pub label: String,
    pub is_primary: bool,
    pub nexus_file_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl ModFileRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            mod_page_id: row.get(1)?,
            label: row.get(2)?,
            is_primary: row.get::<_, i64>(3)? != 0,
            nexus_file_id: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }
}

/// A specific archive blob attached to a mod file
#[derive(Debug, Clone)]
pub struct ModFileVersionRecord {
    pub id: i64,
    pub mod_file_id: i64,
    pub archive_sha256: String,
    pub original_name: Option<String>,
    pub version_string: Option<String>,
    pub metadata: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ModFileVersionRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            mod_file_id: row.get(1)?,
            archive_sha256: row.get(2)?,
            original_name: row.get(3)?,
            version_string: row.get(4)?,
            metadata: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

/// Named mod set scoped to a game install
#[derive(Debug, Clone)]
pub struct ProfileRecord {
    pub id: i64,
    pub game_install_id: i64,
    pub name: String,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl ProfileRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            game_install_id: row.get(1)?,
            name: row.get(2)?,
            is_active: row.get::<_, i64>(3)? != 0,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }
}

/// A pinned mod file version inside a profile
#[derive(Debug, Clone)]
pub struct ProfileItemRecord {
    pub id: i64,
    pub profile_id: i64,
    pub mod_file_version_id: i64,
    pub enabled: bool,
    pub priority: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl ProfileItemRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            profile_id: row.get(1)?,
            mod_file_version_id: row.get(2)?,
            enabled: row.get::<_, i64>(3)? != 0,
            priority: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }
}

/// User-provided final content for a target-relative path in a profile
#[derive(Debug, Clone)]
pub struct OverrideRecord {
    pub id: i64,
    pub profile_id: i64,
    pub target_id: i64,
    pub relpath: String,
    pub blob_sha256: String,
    pub kind: String,
    pub created_at: String,
    pub updated_at: String,
}

impl OverrideRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            profile_id: row.get(1)?,
            target_id: row.get(2)?,
            relpath: row.get(3)?,
            blob_sha256: row.get(4)?,
            kind: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

/// Authoritative record of what the tool wrote at a target path
#[derive(Debug, Clone)]
pub struct InstalledFileRecord {
    pub id: i64,
    pub game_install_id: i64,
    pub target_id: i64,
    pub relpath: String,
    pub content_sha256: String,
    pub size_bytes: i64,
    pub mod_file_version_id: Option<i64>,
    pub override_id: Option<i64>,
    pub profile_id: i64,
    pub last_operation_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl InstalledFileRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            game_install_id: row.get(1)?,
            target_id: row.get(2)?,
            relpath: row.get(3)?,
            content_sha256: row.get(4)?,
            size_bytes: row.get(5)?,
            mod_file_version_id: row.get(6)?,
            override_id: row.get(7)?,
            profile_id: row.get(8)?,
            last_operation_id: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

/// Captured pre-existing content for a path the tool overwrote
#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub id: i64,
    pub game_install_id: i64,
    pub target_id: i64,
    pub relpath: String,
    pub blob_sha256: String,
    pub original_content_sha256: String,
    pub created_at: String,
    pub updated_at: String,
}

impl BackupRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            game_install_id: row.get(1)?,
            target_id: row.get(2)?,
            relpath: row.get(3)?,
            blob_sha256: row.get(4)?,
            original_content_sha256: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Apply,
    Unapply,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Apply => "apply",
            OperationKind::Unapply => "unapply",
        }
    }
}

/// Linear state machine: running -> success | failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Running,
    Success,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Running => "running",
            OperationStatus::Success => "success",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(OperationStatus::Running),
            "success" => Ok(OperationStatus::Success),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(Error::corruption(format!(
                "unknown operation status: {other:?}"
            ))),
        }
    }
}

/// An apply/unapply run
#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub id: i64,
    pub game_install_id: i64,
    pub profile_id: Option<i64>,
    pub kind: String,
    pub status: OperationStatus,
    pub message: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl OperationRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(4)?;
        Ok(Self {
            id: row.get(0)?,
            game_install_id: row.get(1)?,
            profile_id: row.get(2)?,
            kind: row.get(3)?,
            status: OperationStatus::from_str(&status).map_err(|_| {
                rusqlite::Error::InvalidColumnType(4, "status".into(), rusqlite::types::Type::Text)
            })?,
            message: row.get(5)?,
            started_at: row.get(6)?,
            finished_at: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }
}

/// Per-path journal entry action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Write,
    Overwrite,
    Remove,
    RestoreBackup,
    Noop,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Write => "write",
            ChangeAction::Overwrite => "overwrite",
            ChangeAction::Remove => "remove",
            ChangeAction::RestoreBackup => "restore_backup",
            ChangeAction::Noop => "noop",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "write" => Ok(ChangeAction::Write),
            "overwrite" => Ok(ChangeAction::Overwrite),
            "remove" => Ok(ChangeAction::Remove),
            "restore_backup" => Ok(ChangeAction::RestoreBackup),
            "noop" => Ok(ChangeAction::Noop),
            other => Err(Error::corruption(format!("unknown change action: {other:?}"))),
        }
    }
}

/// Append-only per-path entry in the operation journal
#[derive(Debug, Clone)]
pub struct OperationChangeRecord {
    pub id: i64,
    pub operation_id: i64,
    pub target_id: i64,
    pub relpath: String,
    pub action: ChangeAction,
    pub old_content_sha256: Option<String>,
    pub new_content_sha256: Option<String>,
    pub old_size_bytes: Option<i64>,
    pub new_size_bytes: Option<i64>,
    pub mod_file_version_id: Option<i64>,
    pub backup_sha256: Option<String>,
    pub notes: Option<String>,
    pub created_at: String,
}

impl OperationChangeRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let action: String = row.get(4)?;
        Ok(Self {
            id: row.get(0)?,
            operation_id: row.get(1)?,
            target_id: row.get(2)?,
            relpath: row.get(3)?,
            action: ChangeAction::from_str(&action).map_err(|_| {
                rusqlite::Error::InvalidColumnType(4, "action".into(), rusqlite::types::Type::Text)
            })?,
            old_content_sha256: row.get(5)?,
            new_content_sha256: row.get(6)?,
            old_size_bytes: row.get(7)?,
            new_size_bytes: row.get(8)?,
            mod_file_version_id: row.get(9)?,
            backup_sha256: row.get(10)?,
            notes: row.get(11)?,
            created_at: row.get(12)?,
        })
    }
}
