//! SQLite metadata store.
//!
//! The catalog behind every other component: stores, game installs,
//! targets, blobs, mod pages/files/versions, profiles and their items,
//! remap rules, overrides, installed files, backups, and the operation
//! journal. Multi-row mutations run in a single transaction and the
//! cross-entity invariants are enforced here, at the commit boundary.

mod schema;

pub use schema::*;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::blobstore::BlobKind;
use crate::errors::{Error, Result};
use crate::remap::RemapRule;

/// Bumped when the schema changes shape; bundles carry it so an import
/// can refuse state written by a newer modctl.
pub const SCHEMA_VERSION: i64 = 1;

/// ISO-8601 with millisecond precision, UTC, zulu-suffixed. Matches the
/// SQLite `%Y-%m-%dT%H:%M:%fZ` format.
pub fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// New installed-file row content for the terminal apply commit.
#[derive(Debug, Clone)]
pub struct InstalledFileUpsert {
    pub target_id: i64,
    pub relpath: String,
    pub content_sha256: String,
    pub size_bytes: i64,
    pub mod_file_version_id: Option<i64>,
    pub override_id: Option<i64>,
    pub profile_id: i64,
}

/// Journal entry content; id and timestamp are assigned on insert.
#[derive(Debug, Clone)]
pub struct NewOperationChange {
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
}

/// Everything `record_import` needs to attach one ingested archive.
#[derive(Debug, Clone, Default)]
pub struct ImportRecord {
    pub game_install_id: i64,
    pub sha256: String,
    pub size_bytes: i64,
    pub original_basename: String,
    /// Attach to this existing page instead of matching or creating one.
    pub page_id: Option<i64>,
    pub mod_name: Option<String>,
    pub file_label: Option<String>,
    pub nexus_url: Option<String>,
    pub nexus_game_domain: Option<String>,
    pub nexus_mod_id: Option<i64>,
    /// Version metadata JSON (wrap provenance and the like).
    pub version_metadata: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportIds {
    pub page_id: i64,
    pub file_id: i64,
    pub version_id: i64,
}

/// Fields for registering or refreshing a game install row.
#[derive(Debug, Clone)]
pub struct UpsertGameInstall {
    pub store_id: String,
    pub store_game_id: String,
    pub instance_id: String,
    pub display_name: String,
    pub install_root: String,
    pub last_seen_at: Option<String>,
}

/// Database wrapper with thread-safe access
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory database for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // journal_mode reports the resulting mode (in-memory databases
        // answer "memory"), so it has to be read as a query.
        let _mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        db.seed_defaults()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            -- Game sources (steam, gog, ...)
            CREATE TABLE IF NOT EXISTS stores (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                implementation TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                config_json TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Concrete installations, unique per (store, game, instance)
            CREATE TABLE IF NOT EXISTS game_installs (
                id INTEGER PRIMARY KEY,
                store_id TEXT NOT NULL REFERENCES stores(id),
                store_game_id TEXT NOT NULL,
                instance_id TEXT NOT NULL DEFAULT 'default',
                display_name TEXT NOT NULL,
                install_root TEXT NOT NULL,
                is_present INTEGER NOT NULL DEFAULT 1,
                last_seen_at TEXT,
                applied_profile_id INTEGER REFERENCES profiles(id) ON DELETE SET NULL,
                applied_operation_id INTEGER REFERENCES operations(id) ON DELETE SET NULL,
                applied_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(store_id, store_game_id, instance_id)
            );

            -- Named install roots within a game install (v1: game_dir)
            CREATE TABLE IF NOT EXISTS targets (
                id INTEGER PRIMARY KEY,
                game_install_id INTEGER NOT NULL REFERENCES game_installs(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                root_path TEXT NOT NULL,
                origin TEXT NOT NULL DEFAULT 'discovered'
                    CHECK (origin IN ('discovered', 'user_override')),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(game_install_id, name)
            );

            -- Content-addressed blob metadata; one kind per hash, forever
            CREATE TABLE IF NOT EXISTS blobs (
                sha256 TEXT PRIMARY KEY CHECK (length(sha256) = 64),
                kind TEXT NOT NULL CHECK (kind IN ('archive', 'backup', 'override')),
                size_bytes INTEGER NOT NULL,
                original_name TEXT,
                verified_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Logical mods scoped to a game install
            CREATE TABLE IF NOT EXISTS mod_pages (
                id INTEGER PRIMARY KEY,
                game_install_id INTEGER NOT NULL REFERENCES game_installs(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                source_kind TEXT NOT NULL DEFAULT 'local'
                    CHECK (source_kind IN ('nexus', 'url', 'local', 'manual', 'other')),
                source_url TEXT,
                nexus_game_domain TEXT,
                nexus_mod_id INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_mod_pages_nexus
                ON mod_pages(game_install_id, nexus_game_domain, nexus_mod_id)
                WHERE nexus_game_domain IS NOT NULL AND nexus_mod_id IS NOT NULL;

            -- Labeled variants under a page; at most one primary per page
            CREATE TABLE IF NOT EXISTS mod_files (
                id INTEGER PRIMARY KEY,
                mod_page_id INTEGER NOT NULL REFERENCES mod_pages(id) ON DELETE CASCADE,
                label TEXT NOT NULL,
                is_primary INTEGER NOT NULL DEFAULT 0,
                nexus_file_id INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(mod_page_id, label)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_mod_files_primary
                ON mod_files(mod_page_id) WHERE is_primary = 1;

            -- Specific archive blobs for a mod file
            CREATE TABLE IF NOT EXISTS mod_file_versions (
                id INTEGER PRIMARY KEY,
                mod_file_id INTEGER NOT NULL REFERENCES mod_files(id) ON DELETE CASCADE,
                archive_sha256 TEXT NOT NULL REFERENCES blobs(sha256),
                original_name TEXT,
                version_string TEXT,
                metadata TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(mod_file_id, archive_sha256)
            );

            -- Named mod sets; at most one active per install
            CREATE TABLE IF NOT EXISTS profiles (
                id INTEGER PRIMARY KEY,
                game_install_id INTEGER NOT NULL REFERENCES game_installs(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(game_install_id, name)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_profiles_active
                ON profiles(game_install_id) WHERE is_active = 1;

            -- Pinned versions in a profile
            CREATE TABLE IF NOT EXISTS profile_items (
                id INTEGER PRIMARY KEY,
                profile_id INTEGER NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
                mod_file_version_id INTEGER NOT NULL
                    REFERENCES mod_file_versions(id) ON DELETE CASCADE,
                enabled INTEGER NOT NULL DEFAULT 1,
                priority INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(profile_id, mod_file_version_id)
            );

            -- Ordered remap transforms per profile item; union parameter
            -- shape, discriminated by rule_type
            CREATE TABLE IF NOT EXISTS remap_rules (
                id INTEGER PRIMARY KEY,
                profile_item_id INTEGER NOT NULL
                    REFERENCES profile_items(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                rule_type TEXT NOT NULL CHECK (rule_type IN (
                    'strip_components', 'select_subdir', 'dest_prefix',
                    'include_glob', 'exclude_glob')),
                int_value INTEGER,
                text_value TEXT,
                UNIQUE(profile_item_id, position)
            );

            -- User-provided final content for a path in a profile
            CREATE TABLE IF NOT EXISTS overrides (
                id INTEGER PRIMARY KEY,
                profile_id INTEGER NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
                target_id INTEGER NOT NULL REFERENCES targets(id) ON DELETE CASCADE,
                relpath TEXT NOT NULL,
                blob_sha256 TEXT NOT NULL REFERENCES blobs(sha256),
                kind TEXT NOT NULL DEFAULT 'full_file' CHECK (kind = 'full_file'),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(profile_id, target_id, relpath)
            );

            -- What the tool wrote, keyed by (install, target, relpath);
            -- exactly one owner
            CREATE TABLE IF NOT EXISTS installed_files (
                id INTEGER PRIMARY KEY,
                game_install_id INTEGER NOT NULL
                    REFERENCES game_installs(id) ON DELETE CASCADE,
                target_id INTEGER NOT NULL REFERENCES targets(id),
                relpath TEXT NOT NULL,
                content_sha256 TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                mod_file_version_id INTEGER REFERENCES mod_file_versions(id),
                override_id INTEGER REFERENCES overrides(id),
                profile_id INTEGER NOT NULL REFERENCES profiles(id),
                last_operation_id INTEGER REFERENCES operations(id),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(game_install_id, target_id, relpath),
                CHECK ((mod_file_version_id IS NULL) <> (override_id IS NULL))
            );

            -- Captured pre-existing content, one row per path
            CREATE TABLE IF NOT EXISTS backups (
                id INTEGER PRIMARY KEY,
                game_install_id INTEGER NOT NULL
                    REFERENCES game_installs(id) ON DELETE CASCADE,
                target_id INTEGER NOT NULL REFERENCES targets(id),
                relpath TEXT NOT NULL,
                blob_sha256 TEXT NOT NULL REFERENCES blobs(sha256),
                original_content_sha256 TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(game_install_id, target_id, relpath)
            );

            -- Apply/unapply runs; linear running -> success | failed
            CREATE TABLE IF NOT EXISTS operations (
                id INTEGER PRIMARY KEY,
                game_install_id INTEGER NOT NULL
                    REFERENCES game_installs(id) ON DELETE CASCADE,
                profile_id INTEGER REFERENCES profiles(id) ON DELETE SET NULL,
                kind TEXT NOT NULL CHECK (kind IN ('apply', 'unapply')),
                status TEXT NOT NULL DEFAULT 'running'
                    CHECK (status IN ('running', 'success', 'failed')),
                message TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Append-only per-path journal
            CREATE TABLE IF NOT EXISTS operation_changes (
                id INTEGER PRIMARY KEY,
                operation_id INTEGER NOT NULL
                    REFERENCES operations(id) ON DELETE CASCADE,
                target_id INTEGER NOT NULL REFERENCES targets(id),
                relpath TEXT NOT NULL,
                action TEXT NOT NULL CHECK (action IN (
                    'write', 'overwrite', 'remove', 'restore_backup', 'noop')),
                old_content_sha256 TEXT,
                new_content_sha256 TEXT,
                old_size_bytes INTEGER,
                new_size_bytes INTEGER,
                mod_file_version_id INTEGER REFERENCES mod_file_versions(id),
                backup_sha256 TEXT REFERENCES blobs(sha256),
                notes TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_installs_store ON game_installs(store_id);
            CREATE INDEX IF NOT EXISTS idx_targets_install ON targets(game_install_id);
            CREATE INDEX IF NOT EXISTS idx_blobs_kind ON blobs(kind);
            CREATE INDEX IF NOT EXISTS idx_pages_install ON mod_pages(game_install_id);
            CREATE INDEX IF NOT EXISTS idx_versions_file ON mod_file_versions(mod_file_id);
            CREATE INDEX IF NOT EXISTS idx_items_profile ON profile_items(profile_id);
            CREATE INDEX IF NOT EXISTS idx_installed_install
                ON installed_files(game_install_id);
            CREATE INDEX IF NOT EXISTS idx_backups_install ON backups(game_install_id);
            CREATE INDEX IF NOT EXISTS idx_operations_install
                ON operations(game_install_id, status);
            CREATE INDEX IF NOT EXISTS idx_changes_operation
                ON operation_changes(operation_id);
            "#,
        )?;
        Ok(())
    }

    /// Seed the store registry; discovery handlers key off `implementation`.
    fn seed_defaults(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = now_iso();
        conn.execute(
            "INSERT OR IGNORE INTO stores (id, display_name, implementation, enabled,
                                           created_at, updated_at)
             VALUES ('steam', 'Steam', 'steam', 1, ?1, ?1)",
            params![now],
        )?;
        Ok(())
    }

    /// Startup recovery: any operation still `running` belongs to a
    /// crashed or killed process and is finalized to `failed`.
    pub fn recover_stale_operations(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let now = now_iso();
        let n = conn.execute(
            "UPDATE operations
             SET status = 'failed',
                 message = COALESCE(message || '; ', '') || 'marked failed on startup recovery',
                 finished_at = ?1, updated_at = ?1
             WHERE status = 'running'",
            params![now],
        )?;
        if n > 0 {
            tracing::warn!("marked {n} stale running operation(s) failed");
        }
        Ok(n)
    }

    /// `PRAGMA quick_check` (or `integrity_check` when deep); returns the
    /// reported problems, empty when healthy.
    pub fn integrity_problems(&self, deep: bool) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let pragma = if deep {
            "PRAGMA integrity_check"
        } else {
            "PRAGMA quick_check"
        };
        let mut stmt = conn.prepare(pragma)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().filter(|r| r != "ok").collect())
    }

    /// `PRAGMA foreign_key_check`; returns one line per violation.
    pub fn foreign_key_violations(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(format!(
                    "table={} rowid={} parent={} fkid={}",
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Flush the WAL into the main database file so the file on disk is
    /// self-contained (bundle export reads it directly).
    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }

    // ========== Stores ==========

    pub fn list_stores(&self) -> Result<Vec<StoreRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, display_name, implementation, enabled, config_json,
                    created_at, updated_at
             FROM stores ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], StoreRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_store(&self, id: &str) -> Result<Option<StoreRecord>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT id, display_name, implementation, enabled, config_json,
                        created_at, updated_at
                 FROM stores WHERE id = ?1",
                params![id],
                StoreRecord::from_row,
            )
            .optional()?)
    }

    // ========== Game installs ==========

    pub fn upsert_game_install(&self, up: &UpsertGameInstall) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let now = now_iso();
        conn.execute(
            "INSERT INTO game_installs (store_id, store_game_id, instance_id, display_name,
                                        install_root, is_present, last_seen_at,
                                        created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?7)
             ON CONFLICT(store_id, store_game_id, instance_id) DO UPDATE SET
                 display_name = excluded.display_name,
                 install_root = excluded.install_root,
                 is_present = 1,
                 last_seen_at = excluded.last_seen_at,
                 updated_at = excluded.updated_at",
            params![
                up.store_id,
                up.store_game_id,
                up.instance_id,
                up.display_name,
                up.install_root,
                up.last_seen_at,
                now,
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM game_installs
             WHERE store_id = ?1 AND store_game_id = ?2 AND instance_id = ?3",
            params![up.store_id, up.store_game_id, up.instance_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_game_install(&self, id: i64) -> Result<Option<GameInstallRecord>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("{GAME_INSTALL_COLS} WHERE id = ?1"),
                params![id],
                GameInstallRecord::from_row,
            )
            .optional()?)
    }

    pub fn find_game_install(
        &self,
        store_id: &str,
        store_game_id: &str,
        instance_id: &str,
    ) -> Result<Option<GameInstallRecord>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!(
                    "{GAME_INSTALL_COLS}
                     WHERE store_id = ?1 AND store_game_id = ?2 AND instance_id = ?3"
                ),
                params![store_id, store_game_id, instance_id],
                GameInstallRecord::from_row,
            )
            .optional()?)
    }

    pub fn list_game_installs(&self) -> Result<Vec<GameInstallRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{GAME_INSTALL_COLS} ORDER BY store_id, store_game_id, instance_id"
        ))?;
        let rows = stmt
            .query_map([], GameInstallRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_installs_for_game(
        &self,
        store_id: &str,
        store_game_id: &str,
    ) -> Result<Vec<GameInstallRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{GAME_INSTALL_COLS}
             WHERE store_id = ?1 AND store_game_id = ?2
             ORDER BY instance_id"
        ))?;
        let rows = stmt
            .query_map(params![store_id, store_game_id], GameInstallRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========== Targets ==========

    /// Upsert a target discovered by a store handler. A target the user
    /// pinned manually (`user_override`) is never overwritten.
    pub fn upsert_discovered_target(
        &self,
        game_install_id: i64,
        name: &str,
        root_path: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = now_iso();
        let existing: Option<String> = conn
            .query_row(
                "SELECT origin FROM targets WHERE game_install_id = ?1 AND name = ?2",
                params![game_install_id, name],
                |row| row.get(0),
            )
            .optional()?;
        if existing.as_deref() == Some("user_override") {
            return Ok(());
        }
        conn.execute(
            "INSERT INTO targets (game_install_id, name, root_path, origin,
                                  created_at, updated_at)
             VALUES (?1, ?2, ?3, 'discovered', ?4, ?4)
             ON CONFLICT(game_install_id, name) DO UPDATE SET
                 root_path = excluded.root_path,
                 updated_at = excluded.updated_at",
            params![game_install_id, name, root_path, now],
        )?;
        Ok(())
    }

    /// Pin a target manually; discovery will leave it alone afterwards.
    pub fn set_target_override(
        &self,
        game_install_id: i64,
        name: &str,
        root_path: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = now_iso();
        conn.execute(
            "INSERT INTO targets (game_install_id, name, root_path, origin,
                                  created_at, updated_at)
             VALUES (?1, ?2, ?3, 'user_override', ?4, ?4)
             ON CONFLICT(game_install_id, name) DO UPDATE SET
                 root_path = excluded.root_path,
                 origin = 'user_override',
                 updated_at = excluded.updated_at",
            params![game_install_id, name, root_path, now],
        )?;
        Ok(())
    }

    pub fn get_target(&self, id: i64) -> Result<Option<TargetRecord>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("{TARGET_COLS} WHERE id = ?1"),
                params![id],
                TargetRecord::from_row,
            )
            .optional()?)
    }

    pub fn get_target_by_name(
        &self,
        game_install_id: i64,
        name: &str,
    ) -> Result<Option<TargetRecord>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("{TARGET_COLS} WHERE game_install_id = ?1 AND name = ?2"),
                params![game_install_id, name],
                TargetRecord::from_row,
            )
            .optional()?)
    }

    pub fn list_targets(&self, game_install_id: i64) -> Result<Vec<TargetRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{TARGET_COLS} WHERE game_install_id = ?1 ORDER BY name"
        ))?;
        let rows = stmt
            .query_map(params![game_install_id], TargetRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========== Blobs ==========

    /// Ensure the blobs table has a row for this hash. An existing row
    /// must match both kind and size; a mismatch is never a harmless dupe.
    /// `verified_at` is set on insert only; afterwards it belongs to the
    /// doctor rehash pass.
    pub fn ensure_blob_recorded(
        &self,
        sha256: &str,
        kind: BlobKind,
        size_bytes: i64,
        original_name: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        ensure_blob_recorded_conn(&conn, sha256, kind, size_bytes, original_name)
    }

    pub fn get_blob(&self, sha256: &str) -> Result<Option<BlobRecord>> {
        let conn = self.conn.lock().unwrap();
        get_blob_conn(&conn, sha256)
    }

    pub fn list_blobs_by_kind(&self, kind: BlobKind) -> Result<Vec<BlobRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{BLOB_COLS} WHERE kind = ?1 ORDER BY sha256"))?;
        let rows = stmt
            .query_map(params![kind.as_str()], BlobRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Only a successful rehash updates `verified_at`.
    pub fn touch_blob_verified_at(&self, sha256: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = now_iso();
        conn.execute(
            "UPDATE blobs SET verified_at = ?1, updated_at = ?1 WHERE sha256 = ?2",
            params![now, sha256],
        )?;
        Ok(())
    }

    // ========== Mod pages / files / versions ==========

    #[allow(clippy::too_many_arguments)]
    pub fn create_mod_page(
        &self,
        game_install_id: i64,
        name: &str,
        source_kind: &str,
        source_url: Option<&str>,
        nexus_game_domain: Option<&str>,
        nexus_mod_id: Option<i64>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let now = now_iso();
        conn.execute(
            "INSERT INTO mod_pages (game_install_id, name, source_kind, source_url,
                                    nexus_game_domain, nexus_mod_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                game_install_id,
                name,
                source_kind,
                source_url,
                nexus_game_domain,
                nexus_mod_id,
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Page lookup scoped to the install, so a page id from another game
    /// cannot be attached to.
    pub fn get_mod_page_for_install(
        &self,
        id: i64,
        game_install_id: i64,
    ) -> Result<Option<ModPageRecord>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("{MOD_PAGE_COLS} WHERE id = ?1 AND game_install_id = ?2"),
                params![id, game_install_id],
                ModPageRecord::from_row,
            )
            .optional()?)
    }

    pub fn find_mod_page_by_nexus(
        &self,
        game_install_id: i64,
        game_domain: &str,
        mod_id: i64,
    ) -> Result<Option<ModPageRecord>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!(
                    "{MOD_PAGE_COLS}
                     WHERE game_install_id = ?1 AND nexus_game_domain = ?2 AND nexus_mod_id = ?3"
                ),
                params![game_install_id, game_domain, mod_id],
                ModPageRecord::from_row,
            )
            .optional()?)
    }

    pub fn list_mod_pages(&self, game_install_id: i64) -> Result<Vec<ModPageRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{MOD_PAGE_COLS} WHERE game_install_id = ?1 ORDER BY name"
        ))?;
        let rows = stmt
            .query_map(params![game_install_id], ModPageRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_mod_file_by_label(
        &self,
        mod_page_id: i64,
        label: &str,
    ) -> Result<Option<ModFileRecord>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("{MOD_FILE_COLS} WHERE mod_page_id = ?1 AND label = ?2"),
                params![mod_page_id, label],
                ModFileRecord::from_row,
            )
            .optional()?)
    }

    pub fn count_mod_files(&self, mod_page_id: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM mod_files WHERE mod_page_id = ?1",
            params![mod_page_id],
            |row| row.get(0),
        )?)
    }

    pub fn create_mod_file(
        &self,
        mod_page_id: i64,
        label: &str,
        is_primary: bool,
        nexus_file_id: Option<i64>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let now = now_iso();
        conn.execute(
            "INSERT INTO mod_files (mod_page_id, label, is_primary, nexus_file_id,
                                    created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![mod_page_id, label, is_primary as i64, nexus_file_id, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_mod_files(&self, mod_page_id: i64) -> Result<Vec<ModFileRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{MOD_FILE_COLS} WHERE mod_page_id = ?1 ORDER BY label"
        ))?;
        let rows = stmt
            .query_map(params![mod_page_id], ModFileRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Attach an archive blob to a mod file. The blob must already be
    /// recorded with kind `archive`; attaching the same blob to the same
    /// file twice is a duplicate-version error.
    pub fn create_mod_file_version(
        &self,
        mod_file_id: i64,
        archive_sha256: &str,
        original_name: Option<&str>,
        metadata: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        require_blob_kind(&conn, archive_sha256, BlobKind::Archive)?;

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM mod_file_versions
                           WHERE mod_file_id = ?1 AND archive_sha256 = ?2)",
            params![mod_file_id, archive_sha256],
            |row| row.get(0),
        )?;
        if exists {
            return Err(Error::validation(format!(
                "duplicate version: blob {archive_sha256} is already attached to mod file {mod_file_id}"
            )));
        }

        let now = now_iso();
        conn.execute(
            "INSERT INTO mod_file_versions (mod_file_id, archive_sha256, original_name,
                                            metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![mod_file_id, archive_sha256, original_name, metadata, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_mod_file_version(&self, id: i64) -> Result<Option<ModFileVersionRecord>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("{MOD_FILE_VERSION_COLS} WHERE id = ?1"),
                params![id],
                ModFileVersionRecord::from_row,
            )
            .optional()?)
    }

    pub fn list_mod_file_versions(&self, mod_file_id: i64) -> Result<Vec<ModFileVersionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{MOD_FILE_VERSION_COLS} WHERE mod_file_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![mod_file_id], ModFileVersionRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Record one imported archive: blob row, mod page (attached, matched
    /// by Nexus identity, or created), mod file by label (primary iff
    /// first on the page), and the version row. One transaction; the
    /// filesystem ingest happened before this and stays valid even if the
    /// transaction rolls back.
    pub fn record_import(&self, rec: &ImportRecord) -> Result<ImportIds> {
        let conn = self.conn.lock().unwrap();
        let now = now_iso();
        let tx = conn.unchecked_transaction()?;

        ensure_blob_recorded_conn(
            &tx,
            &rec.sha256,
            BlobKind::Archive,
            rec.size_bytes,
            Some(&rec.original_basename),
        )?;

        let page_id = match rec.page_id {
            Some(page_id) => {
                let found: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM mod_pages WHERE id = ?1 AND game_install_id = ?2",
                        params![page_id, rec.game_install_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                found.ok_or_else(|| {
                    Error::not_found(format!("mod page {page_id} not found for this game"))
                })?
            }
            None => {
                let by_nexus = match (&rec.nexus_game_domain, rec.nexus_mod_id) {
                    (Some(domain), Some(mod_id)) => tx
                        .query_row(
                            "SELECT id FROM mod_pages
                             WHERE game_install_id = ?1 AND nexus_game_domain = ?2
                               AND nexus_mod_id = ?3",
                            params![rec.game_install_id, domain, mod_id],
                            |row| row.get(0),
                        )
                        .optional()?,
                    _ => None,
                };
                match by_nexus {
                    Some(id) => id,
                    None => {
                        let name = rec
                            .mod_name
                            .clone()
                            .filter(|n| !n.is_empty())
                            .unwrap_or_else(|| rec.original_basename.clone());
                        let source_kind =
                            if rec.nexus_game_domain.is_some() && rec.nexus_mod_id.is_some() {
                                "nexus"
                            } else {
                                "local"
                            };
                        tx.execute(
                            "INSERT INTO mod_pages (game_install_id, name, source_kind,
                                                    source_url, nexus_game_domain, nexus_mod_id,
                                                    created_at, updated_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                            params![
                                rec.game_install_id,
                                name,
                                source_kind,
                                rec.nexus_url,
                                rec.nexus_game_domain,
                                rec.nexus_mod_id,
                                now
                            ],
                        )?;
                        tx.last_insert_rowid()
                    }
                }
            }
        };

        let label = rec
            .file_label
            .clone()
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| "Main File".to_string());
        let file_id: i64 = match tx
            .query_row(
                "SELECT id FROM mod_files WHERE mod_page_id = ?1 AND label = ?2",
                params![page_id, label],
                |row| row.get(0),
            )
            .optional()?
        {
            Some(id) => id,
            None => {
                let count: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM mod_files WHERE mod_page_id = ?1",
                    params![page_id],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "INSERT INTO mod_files (mod_page_id, label, is_primary, created_at,
                                            updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    params![page_id, label, (count == 0) as i64, now],
                )?;
                tx.last_insert_rowid()
            }
        };

        let dup: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM mod_file_versions
                           WHERE mod_file_id = ?1 AND archive_sha256 = ?2)",
            params![file_id, rec.sha256],
            |row| row.get(0),
        )?;
        if dup {
            return Err(Error::validation(format!(
                "duplicate version: blob {} is already attached to mod file {file_id}",
                rec.sha256
            )));
        }
        tx.execute(
            "INSERT INTO mod_file_versions (mod_file_id, archive_sha256, original_name,
                                            metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                file_id,
                rec.sha256,
                rec.original_basename,
                rec.version_metadata,
                now
            ],
        )?;
        let version_id = tx.last_insert_rowid();

        tx.commit()?;
        Ok(ImportIds {
            page_id,
            file_id,
            version_id,
        })
    }

    // ========== Profiles ==========

    pub fn create_profile(&self, game_install_id: i64, name: &str) -> Result<ProfileRecord> {
        let conn = self.conn.lock().unwrap();
        let now = now_iso();
        conn.execute(
            "INSERT INTO profiles (game_install_id, name, is_active, created_at, updated_at)
             VALUES (?1, ?2, 0, ?3, ?3)",
            params![game_install_id, name, now],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::validation(format!("profile {name:?} already exists for this game"))
            }
            other => other.into(),
        })?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_profile(id)?
            .ok_or_else(|| Error::not_found(format!("profile {id}")))
    }

    /// Every install gets a `default` profile; the first profile for an
    /// install becomes active.
    pub fn ensure_default_profile(&self, game_install_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = now_iso();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM profiles WHERE game_install_id = ?1",
            params![game_install_id],
            |row| row.get(0),
        )?;
        if count == 0 {
            conn.execute(
                "INSERT INTO profiles (game_install_id, name, is_active, created_at, updated_at)
                 VALUES (?1, 'default', 1, ?2, ?2)",
                params![game_install_id, now],
            )?;
        }
        Ok(())
    }

    pub fn get_profile(&self, id: i64) -> Result<Option<ProfileRecord>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("{PROFILE_COLS} WHERE id = ?1"),
                params![id],
                ProfileRecord::from_row,
            )
            .optional()?)
    }

    pub fn get_profile_by_name(
        &self,
        game_install_id: i64,
        name: &str,
    ) -> Result<Option<ProfileRecord>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("{PROFILE_COLS} WHERE game_install_id = ?1 AND name = ?2"),
                params![game_install_id, name],
                ProfileRecord::from_row,
            )
            .optional()?)
    }

    pub fn get_active_profile(&self, game_install_id: i64) -> Result<Option<ProfileRecord>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("{PROFILE_COLS} WHERE game_install_id = ?1 AND is_active = 1"),
                params![game_install_id],
                ProfileRecord::from_row,
            )
            .optional()?)
    }

    pub fn list_profiles(&self, game_install_id: i64) -> Result<Vec<ProfileRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{PROFILE_COLS} WHERE game_install_id = ?1 ORDER BY name"
        ))?;
        let rows = stmt
            .query_map(params![game_install_id], ProfileRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn rename_profile(&self, id: i64, new_name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = now_iso();
        let n = conn.execute(
            "UPDATE profiles SET name = ?1, updated_at = ?2 WHERE id = ?3",
            params![new_name, now, id],
        )?;
        if n == 0 {
            return Err(Error::not_found(format!("profile {id}")));
        }
        Ok(())
    }

    pub fn delete_profile(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM profiles WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(Error::not_found(format!("profile {id}")));
        }
        Ok(())
    }

    /// Make one profile active, deactivating any other profile of the
    /// same install in the same transaction.
    pub fn set_active_profile(&self, game_install_id: i64, profile_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        profile_in_install(&conn, profile_id, game_install_id)?;
        let now = now_iso();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE profiles SET is_active = 0, updated_at = ?1
             WHERE game_install_id = ?2 AND is_active = 1",
            params![now, game_install_id],
        )?;
        tx.execute(
            "UPDATE profiles SET is_active = 1, updated_at = ?1 WHERE id = ?2",
            params![now, profile_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ========== Profile items ==========

    /// Pin a version into a profile. Duplicate versions and duplicate
    /// priorities are both rejected before anything is written.
    pub fn add_profile_item(
        &self,
        profile_id: i64,
        mod_file_version_id: i64,
        priority: i64,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();

        let dup_version: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM profile_items
                           WHERE profile_id = ?1 AND mod_file_version_id = ?2)",
            params![profile_id, mod_file_version_id],
            |row| row.get(0),
        )?;
        if dup_version {
            return Err(Error::validation(format!(
                "version {mod_file_version_id} is already in this profile"
            )));
        }
        assert_priority_free(&conn, profile_id, priority, None)?;

        let now = now_iso();
        conn.execute(
            "INSERT INTO profile_items (profile_id, mod_file_version_id, enabled, priority,
                                        created_at, updated_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?4)",
            params![profile_id, mod_file_version_id, priority, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_profile_item(
        &self,
        profile_id: i64,
        mod_file_version_id: i64,
    ) -> Result<Option<ProfileItemRecord>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("{PROFILE_ITEM_COLS} WHERE profile_id = ?1 AND mod_file_version_id = ?2"),
                params![profile_id, mod_file_version_id],
                ProfileItemRecord::from_row,
            )
            .optional()?)
    }

    pub fn list_profile_items(&self, profile_id: i64) -> Result<Vec<ProfileItemRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{PROFILE_ITEM_COLS} WHERE profile_id = ?1 ORDER BY priority DESC, id"
        ))?;
        let rows = stmt
            .query_map(params![profile_id], ProfileItemRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Enabled items in deterministic plan order: ascending item id.
    pub fn list_enabled_profile_items(&self, profile_id: i64) -> Result<Vec<ProfileItemRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{PROFILE_ITEM_COLS} WHERE profile_id = ?1 AND enabled = 1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![profile_id], ProfileItemRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn set_profile_item_enabled(&self, item_id: i64, enabled: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = now_iso();
        let n = conn.execute(
            "UPDATE profile_items SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
            params![enabled as i64, now, item_id],
        )?;
        if n == 0 {
            return Err(Error::not_found(format!("profile item {item_id}")));
        }
        Ok(())
    }

    pub fn set_profile_item_priority(&self, item_id: i64, priority: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let profile_id: i64 = conn
            .query_row(
                "SELECT profile_id FROM profile_items WHERE id = ?1",
                params![item_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::not_found(format!("profile item {item_id}")))?;
        assert_priority_free(&conn, profile_id, priority, Some(item_id))?;
        let now = now_iso();
        conn.execute(
            "UPDATE profile_items SET priority = ?1, updated_at = ?2 WHERE id = ?3",
            params![priority, now, item_id],
        )?;
        Ok(())
    }

    pub fn remove_profile_item(&self, item_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM profile_items WHERE id = ?1", params![item_id])?;
        if n == 0 {
            return Err(Error::not_found(format!("profile item {item_id}")));
        }
        Ok(())
    }

    // ========== Remap rules ==========

    /// Replace an item's rule list wholesale; positions are re-assigned
    /// densely from 0.
    pub fn replace_remap_rules(&self, profile_item_id: i64, rules: &[RemapRule]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM remap_rules WHERE profile_item_id = ?1",
            params![profile_item_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO remap_rules (profile_item_id, position, rule_type,
                                          int_value, text_value)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (position, rule) in rules.iter().enumerate() {
                let (rule_type, int_value, text_value) = rule.to_stored();
                stmt.execute(params![
                    profile_item_id,
                    position as i64,
                    rule_type,
                    int_value,
                    text_value
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Load an item's rules in position order, re-validating the stored
    /// union shape.
    pub fn list_remap_rules(&self, profile_item_id: i64) -> Result<Vec<RemapRule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT rule_type, int_value, text_value FROM remap_rules
             WHERE profile_item_id = ?1 ORDER BY position",
        )?;
        let stored = stmt
            .query_map(params![profile_item_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        stored
            .into_iter()
            .map(|(rule_type, int_value, text_value)| {
                RemapRule::from_stored(&rule_type, int_value, text_value.as_deref())
            })
            .collect()
    }

    // ========== Overrides ==========

    /// Record a full-file override. The target must belong to the same
    /// install as the profile, and the blob must be kind `override`.
    pub fn upsert_override(
        &self,
        profile_id: i64,
        target_id: i64,
        relpath: &str,
        blob_sha256: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let install_id = profile_install_id(&conn, profile_id)?;
        target_in_install(&conn, target_id, install_id)?;
        require_blob_kind(&conn, blob_sha256, BlobKind::Override)?;

        let now = now_iso();
        conn.execute(
            "INSERT INTO overrides (profile_id, target_id, relpath, blob_sha256, kind,
                                    created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'full_file', ?5, ?5)
             ON CONFLICT(profile_id, target_id, relpath) DO UPDATE SET
                 blob_sha256 = excluded.blob_sha256,
                 updated_at = excluded.updated_at",
            params![profile_id, target_id, relpath, blob_sha256, now],
        )?;
        let id = conn.query_row(
            "SELECT id FROM overrides
             WHERE profile_id = ?1 AND target_id = ?2 AND relpath = ?3",
            params![profile_id, target_id, relpath],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn remove_override(&self, profile_id: i64, target_id: i64, relpath: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM overrides
             WHERE profile_id = ?1 AND target_id = ?2 AND relpath = ?3",
            params![profile_id, target_id, relpath],
        )?;
        Ok(n > 0)
    }

    pub fn list_overrides(&self, profile_id: i64) -> Result<Vec<OverrideRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{OVERRIDE_COLS} WHERE profile_id = ?1 ORDER BY target_id, relpath"
        ))?;
        let rows = stmt
            .query_map(params![profile_id], OverrideRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_override(&self, id: i64) -> Result<Option<OverrideRecord>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("{OVERRIDE_COLS} WHERE id = ?1"),
                params![id],
                OverrideRecord::from_row,
            )
            .optional()?)
    }

    // ========== Installed files / backups ==========

    pub fn list_installed_files(&self, game_install_id: i64) -> Result<Vec<InstalledFileRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{INSTALLED_FILE_COLS} WHERE game_install_id = ?1 ORDER BY target_id, relpath"
        ))?;
        let rows = stmt
            .query_map(params![game_install_id], InstalledFileRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_installed_file(
        &self,
        game_install_id: i64,
        target_id: i64,
        relpath: &str,
    ) -> Result<Option<InstalledFileRecord>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!(
                    "{INSTALLED_FILE_COLS}
                     WHERE game_install_id = ?1 AND target_id = ?2 AND relpath = ?3"
                ),
                params![game_install_id, target_id, relpath],
                InstalledFileRecord::from_row,
            )
            .optional()?)
    }

    /// Record a captured backup unless one already exists for this path;
    /// the original wins. Returns whether a row was inserted.
    pub fn insert_backup_if_absent(
        &self,
        game_install_id: i64,
        target_id: i64,
        relpath: &str,
        blob_sha256: &str,
        original_content_sha256: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        target_in_install(&conn, target_id, game_install_id)?;
        require_blob_kind(&conn, blob_sha256, BlobKind::Backup)?;
        let now = now_iso();
        let n = conn.execute(
            "INSERT OR IGNORE INTO backups (game_install_id, target_id, relpath, blob_sha256,
                                            original_content_sha256, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                game_install_id,
                target_id,
                relpath,
                blob_sha256,
                original_content_sha256,
                now
            ],
        )?;
        Ok(n > 0)
    }

    pub fn get_backup(
        &self,
        game_install_id: i64,
        target_id: i64,
        relpath: &str,
    ) -> Result<Option<BackupRecord>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!(
                    "{BACKUP_COLS}
                     WHERE game_install_id = ?1 AND target_id = ?2 AND relpath = ?3"
                ),
                params![game_install_id, target_id, relpath],
                BackupRecord::from_row,
            )
            .optional()?)
    }

    pub fn list_backups(&self, game_install_id: i64) -> Result<Vec<BackupRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{BACKUP_COLS} WHERE game_install_id = ?1 ORDER BY target_id, relpath"
        ))?;
        let rows = stmt
            .query_map(params![game_install_id], BackupRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========== Operations / journal ==========

    /// Open an operation. Refuses while another operation for the same
    /// install is still `running` (recovery must run first).
    pub fn create_operation(
        &self,
        game_install_id: i64,
        profile_id: Option<i64>,
        kind: OperationKind,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        if let Some(profile_id) = profile_id {
            profile_in_install(&conn, profile_id, game_install_id)?;
        }
        let running: Option<i64> = conn
            .query_row(
                "SELECT id FROM operations
                 WHERE game_install_id = ?1 AND status = 'running'",
                params![game_install_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(op) = running {
            return Err(Error::invariant(format!(
                "operation {op} is still running for this install; startup recovery did not run"
            )));
        }

        let now = now_iso();
        conn.execute(
            "INSERT INTO operations (game_install_id, profile_id, kind, status,
                                     started_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'running', ?4, ?4, ?4)",
            params![game_install_id, profile_id, kind.as_str(), now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Close an operation. The state machine is linear: only a `running`
    /// operation can be finalized.
    pub fn finalize_operation(
        &self,
        operation_id: i64,
        status: OperationStatus,
        message: Option<&str>,
    ) -> Result<()> {
        if status == OperationStatus::Running {
            return Err(Error::invariant(
                "cannot finalize an operation back to running".to_string(),
            ));
        }
        let conn = self.conn.lock().unwrap();
        let now = now_iso();
        let n = conn.execute(
            "UPDATE operations
             SET status = ?1, message = ?2, finished_at = ?3, updated_at = ?3
             WHERE id = ?4 AND status = 'running'",
            params![status.as_str(), message, now, operation_id],
        )?;
        if n == 0 {
            return Err(Error::invariant(format!(
                "operation {operation_id} is not running"
            )));
        }
        Ok(())
    }

    pub fn get_operation(&self, id: i64) -> Result<Option<OperationRecord>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("{OPERATION_COLS} WHERE id = ?1"),
                params![id],
                OperationRecord::from_row,
            )
            .optional()?)
    }

    pub fn insert_operation_change(&self, change: &NewOperationChange) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let install_id: i64 = conn.query_row(
            "SELECT game_install_id FROM operations WHERE id = ?1",
            params![change.operation_id],
            |row| row.get(0),
        )?;
        target_in_install(&conn, change.target_id, install_id)?;

        let now = now_iso();
        conn.execute(
            "INSERT INTO operation_changes (operation_id, target_id, relpath, action,
                                            old_content_sha256, new_content_sha256,
                                            old_size_bytes, new_size_bytes,
                                            mod_file_version_id, backup_sha256, notes,
                                            created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                change.operation_id,
                change.target_id,
                change.relpath,
                change.action.as_str(),
                change.old_content_sha256,
                change.new_content_sha256,
                change.old_size_bytes,
                change.new_size_bytes,
                change.mod_file_version_id,
                change.backup_sha256,
                change.notes,
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_operation_changes(&self, operation_id: i64) -> Result<Vec<OperationChangeRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{OPERATION_CHANGE_COLS} WHERE operation_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![operation_id], OperationChangeRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Terminal commit of a successful apply/unapply: installed-file row
    /// updates, the install's applied pointers, and the operation status
    /// all land in one transaction.
    pub fn commit_operation_success(
        &self,
        operation_id: i64,
        game_install_id: i64,
        applied_profile_id: Option<i64>,
        upserts: &[InstalledFileUpsert],
        removals: &[(i64, String)],
        message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        if let Some(profile_id) = applied_profile_id {
            profile_in_install(&conn, profile_id, game_install_id)?;
        }
        for up in upserts {
            target_in_install(&conn, up.target_id, game_install_id)?;
            if up.mod_file_version_id.is_some() == up.override_id.is_some() {
                return Err(Error::invariant(format!(
                    "installed file {} must have exactly one owner",
                    up.relpath
                )));
            }
        }

        let now = now_iso();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO installed_files (game_install_id, target_id, relpath,
                                              content_sha256, size_bytes,
                                              mod_file_version_id, override_id,
                                              profile_id, last_operation_id,
                                              created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                 ON CONFLICT(game_install_id, target_id, relpath) DO UPDATE SET
                     content_sha256 = excluded.content_sha256,
                     size_bytes = excluded.size_bytes,
                     mod_file_version_id = excluded.mod_file_version_id,
                     override_id = excluded.override_id,
                     profile_id = excluded.profile_id,
                     last_operation_id = excluded.last_operation_id,
                     updated_at = excluded.updated_at",
            )?;
            for up in upserts {
                stmt.execute(params![
                    game_install_id,
                    up.target_id,
                    up.relpath,
                    up.content_sha256,
                    up.size_bytes,
                    up.mod_file_version_id,
                    up.override_id,
                    up.profile_id,
                    operation_id,
                    now
                ])?;
            }
        }
        {
            let mut stmt = tx.prepare(
                "DELETE FROM installed_files
                 WHERE game_install_id = ?1 AND target_id = ?2 AND relpath = ?3",
            )?;
            for (target_id, relpath) in removals {
                stmt.execute(params![game_install_id, target_id, relpath])?;
            }
        }
        tx.execute(
            "UPDATE game_installs
             SET applied_profile_id = ?1, applied_operation_id = ?2, applied_at = ?3,
                 updated_at = ?3
             WHERE id = ?4",
            params![applied_profile_id, operation_id, now, game_install_id],
        )?;
        let n = tx.execute(
            "UPDATE operations
             SET status = 'success', message = ?1, finished_at = ?2, updated_at = ?2
             WHERE id = ?3 AND status = 'running'",
            params![message, now, operation_id],
        )?;
        if n == 0 {
            return Err(Error::invariant(format!(
                "operation {operation_id} is not running"
            )));
        }
        tx.commit()?;
        Ok(())
    }
}

// Shared SELECT column lists keep the from_row index mapping in one place.
const GAME_INSTALL_COLS: &str = "SELECT id, store_id, store_game_id, instance_id, display_name,
        install_root, is_present, last_seen_at, applied_profile_id, applied_operation_id,
        applied_at, created_at, updated_at FROM game_installs";
const TARGET_COLS: &str = "SELECT id, game_install_id, name, root_path, origin,
        created_at, updated_at FROM targets";
const BLOB_COLS: &str = "SELECT sha256, kind, size_bytes, original_name, verified_at,
        created_at, updated_at FROM blobs";
const MOD_PAGE_COLS: &str = "SELECT id, game_install_id, name, source_kind, source_url,
        nexus_game_domain, nexus_mod_id, created_at, updated_at FROM mod_pages";
const MOD_FILE_COLS: &str = "SELECT id, mod_page_id, label, is_primary, nexus_file_id,
        created_at, updated_at FROM mod_files";
const MOD_FILE_VERSION_COLS: &str = "SELECT id, mod_file_id, archive_sha256, original_name,
        version_string, metadata, created_at, updated_at FROM mod_file_versions";
const PROFILE_COLS: &str = "SELECT id, game_install_id, name, is_active,
        created_at, updated_at FROM profiles";
const PROFILE_ITEM_COLS: &str = "SELECT id, profile_id, mod_file_version_id, enabled, priority,
        created_at, updated_at FROM profile_items";
const OVERRIDE_COLS: &str = "SELECT id, profile_id, target_id, relpath, blob_sha256, kind,
        created_at, updated_at FROM overrides";
const INSTALLED_FILE_COLS: &str = "SELECT id, game_install_id, target_id, relpath,
        content_sha256, size_bytes, mod_file_version_id, override_id, profile_id,
        last_operation_id, created_at, updated_at FROM installed_files";
const BACKUP_COLS: &str = "SELECT id, game_install_id, target_id, relpath, blob_sha256,
        original_content_sha256, created_at, updated_at FROM backups";
const OPERATION_COLS: &str = "SELECT id, game_install_id, profile_id, kind, status, message,
        started_at, finished_at, created_at, updated_at FROM operations";
const OPERATION_CHANGE_COLS: &str = "SELECT id, operation_id, target_id, relpath, action,
        old_content_sha256, new_content_sha256, old_size_bytes, new_size_bytes,
        mod_file_version_id, backup_sha256, notes, created_at FROM operation_changes";

fn ensure_blob_recorded_conn(
    conn: &Connection,
    sha256: &str,
    kind: BlobKind,
    size_bytes: i64,
    original_name: Option<&str>,
) -> Result<()> {
    let existing = get_blob_conn(conn, sha256)?;
    if let Some(existing) = existing {
        if existing.kind != kind.as_str() {
            return Err(Error::invariant(format!(
                "blob {sha256} exists with kind={}, expected kind={}",
                existing.kind,
                kind.as_str()
            )));
        }
        if existing.size_bytes != size_bytes {
            return Err(Error::invariant(format!(
                "blob {sha256} exists with size_bytes={}, expected size_bytes={size_bytes}",
                existing.size_bytes
            )));
        }
        return Ok(());
    }

    let now = now_iso();
    conn.execute(
        "INSERT INTO blobs (sha256, kind, size_bytes, original_name, verified_at,
                            created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![sha256, kind.as_str(), size_bytes, original_name, now, now],
    )?;
    Ok(())
}

fn get_blob_conn(conn: &Connection, sha256: &str) -> Result<Option<BlobRecord>> {
    Ok(conn
        .query_row(
            &format!("{BLOB_COLS} WHERE sha256 = ?1"),
            params![sha256],
            BlobRecord::from_row,
        )
        .optional()?)
}

/// Invariant: a referenced blob's kind must match the referencing column.
fn require_blob_kind(conn: &Connection, sha256: &str, kind: BlobKind) -> Result<()> {
    let blob = get_blob_conn(conn, sha256)?
        .ok_or_else(|| Error::not_found(format!("blob {sha256}")))?;
    if blob.kind != kind.as_str() {
        return Err(Error::invariant(format!(
            "blob {sha256} has kind={}, expected kind={}",
            blob.kind,
            kind.as_str()
        )));
    }
    Ok(())
}

/// Invariant: a referenced target must belong to the referenced install.
fn target_in_install(conn: &Connection, target_id: i64, game_install_id: i64) -> Result<()> {
    let owner: Option<i64> = conn
        .query_row(
            "SELECT game_install_id FROM targets WHERE id = ?1",
            params![target_id],
            |row| row.get(0),
        )
        .optional()?;
    match owner {
        None => Err(Error::not_found(format!("target {target_id}"))),
        Some(owner) if owner != game_install_id => Err(Error::invariant(format!(
            "target {target_id} belongs to install {owner}, not {game_install_id}"
        ))),
        Some(_) => Ok(()),
    }
}

/// Invariant: a referenced profile must belong to the referenced install.
fn profile_in_install(conn: &Connection, profile_id: i64, game_install_id: i64) -> Result<()> {
    let owner: Option<i64> = conn
        .query_row(
            "SELECT game_install_id FROM profiles WHERE id = ?1",
            params![profile_id],
            |row| row.get(0),
        )
        .optional()?;
    match owner {
        None => Err(Error::not_found(format!("profile {profile_id}"))),
        Some(owner) if owner != game_install_id => Err(Error::invariant(format!(
            "profile {profile_id} belongs to install {owner}, not {game_install_id}"
        ))),
        Some(_) => Ok(()),
    }
}

fn profile_install_id(conn: &Connection, profile_id: i64) -> Result<i64> {
    conn.query_row(
        "SELECT game_install_id FROM profiles WHERE id = ?1",
        params![profile_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| Error::not_found(format!("profile {profile_id}")))
}

/// Duplicate priorities within a profile are rejected before any write.
fn assert_priority_free(
    conn: &Connection,
    profile_id: i64,
    priority: i64,
    except_item: Option<i64>,
) -> Result<()> {
    let clash: Option<i64> = conn
        .query_row(
            "SELECT id FROM profile_items
             WHERE profile_id = ?1 AND priority = ?2 AND id != COALESCE(?3, -1)",
            params![profile_id, priority, except_item],
            |row| row.get(0),
        )
        .optional()?;
    if clash.is_some() {
        return Err(Error::validation(format!(
            "priority {priority} is already used in this profile"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const SHA_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const SHA_C: &str = "cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn install(db: &Database) -> i64 {
        db.upsert_game_install(&UpsertGameInstall {
            store_id: "steam".to_string(),
            store_game_id: "1091500".to_string(),
            instance_id: "default".to_string(),
            display_name: "Cyber Game".to_string(),
            install_root: "/tmp/game1".to_string(),
            last_seen_at: Some(now_iso()),
        })
        .unwrap()
    }

    fn target(db: &Database, install_id: i64) -> i64 {
        db.upsert_discovered_target(install_id, "game_dir", "/tmp/game1")
            .unwrap();
        db.get_target_by_name(install_id, "game_dir").unwrap().unwrap().id
    }

    /// install + target + page/file/version chain for one archive blob
    fn version_fixture(db: &Database, install_id: i64, sha: &str) -> i64 {
        db.ensure_blob_recorded(sha, BlobKind::Archive, 10, Some("mod.tar.gz"))
            .unwrap();
        let page = db
            .create_mod_page(install_id, "A Mod", "local", None, None, None)
            .unwrap();
        let file = db.create_mod_file(page, "Main File", true, None).unwrap();
        db.create_mod_file_version(file, sha, Some("mod.tar.gz"), None)
            .unwrap()
    }

    #[test]
    fn timestamps_are_millisecond_zulu() {
        let ts = now_iso();
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), "2026-01-02T03:04:05.678Z".len());
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[19..20], ".");
    }

    #[test]
    fn upsert_game_install_is_idempotent() {
        let db = db();
        let first = install(&db);
        let second = install(&db);
        assert_eq!(first, second);
        assert_eq!(db.list_game_installs().unwrap().len(), 1);
    }

    #[test]
    fn discovery_does_not_clobber_user_override_target() {
        let db = db();
        let install_id = install(&db);
        db.set_target_override(install_id, "game_dir", "/custom/root")
            .unwrap();
        db.upsert_discovered_target(install_id, "game_dir", "/steam/root")
            .unwrap();
        let t = db.get_target_by_name(install_id, "game_dir").unwrap().unwrap();
        assert_eq!(t.root_path, "/custom/root");
        assert_eq!(t.origin, TargetOrigin::UserOverride);

        // discovered targets do refresh
        db.upsert_discovered_target(install_id, "save_dir", "/old")
            .unwrap();
        db.upsert_discovered_target(install_id, "save_dir", "/new")
            .unwrap();
        let t = db.get_target_by_name(install_id, "save_dir").unwrap().unwrap();
        assert_eq!(t.root_path, "/new");
    }

    #[test]
    fn blob_kind_and_size_are_pinned_forever() {
        let db = db();
        db.ensure_blob_recorded(SHA_A, BlobKind::Archive, 10, None)
            .unwrap();
        // same shape is fine
        db.ensure_blob_recorded(SHA_A, BlobKind::Archive, 10, None)
            .unwrap();
        assert!(matches!(
            db.ensure_blob_recorded(SHA_A, BlobKind::Backup, 10, None),
            Err(Error::Invariant(_))
        ));
        assert!(matches!(
            db.ensure_blob_recorded(SHA_A, BlobKind::Archive, 11, None),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn duplicate_version_is_rejected() {
        let db = db();
        let install_id = install(&db);
        db.ensure_blob_recorded(SHA_A, BlobKind::Archive, 10, None)
            .unwrap();
        let page = db
            .create_mod_page(install_id, "A Mod", "local", None, None, None)
            .unwrap();
        let file = db.create_mod_file(page, "Main File", true, None).unwrap();
        db.create_mod_file_version(file, SHA_A, None, None).unwrap();
        assert!(matches!(
            db.create_mod_file_version(file, SHA_A, None, None),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn version_requires_archive_blob() {
        let db = db();
        let install_id = install(&db);
        db.ensure_blob_recorded(SHA_B, BlobKind::Backup, 5, None)
            .unwrap();
        let page = db
            .create_mod_page(install_id, "A Mod", "local", None, None, None)
            .unwrap();
        let file = db.create_mod_file(page, "Main File", true, None).unwrap();
        assert!(matches!(
            db.create_mod_file_version(file, SHA_B, None, None),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn at_most_one_profile_is_active() {
        let db = db();
        let install_id = install(&db);
        db.ensure_default_profile(install_id).unwrap();
        let p1 = db.get_profile_by_name(install_id, "default").unwrap().unwrap();
        assert!(p1.is_active);

        let p2 = db.create_profile(install_id, "alt").unwrap();
        assert!(!p2.is_active);
        db.set_active_profile(install_id, p2.id).unwrap();

        let profiles = db.list_profiles(install_id).unwrap();
        let active: Vec<_> = profiles.iter().filter(|p| p.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, p2.id);
    }

    #[test]
    fn active_profile_must_belong_to_install() {
        let db = db();
        let a = install(&db);
        let b = db
            .upsert_game_install(&UpsertGameInstall {
                store_id: "steam".to_string(),
                store_game_id: "2".to_string(),
                instance_id: "default".to_string(),
                display_name: "Other".to_string(),
                install_root: "/tmp/game2".to_string(),
                last_seen_at: None,
            })
            .unwrap();
        db.ensure_default_profile(b).unwrap();
        let other = db.get_profile_by_name(b, "default").unwrap().unwrap();
        assert!(matches!(
            db.set_active_profile(a, other.id),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn duplicate_priorities_are_rejected_before_write() {
        let db = db();
        let install_id = install(&db);
        db.ensure_default_profile(install_id).unwrap();
        let profile = db.get_profile_by_name(install_id, "default").unwrap().unwrap();
        let v1 = version_fixture(&db, install_id, SHA_A);

        db.ensure_blob_recorded(SHA_B, BlobKind::Archive, 12, None)
            .unwrap();
        let page2 = db
            .create_mod_page(install_id, "B Mod", "local", None, None, None)
            .unwrap();
        let file2 = db.create_mod_file(page2, "Main File", true, None).unwrap();
        let v2 = db.create_mod_file_version(file2, SHA_B, None, None).unwrap();

        let item1 = db.add_profile_item(profile.id, v1, 10).unwrap();
        assert!(matches!(
            db.add_profile_item(profile.id, v2, 10),
            Err(Error::Validation(_))
        ));
        let item2 = db.add_profile_item(profile.id, v2, 20).unwrap();
        assert!(matches!(
            db.set_profile_item_priority(item2, 10),
            Err(Error::Validation(_))
        ));
        // setting an item to its own priority is fine
        db.set_profile_item_priority(item1, 10).unwrap();
        assert_eq!(db.list_profile_items(profile.id).unwrap().len(), 2);
    }

    #[test]
    fn remap_rules_round_trip_in_position_order() {
        let db = db();
        let install_id = install(&db);
        db.ensure_default_profile(install_id).unwrap();
        let profile = db.get_profile_by_name(install_id, "default").unwrap().unwrap();
        let v1 = version_fixture(&db, install_id, SHA_A);
        let item = db.add_profile_item(profile.id, v1, 10).unwrap();

        let rules = vec![
            RemapRule::StripComponents(1),
            RemapRule::SelectSubdir("Data".to_string()),
            RemapRule::from_stored("include_glob", None, Some("**/*.esp")).unwrap(),
        ];
        db.replace_remap_rules(item, &rules).unwrap();
        let loaded = db.list_remap_rules(item).unwrap();
        assert_eq!(loaded, rules);

        db.replace_remap_rules(item, &[]).unwrap();
        assert!(db.list_remap_rules(item).unwrap().is_empty());
    }

    #[test]
    fn override_target_must_match_profile_install() {
        let db = db();
        let a = install(&db);
        let b = db
            .upsert_game_install(&UpsertGameInstall {
                store_id: "steam".to_string(),
                store_game_id: "2".to_string(),
                instance_id: "default".to_string(),
                display_name: "Other".to_string(),
                install_root: "/tmp/game2".to_string(),
                last_seen_at: None,
            })
            .unwrap();
        db.ensure_default_profile(a).unwrap();
        let profile = db.get_profile_by_name(a, "default").unwrap().unwrap();
        let foreign_target = target(&db, b);
        db.ensure_blob_recorded(SHA_C, BlobKind::Override, 3, None)
            .unwrap();
        assert!(matches!(
            db.upsert_override(profile.id, foreign_target, "config/app.ini", SHA_C),
            Err(Error::Invariant(_))
        ));

        let own_target = target(&db, a);
        let id = db
            .upsert_override(profile.id, own_target, "config/app.ini", SHA_C)
            .unwrap();
        assert_eq!(db.get_override(id).unwrap().unwrap().kind, "full_file");
    }

    #[test]
    fn override_requires_override_blob_kind() {
        let db = db();
        let a = install(&db);
        db.ensure_default_profile(a).unwrap();
        let profile = db.get_profile_by_name(a, "default").unwrap().unwrap();
        let t = target(&db, a);
        db.ensure_blob_recorded(SHA_A, BlobKind::Archive, 10, None)
            .unwrap();
        assert!(matches!(
            db.upsert_override(profile.id, t, "x.txt", SHA_A),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn operations_recover_on_startup_and_are_linear() {
        let db = db();
        let install_id = install(&db);
        let op = db
            .create_operation(install_id, None, OperationKind::Apply)
            .unwrap();

        // a second operation is refused while one is running
        assert!(matches!(
            db.create_operation(install_id, None, OperationKind::Apply),
            Err(Error::Invariant(_))
        ));

        assert_eq!(db.recover_stale_operations().unwrap(), 1);
        let rec = db.get_operation(op).unwrap().unwrap();
        assert_eq!(rec.status, OperationStatus::Failed);
        assert!(rec.finished_at.is_some());

        // already finalized: cannot finalize again
        assert!(matches!(
            db.finalize_operation(op, OperationStatus::Success, None),
            Err(Error::Invariant(_))
        ));

        // and a fresh operation can start now
        let op2 = db
            .create_operation(install_id, None, OperationKind::Unapply)
            .unwrap();
        db.finalize_operation(op2, OperationStatus::Failed, Some("cancelled"))
            .unwrap();
    }

    #[test]
    fn commit_success_updates_files_pointers_and_status() {
        let db = db();
        let install_id = install(&db);
        let t = target(&db, install_id);
        db.ensure_default_profile(install_id).unwrap();
        let profile = db.get_profile_by_name(install_id, "default").unwrap().unwrap();
        let v1 = version_fixture(&db, install_id, SHA_A);

        let op = db
            .create_operation(install_id, Some(profile.id), OperationKind::Apply)
            .unwrap();
        let upserts = vec![InstalledFileUpsert {
            target_id: t,
            relpath: "hello.txt".to_string(),
            content_sha256: SHA_B.to_string(),
            size_bytes: 6,
            mod_file_version_id: Some(v1),
            override_id: None,
            profile_id: profile.id,
        }];
        db.commit_operation_success(op, install_id, Some(profile.id), &upserts, &[], None)
            .unwrap();

        let files = db.list_installed_files(install_id).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].last_operation_id, Some(op));
        let gi = db.get_game_install(install_id).unwrap().unwrap();
        assert_eq!(gi.applied_profile_id, Some(profile.id));
        assert_eq!(gi.applied_operation_id, Some(op));
        assert_eq!(
            db.get_operation(op).unwrap().unwrap().status,
            OperationStatus::Success
        );

        // removal path
        let op2 = db
            .create_operation(install_id, None, OperationKind::Unapply)
            .unwrap();
        db.commit_operation_success(
            op2,
            install_id,
            None,
            &[],
            &[(t, "hello.txt".to_string())],
            None,
        )
        .unwrap();
        assert!(db.list_installed_files(install_id).unwrap().is_empty());
        let gi = db.get_game_install(install_id).unwrap().unwrap();
        assert_eq!(gi.applied_profile_id, None);
    }

    #[test]
    fn installed_file_owner_is_exactly_one() {
        let db = db();
        let install_id = install(&db);
        let t = target(&db, install_id);
        db.ensure_default_profile(install_id).unwrap();
        let profile = db.get_profile_by_name(install_id, "default").unwrap().unwrap();
        let op = db
            .create_operation(install_id, None, OperationKind::Apply)
            .unwrap();

        let both_owners = InstalledFileUpsert {
            target_id: t,
            relpath: "x.txt".to_string(),
            content_sha256: SHA_A.to_string(),
            size_bytes: 1,
            mod_file_version_id: Some(1),
            override_id: Some(1),
            profile_id: profile.id,
        };
        assert!(matches!(
            db.commit_operation_success(op, install_id, None, &[both_owners], &[], None),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn backup_rows_keep_the_original() {
        let db = db();
        let install_id = install(&db);
        let t = target(&db, install_id);
        db.ensure_blob_recorded(SHA_A, BlobKind::Backup, 8, None)
            .unwrap();
        db.ensure_blob_recorded(SHA_B, BlobKind::Backup, 9, None)
            .unwrap();

        assert!(db
            .insert_backup_if_absent(install_id, t, "config/app.ini", SHA_A, SHA_A)
            .unwrap());
        // a later capture attempt leaves the original untouched
        assert!(!db
            .insert_backup_if_absent(install_id, t, "config/app.ini", SHA_B, SHA_B)
            .unwrap());
        let backup = db.get_backup(install_id, t, "config/app.ini").unwrap().unwrap();
        assert_eq!(backup.blob_sha256, SHA_A);
    }

    #[test]
    fn journal_rows_check_target_ownership() {
        let db = db();
        let a = install(&db);
        let b = db
            .upsert_game_install(&UpsertGameInstall {
                store_id: "steam".to_string(),
                store_game_id: "2".to_string(),
                instance_id: "default".to_string(),
                display_name: "Other".to_string(),
                install_root: "/tmp/game2".to_string(),
                last_seen_at: None,
            })
            .unwrap();
        let foreign_target = target(&db, b);
        let op = db.create_operation(a, None, OperationKind::Apply).unwrap();

        let change = NewOperationChange {
            operation_id: op,
            target_id: foreign_target,
            relpath: "x".to_string(),
            action: ChangeAction::Write,
            old_content_sha256: None,
            new_content_sha256: Some(SHA_A.to_string()),
            old_size_bytes: None,
            new_size_bytes: Some(1),
            mod_file_version_id: None,
            backup_sha256: None,
            notes: None,
        };
        assert!(matches!(
            db.insert_operation_change(&change),
            Err(Error::Invariant(_))
        ));
    }
}
