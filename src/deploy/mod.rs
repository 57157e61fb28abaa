//! Apply engine: reconcile the live filesystem with a plan.
//!
//! Every run opens an operation row, stages content under a per-operation
//! scratch directory, captures backups for pre-existing files it is about
//! to overwrite, moves winners into place with atomic renames, removes
//! obsolete tool-owned files, and journals every path it touched. The
//! terminal metadata commit is a single transaction; a crash in between
//! leaves `status=running` for startup recovery to finalize as failed.

mod lock;

pub use lock::InstallLock;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::archive::Archiver;
use crate::blobstore::{hash_file, BlobKind, BlobStore};
use crate::cancel::CancelToken;
use crate::db::{
    ChangeAction, Database, GameInstallRecord, InstalledFileRecord, InstalledFileUpsert,
    NewOperationChange, OperationKind, OperationStatus, ProfileRecord,
};
use crate::errors::{Error, Result};
use crate::planner::{ContentSource, Plan, PlanEntry};

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    /// Overwrite/remove drifted paths after capturing a backup of the
    /// drifted content. The default skips the path and records the drift.
    pub force: bool,
}

#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub operation_id: i64,
    pub written: usize,
    pub removed: usize,
    pub restored: usize,
    pub kept: usize,
    pub drifted: Vec<String>,
}

pub struct Deployer<'a> {
    pub db: &'a Database,
    pub blobstore: &'a BlobStore,
    pub archiver: &'a Archiver,
    pub tmp_dir: PathBuf,
    pub locks_dir: PathBuf,
    pub cancel: &'a CancelToken,
}

/// Classification of one path against the current installed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathClass {
    New,
    Replace,
    Keep,
}

struct StagedEntry {
    entry: PlanEntry,
    staged_path: PathBuf,
    sha256: String,
    size_bytes: i64,
}

impl<'a> Deployer<'a> {
    /// Apply a plan to the install. Holds the per-install lock for the
    /// whole run; on any error the operation is finalized as failed and
    /// the error propagates.
    pub async fn apply(
        &self,
        install: &GameInstallRecord,
        profile: &ProfileRecord,
        plan: Plan,
        opts: &ApplyOptions,
    ) -> Result<ApplyOutcome> {
        let _lock = InstallLock::acquire(&self.locks_dir, install.id)?;
        let op_id = self
            .db
            .create_operation(install.id, Some(profile.id), OperationKind::Apply)?;
        tracing::info!(operation = op_id, profile = %profile.name, "apply started");

        let result = self
            .execute(op_id, install, Some(profile.id), &plan, false, opts)
            .await;
        self.finish(op_id, result).await
    }

    /// Remove every tool-owned file for the install and restore captured
    /// backups: an apply of the empty plan plus the restore rule.
    pub async fn unapply(
        &self,
        install: &GameInstallRecord,
        opts: &ApplyOptions,
    ) -> Result<ApplyOutcome> {
        let _lock = InstallLock::acquire(&self.locks_dir, install.id)?;
        let op_id = self
            .db
            .create_operation(install.id, None, OperationKind::Unapply)?;
        tracing::info!(operation = op_id, "unapply started");

        let plan = Plan {
            game_install_id: install.id,
            profile_id: 0,
            entries: Default::default(),
            version_archives: Default::default(),
        };
        let result = self.execute(op_id, install, None, &plan, true, opts).await;
        self.finish(op_id, result).await
    }

    async fn finish(&self, op_id: i64, result: Result<ApplyOutcome>) -> Result<ApplyOutcome> {
        let staging = self.staging_dir(op_id);
        if staging.exists() {
            let _ = fs::remove_dir_all(&staging);
        }
        match result {
            Ok(outcome) => {
                tracing::info!(
                    operation = op_id,
                    written = outcome.written,
                    removed = outcome.removed,
                    restored = outcome.restored,
                    drifted = outcome.drifted.len(),
                    "operation succeeded"
                );
                Ok(outcome)
            }
            Err(err) => {
                tracing::error!(operation = op_id, %err, "operation failed");
                self.db
                    .finalize_operation(op_id, OperationStatus::Failed, Some(&err.to_string()))?;
                Err(err)
            }
        }
    }

    fn staging_dir(&self, op_id: i64) -> PathBuf {
        self.tmp_dir.join(format!("op-{op_id}"))
    }

    async fn execute(
        &self,
        op_id: i64,
        install: &GameInstallRecord,
        applied_profile_id: Option<i64>,
        plan: &Plan,
        restore_backups: bool,
        opts: &ApplyOptions,
    ) -> Result<ApplyOutcome> {
        let mut outcome = ApplyOutcome {
            operation_id: op_id,
            ..Default::default()
        };

        let target_roots: HashMap<i64, PathBuf> = self
            .db
            .list_targets(install.id)?
            .into_iter()
            .map(|t| (t.id, PathBuf::from(t.root_path)))
            .collect();

        // Stage: extract every referenced archive, then hash each staged
        // file. No destructive change happens before this completes.
        let staged = self.stage(op_id, plan).await?;

        // Scan current tool-managed state.
        let current: HashMap<(i64, String), InstalledFileRecord> = self
            .db
            .list_installed_files(install.id)?
            .into_iter()
            .map(|f| ((f.target_id, f.relpath.clone()), f))
            .collect();

        let mut upserts: Vec<InstalledFileUpsert> = Vec::new();
        let mut removals: Vec<(i64, String)> = Vec::new();

        // Winners, in plan order.
        for staged_entry in &staged {
            self.cancel.check()?;
            let entry = &staged_entry.entry;
            let relpath = entry.relpath.as_str();
            let root = target_roots.get(&entry.target_id).ok_or_else(|| {
                Error::not_found(format!("target {} for install {}", entry.target_id, install.id))
            })?;
            let dest = root.join(entry.relpath.to_path_buf());

            let class = match current.get(&(entry.target_id, relpath.to_string())) {
                None => PathClass::New,
                Some(row) if row.content_sha256 == staged_entry.sha256 => PathClass::Keep,
                Some(_) => PathClass::Replace,
            };
            let row = current.get(&(entry.target_id, relpath.to_string()));

            if class == PathClass::Keep {
                outcome.kept += 1;
                // Ownership still gets refreshed so the row follows the
                // winning profile and operation.
                upserts.push(self.upsert_for(entry, staged_entry, applied_profile_id)?);
                continue;
            }

            // Backup capture before anything touches the destination.
            let mut backup_sha: Option<String> = None;
            let mut old_disk: Option<(String, u64)> = None;
            if dest.exists() {
                let (disk_sha, disk_size) = hash_file(&dest, self.cancel)?;
                old_disk = Some((disk_sha.clone(), disk_size));

                let tool_owned = row.is_some_and(|r| r.content_sha256 == disk_sha);
                if !tool_owned {
                    if row.is_some() && !opts.force {
                        // Tracked path whose on-disk bytes drifted: leave
                        // it alone and journal the skip.
                        self.db.insert_operation_change(&NewOperationChange {
                            operation_id: op_id,
                            target_id: entry.target_id,
                            relpath: relpath.to_string(),
                            action: ChangeAction::Noop,
                            old_content_sha256: row.map(|r| r.content_sha256.clone()),
                            new_content_sha256: Some(staged_entry.sha256.clone()),
                            old_size_bytes: row.map(|r| r.size_bytes),
                            new_size_bytes: Some(staged_entry.size_bytes),
                            mod_file_version_id: source_version(entry),
                            backup_sha256: None,
                            notes: Some(format!(
                                "drift: on-disk sha256 {disk_sha} does not match tracked state"
                            )),
                        })?;
                        outcome.drifted.push(relpath.to_string());
                        continue;
                    }
                    backup_sha = Some(self.capture_backup(
                        install.id,
                        entry.target_id,
                        relpath,
                        &dest,
                        &disk_sha,
                    )?);
                }
            }

            // Move the staged winner into place.
            safe_move(&staged_entry.staged_path, &dest)?;

            let action = if old_disk.is_some() {
                ChangeAction::Overwrite
            } else {
                ChangeAction::Write
            };
            let (old_sha, old_size) = match (row, &old_disk) {
                (Some(r), _) => (Some(r.content_sha256.clone()), Some(r.size_bytes)),
                (None, Some((sha, size))) => (Some(sha.clone()), Some(*size as i64)),
                (None, None) => (None, None),
            };
            self.db.insert_operation_change(&NewOperationChange {
                operation_id: op_id,
                target_id: entry.target_id,
                relpath: relpath.to_string(),
                action,
                old_content_sha256: old_sha,
                new_content_sha256: Some(staged_entry.sha256.clone()),
                old_size_bytes: old_size,
                new_size_bytes: Some(staged_entry.size_bytes),
                mod_file_version_id: source_version(entry),
                backup_sha256: backup_sha,
                notes: None,
            })?;
            upserts.push(self.upsert_for(entry, staged_entry, applied_profile_id)?);
            outcome.written += 1;
        }

        // Remove obsolete tool-owned files, in deterministic order.
        let mut obsolete: Vec<&InstalledFileRecord> = current
            .values()
            .filter(|row| {
                !plan.entries.iter().any(|((target_id, relpath), _)| {
                    *target_id == row.target_id && relpath.as_str() == row.relpath
                })
            })
            .collect();
        obsolete.sort_by(|a, b| (a.target_id, &a.relpath).cmp(&(b.target_id, &b.relpath)));

        for row in obsolete {
            self.cancel.check()?;
            let root = target_roots.get(&row.target_id).ok_or_else(|| {
                Error::not_found(format!("target {} for install {}", row.target_id, install.id))
            })?;
            let dest = root.join(&row.relpath);

            let mut removed_from_disk = false;
            if dest.exists() {
                let (disk_sha, _) = hash_file(&dest, self.cancel)?;
                if disk_sha != row.content_sha256 {
                    if !opts.force {
                        // Not ours anymore: never delete without an
                        // explicit override.
                        self.db.insert_operation_change(&NewOperationChange {
                            operation_id: op_id,
                            target_id: row.target_id,
                            relpath: row.relpath.clone(),
                            action: ChangeAction::Noop,
                            old_content_sha256: Some(row.content_sha256.clone()),
                            new_content_sha256: None,
                            old_size_bytes: Some(row.size_bytes),
                            new_size_bytes: None,
                            mod_file_version_id: row.mod_file_version_id,
                            backup_sha256: None,
                            notes: Some(format!(
                                "drift: on-disk sha256 {disk_sha} does not match tracked state; not removed"
                            )),
                        })?;
                        outcome.drifted.push(row.relpath.clone());
                        continue;
                    }
                    self.capture_backup(
                        install.id,
                        row.target_id,
                        &row.relpath,
                        &dest,
                        &disk_sha,
                    )?;
                }
                fs::remove_file(&dest)?;
                remove_empty_parents(&dest, root);
                removed_from_disk = true;
            }

            self.db.insert_operation_change(&NewOperationChange {
                operation_id: op_id,
                target_id: row.target_id,
                relpath: row.relpath.clone(),
                action: ChangeAction::Remove,
                old_content_sha256: Some(row.content_sha256.clone()),
                new_content_sha256: None,
                old_size_bytes: Some(row.size_bytes),
                new_size_bytes: None,
                mod_file_version_id: row.mod_file_version_id,
                backup_sha256: None,
                notes: (!removed_from_disk).then(|| "file was already absent".to_string()),
            })?;
            removals.push((row.target_id, row.relpath.clone()));
            outcome.removed += 1;

            if restore_backups && removed_from_disk {
                if let Some(backup) =
                    self.db.get_backup(install.id, row.target_id, &row.relpath)?
                {
                    let blob_path =
                        self.blobstore.path_for(BlobKind::Backup, &backup.blob_sha256)?;
                    safe_copy(&blob_path, &dest)?;
                    let blob = self
                        .db
                        .get_blob(&backup.blob_sha256)?
                        .ok_or_else(|| Error::not_found(format!("blob {}", backup.blob_sha256)))?;
                    self.db.insert_operation_change(&NewOperationChange {
                        operation_id: op_id,
                        target_id: row.target_id,
                        relpath: row.relpath.clone(),
                        action: ChangeAction::RestoreBackup,
                        old_content_sha256: None,
                        new_content_sha256: Some(backup.original_content_sha256.clone()),
                        old_size_bytes: None,
                        new_size_bytes: Some(blob.size_bytes),
                        mod_file_version_id: None,
                        backup_sha256: Some(backup.blob_sha256.clone()),
                        notes: None,
                    })?;
                    outcome.restored += 1;
                }
            }
        }

        let message = if outcome.drifted.is_empty() {
            None
        } else {
            let mut drifted = outcome.drifted.clone();
            drifted.sort();
            Some(format!("drift detected at: {}", drifted.join(", ")))
        };
        self.db.commit_operation_success(
            op_id,
            install.id,
            applied_profile_id,
            &upserts,
            &removals,
            message.as_deref(),
        )?;

        Ok(outcome)
    }

    /// Extract every archive the plan references into the per-operation
    /// staging directory, then hash each staged file. Override blobs are
    /// copied into staging the same way so the write step is uniform.
    async fn stage(&self, op_id: i64, plan: &Plan) -> Result<Vec<StagedEntry>> {
        let staging = self.staging_dir(op_id);
        fs::create_dir_all(&staging)?;

        for sha in plan.distinct_archives() {
            self.cancel.check()?;
            let archive_path = self.blobstore.path_for(BlobKind::Archive, &sha)?;
            let dest = staging.join(&sha);
            tracing::debug!(archive = %sha, "extracting into staging");
            self.archiver.extract(&archive_path, &dest, self.cancel).await?;
        }

        let mut staged = Vec::new();
        for entry in plan.entries.values() {
            self.cancel.check()?;
            match &entry.source {
                ContentSource::FromModVersion {
                    mod_file_version_id,
                    archive_entry,
                } => {
                    let sha = plan.version_archives.get(mod_file_version_id).ok_or_else(|| {
                        Error::corruption(format!(
                            "plan references version {mod_file_version_id} with no archive"
                        ))
                    })?;
                    let staged_path = staging.join(sha).join(archive_entry);
                    if !staged_path.is_file() {
                        return Err(Error::corruption(format!(
                            "archive {sha} did not produce entry {archive_entry:?}"
                        )));
                    }
                    let (content_sha, size) = hash_file(&staged_path, self.cancel)?;
                    if let Some(expected) = &entry.expected_sha256 {
                        if expected != &content_sha {
                            return Err(Error::corruption(format!(
                                "staged entry {archive_entry:?} hashed {content_sha}, expected {expected}"
                            )));
                        }
                    }
                    staged.push(StagedEntry {
                        entry: entry.clone(),
                        staged_path,
                        sha256: content_sha,
                        size_bytes: size as i64,
                    });
                }
                ContentSource::FromOverride { override_id } => {
                    let expected = entry.expected_sha256.as_deref().ok_or_else(|| {
                        Error::corruption(format!(
                            "override {override_id} has no recorded content hash"
                        ))
                    })?;
                    let blob_path = self.blobstore.path_for(BlobKind::Override, expected)?;
                    let staged_path = staging.join("overrides").join(override_id.to_string());
                    safe_copy(&blob_path, &staged_path)?;
                    let (content_sha, size) = hash_file(&staged_path, self.cancel)?;
                    if content_sha != expected {
                        return Err(Error::corruption(format!(
                            "override blob {expected} hashed {content_sha} on read"
                        )));
                    }
                    staged.push(StagedEntry {
                        entry: entry.clone(),
                        staged_path,
                        sha256: content_sha,
                        size_bytes: size as i64,
                    });
                }
            }
        }
        Ok(staged)
    }

    /// Read a pre-existing file into the backup store and record the row.
    /// An existing backup for the path wins; the capture still returns
    /// the blob that now covers the path.
    fn capture_backup(
        &self,
        install_id: i64,
        target_id: i64,
        relpath: &str,
        path: &Path,
        disk_sha: &str,
    ) -> Result<String> {
        let ingest = self
            .blobstore
            .ingest_file(BlobKind::Backup, path, self.cancel)?;
        self.db.ensure_blob_recorded(
            &ingest.sha256,
            BlobKind::Backup,
            ingest.size_bytes as i64,
            None,
        )?;
        let inserted = self.db.insert_backup_if_absent(
            install_id,
            target_id,
            relpath,
            &ingest.sha256,
            disk_sha,
        )?;
        if inserted {
            tracing::info!(relpath, sha = %ingest.sha256, "captured backup");
        }
        let backup = self
            .db
            .get_backup(install_id, target_id, relpath)?
            .ok_or_else(|| Error::corruption(format!("backup row vanished for {relpath}")))?;
        Ok(backup.blob_sha256)
    }

    fn upsert_for(
        &self,
        entry: &PlanEntry,
        staged: &StagedEntry,
        applied_profile_id: Option<i64>,
    ) -> Result<InstalledFileUpsert> {
        let profile_id = applied_profile_id.ok_or_else(|| {
            Error::invariant("cannot record installed files without a profile".to_string())
        })?;
        let (version_id, override_id) = match &entry.source {
            ContentSource::FromModVersion {
                mod_file_version_id,
                ..
            } => (Some(*mod_file_version_id), None),
            ContentSource::FromOverride { override_id } => (None, Some(*override_id)),
        };
        Ok(InstalledFileUpsert {
            target_id: entry.target_id,
            relpath: entry.relpath.as_str().to_string(),
            content_sha256: staged.sha256.clone(),
            size_bytes: staged.size_bytes,
            mod_file_version_id: version_id,
            override_id,
            profile_id,
        })
    }
}

fn source_version(entry: &PlanEntry) -> Option<i64> {
    match &entry.source {
        ContentSource::FromModVersion {
            mod_file_version_id,
            ..
        } => Some(*mod_file_version_id),
        ContentSource::FromOverride { .. } => None,
    }
}

/// Rename into place; on a cross-filesystem rename, fall back to a copy
/// into the destination directory followed by a rename there.
fn safe_move(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::CrossesDevices => {
            let tmp = dest_sibling_tmp(dest);
            fs::copy(src, &tmp)?;
            if let Err(rename_err) = fs::rename(&tmp, dest) {
                let _ = fs::remove_file(&tmp);
                return Err(rename_err.into());
            }
            let _ = fs::remove_file(src);
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Copy via a temp file in the destination directory, then rename. Used
/// where the source must stay in place (blob restores, override staging).
fn safe_copy(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = dest_sibling_tmp(dest);
    fs::copy(src, &tmp)?;
    if let Err(err) = fs::rename(&tmp, dest) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}

fn dest_sibling_tmp(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    dest.with_file_name(format!(".modctl-{}-{}", std::process::id(), name))
}

/// Prune directories the tool emptied, stopping at the target root.
fn remove_empty_parents(path: &Path, root: &Path) {
    let mut dir = path.parent();
    while let Some(d) = dir {
        if d == root || !d.starts_with(root) {
            break;
        }
        if fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
}
