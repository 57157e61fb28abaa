//! Archive importer.
//!
//! Validates an input file as an inspectable archive (wrapping loose
//! files into a single-entry tar.gz when it isn't), streams it into the
//! archive blob store, and records page/file/version metadata in one
//! transaction.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;

use crate::archive::Archiver;
use crate::blobstore::{BlobKind, BlobStore};
use crate::cancel::CancelToken;
use crate::db::{Database, ImportIds, ImportRecord};
use crate::errors::{Error, Result};
use crate::nexus;
use crate::pathsafe::is_under_dir;

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub game_install_id: i64,
    pub archive_path: PathBuf,
    pub mod_name: Option<String>,
    pub file_label: Option<String>,
    pub nexus_url: Option<String>,
    pub page_id: Option<i64>,
    /// Delete the input file after a successful import and commit.
    pub remove_source: bool,
}

#[derive(Debug)]
pub struct ImportOutcome {
    pub ids: ImportIds,
    pub sha256: String,
    pub size_bytes: u64,
    pub wrapped: bool,
}

/// Temp file that cleans itself up; the wrap output lives only until the
/// ingest copies it into the blob store.
struct TempArchive {
    path: PathBuf,
}

impl Drop for TempArchive {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

struct Prepared {
    path_to_import: PathBuf,
    wrapped: bool,
    wrapped_from: Option<String>,
    member_name: Option<String>,
    _guard: Option<TempArchive>,
}

pub async fn import_archive(
    db: &Database,
    blobstore: &BlobStore,
    archiver: &Archiver,
    tmp_dir: &Path,
    opts: &ImportOptions,
    cancel: &CancelToken,
) -> Result<ImportOutcome> {
    let input = &opts.archive_path;
    let meta = std::fs::symlink_metadata(input)
        .map_err(|e| Error::validation(format!("cannot stat input {}: {e}", input.display())))?;

    // --rm safety checks come first so a refused removal never follows a
    // completed import.
    if opts.remove_source {
        if meta.file_type().is_symlink() {
            return Err(Error::validation("--rm refuses to operate on symlinks"));
        }
        if !meta.file_type().is_file() {
            return Err(Error::validation("--rm requires a regular file input"));
        }
        if is_under_dir(input, blobstore.root_for(BlobKind::Archive))? {
            return Err(Error::validation(
                "--rm refuses to remove files already inside the archive store",
            ));
        }
    }

    let nexus_ref = opts
        .nexus_url
        .as_deref()
        .map(nexus::parse_mod_url)
        .transpose()?;

    let prepared = prepare_archive(archiver, tmp_dir, input, cancel).await?;
    if prepared.wrapped {
        tracing::warn!(
            input = %input.display(),
            "input was not a supported archive; wrapped into tar.gz for storage"
        );
    }

    // Filesystem first: the blob is authoritative and an unreferenced
    // archive is harmless if the metadata commit fails.
    let ingest = blobstore.ingest_file(BlobKind::Archive, &prepared.path_to_import, cancel)?;

    let version_metadata = prepared.wrapped.then(|| {
        json!({
            "wrapped": true,
            "wrapped_from": prepared.wrapped_from,
            "wrapped_member_name": prepared.member_name,
        })
        .to_string()
    });

    let basename = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "archive".to_string());
    let ids = db.record_import(&ImportRecord {
        game_install_id: opts.game_install_id,
        sha256: ingest.sha256.clone(),
        size_bytes: ingest.size_bytes as i64,
        original_basename: basename,
        page_id: opts.page_id,
        mod_name: opts.mod_name.clone(),
        file_label: opts.file_label.clone(),
        nexus_url: opts.nexus_url.clone(),
        nexus_game_domain: nexus_ref.as_ref().map(|r| r.game_domain.clone()),
        nexus_mod_id: nexus_ref.as_ref().map(|r| r.mod_id),
        version_metadata,
    })?;

    // Delete the original only after the blob and the metadata both
    // landed.
    if opts.remove_source {
        std::fs::remove_file(input)?;
        tracing::info!(input = %input.display(), "removed original input file");
    }

    Ok(ImportOutcome {
        ids,
        sha256: ingest.sha256,
        size_bytes: ingest.size_bytes,
        wrapped: prepared.wrapped,
    })
}

/// Validate the input with the archiver's list capability; wrap anything
/// unlistable into a fresh tar.gz and validate that instead.
async fn prepare_archive(
    archiver: &Archiver,
    tmp_dir: &Path,
    input: &Path,
    cancel: &CancelToken,
) -> Result<Prepared> {
    if archiver.can_list(input, cancel).await? {
        return Ok(Prepared {
            path_to_import: input.to_path_buf(),
            wrapped: false,
            wrapped_from: None,
            member_name: None,
            _guard: None,
        });
    }

    let wrapped = wrap_into_tar_gz(tmp_dir, input)?;
    if !archiver.can_list(&wrapped.path, cancel).await? {
        return Err(Error::Archiver(format!(
            "bad archive: {} cannot be listed even after wrapping",
            input.display()
        )));
    }

    let wrapped_from = input
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_default();
    let member_name = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    Ok(Prepared {
        path_to_import: wrapped.path.clone(),
        wrapped: true,
        wrapped_from: Some(wrapped_from),
        member_name: Some(member_name),
        _guard: Some(wrapped),
    })
}

/// Wrap one regular file into a single-entry tar.gz in the tmp root.
/// The member keeps the input's basename, permission bits, and mtime;
/// ownership is normalized to root so the wrap is reproducible across
/// users.
fn wrap_into_tar_gz(tmp_dir: &Path, src_path: &Path) -> Result<TempArchive> {
    use std::os::unix::fs::PermissionsExt;

    let meta = std::fs::metadata(src_path)?;
    if !meta.is_file() {
        return Err(Error::validation(format!(
            "cannot wrap non-regular file: {}",
            src_path.display()
        )));
    }
    let base = src_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty() && n != "." && n != "..")
        .ok_or_else(|| Error::validation(format!("invalid input filename: {}", src_path.display())))?;

    std::fs::create_dir_all(tmp_dir)?;
    let out_path = tmp_dir.join(format!(
        "modctl-wrap-{}-{base}.tar.gz",
        std::process::id()
    ));
    let guard = TempArchive {
        path: out_path.clone(),
    };

    let out = File::create(&out_path)?;
    let gz = GzEncoder::new(out, Compression::default());
    let mut builder = tar::Builder::new(gz);

    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(meta.len());
    header.set_mode(meta.permissions().mode() & 0o777);
    header.set_mtime(mtime);
    header.set_uid(0);
    header.set_gid(0);
    header
        .set_username("root")
        .map_err(|e| Error::validation(format!("tar username: {e}")))?;
    header
        .set_groupname("root")
        .map_err(|e| Error::validation(format!("tar groupname: {e}")))?;

    let mut src = File::open(src_path)?;
    builder.append_data(&mut header, &base, &mut src)?;

    let gz = builder
        .into_inner()
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    let file = gz.finish()?;
    file.sync_all()?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::games::register_install;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn wrap_produces_a_single_entry_tar_gz() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("notes.pdf");
        std::fs::write(&src, b"not really a pdf").unwrap();

        let wrapped = wrap_into_tar_gz(tmp.path(), &src).unwrap();
        let file = File::open(&wrapped.path).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));

        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str().unwrap(), "notes.pdf");
        assert_eq!(entry.header().uid().unwrap(), 0);
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"not really a pdf");
        assert!(entries.next().is_none());
    }

    #[test]
    fn wrap_cleans_up_on_drop() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("file.bin");
        std::fs::write(&src, b"x").unwrap();
        let wrapped = wrap_into_tar_gz(tmp.path(), &src).unwrap();
        let path = wrapped.path.clone();
        assert!(path.exists());
        drop(wrapped);
        assert!(!path.exists());
    }

    fn import_record(install_id: i64, sha: &str) -> ImportRecord {
        ImportRecord {
            game_install_id: install_id,
            sha256: sha.to_string(),
            size_bytes: 42,
            original_basename: "cool-mod-1.0.tar.gz".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn record_import_creates_page_file_and_version() {
        let db = Database::open_in_memory().unwrap();
        let gi = register_install(&db, "steam:10", "Game", "/tmp/g").unwrap();
        let sha = format!("{:064}", 1);

        let ids = db.record_import(&import_record(gi.id, &sha)).unwrap();
        let page = db.get_mod_page_for_install(ids.page_id, gi.id).unwrap().unwrap();
        assert_eq!(page.name, "cool-mod-1.0.tar.gz");
        assert_eq!(page.source_kind, "local");

        let files = db.list_mod_files(ids.page_id).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].label, "Main File");
        assert!(files[0].is_primary);

        let version = db.get_mod_file_version(ids.version_id).unwrap().unwrap();
        assert_eq!(version.archive_sha256, sha);
    }

    #[test]
    fn record_import_rejects_duplicate_versions() {
        let db = Database::open_in_memory().unwrap();
        let gi = register_install(&db, "steam:10", "Game", "/tmp/g").unwrap();
        let sha = format!("{:064}", 2);

        db.record_import(&import_record(gi.id, &sha)).unwrap();
        let err = db.record_import(&import_record(gi.id, &sha)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("duplicate version"));
    }

    #[test]
    fn record_import_reuses_nexus_pages_and_marks_second_file_secondary() {
        let db = Database::open_in_memory().unwrap();
        let gi = register_install(&db, "steam:10", "Game", "/tmp/g").unwrap();

        let mut first = import_record(gi.id, &format!("{:064}", 3));
        first.nexus_game_domain = Some("skyrimspecialedition".to_string());
        first.nexus_mod_id = Some(266);
        first.mod_name = Some("USSEP".to_string());
        let a = db.record_import(&first).unwrap();
        let page = db.get_mod_page_for_install(a.page_id, gi.id).unwrap().unwrap();
        assert_eq!(page.source_kind, "nexus");

        let mut second = import_record(gi.id, &format!("{:064}", 4));
        second.nexus_game_domain = Some("skyrimspecialedition".to_string());
        second.nexus_mod_id = Some(266);
        second.file_label = Some("Optional".to_string());
        let b = db.record_import(&second).unwrap();

        assert_eq!(a.page_id, b.page_id);
        let files = db.list_mod_files(a.page_id).unwrap();
        assert_eq!(files.len(), 2);
        let optional = files.iter().find(|f| f.label == "Optional").unwrap();
        assert!(!optional.is_primary);
    }

    #[test]
    fn record_import_rejects_foreign_page_id() {
        let db = Database::open_in_memory().unwrap();
        let a = register_install(&db, "steam:10", "Game", "/tmp/g").unwrap();
        let b = register_install(&db, "steam:20", "Other", "/tmp/h").unwrap();

        let on_b = db.record_import(&import_record(b.id, &format!("{:064}", 5))).unwrap();

        let mut rec = import_record(a.id, &format!("{:064}", 6));
        rec.page_id = Some(on_b.page_id);
        assert!(matches!(db.record_import(&rec), Err(Error::NotFound(_))));
    }
}
