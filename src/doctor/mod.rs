//! Health checks for the state directory, database, archiver, and blob
//! store.
//!
//! Read-only by default; `--recheck` streams every blob back through the
//! hash and stamps `verified_at` on success.

use std::fs::File;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::archive::Archiver;
use crate::blobstore::{BlobKind, BlobStore, VerifyStatus};
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::db::Database;
use crate::errors::{Error, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct DoctorOptions {
    /// integrity_check + foreign_key_check instead of quick_check
    pub full: bool,
    /// Rehash every blob and update verified_at
    pub recheck: bool,
}

pub async fn run(
    config: &Config,
    db: &Database,
    blobstore: &BlobStore,
    archiver: &Archiver,
    cancel: &CancelToken,
    opts: &DoctorOptions,
) -> Result<()> {
    check_database(db, opts)?;
    check_paths(config)?;
    check_archiver(config, archiver, cancel).await?;
    check_blobs(db, blobstore, cancel, opts)?;
    Ok(())
}

fn check_database(db: &Database, opts: &DoctorOptions) -> Result<()> {
    println!("Database checks");

    // A connection that answers proves the file is usable.
    db.list_stores()?;
    println!("  ok: basic query");

    let label = if opts.full {
        "integrity_check"
    } else {
        "quick_check"
    };
    let problems = db.integrity_problems(opts.full)?;
    if problems.is_empty() {
        println!("  ok: {label}");
    } else {
        println!("  FAIL: {label} reported corruption");
        for p in &problems {
            println!("    {p}");
        }
        return Err(Error::corruption("database integrity check failed"));
    }

    if opts.full {
        let violations = db.foreign_key_violations()?;
        if violations.is_empty() {
            println!("  ok: foreign_key_check");
        } else {
            println!("  FAIL: foreign_key_check reported violations");
            for v in &violations {
                println!("    {v}");
            }
            return Err(Error::corruption("foreign key violations detected"));
        }
    }

    println!();
    Ok(())
}

fn check_paths(config: &Config) -> Result<()> {
    println!("State directory checks");
    println!("  root: {}", config.state_root().display());

    let required = [
        config.archives_dir(),
        config.backups_dir(),
        config.overrides_dir(),
        config.tmp_dir(),
    ];

    let mut failed = false;
    for path in &required {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if !path.is_dir() {
            println!("  FAIL: {name}: missing or not a directory ({})", path.display());
            failed = true;
            continue;
        }

        let probe = path.join(".modctl-doctor-write-test");
        match std::fs::write(&probe, b"ok") {
            Ok(()) => {
                let _ = std::fs::remove_file(&probe);
                println!("  ok: {name} ({})", path.display());
            }
            Err(err) => {
                println!("  FAIL: {name}: not writable ({err})");
                failed = true;
            }
        }
    }
    println!();

    if failed {
        return Err(Error::validation(
            "state directory layout is incomplete; run `modctl init`",
        ));
    }
    Ok(())
}

async fn check_archiver(config: &Config, archiver: &Archiver, cancel: &CancelToken) -> Result<()> {
    println!("Archiver checks");
    println!("  binary: {}", archiver.bin());

    let version = archiver.version(cancel).await.map_err(|err| {
        println!("  FAIL: {err}");
        err
    })?;
    println!(
        "  ok: version ({})",
        version.lines().next().unwrap_or_default()
    );

    // A known-good archive the archiver must be able to list.
    let sample = config.tmp_dir().join("doctor-sample.tar.gz");
    write_sample_archive(&sample)?;
    let entries = archiver.list(&sample, cancel).await;
    let _ = std::fs::remove_file(&sample);

    let entries = entries?;
    if entries.len() != 1 || entries[0].path != "hello.txt" {
        println!("  FAIL: sample archive listed incorrectly: {entries:?}");
        return Err(Error::Archiver(
            "archiver failed to list the sample archive".to_string(),
        ));
    }
    println!("  ok: sample archive listing");
    println!();
    Ok(())
}

/// One-entry hello.txt tar.gz used to prove the archiver works.
fn write_sample_archive(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let out = File::create(path)?;
    let gz = GzEncoder::new(out, Compression::default());
    let mut builder = tar::Builder::new(gz);

    let body = b"hello\n";
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(body.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, "hello.txt", body.as_slice())?;
    builder
        .into_inner()
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
        .finish()?;
    Ok(())
}

fn check_blobs(
    db: &Database,
    blobstore: &BlobStore,
    cancel: &CancelToken,
    opts: &DoctorOptions,
) -> Result<()> {
    println!("Blob store checks");

    for kind in BlobKind::all() {
        cancel.check()?;
        let blobs = db.list_blobs_by_kind(*kind)?;
        if blobs.is_empty() {
            println!("  ok: {kind}: no blobs recorded");
            continue;
        }

        let mut missing = 0usize;
        for blob in &blobs {
            cancel.check()?;
            let path = blobstore.path_for(*kind, &blob.sha256)?;
            match std::fs::metadata(&path) {
                Ok(meta) => {
                    if meta.len() as i64 != blob.size_bytes {
                        println!(
                            "  FAIL: {kind} blob {} size mismatch (db={}, disk={})",
                            blob.sha256,
                            blob.size_bytes,
                            meta.len()
                        );
                        return Err(Error::corruption(format!(
                            "blob size mismatch for {}",
                            blob.sha256
                        )));
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    missing += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }

        if missing == 0 {
            println!("  ok: {kind}: {}/{} present", blobs.len(), blobs.len());
        } else {
            println!(
                "  warn: {kind}: {}/{} present ({missing} missing)",
                blobs.len() - missing,
                blobs.len()
            );
        }
    }

    if opts.recheck {
        println!();
        for kind in BlobKind::all() {
            rehash_blobs(db, blobstore, *kind, cancel)?;
        }
    }

    println!();
    Ok(())
}

/// Stream every blob of one kind through the hash; only a clean rehash
/// updates `verified_at`.
fn rehash_blobs(
    db: &Database,
    blobstore: &BlobStore,
    kind: BlobKind,
    cancel: &CancelToken,
) -> Result<()> {
    let blobs = db.list_blobs_by_kind(kind)?;
    if blobs.is_empty() {
        println!("  {kind}: (no blobs)");
        return Ok(());
    }

    let mut verified = 0usize;
    let mut missing = 0usize;
    for blob in &blobs {
        cancel.check()?;
        match blobstore.verify(kind, &blob.sha256, blob.size_bytes as u64, cancel)? {
            VerifyStatus::Ok => {
                db.touch_blob_verified_at(&blob.sha256)?;
                verified += 1;
            }
            VerifyStatus::Missing => missing += 1,
            VerifyStatus::SizeMismatch { expected, actual } => {
                return Err(Error::corruption(format!(
                    "blob {} size mismatch (db={expected}, disk={actual})",
                    blob.sha256
                )));
            }
            VerifyStatus::HashMismatch { expected, actual } => {
                return Err(Error::corruption(format!(
                    "blob hash mismatch: expected {expected}, got {actual}"
                )));
            }
        }
    }

    println!("  {kind}: rehash verified {verified}/{}", blobs.len());
    if missing > 0 {
        println!("    skipped {missing} missing blobs");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use tempfile::TempDir;

    #[test]
    fn sample_archive_is_a_valid_single_entry_tar_gz() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sample.tar.gz");
        write_sample_archive(&path).unwrap();

        let file = File::open(&path).unwrap();
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str().unwrap(), "hello.txt");
        let mut body = String::new();
        std::io::Read::read_to_string(&mut entry, &mut body).unwrap();
        assert_eq!(body, "hello\n");
        assert!(entries.next().is_none());
    }

    #[test]
    fn blob_checks_pass_on_consistent_state_and_rehash_touches_verified_at() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let bs = BlobStore::new(
            tmp.path().join("archives"),
            tmp.path().join("backups"),
            tmp.path().join("overrides"),
            tmp.path().join("tmp"),
        );
        let cancel = CancelToken::new();

        let src = tmp.path().join("hello.txt");
        std::fs::write(&src, b"hello\n").unwrap();
        let ingest = bs.ingest_file(BlobKind::Archive, &src, &cancel).unwrap();
        db.ensure_blob_recorded(&ingest.sha256, BlobKind::Archive, 6, None)
            .unwrap();

        check_blobs(
            &db,
            &bs,
            &cancel,
            &DoctorOptions {
                full: false,
                recheck: true,
            },
        )
        .unwrap();

        let blob = db.get_blob(&ingest.sha256).unwrap().unwrap();
        assert!(blob.verified_at.is_some());
    }

    #[test]
    fn corrupted_blob_fails_rehash() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let bs = BlobStore::new(
            tmp.path().join("archives"),
            tmp.path().join("backups"),
            tmp.path().join("overrides"),
            tmp.path().join("tmp"),
        );
        let cancel = CancelToken::new();

        let src = tmp.path().join("hello.txt");
        std::fs::write(&src, b"hello\n").unwrap();
        let ingest = bs.ingest_file(BlobKind::Backup, &src, &cancel).unwrap();
        db.ensure_blob_recorded(&ingest.sha256, BlobKind::Backup, 6, None)
            .unwrap();

        // Same length, different bytes.
        let blob_path = bs.path_for(BlobKind::Backup, &ingest.sha256).unwrap();
        std::fs::write(&blob_path, b"hell0\n").unwrap();

        let err = rehash_blobs(&db, &bs, BlobKind::Backup, &cancel).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }
}
