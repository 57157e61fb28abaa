//! Content-addressed blob storage.
//!
//! Three kind-partitioned roots (archives, backups, overrides) hold
//! immutable blobs at `<two-hex-fan>/<full-sha256>`. Ingest streams into a
//! temp file under `tmp/incoming/` while hashing, then renames into place;
//! identical bytes dedupe to a single on-disk file. A rename race with a
//! concurrent ingest of the same hash is treated as a dedupe hit, subject
//! to the same size sanity check.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::errors::{Error, Result};

/// Copy buffer size; cancellation is checked between chunks.
const COPY_CHUNK: usize = 1024 * 1024;

static INGEST_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobKind {
    Archive,
    Backup,
    Override,
}

impl BlobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobKind::Archive => "archive",
            BlobKind::Backup => "backup",
            BlobKind::Override => "override",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "archive" => Ok(BlobKind::Archive),
            "backup" => Ok(BlobKind::Backup),
            "override" => Ok(BlobKind::Override),
            other => Err(Error::validation(format!("unknown blob kind: {other:?}"))),
        }
    }

    pub fn all() -> &'static [BlobKind] {
        &[BlobKind::Archive, BlobKind::Backup, BlobKind::Override]
    }
}

impl std::fmt::Display for BlobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestResult {
    pub sha256: String,
    pub size_bytes: u64,
    pub existed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyStatus {
    Ok,
    Missing,
    SizeMismatch { expected: u64, actual: u64 },
    HashMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    archives_dir: PathBuf,
    backups_dir: PathBuf,
    overrides_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl BlobStore {
    pub fn new(
        archives_dir: PathBuf,
        backups_dir: PathBuf,
        overrides_dir: PathBuf,
        tmp_dir: PathBuf,
    ) -> Self {
        Self {
            archives_dir,
            backups_dir,
            overrides_dir,
            tmp_dir,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.archives_dir(),
            config.backups_dir(),
            config.overrides_dir(),
            config.tmp_dir(),
        )
    }

    pub fn root_for(&self, kind: BlobKind) -> &Path {
        match kind {
            BlobKind::Archive => &self.archives_dir,
            BlobKind::Backup => &self.backups_dir,
            BlobKind::Override => &self.overrides_dir,
        }
    }

    /// Derived blob path: `<root>/ab/<fullhash>`. Pure function; rejects
    /// anything that is not 64 lowercase hex characters.
    pub fn path_for(&self, kind: BlobKind, sha256: &str) -> Result<PathBuf> {
        if sha256.len() != 64 {
            return Err(Error::validation(format!(
                "invalid sha256 length: {}",
                sha256.len()
            )));
        }
        if !sha256
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(Error::validation(format!("invalid sha256: {sha256:?}")));
        }
        let fan = &sha256[..2];
        Ok(self.root_for(kind).join(fan).join(sha256))
    }

    /// Stream `src` into the store, addressed by its SHA-256.
    ///
    /// The final path is unknown until the content has been hashed, so the
    /// bytes land in a temp file under `tmp/incoming/` first and are
    /// renamed into place afterwards. On cancellation the temp file is
    /// removed and no partial blob remains.
    pub fn ingest_file(
        &self,
        kind: BlobKind,
        src: &Path,
        cancel: &CancelToken,
    ) -> Result<IngestResult> {
        let mut reader = File::open(src)?;

        let incoming = self.tmp_dir.join("incoming");
        fs::create_dir_all(&incoming)?;

        let seq = INGEST_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp_path = incoming.join(format!(".ingest-{}-{}", std::process::id(), seq));
        let mut tmp = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;

        let mut hasher = Sha256::new();
        let copied = (|| -> Result<u64> {
            let mut buf = vec![0u8; COPY_CHUNK];
            let mut total = 0u64;
            loop {
                cancel.check()?;
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                tmp.write_all(&buf[..n])?;
                total += n as u64;
            }
            tmp.sync_all()?;
            Ok(total)
        })();

        let size = match copied {
            Ok(size) => size,
            Err(err) => {
                drop(tmp);
                let _ = fs::remove_file(&tmp_path);
                return Err(err);
            }
        };
        drop(tmp);

        let sha256 = hex::encode(hasher.finalize());
        let final_path = match self.path_for(kind, &sha256) {
            Ok(p) => p,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(err);
            }
        };

        let result = self.place_blob(&tmp_path, &final_path, &sha256, size);
        if result.is_err() || matches!(&result, Ok(r) if r.existed) {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }

    /// Move a fully written temp file into its content-addressed slot,
    /// handling the pre-existing-blob and rename-race cases.
    fn place_blob(
        &self,
        tmp_path: &Path,
        final_path: &Path,
        sha256: &str,
        size: u64,
    ) -> Result<IngestResult> {
        if let Some(fan_dir) = final_path.parent() {
            fs::create_dir_all(fan_dir)?;
        }

        match fs::metadata(final_path) {
            Ok(meta) => {
                // Already stored: a size mismatch against the same hash
                // means corruption or tampering, never a harmless dupe.
                if meta.len() != size {
                    return Err(Error::corruption(format!(
                        "blob {} exists with size={}, ingest size={}",
                        final_path.display(),
                        meta.len(),
                        size
                    )));
                }
                return Ok(IngestResult {
                    sha256: sha256.to_string(),
                    size_bytes: size,
                    existed: true,
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        if let Err(rename_err) = fs::rename(tmp_path, final_path) {
            // Lost a race with a concurrent ingest of the same content.
            if let Ok(meta) = fs::metadata(final_path) {
                if meta.len() != size {
                    return Err(Error::corruption(format!(
                        "blob {} appeared with size={}, ingest size={}",
                        final_path.display(),
                        meta.len(),
                        size
                    )));
                }
                return Ok(IngestResult {
                    sha256: sha256.to_string(),
                    size_bytes: size,
                    existed: true,
                });
            }
            return Err(rename_err.into());
        }

        if let Some(fan_dir) = final_path.parent() {
            // Best-effort: flush the directory entry so the rename
            // survives a crash.
            let _ = fsync_dir(fan_dir);
        }

        Ok(IngestResult {
            sha256: sha256.to_string(),
            size_bytes: size,
            existed: false,
        })
    }

    /// Stat and re-stream a blob, comparing size and hash against the
    /// recorded values. The caller decides what to do with the verdict
    /// (doctor touches `verified_at` on `Ok`).
    pub fn verify(
        &self,
        kind: BlobKind,
        sha256: &str,
        expected_size: u64,
        cancel: &CancelToken,
    ) -> Result<VerifyStatus> {
        let path = self.path_for(kind, sha256)?;
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(VerifyStatus::Missing)
            }
            Err(err) => return Err(err.into()),
        };
        if meta.len() != expected_size {
            return Ok(VerifyStatus::SizeMismatch {
                expected: expected_size,
                actual: meta.len(),
            });
        }

        let mut file = File::open(&path)?;
        let actual = hash_reader(&mut file, cancel)?;
        if actual != sha256 {
            return Ok(VerifyStatus::HashMismatch {
                expected: sha256.to_string(),
                actual,
            });
        }
        Ok(VerifyStatus::Ok)
    }

    /// Remove a blob file. Garbage collection primitive; callers are
    /// responsible for checking references first.
    pub fn remove(&self, kind: BlobKind, sha256: &str) -> Result<()> {
        let path = self.path_for(kind, sha256)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Hash a reader in cancellable chunks, returning lowercase hex.
pub fn hash_reader(reader: &mut impl Read, cancel: &CancelToken) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        cancel.check()?;
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash a file on disk, returning (sha256, size).
pub fn hash_file(path: &Path, cancel: &CancelToken) -> Result<(String, u64)> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    let sha256 = hash_reader(&mut file, cancel)?;
    Ok((sha256, size))
}

/// fsync a directory so a rename within it is durable across a crash.
/// Filesystems may relax this; non-fatal in callers.
fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HELLO_SHA: &str = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

    fn store(tmp: &TempDir) -> BlobStore {
        BlobStore::new(
            tmp.path().join("archives"),
            tmp.path().join("backups"),
            tmp.path().join("overrides"),
            tmp.path().join("tmp"),
        )
    }

    fn write_src(tmp: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = tmp.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn path_for_fans_by_hash_prefix() {
        let tmp = TempDir::new().unwrap();
        let bs = store(&tmp);
        let path = bs.path_for(BlobKind::Archive, HELLO_SHA).unwrap();
        assert_eq!(
            path,
            tmp.path().join("archives").join("58").join(HELLO_SHA)
        );
    }

    #[test]
    fn path_for_rejects_bad_hashes() {
        let tmp = TempDir::new().unwrap();
        let bs = store(&tmp);
        assert!(bs.path_for(BlobKind::Archive, "abc").is_err());
        assert!(bs
            .path_for(BlobKind::Archive, &"Z".repeat(64))
            .is_err());
        // Uppercase hex is not canonical
        assert!(bs
            .path_for(BlobKind::Archive, &HELLO_SHA.to_uppercase())
            .is_err());
    }

    #[test]
    fn ingest_streams_and_dedupes() {
        let tmp = TempDir::new().unwrap();
        let bs = store(&tmp);
        let cancel = CancelToken::new();
        let src = write_src(&tmp, "hello.txt", b"hello\n");

        let first = bs.ingest_file(BlobKind::Archive, &src, &cancel).unwrap();
        assert_eq!(first.sha256, HELLO_SHA);
        assert_eq!(first.size_bytes, 6);
        assert!(!first.existed);

        let second = bs.ingest_file(BlobKind::Archive, &src, &cancel).unwrap();
        assert!(second.existed);
        assert_eq!(second.sha256, first.sha256);

        let blob_path = bs.path_for(BlobKind::Archive, HELLO_SHA).unwrap();
        assert_eq!(fs::read(blob_path).unwrap(), b"hello\n");

        // No partial files left behind.
        let leftovers: Vec<_> = fs::read_dir(tmp.path().join("tmp").join("incoming"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn ingest_detects_size_mismatch_against_existing_blob() {
        let tmp = TempDir::new().unwrap();
        let bs = store(&tmp);
        let cancel = CancelToken::new();
        let src = write_src(&tmp, "hello.txt", b"hello\n");
        bs.ingest_file(BlobKind::Archive, &src, &cancel).unwrap();

        // Tamper with the stored blob, then re-ingest the same content.
        let blob_path = bs.path_for(BlobKind::Archive, HELLO_SHA).unwrap();
        fs::write(&blob_path, b"tampered bytes").unwrap();

        let err = bs
            .ingest_file(BlobKind::Archive, &src, &cancel)
            .unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn cancelled_ingest_leaves_no_partial_file() {
        let tmp = TempDir::new().unwrap();
        let bs = store(&tmp);
        let cancel = CancelToken::new();
        cancel.cancel();
        let src = write_src(&tmp, "hello.txt", b"hello\n");

        let err = bs
            .ingest_file(BlobKind::Archive, &src, &cancel)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        let leftovers: Vec<_> = fs::read_dir(tmp.path().join("tmp").join("incoming"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
        assert!(!bs
            .path_for(BlobKind::Archive, HELLO_SHA)
            .unwrap()
            .exists());
    }

    #[test]
    fn verify_reports_each_failure_mode() {
        let tmp = TempDir::new().unwrap();
        let bs = store(&tmp);
        let cancel = CancelToken::new();
        let src = write_src(&tmp, "hello.txt", b"hello\n");
        bs.ingest_file(BlobKind::Backup, &src, &cancel).unwrap();

        assert_eq!(
            bs.verify(BlobKind::Backup, HELLO_SHA, 6, &cancel).unwrap(),
            VerifyStatus::Ok
        );
        assert!(matches!(
            bs.verify(BlobKind::Backup, HELLO_SHA, 7, &cancel).unwrap(),
            VerifyStatus::SizeMismatch { expected: 7, actual: 6 }
        ));

        // Same size, different content.
        let blob_path = bs.path_for(BlobKind::Backup, HELLO_SHA).unwrap();
        fs::write(&blob_path, b"hell0\n").unwrap();
        assert!(matches!(
            bs.verify(BlobKind::Backup, HELLO_SHA, 6, &cancel).unwrap(),
            VerifyStatus::HashMismatch { .. }
        ));

        fs::remove_file(&blob_path).unwrap();
        assert_eq!(
            bs.verify(BlobKind::Backup, HELLO_SHA, 6, &cancel).unwrap(),
            VerifyStatus::Missing
        );
    }

    #[test]
    fn kinds_partition_the_store() {
        let tmp = TempDir::new().unwrap();
        let bs = store(&tmp);
        let cancel = CancelToken::new();
        let src = write_src(&tmp, "hello.txt", b"hello\n");

        bs.ingest_file(BlobKind::Archive, &src, &cancel).unwrap();
        bs.ingest_file(BlobKind::Backup, &src, &cancel).unwrap();

        assert!(bs.path_for(BlobKind::Archive, HELLO_SHA).unwrap().exists());
        assert!(bs.path_for(BlobKind::Backup, HELLO_SHA).unwrap().exists());
        assert!(!bs.path_for(BlobKind::Override, HELLO_SHA).unwrap().exists());
    }
}
