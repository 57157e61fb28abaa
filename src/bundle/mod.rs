//! State bundle export/import.
//!
//! A bundle is one compressed tar holding the metadata database, the
//! three blob directories, and a `manifest.json` with format and schema
//! versions plus per-kind blob counts. Import refuses bundles written by
//! a newer schema and refuses to clobber an existing state root.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::blobstore::BlobKind;
use crate::db::{now_iso, Database, SCHEMA_VERSION};
use crate::errors::{Error, Result};
use crate::pathsafe::sanitize_rel_path;

pub const BUNDLE_FORMAT_VERSION: i64 = 1;
const MANIFEST_NAME: &str = "manifest.json";
const DB_NAME: &str = "modctl.db";

#[derive(Debug, Serialize, Deserialize)]
pub struct BundleManifest {
    pub bundle_format_version: i64,
    pub schema_version: i64,
    pub blob_counts: HashMap<String, u64>,
    pub created_at: String,
}

/// Count blob files under one kind directory (two-level fan layout).
fn count_blobs(root: &Path) -> u64 {
    if !root.exists() {
        return 0;
    }
    WalkDir::new(root)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count() as u64
}

fn kind_dir_name(kind: BlobKind) -> &'static str {
    match kind {
        BlobKind::Archive => "archives",
        BlobKind::Backup => "backups",
        BlobKind::Override => "overrides",
    }
}

/// Export the state root (database plus blob directories) into a
/// compressed bundle at `out_path`.
pub fn export_bundle(db: &Database, state_root: &Path, out_path: &Path) -> Result<()> {
    db.checkpoint()?;

    let db_path = state_root.join(DB_NAME);
    if !db_path.is_file() {
        return Err(Error::not_found(format!(
            "no metadata store at {}",
            db_path.display()
        )));
    }

    let mut blob_counts = HashMap::new();
    for kind in BlobKind::all() {
        blob_counts.insert(
            kind.as_str().to_string(),
            count_blobs(&state_root.join(kind_dir_name(*kind))),
        );
    }
    let manifest = BundleManifest {
        bundle_format_version: BUNDLE_FORMAT_VERSION,
        schema_version: SCHEMA_VERSION,
        blob_counts,
        created_at: now_iso(),
    };
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| Error::validation(format!("serialize manifest: {e}")))?;

    let out = File::create(out_path)?;
    let gz = GzEncoder::new(out, Compression::default());
    let mut builder = tar::Builder::new(gz);

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(manifest_bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, MANIFEST_NAME, manifest_bytes.as_slice())?;

    builder.append_path_with_name(&db_path, DB_NAME)?;
    for kind in BlobKind::all() {
        let dir = state_root.join(kind_dir_name(*kind));
        if dir.exists() {
            builder.append_dir_all(kind_dir_name(*kind), &dir)?;
        }
    }

    let gz = builder
        .into_inner()
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    let file = gz.finish()?;
    file.sync_all()?;

    tracing::info!(bundle = %out_path.display(), "exported state bundle");
    Ok(())
}

/// Read only the manifest from a bundle.
pub fn read_manifest(bundle_path: &Path) -> Result<BundleManifest> {
    let file = File::open(bundle_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_str() == Some(MANIFEST_NAME) {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            return serde_json::from_slice(&bytes)
                .map_err(|e| Error::corruption(format!("invalid bundle manifest: {e}")));
        }
    }
    Err(Error::corruption("bundle has no manifest.json".to_string()))
}

/// Import a bundle into an empty state root.
pub fn import_bundle(bundle_path: &Path, state_root: &Path) -> Result<BundleManifest> {
    let manifest = read_manifest(bundle_path)?;
    if manifest.bundle_format_version > BUNDLE_FORMAT_VERSION {
        return Err(Error::validation(format!(
            "bundle format version {} is newer than supported {}",
            manifest.bundle_format_version, BUNDLE_FORMAT_VERSION
        )));
    }
    if manifest.schema_version > SCHEMA_VERSION {
        return Err(Error::validation(format!(
            "bundle schema version {} is newer than supported {}",
            manifest.schema_version, SCHEMA_VERSION
        )));
    }

    let db_path = state_root.join(DB_NAME);
    if db_path.exists() {
        return Err(Error::validation(format!(
            "refusing to import over existing state at {}",
            db_path.display()
        )));
    }
    std::fs::create_dir_all(state_root)?;

    let limits = crate::config::PathLimits::default();
    let file = File::open(bundle_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?.to_string_lossy().to_string();
        if raw == MANIFEST_NAME {
            continue;
        }

        // Only the shapes we wrote are allowed back out.
        let rel = sanitize_rel_path(&raw, &limits)?;
        let top = rel.as_str().split('/').next().unwrap_or("");
        let ok = rel.as_str() == DB_NAME
            || (matches!(top, "archives" | "backups" | "overrides") && rel.depth() <= 3);
        if !ok {
            return Err(Error::corruption(format!(
                "unexpected bundle entry: {raw:?}"
            )));
        }

        if entry.header().entry_type().is_dir() {
            std::fs::create_dir_all(state_root.join(rel.to_path_buf()))?;
            continue;
        }
        if !entry.header().entry_type().is_file() {
            return Err(Error::corruption(format!(
                "unexpected bundle entry type for {raw:?}"
            )));
        }
        let dest = state_root.join(rel.to_path_buf());
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&dest)?;
        std::io::copy(&mut entry, &mut out)?;
    }

    // Count sanity against the manifest.
    for kind in BlobKind::all() {
        let expected = manifest
            .blob_counts
            .get(kind.as_str())
            .copied()
            .unwrap_or(0);
        let actual = count_blobs(&state_root.join(kind_dir_name(*kind)));
        if expected != actual {
            return Err(Error::corruption(format!(
                "bundle promised {expected} {} blobs, extracted {actual}",
                kind.as_str()
            )));
        }
    }

    tracing::info!(bundle = %bundle_path.display(), "imported state bundle");
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::BlobStore;
    use crate::cancel::CancelToken;
    use tempfile::TempDir;

    fn seeded_state(tmp: &TempDir) -> (Database, std::path::PathBuf) {
        let state_root = tmp.path().join("state");
        std::fs::create_dir_all(&state_root).unwrap();
        let db = Database::open(&state_root.join(DB_NAME)).unwrap();

        let bs = BlobStore::new(
            state_root.join("archives"),
            state_root.join("backups"),
            state_root.join("overrides"),
            state_root.join("tmp"),
        );
        let src = tmp.path().join("hello.txt");
        std::fs::write(&src, b"hello\n").unwrap();
        let ingest = bs
            .ingest_file(BlobKind::Archive, &src, &CancelToken::new())
            .unwrap();
        db.ensure_blob_recorded(&ingest.sha256, BlobKind::Archive, 6, Some("hello.txt"))
            .unwrap();
        (db, state_root)
    }

    #[test]
    fn export_then_import_round_trips_state() {
        let tmp = TempDir::new().unwrap();
        let (db, state_root) = seeded_state(&tmp);

        let bundle = tmp.path().join("state.tar.gz");
        export_bundle(&db, &state_root, &bundle).unwrap();
        drop(db);

        let manifest = read_manifest(&bundle).unwrap();
        assert_eq!(manifest.bundle_format_version, BUNDLE_FORMAT_VERSION);
        assert_eq!(manifest.schema_version, SCHEMA_VERSION);
        assert_eq!(manifest.blob_counts["archive"], 1);
        assert_eq!(manifest.blob_counts["backup"], 0);

        let restore_root = tmp.path().join("restore");
        import_bundle(&bundle, &restore_root).unwrap();

        // The database opens and the blob file landed in the fan layout.
        let restored = Database::open(&restore_root.join(DB_NAME)).unwrap();
        let blobs = restored.list_blobs_by_kind(BlobKind::Archive).unwrap();
        assert_eq!(blobs.len(), 1);
        let blob_path = restore_root
            .join("archives")
            .join(&blobs[0].sha256[..2])
            .join(&blobs[0].sha256);
        assert_eq!(std::fs::read(blob_path).unwrap(), b"hello\n");
    }

    #[test]
    fn import_refuses_newer_schema() {
        let tmp = TempDir::new().unwrap();
        let (db, state_root) = seeded_state(&tmp);
        let bundle = tmp.path().join("state.tar.gz");
        export_bundle(&db, &state_root, &bundle).unwrap();
        drop(db);

        // Rewrite the manifest with a future schema version.
        let mut manifest = read_manifest(&bundle).unwrap();
        manifest.schema_version = SCHEMA_VERSION + 1;

        let rebuilt = tmp.path().join("future.tar.gz");
        {
            let out = File::create(&rebuilt).unwrap();
            let gz = GzEncoder::new(out, Compression::default());
            let mut builder = tar::Builder::new(gz);
            let bytes = serde_json::to_vec(&manifest).unwrap();
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, MANIFEST_NAME, bytes.as_slice())
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let restore_root = tmp.path().join("restore");
        assert!(matches!(
            import_bundle(&rebuilt, &restore_root),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn import_refuses_existing_state() {
        let tmp = TempDir::new().unwrap();
        let (db, state_root) = seeded_state(&tmp);
        let bundle = tmp.path().join("state.tar.gz");
        export_bundle(&db, &state_root, &bundle).unwrap();
        drop(db);

        // Importing back over the same root must refuse.
        assert!(matches!(
            import_bundle(&bundle, &state_root),
            Err(Error::Validation(_))
        ));
    }
}
