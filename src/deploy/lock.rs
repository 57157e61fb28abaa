//! Per-install exclusive apply lock.
//!
//! A filesystem lock under `tmp/locks/` serializes apply/unapply per game
//! install across processes. Held for the entire operation; released on
//! drop.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs4::FileExt;

use crate::errors::{Error, Result};

#[derive(Debug)]
pub struct InstallLock {
    file: File,
    path: PathBuf,
}

impl InstallLock {
    pub fn acquire(locks_dir: &Path, game_install_id: i64) -> Result<Self> {
        std::fs::create_dir_all(locks_dir)?;
        let path = locks_dir.join(format!("install-{game_install_id}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if let Err(err) = file.try_lock_exclusive() {
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Err(Error::validation(format!(
                    "another modctl operation is running for this install (lock {})",
                    path.display()
                )));
            }
            return Err(err.into());
        }
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lock_is_exclusive_per_install() {
        let tmp = TempDir::new().unwrap();
        let first = InstallLock::acquire(tmp.path(), 1).unwrap();
        assert!(first.path().exists());

        // Same install: refused while held.
        assert!(matches!(
            InstallLock::acquire(tmp.path(), 1),
            Err(Error::Validation(_))
        ));
        // Different install: independent lock.
        let other = InstallLock::acquire(tmp.path(), 2).unwrap();
        drop(other);

        drop(first);
        InstallLock::acquire(tmp.path(), 1).unwrap();
    }
}
