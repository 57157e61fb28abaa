//! External archiver collaborator.
//!
//! modctl never decompresses archives in-process; listing and extraction
//! go through `bsdtar` so every format the host libarchive understands
//! works the same way. Both capabilities honor a timeout and the shared
//! cancellation token.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::errors::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Link,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    pub kind: EntryKind,
}

#[derive(Debug, Clone)]
pub struct Archiver {
    bin: String,
    list_timeout: Duration,
    extract_timeout: Duration,
}

impl Archiver {
    pub fn new(bin: impl Into<String>, list_timeout: Duration, extract_timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            list_timeout,
            extract_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.bsdtar.clone(),
            Duration::from_secs(config.list_timeout_secs),
            Duration::from_secs(config.extract_timeout_secs),
        )
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }

    /// List archive entries with their kinds. Fails with `Archiver` when
    /// the input cannot be listed (not an archive, unsupported format).
    pub async fn list(&self, archive: &Path, cancel: &CancelToken) -> Result<Vec<ArchiveEntry>> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-tvf").arg(archive);
        let output = run_capture(cmd, self.list_timeout, cancel).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Archiver(format!(
                "{} -tvf failed: {}",
                self.bin,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().filter_map(parse_listing_line).collect())
    }

    /// Quick validation: can the archiver list this file at all?
    pub async fn can_list(&self, archive: &Path, cancel: &CancelToken) -> Result<bool> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-tf").arg(archive);
        match run_capture(cmd, self.list_timeout, cancel).await {
            Ok(output) => Ok(output.status.success()),
            Err(Error::Archiver(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Extract the full archive into `dest_dir`.
    pub async fn extract(
        &self,
        archive: &Path,
        dest_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<()> {
        std::fs::create_dir_all(dest_dir)?;
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-xf")
            .arg(archive)
            .arg("-C")
            .arg(dest_dir)
            // Refuse to materialize anything surprising even though the
            // planner already filtered entry kinds.
            .arg("--no-same-owner")
            .arg("--no-same-permissions");
        let output = run_capture(cmd, self.extract_timeout, cancel).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Archiver(format!(
                "{} -xf failed: {}",
                self.bin,
                stderr.trim()
            )));
        }
        Ok(())
    }

    /// `bsdtar --version`, for doctor.
    pub async fn version(&self, cancel: &CancelToken) -> Result<String> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("--version");
        let output = run_capture(cmd, Duration::from_secs(3), cancel).await?;
        if !output.status.success() {
            return Err(Error::Archiver(format!("{} --version failed", self.bin)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Parse one `bsdtar -tv` line into an entry. The mode string's first
/// character carries the kind; the name is everything after the date
/// columns, with any symlink arrow stripped.
fn parse_listing_line(line: &str) -> Option<ArchiveEntry> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let kind = match trimmed.as_bytes()[0] {
        b'-' => EntryKind::Regular,
        b'd' => EntryKind::Directory,
        b'l' | b'h' => EntryKind::Link,
        _ => EntryKind::Other,
    };

    // ls -l style columns: mode, links, owner, group, size, month, day,
    // time/year, name...
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    if fields.len() < 9 {
        return None;
    }
    let mut name = fields[8..].join(" ");
    if kind == EntryKind::Link {
        if let Some(pos) = name.find(" -> ") {
            name.truncate(pos);
        }
    }
    let name = name.trim_end_matches('/').to_string();
    if name.is_empty() {
        return None;
    }

    Some(ArchiveEntry { path: name, kind })
}

/// Run a command to completion, capturing output, bounded by a timeout
/// and the cancellation token. The child is killed if either fires.
async fn run_capture(
    mut cmd: Command,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<std::process::Output> {
    cancel.check()?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = cmd
        .spawn()
        .map_err(|e| Error::Archiver(format!("failed to spawn archiver: {e}")))?;

    tokio::select! {
        res = tokio::time::timeout(timeout, child.wait_with_output()) => match res {
            Ok(output) => Ok(output?),
            Err(_) => Err(Error::Archiver(format!(
                "archiver timed out after {}s",
                timeout.as_secs()
            ))),
        },
        _ = wait_cancelled(cancel) => Err(Error::Cancelled),
    }
}

async fn wait_cancelled(cancel: &CancelToken) {
    while !cancel.is_cancelled() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_regular_entries() {
        let entry =
            parse_listing_line("-rw-r--r--  0 root   root        6 Jan 01  2024 hello.txt")
                .unwrap();
        assert_eq!(entry.path, "hello.txt");
        assert_eq!(entry.kind, EntryKind::Regular);
    }

    #[test]
    fn parses_directories_and_strips_trailing_slash() {
        let entry =
            parse_listing_line("drwxr-xr-x  0 root   root        0 Jan 01  2024 textures/")
                .unwrap();
        assert_eq!(entry.path, "textures");
        assert_eq!(entry.kind, EntryKind::Directory);
    }

    #[test]
    fn parses_symlinks_without_the_target() {
        let entry = parse_listing_line(
            "lrwxrwxrwx  0 root   root        0 Jan 01  2024 link.txt -> ../escape.txt",
        )
        .unwrap();
        assert_eq!(entry.path, "link.txt");
        assert_eq!(entry.kind, EntryKind::Link);
    }

    #[test]
    fn unknown_modes_map_to_other() {
        let entry =
            parse_listing_line("crw-rw-rw-  0 root   root      1,3 Jan 01  2024 dev/null")
                .unwrap();
        assert_eq!(entry.kind, EntryKind::Other);
    }

    #[test]
    fn skips_blank_and_malformed_lines() {
        assert!(parse_listing_line("").is_none());
        assert!(parse_listing_line("   ").is_none());
        assert!(parse_listing_line("-rw-r--r-- root").is_none());
    }
}
