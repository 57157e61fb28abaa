//! Error taxonomy shared by the core engines.
//!
//! The CLI layer wraps these in `anyhow` for display; the core modules
//! return them directly so callers can distinguish validation problems
//! from corruption, drift, and cancellation.

use thiserror::Error;

use crate::pathsafe::PathRule;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Inputs violate a precondition (malformed selector, duplicate
    /// priority, missing active profile, ...).
    #[error("validation error: {0}")]
    Validation(String),

    /// A referenced entity is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// A cross-entity rule would be broken at commit time.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Blob hash or size mismatch, or metadata consistency failure.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// A candidate relative path failed a safety rule.
    #[error("unsafe path {path:?}: {rule}")]
    UnsafePath { path: String, rule: PathRule },

    /// On-disk state disagrees with tracked state.
    #[error("drift at {relpath}: {detail}")]
    Drift { relpath: String, detail: String },

    /// Two plan entries claim the same target path and priority cannot
    /// resolve them.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Cancellation signal observed.
    #[error("cancelled")]
    Cancelled,

    #[error("archiver failure: {0}")]
    Archiver(String),

    #[error(transparent)]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::Invariant(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Process exit code for the CLI: 1 for recoverable user errors,
    /// 2 for environment/state failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Validation(_)
            | Error::NotFound(_)
            | Error::Conflict(_)
            | Error::UnsafePath { .. }
            | Error::Drift { .. }
            | Error::Cancelled => 1,
            Error::Invariant(_)
            | Error::Corruption(_)
            | Error::Archiver(_)
            | Error::Db(_)
            | Error::Io(_) => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_split_user_and_environment_errors() {
        assert_eq!(Error::validation("bad selector").exit_code(), 1);
        assert_eq!(Error::Cancelled.exit_code(), 1);
        assert_eq!(Error::corruption("size mismatch").exit_code(), 2);
        assert_eq!(
            Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom")).exit_code(),
            2
        );
    }
}
