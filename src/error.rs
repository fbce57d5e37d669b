//! Error taxonomy for the coordination core.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for tagledger operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller supplied bad business data (quantity, UPC, EPC, job record).
    #[error("validation error: {0}")]
    Validation(String),

    /// The lock was not acquired within the retry budget.
    #[error("lock busy: {0}")]
    LockTimeout(String),

    /// The shared location is unreachable or not writable.
    #[error("shared storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Filesystem failure while reading or writing persisted state.
    #[error("{context}")]
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A persisted JSON file exists but cannot be parsed.
    #[error("corrupt file {}", path.display())]
    Corrupt {
        /// Path of the unreadable file.
        path: PathBuf,
        /// Parse failure.
        #[source]
        source: serde_json::Error,
    },

    /// Serializing in-memory state failed.
    #[error("serialize {what}")]
    Serialize {
        /// What was being serialized.
        what: &'static str,
        /// Underlying serde failure.
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// Wrap an I/O error with a human-readable context line.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the caller should simply try again later.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::LockTimeout(_) | Self::StorageUnavailable(_))
    }
}

/// Result type alias for tagledger operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::ensure;

    #[test]
    fn recoverable_kinds() -> anyhow::Result<()> {
        ensure!(Error::LockTimeout("x".into()).is_recoverable());
        ensure!(Error::StorageUnavailable("x".into()).is_recoverable());
        ensure!(!Error::Validation("x".into()).is_recoverable());
        let io = Error::io("read ledger", std::io::Error::other("boom"));
        ensure!(!io.is_recoverable());
        ensure!(io.to_string() == "read ledger");
        Ok(())
    }
}
