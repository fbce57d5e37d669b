//! JSON persistence helpers shared by the ledger and the job collections.
//!
//! Every write goes to a temp file beside its target and is moved into place
//! with `rename`, so readers see either the old or the new document.

use crate::error::{Error, Result};
use crate::id;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Format a wall-clock instant as an RFC 3339 UTC timestamp.
///
/// # Errors
/// Returns an error if the instant cannot be represented.
pub fn rfc3339(at: SystemTime) -> Result<String> {
    OffsetDateTime::from(at)
        .format(&Rfc3339)
        .map_err(|err| Error::io("format RFC3339 timestamp", std::io::Error::other(err)))
}

/// Parse an RFC 3339 timestamp written by [`rfc3339`].
///
/// # Errors
/// Returns a validation error for malformed input.
pub fn parse_rfc3339(raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .map_err(|err| Error::Validation(format!("invalid timestamp {raw:?}: {err}")))
}

/// Read and parse a JSON document. A missing file is `Ok(None)`.
///
/// # Errors
/// Returns [`Error::Corrupt`] for unparseable content and [`Error::Io`] for read failures.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(Error::io(format!("read {}", path.display()), err)),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| Error::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Pretty-print `value` as JSON with a trailing newline.
///
/// # Errors
/// Returns an error if serialization fails.
pub fn to_json_bytes<T: Serialize>(value: &T, what: &'static str) -> Result<Vec<u8>> {
    let mut body =
        serde_json::to_vec_pretty(value).map_err(|source| Error::Serialize { what, source })?;
    body.push(b'\n');
    Ok(body)
}

fn temp_path_for(target: &Path, token: &str) -> PathBuf {
    let name = target
        .file_name()
        .map_or_else(|| "data".into(), |n| n.to_string_lossy().to_string());
    target.with_file_name(format!("{name}.tmp.{token}"))
}

fn replace(tmp: &Path, target: &Path) -> Result<()> {
    // Unix rename() replaces the destination atomically; Windows refuses, so clear it first.
    #[cfg(windows)]
    {
        if target.exists() {
            fs::remove_file(target)
                .map_err(|err| Error::io(format!("remove {}", target.display()), err))?;
        }
    }
    fs::rename(tmp, target).map_err(|err| {
        Error::io(
            format!("replace {} via {}", target.display(), tmp.display()),
            err,
        )
    })
}

/// Write `value` to `path` via temp file and atomic rename.
///
/// # Errors
/// Returns an error if serialization, the temp write or the rename fails.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T, what: &'static str) -> Result<()> {
    let body = to_json_bytes(value, what)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| Error::io(format!("create dir {}", parent.display()), err))?;
    }
    let tmp = temp_path_for(path, &id::token8()?);
    if let Err(err) = fs::write(&tmp, &body) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::io(format!("write temp file {}", tmp.display()), err));
    }
    replace(&tmp, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })
}

/// A set of documents that should land together.
///
/// All bodies are written to temp files first. Only when every temp write
/// succeeded are they renamed over their targets. A failed staging step
/// discards every temp file and leaves all targets untouched.
#[derive(Debug, Default)]
pub struct StagedWrites {
    pending: Vec<(PathBuf, Vec<u8>)>,
}

impl StagedWrites {
    /// Empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `value` for `path`.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn add<T: Serialize>(&mut self, path: PathBuf, value: &T, what: &'static str) -> Result<()> {
        let body = to_json_bytes(value, what)?;
        self.pending.push((path, body));
        Ok(())
    }

    /// Number of queued documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Stage every document, then commit them all.
    ///
    /// # Errors
    /// Returns the first staging or commit failure. Staging failures leave all
    /// targets unchanged; a rename failure part-way through is reported and the
    /// remaining temp files are removed.
    pub fn commit(self) -> Result<()> {
        let token = id::token8()?;
        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(self.pending.len());

        for (target, body) in &self.pending {
            let tmp = temp_path_for(target, &token);
            let written = target
                .parent()
                .map_or(Ok(()), fs::create_dir_all)
                .and_then(|()| fs::write(&tmp, body));
            if let Err(err) = written {
                let _ = fs::remove_file(&tmp);
                discard(&staged);
                return Err(Error::io(format!("stage {}", target.display()), err));
            }
            staged.push((tmp, target.clone()));
        }

        for (idx, (tmp, target)) in staged.iter().enumerate() {
            if let Err(err) = replace(tmp, target) {
                if let Some(rest) = staged.get(idx..) {
                    discard(rest);
                }
                tracing::error!(
                    target_file = %target.display(),
                    committed = idx,
                    total = staged.len(),
                    "commit interrupted after partial rename"
                );
                return Err(err);
            }
        }
        Ok(())
    }
}

fn discard(staged: &[(PathBuf, PathBuf)]) {
    for (tmp, _) in staged {
        let _ = fs::remove_file(tmp);
    }
}

/// Check that `dir` exists, is a directory, and accepts new files.
///
/// # Errors
/// Returns [`Error::StorageUnavailable`] describing what is wrong.
pub fn ensure_writable_dir(dir: &Path) -> Result<()> {
    let meta = fs::metadata(dir).map_err(|err| {
        Error::StorageUnavailable(format!("{} is not reachable: {err}", dir.display()))
    })?;
    if !meta.is_dir() {
        return Err(Error::StorageUnavailable(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    let probe = dir.join(format!(".tagledger-probe.{}", id::token8()?));
    fs::write(&probe, b"probe").map_err(|err| {
        Error::StorageUnavailable(format!("{} is not writable: {err}", dir.display()))
    })?;
    let _ = fs::remove_file(&probe);
    Ok(())
}
