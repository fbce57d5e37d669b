use crate::jobs::JobSetKind;
use std::path::{Path, PathBuf};

/// File layout inside the shared network directory.
#[derive(Debug, Clone)]
pub struct SharedPaths {
    /// The shared directory itself.
    pub dir: PathBuf,
    /// Serial ledger document.
    pub ledger: PathBuf,
    /// Lock marker guarding the ledger.
    pub ledger_lock: PathBuf,
    /// Lock marker guarding the shared job collections.
    pub jobs_lock: PathBuf,
}

impl SharedPaths {
    /// Compute the shared layout rooted at `dir`.
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            ledger: dir.join("serial_ledger.json"),
            ledger_lock: dir.join("serial_ledger.json.lock"),
            jobs_lock: dir.join("jobs.lock"),
        }
    }

    /// Shared job collection for `kind`.
    #[must_use]
    pub fn jobs(&self, kind: JobSetKind) -> PathBuf {
        self.dir.join(job_file_name(kind))
    }
}

/// File layout inside this machine's local data directory.
#[derive(Debug, Clone)]
pub struct LocalPaths {
    /// The local directory itself.
    pub dir: PathBuf,
    /// Sync metadata and pending deletion tombstones.
    pub sync_metadata: PathBuf,
}

impl LocalPaths {
    /// Compute the local layout rooted at `dir`.
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            sync_metadata: dir.join("sync_metadata.json"),
        }
    }

    /// Local job collection for `kind`.
    #[must_use]
    pub fn jobs(&self, kind: JobSetKind) -> PathBuf {
        self.dir.join(job_file_name(kind))
    }
}

const fn job_file_name(kind: JobSetKind) -> &'static str {
    match kind {
        JobSetKind::Active => "jobs_active.json",
        JobSetKind::Archived => "jobs_archived.json",
    }
}

/// Suffix for a quarantined corrupt file, e.g. `serial_ledger.json.corrupt-20260111T120000Z`.
#[must_use]
pub fn quarantine_path(path: &Path, stamp: &str) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "data".into(), |n| n.to_string_lossy().to_string());
    let safe: String = stamp
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    path.with_file_name(format!("{name}.corrupt-{safe}"))
}
