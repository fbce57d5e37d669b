//! Two-way sync of the job collections between this machine and the share.
//!
//! One sync pass takes the shared `jobs.lock`, loads local and shared copies of
//! both collections, merges each pair and writes the merged result to all four
//! files. Deletions made locally are remembered as tombstones in
//! `sync_metadata.json` until a sync has carried them to the share.

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::jobs::{self, JobRecord, JobSet, JobSetKind, MergeOutcome, MergeStats, Signature};
use crate::lock::{FileLock, LockAttempt, LockGuard, LockPolicy};
use crate::paths::{self, LocalPaths, SharedPaths};
use crate::retry::Clock;
use crate::store::{self, StagedWrites};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Signatures deleted locally and not yet propagated, per collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstones {
    /// Deleted active jobs.
    #[serde(default)]
    pub active: BTreeSet<Signature>,
    /// Deleted archived jobs.
    #[serde(default)]
    pub archived: BTreeSet<Signature>,
}

impl Tombstones {
    /// Tombstones for one collection.
    #[must_use]
    pub const fn get(&self, kind: JobSetKind) -> &BTreeSet<Signature> {
        match kind {
            JobSetKind::Active => &self.active,
            JobSetKind::Archived => &self.archived,
        }
    }

    fn get_mut(&mut self, kind: JobSetKind) -> &mut BTreeSet<Signature> {
        match kind {
            JobSetKind::Active => &mut self.active,
            JobSetKind::Archived => &mut self.archived,
        }
    }

    /// Total pending tombstones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len() + self.archived.len()
    }

    /// Whether no deletion is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.archived.is_empty()
    }
}

/// Per-machine sync bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// RFC 3339 time of the last attempted sync.
    #[serde(default)]
    pub last_sync: Option<String>,
    /// Whether that attempt completed.
    #[serde(default)]
    pub last_sync_success: bool,
    /// Completed syncs.
    #[serde(default)]
    pub sync_count: u64,
    /// Operator who last synced from this machine.
    #[serde(default)]
    pub user_name: String,
    /// Collisions with differing fields resolved over all syncs.
    #[serde(default)]
    pub conflicts_resolved: u64,
    /// Pending deletions.
    #[serde(default)]
    pub deleted_jobs: Tombstones,
}

/// How a sync ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// All four collections were written.
    Synced,
    /// Another machine held the jobs lock for the whole retry budget.
    Busy,
    /// The shared folder is unreachable or read-only.
    StorageUnavailable,
    /// The lock wait was cancelled.
    Cancelled,
    /// Reading, validating or writing failed.
    Failed,
}

impl SyncStatus {
    /// Whether trying again later may succeed without intervention.
    #[must_use]
    pub const fn is_recoverable(self) -> bool {
        matches!(self, Self::Busy | Self::StorageUnavailable)
    }
}

/// Merge counters for both collections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Active collection.
    pub active: MergeStats,
    /// Archived collection.
    pub archived: MergeStats,
}

impl SyncStats {
    /// Conflicts across both collections.
    #[must_use]
    pub const fn conflicts(&self) -> usize {
        self.active.conflicts + self.archived.conflicts
    }
}

/// What [`JobSynchronizer::sync`] reports.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    /// True only for [`SyncStatus::Synced`].
    pub success: bool,
    /// Outcome kind.
    pub status: SyncStatus,
    /// Merge counters when the merge ran.
    pub stats: Option<SyncStats>,
    /// Operator-facing summary.
    pub message: String,
}

impl SyncResult {
    fn unsuccessful(status: SyncStatus, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status,
            stats: None,
            message: message.into(),
        }
    }
}

/// Merges local and shared job collections under the shared jobs lock.
#[derive(Debug, Clone)]
pub struct JobSynchronizer {
    shared: SharedPaths,
    local: LocalPaths,
    identity: Identity,
    policy: LockPolicy,
    clock: Arc<dyn Clock>,
}

impl JobSynchronizer {
    /// Synchronizer between `local_dir` and `shared_dir`.
    #[must_use]
    pub fn new(
        shared_dir: &Path,
        local_dir: &Path,
        identity: Identity,
        policy: LockPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: SharedPaths::new(shared_dir),
            local: LocalPaths::new(local_dir),
            identity,
            policy,
            clock,
        }
    }

    /// Whether the shared folder exists and accepts writes.
    #[must_use]
    pub fn is_shared_available(&self) -> bool {
        store::ensure_writable_dir(&self.shared.dir).is_ok()
    }

    /// Run one full sync pass. Never returns an error; every failure is a
    /// [`SyncResult`] with `success == false`.
    pub fn sync(&self) -> SyncResult {
        if let Err(err) = store::ensure_writable_dir(&self.shared.dir) {
            tracing::warn!("job sync skipped: {err}");
            return SyncResult::unsuccessful(SyncStatus::StorageUnavailable, err.to_string());
        }

        let guard = match self.jobs_lock().acquire(&self.policy) {
            Ok(LockAttempt::Acquired(guard)) => guard,
            Ok(LockAttempt::TimedOut { attempts }) => {
                return SyncResult::unsuccessful(
                    SyncStatus::Busy,
                    format!("another user is syncing jobs ({attempts} attempts); try again shortly"),
                );
            }
            Ok(LockAttempt::Cancelled) => {
                return SyncResult::unsuccessful(SyncStatus::Cancelled, "job sync cancelled");
            }
            Err(err) => {
                self.record_failure();
                return SyncResult::unsuccessful(SyncStatus::Failed, err.to_string());
            }
        };

        let outcome = self.merge_and_write();
        if let Err(err) = &outcome {
            tracing::error!("job sync failed: {err}");
            self.record_failure();
        }
        release(Some(guard));

        match outcome {
            Ok(stats) => {
                tracing::info!(
                    active = stats.active.merged,
                    archived = stats.archived.merged,
                    conflicts = stats.conflicts(),
                    "jobs synced"
                );
                SyncResult {
                    success: true,
                    status: SyncStatus::Synced,
                    message: format!(
                        "synced {} active and {} archived jobs ({} conflicts resolved)",
                        stats.active.merged,
                        stats.archived.merged,
                        stats.conflicts()
                    ),
                    stats: Some(stats),
                }
            }
            Err(err) => SyncResult::unsuccessful(SyncStatus::Failed, err.to_string()),
        }
    }

    /// Merge one collection pair using this machine's tombstones for `kind`.
    ///
    /// # Errors
    /// Returns an error if the sync metadata cannot be read or is corrupt.
    pub fn merge(&self, local: &JobSet, shared: &JobSet, kind: JobSetKind) -> Result<MergeOutcome> {
        let meta = self.read_metadata()?;
        let stamp = store::rfc3339(self.clock.now())?;
        Ok(jobs::merge(local, shared, meta.deleted_jobs.get(kind), &stamp))
    }

    /// Remember that `job` was deleted locally so the next sync does not bring
    /// it back. Returns `false` if it was already tracked.
    ///
    /// Takes the jobs lock while the shared folder is reachable, so a deletion
    /// never lands in the middle of a sync.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] for a record with a blank signature,
    /// [`Error::LockTimeout`] if a sync holds the lock for the whole retry
    /// budget, or an error if the metadata is corrupt or cannot be written.
    pub fn track_deletion(&self, job: &JobRecord, kind: JobSetKind) -> Result<bool> {
        self.track_signature(job.signature(), kind)
    }

    /// [`Self::track_deletion`] by signature.
    ///
    /// # Errors
    /// As for [`Self::track_deletion`].
    pub fn track_signature(&self, sig: Signature, kind: JobSetKind) -> Result<bool> {
        ensure_trackable(&sig)?;
        let guard = self.lock_for_edit()?;
        let tracked = self
            .read_metadata()
            .and_then(|mut meta| self.add_tombstone(&mut meta, sig, kind));
        release(guard);
        tracked
    }

    /// Remove a job from the local collection and track the deletion, both
    /// under the jobs lock. Returns whether a local record was removed.
    ///
    /// # Errors
    /// As for [`Self::track_deletion`], plus an error if the local collection
    /// is unreadable or cannot be written.
    pub fn delete_local(&self, sig: &Signature, kind: JobSetKind) -> Result<bool> {
        ensure_trackable(sig)?;
        let guard = self.lock_for_edit()?;
        let outcome = self.remove_and_track(sig, kind);
        release(guard);
        outcome
    }

    /// This machine's sync bookkeeping.
    ///
    /// A corrupt metadata file is moved aside and fresh bookkeeping is
    /// returned; pending deletions it held are lost with a warning.
    ///
    /// # Errors
    /// Returns an error if the metadata file exists but cannot be read or
    /// moved aside.
    pub fn metadata(&self) -> Result<SyncMetadata> {
        self.load_or_quarantine_metadata()
    }

    fn jobs_lock(&self) -> FileLock {
        FileLock::new(
            &self.shared.jobs_lock,
            self.identity.user.clone(),
            self.clock.clone(),
        )
    }

    fn lock_for_edit(&self) -> Result<Option<LockGuard>> {
        // No sync from this machine can start while the share is unreachable.
        if !self.is_shared_available() {
            tracing::debug!("shared folder unavailable; editing local jobs without the jobs lock");
            return Ok(None);
        }
        match self.jobs_lock().acquire(&self.policy)? {
            LockAttempt::Acquired(guard) => Ok(Some(guard)),
            LockAttempt::TimedOut { attempts } => Err(Error::LockTimeout(format!(
                "another user is syncing jobs ({attempts} attempts); try again shortly"
            ))),
            LockAttempt::Cancelled => Err(Error::LockTimeout(
                "wait for the jobs lock was cancelled".into(),
            )),
        }
    }

    fn remove_and_track(&self, sig: &Signature, kind: JobSetKind) -> Result<bool> {
        let mut meta = self.read_metadata()?;
        let path = self.local.jobs(kind);
        let records = load_records(&path)?;
        let before = records.len();
        let kept: Vec<JobRecord> = records
            .into_iter()
            .filter(|r| r.signature() != *sig)
            .collect();
        let removed = kept.len() != before;
        if removed {
            store::write_json_atomic(&path, &kept, "local jobs")?;
        }
        self.add_tombstone(&mut meta, sig.clone(), kind)?;
        Ok(removed)
    }

    fn add_tombstone(&self, meta: &mut SyncMetadata, sig: Signature, kind: JobSetKind) -> Result<bool> {
        if !meta.deleted_jobs.get_mut(kind).insert(sig.clone()) {
            return Ok(false);
        }
        store::write_json_atomic(&self.local.sync_metadata, meta, "sync metadata")?;
        tracing::debug!(signature = %sig, set = %kind, "tracked job deletion");
        Ok(true)
    }

    fn merge_and_write(&self) -> Result<SyncStats> {
        let stamp = store::rfc3339(self.clock.now())?;
        let applied = self.read_metadata()?.deleted_jobs;
        let mut stats = SyncStats::default();
        let mut batch = StagedWrites::new();

        for kind in JobSetKind::ALL {
            let local = load_set(&self.local.jobs(kind))?;
            let shared = load_set(&self.shared.jobs(kind))?;
            let MergeOutcome { merged, stats: merge_stats } =
                jobs::merge(&local, &shared, applied.get(kind), &stamp);
            match kind {
                JobSetKind::Active => stats.active = merge_stats,
                JobSetKind::Archived => stats.archived = merge_stats,
            }
            let records = merged.into_records();
            batch.add(self.local.jobs(kind), &records, "local jobs")?;
            batch.add(self.shared.jobs(kind), &records, "shared jobs")?;
        }
        batch.commit()?;

        // Only the tombstones this pass applied are done; keep any added since.
        let mut meta = self.read_metadata()?;
        for kind in JobSetKind::ALL {
            let done = applied.get(kind);
            meta.deleted_jobs.get_mut(kind).retain(|sig| !done.contains(sig));
        }
        meta.last_sync = Some(stamp);
        meta.last_sync_success = true;
        meta.sync_count = meta.sync_count.saturating_add(1);
        meta.conflicts_resolved = meta
            .conflicts_resolved
            .saturating_add(u64::try_from(stats.conflicts()).map_or(u64::MAX, |n| n));
        meta.user_name.clone_from(&self.identity.user);
        store::write_json_atomic(&self.local.sync_metadata, &meta, "sync metadata")?;
        Ok(stats)
    }

    fn record_failure(&self) {
        let updated = self.read_metadata().and_then(|mut meta| {
            meta.last_sync = Some(store::rfc3339(self.clock.now())?);
            meta.last_sync_success = false;
            meta.user_name.clone_from(&self.identity.user);
            store::write_json_atomic(&self.local.sync_metadata, &meta, "sync metadata")
        });
        if let Err(err) = updated {
            tracing::warn!("could not record failed sync: {err}");
        }
    }

    /// Metadata for anything that acts on tombstones. Corrupt metadata is an
    /// error here: guessing "no deletions" would resurrect deleted jobs.
    fn read_metadata(&self) -> Result<SyncMetadata> {
        Ok(store::read_json::<SyncMetadata>(&self.local.sync_metadata)?
            .map_or_else(|| self.fresh_metadata(), |meta| meta))
    }

    fn fresh_metadata(&self) -> SyncMetadata {
        SyncMetadata {
            user_name: self.identity.user.clone(),
            ..SyncMetadata::default()
        }
    }

    fn load_or_quarantine_metadata(&self) -> Result<SyncMetadata> {
        match self.read_metadata() {
            Err(Error::Corrupt { path, source }) => {
                let stamp = store::rfc3339(self.clock.now())?;
                let quarantine = paths::quarantine_path(&path, &stamp);
                tracing::warn!(
                    metadata = %path.display(),
                    moved_to = %quarantine.display(),
                    "sync metadata corrupt; pending deletions are lost: {source}"
                );
                fs::rename(&path, &quarantine).map_err(|err| {
                    Error::io(format!("quarantine corrupt metadata {}", path.display()), err)
                })?;
                Ok(self.fresh_metadata())
            }
            other => other,
        }
    }
}

fn ensure_trackable(sig: &Signature) -> Result<()> {
    if sig.is_blank() {
        return Err(Error::Validation(
            "cannot track deletion of a job with no customer, ticket or PO".into(),
        ));
    }
    Ok(())
}

fn release(guard: Option<LockGuard>) {
    if let Some(Err(err)) = guard.map(LockGuard::release) {
        tracing::warn!("jobs lock release failed: {err}");
    }
}

fn load_records(path: &Path) -> Result<Vec<JobRecord>> {
    Ok(store::read_json::<Vec<JobRecord>>(path)?.map_or_else(Vec::new, |records| records))
}

fn load_set(path: &Path) -> Result<JobSet> {
    JobSet::from_records(load_records(path)?).map_err(|err| match err {
        Error::Validation(msg) => Error::Validation(format!("{}: {msg}", path.display())),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{RetryPolicy, SystemClock};
    use anyhow::{bail, ensure};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _root: TempDir,
        shared: std::path::PathBuf,
        local: std::path::PathBuf,
    }

    fn fixture() -> anyhow::Result<Fixture> {
        let root = tempdir()?;
        let shared = root.path().join("share");
        let local = root.path().join("local");
        fs::create_dir_all(&shared)?;
        fs::create_dir_all(&local)?;
        Ok(Fixture {
            _root: root,
            shared,
            local,
        })
    }

    fn synchronizer(fx: &Fixture) -> JobSynchronizer {
        JobSynchronizer::new(
            &fx.shared,
            &fx.local,
            Identity::new("alice", "press-1"),
            LockPolicy::new(
                RetryPolicy::new(2, Duration::from_millis(5), Duration::ZERO),
                Duration::from_secs(20),
            ),
            Arc::new(SystemClock),
        )
    }

    fn write(path: &Path, records: &[JobRecord]) -> anyhow::Result<()> {
        fs::write(path, serde_json::to_string(records)?)?;
        Ok(())
    }

    fn read(path: &Path) -> anyhow::Result<Vec<JobRecord>> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    #[test]
    fn sync_writes_merged_result_everywhere() -> anyhow::Result<()> {
        let fx = fixture()?;
        write(
            &fx.local.join("jobs_active.json"),
            &[JobRecord::new("Acme", "T1", "P1", "New")],
        )?;
        write(
            &fx.shared.join("jobs_active.json"),
            &[
                JobRecord::new("Acme", "T1", "P1", "Completed"),
                JobRecord::new("Beta", "T2", "P2", "New"),
            ],
        )?;

        let sync = synchronizer(&fx);
        let result = sync.sync();
        ensure!(result.success, "sync failed: {}", result.message);
        let Some(stats) = result.stats else {
            bail!("missing stats");
        };
        ensure!(stats.conflicts() == 1);
        ensure!(stats.active.merged == 2);

        let local = read(&fx.local.join("jobs_active.json"))?;
        let shared = read(&fx.shared.join("jobs_active.json"))?;
        ensure!(local == shared);
        ensure!(local.first().and_then(JobRecord::status).as_deref() == Some("Completed"));
        ensure!(read(&fx.shared.join("jobs_archived.json"))?.is_empty());
        ensure!(!fx.shared.join("jobs.lock").exists());

        let meta = sync.metadata()?;
        ensure!(meta.sync_count == 1 && meta.last_sync_success);
        ensure!(meta.conflicts_resolved == 1);
        ensure!(meta.user_name == "alice");
        Ok(())
    }

    #[test]
    fn tombstone_blocks_resurrection_then_clears() -> anyhow::Result<()> {
        let fx = fixture()?;
        let doomed = JobRecord::new("Beta", "T2", "P2", "New");
        write(&fx.shared.join("jobs_active.json"), &[doomed.clone()])?;
        write(&fx.local.join("jobs_active.json"), &[])?;

        let sync = synchronizer(&fx);
        ensure!(sync.track_deletion(&doomed, JobSetKind::Active)?);
        ensure!(!sync.track_deletion(&doomed, JobSetKind::Active)?);
        ensure!(sync.metadata()?.deleted_jobs.len() == 1);

        ensure!(sync.sync().success);
        ensure!(read(&fx.shared.join("jobs_active.json"))?.is_empty());
        ensure!(read(&fx.local.join("jobs_active.json"))?.is_empty());
        ensure!(sync.metadata()?.deleted_jobs.is_empty());
        Ok(())
    }

    #[test]
    fn busy_lock_is_recoverable_and_leaves_files_alone() -> anyhow::Result<()> {
        let fx = fixture()?;
        write(&fx.local.join("jobs_active.json"), &[JobRecord::new("Acme", "T1", "P1", "New")])?;

        let sync = synchronizer(&fx);
        sync.track_signature(Signature::new("Gone", "", ""), JobSetKind::Archived)?;
        fs::write(fx.shared.join("jobs.lock"), "Locked by bob at now\n")?;
        let result = sync.sync();
        ensure!(result.status == SyncStatus::Busy);
        ensure!(result.status.is_recoverable());
        ensure!(!fx.shared.join("jobs_active.json").exists());
        ensure!(sync.metadata()?.deleted_jobs.len() == 1);
        Ok(())
    }

    #[test]
    fn unreachable_share_is_reported() -> anyhow::Result<()> {
        let fx = fixture()?;
        let sync = JobSynchronizer::new(
            &fx.shared.join("missing"),
            &fx.local,
            Identity::new("alice", "press-1"),
            LockPolicy::default(),
            Arc::new(SystemClock),
        );
        ensure!(!sync.is_shared_available());
        ensure!(sync.sync().status == SyncStatus::StorageUnavailable);
        ensure!(synchronizer(&fx).is_shared_available());
        Ok(())
    }

    #[test]
    fn corrupt_collection_fails_without_clearing_tombstones() -> anyhow::Result<()> {
        let fx = fixture()?;
        fs::write(fx.shared.join("jobs_archived.json"), "[{")?;
        let sync = synchronizer(&fx);
        sync.track_signature(Signature::new("Acme", "T1", ""), JobSetKind::Active)?;

        let result = sync.sync();
        ensure!(result.status == SyncStatus::Failed);
        ensure!(result.message.contains("jobs_archived.json"));
        let meta = sync.metadata()?;
        ensure!(!meta.last_sync_success && meta.sync_count == 0);
        ensure!(meta.deleted_jobs.len() == 1);
        ensure!(!fx.shared.join("jobs.lock").exists());
        Ok(())
    }

    #[test]
    fn blank_signature_record_fails_sync() -> anyhow::Result<()> {
        let fx = fixture()?;
        write(&fx.local.join("jobs_active.json"), &[JobRecord::new("", "", "", "New")])?;
        let result = synchronizer(&fx).sync();
        ensure!(result.status == SyncStatus::Failed);
        ensure!(result.message.contains("jobs_active.json"));
        Ok(())
    }

    #[test]
    fn delete_local_removes_and_tracks() -> anyhow::Result<()> {
        let fx = fixture()?;
        write(
            &fx.local.join("jobs_archived.json"),
            &[
                JobRecord::new("Acme", "T1", "P1", "Completed"),
                JobRecord::new("Beta", "T2", "P2", "Completed"),
            ],
        )?;
        let sync = synchronizer(&fx);
        let sig = Signature::new("Acme", "T1", "P1");
        ensure!(sync.delete_local(&sig, JobSetKind::Archived)?);
        ensure!(read(&fx.local.join("jobs_archived.json"))?.len() == 1);
        ensure!(sync.metadata()?.deleted_jobs.get(JobSetKind::Archived).contains(&sig));
        ensure!(!sync.delete_local(&sig, JobSetKind::Archived)?);
        ensure!(matches!(
            sync.track_signature(Signature::new("", "", ""), JobSetKind::Active),
            Err(Error::Validation(_))
        ));
        Ok(())
    }

    #[test]
    fn deletion_waits_for_the_jobs_lock() -> anyhow::Result<()> {
        let fx = fixture()?;
        let beta = JobRecord::new("Beta", "T2", "P2", "New");
        write(&fx.local.join("jobs_active.json"), &[beta.clone()])?;
        fs::write(
            fx.shared.join("jobs.lock"),
            "Locked by bob at 2026-01-11T00:00:00Z (token cafef00d)\n",
        )?;

        let sync = synchronizer(&fx);
        ensure!(matches!(
            sync.delete_local(&beta.signature(), JobSetKind::Active),
            Err(Error::LockTimeout(_))
        ));
        ensure!(matches!(
            sync.track_deletion(&beta, JobSetKind::Active),
            Err(Error::LockTimeout(_))
        ));
        ensure!(read(&fx.local.join("jobs_active.json"))? == vec![beta]);
        ensure!(sync.metadata()?.deleted_jobs.is_empty());
        ensure!(fx.shared.join("jobs.lock").exists());
        Ok(())
    }

    #[test]
    fn offline_deletion_needs_no_lock() -> anyhow::Result<()> {
        let fx = fixture()?;
        let beta = JobRecord::new("Beta", "T2", "P2", "New");
        write(&fx.local.join("jobs_active.json"), &[beta.clone()])?;
        let offline = JobSynchronizer::new(
            &fx.shared.join("missing"),
            &fx.local,
            Identity::new("alice", "press-1"),
            LockPolicy::default(),
            Arc::new(SystemClock),
        );
        ensure!(offline.delete_local(&beta.signature(), JobSetKind::Active)?);
        ensure!(offline.metadata()?.deleted_jobs.len() == 1);
        Ok(())
    }

    #[test]
    fn corrupt_metadata_fails_sync_instead_of_resurrecting() -> anyhow::Result<()> {
        let fx = fixture()?;
        let beta = JobRecord::new("Beta", "T2", "P2", "New");
        write(&fx.shared.join("jobs_active.json"), &[beta.clone()])?;
        write(&fx.local.join("jobs_active.json"), &[])?;
        let sync = synchronizer(&fx);
        sync.track_deletion(&beta, JobSetKind::Active)?;
        fs::write(fx.local.join("sync_metadata.json"), "{ not json")?;

        let result = sync.sync();
        ensure!(result.status == SyncStatus::Failed, "{}", result.message);
        ensure!(result.message.contains("sync_metadata.json"));
        ensure!(read(&fx.local.join("jobs_active.json"))?.is_empty());
        ensure!(read(&fx.shared.join("jobs_active.json"))? == vec![beta.clone()]);
        ensure!(fs::read_to_string(fx.local.join("sync_metadata.json"))? == "{ not json");
        ensure!(matches!(
            sync.track_deletion(&beta, JobSetKind::Active),
            Err(Error::Corrupt { .. })
        ));
        ensure!(!fx.shared.join("jobs.lock").exists());

        // A status read moves the file aside and starts over.
        ensure!(sync.metadata()?.deleted_jobs.is_empty());
        ensure!(!fx.local.join("sync_metadata.json").exists());
        Ok(())
    }
}
