use crate::error::{Error, Result};
use crate::id;
use crate::retry::{Clock, RetryPolicy};
use crate::store;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);

/// How long to keep trying and when an existing marker counts as abandoned.
#[derive(Debug, Clone)]
pub struct LockPolicy {
    /// Attempts and delay between them.
    pub retry: RetryPolicy,
    /// A marker whose modification time is older than this may be reclaimed.
    pub stale_after: Duration,
}

impl LockPolicy {
    /// Combine a retry policy with a staleness threshold.
    #[must_use]
    pub const fn new(retry: RetryPolicy, stale_after: Duration) -> Self {
        Self { retry, stale_after }
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), DEFAULT_STALE_AFTER)
    }
}

/// Result of [`FileLock::acquire`]. Only `Acquired` grants ownership.
#[derive(Debug)]
pub enum LockAttempt {
    /// The marker is ours until the guard is released or dropped.
    Acquired(LockGuard),
    /// Someone else held the lock for the whole retry budget.
    TimedOut {
        /// Attempts made before giving up.
        attempts: usize,
    },
    /// The retry policy's cancel token fired while waiting.
    Cancelled,
}

/// Advisory lock backed by the presence of a marker file.
///
/// The marker is created with `create_new`, so two creators never both succeed.
/// A marker older than the policy's staleness threshold is treated as abandoned
/// and removed.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    owner: String,
    clock: Arc<dyn Clock>,
}

/// Snapshot of an existing lock marker.
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    /// Marker path.
    pub path: String,
    /// Informational marker content ("Locked by ... at ...").
    pub note: String,
    /// Seconds since the marker was last modified.
    pub age_secs: f64,
    /// Whether the marker is past the staleness threshold.
    pub stale: bool,
}

impl FileLock {
    /// A lock on `path`, stamped with `owner` when taken.
    pub fn new(path: impl Into<PathBuf>, owner: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            owner: owner.into(),
            clock,
        }
    }

    /// Marker file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock, waiting between attempts per `policy`.
    ///
    /// A stale marker is removed and the create is retried without sleeping.
    ///
    /// # Errors
    /// Returns an error only for filesystem failures other than "marker exists".
    pub fn acquire(&self, policy: &LockPolicy) -> Result<LockAttempt> {
        let token = id::token8()?;
        let max_attempts = policy.retry.max_attempts.max(1);
        let mut attempt: usize = 0;

        loop {
            if policy.retry.is_cancelled() {
                tracing::debug!(lock = %self.path.display(), "lock wait cancelled");
                return Ok(LockAttempt::Cancelled);
            }
            attempt = attempt.saturating_add(1);

            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut f) => {
                    let stamp = store::rfc3339(self.clock.now())?;
                    let note = format!("Locked by {} at {stamp} (token {token})", self.owner);
                    if let Err(err) = writeln!(f, "{note}").and_then(|()| f.flush()) {
                        drop(f);
                        let _ = fs::remove_file(&self.path);
                        return Err(Error::io("write lock marker", err));
                    }
                    tracing::debug!(lock = %self.path.display(), attempt, "lock acquired");
                    return Ok(LockAttempt::Acquired(LockGuard {
                        path: Some(self.path.clone()),
                        token,
                    }));
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if self.reclaim_if_stale(policy.stale_after)? {
                        continue;
                    }
                    if attempt >= max_attempts {
                        tracing::debug!(lock = %self.path.display(), attempt, "lock busy; giving up");
                        return Ok(LockAttempt::TimedOut { attempts: attempt });
                    }
                    let delay = policy.retry.next_delay();
                    tracing::debug!(
                        lock = %self.path.display(),
                        attempt,
                        delay_ms = delay.as_millis(),
                        "lock busy; retrying"
                    );
                    self.clock.sleep(delay);
                }
                Err(err) => {
                    return Err(Error::io(
                        format!("create lock marker {}", self.path.display()),
                        err,
                    ))
                }
            }
        }
    }

    /// Describe the current marker, if any.
    ///
    /// # Errors
    /// Returns an error if the marker exists but cannot be inspected.
    pub fn status(&self, stale_after: Duration) -> Result<Option<LockStatus>> {
        let Some(age) = self.marker_age()? else {
            return Ok(None);
        };
        let note = match fs::read_to_string(&self.path) {
            Ok(s) => s.trim_end().to_string(),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::io("read lock marker", err)),
        };
        Ok(Some(LockStatus {
            path: self.path.to_string_lossy().to_string(),
            note,
            age_secs: age.as_secs_f64(),
            stale: age > stale_after,
        }))
    }

    /// Remove the marker if it is stale. Returns whether a marker was removed.
    ///
    /// # Errors
    /// Returns an error if the marker cannot be inspected or removed.
    pub fn clear_stale(&self, stale_after: Duration) -> Result<bool> {
        if self.marker_age()?.is_none() {
            return Ok(false);
        }
        self.reclaim_if_stale(stale_after)
    }

    fn marker_age(&self) -> Result<Option<Duration>> {
        let modified = match fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::io("stat lock marker", err)),
        };
        // A marker from a machine whose clock runs ahead reads as brand new.
        Ok(Some(age_between(modified, self.clock.now())))
    }

    fn reclaim_if_stale(&self, stale_after: Duration) -> Result<bool> {
        let seen = read_marker(&self.path)?;
        let Some(age) = self.marker_age()? else {
            return Ok(true);
        };
        if age <= stale_after {
            return Ok(false);
        }

        // Someone replaced the marker between our reads; it is not the stale one.
        if read_marker(&self.path)? != seen {
            return Ok(false);
        }

        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::warn!(
                    lock = %self.path.display(),
                    age_secs = age.as_secs(),
                    previous = seen.as_deref().map_or("", str::trim_end),
                    "reclaimed stale lock"
                );
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(true),
            Err(err) => Err(Error::io("remove stale lock marker", err)),
        }
    }
}

fn age_between(modified: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(modified).map_or(Duration::ZERO, |age| age)
}

fn read_marker(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(Error::io("read lock marker", err)),
    }
}

/// Ownership of a lock marker. Dropping the guard releases it.
#[derive(Debug)]
pub struct LockGuard {
    path: Option<PathBuf>,
    token: String,
}

impl LockGuard {
    /// Release explicitly, surfacing any filesystem error.
    ///
    /// # Errors
    /// Returns an error if the marker exists but cannot be read or removed.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        let Some(path) = self.path.take() else {
            return Ok(());
        };

        let Some(note) = read_marker(&path)? else {
            return Ok(());
        };

        if note.trim_end().ends_with(&format!("(token {})", self.token)) {
            match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                Err(err) => Err(Error::io("remove lock marker", err)),
            }
        } else {
            tracing::warn!(
                lock = %path.display(),
                "lock marker was reclaimed by another process; leaving it in place"
            );
            Ok(())
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            tracing::warn!("failed to release lock: {err}");
        }
    }
}
