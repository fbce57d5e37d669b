//! Explicit coordination context.
//!
//! One [`Coordinator`] per shared location replaces process-wide singletons:
//! callers build it from a [`CoordinatorConfig`] and hand it to whatever needs
//! serials or job sync.

use crate::identity::Identity;
use crate::lock::{FileLock, LockPolicy};
use crate::paths::SharedPaths;
use crate::retry::{CancelToken, Clock, RetryPolicy, SystemClock};
use crate::serial::{SerialAllocator, DEFAULT_SEED};
use crate::sync::JobSynchronizer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Which shared lock a maintenance command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LockTarget {
    /// The serial ledger lock.
    Ledger,
    /// The shared jobs lock.
    Jobs,
}

/// Everything a [`Coordinator`] needs.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Folder every machine shares.
    pub shared_dir: PathBuf,
    /// This machine's private data folder.
    pub local_dir: PathBuf,
    /// Who is acting, for audit fields.
    pub identity: Identity,
    /// Ledger lock behaviour.
    pub serial_lock: LockPolicy,
    /// Jobs lock behaviour.
    pub sync_lock: LockPolicy,
    /// Counter value for a ledger created from scratch.
    pub default_seed: u64,
    /// Time source and sleeper.
    pub clock: Arc<dyn Clock>,
}

impl CoordinatorConfig {
    /// Defaults for the given folders and identity.
    #[must_use]
    pub fn new(shared_dir: impl Into<PathBuf>, local_dir: impl Into<PathBuf>, identity: Identity) -> Self {
        Self {
            shared_dir: shared_dir.into(),
            local_dir: local_dir.into(),
            identity,
            serial_lock: default_serial_lock(),
            sync_lock: default_sync_lock(),
            default_seed: DEFAULT_SEED,
            clock: Arc::new(SystemClock),
        }
    }

    /// Swap the clock, e.g. for a simulated one in tests.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Let `token` abort lock waits on both locks.
    #[must_use]
    pub fn with_cancel(mut self, token: &CancelToken) -> Self {
        self.serial_lock.retry = self.serial_lock.retry.with_cancel(token.clone());
        self.sync_lock.retry = self.sync_lock.retry.with_cancel(token.clone());
        self
    }
}

/// 20 attempts, 400 ms apart plus up to 200 ms jitter; stale after 30 s.
#[must_use]
pub fn default_serial_lock() -> LockPolicy {
    LockPolicy::new(
        RetryPolicy::new(20, Duration::from_millis(400), Duration::from_millis(200)),
        Duration::from_secs(30),
    )
}

/// 15 attempts, 300 ms apart plus up to 200 ms jitter; stale after 20 s.
#[must_use]
pub fn default_sync_lock() -> LockPolicy {
    LockPolicy::new(
        RetryPolicy::new(15, Duration::from_millis(300), Duration::from_millis(200)),
        Duration::from_secs(20),
    )
}

/// Shared-state services for one shared location.
#[derive(Debug, Clone)]
pub struct Coordinator {
    config: CoordinatorConfig,
    serials: SerialAllocator,
    jobs: JobSynchronizer,
}

impl Coordinator {
    /// Build the allocator and synchronizer from `config`.
    #[must_use]
    pub fn new(config: CoordinatorConfig) -> Self {
        let serials = SerialAllocator::new(
            &config.shared_dir,
            config.identity.clone(),
            config.serial_lock.clone(),
            config.clock.clone(),
        )
        .with_seed(config.default_seed);
        let jobs = JobSynchronizer::new(
            &config.shared_dir,
            &config.local_dir,
            config.identity.clone(),
            config.sync_lock.clone(),
            config.clock.clone(),
        );
        Self {
            config,
            serials,
            jobs,
        }
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Serial allocator.
    #[must_use]
    pub const fn serials(&self) -> &SerialAllocator {
        &self.serials
    }

    /// Job synchronizer.
    #[must_use]
    pub const fn jobs(&self) -> &JobSynchronizer {
        &self.jobs
    }

    /// Handle on one of the shared locks, for inspection and cleanup.
    #[must_use]
    pub fn lock(&self, target: LockTarget) -> (FileLock, &LockPolicy) {
        let paths = SharedPaths::new(&self.config.shared_dir);
        let (path, policy) = match target {
            LockTarget::Ledger => (paths.ledger_lock, &self.config.serial_lock),
            LockTarget::Jobs => (paths.jobs_lock, &self.config.sync_lock),
        };
        let lock = FileLock::new(path, self.config.identity.user.clone(), self.config.clock.clone());
        (lock, policy)
    }
}
