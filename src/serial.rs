//! Serial number allocation against a shared ledger file.
//!
//! Every machine allocates from the same `serial_ledger.json`. A caller takes
//! the ledger lock, reads the counter, advances it by the requested quantity,
//! appends an audit record and writes the ledger back atomically before
//! releasing the lock. The ledger is one continuous counter; it never resets.

use crate::epc;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::lock::{FileLock, LockAttempt, LockPolicy};
use crate::paths::{self, SharedPaths};
use crate::retry::Clock;
use crate::store;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use time::OffsetDateTime;

/// Counter value for a ledger created from scratch.
pub const DEFAULT_SEED: u64 = 1000;
/// Largest quantity a single allocation may request.
pub const MAX_QUANTITY: u64 = 100_000;

/// Optional business context recorded with an allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContext {
    /// Customer name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer: Option<String>,
    /// Purchase order number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub po_number: Option<String>,
    /// Ticket number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_number: Option<String>,
    /// UPC the serials will be encoded with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upc: Option<String>,
    /// Label stock size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_size: Option<String>,
}

/// One line of the append-only audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    /// RFC 3339 time of the allocation.
    pub timestamp: String,
    /// First serial handed out.
    pub start_serial: u64,
    /// Last serial handed out (inclusive).
    pub end_serial: u64,
    /// `end_serial - start_serial + 1`.
    pub quantity: u64,
    /// Operator who allocated.
    pub user: String,
    /// Machine the allocation came from.
    pub machine: String,
    /// Job the serials are for, when known.
    #[serde(flatten)]
    pub job: JobContext,
}

/// Persisted counter plus audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialLedger {
    /// Next serial to hand out.
    pub current_serial: u64,
    /// RFC 3339 time of the last change.
    #[serde(default)]
    pub last_updated: String,
    /// Sum of all allocated quantities.
    #[serde(default)]
    pub total_issued: u64,
    /// Operator behind the last change.
    #[serde(default)]
    pub last_updated_by: String,
    /// Every allocation, oldest first.
    #[serde(default)]
    pub usage_log: Vec<AllocationRecord>,
}

impl SerialLedger {
    /// A fresh ledger starting at `seed`.
    #[must_use]
    pub fn seeded(seed: u64, stamp: String, by: String) -> Self {
        Self {
            current_serial: seed,
            last_updated: stamp,
            total_issued: 0,
            last_updated_by: by,
            usage_log: Vec::new(),
        }
    }
}

/// An inclusive block of serial numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialRange {
    /// First serial.
    pub start: u64,
    /// Last serial (inclusive).
    pub end: u64,
}

impl SerialRange {
    /// Number of serials in the block. An inverted range holds none.
    #[must_use]
    pub const fn quantity(&self) -> u64 {
        match self.end.checked_sub(self.start) {
            Some(span) => span.saturating_add(1),
            None => 0,
        }
    }

    /// Whether the two blocks share any serial.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Iterate the serials in order.
    pub fn iter(&self) -> std::ops::RangeInclusive<u64> {
        self.start..=self.end
    }
}

/// What [`SerialAllocator::allocate`] produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AllocationOutcome {
    /// The range is reserved for the caller.
    Allocated {
        /// The reserved serials.
        range: SerialRange,
        /// Counter value after this allocation.
        next_serial: u64,
    },
    /// Another machine held the ledger lock for the whole retry budget.
    Busy {
        /// Operator-facing explanation.
        message: String,
    },
    /// The shared folder is unreachable or read-only.
    StorageUnavailable {
        /// Operator-facing explanation.
        message: String,
    },
    /// The wait for the lock was cancelled.
    Cancelled,
}

impl AllocationOutcome {
    /// The reserved range, if the allocation went through.
    #[must_use]
    pub const fn range(&self) -> Option<SerialRange> {
        match self {
            Self::Allocated { range, .. } => Some(*range),
            _ => None,
        }
    }

    /// The reserved range, or the reason there is none as an error.
    ///
    /// # Errors
    /// `Busy` and `Cancelled` become [`Error::LockTimeout`];
    /// `StorageUnavailable` becomes [`Error::StorageUnavailable`].
    pub fn into_range(self) -> Result<SerialRange> {
        match self {
            Self::Allocated { range, .. } => Ok(range),
            Self::Busy { message } => Err(Error::LockTimeout(message)),
            Self::StorageUnavailable { message } => Err(Error::StorageUnavailable(message)),
            Self::Cancelled => Err(Error::LockTimeout("wait for the serial ledger was cancelled".into())),
        }
    }
}

/// Which audit records a usage summary covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageScope {
    /// Every record.
    All,
    /// Records at or after the given instant.
    Since(OffsetDateTime),
    /// Records tagged with this UPC.
    Upc(String),
    /// Records made by this user.
    User(String),
}

impl UsageScope {
    fn matches(&self, record: &AllocationRecord) -> bool {
        match self {
            Self::All => true,
            Self::Since(since) => {
                store::parse_rfc3339(&record.timestamp).is_ok_and(|at| at >= *since)
            }
            Self::Upc(upc) => record.job.upc.as_deref() == Some(upc.as_str()),
            Self::User(user) => record.user == *user,
        }
    }
}

/// Aggregate over the audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    /// Sum of quantities in scope.
    pub total_allocated: u64,
    /// Number of allocations in scope.
    pub count: usize,
    /// The matching records, oldest first.
    pub log: Vec<AllocationRecord>,
    /// Ledger counter (best effort, read without the lock).
    pub next_serial: u64,
}

/// Hands out disjoint serial ranges from the shared ledger.
#[derive(Debug, Clone)]
pub struct SerialAllocator {
    paths: SharedPaths,
    identity: Identity,
    policy: LockPolicy,
    clock: Arc<dyn Clock>,
    seed: u64,
}

impl SerialAllocator {
    /// Allocator over the ledger in `shared_dir`.
    #[must_use]
    pub fn new(shared_dir: &Path, identity: Identity, policy: LockPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            paths: SharedPaths::new(shared_dir),
            identity,
            policy,
            clock,
            seed: DEFAULT_SEED,
        }
    }

    /// Counter value used when the ledger has to be created.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Reserve `quantity` consecutive serials.
    ///
    /// Busy locks, unreachable storage and cancelled waits come back as
    /// [`AllocationOutcome`] variants without touching the ledger.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] for a quantity outside `1..=100000` or when
    /// the counter would leave the 38-bit EPC serial space, and I/O errors
    /// while reading or writing the ledger.
    pub fn allocate(&self, quantity: u64, job: Option<JobContext>) -> Result<AllocationOutcome> {
        if quantity == 0 || quantity > MAX_QUANTITY {
            return Err(Error::Validation(format!(
                "quantity must be between 1 and {MAX_QUANTITY}, got {quantity}"
            )));
        }

        if let Err(err) = store::ensure_writable_dir(&self.paths.dir) {
            tracing::warn!("serial allocation refused: {err}");
            return Ok(AllocationOutcome::StorageUnavailable {
                message: err.to_string(),
            });
        }

        let lock = FileLock::new(
            &self.paths.ledger_lock,
            self.identity.user.clone(),
            self.clock.clone(),
        );
        let guard = match lock.acquire(&self.policy)? {
            LockAttempt::Acquired(guard) => guard,
            LockAttempt::TimedOut { attempts } => {
                return Ok(AllocationOutcome::Busy {
                    message: format!(
                        "serial ledger is locked by another user ({attempts} attempts); try again shortly"
                    ),
                });
            }
            LockAttempt::Cancelled => return Ok(AllocationOutcome::Cancelled),
        };

        let mut ledger = self.load_for_update()?;
        let start = ledger.current_serial;
        let end = start
            .checked_add(quantity - 1)
            .filter(|end| *end <= epc::MAX_SERIAL)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "allocating {quantity} serials from {start} exceeds the EPC serial space"
                ))
            })?;

        let stamp = store::rfc3339(self.clock.now())?;
        ledger.current_serial = end + 1;
        ledger.total_issued = ledger.total_issued.saturating_add(quantity);
        ledger.last_updated.clone_from(&stamp);
        ledger.last_updated_by.clone_from(&self.identity.user);
        ledger.usage_log.push(AllocationRecord {
            timestamp: stamp,
            start_serial: start,
            end_serial: end,
            quantity,
            user: self.identity.user.clone(),
            machine: self.identity.machine.clone(),
            job: job.map_or_else(JobContext::default, |job| job),
        });

        store::write_json_atomic(&self.paths.ledger, &ledger, "serial ledger")?;
        if let Err(err) = guard.release() {
            tracing::warn!("serial ledger lock release failed: {err}");
        }

        tracing::info!(
            start,
            end,
            quantity,
            user = %self.identity.user,
            "allocated serial range"
        );
        Ok(AllocationOutcome::Allocated {
            range: SerialRange { start, end },
            next_serial: end + 1,
        })
    }

    /// Best-effort preview of the next serial. Reads without the lock, so the
    /// value may already be taken by the time the caller acts on it.
    ///
    /// # Errors
    /// Returns an error only if the ledger exists but cannot be read.
    pub fn peek_next(&self) -> Result<u64> {
        Ok(self.read_unlocked()?.map_or(self.seed, |l| l.current_serial))
    }

    /// Summarize allocations in `scope`.
    ///
    /// # Errors
    /// Returns an error if the ledger exists but cannot be read.
    pub fn usage_summary(&self, scope: &UsageScope) -> Result<UsageSummary> {
        let Some(ledger) = self.read_unlocked()? else {
            return Ok(UsageSummary {
                total_allocated: 0,
                count: 0,
                log: Vec::new(),
                next_serial: self.seed,
            });
        };
        let log: Vec<AllocationRecord> = ledger
            .usage_log
            .into_iter()
            .filter(|r| scope.matches(r))
            .collect();
        Ok(UsageSummary {
            total_allocated: log.iter().map(|r| r.quantity).sum(),
            count: log.len(),
            log,
            next_serial: ledger.current_serial,
        })
    }

    fn read_unlocked(&self) -> Result<Option<SerialLedger>> {
        match store::read_json::<SerialLedger>(&self.paths.ledger) {
            Ok(ledger) => Ok(ledger),
            Err(Error::Corrupt { path, source }) => {
                tracing::warn!(ledger = %path.display(), "serial ledger unreadable: {source}");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn load_for_update(&self) -> Result<SerialLedger> {
        let stamp = store::rfc3339(self.clock.now())?;
        match store::read_json::<SerialLedger>(&self.paths.ledger) {
            Ok(Some(ledger)) => Ok(ledger),
            Ok(None) => {
                tracing::info!(seed = self.seed, "creating serial ledger");
                Ok(SerialLedger::seeded(self.seed, stamp, self.identity.user.clone()))
            }
            Err(Error::Corrupt { path, source }) => {
                let quarantine = paths::quarantine_path(&path, &stamp);
                tracing::warn!(
                    ledger = %path.display(),
                    moved_to = %quarantine.display(),
                    seed = self.seed,
                    "serial ledger corrupt; starting a fresh ledger: {source}"
                );
                fs::rename(&path, &quarantine).map_err(|err| {
                    Error::io(format!("quarantine corrupt ledger {}", path.display()), err)
                })?;
                Ok(SerialLedger::seeded(self.seed, stamp, self.identity.user.clone()))
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{RetryPolicy, SystemClock};
    use anyhow::{bail, ensure};
    use std::time::Duration;
    use tempfile::tempdir;

    fn allocator(dir: &Path) -> SerialAllocator {
        SerialAllocator::new(
            dir,
            Identity::new("alice", "press-1"),
            LockPolicy::new(
                RetryPolicy::new(3, Duration::from_millis(5), Duration::ZERO),
                Duration::from_secs(30),
            ),
            Arc::new(SystemClock),
        )
    }

    #[test]
    fn first_allocation_starts_at_seed() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let alloc = allocator(dir.path());
        ensure!(alloc.peek_next()? == DEFAULT_SEED);

        let outcome = alloc.allocate(5, None)?;
        let Some(range) = outcome.range() else {
            bail!("expected allocation, got {outcome:?}");
        };
        ensure!(range == SerialRange { start: 1000, end: 1004 });
        ensure!(alloc.peek_next()? == 1005);

        let second = alloc.allocate(1, None)?.range();
        ensure!(second == Some(SerialRange { start: 1005, end: 1005 }));
        Ok(())
    }

    #[test]
    fn quantity_bounds_are_enforced() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let alloc = allocator(dir.path());
        ensure!(matches!(alloc.allocate(0, None), Err(Error::Validation(_))));
        ensure!(matches!(alloc.allocate(100_001, None), Err(Error::Validation(_))));
        ensure!(alloc.allocate(100_000, None)?.range().is_some());
        ensure!(!dir.path().join("serial_ledger.json.lock").exists());
        Ok(())
    }

    #[test]
    fn ledger_records_audit_trail() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let alloc = allocator(dir.path());
        let job = JobContext {
            customer: Some("Acme".into()),
            upc: Some("036000291452".into()),
            ..JobContext::default()
        };
        alloc.allocate(10, Some(job.clone()))?;
        alloc.allocate(4, None)?;

        let raw = fs::read_to_string(dir.path().join("serial_ledger.json"))?;
        let ledger: SerialLedger = serde_json::from_str(&raw)?;
        ensure!(ledger.current_serial == 1014);
        ensure!(ledger.total_issued == 14);
        ensure!(ledger.last_updated_by == "alice");
        ensure!(ledger.usage_log.len() == 2);
        let Some(first) = ledger.usage_log.first() else {
            bail!("usage log empty");
        };
        ensure!(first.job == job);
        ensure!(first.machine == "press-1");
        ensure!(raw.contains("\"customer\": \"Acme\""));

        let by_upc = alloc.usage_summary(&UsageScope::Upc("036000291452".into()))?;
        ensure!(by_upc.count == 1 && by_upc.total_allocated == 10);
        let all = alloc.usage_summary(&UsageScope::All)?;
        ensure!(all.total_allocated == 14 && all.next_serial == 1014);
        let nobody = alloc.usage_summary(&UsageScope::User("bob".into()))?;
        ensure!(nobody.count == 0);
        Ok(())
    }

    #[test]
    fn busy_lock_leaves_ledger_untouched() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let alloc = allocator(dir.path());
        alloc.allocate(1, None)?;
        fs::write(dir.path().join("serial_ledger.json.lock"), "Locked by bob at now\n")?;

        let outcome = alloc.allocate(5, None)?;
        ensure!(matches!(outcome, AllocationOutcome::Busy { .. }));
        ensure!(matches!(outcome.into_range(), Err(Error::LockTimeout(_))));
        ensure!(alloc.peek_next()? == 1001);
        Ok(())
    }

    #[test]
    fn unreachable_share_is_reported_distinctly() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let alloc = allocator(&dir.path().join("offline"));
        let outcome = alloc.allocate(5, None)?;
        ensure!(matches!(outcome, AllocationOutcome::StorageUnavailable { .. }));
        Ok(())
    }

    #[test]
    fn corrupt_ledger_is_quarantined_and_reseeded() -> anyhow::Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("serial_ledger.json"), "{ garbage")?;
        let alloc = allocator(dir.path());
        ensure!(alloc.peek_next()? == DEFAULT_SEED);

        let range = alloc.allocate(2, None)?.range();
        ensure!(range == Some(SerialRange { start: 1000, end: 1001 }));
        let quarantined = fs::read_dir(dir.path())?
            .filter_map(std::result::Result::ok)
            .any(|e| e.file_name().to_string_lossy().contains(".corrupt-"));
        ensure!(quarantined);
        Ok(())
    }

    #[test]
    fn serial_space_exhaustion_is_rejected() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let alloc = allocator(dir.path()).with_seed(epc::MAX_SERIAL - 1);
        ensure!(alloc.allocate(2, None)?.range().is_some());
        ensure!(matches!(alloc.allocate(1, None), Err(Error::Validation(_))));
        Ok(())
    }

    #[test]
    fn ranges_overlap_check() -> anyhow::Result<()> {
        let a = SerialRange { start: 10, end: 19 };
        ensure!(a.quantity() == 10);
        ensure!(a.overlaps(&SerialRange { start: 19, end: 25 }));
        ensure!(!a.overlaps(&SerialRange { start: 20, end: 25 }));
        Ok(())
    }

    #[test]
    fn inverted_range_from_disk_has_no_serials() -> anyhow::Result<()> {
        let range: SerialRange = serde_json::from_str(r#"{"start": 20, "end": 10}"#)?;
        ensure!(range.quantity() == 0);
        ensure!(range.iter().next().is_none());
        ensure!(SerialRange { start: 0, end: u64::MAX }.quantity() == u64::MAX);
        Ok(())
    }
}
