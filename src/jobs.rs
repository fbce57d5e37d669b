//! Job records, their identity, and the two-way merge.
//!
//! A job record is an open JSON object of business fields. Its identity is the
//! `(Customer, Ticket#, PO#)` signature. Keys starting with `_` are sync
//! metadata and never count as business data.

use crate::error::{Error, Result};
use clap::builder::PossibleValue;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Business field holding the customer name.
pub const CUSTOMER: &str = "Customer";
/// Business field holding the ticket number.
pub const TICKET: &str = "Ticket#";
/// Business field holding the purchase order number.
pub const PO: &str = "PO#";
/// Business field holding the workflow status.
pub const STATUS: &str = "Status";

/// Which side a merged record came from (`local` / `shared`).
pub const META_SOURCE: &str = "_source";
/// RFC 3339 time of the sync that produced the record.
pub const META_SYNC_TIMESTAMP: &str = "_sync_timestamp";
/// Whether the record won a local/shared collision.
pub const META_CONFLICT_RESOLVED: &str = "_conflict_resolved";

/// The two independently merged collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSetKind {
    /// Jobs still being worked.
    Active,
    /// Finished or shelved jobs.
    Archived,
}

impl JobSetKind {
    /// Both kinds, in sync order.
    pub const ALL: [Self; 2] = [Self::Active, Self::Archived];

    /// Lowercase name used in files and metadata.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }
}

impl fmt::Display for JobSetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ValueEnum for JobSetKind {
    fn value_variants<'a>() -> &'a [Self] {
        &Self::ALL
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        let pv = match self {
            Self::Active => PossibleValue::new("active").help("Jobs still being worked"),
            Self::Archived => PossibleValue::new("archived").help("Finished or shelved jobs"),
        };
        Some(pv)
    }
}

impl std::str::FromStr for JobSetKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            s if s.eq_ignore_ascii_case("active") => Ok(Self::Active),
            s if s.eq_ignore_ascii_case("archived") => Ok(Self::Archived),
            _ => Err(Error::Validation(format!("invalid job set: {s}"))),
        }
    }
}

/// Workflow states that take part in conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Freshly entered.
    New,
    /// Paused.
    OnHold,
    /// Being produced.
    InProgress,
    /// Done.
    Completed,
    /// Abandoned.
    Cancelled,
}

impl JobStatus {
    /// Parse a status label, ignoring case and surrounding whitespace.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            s if s.eq_ignore_ascii_case("New") => Some(Self::New),
            s if s.eq_ignore_ascii_case("On Hold") => Some(Self::OnHold),
            s if s.eq_ignore_ascii_case("In Progress") => Some(Self::InProgress),
            s if s.eq_ignore_ascii_case("Completed") => Some(Self::Completed),
            s if s.eq_ignore_ascii_case("Cancelled") => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Higher wins a collision.
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            Self::New | Self::Cancelled => 1,
            Self::OnHold | Self::InProgress => 2,
            Self::Completed => 3,
        }
    }
}

/// Composite identity of a job. Blank fields are `None`, so an empty
/// customer never collides with a customer literally named after a separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Signature {
    /// Customer name.
    pub customer: Option<String>,
    /// Ticket number.
    pub ticket: Option<String>,
    /// Purchase order number.
    pub po: Option<String>,
}

impl Signature {
    /// Build a signature from raw field values; blanks become `None`.
    #[must_use]
    pub fn new(customer: &str, ticket: &str, po: &str) -> Self {
        Self {
            customer: non_blank(customer),
            ticket: non_blank(ticket),
            po: non_blank(po),
        }
    }

    /// Whether every component is blank.
    #[must_use]
    pub const fn is_blank(&self) -> bool {
        self.customer.is_none() && self.ticket.is_none() && self.po.is_none()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |p: &Option<String>| p.as_deref().map_or("-", |s| s).to_string();
        write!(
            f,
            "{} / ticket {} / PO {}",
            part(&self.customer),
            part(&self.ticket),
            part(&self.po)
        )
    }
}

fn non_blank(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn field_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => non_blank(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => non_blank(&other.to_string()),
    }
}

/// One job: business fields plus `_`-prefixed sync metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobRecord(pub Map<String, Value>);

impl JobRecord {
    /// Record with the three identity fields and a status set.
    #[must_use]
    pub fn new(customer: &str, ticket: &str, po: &str, status: &str) -> Self {
        let mut map = Map::new();
        map.insert(CUSTOMER.into(), Value::String(customer.into()));
        map.insert(TICKET.into(), Value::String(ticket.into()));
        map.insert(PO.into(), Value::String(po.into()));
        map.insert(STATUS.into(), Value::String(status.into()));
        Self(map)
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Read a field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Identity of this record.
    #[must_use]
    pub fn signature(&self) -> Signature {
        Signature {
            customer: field_text(self.get(CUSTOMER)),
            ticket: field_text(self.get(TICKET)),
            po: field_text(self.get(PO)),
        }
    }

    /// The `Status` field as text.
    #[must_use]
    pub fn status(&self) -> Option<String> {
        field_text(self.get(STATUS))
    }

    /// Conflict priority of the status. Unknown or missing statuses rank 0.
    #[must_use]
    pub fn status_priority(&self) -> u8 {
        self.status()
            .as_deref()
            .and_then(JobStatus::parse)
            .map_or(0, JobStatus::priority)
    }

    /// Equal business fields, ignoring `_` metadata.
    #[must_use]
    pub fn same_business_fields(&self, other: &Self) -> bool {
        fn business(r: &JobRecord) -> HashMap<&String, &Value> {
            r.0.iter().filter(|(k, _)| !k.starts_with('_')).collect()
        }
        business(self) == business(other)
    }

    fn tagged(&self, source: &str, stamp: &str, conflict_resolved: bool) -> Self {
        let mut out = self.clone();
        out.0.insert(META_SOURCE.into(), Value::String(source.into()));
        out.0
            .insert(META_SYNC_TIMESTAMP.into(), Value::String(stamp.into()));
        if conflict_resolved {
            out.0.insert(META_CONFLICT_RESOLVED.into(), Value::Bool(true));
        } else {
            out.0.remove(META_CONFLICT_RESOLVED);
        }
        out
    }
}

/// Records deduplicated by signature; at most one record per signature.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobSet {
    records: Vec<JobRecord>,
    index: HashMap<Signature, usize>,
}

impl JobSet {
    /// Build a set, keeping the first record of any duplicated signature.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] if a record has no customer, ticket or PO.
    pub fn from_records(records: Vec<JobRecord>) -> Result<Self> {
        let mut set = Self::default();
        for (position, record) in records.into_iter().enumerate() {
            let sig = record.signature();
            if sig.is_blank() {
                return Err(Error::Validation(format!(
                    "job record #{} has no customer, ticket or PO",
                    position + 1
                )));
            }
            if set.index.contains_key(&sig) {
                tracing::warn!(signature = %sig, "duplicate job record ignored");
                continue;
            }
            set.push(sig, record);
        }
        Ok(set)
    }

    fn push(&mut self, sig: Signature, record: JobRecord) {
        self.index.insert(sig, self.records.len());
        self.records.push(record);
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a record by signature.
    #[must_use]
    pub fn get(&self, sig: &Signature) -> Option<&JobRecord> {
        self.index.get(sig).and_then(|&i| self.records.get(i))
    }

    /// Whether a record with this signature exists.
    #[must_use]
    pub fn contains(&self, sig: &Signature) -> bool {
        self.index.contains_key(sig)
    }

    /// Records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &JobRecord> {
        self.records.iter()
    }

    /// Borrow the records in insertion order.
    #[must_use]
    pub fn records(&self) -> &[JobRecord] {
        &self.records
    }

    /// Give up the records in insertion order.
    #[must_use]
    pub fn into_records(self) -> Vec<JobRecord> {
        self.records
    }
}

/// Counters from one [`merge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    /// Records that came from the local side.
    pub local: usize,
    /// Records on the shared side.
    pub shared: usize,
    /// Shared records new to the local side.
    pub added_from_shared: usize,
    /// Shared records dropped because they were deleted locally.
    pub suppressed: usize,
    /// Collisions with differing business fields.
    pub conflicts: usize,
    /// Size of the merged set.
    pub merged: usize,
}

/// Merged set plus what happened.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// The merged records.
    pub merged: JobSet,
    /// Counters.
    pub stats: MergeStats,
}

/// Merge the local and shared versions of one collection.
///
/// Local records form the baseline. Shared records whose signature is in
/// `tombstones` are skipped. A shared record new to the local side is added. A
/// collision keeps the side whose status ranks higher and keeps local on a tie;
/// identical business fields are not a conflict.
#[must_use]
pub fn merge(
    local: &JobSet,
    shared: &JobSet,
    tombstones: &BTreeSet<Signature>,
    stamp: &str,
) -> MergeOutcome {
    let mut merged = JobSet::default();
    let mut stats = MergeStats {
        local: local.len(),
        shared: shared.len(),
        ..MergeStats::default()
    };

    for record in local.iter() {
        merged.push(record.signature(), record.tagged("local", stamp, false));
    }

    for theirs in shared.iter() {
        let sig = theirs.signature();
        if tombstones.contains(&sig) {
            tracing::debug!(signature = %sig, "skipping shared job deleted locally");
            stats.suppressed += 1;
            continue;
        }

        let Some(&slot) = merged.index.get(&sig) else {
            merged.push(sig, theirs.tagged("shared", stamp, false));
            stats.added_from_shared += 1;
            continue;
        };
        let Some(ours) = merged.records.get_mut(slot) else {
            continue;
        };
        if ours.same_business_fields(theirs) {
            continue;
        }

        stats.conflicts += 1;
        if theirs.status_priority() > ours.status_priority() {
            tracing::debug!(signature = %sig, "conflict resolved in favour of shared copy");
            *ours = theirs.tagged("shared", stamp, true);
        } else {
            tracing::debug!(signature = %sig, "conflict resolved in favour of local copy");
            ours.0
                .insert(META_CONFLICT_RESOLVED.into(), Value::Bool(true));
        }
    }

    stats.merged = merged.len();
    MergeOutcome { merged, stats }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, ensure};
    use proptest::prelude::*;

    const STAMP: &str = "2026-01-11T12:00:00Z";

    fn set(records: Vec<JobRecord>) -> anyhow::Result<JobSet> {
        Ok(JobSet::from_records(records)?)
    }

    #[test]
    fn business_comparison_ignores_sync_metadata() {
        let plain = JobRecord::new("Acme", "T1", "P1", "New").with("Quantity", 5);
        let stamped = plain.tagged("shared", STAMP, true);
        assert!(plain.same_business_fields(&stamped));
        assert!(stamped.same_business_fields(&plain));
        assert!(!plain.same_business_fields(&plain.clone().with("Quantity", 6)));
        assert!(!plain.same_business_fields(&JobRecord::new("Acme", "T1", "P1", "New")));
    }

    #[test]
    fn higher_status_wins() -> anyhow::Result<()> {
        let local = set(vec![JobRecord::new("Acme", "T1", "P1", "New")])?;
        let shared = set(vec![JobRecord::new("Acme", "T1", "P1", "Completed")])?;
        let out = merge(&local, &shared, &BTreeSet::new(), STAMP);
        ensure!(out.stats.conflicts == 1);
        let Some(kept) = out.merged.get(&Signature::new("Acme", "T1", "P1")) else {
            bail!("record missing");
        };
        ensure!(kept.status().as_deref() == Some("Completed"));
        ensure!(kept.get(META_SOURCE) == Some(&Value::String("shared".into())));
        ensure!(kept.get(META_CONFLICT_RESOLVED) == Some(&Value::Bool(true)));
        Ok(())
    }

    #[test]
    fn tie_keeps_local() -> anyhow::Result<()> {
        let local = set(vec![JobRecord::new("Acme", "T1", "P1", "New")])?;
        let shared = set(vec![JobRecord::new("Acme", "T1", "P1", "Cancelled")])?;
        let out = merge(&local, &shared, &BTreeSet::new(), STAMP);
        ensure!(out.stats.conflicts == 1);
        let Some(kept) = out.merged.get(&Signature::new("Acme", "T1", "P1")) else {
            bail!("record missing");
        };
        ensure!(kept.status().as_deref() == Some("New"));
        ensure!(kept.get(META_SOURCE) == Some(&Value::String("local".into())));
        ensure!(kept.get(META_CONFLICT_RESOLVED) == Some(&Value::Bool(true)));
        Ok(())
    }

    #[test]
    fn same_priority_different_fields_keeps_local() -> anyhow::Result<()> {
        let local = set(vec![JobRecord::new("Acme", "T1", "P1", "On Hold").with("Quantity", 10)])?;
        let shared =
            set(vec![JobRecord::new("Acme", "T1", "P1", "In Progress").with("Quantity", 99)])?;
        let out = merge(&local, &shared, &BTreeSet::new(), STAMP);
        let Some(kept) = out.merged.get(&Signature::new("Acme", "T1", "P1")) else {
            bail!("record missing");
        };
        ensure!(kept.get("Quantity") == Some(&Value::from(10)));
        Ok(())
    }

    #[test]
    fn unknown_status_loses() -> anyhow::Result<()> {
        let local = set(vec![JobRecord::new("Acme", "T1", "P1", "Quoting")])?;
        let shared = set(vec![JobRecord::new("Acme", "T1", "P1", "New")])?;
        let out = merge(&local, &shared, &BTreeSet::new(), STAMP);
        let kept = out.merged.get(&Signature::new("Acme", "T1", "P1"));
        ensure!(kept.and_then(JobRecord::status).as_deref() == Some("New"));
        Ok(())
    }

    #[test]
    fn tombstoned_shared_records_are_not_resurrected() -> anyhow::Result<()> {
        let local = set(vec![JobRecord::new("Acme", "T1", "P1", "New")])?;
        let shared = set(vec![
            JobRecord::new("Acme", "T1", "P1", "New"),
            JobRecord::new("Beta", "T2", "P2", "New"),
        ])?;
        let tombstones: BTreeSet<Signature> = [Signature::new("Beta", "T2", "P2")].into();
        let out = merge(&local, &shared, &tombstones, STAMP);
        ensure!(out.merged.len() == 1);
        ensure!(out.stats.suppressed == 1);
        ensure!(!out.merged.contains(&Signature::new("Beta", "T2", "P2")));
        Ok(())
    }

    #[test]
    fn new_shared_records_are_added_after_local_ones() -> anyhow::Result<()> {
        let local = set(vec![JobRecord::new("Acme", "T1", "P1", "New")])?;
        let shared = set(vec![JobRecord::new("Beta", "T2", "P2", "New")])?;
        let out = merge(&local, &shared, &BTreeSet::new(), STAMP);
        ensure!(out.stats.added_from_shared == 1 && out.stats.merged == 2);
        ensure!(out.merged.iter().all(|r| r.get(META_CONFLICT_RESOLVED).is_none()));
        let sources: Vec<_> = out
            .merged
            .iter()
            .filter_map(|r| r.get(META_SOURCE).and_then(Value::as_str))
            .collect();
        ensure!(sources == vec!["local", "shared"]);
        Ok(())
    }

    #[test]
    fn signatures_distinguish_blank_fields() -> anyhow::Result<()> {
        let a = JobRecord::new("Acme", "", "12", "New").signature();
        let b = JobRecord::new("Acme", "12", "", "New").signature();
        ensure!(a != b);
        let numeric = JobRecord::new("Acme", "", "", "New").with(TICKET, 42).signature();
        ensure!(numeric.ticket.as_deref() == Some("42"));
        ensure!(Signature::new(" ", "", "\t").is_blank());
        Ok(())
    }

    #[test]
    fn blank_signature_is_rejected() -> anyhow::Result<()> {
        let Err(Error::Validation(msg)) =
            JobSet::from_records(vec![JobRecord::new("", " ", "", "New")])
        else {
            bail!("blank signature should be rejected");
        };
        ensure!(msg.contains("#1"));
        Ok(())
    }

    #[test]
    fn duplicates_keep_first() -> anyhow::Result<()> {
        let s = set(vec![
            JobRecord::new("Acme", "T1", "P1", "New"),
            JobRecord::new("Acme", "T1", "P1", "Completed"),
        ])?;
        ensure!(s.len() == 1);
        let first = s.get(&Signature::new("Acme", "T1", "P1")).and_then(JobRecord::status);
        ensure!(first.as_deref() == Some("New"));
        Ok(())
    }

    #[test]
    fn status_table() -> anyhow::Result<()> {
        let p = |s: &str| JobStatus::parse(s).map(JobStatus::priority);
        ensure!(p("New") == Some(1));
        ensure!(p("on hold") == Some(2));
        ensure!(p(" In Progress ") == Some(2));
        ensure!(p("Completed") == Some(3));
        ensure!(p("Cancelled") == Some(1));
        ensure!(p("Shipped").is_none());
        Ok(())
    }

    fn job_strategy() -> impl Strategy<Value = JobRecord> {
        (
            "[A-C]",
            "[0-9]{1,2}",
            "[0-9]{1,2}",
            prop::sample::select(vec!["New", "On Hold", "In Progress", "Completed", "Cancelled"]),
            0..500_u32,
        )
            .prop_map(|(c, t, p, s, q)| JobRecord::new(&c, &t, &p, s).with("Quantity", q))
    }

    proptest! {
        #[test]
        fn merging_a_set_with_itself_is_a_no_op(records in prop::collection::vec(job_strategy(), 0..20)) {
            let x = JobSet::from_records(records).map_err(|e| TestCaseError::fail(e.to_string()))?;
            let out = merge(&x, &x, &BTreeSet::new(), STAMP);
            prop_assert_eq!(out.stats.conflicts, 0);
            prop_assert_eq!(out.merged.len(), x.len());
            for (merged, original) in out.merged.iter().zip(x.iter()) {
                prop_assert!(merged.same_business_fields(original));
            }
        }
    }
}
