//! `tagledger` coordinates RFID label production between machines that share a
//! network folder. It backs the `tagledger` CLI binary.
//!
//! - A file-presence lock with stale reclaim and owner-checked release
//! - A serial allocator over a shared ledger with an audit trail
//! - Two-way job synchronization with status-priority conflict resolution
//!   and deletion tombstones
//! - A UPC ⇄ SGTIN-96 EPC codec

/// Coordination context bundling the services for one shared folder.
pub mod context;
/// SGTIN-96 encoding and decoding of UPC + serial.
pub mod epc;
/// Error taxonomy.
pub mod error;
/// Random identifier generation.
pub mod id;
/// Operator and machine identity for audit fields.
pub mod identity;
/// Job records, signatures and the merge rule.
pub mod jobs;
/// File-presence lock.
pub mod lock;
/// File names in the shared and local folders.
pub mod paths;
/// Retry policy, clock seam and cancellation.
pub mod retry;
/// Serial number allocation.
pub mod serial;
/// JSON persistence and atomic writes.
pub mod store;
/// Job collection synchronization.
pub mod sync;

pub use error::{Error, Result};
