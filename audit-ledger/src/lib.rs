//! Audit Ledger
//!
//! Append-only audit trail for scholarship application workflows.
//!
//! # Architecture
//!
//! - **Append-only**: Events are written once and never modified or deleted
//! - **Guarded commits**: Uniqueness of event ids is enforced by the store's
//!   put-if-absent commit, not by a process-wide lock
//! - **Secondary index**: Per-application history is a prefix scan over
//!   keys ordered by commit timestamp
//! - **Pluggable storage**: RocksDB for durability, an in-memory store for
//!   tests and tooling
//!
//! # Invariants
//!
//! - A committed event is never changed, including on a duplicate attempt
//! - History is ordered by commit timestamp, then transaction id
//! - The maintained index and the full scan return the same history

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod codec;
pub mod config;
pub mod error;
pub mod index;
pub mod ledger;
pub mod metrics;
pub mod storage;
pub mod types;
pub mod value;

// Re-exports
pub use config::{Backend, Config};
pub use error::{Error, Result};
pub use index::{EventQuery, IndexStrategy};
pub use ledger::{HistoryDigest, Ledger, LedgerStats};
pub use metrics::Metrics;
pub use storage::{MemoryStore, RecordStore, RocksStore};
pub use types::{AuditEvent, EventType, NewEvent, Page, PageToken, Receipt};
pub use value::Value;
