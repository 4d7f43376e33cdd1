//! Record store abstraction
//!
//! The ledger persists through a transactional key-value substrate. Two
//! keyspaces mirror the column families of the RocksDB backend:
//!
//! - `events` - Append-only event records (key: event id)
//! - `indices` - Secondary index entries (key: correlation id || timestamp
//!   || transaction id || event id)
//!
//! # Commit contract
//!
//! `commit` applies a `WriteBatch` all-or-nothing. Entries added with
//! `put_if_absent` are guards: if any guarded key already exists when the
//! batch commits, nothing is written and the commit fails with
//! `Error::Conflict`. Two writers racing on the same event id therefore
//! cannot both succeed, whatever the interleaving of their existence
//! checks. Backends without native conflict detection must make the
//! guard check and the write a single atomic step.
//!
//! There are no deletes and no overwrites of event records.

mod memory;
mod rocks;

pub use memory::MemoryStore;
pub use rocks::RocksStore;

use crate::{
    config::{Backend, Config},
    types::CommitContext,
    Error, Result,
};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// A key/value pair returned by a scan
pub type Entry = (Vec<u8>, Vec<u8>);

/// Logical keyspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyspace {
    /// Event records
    Events,
    /// Secondary index entries
    Index,
}

impl Keyspace {
    /// Column family name
    pub const fn name(&self) -> &'static str {
        match self {
            Keyspace::Events => "events",
            Keyspace::Index => "indices",
        }
    }
}

/// Half-open key range `[start, end)` in lexicographic byte order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    start: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
}

impl KeyRange {
    /// Every key
    pub fn all() -> Self {
        Self::default()
    }

    /// Keys `>= start`
    pub fn starting_at(start: impl Into<Vec<u8>>) -> Self {
        Self {
            start: Some(start.into()),
            end: None,
        }
    }

    /// Keys strictly greater than `key`
    pub fn after(key: impl Into<Vec<u8>>) -> Self {
        let mut start = key.into();
        // The smallest key above `key` is `key` followed by a zero byte
        start.push(0);
        Self::starting_at(start)
    }

    /// Keys starting with `prefix`
    pub fn prefix(prefix: impl Into<Vec<u8>>) -> Self {
        let prefix = prefix.into();
        let end = prefix_successor(&prefix);
        Self {
            start: Some(prefix),
            end,
        }
    }

    /// Narrow the lower bound to keys strictly greater than `key`
    pub fn resume_after(&self, key: &[u8]) -> Self {
        let mut resumed = Self::after(key.to_vec());
        if let Some(start) = &self.start {
            if start.as_slice() > resumed.start.as_deref().unwrap_or_default() {
                resumed.start = Some(start.clone());
            }
        }
        resumed.end = self.end.clone();
        resumed
    }

    /// Inclusive lower bound
    pub fn start(&self) -> Option<&[u8]> {
        self.start.as_deref()
    }

    /// Exclusive upper bound
    pub fn end(&self) -> Option<&[u8]> {
        self.end.as_deref()
    }

    /// True if `key` lies below the upper bound
    pub fn below_end(&self, key: &[u8]) -> bool {
        self.end.as_deref().map_or(true, |end| key < end)
    }

    /// True if the range can hold no key
    pub fn is_empty(&self) -> bool {
        match (self.start.as_deref(), self.end.as_deref()) {
            (Some(start), Some(end)) => start >= end,
            _ => false,
        }
    }

    /// True if `key` lies inside the range
    pub fn contains(&self, key: &[u8]) -> bool {
        self.start.as_deref().map_or(true, |start| key >= start) && self.below_end(key)
    }
}

/// Smallest key greater than every key with this prefix (`None` = unbounded)
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// One write in a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Write only if the key is absent at commit time
    PutIfAbsent {
        /// Target keyspace
        keyspace: Keyspace,
        /// Key
        key: Vec<u8>,
        /// Value
        value: Vec<u8>,
    },
    /// Unconditional write
    Put {
        /// Target keyspace
        keyspace: Keyspace,
        /// Key
        key: Vec<u8>,
        /// Value
        value: Vec<u8>,
    },
}

/// Writes committed as one atomic unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a guarded write
    pub fn put_if_absent(&mut self, keyspace: Keyspace, key: impl Into<Vec<u8>>, value: Vec<u8>) {
        self.ops.push(WriteOp::PutIfAbsent {
            keyspace,
            key: key.into(),
            value,
        });
    }

    /// Add an unconditional write
    pub fn put(&mut self, keyspace: Keyspace, key: impl Into<Vec<u8>>, value: Vec<u8>) {
        self.ops.push(WriteOp::Put {
            keyspace,
            key: key.into(),
            value,
        });
    }

    /// Operations in insertion order
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Number of writes
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True if nothing to write
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Transactional key-value substrate consumed by the ledger
pub trait RecordStore: Send + Sync {
    /// Point read
    fn get(&self, keyspace: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Whether a key is present
    fn exists(&self, keyspace: Keyspace, key: &[u8]) -> Result<bool> {
        Ok(self.get(keyspace, key)?.is_some())
    }

    /// Entries inside `range` in ascending key order, at most `limit`
    fn scan(&self, keyspace: Keyspace, range: &KeyRange, limit: Option<usize>) -> Result<Vec<Entry>>;

    /// Commit metadata for the next write
    fn begin(&self) -> Result<CommitContext>;

    /// Apply the batch atomically
    fn commit(&self, batch: WriteBatch) -> Result<()>;

    /// Estimated number of keys
    fn approximate_len(&self, keyspace: Keyspace) -> Result<u64>;

    /// Whether the index keyspace may be used for secondary lookups
    fn supports_secondary_index(&self) -> bool {
        true
    }
}

/// Open the backend named in the configuration
pub fn open(config: &Config) -> Result<Arc<dyn RecordStore>> {
    let store: Arc<dyn RecordStore> = match config.backend {
        Backend::Memory => Arc::new(MemoryStore::new()),
        Backend::RocksDb => Arc::new(RocksStore::open(config)?),
    };
    Ok(store)
}

/// Fixed-width RFC 3339 text of a commit time
pub fn format_commit_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a commit time written by `format_commit_time`
pub fn parse_commit_time(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| Error::Corrupted(format!("bad commit time {:?}: {}", text, e)))
}

/// Commit timestamps that never repeat or go backwards within one store
#[derive(Debug, Default)]
pub struct CommitClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl CommitClock {
    /// New clock
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock whose first tick is later than `floor`
    ///
    /// Used when reopening a store, so a wall clock that went backwards
    /// cannot issue times older than records already committed.
    pub fn starting_after(floor: DateTime<Utc>) -> Self {
        Self {
            last: Mutex::new(Some(floor)),
        }
    }

    /// Latest time handed out
    pub fn last(&self) -> Option<DateTime<Utc>> {
        *self.last.lock()
    }

    /// Next commit time, RFC 3339 UTC with nanosecond precision
    ///
    /// The fixed-width format sorts lexicographically in time order.
    pub fn tick(&self) -> String {
        let mut last = self.last.lock();
        let mut now = Utc::now();
        if let Some(prev) = *last {
            if now <= prev {
                now = prev + Duration::nanoseconds(1);
            }
        }
        *last = Some(now);
        format_commit_time(now)
    }

    /// Commit context with a fresh time-ordered transaction id
    pub fn context(&self) -> CommitContext {
        CommitContext {
            timestamp: self.tick(),
            transaction_id: Uuid::now_v7().to_string(),
        }
    }
}
