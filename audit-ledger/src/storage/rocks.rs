//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `events` - Append-only event log (key: event id)
//! - `indices` - Secondary index for history lookups
//! - `meta` - Store bookkeeping (latest commit time)
//!
//! A plain RocksDB handle has no conflict detection between writers, so
//! the guard check and the batch write run under a commit mutex. Reads
//! never take it.

use super::{
    format_commit_time, parse_commit_time, CommitClock, Entry, KeyRange, Keyspace, RecordStore,
    WriteBatch, WriteOp,
};
use crate::{types::CommitContext, Config, Error, Result};
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    DB,
};
use std::collections::HashSet;
use std::sync::Arc;

const CF_EVENTS: &str = Keyspace::Events.name();
const CF_INDICES: &str = Keyspace::Index.name();
const CF_META: &str = "meta";

/// Latest commit time handed out, rewritten by every commit
const CLOCK_KEY: &[u8] = b"commit_clock";

fn meta_cf(db: &DB) -> Result<Arc<BoundColumnFamily<'_>>> {
    db.cf_handle(CF_META)
        .ok_or_else(|| Error::StorageUnavailable(format!("Column family {} not found", CF_META)))
}

/// Durable store backed by RocksDB
pub struct RocksStore {
    db: DB,
    commit_lock: Mutex<()>,
    clock: CommitClock,
}

impl std::fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStore")
            .field("path", &self.db.path())
            .finish()
    }
}

impl RocksStore {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        // Universal compaction for append-only workload
        db_opts.set_compaction_style(DBCompactionStyle::Universal);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_EVENTS, Self::cf_options_events()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        let clock = Self::restore_clock(&db)?;

        tracing::info!(path = ?path, clock = ?clock.last(), "Opened RocksDB record store");

        Ok(Self {
            db,
            commit_lock: Mutex::new(()),
            clock,
        })
    }

    /// Resume the commit clock after the last persisted commit time
    fn restore_clock(db: &DB) -> Result<CommitClock> {
        let meta = meta_cf(db)?;

        match db.get_cf(&meta, CLOCK_KEY)? {
            Some(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                Ok(CommitClock::starting_after(parse_commit_time(&text)?))
            }
            None => Ok(CommitClock::new()),
        }
    }

    fn cf_options_events() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        // Indices benefit from bloom filters
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, keyspace: Keyspace) -> Result<Arc<BoundColumnFamily<'_>>> {
        let name = keyspace.name();
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::StorageUnavailable(format!("Column family {} not found", name)))
    }
}

impl RecordStore for RocksStore {
    fn get(&self, keyspace: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf_handle(keyspace)?;
        Ok(self.db.get_cf(&cf, key)?)
    }

    fn exists(&self, keyspace: Keyspace, key: &[u8]) -> Result<bool> {
        let cf = self.cf_handle(keyspace)?;
        Ok(self.db.get_pinned_cf(&cf, key)?.is_some())
    }

    fn scan(&self, keyspace: Keyspace, range: &KeyRange, limit: Option<usize>) -> Result<Vec<Entry>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let cf = self.cf_handle(keyspace)?;
        let mode = match range.start() {
            Some(start) => IteratorMode::From(start, Direction::Forward),
            None => IteratorMode::Start,
        };
        let limit = limit.unwrap_or(usize::MAX);

        let mut entries = Vec::new();
        for item in self.db.iterator_cf(&cf, mode) {
            if entries.len() >= limit {
                break;
            }
            let (key, value) = item.map_err(|e| Error::QueryFailure(e.to_string()))?;
            if !range.below_end(&key) {
                break;
            }
            entries.push((key.to_vec(), value.to_vec()));
        }

        Ok(entries)
    }

    fn begin(&self) -> Result<CommitContext> {
        Ok(self.clock.context())
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        let _guard = self.commit_lock.lock();

        let mut write = rocksdb::WriteBatch::default();
        let mut guarded = HashSet::new();

        for op in batch.ops() {
            match op {
                WriteOp::PutIfAbsent { keyspace, key, value } => {
                    let cf = self.cf_handle(*keyspace)?;
                    if !guarded.insert((*keyspace, key)) || self.db.get_pinned_cf(&cf, key)?.is_some() {
                        return Err(Error::Conflict {
                            key: String::from_utf8_lossy(key).into_owned(),
                        });
                    }
                    write.put_cf(&cf, key, value);
                }
                WriteOp::Put { keyspace, key, value } => {
                    let cf = self.cf_handle(*keyspace)?;
                    write.put_cf(&cf, key, value);
                }
            }
        }

        // The clock has already ticked for every timestamp in this batch
        if let Some(last) = self.clock.last() {
            let meta = meta_cf(&self.db)?;
            write.put_cf(&meta, CLOCK_KEY, format_commit_time(last));
        }

        // Atomic commit
        self.db.write(write)?;

        Ok(())
    }

    fn approximate_len(&self, keyspace: Keyspace) -> Result<u64> {
        let cf = self.cf_handle(keyspace)?;
        let estimate = self
            .db
            .property_int_value_cf(&cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);
        Ok(estimate)
    }
}
