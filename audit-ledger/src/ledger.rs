//! Main ledger orchestration layer
//!
//! Ties the record store, the codec and the query engine together into
//! the ledger API. Every call is synchronous and self-contained; the
//! ledger holds no state of its own beyond the store handle it was given.
//!
//! # Example
//!
//! ```
//! use audit_ledger::{Config, Ledger, MemoryStore, NewEvent, Value};
//! use std::sync::Arc;
//!
//! # fn main() -> audit_ledger::Result<()> {
//! let ledger = Ledger::with_store(Arc::new(MemoryStore::new()), Config::in_memory())?;
//!
//! let payload = Value::parse_json(r#"{"monto": 1000}"#)?;
//! ledger.register_event(NewEvent::new("ev-1", "CREACION", "post-42", "u1", "Ana", payload))?;
//!
//! let history = ledger.get_history("post-42")?;
//! assert_eq!(history.len(), 1);
//! # Ok(())
//! # }
//! ```

use crate::{
    codec,
    index::{EventQuery, IndexStrategy, QueryEngine},
    metrics::Metrics,
    storage::{self, Keyspace, RecordStore, WriteBatch},
    types::{AuditEvent, NewEvent, Page, PageToken, Receipt},
    Config, Error, Result,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Main ledger interface
pub struct Ledger<S: RecordStore + ?Sized = dyn RecordStore> {
    /// Record store handle
    store: Arc<S>,

    /// Read side
    engine: QueryEngine<S>,

    /// Configuration
    config: Config,

    /// Metrics
    metrics: Metrics,
}

/// Ledger statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    /// Approximate number of committed events
    pub total_events: u64,
    /// Approximate number of index entries
    pub index_entries: u64,
    /// History strategy in effect
    pub strategy: IndexStrategy,
}

/// Integrity report for one application's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryDigest {
    /// Application id
    pub correlation_id: String,
    /// Content hash of each event, oldest first
    pub event_hashes: Vec<String>,
    /// SHA-256 over the event hashes in history order, hex
    pub digest: String,
}

impl<S: RecordStore + ?Sized> std::fmt::Debug for Ledger<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("service", &self.config.service_name)
            .field("engine", &self.engine)
            .field("metrics", &self.metrics)
            .finish()
    }
}

impl Ledger<dyn RecordStore> {
    /// Open the backend named in the configuration
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let store = storage::open(&config)?;
        Self::with_store(store, config)
    }
}

impl<S: RecordStore + ?Sized> Ledger<S> {
    /// Build a ledger over an existing store
    pub fn with_store(store: Arc<S>, config: Config) -> Result<Self> {
        config.validate()?;
        let engine = QueryEngine::new(store.clone(), config.index.strategy, config.query.clone());

        tracing::info!(
            service = %config.service_name,
            strategy = engine.strategy().as_str(),
            "Ledger ready"
        );

        Ok(Self {
            store,
            engine,
            config,
            metrics: Metrics::default(),
        })
    }

    /// Replace the metrics collector
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Register a new event
    ///
    /// Assigns the commit timestamp and transaction id, then writes the
    /// record and its index entry as one atomic commit. A second
    /// registration of the same id fails with `AlreadyExists`, whatever
    /// else it carries, and leaves the first record untouched.
    pub fn register_event(&self, event: NewEvent) -> Result<Receipt> {
        let started = Instant::now();

        if event.id.is_empty() {
            return Err(Error::InvalidEvent("event id must not be empty".to_string()));
        }

        if self.store.exists(Keyspace::Events, event.id.as_bytes())? {
            return Err(self.reject_duplicate(event.id));
        }

        event.validate_identifiers()?;
        event.payload.validate_payload(self.config.payload.max_depth)?;

        let ctx = self.store.begin()?;
        let record = AuditEvent::commit(event, &ctx);
        let bytes = codec::encode(&record)?;
        let hash = codec::hash_bytes(&bytes);

        let mut batch = WriteBatch::new();
        batch.put_if_absent(Keyspace::Events, record.id.as_bytes(), bytes);
        self.engine.stage_index_entry(&mut batch, &record);

        match self.store.commit(batch) {
            Ok(()) => {}
            // A concurrent writer committed the same id after our check
            Err(Error::Conflict { .. }) => return Err(self.reject_duplicate(record.id)),
            Err(e) => {
                tracing::error!(event_id = %record.id, error = %e, "Event commit failed");
                return Err(e);
            }
        }

        self.metrics.record_event_registered();
        self.metrics
            .record_register_duration(started.elapsed().as_secs_f64());

        tracing::info!(
            event_id = %record.id,
            event_type = %record.event_type,
            correlation_id = %record.correlation_id,
            transaction_id = %record.transaction_id,
            "Event registered"
        );

        Ok(Receipt {
            event_id: record.id,
            transaction_id: record.transaction_id,
            timestamp: record.timestamp,
            hash,
        })
    }

    fn reject_duplicate(&self, id: String) -> Error {
        self.metrics.record_duplicate();
        tracing::warn!(event_id = %id, "Duplicate event id rejected");
        Error::AlreadyExists(id)
    }

    /// Get event by ID
    pub fn get_event(&self, id: &str) -> Result<AuditEvent> {
        let bytes = self
            .store
            .get(Keyspace::Events, id.as_bytes())?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let event = codec::decode(&bytes)?;
        if event.id != id {
            return Err(Error::Corrupted(format!(
                "record stored under {} carries id {}",
                id, event.id
            )));
        }
        Ok(event)
    }

    /// Whether an event with this id has been committed
    pub fn exists(&self, id: &str) -> Result<bool> {
        self.store.exists(Keyspace::Events, id.as_bytes())
    }

    /// All events of one application, oldest first
    pub fn get_history(&self, correlation_id: &str) -> Result<Vec<AuditEvent>> {
        let started = Instant::now();
        let events = self.engine.history(correlation_id)?;

        self.metrics.record_history(
            started.elapsed().as_secs_f64(),
            self.engine.strategy() == IndexStrategy::Scan,
        );
        tracing::debug!(
            correlation_id = %correlation_id,
            events = events.len(),
            "History loaded"
        );

        Ok(events)
    }

    /// One page of all events in id order
    pub fn list_all(&self, page_token: Option<&PageToken>, page_size: usize) -> Result<Page> {
        self.engine.list_all(page_token, page_size)
    }

    /// Events matching a parameterized filter
    pub fn query(&self, query: &EventQuery) -> Result<Vec<AuditEvent>> {
        self.engine.query(query)
    }

    /// Check a stored record and return its content hash
    ///
    /// The stored bytes must decode, carry the id they are keyed by, and be
    /// in canonical form.
    pub fn verify_event(&self, id: &str) -> Result<String> {
        let bytes = self
            .store
            .get(Keyspace::Events, id.as_bytes())?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let event = codec::decode(&bytes)?;
        if event.id != id {
            return Err(Error::Corrupted(format!(
                "record stored under {} carries id {}",
                id, event.id
            )));
        }
        if codec::encode(&event)? != bytes {
            return Err(Error::Corrupted(format!("record {} is not canonical", id)));
        }

        Ok(codec::hash_bytes(&bytes))
    }

    /// Check every record of one application and digest the whole history
    ///
    /// Fails on the first record that does not verify. An application with
    /// no events yields the digest of an empty sequence.
    pub fn verify_history(&self, correlation_id: &str) -> Result<HistoryDigest> {
        let event_hashes = self
            .engine
            .history(correlation_id)?
            .iter()
            .map(|event| self.verify_event(&event.id))
            .collect::<Result<Vec<_>>>()?;
        let digest = codec::combined_hash(event_hashes.iter().map(String::as_str));

        tracing::debug!(
            correlation_id = %correlation_id,
            events = event_hashes.len(),
            digest = %digest,
            "History verified"
        );

        Ok(HistoryDigest {
            correlation_id: correlation_id.to_string(),
            event_hashes,
            digest,
        })
    }

    /// Write index entries for events stored without one
    pub fn rebuild_index(&self) -> Result<usize> {
        self.engine.rebuild_index()
    }

    /// Storage statistics
    pub fn stats(&self) -> Result<LedgerStats> {
        Ok(LedgerStats {
            total_events: self.store.approximate_len(Keyspace::Events)?,
            index_entries: self.store.approximate_len(Keyspace::Index)?,
            strategy: self.engine.strategy(),
        })
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Store handle
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Entry, KeyRange, MemoryStore};
    use crate::types::CommitContext;
    use crate::value::Value;
    use serde_json::json;

    fn create_test_ledger() -> Ledger<MemoryStore> {
        Ledger::with_store(Arc::new(MemoryStore::new()), Config::in_memory()).unwrap()
    }

    fn new_event(id: &str, correlation_id: &str) -> NewEvent {
        NewEvent::new(
            id,
            "CREACION",
            correlation_id,
            "u1",
            "Ana",
            Value::from(json!({"monto": 1000})),
        )
    }

    /// Store whose commits always fail
    struct BrokenDisk(MemoryStore);

    impl RecordStore for BrokenDisk {
        fn get(&self, keyspace: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>> {
            self.0.get(keyspace, key)
        }

        fn scan(&self, keyspace: Keyspace, range: &KeyRange, limit: Option<usize>) -> Result<Vec<Entry>> {
            self.0.scan(keyspace, range, limit)
        }

        fn begin(&self) -> Result<CommitContext> {
            self.0.begin()
        }

        fn commit(&self, _batch: WriteBatch) -> Result<()> {
            Err(Error::StorageUnavailable("disk full".to_string()))
        }

        fn approximate_len(&self, keyspace: Keyspace) -> Result<u64> {
            self.0.approximate_len(keyspace)
        }
    }

    #[test]
    fn test_register_and_get() {
        let ledger = create_test_ledger();

        let receipt = ledger.register_event(new_event("ev-1", "post-42")).unwrap();
        assert_eq!(receipt.event_id, "ev-1");
        assert_eq!(receipt.hash.len(), 64);

        let event = ledger.get_event("ev-1").unwrap();
        assert_eq!(event.event_type.as_str(), "CREACION");
        assert_eq!(event.correlation_id, "post-42");
        assert_eq!(event.actor_id, "u1");
        assert_eq!(event.actor_name, "Ana");
        assert_eq!(event.payload, Value::from(json!({"monto": 1000})));
        assert!(event.metadata.is_empty_mapping());
        assert_eq!(event.timestamp, receipt.timestamp);
        assert_eq!(event.transaction_id, receipt.transaction_id);
        assert!(!event.transaction_id.is_empty());
    }

    #[test]
    fn test_duplicate_rejected_and_original_kept() {
        let ledger = create_test_ledger();
        ledger.register_event(new_event("ev-1", "post-42")).unwrap();
        let before = ledger.store().get(Keyspace::Events, b"ev-1").unwrap();

        let mut again = new_event("ev-1", "post-99");
        again.actor_name = "Mallory".to_string();
        let err = ledger.register_event(again).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(ref id) if id == "ev-1"));

        let after = ledger.store().get(Keyspace::Events, b"ev-1").unwrap();
        assert_eq!(before, after);
        assert!(ledger.get_history("post-99").unwrap().is_empty());
        assert_eq!(ledger.metrics().duplicates_rejected.get(), 1);
    }

    #[test]
    fn test_duplicate_reported_before_field_checks() {
        let ledger = create_test_ledger();
        ledger.register_event(new_event("ev-1", "post-42")).unwrap();
        let before = ledger.store().get(Keyspace::Events, b"ev-1").unwrap();

        let mut sequence_payload = new_event("ev-1", "post-42");
        sequence_payload.payload = Value::from(json!([1, 2]));

        let nul_correlation = new_event("ev-1", "post\0x");

        let mut too_deep = new_event("ev-1", "post-42");
        let mut nested = json!({"leaf": 1});
        for _ in 0..100 {
            nested = json!({ "inner": nested });
        }
        too_deep.payload = Value::from(nested);

        for attempt in [sequence_payload, nul_correlation, too_deep] {
            let err = ledger.register_event(attempt).unwrap_err();
            assert!(matches!(err, Error::AlreadyExists(ref id) if id == "ev-1"), "{:?}", err);
        }
        assert_eq!(ledger.store().get(Keyspace::Events, b"ev-1").unwrap(), before);
        assert_eq!(ledger.metrics().duplicates_rejected.get(), 3);
    }

    #[test]
    fn test_with_store_validates_config() {
        let mut config = Config::in_memory();
        config.query.scan_chunk_size = 0;
        let result = Ledger::with_store(Arc::new(MemoryStore::new()), config);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_get_missing_event() {
        let ledger = create_test_ledger();
        assert!(matches!(ledger.get_event("nope"), Err(Error::NotFound(_))));
        assert!(matches!(ledger.verify_event("nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_invalid_payload_writes_nothing() {
        let ledger = create_test_ledger();
        let mut event = new_event("ev-1", "post-42");
        event.payload = Value::from(json!("not a mapping"));

        assert!(matches!(ledger.register_event(event), Err(Error::InvalidPayload(_))));
        assert!(!ledger.exists("ev-1").unwrap());
        assert_eq!(ledger.stats().unwrap().total_events, 0);
    }

    #[test]
    fn test_payload_depth_limit() {
        let mut config = Config::in_memory();
        config.payload.max_depth = 2;
        let ledger = Ledger::with_store(Arc::new(MemoryStore::new()), config).unwrap();

        let mut event = new_event("ev-1", "post-42");
        event.payload = Value::from(json!({"a": {"b": 1}}));
        assert!(matches!(ledger.register_event(event), Err(Error::InvalidPayload(_))));
    }

    #[test]
    fn test_empty_id_rejected() {
        let ledger = create_test_ledger();
        assert!(matches!(
            ledger.register_event(new_event("", "post-42")),
            Err(Error::InvalidEvent(_))
        ));
    }

    #[test]
    fn test_storage_failure_leaves_no_state() {
        let ledger = Ledger::with_store(Arc::new(BrokenDisk(MemoryStore::new())), Config::in_memory()).unwrap();

        let err = ledger.register_event(new_event("ev-1", "post-42")).unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable(_)));
        assert!(!ledger.exists("ev-1").unwrap());
        assert!(ledger.get_history("post-42").unwrap().is_empty());
        assert_eq!(ledger.metrics().events_registered.get(), 0);
    }

    #[test]
    fn test_history_order_and_isolation() {
        let ledger = create_test_ledger();
        for (id, correlation_id) in [("c", "post-1"), ("a", "post-2"), ("b", "post-1"), ("d", "post-1")] {
            ledger.register_event(new_event(id, correlation_id)).unwrap();
        }

        let ids: Vec<String> = ledger
            .get_history("post-1")
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["c", "b", "d"]);
    }

    #[test]
    fn test_verify_event() {
        let ledger = create_test_ledger();
        let receipt = ledger.register_event(new_event("ev-1", "post-42")).unwrap();
        assert_eq!(ledger.verify_event("ev-1").unwrap(), receipt.hash);
    }

    #[test]
    fn test_verify_detects_tampering() {
        let ledger = create_test_ledger();

        // Bypass the ledger: a record keyed under one id but carrying another
        let ctx = ledger.store().begin().unwrap();
        let record = AuditEvent::commit(new_event("ev-2", "post-42"), &ctx);
        let mut batch = WriteBatch::new();
        batch.put_if_absent(Keyspace::Events, b"ev-1".to_vec(), codec::encode(&record).unwrap());
        ledger.store().commit(batch).unwrap();

        assert!(matches!(ledger.verify_event("ev-1"), Err(Error::Corrupted(_))));
        assert!(matches!(ledger.get_event("ev-1"), Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_verify_history() {
        let ledger = create_test_ledger();
        let first = ledger.register_event(new_event("ev-1", "post-42")).unwrap();
        let second = ledger.register_event(new_event("ev-2", "post-42")).unwrap();
        ledger.register_event(new_event("ev-3", "post-7")).unwrap();

        let report = ledger.verify_history("post-42").unwrap();
        assert_eq!(report.correlation_id, "post-42");
        assert_eq!(report.event_hashes, vec![first.hash.clone(), second.hash.clone()]);
        assert_eq!(
            report.digest,
            codec::combined_hash([first.hash.as_str(), second.hash.as_str()])
        );
        assert_eq!(ledger.verify_history("post-42").unwrap(), report);

        let empty = ledger.verify_history("post-none").unwrap();
        assert!(empty.event_hashes.is_empty());
        assert_eq!(empty.digest, codec::combined_hash(std::iter::empty()));
    }

    #[test]
    fn test_verify_history_detects_non_canonical_record() {
        let mut config = Config::in_memory();
        config.index.strategy = IndexStrategy::Scan;
        let ledger = Ledger::with_store(Arc::new(MemoryStore::new()), config).unwrap();
        ledger.register_event(new_event("ev-1", "post-42")).unwrap();

        // Same record, stored pretty-printed behind the ledger's back
        let ctx = ledger.store().begin().unwrap();
        let record = AuditEvent::commit(new_event("ev-2", "post-42"), &ctx);
        let mut batch = WriteBatch::new();
        batch.put_if_absent(
            Keyspace::Events,
            b"ev-2".to_vec(),
            serde_json::to_vec_pretty(&record).unwrap(),
        );
        ledger.store().commit(batch).unwrap();

        assert_eq!(ledger.get_history("post-42").unwrap().len(), 2);
        assert!(matches!(
            ledger.verify_history("post-42"),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn test_stats() {
        let ledger = create_test_ledger();
        ledger.register_event(new_event("ev-1", "post-42")).unwrap();
        ledger.register_event(new_event("ev-2", "post-42")).unwrap();

        let stats = ledger.stats().unwrap();
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.index_entries, 2);
        assert_eq!(stats.strategy, IndexStrategy::Maintained);
    }

    #[test]
    fn test_scan_strategy_writes_no_index() {
        let mut config = Config::in_memory();
        config.index.strategy = IndexStrategy::Scan;
        let ledger = Ledger::with_store(Arc::new(MemoryStore::new()), config).unwrap();

        ledger.register_event(new_event("ev-1", "post-42")).unwrap();
        assert_eq!(ledger.stats().unwrap().index_entries, 0);
        assert_eq!(ledger.get_history("post-42").unwrap().len(), 1);
        assert_eq!(ledger.metrics().scan_fallbacks.get(), 1);
    }

    #[test]
    fn test_concurrent_duplicate_registration() {
        let ledger = Arc::new(create_test_ledger());

        let results: Vec<Result<Receipt>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let ledger = ledger.clone();
                    scope.spawn(move || {
                        let mut event = new_event("ev-race", "post-1");
                        event.actor_id = format!("u{}", i);
                        ledger.register_event(event)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, Error::AlreadyExists(_))));
        assert_eq!(ledger.get_history("post-1").unwrap().len(), 1);
    }
}
