//! History and listing queries
//!
//! Two strategies answer "all events of application X, in order":
//!
//! - **Maintained**: every registration also writes an index entry keyed
//!   `correlation_id 0x00 timestamp 0x00 transaction_id 0x00 event_id`
//!   into the `indices` keyspace, in the same commit as the record. A
//!   prefix scan then returns the history already in order.
//! - **Scan**: walk the whole `events` keyspace in chunks, keep the
//!   matching records and sort them by (timestamp, transaction id).
//!
//! Both return identical sequences for the same store contents. The scan
//! path is used whenever the store cannot serve secondary lookups.

use crate::{
    codec,
    config::QueryConfig,
    storage::{format_commit_time, KeyRange, Keyspace, RecordStore, WriteBatch},
    types::{AuditEvent, EventType, Page, PageToken},
    Error, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const SEPARATOR: u8 = 0;

/// How history queries are answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStrategy {
    /// Maintained when the store supports it, scan otherwise
    #[default]
    Auto,
    /// Secondary index written with every event
    Maintained,
    /// Full scan, filter and sort per query
    Scan,
}

impl IndexStrategy {
    /// Concrete strategy for a store (never `Auto`)
    pub fn resolve(self, store_supports_index: bool) -> IndexStrategy {
        match self {
            IndexStrategy::Auto | IndexStrategy::Maintained if store_supports_index => {
                IndexStrategy::Maintained
            }
            IndexStrategy::Maintained => {
                tracing::warn!("Store has no secondary index support, falling back to scan");
                IndexStrategy::Scan
            }
            _ => IndexStrategy::Scan,
        }
    }

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStrategy::Auto => "auto",
            IndexStrategy::Maintained => "maintained",
            IndexStrategy::Scan => "scan",
        }
    }
}

impl std::str::FromStr for IndexStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(IndexStrategy::Auto),
            "maintained" => Ok(IndexStrategy::Maintained),
            "scan" => Ok(IndexStrategy::Scan),
            other => Err(Error::Config(format!("unknown index strategy: {}", other))),
        }
    }
}

/// Index key for an event
pub fn index_key(event: &AuditEvent) -> Vec<u8> {
    let mut key = history_prefix(&event.correlation_id);
    key.extend_from_slice(event.timestamp.as_bytes());
    key.push(SEPARATOR);
    key.extend_from_slice(event.transaction_id.as_bytes());
    key.push(SEPARATOR);
    key.extend_from_slice(event.id.as_bytes());
    key
}

/// Common prefix of every index key of one correlation id
pub fn history_prefix(correlation_id: &str) -> Vec<u8> {
    let mut key = correlation_id.as_bytes().to_vec();
    key.push(SEPARATOR);
    key
}

/// Event id stored in the last segment of an index key
fn event_id_from_index_key(key: &[u8]) -> Result<&[u8]> {
    key.iter()
        .rposition(|b| *b == SEPARATOR)
        .map(|pos| &key[pos + 1..])
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            Error::QueryFailure(format!(
                "malformed index key: {}",
                String::from_utf8_lossy(key)
            ))
        })
}

/// Scan errors surface as query failures
fn query_failure(err: Error) -> Error {
    match err {
        Error::StorageUnavailable(msg) => Error::QueryFailure(msg),
        other => other,
    }
}

/// Parameterized filter over the ledger
///
/// Every field is optional; unset fields match everything. Results are
/// ordered by (timestamp, transaction id).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventQuery {
    /// Only events of this application
    pub correlation_id: Option<String>,
    /// Only events of this kind
    pub event_type: Option<EventType>,
    /// Committed at or after this instant
    pub from: Option<DateTime<Utc>>,
    /// Committed strictly before this instant
    pub until: Option<DateTime<Utc>>,
    /// At most this many results
    pub limit: Option<usize>,
}

impl EventQuery {
    /// Query matching every event
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one application
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Restrict to one event kind
    pub fn event_type(mut self, event_type: impl Into<EventType>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Lower time bound (inclusive)
    pub fn from(mut self, from: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self
    }

    /// Upper time bound (exclusive)
    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    /// Cap the number of results
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matcher(&self) -> impl Fn(&AuditEvent) -> bool + '_ {
        let from = self.from.map(format_commit_time);
        let until = self.until.map(format_commit_time);

        move |event: &AuditEvent| {
            self.correlation_id
                .as_ref()
                .map_or(true, |c| &event.correlation_id == c)
                && self.event_type.as_ref().map_or(true, |t| &event.event_type == t)
                && from.as_ref().map_or(true, |f| event.timestamp.as_str() >= f.as_str())
                && until.as_ref().map_or(true, |u| event.timestamp.as_str() < u.as_str())
        }
    }
}

/// Read side of the ledger plus index maintenance
pub struct QueryEngine<S: RecordStore + ?Sized> {
    store: Arc<S>,
    strategy: IndexStrategy,
    config: QueryConfig,
}

impl<S: RecordStore + ?Sized> std::fmt::Debug for QueryEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("strategy", &self.strategy)
            .field("config", &self.config)
            .finish()
    }
}

impl<S: RecordStore + ?Sized> QueryEngine<S> {
    /// Create an engine over `store`
    pub fn new(store: Arc<S>, strategy: IndexStrategy, mut config: QueryConfig) -> Self {
        let strategy = strategy.resolve(store.supports_secondary_index());
        // A zero-sized chunk would end every walk before the first entry
        config.scan_chunk_size = config.scan_chunk_size.max(1);
        Self {
            store,
            strategy,
            config,
        }
    }

    /// Strategy in effect (`Maintained` or `Scan`)
    pub fn strategy(&self) -> IndexStrategy {
        self.strategy
    }

    /// Add the index entry for `event` to a registration batch
    pub fn stage_index_entry(&self, batch: &mut WriteBatch, event: &AuditEvent) {
        if self.strategy == IndexStrategy::Maintained {
            batch.put(Keyspace::Index, index_key(event), Vec::new());
        }
    }

    /// All events of one application, ascending by (timestamp, transaction id)
    pub fn history(&self, correlation_id: &str) -> Result<Vec<AuditEvent>> {
        match self.strategy {
            IndexStrategy::Maintained => self.history_from_index(correlation_id),
            _ => self.history_from_scan(correlation_id),
        }
    }

    fn history_from_index(&self, correlation_id: &str) -> Result<Vec<AuditEvent>> {
        let range = KeyRange::prefix(history_prefix(correlation_id));
        let mut events = Vec::new();

        self.for_each_chunk(Keyspace::Index, &range, |entries| {
            for (key, _) in entries {
                let event_id = event_id_from_index_key(key)?;
                let bytes = self
                    .store
                    .get(Keyspace::Events, event_id)
                    .map_err(query_failure)?
                    .ok_or_else(|| {
                        Error::QueryFailure(format!(
                            "index entry points at missing event {}",
                            String::from_utf8_lossy(event_id)
                        ))
                    })?;
                events.push(codec::decode(&bytes)?);
            }
            Ok(())
        })?;

        Ok(events)
    }

    fn history_from_scan(&self, correlation_id: &str) -> Result<Vec<AuditEvent>> {
        let mut events = self.collect_matching(|event| event.correlation_id == correlation_id)?;
        sort_history(&mut events);
        Ok(events)
    }

    /// One page of all events in id order
    ///
    /// `page_size` 0 means the configured default; larger sizes are
    /// clamped to the configured maximum.
    pub fn list_all(&self, page_token: Option<&PageToken>, page_size: usize) -> Result<Page> {
        let requested = if page_size == 0 {
            self.config.default_page_size
        } else {
            page_size
        };
        let page_size = requested.min(self.config.max_page_size).max(1);

        let range = match page_token {
            Some(token) => KeyRange::after(token.last_key().as_bytes().to_vec()),
            None => KeyRange::all(),
        };

        let mut entries = self
            .store
            .scan(Keyspace::Events, &range, Some(page_size.saturating_add(1)))
            .map_err(query_failure)?;

        let has_more = entries.len() > page_size;
        entries.truncate(page_size);

        let events = entries
            .iter()
            .map(|(_, value)| codec::decode(value))
            .collect::<Result<Vec<_>>>()?;

        let next_page_token = match (has_more, events.last()) {
            (true, Some(last)) => Some(PageToken::after(last.id.clone())),
            _ => None,
        };

        Ok(Page {
            events,
            next_page_token,
        })
    }

    /// Events matching a parameterized filter
    pub fn query(&self, query: &EventQuery) -> Result<Vec<AuditEvent>> {
        let matches = query.matcher();

        let mut events = match &query.correlation_id {
            Some(correlation_id) => {
                let mut events = self.history(correlation_id)?;
                events.retain(|event| matches(event));
                events
            }
            None => {
                let mut events = self.collect_matching(&matches)?;
                sort_history(&mut events);
                events
            }
        };

        if let Some(limit) = query.limit {
            events.truncate(limit);
        }

        Ok(events)
    }

    /// Write missing index entries for every stored event
    ///
    /// Returns how many entries were added. Running it again adds none.
    pub fn rebuild_index(&self) -> Result<usize> {
        if !self.store.supports_secondary_index() {
            return Err(Error::QueryFailure(
                "store does not support a secondary index".to_string(),
            ));
        }

        let mut written = 0;
        self.for_each_chunk(Keyspace::Events, &KeyRange::all(), |entries| {
            let mut batch = WriteBatch::new();
            for (_, value) in entries {
                let event = codec::decode(value)?;
                let key = index_key(&event);
                if !self.store.exists(Keyspace::Index, &key).map_err(query_failure)? {
                    batch.put(Keyspace::Index, key, Vec::new());
                }
            }

            if !batch.is_empty() {
                written += batch.len();
                self.store.commit(batch)?;
            }
            Ok(())
        })?;

        tracing::info!(entries = written, "Index rebuilt");
        Ok(written)
    }

    /// Decode every stored event and keep those matching `keep`
    fn collect_matching(&self, keep: impl Fn(&AuditEvent) -> bool) -> Result<Vec<AuditEvent>> {
        let mut events = Vec::new();
        self.for_each_chunk(Keyspace::Events, &KeyRange::all(), |entries| {
            for (_, value) in entries {
                let event = codec::decode(value)?;
                if keep(&event) {
                    events.push(event);
                }
            }
            Ok(())
        })?;
        Ok(events)
    }

    /// Walk `range` in chunks of `scan_chunk_size`
    fn for_each_chunk(
        &self,
        keyspace: Keyspace,
        range: &KeyRange,
        mut visit: impl FnMut(&[(Vec<u8>, Vec<u8>)]) -> Result<()>,
    ) -> Result<()> {
        let chunk_size = self.config.scan_chunk_size;
        let mut cursor = range.clone();

        loop {
            let entries = self
                .store
                .scan(keyspace, &cursor, Some(chunk_size))
                .map_err(query_failure)?;

            visit(&entries)?;

            match entries.last() {
                Some((last_key, _)) if entries.len() == chunk_size => {
                    cursor = range.resume_after(last_key);
                }
                _ => return Ok(()),
            }
        }
    }
}

fn sort_history(events: &mut [AuditEvent]) {
    events.sort_by(|a, b| a.history_order().cmp(&b.history_order()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::{CommitContext, NewEvent};
    use crate::value::Value;

    fn event(id: &str, correlation_id: &str, timestamp: &str, tx: &str) -> AuditEvent {
        let ctx = CommitContext {
            transaction_id: tx.to_string(),
            timestamp: timestamp.to_string(),
        };
        AuditEvent::commit(
            NewEvent::new(id, "CAMBIO_ESTADO", correlation_id, "u1", "Ana", Value::empty_mapping()),
            &ctx,
        )
    }

    fn store_events(store: &MemoryStore, events: &[AuditEvent]) {
        let mut batch = WriteBatch::new();
        for event in events {
            batch.put_if_absent(Keyspace::Events, event.id.as_bytes(), codec::encode(event).unwrap());
            batch.put(Keyspace::Index, index_key(event), Vec::new());
        }
        store.commit(batch).unwrap();
    }

    fn small_chunks() -> QueryConfig {
        QueryConfig {
            default_page_size: 2,
            max_page_size: 3,
            scan_chunk_size: 2,
        }
    }

    #[test]
    fn test_strategy_resolution() {
        assert_eq!(IndexStrategy::Auto.resolve(true), IndexStrategy::Maintained);
        assert_eq!(IndexStrategy::Auto.resolve(false), IndexStrategy::Scan);
        assert_eq!(IndexStrategy::Maintained.resolve(false), IndexStrategy::Scan);
        assert_eq!(IndexStrategy::Scan.resolve(true), IndexStrategy::Scan);
        assert_eq!("Maintained".parse::<IndexStrategy>().unwrap(), IndexStrategy::Maintained);
    }

    #[test]
    fn test_index_key_layout() {
        let e = event("ev-1", "post-42", "2026-01-01T00:00:00.000000001Z", "tx-a");
        let key = index_key(&e);
        assert!(key.starts_with(b"post-42\0"));
        assert_eq!(event_id_from_index_key(&key).unwrap(), b"ev-1");
    }

    #[test]
    fn test_strategies_agree_on_history() {
        let store = Arc::new(MemoryStore::new());
        store_events(
            &store,
            &[
                event("z-late", "post-1", "2026-01-01T00:00:03.000000000Z", "tx-3"),
                event("a-early", "post-1", "2026-01-01T00:00:01.000000000Z", "tx-1"),
                event("other", "post-10", "2026-01-01T00:00:00.000000000Z", "tx-0"),
                event("m-mid", "post-1", "2026-01-01T00:00:02.000000000Z", "tx-2"),
                // Same timestamp: transaction id breaks the tie
                event("b-tie", "post-1", "2026-01-01T00:00:02.000000000Z", "tx-1b"),
            ],
        );

        let maintained = QueryEngine::new(store.clone(), IndexStrategy::Maintained, small_chunks());
        let scan = QueryEngine::new(store, IndexStrategy::Scan, small_chunks());

        let from_index = maintained.history("post-1").unwrap();
        let from_scan = scan.history("post-1").unwrap();

        let ids: Vec<&str> = from_index.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a-early", "b-tie", "m-mid", "z-late"]);
        assert_eq!(from_index, from_scan);
    }

    #[test]
    fn test_history_of_unknown_application_is_empty() {
        let engine = QueryEngine::new(
            Arc::new(MemoryStore::new()),
            IndexStrategy::Auto,
            QueryConfig::default(),
        );
        assert!(engine.history("post-404").unwrap().is_empty());
    }

    #[test]
    fn test_dangling_index_entry_is_query_failure() {
        let store = Arc::new(MemoryStore::new());
        let e = event("ghost", "post-1", "2026-01-01T00:00:00.000000000Z", "tx-1");
        let mut batch = WriteBatch::new();
        batch.put(Keyspace::Index, index_key(&e), Vec::new());
        store.commit(batch).unwrap();

        let engine = QueryEngine::new(store, IndexStrategy::Maintained, QueryConfig::default());
        assert!(matches!(engine.history("post-1"), Err(Error::QueryFailure(_))));
    }

    #[test]
    fn test_list_all_pages_through_everything() {
        let store = Arc::new(MemoryStore::new());
        let events: Vec<AuditEvent> = (0..7)
            .map(|i| {
                event(
                    &format!("ev-{}", i),
                    "post-1",
                    &format!("2026-01-01T00:00:0{}.000000000Z", i),
                    &format!("tx-{}", i),
                )
            })
            .collect();
        store_events(&store, &events);

        let engine = QueryEngine::new(store, IndexStrategy::Scan, small_chunks());

        let mut seen = Vec::new();
        let mut token = None;
        let mut pages = 0;
        loop {
            let page = engine.list_all(token.as_ref(), 0).unwrap();
            assert!(page.events.len() <= 2);
            seen.extend(page.events.into_iter().map(|e| e.id));
            pages += 1;
            match page.next_page_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        assert_eq!(pages, 4);
        let expected: Vec<String> = (0..7).map(|i| format!("ev-{}", i)).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_list_all_clamps_page_size() {
        let store = Arc::new(MemoryStore::new());
        let events: Vec<AuditEvent> = (0..5)
            .map(|i| event(&format!("ev-{}", i), "p", "2026-01-01T00:00:00.000000000Z", &format!("tx-{}", i)))
            .collect();
        store_events(&store, &events);

        let engine = QueryEngine::new(store, IndexStrategy::Scan, small_chunks());
        let page = engine.list_all(None, 100).unwrap();
        assert_eq!(page.events.len(), 3);
        assert!(page.next_page_token.is_some());
    }

    #[test]
    fn test_list_all_on_empty_store() {
        let engine = QueryEngine::new(
            Arc::new(MemoryStore::new()),
            IndexStrategy::Auto,
            QueryConfig::default(),
        );
        let page = engine.list_all(None, 10).unwrap();
        assert!(page.events.is_empty());
        assert!(page.next_page_token.is_none());
    }

    #[test]
    fn test_query_filters() {
        let store = Arc::new(MemoryStore::new());
        let mut granted = event("ev-3", "post-2", "2026-02-01T00:00:00.000000000Z", "tx-3");
        granted.event_type = EventType::new(EventType::SCHOLARSHIP_GRANTED);
        store_events(
            &store,
            &[
                event("ev-1", "post-1", "2026-01-01T00:00:00.000000000Z", "tx-1"),
                event("ev-2", "post-1", "2026-01-15T00:00:00.000000000Z", "tx-2"),
                granted,
            ],
        );

        let engine = QueryEngine::new(store, IndexStrategy::Maintained, small_chunks());

        let by_type = engine
            .query(&EventQuery::new().event_type(EventType::SCHOLARSHIP_GRANTED))
            .unwrap();
        assert_eq!(by_type.len(), 1);
        assert_eq!(by_type[0].id, "ev-3");

        let january = engine
            .query(
                &EventQuery::new()
                    .from("2026-01-01T00:00:00Z".parse().unwrap())
                    .until("2026-02-01T00:00:00Z".parse().unwrap()),
            )
            .unwrap();
        let ids: Vec<&str> = january.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["ev-1", "ev-2"]);

        let limited = engine
            .query(&EventQuery::new().correlation_id("post-1").limit(1))
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, "ev-1");
    }

    #[test]
    fn test_rebuild_index_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let events: Vec<AuditEvent> = (0..5)
            .map(|i| {
                event(
                    &format!("ev-{}", i),
                    "post-9",
                    &format!("2026-01-01T00:00:0{}.000000000Z", i),
                    &format!("tx-{}", i),
                )
            })
            .collect();

        // Records only, as written under the scan strategy
        let mut batch = WriteBatch::new();
        for e in &events {
            batch.put_if_absent(Keyspace::Events, e.id.as_bytes(), codec::encode(e).unwrap());
        }
        store.commit(batch).unwrap();

        let engine = QueryEngine::new(store, IndexStrategy::Maintained, small_chunks());
        assert!(engine.history("post-9").unwrap().is_empty());

        assert_eq!(engine.rebuild_index().unwrap(), 5);
        assert_eq!(engine.rebuild_index().unwrap(), 0);
        assert_eq!(engine.history("post-9").unwrap(), events);
    }

    #[test]
    fn test_zero_chunk_size_still_scans() {
        let store = Arc::new(MemoryStore::new());
        let events = vec![
            event("ev-1", "post-42", "2026-01-01T00:00:01.000000000Z", "tx-1"),
            event("ev-2", "post-42", "2026-01-01T00:00:02.000000000Z", "tx-2"),
        ];
        let mut batch = WriteBatch::new();
        for e in &events {
            batch.put_if_absent(Keyspace::Events, e.id.as_bytes(), codec::encode(e).unwrap());
        }
        store.commit(batch).unwrap();

        let config = QueryConfig {
            scan_chunk_size: 0,
            ..QueryConfig::default()
        };
        let engine = QueryEngine::new(store, IndexStrategy::Scan, config);
        assert_eq!(engine.history("post-42").unwrap(), events);
    }

    #[test]
    fn test_unbounded_page_size_does_not_overflow() {
        let store = Arc::new(MemoryStore::new());
        store_events(
            &store,
            &[event("ev-1", "post-1", "2026-01-01T00:00:01.000000000Z", "tx-1")],
        );

        let config = QueryConfig {
            max_page_size: usize::MAX,
            ..QueryConfig::default()
        };
        let engine = QueryEngine::new(store, IndexStrategy::Maintained, config);
        let page = engine.list_all(None, usize::MAX).unwrap();
        assert_eq!(page.events.len(), 1);
        assert!(page.next_page_token.is_none());
    }
}
