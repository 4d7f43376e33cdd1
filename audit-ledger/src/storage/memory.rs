//! In-memory record store
//!
//! Holds both keyspaces in ordered maps behind one lock. A commit takes the
//! write lock for the guard check and the apply, so it is atomic with
//! respect to every reader and writer in the process.

use super::{CommitClock, Entry, KeyRange, Keyspace, RecordStore, WriteBatch, WriteOp};
use crate::{types::CommitContext, Error, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;

type Tree = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug, Default)]
struct Trees {
    events: Tree,
    index: Tree,
}

impl Trees {
    fn tree(&self, keyspace: Keyspace) -> &Tree {
        match keyspace {
            Keyspace::Events => &self.events,
            Keyspace::Index => &self.index,
        }
    }

    fn tree_mut(&mut self, keyspace: Keyspace) -> &mut Tree {
        match keyspace {
            Keyspace::Events => &mut self.events,
            Keyspace::Index => &mut self.index,
        }
    }
}

/// Non-durable store for tests, tooling and embedding
#[derive(Debug, Default)]
pub struct MemoryStore {
    trees: RwLock<Trees>,
    clock: CommitClock,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn get(&self, keyspace: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.trees.read().tree(keyspace).get(key).cloned())
    }

    fn scan(&self, keyspace: Keyspace, range: &KeyRange, limit: Option<usize>) -> Result<Vec<Entry>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let lower = range.start().map_or(Bound::Unbounded, Bound::Included);
        let upper = range.end().map_or(Bound::Unbounded, Bound::Excluded);

        let trees = self.trees.read();
        let entries = trees
            .tree(keyspace)
            .range::<[u8], _>((lower, upper))
            .take(limit.unwrap_or(usize::MAX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(entries)
    }

    fn begin(&self) -> Result<CommitContext> {
        Ok(self.clock.context())
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut trees = self.trees.write();

        // Validate every guard before touching anything
        let mut guarded = HashSet::new();
        for op in batch.ops() {
            if let WriteOp::PutIfAbsent { keyspace, key, .. } = op {
                if trees.tree(*keyspace).contains_key(key) || !guarded.insert((*keyspace, key)) {
                    return Err(Error::Conflict {
                        key: String::from_utf8_lossy(key).into_owned(),
                    });
                }
            }
        }

        for op in batch.ops() {
            match op {
                WriteOp::PutIfAbsent { keyspace, key, value } | WriteOp::Put { keyspace, key, value } => {
                    trees.tree_mut(*keyspace).insert(key.clone(), value.clone());
                }
            }
        }

        Ok(())
    }

    fn approximate_len(&self, keyspace: Keyspace) -> Result<u64> {
        Ok(self.trees.read().tree(keyspace).len() as u64)
    }
}
