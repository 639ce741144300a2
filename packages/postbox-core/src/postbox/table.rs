//! # Tables
//!
//! Typed views over raw [`ValueBox`] tables.
//!
//! ## Cache Lifecycle
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        TABLE CACHE LIFECYCLE                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   get(key) ──► cache hit? ──yes──► return cached (present or absent)   │
//! │                    │                                                    │
//! │                    no                                                   │
//! │                    ▼                                                    │
//! │              value box read ──► decode ──► cache ──► return            │
//! │                                                                         │
//! │   set/remove(key) ──► cache updated, key added to dirty set            │
//! │                                                                         │
//! │   before_commit() ──► write dirty keys (set or remove), clear dirty    │
//! │   discard_uncommitted() ──► forget dirty keys (transaction aborted)    │
//! │   clear_memory_cache() ──► drop every cached entry                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use super::value_box::{ValueBox, ValueBoxKey, ValueBoxTable};
use crate::error::Result;

/// Hooks the transaction controller drives on every table
pub trait Table: Send {
    /// Flush this transaction's dirty entries into the engine.
    ///
    /// Called once per committed transaction; a no-op when nothing is dirty.
    fn before_commit(&mut self, value_box: &mut dyn ValueBox) -> Result<()>;

    /// Forget this transaction's dirty bookkeeping after an abort
    fn discard_uncommitted(&mut self);

    /// Drop every cached record.
    ///
    /// Dirty entries must have been committed or discarded first.
    fn clear_memory_cache(&mut self);

    /// Whether any mutation is waiting for `before_commit`
    fn has_uncommitted(&self) -> bool;
}

/// Key and value encoding for a [`CachedTable`]
pub trait TableCodec {
    /// Decoded key
    type Key: Clone + Eq + Hash + Debug + Send;
    /// Decoded record
    type Value: Clone + Send;

    /// Engine key for `key`
    fn encode_key(key: &Self::Key) -> ValueBoxKey;

    /// Stored bytes for `value`
    fn encode_value(value: &Self::Value) -> Result<Vec<u8>>;

    /// Record from stored bytes, `None` when the bytes are not decodable
    fn decode_value(bytes: &[u8]) -> Option<Self::Value>;
}

/// A table with a read-through cache and write-back on commit
pub struct CachedTable<C: TableCodec> {
    table: ValueBoxTable,
    cache: HashMap<C::Key, Option<C::Value>>,
    dirty: HashSet<C::Key>,
}

impl<C: TableCodec> CachedTable<C> {
    /// Create a table over `table`
    pub fn new(table: ValueBoxTable) -> Self {
        Self {
            table,
            cache: HashMap::new(),
            dirty: HashSet::new(),
        }
    }

    /// Engine table this view reads and writes
    pub fn value_box_table(&self) -> ValueBoxTable {
        self.table
    }

    /// Read a record, consulting the engine only on a cache miss
    pub fn get(&mut self, value_box: &dyn ValueBox, key: &C::Key) -> Result<Option<C::Value>> {
        if let Some(cached) = self.cache.get(key) {
            return Ok(cached.clone());
        }

        let value = match value_box.get(self.table, &C::encode_key(key))? {
            Some(bytes) => {
                let decoded = C::decode_value(&bytes);
                if decoded.is_none() {
                    tracing::warn!(
                        "Undecodable entry {:?} in table {}, treating as absent",
                        key,
                        self.table.id
                    );
                }
                decoded
            }
            None => None,
        };
        self.cache.insert(key.clone(), value.clone());
        Ok(value)
    }

    /// Store a record; written to the engine on commit
    pub fn set(&mut self, key: C::Key, value: C::Value) {
        self.cache.insert(key.clone(), Some(value));
        self.dirty.insert(key);
    }

    /// Remove a record; the deletion reaches the engine on commit
    pub fn remove(&mut self, key: C::Key) {
        self.cache.insert(key.clone(), None);
        self.dirty.insert(key);
    }

    /// Number of entries waiting for commit
    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }
}

impl<C: TableCodec> Table for CachedTable<C> {
    fn before_commit(&mut self, value_box: &mut dyn ValueBox) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        for key in self.dirty.drain() {
            let encoded_key = C::encode_key(&key);
            match self.cache.get(&key) {
                Some(Some(value)) => {
                    let bytes = C::encode_value(value)?;
                    value_box.set(self.table, &encoded_key, &bytes)?;
                }
                _ => value_box.remove(self.table, &encoded_key)?,
            }
        }
        Ok(())
    }

    fn discard_uncommitted(&mut self) {
        for key in self.dirty.drain() {
            self.cache.remove(&key);
        }
    }

    fn clear_memory_cache(&mut self) {
        debug_assert!(
            self.dirty.is_empty(),
            "clear_memory_cache with uncommitted entries in table {}",
            self.table.id
        );
        if !self.dirty.is_empty() {
            tracing::error!(
                "Table {} cleared with {} uncommitted entries",
                self.table.id,
                self.dirty.len()
            );
            self.dirty.clear();
        }
        self.cache.clear();
    }

    fn has_uncommitted(&self) -> bool {
        !self.dirty.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postbox::value_box::SqliteValueBox;

    struct StringCodec;

    impl TableCodec for StringCodec {
        type Key = i32;
        type Value = String;

        fn encode_key(key: &i32) -> ValueBoxKey {
            ValueBoxKey::with_capacity(4).push_i32(*key)
        }

        fn encode_value(value: &String) -> Result<Vec<u8>> {
            Ok(value.as_bytes().to_vec())
        }

        fn decode_value(bytes: &[u8]) -> Option<String> {
            String::from_utf8(bytes.to_vec()).ok()
        }
    }

    const TABLE: ValueBoxTable = ValueBoxTable::new(100);

    fn commit(table: &mut CachedTable<StringCodec>, vb: &mut SqliteValueBox) {
        vb.begin().unwrap();
        table.before_commit(vb).unwrap();
        vb.commit().unwrap();
    }

    #[test]
    fn test_set_is_invisible_to_engine_until_commit() {
        let mut vb = SqliteValueBox::open(None).unwrap();
        let mut table = CachedTable::<StringCodec>::new(TABLE);

        table.set(1, "one".into());
        assert_eq!(table.get(&vb, &1).unwrap(), Some("one".to_string()));
        assert_eq!(vb.get(TABLE, &StringCodec::encode_key(&1)).unwrap(), None);
        assert!(table.has_uncommitted());

        commit(&mut table, &mut vb);
        assert!(!table.has_uncommitted());
        assert_eq!(
            vb.get(TABLE, &StringCodec::encode_key(&1)).unwrap(),
            Some(b"one".to_vec())
        );
    }

    #[test]
    fn test_remove_writes_tombstone() {
        let mut vb = SqliteValueBox::open(None).unwrap();
        let mut table = CachedTable::<StringCodec>::new(TABLE);
        table.set(1, "one".into());
        commit(&mut table, &mut vb);

        table.remove(1);
        assert_eq!(table.get(&vb, &1).unwrap(), None);
        commit(&mut table, &mut vb);
        assert_eq!(vb.get(TABLE, &StringCodec::encode_key(&1)).unwrap(), None);
    }

    #[test]
    fn test_negative_cache_avoids_engine_lookup() {
        let mut vb = SqliteValueBox::open(None).unwrap();
        let mut table = CachedTable::<StringCodec>::new(TABLE);
        assert_eq!(table.get(&vb, &7).unwrap(), None);

        // Written behind the table's back: the cached absence wins.
        vb.begin().unwrap();
        vb.set(TABLE, &StringCodec::encode_key(&7), b"seven").unwrap();
        vb.commit().unwrap();
        assert_eq!(table.get(&vb, &7).unwrap(), None);

        table.clear_memory_cache();
        assert_eq!(table.get(&vb, &7).unwrap(), Some("seven".to_string()));
    }

    #[test]
    fn test_undecodable_bytes_read_as_absent() {
        let mut vb = SqliteValueBox::open(None).unwrap();
        vb.begin().unwrap();
        vb.set(TABLE, &StringCodec::encode_key(&3), &[0xff, 0xfe]).unwrap();
        vb.commit().unwrap();

        let mut table = CachedTable::<StringCodec>::new(TABLE);
        assert_eq!(table.get(&vb, &3).unwrap(), None);
    }

    #[test]
    fn test_discard_then_clear_restores_committed_state() {
        let mut vb = SqliteValueBox::open(None).unwrap();
        let mut table = CachedTable::<StringCodec>::new(TABLE);
        table.set(1, "committed".into());
        commit(&mut table, &mut vb);

        table.set(1, "uncommitted".into());
        table.discard_uncommitted();
        table.clear_memory_cache();
        assert_eq!(table.get(&vb, &1).unwrap(), Some("committed".to_string()));
    }

    #[test]
    fn test_before_commit_without_dirty_entries_is_noop() {
        let mut vb = SqliteValueBox::open(None).unwrap();
        let mut table = CachedTable::<StringCodec>::new(TABLE);
        // No transaction open: any engine write would fail.
        table.before_commit(&mut vb).unwrap();
    }
}
