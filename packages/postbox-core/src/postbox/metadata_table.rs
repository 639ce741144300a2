//! Small singleton records: the account sync cursor and the total unread
//! counter.

use serde::{de::DeserializeOwned, Serialize};

use super::table::{CachedTable, Table, TableCodec};
use super::value_box::{ValueBox, ValueBoxKey, ValueBoxTable};
use crate::error::Result;

/// Record stored in the metadata table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKey {
    /// Opaque sync cursor owned by the synchronization layer
    State,
    /// Sum of every peer's unread counter
    TotalUnreadCount,
}

impl MetadataKey {
    fn tag(self) -> u8 {
        match self {
            MetadataKey::State => 1,
            MetadataKey::TotalUnreadCount => 2,
        }
    }
}

/// Raw bytes keyed by a one-byte tag
pub struct MetadataCodec;

impl TableCodec for MetadataCodec {
    type Key = MetadataKey;
    type Value = Vec<u8>;

    fn encode_key(key: &MetadataKey) -> ValueBoxKey {
        ValueBoxKey::with_capacity(1).push_u8(key.tag())
    }

    fn encode_value(value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode_value(bytes: &[u8]) -> Option<Vec<u8>> {
        Some(bytes.to_vec())
    }
}

/// Metadata over [`CachedTable`], values encoded with bincode
pub struct MetadataTable {
    inner: CachedTable<MetadataCodec>,
}

impl MetadataTable {
    /// Create the table over `table`
    pub fn new(table: ValueBoxTable) -> Self {
        Self {
            inner: CachedTable::new(table),
        }
    }

    fn get_value<T: DeserializeOwned>(&mut self, value_box: &dyn ValueBox, key: MetadataKey) -> Result<Option<T>> {
        let Some(bytes) = self.inner.get(value_box, &key)? else {
            return Ok(None);
        };
        match bincode::deserialize(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!("Undecodable metadata {:?}: {}", key, e);
                Ok(None)
            }
        }
    }

    fn set_value<T: Serialize>(&mut self, key: MetadataKey, value: &T) -> Result<()> {
        self.inner.set(key, bincode::serialize(value)?);
        Ok(())
    }

    /// Stored sync cursor
    pub fn state<T: DeserializeOwned>(&mut self, value_box: &dyn ValueBox) -> Result<Option<T>> {
        self.get_value(value_box, MetadataKey::State)
    }

    /// Replace the sync cursor
    pub fn set_state<T: Serialize>(&mut self, state: &T) -> Result<()> {
        self.set_value(MetadataKey::State, state)
    }

    /// Stored total unread count, zero when never written
    pub fn total_unread_count(&mut self, value_box: &dyn ValueBox) -> Result<i32> {
        Ok(self
            .get_value(value_box, MetadataKey::TotalUnreadCount)?
            .unwrap_or(0))
    }

    /// Replace the total unread count
    pub fn set_total_unread_count(&mut self, count: i32) -> Result<()> {
        self.set_value(MetadataKey::TotalUnreadCount, &count)
    }
}

impl Table for MetadataTable {
    fn before_commit(&mut self, value_box: &mut dyn ValueBox) -> Result<()> {
        self.inner.before_commit(value_box)
    }

    fn discard_uncommitted(&mut self) {
        self.inner.discard_uncommitted()
    }

    fn clear_memory_cache(&mut self) {
        self.inner.clear_memory_cache()
    }

    fn has_uncommitted(&self) -> bool {
        self.inner.has_uncommitted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postbox::value_box::SqliteValueBox;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Cursor {
        pts: i32,
        date: i32,
    }

    #[test]
    fn test_state_and_unread_count_persist() {
        let mut vb = SqliteValueBox::open(None).unwrap();
        let mut table = MetadataTable::new(ValueBoxTable::new(7));
        assert_eq!(table.state::<Cursor>(&vb).unwrap(), None);
        assert_eq!(table.total_unread_count(&vb).unwrap(), 0);

        table.set_state(&Cursor { pts: 5, date: 100 }).unwrap();
        table.set_total_unread_count(12).unwrap();
        vb.begin().unwrap();
        table.before_commit(&mut vb).unwrap();
        vb.commit().unwrap();

        let mut fresh = MetadataTable::new(ValueBoxTable::new(7));
        assert_eq!(fresh.state::<Cursor>(&vb).unwrap(), Some(Cursor { pts: 5, date: 100 }));
        assert_eq!(fresh.total_unread_count(&vb).unwrap(), 12);
    }

    #[test]
    fn test_mismatched_state_type_reads_as_absent() {
        let mut table = MetadataTable::new(ValueBoxTable::new(7));
        let vb = SqliteValueBox::open(None).unwrap();
        table.set_state(&1u8).unwrap();
        assert_eq!(table.state::<Cursor>(&vb).unwrap(), None);
    }
}
