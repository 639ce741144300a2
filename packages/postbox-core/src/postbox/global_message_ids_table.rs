//! Server-wide message id lookup.
//!
//! Deletion updates for basic chats carry only the global id; this table
//! maps it back to the chat that holds the message. The message id inside
//! the chat equals the global id.

use bytes::{Buf, BufMut, BytesMut};

use super::table::{CachedTable, Table, TableCodec};
use super::types::{MessageId, PeerId};
use super::value_box::{ValueBox, ValueBoxKey, ValueBoxTable};
use crate::error::Result;

/// Codec for `i32 global id -> (i64 peer id, i32 namespace)`
pub struct GlobalMessageIdsCodec;

impl TableCodec for GlobalMessageIdsCodec {
    type Key = i32;
    type Value = MessageId;

    fn encode_key(key: &i32) -> ValueBoxKey {
        ValueBoxKey::with_capacity(4).push_i32(*key)
    }

    fn encode_value(value: &MessageId) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_i64_le(value.peer_id.to_i64());
        buf.put_i32_le(value.namespace);
        Ok(buf.to_vec())
    }

    fn decode_value(mut bytes: &[u8]) -> Option<MessageId> {
        if bytes.remaining() != 12 {
            return None;
        }
        let peer_id = PeerId::from_i64(bytes.get_i64_le());
        let namespace = bytes.get_i32_le();
        // The id is filled in from the key by the table.
        Some(MessageId::new(peer_id, namespace, 0))
    }
}

/// Global id index over [`CachedTable`]
pub struct GlobalMessageIdsTable {
    inner: CachedTable<GlobalMessageIdsCodec>,
}

impl GlobalMessageIdsTable {
    /// Create the table over `table`
    pub fn new(table: ValueBoxTable) -> Self {
        Self {
            inner: CachedTable::new(table),
        }
    }

    /// Message stored under `global_id`
    pub fn get(&mut self, value_box: &dyn ValueBox, global_id: i32) -> Result<Option<MessageId>> {
        Ok(self
            .inner
            .get(value_box, &global_id)?
            .map(|id| MessageId::new(id.peer_id, id.namespace, global_id)))
    }

    /// Register a message under its global id
    pub fn set(&mut self, global_id: i32, message_id: MessageId) {
        self.inner.set(global_id, message_id);
    }

    /// Forget a global id
    pub fn remove(&mut self, global_id: i32) {
        self.inner.remove(global_id);
    }
}

impl Table for GlobalMessageIdsTable {
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

    #[test]
    fn test_global_id_roundtrip_through_engine() {
        let mut vb = SqliteValueBox::open(None).unwrap();
        let mut table = GlobalMessageIdsTable::new(ValueBoxTable::new(6));
        let peer = PeerId::new(1, 77);

        table.set(1234, MessageId::new(peer, 0, 1234));
        vb.begin().unwrap();
        table.before_commit(&mut vb).unwrap();
        vb.commit().unwrap();

        let raw = vb
            .get(ValueBoxTable::new(6), &GlobalMessageIdsCodec::encode_key(&1234))
            .unwrap()
            .unwrap();
        assert_eq!(raw.len(), 12);
        assert_eq!(&raw[0..8], &peer.to_i64().to_le_bytes());

        let mut fresh = GlobalMessageIdsTable::new(ValueBoxTable::new(6));
        assert_eq!(fresh.get(&vb, 1234).unwrap(), Some(MessageId::new(peer, 0, 1234)));
        assert_eq!(fresh.get(&vb, 1).unwrap(), None);
    }
}
