//! # Message History Table
//!
//! Stored messages plus the scans the read-state table delegates to.
//!
//! ## Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         MESSAGE HISTORY                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  messages   peer i64 │ ns i32 │ timestamp i32 │ id i32  ──►  Message    │
//! │             (chronological order inside a chat)                         │
//! │                                                                         │
//! │  ids        peer i64 │ ns i32 │ id i32  ──►  timestamp i32, incoming u8 │
//! │             (id order, used for id-based read markers)                  │
//! │                                                                         │
//! │  holes      peer i64 │ ns i32 │ min_id i32  ──►  max_id i32             │
//! │             (id ranges known to be missing locally)                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes go straight to the engine inside the open transaction, so this
//! table has nothing to flush on commit.

use bytes::{Buf, BufMut, BytesMut};

use super::read_state_table::{IncomingIndexStats, IncomingStats};
use super::table::Table;
use super::types::{Message, MessageId, MessageIndex, MessageNamespace, PeerId};
use super::value_box::{ValueBox, ValueBoxKey, ValueBoxTable};
use crate::error::Result;

/// Stored id-index entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Where the message sorts
    pub index: MessageIndex,
    /// Received rather than sent
    pub incoming: bool,
}

/// Messages, their id index and registered holes
pub struct MessageHistoryTable {
    messages: ValueBoxTable,
    ids: ValueBoxTable,
    holes: ValueBoxTable,
}

impl MessageHistoryTable {
    /// Create the table over its three engine tables
    pub fn new(messages: ValueBoxTable, ids: ValueBoxTable, holes: ValueBoxTable) -> Self {
        Self { messages, ids, holes }
    }

    // ========================================================================
    // KEYS
    // ========================================================================

    fn prefix(peer_id: PeerId, namespace: MessageNamespace) -> ValueBoxKey {
        ValueBoxKey::with_capacity(20)
            .push_i64(peer_id.to_i64())
            .push_i32(namespace)
    }

    fn message_key(index: &MessageIndex) -> ValueBoxKey {
        Self::prefix(index.id.peer_id, index.id.namespace)
            .push_i32(index.timestamp)
            .push_i32(index.id.id)
    }

    fn id_key(message_id: &MessageId) -> ValueBoxKey {
        Self::prefix(message_id.peer_id, message_id.namespace).push_i32(message_id.id)
    }

    fn hole_key(peer_id: PeerId, namespace: MessageNamespace, min_id: i32) -> ValueBoxKey {
        Self::prefix(peer_id, namespace).push_i32(min_id)
    }

    fn index_from_message_key(key: &ValueBoxKey) -> Option<MessageIndex> {
        let peer_id = PeerId::from_i64(key.i64_at(0)?);
        let namespace = key.i32_at(8)?;
        let timestamp = key.i32_at(12)?;
        let id = key.i32_at(16)?;
        Some(MessageIndex::new(MessageId::new(peer_id, namespace, id), timestamp))
    }

    fn encode_index_entry(timestamp: i32, incoming: bool) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_i32_le(timestamp);
        buf.put_u8(incoming as u8);
        buf.to_vec()
    }

    fn decode_index_entry(message_id: MessageId, mut bytes: &[u8]) -> Option<IndexEntry> {
        if bytes.remaining() != 5 {
            tracing::warn!("Malformed history index entry for {}", message_id);
            return None;
        }
        let timestamp = bytes.get_i32_le();
        let incoming = bytes.get_u8() != 0;
        Some(IndexEntry {
            index: MessageIndex::new(message_id, timestamp),
            incoming,
        })
    }

    // ========================================================================
    // MESSAGES
    // ========================================================================

    /// Store a message; returns `false` when the id was already stored.
    ///
    /// An existing message with the same id is replaced.
    pub fn add_message(&self, value_box: &mut dyn ValueBox, message: &Message) -> Result<bool> {
        let existing = self.index_entry(value_box, message.id)?;
        if let Some(existing) = existing {
            if existing.index != message.index() {
                value_box.remove(self.messages, &Self::message_key(&existing.index))?;
            }
        }

        let bytes = bincode::serialize(message)?;
        value_box.set(self.messages, &Self::message_key(&message.index()), &bytes)?;
        value_box.set(
            self.ids,
            &Self::id_key(&message.id),
            &Self::encode_index_entry(message.timestamp, message.incoming),
        )?;
        Ok(existing.is_none())
    }

    /// Delete a message, returning what was stored
    pub fn remove_message(&self, value_box: &mut dyn ValueBox, message_id: MessageId) -> Result<Option<Message>> {
        let Some(entry) = self.index_entry(value_box, message_id)? else {
            return Ok(None);
        };
        let message = self.get_message(value_box, message_id)?;
        value_box.remove(self.messages, &Self::message_key(&entry.index))?;
        value_box.remove(self.ids, &Self::id_key(&message_id))?;
        Ok(message)
    }

    /// Read a stored message
    pub fn get_message(&self, value_box: &dyn ValueBox, message_id: MessageId) -> Result<Option<Message>> {
        let Some(entry) = self.index_entry(value_box, message_id)? else {
            return Ok(None);
        };
        let Some(bytes) = value_box.get(self.messages, &Self::message_key(&entry.index))? else {
            tracing::warn!("History index points at missing message {}", message_id);
            return Ok(None);
        };
        match bincode::deserialize::<Message>(&bytes) {
            Ok(message) => Ok(Some(message)),
            Err(e) => {
                tracing::warn!("Undecodable message {}: {}", message_id, e);
                Ok(None)
            }
        }
    }

    /// Sort position and direction of a stored message
    pub fn index_entry(&self, value_box: &dyn ValueBox, message_id: MessageId) -> Result<Option<IndexEntry>> {
        Ok(value_box
            .get(self.ids, &Self::id_key(&message_id))?
            .and_then(|bytes| Self::decode_index_entry(message_id, &bytes)))
    }

    /// Newest messages of a chat, newest first
    pub fn latest_messages(
        &self,
        value_box: &dyn ValueBox,
        peer_id: PeerId,
        namespace: MessageNamespace,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let prefix = Self::prefix(peer_id, namespace);
        let mut messages = Vec::new();
        value_box.range(
            self.messages,
            &prefix.clone().push_i32(i32::MIN).push_i32(i32::MIN),
            &prefix.push_i32(i32::MAX).push_i32(i32::MAX),
            true,
            Some(limit),
            &mut |_, value| {
                match bincode::deserialize::<Message>(value) {
                    Ok(message) => messages.push(message),
                    Err(e) => tracing::warn!("Skipping undecodable message: {}", e),
                }
                true
            },
        )?;
        Ok(messages)
    }

    /// Chronologically newest message of a chat
    pub fn top_message_index(
        &self,
        value_box: &dyn ValueBox,
        peer_id: PeerId,
        namespace: MessageNamespace,
    ) -> Result<Option<MessageIndex>> {
        let prefix = Self::prefix(peer_id, namespace);
        let mut top = None;
        value_box.range(
            self.messages,
            &prefix.clone().push_i32(i32::MIN).push_i32(i32::MIN),
            &prefix.push_i32(i32::MAX).push_i32(i32::MAX),
            true,
            Some(1),
            &mut |key, _| {
                top = Self::index_from_message_key(key);
                false
            },
        )?;
        Ok(top)
    }

    /// Highest stored message id of a chat
    pub fn top_message_id(
        &self,
        value_box: &dyn ValueBox,
        peer_id: PeerId,
        namespace: MessageNamespace,
    ) -> Result<Option<i32>> {
        let prefix = Self::prefix(peer_id, namespace);
        let mut top = None;
        value_box.range(
            self.ids,
            &prefix.clone().push_i32(i32::MIN),
            &prefix.push_i32(i32::MAX),
            true,
            Some(1),
            &mut |key, _| {
                top = key.i32_at(12);
                false
            },
        )?;
        Ok(top)
    }

    // ========================================================================
    // READ-STATE SCANS
    // ========================================================================

    /// Incoming messages with `from_id <= id <= to_id`
    pub fn incoming_stats_in_range(
        &self,
        value_box: &dyn ValueBox,
        peer_id: PeerId,
        namespace: MessageNamespace,
        from_id: i32,
        to_id: i32,
    ) -> Result<IncomingStats> {
        if from_id > to_id {
            return Ok(IncomingStats::default());
        }
        let prefix = Self::prefix(peer_id, namespace);
        let mut count = 0;
        value_box.range(
            self.ids,
            &prefix.clone().push_i32(from_id),
            &prefix.push_i32(to_id),
            false,
            None,
            &mut |_, value| {
                if value.get(4).copied().unwrap_or(0) != 0 {
                    count += 1;
                }
                true
            },
        )?;
        let holes = self.has_hole_in(value_box, peer_id, namespace, from_id, to_id)?;
        Ok(IncomingStats { count, holes })
    }

    /// Incoming messages among `indices`
    pub fn incoming_stats_in_indices(
        &self,
        value_box: &dyn ValueBox,
        peer_id: PeerId,
        namespace: MessageNamespace,
        indices: &[MessageIndex],
    ) -> Result<IncomingStats> {
        let mut stats = IncomingStats::default();
        for index in indices {
            let message_id = MessageId::new(peer_id, namespace, index.id.id);
            match self.index_entry(value_box, message_id)? {
                Some(entry) if entry.incoming => stats.count += 1,
                Some(_) => {}
                None => {
                    if self.has_hole_in(value_box, peer_id, namespace, index.id.id, index.id.id)? {
                        stats.holes = true;
                    }
                }
            }
        }
        Ok(stats)
    }

    /// Incoming messages with `from <= index <= to`; both ends in one chat
    pub fn incoming_index_stats_in_range(
        &self,
        value_box: &dyn ValueBox,
        from: MessageIndex,
        to: MessageIndex,
    ) -> Result<IncomingIndexStats> {
        let mut stats = IncomingIndexStats::default();
        self.scan_index_range(value_box, from, to, &mut |message| {
            if message.incoming {
                stats.count += 1;
                stats.message_ids.push(message.id);
            }
        })?;
        stats.holes = self.has_any_hole(value_box, from.id.peer_id, from.id.namespace)?;
        Ok(stats)
    }

    /// Outgoing messages with `from <= index <= to`; both ends in one chat
    pub fn outgoing_index_stats_in_range(
        &self,
        value_box: &dyn ValueBox,
        from: MessageIndex,
        to: MessageIndex,
    ) -> Result<Vec<MessageId>> {
        let mut ids = Vec::new();
        self.scan_index_range(value_box, from, to, &mut |message| {
            if !message.incoming {
                ids.push(message.id);
            }
        })?;
        Ok(ids)
    }

    fn scan_index_range(
        &self,
        value_box: &dyn ValueBox,
        from: MessageIndex,
        to: MessageIndex,
        visitor: &mut dyn FnMut(&Message),
    ) -> Result<()> {
        if from.id.peer_id != to.id.peer_id || from.id.namespace != to.id.namespace {
            tracing::warn!("Index range {:?}..{:?} spans chats, ignoring", from, to);
            return Ok(());
        }
        value_box.range(
            self.messages,
            &Self::message_key(&from),
            &Self::message_key(&to),
            false,
            None,
            &mut |_, value| {
                match bincode::deserialize::<Message>(value) {
                    Ok(message) => visitor(&message),
                    Err(e) => tracing::warn!("Skipping undecodable message: {}", e),
                }
                true
            },
        )
    }

    // ========================================================================
    // HOLES
    // ========================================================================

    /// Register `min_id..=max_id` as missing from local history
    pub fn add_hole(
        &self,
        value_box: &mut dyn ValueBox,
        peer_id: PeerId,
        namespace: MessageNamespace,
        min_id: i32,
        max_id: i32,
    ) -> Result<()> {
        if min_id > max_id {
            return Ok(());
        }
        value_box.set(
            self.holes,
            &Self::hole_key(peer_id, namespace, min_id),
            &max_id.to_le_bytes(),
        )
    }

    /// Mark `min_id..=max_id` as present again, trimming overlapping holes
    pub fn fill_hole(
        &self,
        value_box: &mut dyn ValueBox,
        peer_id: PeerId,
        namespace: MessageNamespace,
        min_id: i32,
        max_id: i32,
    ) -> Result<()> {
        let overlapping = self.holes_overlapping(value_box, peer_id, namespace, min_id, max_id)?;
        for (hole_min, hole_max) in overlapping {
            value_box.remove(self.holes, &Self::hole_key(peer_id, namespace, hole_min))?;
            if hole_min < min_id {
                self.add_hole(value_box, peer_id, namespace, hole_min, min_id - 1)?;
            }
            if hole_max > max_id {
                self.add_hole(value_box, peer_id, namespace, max_id + 1, hole_max)?;
            }
        }
        Ok(())
    }

    fn holes_overlapping(
        &self,
        value_box: &dyn ValueBox,
        peer_id: PeerId,
        namespace: MessageNamespace,
        min_id: i32,
        max_id: i32,
    ) -> Result<Vec<(i32, i32)>> {
        let prefix = Self::prefix(peer_id, namespace);
        let mut holes = Vec::new();
        value_box.range(
            self.holes,
            &prefix.clone().push_i32(i32::MIN),
            &prefix.push_i32(max_id),
            false,
            None,
            &mut |key, value| {
                let (Some(hole_min), Ok(bytes)) = (key.i32_at(12), <[u8; 4]>::try_from(value)) else {
                    return true;
                };
                let hole_max = i32::from_le_bytes(bytes);
                if hole_max >= min_id {
                    holes.push((hole_min, hole_max));
                }
                true
            },
        )?;
        Ok(holes)
    }

    fn has_hole_in(
        &self,
        value_box: &dyn ValueBox,
        peer_id: PeerId,
        namespace: MessageNamespace,
        min_id: i32,
        max_id: i32,
    ) -> Result<bool> {
        Ok(!self
            .holes_overlapping(value_box, peer_id, namespace, min_id, max_id)?
            .is_empty())
    }

    fn has_any_hole(&self, value_box: &dyn ValueBox, peer_id: PeerId, namespace: MessageNamespace) -> Result<bool> {
        self.has_hole_in(value_box, peer_id, namespace, i32::MIN, i32::MAX)
    }
}

impl Table for MessageHistoryTable {
    fn before_commit(&mut self, _value_box: &mut dyn ValueBox) -> Result<()> {
        Ok(())
    }

    fn discard_uncommitted(&mut self) {}

    fn clear_memory_cache(&mut self) {}

    fn has_uncommitted(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postbox::value_box::SqliteValueBox;

    fn table() -> MessageHistoryTable {
        MessageHistoryTable::new(ValueBoxTable::new(3), ValueBoxTable::new(4), ValueBoxTable::new(5))
    }

    fn peer() -> PeerId {
        PeerId::new(0, 9)
    }

    fn message(id: i32, timestamp: i32, incoming: bool) -> Message {
        Message {
            id: MessageId::new(peer(), 0, id),
            timestamp,
            global_id: None,
            author_id: None,
            incoming,
            text: format!("message {}", id),
        }
    }

    fn populated() -> (SqliteValueBox, MessageHistoryTable) {
        let mut vb = SqliteValueBox::open(None).unwrap();
        let history = table();
        vb.begin().unwrap();
        for (id, ts, incoming) in [(1, 10, true), (2, 20, false), (3, 30, true), (4, 25, true), (6, 60, true)] {
            history.add_message(&mut vb, &message(id, ts, incoming)).unwrap();
        }
        vb.commit().unwrap();
        (vb, history)
    }

    #[test]
    fn test_add_get_remove() {
        let (mut vb, history) = populated();
        let id = MessageId::new(peer(), 0, 3);
        assert_eq!(history.get_message(&vb, id).unwrap(), Some(message(3, 30, true)));

        vb.begin().unwrap();
        assert!(!history.add_message(&mut vb, &message(3, 35, true)).unwrap());
        assert_eq!(history.remove_message(&mut vb, id).unwrap(), Some(message(3, 35, true)));
        assert_eq!(history.remove_message(&mut vb, id).unwrap(), None);
        vb.commit().unwrap();

        assert_eq!(history.get_message(&vb, id).unwrap(), None);
        // The re-timestamped copy replaced the original key.
        assert_eq!(history.latest_messages(&vb, peer(), 0, 10).unwrap().len(), 4);
    }

    #[test]
    fn test_top_message_by_time_and_by_id() {
        let (vb, history) = populated();
        let top = history.top_message_index(&vb, peer(), 0).unwrap().unwrap();
        assert_eq!(top.id.id, 6);
        assert_eq!(top.timestamp, 60);
        assert_eq!(history.top_message_id(&vb, peer(), 0).unwrap(), Some(6));
        assert_eq!(history.top_message_id(&vb, peer(), 1).unwrap(), None);

        let latest = history.latest_messages(&vb, peer(), 0, 2).unwrap();
        assert_eq!(latest.iter().map(|m| m.id.id).collect::<Vec<_>>(), vec![6, 3]);
    }

    #[test]
    fn test_incoming_stats_by_id_range_and_indices() {
        let (vb, history) = populated();
        let stats = history.incoming_stats_in_range(&vb, peer(), 0, 2, 6).unwrap();
        assert_eq!(stats, IncomingStats { count: 3, holes: false });
        assert_eq!(history.incoming_stats_in_range(&vb, peer(), 0, 7, 6).unwrap().count, 0);

        let indices: Vec<MessageIndex> = [1, 2, 5].iter().map(|id| message(*id, 0, true).index()).collect();
        let stats = history.incoming_stats_in_indices(&vb, peer(), 0, &indices).unwrap();
        assert_eq!(stats, IncomingStats { count: 1, holes: false });
    }

    #[test]
    fn test_holes_are_reported_and_filled() {
        let (mut vb, history) = populated();
        vb.begin().unwrap();
        history.add_hole(&mut vb, peer(), 0, 5, 5).unwrap();
        vb.commit().unwrap();

        assert!(history.incoming_stats_in_range(&vb, peer(), 0, 4, 6).unwrap().holes);
        assert!(!history.incoming_stats_in_range(&vb, peer(), 0, 1, 4).unwrap().holes);
        let missing = [message(5, 50, true).index()];
        assert!(history.incoming_stats_in_indices(&vb, peer(), 0, &missing).unwrap().holes);

        vb.begin().unwrap();
        history.add_hole(&mut vb, peer(), 0, 10, 20).unwrap();
        history.fill_hole(&mut vb, peer(), 0, 5, 12).unwrap();
        vb.commit().unwrap();

        assert!(!history.incoming_stats_in_range(&vb, peer(), 0, 1, 12).unwrap().holes);
        assert!(history.incoming_stats_in_range(&vb, peer(), 0, 13, 13).unwrap().holes);
    }

    #[test]
    fn test_index_range_scans_follow_timestamps() {
        let (vb, history) = populated();
        let from = message(1, 10, true).index().successor();
        let to = message(3, 30, true).index();

        let incoming = history.incoming_index_stats_in_range(&vb, from, to).unwrap();
        assert_eq!(incoming.count, 2);
        assert_eq!(
            incoming.message_ids.iter().map(|id| id.id).collect::<Vec<_>>(),
            vec![4, 3]
        );

        let outgoing = history.outgoing_index_stats_in_range(&vb, from, to).unwrap();
        assert_eq!(outgoing, vec![MessageId::new(peer(), 0, 2)]);
    }
}
