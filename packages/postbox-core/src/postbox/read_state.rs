//! # Read States
//!
//! Per-namespace read markers and unread counters.
//!
//! ## Stored Layout
//!
//! One blob per peer, all integers little-endian:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ i32 namespace_count                                                  │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │ repeated namespace_count times:                                      │
//! │   i32 namespace                                                      │
//! │   i8  tag  (0 = id based, 1 = index based)                           │
//! │                                                                      │
//! │   tag 0:  i32 max_incoming_read_id   i32 max_outgoing_read_id        │
//! │           i32 max_known_id           i32 count          (16 bytes)  │
//! │                                                                      │
//! │   tag 1:  i32 timestamp  i64 peer_id  i32 namespace  i32 id          │
//! │             (max incoming read index)                                │
//! │           i32 timestamp  i64 peer_id  i32 namespace  i32 id          │
//! │             (max outgoing read index)                                │
//! │           i32 count                                     (36 bytes)  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeMap;

use super::types::{MessageId, MessageIndex, MessageNamespace, PeerId};

const TAG_ID_BASED: i8 = 0;
const TAG_INDEX_BASED: i8 = 1;

/// Read position and unread counter of one (peer, namespace)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerReadState {
    /// Dense, monotonic ids (cloud chats)
    IdBased {
        /// Highest incoming message id read by this account
        max_incoming_read_id: i32,
        /// Highest outgoing message id read by the other side
        max_outgoing_read_id: i32,
        /// Highest id the counter already accounts for
        max_known_id: i32,
        /// Unread incoming messages
        count: i32,
    },
    /// Ids not comparable across the namespace; ordered by full index
    IndexBased {
        /// Newest incoming message read by this account
        max_incoming_read_index: MessageIndex,
        /// Newest outgoing message read by the other side
        max_outgoing_read_index: MessageIndex,
        /// Unread incoming messages
        count: i32,
    },
}

impl PeerReadState {
    /// Unread incoming messages
    pub fn count(&self) -> i32 {
        match self {
            PeerReadState::IdBased { count, .. } | PeerReadState::IndexBased { count, .. } => *count,
        }
    }

    /// Same markers, different counter
    pub fn with_count(&self, count: i32) -> Self {
        let mut state = *self;
        match &mut state {
            PeerReadState::IdBased { count: c, .. } | PeerReadState::IndexBased { count: c, .. } => {
                *c = count
            }
        }
        state
    }

    /// Whether an incoming message at `index` is already read
    pub fn is_incoming_message_index_read(&self, index: &MessageIndex) -> bool {
        match self {
            PeerReadState::IdBased {
                max_incoming_read_id,
                ..
            } => *max_incoming_read_id >= index.id.id,
            PeerReadState::IndexBased {
                max_incoming_read_index,
                ..
            } => max_incoming_read_index >= index,
        }
    }

    /// Whether an outgoing message at `index` was read by the other side
    pub fn is_outgoing_message_index_read(&self, index: &MessageIndex) -> bool {
        match self {
            PeerReadState::IdBased {
                max_outgoing_read_id,
                ..
            } => *max_outgoing_read_id >= index.id.id,
            PeerReadState::IndexBased {
                max_outgoing_read_index,
                ..
            } => max_outgoing_read_index >= index,
        }
    }
}

/// Snapshot of every namespace read state of one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedPeerReadState {
    states: Vec<(MessageNamespace, PeerReadState)>,
}

impl CombinedPeerReadState {
    /// Build a snapshot; states are kept sorted by namespace
    pub fn new(states: impl IntoIterator<Item = (MessageNamespace, PeerReadState)>) -> Self {
        let mut states: Vec<_> = states.into_iter().collect();
        states.sort_by_key(|(namespace, _)| *namespace);
        Self { states }
    }

    pub(crate) fn from_map(states: &BTreeMap<MessageNamespace, PeerReadState>) -> Self {
        Self {
            states: states.iter().map(|(ns, state)| (*ns, *state)).collect(),
        }
    }

    /// Per-namespace states in namespace order
    pub fn states(&self) -> &[(MessageNamespace, PeerReadState)] {
        &self.states
    }

    /// State of one namespace
    pub fn state(&self, namespace: MessageNamespace) -> Option<&PeerReadState> {
        self.states
            .iter()
            .find(|(ns, _)| *ns == namespace)
            .map(|(_, state)| state)
    }

    /// Total unread count across namespaces
    pub fn count(&self) -> i32 {
        self.states.iter().map(|(_, state)| state.count()).sum()
    }

    /// Whether anything is unread
    pub fn is_unread(&self) -> bool {
        self.count() > 0
    }

    /// Whether an incoming message is read; unknown namespaces count as unread
    pub fn is_incoming_message_index_read(&self, index: &MessageIndex) -> bool {
        self.state(index.id.namespace)
            .map(|state| state.is_incoming_message_index_read(index))
            .unwrap_or(false)
    }

    /// Whether an outgoing message was read by the other side
    pub fn is_outgoing_message_index_read(&self, index: &MessageIndex) -> bool {
        self.state(index.id.namespace)
            .map(|state| state.is_outgoing_message_index_read(index))
            .unwrap_or(false)
    }
}

// ============================================================================
// ENCODING
// ============================================================================

/// Serialize every namespace state of a peer into the stored blob
pub fn encode_read_states(states: &BTreeMap<MessageNamespace, PeerReadState>) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(4 + states.len() * 41);
    buf.put_i32_le(states.len() as i32);
    for (namespace, state) in states {
        buf.put_i32_le(*namespace);
        match state {
            PeerReadState::IdBased {
                max_incoming_read_id,
                max_outgoing_read_id,
                max_known_id,
                count,
            } => {
                buf.put_i8(TAG_ID_BASED);
                buf.put_i32_le(*max_incoming_read_id);
                buf.put_i32_le(*max_outgoing_read_id);
                buf.put_i32_le(*max_known_id);
                buf.put_i32_le(*count);
            }
            PeerReadState::IndexBased {
                max_incoming_read_index,
                max_outgoing_read_index,
                count,
            } => {
                buf.put_i8(TAG_INDEX_BASED);
                put_index(&mut buf, max_incoming_read_index);
                put_index(&mut buf, max_outgoing_read_index);
                buf.put_i32_le(*count);
            }
        }
    }
    buf.to_vec()
}

/// Parse a stored blob; `None` for truncated data or an unknown tag
pub fn decode_read_states(mut bytes: &[u8]) -> Option<BTreeMap<MessageNamespace, PeerReadState>> {
    let buf = &mut bytes;
    let namespace_count = get_i32(buf)?;
    if namespace_count < 0 {
        return None;
    }

    let mut states = BTreeMap::new();
    for _ in 0..namespace_count {
        let namespace = get_i32(buf)?;
        if buf.remaining() < 1 {
            return None;
        }
        let state = match buf.get_i8() {
            TAG_ID_BASED => PeerReadState::IdBased {
                max_incoming_read_id: get_i32(buf)?,
                max_outgoing_read_id: get_i32(buf)?,
                max_known_id: get_i32(buf)?,
                count: get_i32(buf)?,
            },
            TAG_INDEX_BASED => PeerReadState::IndexBased {
                max_incoming_read_index: get_index(buf)?,
                max_outgoing_read_index: get_index(buf)?,
                count: get_i32(buf)?,
            },
            _ => return None,
        };
        states.insert(namespace, state);
    }

    if buf.has_remaining() {
        return None;
    }
    Some(states)
}

fn put_index(buf: &mut BytesMut, index: &MessageIndex) {
    buf.put_i32_le(index.timestamp);
    buf.put_i64_le(index.id.peer_id.to_i64());
    buf.put_i32_le(index.id.namespace);
    buf.put_i32_le(index.id.id);
}

fn get_i32(buf: &mut &[u8]) -> Option<i32> {
    (buf.remaining() >= 4).then(|| buf.get_i32_le())
}

fn get_index(buf: &mut &[u8]) -> Option<MessageIndex> {
    if buf.remaining() < 20 {
        return None;
    }
    let timestamp = buf.get_i32_le();
    let peer_id = PeerId::from_i64(buf.get_i64_le());
    let namespace = buf.get_i32_le();
    let id = buf.get_i32_le();
    Some(MessageIndex::new(MessageId::new(peer_id, namespace, id), timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(peer: PeerId, id: i32, timestamp: i32) -> MessageIndex {
        MessageIndex::new(MessageId::new(peer, 1, id), timestamp)
    }

    #[test]
    fn test_id_based_layout_is_bit_exact() {
        let mut states = BTreeMap::new();
        states.insert(
            0,
            PeerReadState::IdBased {
                max_incoming_read_id: 5,
                max_outgoing_read_id: 6,
                max_known_id: 10,
                count: 3,
            },
        );
        let bytes = encode_read_states(&states);
        assert_eq!(bytes.len(), 4 + 4 + 1 + 16);
        assert_eq!(&bytes[0..4], &1i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0i32.to_le_bytes());
        assert_eq!(bytes[8], 0);
        assert_eq!(&bytes[9..13], &5i32.to_le_bytes());
        assert_eq!(&bytes[21..25], &3i32.to_le_bytes());
        assert_eq!(decode_read_states(&bytes), Some(states));
    }

    #[test]
    fn test_mixed_variants_roundtrip_at_boundaries() {
        let peer = PeerId::new(2, -1);
        let mut states = BTreeMap::new();
        states.insert(
            0,
            PeerReadState::IdBased {
                max_incoming_read_id: 0,
                max_outgoing_read_id: i32::MAX,
                max_known_id: 0,
                count: 0,
            },
        );
        states.insert(
            1,
            PeerReadState::IndexBased {
                max_incoming_read_index: index(peer, i32::MIN, 0),
                max_outgoing_read_index: index(peer, 7, i32::MAX),
                count: 0,
            },
        );

        let bytes = encode_read_states(&states);
        assert_eq!(bytes.len(), 4 + (4 + 1 + 16) + (4 + 1 + 36));
        assert_eq!(decode_read_states(&bytes), Some(states));
    }

    #[test]
    fn test_malformed_blobs_decode_to_none() {
        assert_eq!(decode_read_states(&[]), None);
        assert_eq!(decode_read_states(&[1, 0, 0, 0, 0, 0, 0, 0, 9]), None);

        let mut states = BTreeMap::new();
        states.insert(
            0,
            PeerReadState::IdBased {
                max_incoming_read_id: 1,
                max_outgoing_read_id: 1,
                max_known_id: 1,
                count: 1,
            },
        );
        let bytes = encode_read_states(&states);
        assert_eq!(decode_read_states(&bytes[..bytes.len() - 1]), None);

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert_eq!(decode_read_states(&trailing), None);
    }

    #[test]
    fn test_empty_map_roundtrip() {
        let states = BTreeMap::new();
        assert_eq!(decode_read_states(&encode_read_states(&states)), Some(states));
    }

    #[test]
    fn test_combined_state_queries() {
        let peer = PeerId::new(0, 1);
        let combined = CombinedPeerReadState::new(vec![
            (
                1,
                PeerReadState::IndexBased {
                    max_incoming_read_index: index(peer, 5, 50),
                    max_outgoing_read_index: index(peer, 3, 30),
                    count: 2,
                },
            ),
            (
                0,
                PeerReadState::IdBased {
                    max_incoming_read_id: 10,
                    max_outgoing_read_id: 8,
                    max_known_id: 12,
                    count: 1,
                },
            ),
        ]);

        assert_eq!(combined.states()[0].0, 0);
        assert_eq!(combined.count(), 3);
        assert!(combined.is_unread());
        assert!(combined.is_incoming_message_index_read(&index(peer, 4, 40)));
        assert!(!combined.is_incoming_message_index_read(&index(peer, 6, 60)));
        assert!(combined.is_outgoing_message_index_read(&MessageIndex::new(
            MessageId::new(peer, 0, 8),
            1
        )));
        assert!(!combined.is_incoming_message_index_read(&MessageIndex::new(
            MessageId::new(peer, 9, 1),
            1
        )));
    }
}
