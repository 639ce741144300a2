//! # Identifiers
//!
//! Peer and message identifiers shared by every table.
//!
//! ```text
//! PeerId        (namespace: i32, id: i32)      packed into one i64
//! MessageId     (peer_id, namespace, id)       ordered field by field
//! MessageIndex  (id: MessageId, timestamp)     ordered by (timestamp, id)
//! ```

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Message namespace (cloud, local, scheduled, ...)
pub type MessageNamespace = i32;

/// Well-known peer namespaces
pub mod peer_namespaces {
    /// One-to-one chat with a user
    pub const CLOUD_USER: i32 = 0;
    /// Basic group
    pub const CLOUD_GROUP: i32 = 1;
    /// Channel or supergroup
    pub const CLOUD_CHANNEL: i32 = 2;
    /// End-to-end encrypted chat
    pub const SECRET_CHAT: i32 = 3;
}

/// Well-known message namespaces
pub mod message_namespaces {
    /// Server-synchronized messages (dense, monotonic ids)
    pub const CLOUD: i32 = 0;
    /// Messages that only exist locally
    pub const LOCAL: i32 = 1;
    /// Scheduled messages
    pub const SCHEDULED: i32 = 2;
}

/// Opaque 64-bit peer identifier.
///
/// The high 32 bits carry the peer namespace and the low 32 bits the id,
/// so the packed `i64` is what gets written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId {
    /// Peer kind
    pub namespace: i32,
    /// Id inside the namespace
    pub id: i32,
}

impl PeerId {
    /// Create a peer id from its parts
    pub const fn new(namespace: i32, id: i32) -> Self {
        Self { namespace, id }
    }

    /// Unpack a stored `i64`
    pub fn from_i64(value: i64) -> Self {
        Self {
            namespace: (value >> 32) as i32,
            id: (value & 0xffff_ffff) as u32 as i32,
        }
    }

    /// Pack into the stored `i64`
    pub fn to_i64(self) -> i64 {
        ((self.namespace as i64) << 32) | (self.id as u32 as i64)
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_i64().cmp(&other.to_i64())
    }
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.id)
    }
}

/// Message identifier, ordered by peer, then namespace, then id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId {
    /// Chat the message belongs to
    pub peer_id: PeerId,
    /// Message kind
    pub namespace: MessageNamespace,
    /// Numeric id inside the namespace
    pub id: i32,
}

impl MessageId {
    /// Create a message id
    pub const fn new(peer_id: PeerId, namespace: MessageNamespace, id: i32) -> Self {
        Self { peer_id, namespace, id }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.peer_id, self.namespace, self.id)
    }
}

/// History sort key.
///
/// Ordered by timestamp first; the message id only breaks ties between
/// messages sent in the same second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageIndex {
    /// The message
    pub id: MessageId,
    /// Unix timestamp in seconds
    pub timestamp: i32,
}

impl MessageIndex {
    /// Create an index
    pub const fn new(id: MessageId, timestamp: i32) -> Self {
        Self { id, timestamp }
    }

    /// Smallest index that sorts right after this one
    pub fn successor(&self) -> Self {
        Self {
            id: MessageId::new(self.id.peer_id, self.id.namespace, self.id.id.saturating_add(1)),
            timestamp: self.timestamp,
        }
    }

    /// Lower bound for a peer: sorts before every real message
    pub fn lower_bound(peer_id: PeerId, namespace: MessageNamespace) -> Self {
        Self::new(MessageId::new(peer_id, namespace, 0), 0)
    }
}

impl Ord for MessageIndex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for MessageIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A stored message.
///
/// Only the fields the storage core reasons about are modelled; `text`
/// stands in for the decoded content owned by feature code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message id
    pub id: MessageId,
    /// Unix timestamp in seconds
    pub timestamp: i32,
    /// Server-wide id used by deletion updates of basic chats
    pub global_id: Option<i32>,
    /// Sender, if known
    pub author_id: Option<PeerId>,
    /// Whether the message was received rather than sent by this account
    pub incoming: bool,
    /// Message text
    pub text: String,
}

impl Message {
    /// Sort key for this message
    pub fn index(&self) -> MessageIndex {
        MessageIndex::new(self.id, self.timestamp)
    }
}
