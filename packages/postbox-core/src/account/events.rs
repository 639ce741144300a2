//! Events broadcast by the account state manager once side effects of a
//! replay are delivered.

use super::types::{CallSessionUpdate, TypingActivity, Webpage};
use crate::postbox::{Message, PeerId};

/// Side effect delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum AccountEvent {
    /// Typing indicators started or stopped
    TypingActivities(Vec<TypingActivity>),
    /// Link previews that resolved
    WebpagesUpdated(Vec<Webpage>),
    /// Call signalling updates, in arrival order
    CallUpdates(Vec<CallSessionUpdate>),
    /// New incoming messages that are still unread
    NotificationMessages(Vec<Message>),
    /// Peers whose unread counters must be fetched from the server
    ReadStateSyncRequired(Vec<PeerId>),
    /// Local state was rebuilt from a dialogs snapshot
    StateReset,
}
