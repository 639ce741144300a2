//! # Update Model
//!
//! Already-decoded server updates and differences, plus the sync cursor
//! persisted in the postbox metadata table.
//!
//! ```text
//! Updates (push)                 Difference (poll)
//! ├── TooLong                    ├── Empty
//! ├── Short { update, seq }      ├── Difference { messages, updates, state }
//! └── Combined { updates, ..}    ├── Slice { .., intermediate_state }
//!          │                     └── TooLong
//!          ▼
//!    Vec<UpdateGroup>  ──►  AccountFinalState  ──►  replay
//! ```

use serde::{Deserialize, Serialize};

use crate::postbox::{Message, MessageId, PeerId};

// ============================================================================
// SYNC CURSOR
// ============================================================================

/// Server sync position.
///
/// `pts` orders message-box updates, `qts` orders secret-chat updates and
/// `seq` orders the combined push stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSyncState {
    /// Message-box sequence
    pub pts: i32,
    /// Secret-chat sequence
    pub qts: i32,
    /// Server time of the last update
    pub date: i32,
    /// Push container sequence
    pub seq: i32,
}

/// What the postbox stores under its state key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedAccountState {
    /// The logged-in user
    pub peer_id: PeerId,
    /// Sync cursor, absent until the first `get_state` round trip
    pub state: Option<AccountSyncState>,
}

// ============================================================================
// UPDATES
// ============================================================================

/// Typing or recording indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerInputActivity {
    /// Typing text
    Typing,
    /// Recording a voice message
    RecordingVoice,
    /// Uploading a file
    UploadingFile,
}

/// Typing activity change observed by one update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingActivity {
    pub peer_id: PeerId,
    /// Who is typing
    pub user_id: PeerId,
    /// `None` cancels the activity
    pub activity: Option<PeerInputActivity>,
}

/// Media identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MediaId {
    /// Media kind
    pub namespace: i32,
    /// Id inside the namespace
    pub id: i64,
}

/// Link preview whose content became available
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Webpage {
    /// Preview id
    pub id: MediaId,
    /// Page address
    pub url: String,
    /// Page title
    pub title: Option<String>,
    /// Short description
    pub description: Option<String>,
}

/// Call signalling state pushed by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSessionState {
    /// Incoming or outgoing call is ringing
    Requested,
    /// Both sides accepted
    Accepted,
    /// Call finished or was declined
    Ended,
}

/// Update for one call session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSessionUpdate {
    /// Server call id
    pub call_id: i64,
    pub peer_id: PeerId,
    /// New signalling state
    pub state: CallSessionState,
}

/// A single decoded update
#[derive(Debug, Clone, PartialEq)]
pub enum AccountUpdate {
    /// A message was sent or received
    NewMessage(Message),
    /// Messages were deleted
    DeleteMessages(Vec<MessageId>),
    /// Deletion addressed by server-wide ids (basic chats)
    DeleteMessagesWithGlobalIds(Vec<i32>),
    /// Our side read incoming messages up to `max_id`
    ReadInbox { peer_id: PeerId, max_id: i32 },
    /// The other side read our messages up to `max_id`
    ReadOutbox { peer_id: PeerId, max_id: i32 },
    /// Typing indicator changed
    UserTyping {
        peer_id: PeerId,
        user_id: PeerId,
        activity: Option<PeerInputActivity>,
    },
    /// Link preview resolved
    UpdateWebpage(Webpage),
    /// Call signalling
    PhoneCall(CallSessionUpdate),
}

/// Sequence slot a short update occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSequence {
    /// Occupies `pts - pts_count .. pts`
    Pts { pts: i32, pts_count: i32 },
    /// Occupies `qts`
    Qts { qts: i32 },
    /// Outside any sequence
    None,
}

/// Updates that must be applied together at one sequence position
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateGroup {
    /// Message-box updates ending at `pts`
    WithPts {
        updates: Vec<AccountUpdate>,
        pts: i32,
        pts_count: i32,
    },
    /// Secret-chat updates at `qts`
    WithQts {
        updates: Vec<AccountUpdate>,
        qts: i32,
    },
    /// A combined push container; `seq_range` is `(seq_start, seq)`
    WithSeq {
        updates: Vec<AccountUpdate>,
        seq_range: Option<(i32, i32)>,
        date: i32,
    },
    /// Updates outside any sequence
    WithOther { updates: Vec<AccountUpdate> },
    /// The server gave up describing the gap
    TooLong,
}

impl UpdateGroup {
    /// Updates carried by this group
    pub fn updates(&self) -> &[AccountUpdate] {
        match self {
            UpdateGroup::WithPts { updates, .. }
            | UpdateGroup::WithQts { updates, .. }
            | UpdateGroup::WithSeq { updates, .. }
            | UpdateGroup::WithOther { updates } => updates,
            UpdateGroup::TooLong => &[],
        }
    }
}

/// A push batch as received from the network
#[derive(Debug, Clone, PartialEq)]
pub enum Updates {
    /// Too many updates; poll the difference
    TooLong,
    /// One update
    Short {
        update: AccountUpdate,
        sequence: UpdateSequence,
    },
    /// Several updates in one container
    Combined {
        updates: Vec<(AccountUpdate, UpdateSequence)>,
        seq_start: i32,
        seq: i32,
        date: i32,
    },
}

impl Updates {
    /// Split a push batch into update groups.
    ///
    /// Sequenced updates become one group each; the rest of a combined
    /// container stays together as a seq group.
    pub fn into_groups(self) -> Vec<UpdateGroup> {
        match self {
            Updates::TooLong => vec![UpdateGroup::TooLong],
            Updates::Short { update, sequence } => vec![group_for(update, sequence)],
            Updates::Combined {
                updates,
                seq_start,
                seq,
                date,
            } => {
                let mut groups = Vec::new();
                let mut unsequenced = Vec::new();
                for (update, sequence) in updates {
                    match sequence {
                        UpdateSequence::None => unsequenced.push(update),
                        sequence => groups.push(group_for(update, sequence)),
                    }
                }
                let seq_range = if seq == 0 { None } else { Some((seq_start, seq)) };
                groups.push(UpdateGroup::WithSeq {
                    updates: unsequenced,
                    seq_range,
                    date,
                });
                groups
            }
        }
    }
}

fn group_for(update: AccountUpdate, sequence: UpdateSequence) -> UpdateGroup {
    match sequence {
        UpdateSequence::Pts { pts, pts_count } => UpdateGroup::WithPts {
            updates: vec![update],
            pts,
            pts_count,
        },
        UpdateSequence::Qts { qts } => UpdateGroup::WithQts {
            updates: vec![update],
            qts,
        },
        UpdateSequence::None => UpdateGroup::WithOther { updates: vec![update] },
    }
}

// ============================================================================
// DIFFERENCE
// ============================================================================

/// Response to a difference request
#[derive(Debug, Clone, PartialEq)]
pub enum Difference {
    /// Nothing changed; only date and seq move
    Empty { date: i32, seq: i32 },
    /// Everything since the cursor
    Difference {
        new_messages: Vec<Message>,
        other_updates: Vec<AccountUpdate>,
        state: AccountSyncState,
    },
    /// Part of the changes; poll again from `intermediate_state`
    Slice {
        new_messages: Vec<Message>,
        other_updates: Vec<AccountUpdate>,
        intermediate_state: AccountSyncState,
    },
    /// The gap is too large; local state must be reset
    TooLong { pts: i32 },
}

impl Difference {
    /// Whether more data is pending after this one
    pub fn is_slice(&self) -> bool {
        matches!(self, Difference::Slice { .. })
    }
}

/// Dialog list entry used to rebuild local state from scratch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogSnapshot {
    pub peer_id: PeerId,
    /// Our read marker
    pub read_inbox_max_id: i32,
    /// Their read marker
    pub read_outbox_max_id: i32,
    /// Newest message id
    pub top_message_id: i32,
    /// Server unread counter
    pub unread_count: i32,
}

/// Everything needed to reset the account after `Difference::TooLong`
#[derive(Debug, Clone, PartialEq)]
pub struct StateResetSnapshot {
    /// Every dialog of the account
    pub dialogs: Vec<DialogSnapshot>,
    /// Newest message of each dialog
    pub top_messages: Vec<Message>,
    /// Cursor to continue from
    pub state: AccountSyncState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typing(peer: i32) -> AccountUpdate {
        AccountUpdate::UserTyping {
            peer_id: PeerId::new(0, peer),
            user_id: PeerId::new(0, peer),
            activity: Some(PeerInputActivity::Typing),
        }
    }

    #[test]
    fn test_short_update_becomes_single_group() {
        let groups = Updates::Short {
            update: typing(1),
            sequence: UpdateSequence::Pts { pts: 10, pts_count: 1 },
        }
        .into_groups();
        assert_eq!(
            groups,
            vec![UpdateGroup::WithPts {
                updates: vec![typing(1)],
                pts: 10,
                pts_count: 1
            }]
        );
    }

    #[test]
    fn test_combined_splits_sequenced_updates() {
        let groups = Updates::Combined {
            updates: vec![
                (typing(1), UpdateSequence::Pts { pts: 4, pts_count: 1 }),
                (typing(2), UpdateSequence::None),
                (typing(3), UpdateSequence::Qts { qts: 9 }),
            ],
            seq_start: 3,
            seq: 3,
            date: 500,
        }
        .into_groups();

        assert_eq!(groups.len(), 3);
        assert!(matches!(groups[0], UpdateGroup::WithPts { pts: 4, .. }));
        assert!(matches!(groups[1], UpdateGroup::WithQts { qts: 9, .. }));
        assert_eq!(
            groups[2],
            UpdateGroup::WithSeq {
                updates: vec![typing(2)],
                seq_range: Some((3, 3)),
                date: 500
            }
        );
    }

    #[test]
    fn test_too_long_push() {
        assert_eq!(Updates::TooLong.into_groups(), vec![UpdateGroup::TooLong]);
        assert!(UpdateGroup::TooLong.updates().is_empty());
    }
}
