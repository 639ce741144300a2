//! # Final State
//!
//! Reconciles update groups or a difference against the stored cursor and
//! produces the list of storage mutations plus transient side effects.
//!
//! ```text
//! groups ──► sort by pts/qts/seq ──► for each group:
//!              pts <= cursor            skip (already applied)
//!              pts - count == cursor    apply, advance cursor
//!              otherwise                incomplete (wait, then poll)
//!            seq gap / TooLong          should_poll
//! ```

use super::types::{
    AccountSyncState, AccountUpdate, CallSessionUpdate, Difference, TypingActivity, UpdateGroup,
    Webpage,
};
use crate::postbox::{message_namespaces, Message, MessageId, PeerId};

/// Storage change scheduled by a final state
#[derive(Debug, Clone, PartialEq)]
pub enum AccountMutation {
    /// Store messages
    AddMessages(Vec<Message>),
    /// Delete messages by id
    DeleteMessages(Vec<MessageId>),
    /// Delete messages by server-wide id
    DeleteMessagesWithGlobalIds(Vec<i32>),
    /// Incoming messages read up to the id
    ReadInbox(MessageId),
    /// Outgoing messages read up to the id
    ReadOutbox(MessageId),
}

/// Everything one replay applies, built on top of `base_state`
#[derive(Debug, Clone, PartialEq)]
pub struct AccountFinalState {
    /// Cursor this state was computed from
    pub base_state: AccountSyncState,
    /// Cursor after applying every mutation
    pub state: AccountSyncState,
    /// Storage changes in application order
    pub mutations: Vec<AccountMutation>,
    /// Typing indicators seen
    pub typing_activities: Vec<TypingActivity>,
    /// Resolved link previews
    pub updated_webpages: Vec<Webpage>,
    /// Call signalling updates
    pub call_updates: Vec<CallSessionUpdate>,
    /// A gap that only a difference can close
    pub should_poll: bool,
    /// A pts/qts gap that may still be filled by late pushes
    pub incomplete: bool,
}

impl AccountFinalState {
    /// Empty final state at `base_state`
    pub fn new(base_state: AccountSyncState) -> Self {
        Self {
            base_state,
            state: base_state,
            mutations: Vec::new(),
            typing_activities: Vec::new(),
            updated_webpages: Vec::new(),
            call_updates: Vec::new(),
            should_poll: false,
            incomplete: false,
        }
    }

    fn add_messages(&mut self, messages: impl IntoIterator<Item = Message>) {
        let messages: Vec<Message> = messages.into_iter().collect();
        if messages.is_empty() {
            return;
        }
        match self.mutations.last_mut() {
            Some(AccountMutation::AddMessages(current)) => current.extend(messages),
            _ => self.mutations.push(AccountMutation::AddMessages(messages)),
        }
    }

    fn apply_update(&mut self, update: &AccountUpdate) {
        match update {
            AccountUpdate::NewMessage(message) => self.add_messages([message.clone()]),
            AccountUpdate::DeleteMessages(ids) => {
                self.mutations.push(AccountMutation::DeleteMessages(ids.clone()))
            }
            AccountUpdate::DeleteMessagesWithGlobalIds(ids) => self
                .mutations
                .push(AccountMutation::DeleteMessagesWithGlobalIds(ids.clone())),
            AccountUpdate::ReadInbox { peer_id, max_id } => self.mutations.push(AccountMutation::ReadInbox(
                MessageId::new(*peer_id, message_namespaces::CLOUD, *max_id),
            )),
            AccountUpdate::ReadOutbox { peer_id, max_id } => self.mutations.push(AccountMutation::ReadOutbox(
                MessageId::new(*peer_id, message_namespaces::CLOUD, *max_id),
            )),
            AccountUpdate::UserTyping {
                peer_id,
                user_id,
                activity,
            } => self.typing_activities.push(TypingActivity {
                peer_id: *peer_id,
                user_id: *user_id,
                activity: *activity,
            }),
            AccountUpdate::UpdateWebpage(webpage) => self.updated_webpages.push(webpage.clone()),
            AccountUpdate::PhoneCall(update) => self.call_updates.push(update.clone()),
        }
    }

    fn apply_updates(&mut self, updates: &[AccountUpdate]) {
        for update in updates {
            self.apply_update(update);
        }
    }
}

/// Build a final state from pushed update groups
pub fn final_state_with_update_groups(base_state: AccountSyncState, groups: &[UpdateGroup]) -> AccountFinalState {
    let mut final_state = AccountFinalState::new(base_state);

    let mut pts_groups = Vec::new();
    let mut qts_groups = Vec::new();
    let mut seq_groups = Vec::new();
    let mut other_groups = Vec::new();

    for group in groups {
        match group {
            UpdateGroup::WithPts { updates, pts, pts_count } => pts_groups.push((*pts, *pts_count, updates)),
            UpdateGroup::WithQts { updates, qts } => qts_groups.push((*qts, updates)),
            UpdateGroup::WithSeq {
                updates,
                seq_range,
                date,
            } => seq_groups.push((*seq_range, *date, updates)),
            UpdateGroup::WithOther { updates } => other_groups.push(updates),
            UpdateGroup::TooLong => {
                tracing::debug!("Update group too long, polling difference");
                final_state.should_poll = true;
            }
        }
    }

    pts_groups.sort_by_key(|(pts, _, _)| *pts);
    for (pts, pts_count, updates) in pts_groups {
        let current = final_state.state.pts;
        if pts <= current {
            tracing::trace!("Skipping duplicate pts {} (current {})", pts, current);
        } else if pts.checked_sub(pts_count) == Some(current) {
            final_state.apply_updates(updates);
            final_state.state.pts = pts;
        } else {
            tracing::debug!("Pts gap: at {}, got {} with count {}", current, pts, pts_count);
            final_state.incomplete = true;
            break;
        }
    }

    qts_groups.sort_by_key(|(qts, _)| *qts);
    for (qts, updates) in qts_groups {
        let current = final_state.state.qts;
        if qts <= current {
            tracing::trace!("Skipping duplicate qts {} (current {})", qts, current);
        } else if qts.checked_sub(1) == Some(current) {
            final_state.apply_updates(updates);
            final_state.state.qts = qts;
        } else {
            tracing::debug!("Qts gap: at {}, got {}", current, qts);
            final_state.incomplete = true;
            break;
        }
    }

    seq_groups.sort_by_key(|(range, _, _)| range.map(|(start, _)| start).unwrap_or(i32::MIN));
    for (seq_range, date, updates) in seq_groups {
        match seq_range {
            None => {
                final_state.apply_updates(updates);
                final_state.state.date = final_state.state.date.max(date);
            }
            Some((start, end)) => {
                let current = final_state.state.seq;
                if end <= current {
                    tracing::trace!("Skipping duplicate seq {}..{} (current {})", start, end, current);
                } else if current.checked_add(1) == Some(start) {
                    final_state.apply_updates(updates);
                    final_state.state.seq = end;
                    final_state.state.date = date;
                } else {
                    tracing::debug!("Seq gap: at {}, got {}", current, start);
                    final_state.should_poll = true;
                    break;
                }
            }
        }
    }

    for updates in other_groups {
        final_state.apply_updates(updates);
    }

    final_state
}

/// Build a final state from a polled difference.
///
/// `Difference::TooLong` yields a state that asks for another poll; the
/// caller resets the account before that happens.
pub fn final_state_with_difference(base_state: AccountSyncState, difference: &Difference) -> AccountFinalState {
    let mut final_state = AccountFinalState::new(base_state);
    match difference {
        Difference::Empty { date, seq } => {
            final_state.state.date = *date;
            final_state.state.seq = *seq;
        }
        Difference::Difference {
            new_messages,
            other_updates,
            state,
        }
        | Difference::Slice {
            new_messages,
            other_updates,
            intermediate_state: state,
        } => {
            final_state.add_messages(new_messages.iter().cloned());
            final_state.apply_updates(other_updates);
            final_state.state = *state;
        }
        Difference::TooLong { .. } => final_state.should_poll = true,
    }
    final_state
}

// ============================================================================
// REPLAY RESULT
// ============================================================================

/// A final state that was successfully written to the postbox
#[derive(Debug, Clone, PartialEq)]
pub struct AccountReplayedFinalState {
    /// What was applied
    pub state: AccountFinalState,
    /// Incoming messages stored for the first time
    pub added_incoming_message_ids: Vec<MessageId>,
    /// Peers whose counters became unreliable during the replay
    pub read_state_sync_peers: Vec<PeerId>,
}

impl AccountReplayedFinalState {
    /// Side effects to deliver once the replay is committed
    pub fn events(&self) -> AccountFinalStateEvents {
        AccountFinalStateEvents {
            added_incoming_message_ids: self.added_incoming_message_ids.clone(),
            typing_activities: self.state.typing_activities.clone(),
            updated_webpages: self.state.updated_webpages.clone(),
            call_updates: self.state.call_updates.clone(),
            read_state_sync_peers: self.read_state_sync_peers.clone(),
        }
    }
}

/// Side effects accumulated across replays
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountFinalStateEvents {
    /// Incoming messages stored for the first time
    pub added_incoming_message_ids: Vec<MessageId>,
    /// Typing indicators seen
    pub typing_activities: Vec<TypingActivity>,
    /// Resolved link previews
    pub updated_webpages: Vec<Webpage>,
    /// Call signalling updates
    pub call_updates: Vec<CallSessionUpdate>,
    /// Peers whose read state must be fetched
    pub read_state_sync_peers: Vec<PeerId>,
}

impl AccountFinalStateEvents {
    /// Nothing to deliver
    pub fn is_empty(&self) -> bool {
        self.added_incoming_message_ids.is_empty()
            && self.typing_activities.is_empty()
            && self.updated_webpages.is_empty()
            && self.call_updates.is_empty()
            && self.read_state_sync_peers.is_empty()
    }

    /// Events of `self` followed by those of `other`
    pub fn union(mut self, other: AccountFinalStateEvents) -> Self {
        self.added_incoming_message_ids.extend(other.added_incoming_message_ids);
        self.typing_activities.extend(other.typing_activities);
        self.updated_webpages.extend(other.updated_webpages);
        self.call_updates.extend(other.call_updates);
        for peer_id in other.read_state_sync_peers {
            if !self.read_state_sync_peers.contains(&peer_id) {
                self.read_state_sync_peers.push(peer_id);
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::types::PeerInputActivity;

    fn cursor(pts: i32, qts: i32, seq: i32) -> AccountSyncState {
        AccountSyncState { pts, qts, date: 0, seq }
    }

    fn message(id: i32) -> Message {
        Message {
            id: MessageId::new(PeerId::new(0, 1), message_namespaces::CLOUD, id),
            timestamp: 100 + id,
            global_id: None,
            author_id: None,
            incoming: true,
            text: format!("m{}", id),
        }
    }

    fn pts_group(id: i32, pts: i32) -> UpdateGroup {
        UpdateGroup::WithPts {
            updates: vec![AccountUpdate::NewMessage(message(id))],
            pts,
            pts_count: 1,
        }
    }

    #[test]
    fn test_pts_groups_applied_in_order() {
        let state = final_state_with_update_groups(cursor(10, 0, 0), &[pts_group(2, 12), pts_group(1, 11)]);
        assert_eq!(state.state.pts, 12);
        assert!(!state.incomplete);
        assert_eq!(
            state.mutations,
            vec![AccountMutation::AddMessages(vec![message(1), message(2)])]
        );
    }

    #[test]
    fn test_duplicate_pts_skipped() {
        let state = final_state_with_update_groups(cursor(10, 0, 0), &[pts_group(1, 10), pts_group(2, 11)]);
        assert_eq!(state.state.pts, 11);
        assert_eq!(state.mutations, vec![AccountMutation::AddMessages(vec![message(2)])]);
    }

    #[test]
    fn test_pts_gap_marks_incomplete() {
        let state = final_state_with_update_groups(cursor(10, 0, 0), &[pts_group(1, 11), pts_group(3, 13)]);
        assert!(state.incomplete);
        assert!(!state.should_poll);
        assert_eq!(state.state.pts, 11);
        assert_eq!(state.mutations.len(), 1);
    }

    #[test]
    fn test_overflowing_sequence_values_are_gaps() {
        let hostile = UpdateGroup::WithPts {
            updates: vec![AccountUpdate::NewMessage(message(1))],
            pts: 11,
            pts_count: i32::MIN,
        };
        let state = final_state_with_update_groups(cursor(10, 0, 0), &[hostile]);
        assert!(state.incomplete);
        assert_eq!(state.state.pts, 10);
        assert!(state.mutations.is_empty());

        let at_limit = UpdateGroup::WithPts {
            updates: vec![],
            pts: i32::MAX,
            pts_count: 1,
        };
        let state = final_state_with_update_groups(cursor(i32::MAX - 1, 0, 0), &[at_limit]);
        assert!(!state.incomplete);
        assert_eq!(state.state.pts, i32::MAX);
    }

    #[test]
    fn test_qts_gap_marks_incomplete() {
        let group = UpdateGroup::WithQts {
            updates: vec![],
            qts: 7,
        };
        let state = final_state_with_update_groups(cursor(0, 5, 0), &[group]);
        assert!(state.incomplete);
        assert_eq!(state.state.qts, 5);
    }

    #[test]
    fn test_seq_gap_and_too_long_poll() {
        let gap = UpdateGroup::WithSeq {
            updates: vec![],
            seq_range: Some((5, 5)),
            date: 10,
        };
        assert!(final_state_with_update_groups(cursor(0, 0, 3), &[gap]).should_poll);
        assert!(final_state_with_update_groups(cursor(0, 0, 3), &[UpdateGroup::TooLong]).should_poll);

        let next = UpdateGroup::WithSeq {
            updates: vec![],
            seq_range: Some((4, 5)),
            date: 10,
        };
        let state = final_state_with_update_groups(cursor(0, 0, 3), &[next]);
        assert!(!state.should_poll);
        assert_eq!(state.state.seq, 5);
        assert_eq!(state.state.date, 10);
    }

    #[test]
    fn test_side_effects_collected() {
        let peer_id = PeerId::new(0, 1);
        let group = UpdateGroup::WithOther {
            updates: vec![
                AccountUpdate::UserTyping {
                    peer_id,
                    user_id: peer_id,
                    activity: Some(PeerInputActivity::Typing),
                },
                AccountUpdate::ReadInbox { peer_id, max_id: 9 },
            ],
        };
        let state = final_state_with_update_groups(cursor(0, 0, 0), &[group]);
        assert_eq!(state.typing_activities.len(), 1);
        assert_eq!(
            state.mutations,
            vec![AccountMutation::ReadInbox(MessageId::new(peer_id, message_namespaces::CLOUD, 9))]
        );
    }

    #[test]
    fn test_difference_moves_cursor() {
        let slice = Difference::Slice {
            new_messages: vec![message(1)],
            other_updates: vec![],
            intermediate_state: cursor(20, 0, 4),
        };
        let state = final_state_with_difference(cursor(10, 0, 3), &slice);
        assert_eq!(state.base_state, cursor(10, 0, 3));
        assert_eq!(state.state, cursor(20, 0, 4));
        assert_eq!(state.mutations, vec![AccountMutation::AddMessages(vec![message(1)])]);

        let empty = final_state_with_difference(cursor(10, 0, 3), &Difference::Empty { date: 77, seq: 5 });
        assert_eq!(empty.state.pts, 10);
        assert_eq!(empty.state.seq, 5);
        assert_eq!(empty.state.date, 77);
    }

    #[test]
    fn test_events_union() {
        let peer_id = PeerId::new(0, 1);
        let first = AccountFinalStateEvents {
            added_incoming_message_ids: vec![message(1).id],
            read_state_sync_peers: vec![peer_id],
            ..Default::default()
        };
        let second = AccountFinalStateEvents {
            added_incoming_message_ids: vec![message(2).id],
            read_state_sync_peers: vec![peer_id],
            ..Default::default()
        };
        let merged = first.union(second);
        assert_eq!(merged.added_incoming_message_ids, vec![message(1).id, message(2).id]);
        assert_eq!(merged.read_state_sync_peers, vec![peer_id]);
        assert!(!merged.is_empty());
        assert!(AccountFinalStateEvents::default().is_empty());
    }
}
