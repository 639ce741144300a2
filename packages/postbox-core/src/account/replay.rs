//! # Replay
//!
//! Writes final states and state-reset snapshots into the postbox. Both
//! functions run inside a transaction body and never touch the network.

use std::collections::{BTreeMap, HashMap};

use super::final_state::{
    final_state_with_update_groups, AccountFinalState, AccountMutation, AccountReplayedFinalState,
};
use super::types::{AuthorizedAccountState, StateResetSnapshot, UpdateGroup};
use crate::error::Result;
use crate::postbox::{message_namespaces, Modifier, PeerReadState};

/// Apply `final_state` unless the stored cursor moved since it was built.
///
/// Returns `None` without writing anything when the stored cursor is not
/// `final_state.base_state`.
pub fn replay_final_state(
    modifier: &mut Modifier<'_>,
    final_state: AccountFinalState,
) -> Result<Option<AccountReplayedFinalState>> {
    let stored: Option<AuthorizedAccountState> = modifier.get_state()?;
    let Some(mut authorized) = stored else {
        tracing::warn!("Replay without an authorized account state");
        return Ok(None);
    };
    if authorized.state != Some(final_state.base_state) {
        tracing::debug!(
            "Replay rejected: stored cursor {:?}, final state built on {:?}",
            authorized.state,
            final_state.base_state
        );
        return Ok(None);
    }

    let mut added_incoming_message_ids = Vec::new();
    for mutation in &final_state.mutations {
        match mutation {
            AccountMutation::AddMessages(messages) => {
                let added = modifier.add_messages(messages)?;
                added_incoming_message_ids.extend(added.into_iter().filter(|id| {
                    messages
                        .iter()
                        .any(|message| message.id == *id && message.incoming)
                }));
            }
            AccountMutation::DeleteMessages(ids) => modifier.delete_messages(ids)?,
            AccountMutation::DeleteMessagesWithGlobalIds(ids) => modifier.delete_messages_with_global_ids(ids)?,
            AccountMutation::ReadInbox(message_id) => modifier.apply_incoming_read_max_id(*message_id)?,
            AccountMutation::ReadOutbox(message_id) => modifier.apply_outgoing_read_max_id(*message_id)?,
        }
    }

    authorized.state = Some(final_state.state);
    modifier.set_state(&authorized)?;

    let mut read_state_sync_peers: Vec<_> = modifier.peers_requiring_read_state_sync().iter().copied().collect();
    read_state_sync_peers.sort();

    Ok(Some(AccountReplayedFinalState {
        state: final_state,
        added_incoming_message_ids,
        read_state_sync_peers,
    }))
}

/// Build a final state from pushed groups against the stored cursor and
/// replay it in the same transaction.
///
/// `None` means there is no cursor to build on yet.
pub fn replay_update_groups(
    modifier: &mut Modifier<'_>,
    groups: &[UpdateGroup],
) -> Result<Option<AccountReplayedFinalState>> {
    let stored: Option<AuthorizedAccountState> = modifier.get_state()?;
    let Some(base_state) = stored.and_then(|authorized| authorized.state) else {
        return Ok(None);
    };
    replay_final_state(modifier, final_state_with_update_groups(base_state, groups))
}

/// Rebuild local state from a dialogs snapshot.
///
/// Marks the history below every unknown top message as a hole, stores the
/// top messages, overwrites read states and moves the cursor. The stored
/// `qts` and `date` survive the reset.
pub fn apply_state_reset(modifier: &mut Modifier<'_>, snapshot: StateResetSnapshot) -> Result<()> {
    for dialog in &snapshot.dialogs {
        if dialog.top_message_id <= 1 {
            continue;
        }
        let local_top = modifier
            .top_message_index(dialog.peer_id, message_namespaces::CLOUD)?
            .map(|index| index.id.id);
        if local_top.map_or(true, |id| id < dialog.top_message_id) {
            modifier.add_hole(dialog.peer_id, message_namespaces::CLOUD, 1, dialog.top_message_id - 1)?;
        }
    }

    modifier.add_messages(&snapshot.top_messages)?;

    let read_states: HashMap<_, _> = snapshot
        .dialogs
        .iter()
        .map(|dialog| {
            let state = PeerReadState::IdBased {
                max_incoming_read_id: dialog.read_inbox_max_id,
                max_outgoing_read_id: dialog.read_outbox_max_id,
                max_known_id: dialog.top_message_id,
                count: dialog.unread_count,
            };
            (dialog.peer_id, BTreeMap::from([(message_namespaces::CLOUD, state)]))
        })
        .collect();
    modifier.reset_incoming_read_states(read_states)?;

    let stored: Option<AuthorizedAccountState> = modifier.get_state()?;
    match stored {
        Some(mut authorized) => {
            let mut state = snapshot.state;
            if let Some(current) = authorized.state {
                state.qts = current.qts;
                state.date = current.date;
            }
            authorized.state = Some(state);
            modifier.set_state(&authorized)?;
        }
        None => tracing::warn!("State reset without an authorized account state"),
    }

    tracing::info!("Account state reset with {} dialogs", snapshot.dialogs.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::types::{AccountSyncState, AccountUpdate, DialogSnapshot};
    use crate::postbox::{Message, MessageId, PeerId, Postbox, PostboxConfig};

    fn cursor(pts: i32) -> AccountSyncState {
        AccountSyncState {
            pts,
            qts: 3,
            date: 50,
            seq: 1,
        }
    }

    fn account(state: Option<AccountSyncState>) -> AuthorizedAccountState {
        AuthorizedAccountState {
            peer_id: PeerId::new(0, 1000),
            state,
        }
    }

    fn peer() -> PeerId {
        PeerId::new(0, 7)
    }

    fn message(id: i32, incoming: bool) -> Message {
        Message {
            id: MessageId::new(peer(), message_namespaces::CLOUD, id),
            timestamp: 100 + id,
            global_id: None,
            author_id: Some(peer()),
            incoming,
            text: String::new(),
        }
    }

    fn postbox_at(state: AuthorizedAccountState) -> Postbox {
        let postbox = Postbox::open(PostboxConfig::default()).unwrap();
        postbox.transaction(|m| m.set_state(&state)).unwrap();
        postbox
    }

    #[test]
    fn test_replay_applies_mutations_and_cursor() {
        let postbox = postbox_at(account(Some(cursor(10))));
        let groups = vec![UpdateGroup::WithPts {
            updates: vec![
                AccountUpdate::NewMessage(message(1, true)),
                AccountUpdate::NewMessage(message(2, false)),
            ],
            pts: 12,
            pts_count: 2,
        }];
        let final_state = final_state_with_update_groups(cursor(10), &groups);

        let replayed = postbox
            .transaction(|m| replay_final_state(m, final_state))
            .unwrap()
            .unwrap();
        assert_eq!(replayed.added_incoming_message_ids, vec![message(1, true).id]);

        let stored: Option<AuthorizedAccountState> = postbox.transaction(|m| m.get_state()).unwrap();
        assert_eq!(stored.unwrap().state.unwrap().pts, 12);
        let outgoing = postbox.transaction(|m| m.get_message(message(2, false).id)).unwrap();
        assert!(outgoing.is_some());
    }

    #[test]
    fn test_replay_rejects_stale_base() {
        let postbox = postbox_at(account(Some(cursor(11))));
        let final_state = final_state_with_update_groups(cursor(10), &[]);
        let replayed = postbox.transaction(|m| replay_final_state(m, final_state)).unwrap();
        assert!(replayed.is_none());
    }

    #[test]
    fn test_replay_reports_hole_peers() {
        let postbox = postbox_at(account(Some(cursor(10))));
        let mut final_state = final_state_with_update_groups(cursor(10), &[]);
        final_state.mutations.push(AccountMutation::AddMessages(vec![message(5, true)]));

        // No read state exists for the peer yet, so counting the message raises a hole.
        let replayed = postbox
            .transaction(|m| replay_final_state(m, final_state))
            .unwrap()
            .unwrap();
        assert_eq!(replayed.read_state_sync_peers, vec![peer()]);
    }

    #[test]
    fn test_update_groups_replayed_on_stored_cursor() {
        let postbox = postbox_at(account(Some(cursor(10))));
        let groups = vec![
            UpdateGroup::WithPts {
                updates: vec![AccountUpdate::NewMessage(message(1, true))],
                pts: 11,
                pts_count: 1,
            },
            UpdateGroup::WithPts {
                updates: vec![AccountUpdate::NewMessage(message(3, true))],
                pts: 13,
                pts_count: 1,
            },
        ];
        let replayed = postbox
            .transaction(|m| replay_update_groups(m, &groups))
            .unwrap()
            .unwrap();
        assert!(replayed.state.incomplete);
        assert_eq!(replayed.state.state.pts, 11);

        let unauthorized = postbox_at(account(None));
        assert!(unauthorized
            .transaction(|m| replay_update_groups(m, &groups))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_state_reset_rebuilds_read_states() {
        let postbox = postbox_at(account(Some(cursor(10))));
        let snapshot = StateResetSnapshot {
            dialogs: vec![DialogSnapshot {
                peer_id: peer(),
                read_inbox_max_id: 3,
                read_outbox_max_id: 4,
                top_message_id: 9,
                unread_count: 6,
            }],
            top_messages: vec![message(9, true)],
            state: AccountSyncState {
                pts: 90,
                qts: 0,
                date: 0,
                seq: 8,
            },
        };
        postbox.transaction(|m| apply_state_reset(m, snapshot)).unwrap();

        let combined = postbox
            .transaction(|m| m.get_combined_peer_read_state(peer()))
            .unwrap()
            .unwrap();
        assert_eq!(combined.count(), 6);

        let stored: Option<AuthorizedAccountState> = postbox.transaction(|m| m.get_state()).unwrap();
        assert_eq!(
            stored.unwrap().state,
            Some(AccountSyncState {
                pts: 90,
                qts: 3,
                date: 50,
                seq: 8
            })
        );
    }
}
