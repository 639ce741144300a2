//! # Modifier
//!
//! Mutating access to every table inside one transaction.
//!
//! The modifier is where tables meet: new incoming messages feed the
//! read-state table, deletions ask history for authoritative counts before
//! the messages disappear, and read markers are applied with history scans
//! as the collaborators.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{de::DeserializeOwned, Serialize};

use super::read_state::{CombinedPeerReadState, PeerReadState};
use super::read_state_table::{InteractiveReadAction, ReadStateChange, TopMessage};
use super::types::{Message, MessageId, MessageIndex, MessageNamespace, PeerId};
use super::value_box::ValueBox;
use super::Tables;
use crate::error::Result;

/// Per-transaction bookkeeping handed to the controller on commit
#[derive(Debug, Default)]
pub(crate) struct PendingSummary {
    pub(crate) peers_requiring_read_state_sync: HashSet<PeerId>,
    pub(crate) peers_to_push_read_state: HashMap<PeerId, bool>,
    pub(crate) added_incoming_message_ids: Vec<MessageId>,
}

/// Table access for the body of [`Postbox::transaction`](super::Postbox::transaction)
pub struct Modifier<'a> {
    value_box: &'a mut dyn ValueBox,
    tables: &'a mut Tables,
    pending: PendingSummary,
}

impl<'a> Modifier<'a> {
    pub(crate) fn new(value_box: &'a mut dyn ValueBox, tables: &'a mut Tables) -> Self {
        Self {
            value_box,
            tables,
            pending: PendingSummary::default(),
        }
    }

    pub(crate) fn into_pending(self) -> PendingSummary {
        self.pending
    }

    fn note_change(&mut self, peer_id: PeerId, change: &ReadStateChange) {
        if change.hole {
            tracing::warn!("Read state hole for peer {}, scheduling sync", peer_id);
            self.pending.peers_requiring_read_state_sync.insert(peer_id);
        }
    }

    /// Peers whose read state must be fetched after this transaction
    pub fn peers_requiring_read_state_sync(&self) -> &HashSet<PeerId> {
        &self.pending.peers_requiring_read_state_sync
    }

    // ========================================================================
    // METADATA
    // ========================================================================

    /// Stored sync cursor
    pub fn get_state<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        self.tables.metadata.state(&*self.value_box)
    }

    /// Replace the sync cursor
    pub fn set_state<T: Serialize>(&mut self, state: &T) -> Result<()> {
        self.tables.metadata.set_state(state)
    }

    /// Committed total unread count.
    ///
    /// Changes made by this transaction are folded in on commit.
    pub fn total_unread_count(&mut self) -> Result<i32> {
        self.tables.metadata.total_unread_count(&*self.value_box)
    }

    // ========================================================================
    // READ STATES
    // ========================================================================

    /// Snapshot of a peer's read states
    pub fn get_combined_peer_read_state(&mut self, peer_id: PeerId) -> Result<Option<CombinedPeerReadState>> {
        self.tables.read_states.get_combined_state(&*self.value_box, peer_id)
    }

    /// Overwrite read states with server snapshots
    pub fn reset_incoming_read_states(
        &mut self,
        states: HashMap<PeerId, BTreeMap<MessageNamespace, PeerReadState>>,
    ) -> Result<()> {
        for (peer_id, namespaces) in states {
            self.tables
                .read_states
                .reset_states(&*self.value_box, peer_id, namespaces)?;
            self.pending.peers_requiring_read_state_sync.remove(&peer_id);
        }
        Ok(())
    }

    /// Apply a server read receipt for incoming messages of an id-based chat
    pub fn apply_incoming_read_max_id(&mut self, message_id: MessageId) -> Result<()> {
        let value_box: &dyn ValueBox = &*self.value_box;
        let Tables {
            read_states,
            history,
            ..
        } = &mut *self.tables;

        let top_message = history
            .top_message_id(value_box, message_id.peer_id, message_id.namespace)?
            .map(|id| TopMessage {
                id,
                reached: message_id.id >= id,
            });
        let change = read_states.apply_incoming_max_read_id(
            value_box,
            message_id,
            &mut |namespace, from, to| {
                history.incoming_stats_in_range(value_box, message_id.peer_id, namespace, from, to)
            },
            top_message,
        )?;
        self.note_change(message_id.peer_id, &change);
        Ok(())
    }

    /// Apply a server read receipt for incoming messages of an index-based chat
    pub fn apply_incoming_read_max_index(&mut self, index: MessageIndex) -> Result<Vec<MessageId>> {
        let value_box: &dyn ValueBox = &*self.value_box;
        let Tables {
            read_states,
            history,
            ..
        } = &mut *self.tables;

        let change = read_states.apply_incoming_max_read_index(value_box, index, &mut |from, to| {
            history.incoming_index_stats_in_range(value_box, from, to)
        })?;
        self.note_change(index.id.peer_id, &change);
        Ok(change.message_ids)
    }

    /// Apply a read receipt from the other side of an id-based chat
    pub fn apply_outgoing_read_max_id(&mut self, message_id: MessageId) -> Result<()> {
        let change = self
            .tables
            .read_states
            .apply_outgoing_max_read_id(&*self.value_box, message_id)?;
        self.note_change(message_id.peer_id, &change);
        Ok(())
    }

    /// Apply a read receipt from the other side of an index-based chat.
    ///
    /// Returns the outgoing messages that became read.
    pub fn apply_outgoing_read_max_index(&mut self, index: MessageIndex) -> Result<Vec<MessageId>> {
        let value_box: &dyn ValueBox = &*self.value_box;
        let Tables {
            read_states,
            history,
            ..
        } = &mut *self.tables;

        let change = read_states.apply_outgoing_max_read_index(value_box, index, &mut |from, to| {
            history.outgoing_index_stats_in_range(value_box, from, to)
        })?;
        self.note_change(index.id.peer_id, &change);
        Ok(change.message_ids)
    }

    /// Mark a chat read up to `index` on behalf of the user.
    ///
    /// The peer is queued for a read-state push; returns the incoming
    /// messages that became read.
    pub fn apply_interactive_read_max_index(&mut self, index: MessageIndex) -> Result<Vec<MessageId>> {
        let value_box: &dyn ValueBox = &*self.value_box;
        let Tables {
            read_states,
            history,
            ..
        } = &mut *self.tables;
        let peer_id = index.id.peer_id;

        let top_message = history
            .top_message_id(value_box, peer_id, index.id.namespace)?
            .map(|id| TopMessage {
                id,
                reached: index.id.id >= id,
            });
        let result = read_states.apply_interactive_max_read_index(
            value_box,
            index,
            &mut |namespace, from, to| history.incoming_stats_in_range(value_box, peer_id, namespace, from, to),
            &mut |from, to| history.incoming_index_stats_in_range(value_box, from, to),
            top_message,
            &mut |namespace| history.top_message_index(value_box, peer_id, namespace),
        )?;

        if let InteractiveReadAction::Push { then_sync } = result.action {
            let entry = self.pending.peers_to_push_read_state.entry(peer_id).or_insert(false);
            *entry |= then_sync;
        }
        Ok(result.message_ids)
    }

    // ========================================================================
    // MESSAGES
    // ========================================================================

    /// Store messages; returns the ids that were not stored before.
    ///
    /// New incoming messages are counted by the read-state table.
    pub fn add_messages(&mut self, messages: &[Message]) -> Result<Vec<MessageId>> {
        let mut added = Vec::new();
        let mut incoming_by_peer: BTreeMap<PeerId, Vec<MessageIndex>> = BTreeMap::new();

        for message in messages {
            let is_new = self.tables.history.add_message(&mut *self.value_box, message)?;
            if let Some(global_id) = message.global_id {
                self.tables.global_ids.set(global_id, message.id);
            }
            if !is_new {
                continue;
            }
            added.push(message.id);
            if message.incoming {
                incoming_by_peer
                    .entry(message.id.peer_id)
                    .or_default()
                    .push(message.index());
                self.pending.added_incoming_message_ids.push(message.id);
            }
        }

        for (peer_id, indices) in incoming_by_peer {
            let change = self
                .tables
                .read_states
                .add_incoming_messages(&*self.value_box, peer_id, &indices)?;
            self.note_change(peer_id, &change);
        }
        Ok(added)
    }

    /// Delete messages, releasing their unread counts first
    pub fn delete_messages(&mut self, message_ids: &[MessageId]) -> Result<()> {
        let mut by_peer: BTreeMap<PeerId, Vec<MessageIndex>> = BTreeMap::new();
        for message_id in message_ids {
            if let Some(entry) = self.tables.history.index_entry(&*self.value_box, *message_id)? {
                by_peer.entry(message_id.peer_id).or_default().push(entry.index);
            }
        }

        for (peer_id, indices) in &by_peer {
            let value_box: &dyn ValueBox = &*self.value_box;
            let Tables {
                read_states,
                history,
                ..
            } = &mut *self.tables;
            let change = read_states.delete_messages(
                value_box,
                *peer_id,
                indices,
                &mut |peer_id, namespace, unread| {
                    history.incoming_stats_in_indices(value_box, peer_id, namespace, unread)
                },
            )?;
            self.note_change(*peer_id, &change);
        }

        for index in by_peer.values().flatten() {
            if let Some(message) = self.tables.history.remove_message(&mut *self.value_box, index.id)? {
                if let Some(global_id) = message.global_id {
                    self.tables.global_ids.remove(global_id);
                }
            }
        }
        Ok(())
    }

    /// Delete messages addressed by server-wide id
    pub fn delete_messages_with_global_ids(&mut self, global_ids: &[i32]) -> Result<()> {
        let mut message_ids = Vec::with_capacity(global_ids.len());
        for global_id in global_ids {
            match self.tables.global_ids.get(&*self.value_box, *global_id)? {
                Some(message_id) => message_ids.push(message_id),
                None => tracing::debug!("No message for global id {}", global_id),
            }
        }
        self.delete_messages(&message_ids)
    }

    /// Read a stored message
    pub fn get_message(&mut self, message_id: MessageId) -> Result<Option<Message>> {
        self.tables.history.get_message(&*self.value_box, message_id)
    }

    /// Chronologically newest message of a chat
    pub fn top_message_index(&mut self, peer_id: PeerId, namespace: MessageNamespace) -> Result<Option<MessageIndex>> {
        self.tables.history.top_message_index(&*self.value_box, peer_id, namespace)
    }

    /// Newest messages of a chat, newest first
    pub fn latest_messages(
        &mut self,
        peer_id: PeerId,
        namespace: MessageNamespace,
        limit: usize,
    ) -> Result<Vec<Message>> {
        self.tables
            .history
            .latest_messages(&*self.value_box, peer_id, namespace, limit)
    }

    /// Register a gap in local history
    pub fn add_hole(&mut self, peer_id: PeerId, namespace: MessageNamespace, min_id: i32, max_id: i32) -> Result<()> {
        self.tables
            .history
            .add_hole(&mut *self.value_box, peer_id, namespace, min_id, max_id)
    }

    /// Clear a gap in local history
    pub fn fill_hole(&mut self, peer_id: PeerId, namespace: MessageNamespace, min_id: i32, max_id: i32) -> Result<()> {
        self.tables
            .history
            .fill_hole(&mut *self.value_box, peer_id, namespace, min_id, max_id)
    }
}
