//! # Read State Table
//!
//! Reconciles per-peer read markers and unread counters against message
//! inserts, deletions and read receipts.
//!
//! ## Reconciliation
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       READ STATE RECONCILIATION                         │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  message ids ─────────────────────────────────────────────────────►    │
//! │                                                                         │
//! │  │ read │ read │ read ▌ unread │ unread │ unread ▌ new ...              │
//! │                       ▲                          ▲                      │
//! │             max_incoming_read_id           max_known_id                 │
//! │                                                                         │
//! │  add_incoming_messages     count += ids beyond both markers            │
//! │  delete_messages           count -= unread ids the history confirms    │
//! │  apply_incoming_max_read   count -= incoming ids the marker passes     │
//! │  apply_outgoing_max_read   marker only, no counter effect              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation that cannot prove its counter is exact reports a *hole*.
//! A hole is a normal return value; the synchronization layer answers it
//! with a read-state fetch from the server.
//!
//! The table never enumerates messages itself. Message counts come from
//! collaborator closures supplied by the caller, normally backed by the
//! message history table.

use std::collections::{BTreeMap, HashMap, HashSet};

use super::read_state::{decode_read_states, encode_read_states, CombinedPeerReadState, PeerReadState};
use super::table::Table;
use super::types::{MessageId, MessageIndex, MessageNamespace, PeerId};
use super::value_box::{ValueBox, ValueBoxKey, ValueBoxTable};
use crate::error::{Error, Result};

type NamespaceStates = BTreeMap<MessageNamespace, PeerReadState>;

// ============================================================================
// COLLABORATOR RESULTS
// ============================================================================

/// Incoming messages found by an id or index scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IncomingStats {
    /// Incoming messages in the scanned range
    pub count: i32,
    /// Whether the scan crossed a gap in stored history
    pub holes: bool,
}

/// Incoming messages found by an index-range scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingIndexStats {
    /// Incoming messages in the scanned range
    pub count: i32,
    /// Whether the scan crossed a gap in stored history
    pub holes: bool,
    /// The messages that became read
    pub message_ids: Vec<MessageId>,
}

/// Newest known message of a namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopMessage {
    /// Its id
    pub id: i32,
    /// Whether the marker being applied reaches it
    pub reached: bool,
}

// ============================================================================
// OPERATION RESULTS
// ============================================================================

/// Outcome of a read-state operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadStateChange {
    /// New snapshot, `None` when nothing changed
    pub combined_state: Option<CombinedPeerReadState>,
    /// The counter may be wrong and needs a resync
    pub hole: bool,
    /// Messages whose read status flipped, for index-based namespaces
    pub message_ids: Vec<MessageId>,
}

impl ReadStateChange {
    fn unchanged() -> Self {
        Self::default()
    }

    fn hole() -> Self {
        Self {
            hole: true,
            ..Self::default()
        }
    }
}

/// What the client must tell the server after an interactive read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractiveReadAction {
    /// Nothing to send
    None,
    /// Push the new marker, then optionally fetch the authoritative state
    Push {
        /// Follow the push with a read-state fetch
        then_sync: bool,
    },
}

/// Outcome of [`MessageHistoryReadStateTable::apply_interactive_max_read_index`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractiveReadResult {
    /// New snapshot, `None` when nothing changed
    pub combined_state: Option<CombinedPeerReadState>,
    /// Follow-up for the server
    pub action: InteractiveReadAction,
    /// Messages whose read status flipped
    pub message_ids: Vec<MessageId>,
}

impl InteractiveReadResult {
    fn from_change(change: ReadStateChange) -> Self {
        let action = if change.combined_state.is_some() {
            InteractiveReadAction::Push {
                then_sync: change.hole,
            }
        } else if change.hole {
            InteractiveReadAction::Push { then_sync: true }
        } else {
            InteractiveReadAction::None
        };
        Self {
            combined_state: change.combined_state,
            action,
            message_ids: change.message_ids,
        }
    }
}

// ============================================================================
// TABLE
// ============================================================================

/// Per-peer read states with write-back on commit
pub struct MessageHistoryReadStateTable {
    table: ValueBoxTable,
    cached: HashMap<PeerId, Option<NamespaceStates>>,
    /// State of every peer touched this transaction, as it was before the
    /// first mutation. Peers without a stored state map to an empty map.
    updated_initial: HashMap<PeerId, NamespaceStates>,
}

impl MessageHistoryReadStateTable {
    /// Create the table over `table`
    pub fn new(table: ValueBoxTable) -> Self {
        Self {
            table,
            cached: HashMap::new(),
            updated_initial: HashMap::new(),
        }
    }

    fn key(peer_id: PeerId) -> ValueBoxKey {
        ValueBoxKey::with_capacity(8).push_i64(peer_id.to_i64())
    }

    fn load(&mut self, value_box: &dyn ValueBox, peer_id: PeerId) -> Result<()> {
        if self.cached.contains_key(&peer_id) {
            return Ok(());
        }
        let states = match value_box.get(self.table, &Self::key(peer_id))? {
            Some(bytes) => {
                let decoded = decode_read_states(&bytes);
                if decoded.is_none() {
                    tracing::warn!("Undecodable read state for peer {}, treating as absent", peer_id);
                }
                decoded
            }
            None => None,
        };
        self.cached.insert(peer_id, states);
        Ok(())
    }

    /// Snapshot of a peer's read states
    pub fn get_combined_state(
        &mut self,
        value_box: &dyn ValueBox,
        peer_id: PeerId,
    ) -> Result<Option<CombinedPeerReadState>> {
        self.load(value_box, peer_id)?;
        Ok(self
            .cached
            .get(&peer_id)
            .and_then(|states| states.as_ref())
            .map(CombinedPeerReadState::from_map))
    }

    /// Overwrite namespace states with an authoritative server snapshot.
    ///
    /// Returns the new snapshot, or `None` when every namespace already
    /// matched.
    pub fn reset_states(
        &mut self,
        value_box: &dyn ValueBox,
        peer_id: PeerId,
        namespaces: NamespaceStates,
    ) -> Result<Option<CombinedPeerReadState>> {
        self.load(value_box, peer_id)?;
        tracing::trace!("reset_states peer {}: {:?}", peer_id, namespaces);

        match self.cached.get_mut(&peer_id) {
            Some(Some(states)) => {
                let mut updated = false;
                for (namespace, state) in namespaces {
                    if states.get(&namespace) != Some(&state) {
                        mark_updated(&mut self.updated_initial, peer_id, states);
                        states.insert(namespace, state);
                        updated = true;
                    }
                }
                Ok(updated.then(|| CombinedPeerReadState::from_map(states)))
            }
            _ => {
                mark_updated(&mut self.updated_initial, peer_id, &NamespaceStates::new());
                let combined = CombinedPeerReadState::from_map(&namespaces);
                self.cached.insert(peer_id, Some(namespaces));
                Ok(Some(combined))
            }
        }
    }

    /// Account for newly stored incoming messages of `peer_id`.
    ///
    /// A peer or namespace without a baseline yields a hole: the table
    /// cannot tell whether the messages are unread.
    pub fn add_incoming_messages(
        &mut self,
        value_box: &dyn ValueBox,
        peer_id: PeerId,
        indices: &[MessageIndex],
    ) -> Result<ReadStateChange> {
        self.load(value_box, peer_id)?;
        let Some(Some(states)) = self.cached.get_mut(&peer_id) else {
            return Ok(ReadStateChange::hole());
        };

        let mut updated = false;
        let mut hole = false;
        for (namespace, namespace_indices) in group_by_namespace(peer_id, indices) {
            let Some(current) = states.get(&namespace).copied() else {
                hole = true;
                continue;
            };

            let added = namespace_indices
                .iter()
                .filter(|index| match current {
                    PeerReadState::IdBased {
                        max_incoming_read_id,
                        max_known_id,
                        ..
                    } => index.id.id > max_known_id && index.id.id > max_incoming_read_id,
                    PeerReadState::IndexBased {
                        max_incoming_read_index,
                        ..
                    } => **index > max_incoming_read_index,
                })
                .count() as i32;

            if added != 0 {
                mark_updated(&mut self.updated_initial, peer_id, states);
                states.insert(namespace, current.with_count(current.count().saturating_add(added)));
                updated = true;
            }
        }

        tracing::trace!(
            "add_incoming_messages peer {}: {} indices, updated {}, hole {}",
            peer_id,
            indices.len(),
            updated,
            hole
        );
        Ok(ReadStateChange {
            combined_state: updated.then(|| CombinedPeerReadState::from_map(states)),
            hole,
            message_ids: Vec::new(),
        })
    }

    /// Account for messages about to be deleted from `peer_id`.
    ///
    /// Must run before the messages leave history: the collaborator counts
    /// which of the still-unread indices are stored incoming messages.
    pub fn delete_messages(
        &mut self,
        value_box: &dyn ValueBox,
        peer_id: PeerId,
        indices: &[MessageIndex],
        incoming_stats_in_indices: &mut dyn FnMut(
            PeerId,
            MessageNamespace,
            &[MessageIndex],
        ) -> Result<IncomingStats>,
    ) -> Result<ReadStateChange> {
        self.load(value_box, peer_id)?;
        let Some(Some(states)) = self.cached.get_mut(&peer_id) else {
            return Ok(ReadStateChange::hole());
        };

        let mut updated = false;
        let mut hole = false;
        for (namespace, namespace_indices) in group_by_namespace(peer_id, indices) {
            let Some(current) = states.get(&namespace).copied() else {
                hole = true;
                continue;
            };

            let unread: Vec<MessageIndex> = namespace_indices
                .into_iter()
                .filter(|index| !current.is_incoming_message_index_read(index))
                .collect();
            if unread.is_empty() {
                continue;
            }

            let stats = incoming_stats_in_indices(peer_id, namespace, &unread)?;
            hole |= stats.holes;
            if stats.count == 0 {
                continue;
            }

            let (count, clamped) = subtract_count(current.count(), stats.count);
            if clamped {
                tracing::warn!(
                    "Unread count of peer {} namespace {} would go negative on delete",
                    peer_id,
                    namespace
                );
                hole = true;
            }
            mark_updated(&mut self.updated_initial, peer_id, states);
            states.insert(namespace, current.with_count(count));
            updated = true;
        }

        Ok(ReadStateChange {
            combined_state: updated.then(|| CombinedPeerReadState::from_map(states)),
            hole,
            message_ids: Vec::new(),
        })
    }

    /// Advance the incoming read marker of an id-based namespace.
    ///
    /// `incoming_stats_in_range(namespace, from, to)` counts incoming
    /// messages with `from <= id <= to`. When the marker reaches the top
    /// message the whole counter is consumed; if the scan disagrees with
    /// it the counter wins and a hole is reported.
    pub fn apply_incoming_max_read_id(
        &mut self,
        value_box: &dyn ValueBox,
        message_id: MessageId,
        incoming_stats_in_range: &mut dyn FnMut(MessageNamespace, i32, i32) -> Result<IncomingStats>,
        top_message: Option<TopMessage>,
    ) -> Result<ReadStateChange> {
        let peer_id = message_id.peer_id;
        self.load(value_box, peer_id)?;
        let Some(Some(states)) = self.cached.get_mut(&peer_id) else {
            return Ok(ReadStateChange::hole());
        };
        let Some(state) = states.get(&message_id.namespace).copied() else {
            return Ok(ReadStateChange::hole());
        };
        tracing::trace!("apply_incoming_max_read_id {} (before: {:?})", message_id, state);

        let PeerReadState::IdBased {
            max_incoming_read_id,
            max_outgoing_read_id,
            max_known_id,
            count,
        } = state
        else {
            return Err(variant_mismatch("apply_incoming_max_read_id", message_id));
        };

        let top_reached = top_message
            .map(|top| message_id.id == top.id || top.reached)
            .unwrap_or(false);
        if !(max_incoming_read_id < message_id.id || (top_reached && count != 0)) {
            return Ok(ReadStateChange::unchanged());
        }

        let stats = incoming_stats_in_range(
            message_id.namespace,
            max_incoming_read_id.saturating_add(1),
            message_id.id,
        )?;
        let mut delta = stats.count;
        let mut hole = stats.holes;
        tracing::trace!("apply_incoming_max_read_id delta {}, holes {}", delta, hole);

        if top_reached && delta != count {
            delta = count;
            hole = true;
        }

        let (count, clamped) = subtract_count(count, delta);
        if clamped {
            tracing::warn!("Unread count of {} would go negative on read", message_id);
            hole = true;
        }

        mark_updated(&mut self.updated_initial, peer_id, states);
        states.insert(
            message_id.namespace,
            PeerReadState::IdBased {
                max_incoming_read_id: max_incoming_read_id.max(message_id.id),
                max_outgoing_read_id,
                max_known_id,
                count,
            },
        );
        Ok(ReadStateChange {
            combined_state: Some(CombinedPeerReadState::from_map(states)),
            hole,
            message_ids: Vec::new(),
        })
    }

    /// Advance the incoming read marker of an index-based namespace.
    ///
    /// `incoming_stats_in_range(from, to)` scans `from <= index <= to`.
    pub fn apply_incoming_max_read_index(
        &mut self,
        value_box: &dyn ValueBox,
        message_index: MessageIndex,
        incoming_stats_in_range: &mut dyn FnMut(MessageIndex, MessageIndex) -> Result<IncomingIndexStats>,
    ) -> Result<ReadStateChange> {
        let peer_id = message_index.id.peer_id;
        self.load(value_box, peer_id)?;
        let Some(Some(states)) = self.cached.get_mut(&peer_id) else {
            return Ok(ReadStateChange::hole());
        };
        let Some(state) = states.get(&message_index.id.namespace).copied() else {
            return Ok(ReadStateChange::hole());
        };
        tracing::trace!("apply_incoming_max_read_index {:?} (before: {:?})", message_index, state);

        let PeerReadState::IndexBased {
            max_incoming_read_index,
            max_outgoing_read_index,
            count,
        } = state
        else {
            return Err(variant_mismatch("apply_incoming_max_read_index", message_index.id));
        };

        if max_incoming_read_index >= message_index {
            return Ok(ReadStateChange::unchanged());
        }

        let stats = incoming_stats_in_range(max_incoming_read_index.successor(), message_index)?;
        let mut hole = stats.holes;
        let (count, clamped) = subtract_count(count, stats.count);
        if clamped {
            tracing::warn!("Unread count of {} would go negative on read", message_index.id);
            hole = true;
        }

        mark_updated(&mut self.updated_initial, peer_id, states);
        states.insert(
            message_index.id.namespace,
            PeerReadState::IndexBased {
                max_incoming_read_index: message_index,
                max_outgoing_read_index,
                count,
            },
        );
        Ok(ReadStateChange {
            combined_state: Some(CombinedPeerReadState::from_map(states)),
            hole,
            message_ids: stats.message_ids,
        })
    }

    /// Advance the outgoing read marker of an id-based namespace
    pub fn apply_outgoing_max_read_id(
        &mut self,
        value_box: &dyn ValueBox,
        message_id: MessageId,
    ) -> Result<ReadStateChange> {
        let peer_id = message_id.peer_id;
        self.load(value_box, peer_id)?;
        let Some(Some(states)) = self.cached.get_mut(&peer_id) else {
            return Ok(ReadStateChange::hole());
        };
        let Some(state) = states.get(&message_id.namespace).copied() else {
            return Ok(ReadStateChange::hole());
        };

        let PeerReadState::IdBased {
            max_incoming_read_id,
            max_outgoing_read_id,
            max_known_id,
            count,
        } = state
        else {
            return Err(variant_mismatch("apply_outgoing_max_read_id", message_id));
        };

        if max_outgoing_read_id >= message_id.id {
            return Ok(ReadStateChange::unchanged());
        }

        mark_updated(&mut self.updated_initial, peer_id, states);
        states.insert(
            message_id.namespace,
            PeerReadState::IdBased {
                max_incoming_read_id,
                max_outgoing_read_id: message_id.id,
                max_known_id,
                count,
            },
        );
        Ok(ReadStateChange {
            combined_state: Some(CombinedPeerReadState::from_map(states)),
            hole: false,
            message_ids: Vec::new(),
        })
    }

    /// Advance the outgoing read marker of an index-based namespace.
    ///
    /// Returns the outgoing messages the marker passed.
    pub fn apply_outgoing_max_read_index(
        &mut self,
        value_box: &dyn ValueBox,
        message_index: MessageIndex,
        outgoing_index_stats_in_range: &mut dyn FnMut(MessageIndex, MessageIndex) -> Result<Vec<MessageId>>,
    ) -> Result<ReadStateChange> {
        let peer_id = message_index.id.peer_id;
        self.load(value_box, peer_id)?;
        let Some(Some(states)) = self.cached.get_mut(&peer_id) else {
            return Ok(ReadStateChange::hole());
        };
        let Some(state) = states.get(&message_index.id.namespace).copied() else {
            return Ok(ReadStateChange::hole());
        };

        let PeerReadState::IndexBased {
            max_incoming_read_index,
            max_outgoing_read_index,
            count,
        } = state
        else {
            return Err(variant_mismatch("apply_outgoing_max_read_index", message_index.id));
        };

        if max_outgoing_read_index >= message_index {
            return Ok(ReadStateChange::unchanged());
        }

        let message_ids = outgoing_index_stats_in_range(max_outgoing_read_index.successor(), message_index)?;
        mark_updated(&mut self.updated_initial, peer_id, states);
        states.insert(
            message_index.id.namespace,
            PeerReadState::IndexBased {
                max_incoming_read_index,
                max_outgoing_read_index: message_index,
                count,
            },
        );
        Ok(ReadStateChange {
            combined_state: Some(CombinedPeerReadState::from_map(states)),
            hole: false,
            message_ids,
        })
    }

    /// Mark everything up to `message_index` read on behalf of the user.
    ///
    /// Dispatches on the namespace's variant. When the namespace has no
    /// state yet, the first namespace whose top message lies at or before
    /// `message_index` is read up to that top message instead.
    pub fn apply_interactive_max_read_index(
        &mut self,
        value_box: &dyn ValueBox,
        message_index: MessageIndex,
        incoming_stats_in_range: &mut dyn FnMut(MessageNamespace, i32, i32) -> Result<IncomingStats>,
        incoming_index_stats_in_range: &mut dyn FnMut(MessageIndex, MessageIndex) -> Result<IncomingIndexStats>,
        top_message: Option<TopMessage>,
        top_message_index_by_namespace: &mut dyn FnMut(MessageNamespace) -> Result<Option<MessageIndex>>,
    ) -> Result<InteractiveReadResult> {
        let peer_id = message_index.id.peer_id;
        self.load(value_box, peer_id)?;
        let Some(Some(states)) = self.cached.get(&peer_id) else {
            return Ok(InteractiveReadResult::from_change(ReadStateChange::hole()));
        };

        if let Some(state) = states.get(&message_index.id.namespace).copied() {
            let change = match state {
                PeerReadState::IdBased { .. } => self.apply_incoming_max_read_id(
                    value_box,
                    message_index.id,
                    incoming_stats_in_range,
                    top_message,
                )?,
                PeerReadState::IndexBased { .. } => self.apply_incoming_max_read_index(
                    value_box,
                    message_index,
                    incoming_index_stats_in_range,
                )?,
            };
            return Ok(InteractiveReadResult::from_change(change));
        }

        let candidates: Vec<(MessageNamespace, PeerReadState)> =
            states.iter().map(|(ns, state)| (*ns, *state)).collect();
        for (namespace, state) in candidates {
            let Some(top_index) = top_message_index_by_namespace(namespace)? else {
                continue;
            };
            if top_index > message_index {
                continue;
            }
            let change = match state {
                PeerReadState::IdBased { .. } => {
                    self.apply_incoming_max_read_id(value_box, top_index.id, incoming_stats_in_range, None)?
                }
                PeerReadState::IndexBased { .. } => {
                    self.apply_incoming_max_read_index(value_box, top_index, incoming_index_stats_in_range)?
                }
            };
            return Ok(InteractiveReadResult::from_change(change));
        }

        Ok(InteractiveReadResult::from_change(ReadStateChange::hole()))
    }

    /// Net unread-count change per peer touched by this transaction
    pub fn transaction_unread_count_deltas(&self) -> HashMap<PeerId, i32> {
        let mut deltas = HashMap::new();
        for (peer_id, initial) in &self.updated_initial {
            let initial_count = total_count(initial.values());
            let updated_count = match self.cached.get(peer_id) {
                Some(states) => total_count(states.iter().flat_map(|states| states.values())),
                None => {
                    tracing::error!("Updated peer {} missing from read state cache", peer_id);
                    initial_count
                }
            };
            if initial_count != updated_count {
                deltas.insert(*peer_id, updated_count.saturating_sub(initial_count));
            }
        }
        deltas
    }

    /// Peers whose combined read state changed in this transaction
    pub fn transaction_peer_ids_with_updated_combined_read_states(&self) -> HashSet<PeerId> {
        self.updated_initial.keys().copied().collect()
    }
}

impl Table for MessageHistoryReadStateTable {
    fn before_commit(&mut self, value_box: &mut dyn ValueBox) -> Result<()> {
        for (peer_id, _) in self.updated_initial.drain() {
            let key = Self::key(peer_id);
            match self.cached.get(&peer_id) {
                Some(Some(states)) => value_box.set(self.table, &key, &encode_read_states(states))?,
                _ => value_box.remove(self.table, &key)?,
            }
        }
        Ok(())
    }

    fn discard_uncommitted(&mut self) {
        for (peer_id, _) in self.updated_initial.drain() {
            self.cached.remove(&peer_id);
        }
    }

    fn clear_memory_cache(&mut self) {
        debug_assert!(
            self.updated_initial.is_empty(),
            "read state cache cleared with uncommitted peers"
        );
        if !self.updated_initial.is_empty() {
            tracing::error!(
                "Read state cache cleared with {} uncommitted peers",
                self.updated_initial.len()
            );
            self.updated_initial.clear();
        }
        self.cached.clear();
    }

    fn has_uncommitted(&self) -> bool {
        !self.updated_initial.is_empty()
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn mark_updated(
    updated_initial: &mut HashMap<PeerId, NamespaceStates>,
    peer_id: PeerId,
    states: &NamespaceStates,
) {
    updated_initial
        .entry(peer_id)
        .or_insert_with(|| states.clone());
}

fn group_by_namespace(
    peer_id: PeerId,
    indices: &[MessageIndex],
) -> BTreeMap<MessageNamespace, Vec<MessageIndex>> {
    let mut grouped: BTreeMap<MessageNamespace, Vec<MessageIndex>> = BTreeMap::new();
    for index in indices {
        if index.id.peer_id != peer_id {
            tracing::warn!("Ignoring index {} outside peer {}", index.id, peer_id);
            continue;
        }
        grouped.entry(index.id.namespace).or_default().push(*index);
    }
    grouped
}

fn total_count<'a>(states: impl Iterator<Item = &'a PeerReadState>) -> i32 {
    states.fold(0, |total, state| total.saturating_add(state.count()))
}

/// `count - delta`, clamped at zero; the flag reports clamping
fn subtract_count(count: i32, delta: i32) -> (i32, bool) {
    let result = count.saturating_sub(delta);
    if result < 0 {
        (0, true)
    } else {
        (result, false)
    }
}

fn variant_mismatch(operation: &str, message_id: MessageId) -> Error {
    tracing::error!("{} called on the wrong read state variant for {}", operation, message_id);
    Error::InvariantViolation(format!(
        "{} does not apply to the read state of {}",
        operation, message_id
    ))
}
