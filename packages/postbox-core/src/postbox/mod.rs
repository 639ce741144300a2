//! # Postbox
//!
//! Transactional storage for one account: typed tables over an ordered
//! key-value engine, committed atomically by a single writer.
//!
//! ## Transaction Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        POSTBOX TRANSACTION                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  transaction(body)                                                     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  lock writer ──► engine BEGIN ──► body(&mut Modifier)                  │
//! │                                        │                                │
//! │                     ┌──────── Ok ──────┴────── Err ────────┐           │
//! │                     ▼                                      ▼           │
//! │     unread deltas ──► total unread        engine ROLLBACK             │
//! │     before_commit (read states,           discard dirty entries       │
//! │       history, global ids, metadata)      clear memory caches         │
//! │     engine COMMIT                                                       │
//! │     broadcast TransactionSummary                                        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Readers only ever observe committed state: every access goes through the
//! same writer lock.

mod global_message_ids_table;
mod message_history_table;
mod metadata_table;
mod modifier;
mod read_state;
mod read_state_table;
mod schema;
mod table;
mod types;
mod value_box;

pub use global_message_ids_table::GlobalMessageIdsTable;
pub use message_history_table::{IndexEntry, MessageHistoryTable};
pub use metadata_table::{MetadataKey, MetadataTable};
pub use modifier::Modifier;
pub use read_state::{decode_read_states, encode_read_states, CombinedPeerReadState, PeerReadState};
pub use read_state_table::{
    IncomingIndexStats, IncomingStats, InteractiveReadAction, InteractiveReadResult,
    MessageHistoryReadStateTable, ReadStateChange, TopMessage,
};
pub use table::{CachedTable, Table, TableCodec};
pub use types::{
    message_namespaces, peer_namespaces, Message, MessageId, MessageIndex, MessageNamespace, PeerId,
};
pub use value_box::{SqliteValueBox, ValueBox, ValueBoxKey, ValueBoxTable};

use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use modifier::PendingSummary;

/// Engine table ids
mod table_ids {
    use super::ValueBoxTable;

    pub const METADATA: ValueBoxTable = ValueBoxTable::new(0);
    pub const READ_STATES: ValueBoxTable = ValueBoxTable::new(1);
    pub const MESSAGES: ValueBoxTable = ValueBoxTable::new(2);
    pub const MESSAGE_IDS: ValueBoxTable = ValueBoxTable::new(3);
    pub const HOLES: ValueBoxTable = ValueBoxTable::new(4);
    pub const GLOBAL_MESSAGE_IDS: ValueBoxTable = ValueBoxTable::new(5);
}

/// Default capacity of the transaction summary channel
const SUMMARY_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Postbox configuration
#[derive(Debug, Clone)]
pub struct PostboxConfig {
    /// Database file; `None` keeps everything in memory
    pub path: Option<String>,
    /// Buffered summaries per subscriber before the slowest one lags
    pub summary_channel_capacity: usize,
}

impl Default for PostboxConfig {
    fn default() -> Self {
        Self {
            path: None,
            summary_channel_capacity: SUMMARY_CHANNEL_CAPACITY,
        }
    }
}

impl PostboxConfig {
    /// File-backed configuration
    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }
}

// ============================================================================
// TRANSACTION SUMMARY
// ============================================================================

/// What a committed transaction changed
#[derive(Debug, Clone, Default)]
pub struct TransactionSummary {
    /// Net unread-count change per peer
    pub unread_count_deltas: HashMap<PeerId, i32>,
    /// New read-state snapshots of every peer whose state changed
    pub updated_peer_read_states: HashMap<PeerId, CombinedPeerReadState>,
    /// Peers whose counters raised a hole and need a server fetch
    pub peers_requiring_read_state_sync: HashSet<PeerId>,
    /// Peers whose local read marker must be sent to the server; the flag
    /// asks for a fetch afterwards
    pub peers_to_push_read_state: HashMap<PeerId, bool>,
    /// Incoming messages stored by this transaction
    pub added_incoming_message_ids: Vec<MessageId>,
    /// Total unread count after the commit, when it changed
    pub total_unread_count: Option<i32>,
}

impl TransactionSummary {
    /// Whether the transaction changed nothing observable
    pub fn is_empty(&self) -> bool {
        self.unread_count_deltas.is_empty()
            && self.updated_peer_read_states.is_empty()
            && self.peers_requiring_read_state_sync.is_empty()
            && self.peers_to_push_read_state.is_empty()
            && self.added_incoming_message_ids.is_empty()
    }
}

// ============================================================================
// POSTBOX
// ============================================================================

/// Every table, in commit order
pub(crate) struct Tables {
    pub(crate) read_states: MessageHistoryReadStateTable,
    pub(crate) history: MessageHistoryTable,
    pub(crate) global_ids: GlobalMessageIdsTable,
    pub(crate) metadata: MetadataTable,
}

impl Tables {
    fn new() -> Self {
        Self {
            read_states: MessageHistoryReadStateTable::new(table_ids::READ_STATES),
            history: MessageHistoryTable::new(table_ids::MESSAGES, table_ids::MESSAGE_IDS, table_ids::HOLES),
            global_ids: GlobalMessageIdsTable::new(table_ids::GLOBAL_MESSAGE_IDS),
            metadata: MetadataTable::new(table_ids::METADATA),
        }
    }

    /// Read states feed the unread total kept in metadata, so metadata
    /// commits last.
    fn in_commit_order(&mut self) -> [&mut dyn Table; 4] {
        [
            &mut self.read_states,
            &mut self.history,
            &mut self.global_ids,
            &mut self.metadata,
        ]
    }
}

struct PostboxInner {
    value_box: Box<dyn ValueBox>,
    tables: Tables,
}

impl PostboxInner {
    fn commit(&mut self, pending: PendingSummary) -> Result<TransactionSummary> {
        let unread_count_deltas = self.tables.read_states.transaction_unread_count_deltas();

        let mut updated_peer_read_states = HashMap::new();
        for peer_id in self
            .tables
            .read_states
            .transaction_peer_ids_with_updated_combined_read_states()
        {
            if let Some(state) = self
                .tables
                .read_states
                .get_combined_state(&*self.value_box, peer_id)?
            {
                updated_peer_read_states.insert(peer_id, state);
            }
        }

        let mut total_unread_count = None;
        if !unread_count_deltas.is_empty() {
            let current = self.tables.metadata.total_unread_count(&*self.value_box)?;
            let delta = unread_count_deltas
                .values()
                .fold(0i32, |total, delta| total.saturating_add(*delta));
            let total = current.saturating_add(delta).max(0);
            self.tables.metadata.set_total_unread_count(total)?;
            total_unread_count = Some(total);
        }

        for table in self.tables.in_commit_order() {
            table.before_commit(&mut *self.value_box)?;
        }
        self.value_box.commit()?;

        Ok(TransactionSummary {
            unread_count_deltas,
            updated_peer_read_states,
            peers_requiring_read_state_sync: pending.peers_requiring_read_state_sync,
            peers_to_push_read_state: pending.peers_to_push_read_state,
            added_incoming_message_ids: pending.added_incoming_message_ids,
            total_unread_count,
        })
    }

    fn abort(&mut self) {
        if let Err(e) = self.value_box.rollback() {
            tracing::error!("Rollback failed: {}", e);
        }
        for table in self.tables.in_commit_order() {
            table.discard_uncommitted();
            table.clear_memory_cache();
        }
    }
}

/// Writer lock plus the engine transaction it guards.
///
/// Rolls back on drop while still open, so a panicking body leaves the
/// postbox usable.
struct OpenTransaction<'a> {
    inner: MutexGuard<'a, PostboxInner>,
    open: bool,
}

impl Drop for OpenTransaction<'_> {
    fn drop(&mut self) {
        if self.open {
            tracing::error!("Transaction body panicked, rolling back");
            self.inner.abort();
        }
    }
}

/// Transactional store for one account
///
/// Cloning is cheap; clones share the same database and writer lock.
#[derive(Clone)]
pub struct Postbox {
    inner: Arc<Mutex<PostboxInner>>,
    summary_tx: broadcast::Sender<TransactionSummary>,
}

impl Postbox {
    /// Open or create a postbox
    pub fn open(config: PostboxConfig) -> Result<Self> {
        let value_box = SqliteValueBox::open(config.path.as_deref())?;
        tracing::info!(
            "Postbox opened ({})",
            config.path.as_deref().unwrap_or("in-memory")
        );
        Ok(Self::with_value_box(Box::new(value_box), config.summary_channel_capacity))
    }

    /// Build a postbox over any engine
    pub fn with_value_box(value_box: Box<dyn ValueBox>, summary_channel_capacity: usize) -> Self {
        let (summary_tx, _) = broadcast::channel(summary_channel_capacity.max(1));
        Self {
            inner: Arc::new(Mutex::new(PostboxInner {
                value_box,
                tables: Tables::new(),
            })),
            summary_tx,
        }
    }

    /// Subscribe to summaries of committed transactions
    pub fn subscribe(&self) -> broadcast::Receiver<TransactionSummary> {
        self.summary_tx.subscribe()
    }

    /// Run `body` as one atomic transaction on the calling thread.
    ///
    /// Blocks while another transaction runs. If `body` fails nothing it
    /// did becomes visible.
    pub fn transaction<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Modifier<'_>) -> Result<T>,
    {
        let mut transaction = OpenTransaction {
            inner: self.inner.lock(),
            open: false,
        };
        transaction.inner.value_box.begin()?;
        transaction.open = true;

        let inner = &mut *transaction.inner;
        let mut modifier = Modifier::new(&mut *inner.value_box, &mut inner.tables);
        let result = body(&mut modifier);
        let pending = modifier.into_pending();

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Transaction aborted: {}", e);
                inner.abort();
                transaction.open = false;
                return Err(e);
            }
        };

        let committed = inner.commit(pending);
        if let Err(e) = &committed {
            tracing::error!("Transaction commit failed: {}", e);
            inner.abort();
        }
        transaction.open = false;
        drop(transaction);

        let summary = committed?;
        if !summary.is_empty() {
            // No subscribers is fine.
            let _ = self.summary_tx.send(summary);
        }
        Ok(value)
    }

    /// Run `body` as one atomic transaction on the blocking pool
    pub async fn modify<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Modifier<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let postbox = self.clone();
        match tokio::task::spawn_blocking(move || postbox.transaction(body)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(Error::TransactionAborted("transaction body panicked".into())),
            Err(e) => Err(Error::Internal(format!("Transaction task failed: {}", e))),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn peer() -> PeerId {
        PeerId::new(peer_namespaces::CLOUD_USER, 100)
    }

    fn message(id: i32, incoming: bool) -> Message {
        Message {
            id: MessageId::new(peer(), message_namespaces::CLOUD, id),
            timestamp: id * 10,
            global_id: Some(1000 + id),
            author_id: None,
            incoming,
            text: String::new(),
        }
    }

    fn id_based(read: i32, known: i32, count: i32) -> PeerReadState {
        PeerReadState::IdBased {
            max_incoming_read_id: read,
            max_outgoing_read_id: 0,
            max_known_id: known,
            count,
        }
    }

    fn reset(postbox: &Postbox, state: PeerReadState) {
        postbox
            .transaction(|modifier| {
                let mut namespaces = BTreeMap::new();
                namespaces.insert(message_namespaces::CLOUD, state);
                modifier.reset_incoming_read_states(HashMap::from([(peer(), namespaces)]))
            })
            .unwrap();
    }

    fn count(postbox: &Postbox) -> i32 {
        postbox
            .transaction(|modifier| Ok(modifier.get_combined_peer_read_state(peer())?.map(|s| s.count())))
            .unwrap()
            .unwrap_or(-1)
    }

    #[test]
    fn test_failed_body_leaves_no_trace() {
        let postbox = Postbox::open(PostboxConfig::default()).unwrap();
        reset(&postbox, id_based(0, 0, 0));

        let result: Result<()> = postbox.transaction(|modifier| {
            modifier.add_messages(&[message(1, true)])?;
            modifier.set_state(&42i32)?;
            modifier.add_hole(peer(), message_namespaces::CLOUD, 50, 60)?;
            Err(Error::TransactionAborted("test".into()))
        });
        assert!(matches!(result, Err(Error::TransactionAborted(_))));

        postbox
            .transaction(|modifier| {
                assert_eq!(modifier.get_message(message(1, true).id)?, None);
                assert_eq!(modifier.get_state::<i32>()?, None);
                assert_eq!(modifier.total_unread_count()?, 0);
                Ok(())
            })
            .unwrap();
        assert_eq!(count(&postbox), 0);
    }

    #[test]
    fn test_panicking_body_rolls_back() {
        let postbox = Postbox::open(PostboxConfig::default()).unwrap();
        reset(&postbox, id_based(0, 0, 0));

        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = postbox.transaction(|modifier| -> Result<()> {
                modifier.set_state(&1i32)?;
                modifier.add_messages(&[message(1, true)])?;
                panic!("body failed");
            });
        }));
        assert!(panicked.is_err());

        postbox.transaction(|modifier| modifier.set_state(&2i32)).unwrap();
        postbox
            .transaction(|modifier| {
                assert_eq!(modifier.get_state::<i32>()?, Some(2));
                assert_eq!(modifier.get_message(message(1, true).id)?, None);
                Ok(())
            })
            .unwrap();
        assert_eq!(count(&postbox), 0);
    }

    #[tokio::test]
    async fn test_modify_survives_panicking_body() {
        let postbox = Postbox::open(PostboxConfig::default()).unwrap();

        let result = postbox
            .modify(|modifier| -> Result<()> {
                modifier.set_state(&1i32)?;
                panic!("body failed");
            })
            .await;
        assert!(matches!(result, Err(Error::TransactionAborted(_))));

        postbox.modify(|modifier| modifier.set_state(&3i32)).await.unwrap();
        let stored = postbox.modify(|modifier| modifier.get_state::<i32>()).await.unwrap();
        assert_eq!(stored, Some(3));
    }

    #[test]
    fn test_incoming_messages_and_reads_update_counts() {
        let postbox = Postbox::open(PostboxConfig::default()).unwrap();
        let mut summaries = postbox.subscribe();
        reset(&postbox, id_based(0, 0, 0));
        let first = summaries.try_recv().unwrap();
        assert!(first.updated_peer_read_states.contains_key(&peer()));

        postbox
            .transaction(|modifier| {
                modifier.add_messages(&[message(1, true), message(2, false), message(3, true)])?;
                Ok(())
            })
            .unwrap();
        assert_eq!(count(&postbox), 2);
        let summary = summaries.try_recv().unwrap();
        assert_eq!(summary.unread_count_deltas.get(&peer()), Some(&2));
        assert_eq!(summary.added_incoming_message_ids.len(), 2);
        assert_eq!(summary.total_unread_count, Some(2));

        postbox
            .transaction(|modifier| modifier.apply_incoming_read_max_id(message(1, true).id))
            .unwrap();
        assert_eq!(count(&postbox), 1);

        postbox
            .transaction(|modifier| modifier.apply_incoming_read_max_id(message(3, true).id))
            .unwrap();
        assert_eq!(count(&postbox), 0);
        postbox
            .transaction(|modifier| {
                assert_eq!(modifier.total_unread_count()?, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_delete_by_global_id_releases_unread() {
        let postbox = Postbox::open(PostboxConfig::default()).unwrap();
        reset(&postbox, id_based(0, 0, 0));
        postbox
            .transaction(|modifier| modifier.add_messages(&[message(1, true), message(2, true)]).map(|_| ()))
            .unwrap();
        assert_eq!(count(&postbox), 2);

        postbox
            .transaction(|modifier| modifier.delete_messages_with_global_ids(&[1002, 9999]))
            .unwrap();
        assert_eq!(count(&postbox), 1);
        postbox
            .transaction(|modifier| {
                assert_eq!(modifier.get_message(message(2, true).id)?, None);
                assert!(modifier.get_message(message(1, true).id)?.is_some());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_messages_without_read_state_request_sync() {
        let postbox = Postbox::open(PostboxConfig::default()).unwrap();
        let mut summaries = postbox.subscribe();
        postbox
            .transaction(|modifier| modifier.add_messages(&[message(1, true)]).map(|_| ()))
            .unwrap();
        let summary = summaries.try_recv().unwrap();
        assert!(summary.peers_requiring_read_state_sync.contains(&peer()));
    }

    #[test]
    fn test_interactive_read_queues_push() {
        let postbox = Postbox::open(PostboxConfig::default()).unwrap();
        reset(&postbox, id_based(0, 0, 0));
        postbox
            .transaction(|modifier| modifier.add_messages(&[message(1, true), message(2, true)]).map(|_| ()))
            .unwrap();

        let mut summaries = postbox.subscribe();
        postbox
            .transaction(|modifier| modifier.apply_interactive_read_max_index(message(2, true).index()).map(|_| ()))
            .unwrap();
        let summary = summaries.try_recv().unwrap();
        assert_eq!(summary.peers_to_push_read_state.get(&peer()), Some(&false));
        assert_eq!(count(&postbox), 0);
    }

    #[test]
    fn test_file_backed_postbox_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account.db");
        let config = PostboxConfig::with_path(path.to_str().unwrap());

        {
            let postbox = Postbox::open(config.clone()).unwrap();
            reset(&postbox, id_based(0, 0, 0));
            postbox
                .transaction(|modifier| {
                    modifier.add_messages(&[message(1, true)])?;
                    modifier.set_state(&7i32)
                })
                .unwrap();
        }

        let postbox = Postbox::open(config).unwrap();
        assert_eq!(count(&postbox), 1);
        postbox
            .transaction(|modifier| {
                assert_eq!(modifier.get_state::<i32>()?, Some(7));
                assert_eq!(modifier.total_unread_count()?, 1);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_modify_runs_off_the_async_executor() {
        let postbox = Postbox::open(PostboxConfig::default()).unwrap();
        reset(&postbox, id_based(5, 10, 3));

        let count = postbox
            .modify(|modifier| {
                modifier.add_messages(&[message(11, true)])?;
                Ok(modifier.get_combined_peer_read_state(peer())?.map(|s| s.count()))
            })
            .await
            .unwrap();
        assert_eq!(count, Some(4));
    }
}
