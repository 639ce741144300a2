//! # Account State Manager
//!
//! Serializes every state-changing step of update synchronization.
//!
//! ## Actor Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     ACCOUNT STATE MANAGER                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────┐                    ┌─────────────────────────┐    │
//! │  │  Command Rx     │───────────────────►│                         │    │
//! │  │  (handles)      │                    │                         │    │
//! │  └─────────────────┘                    │      Manager Loop       │    │
//! │  ┌─────────────────┐                    │                         │    │
//! │  │  Outcome Rx     │───────────────────►│  select! (biased) {     │    │
//! │  │  (head task)    │                    │    command              │    │
//! │  └─────────────────┘                    │    head outcome         │    │
//! │  ┌─────────────────┐                    │    collect timer        │    │
//! │  │  Collect Timer  │───────────────────►│  }                      │    │
//! │  └─────────────────┘                    └───────────┬─────────────┘    │
//! │                                                      │                  │
//! │                          ┌───────────────────────────┼──────────┐       │
//! │                          ▼                           ▼          ▼       │
//! │                   OperationQueue            AccountEvent    is_updating │
//! │                   (head runs as a task)     (broadcast)     (watch)     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Exactly one queued operation runs at a time. Its task reports back with
//! a token; after a reset, results carrying an old token are ignored.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};

use super::events::AccountEvent;
use super::final_state::{
    final_state_with_difference, AccountFinalState, AccountFinalStateEvents, AccountReplayedFinalState,
};
use super::network::{retry_request, AccountNetwork, RetryBackoff};
use super::operations::{CustomWork, Operation, OperationKind, OperationQueue, PollSubscriber};
use super::replay::{apply_state_reset, replay_final_state, replay_update_groups};
use super::types::{AuthorizedAccountState, Difference, MediaId, UpdateGroup, Updates, Webpage};
use super::AccountStateManagerConfig;
use crate::error::{Error, Result};
use crate::postbox::{Message, MessageId, Postbox};

// ============================================================================
// COMMANDS
// ============================================================================

/// Requests sent from handles to the manager loop
enum ManagerCommand {
    Reset,
    AddUpdateGroups(Vec<UpdateGroup>),
    AddReplay {
        final_state: AccountFinalState,
        completion: oneshot::Sender<bool>,
    },
    AddCustomOperation(CustomWork),
    AddPollCompletion {
        subscriber_id: u64,
        reply: oneshot::Sender<Vec<MessageId>>,
    },
    RemovePollCompletion {
        subscriber_id: u64,
    },
    SubscribeWebpage {
        webpage_id: MediaId,
        subscriber_id: u64,
        updates: mpsc::UnboundedSender<Webpage>,
    },
    UnsubscribeWebpage {
        webpage_id: MediaId,
        subscriber_id: u64,
    },
    PendingOperations(oneshot::Sender<Vec<OperationKind>>),
    Shutdown,
}

impl fmt::Debug for ManagerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerCommand::Reset => write!(f, "Reset"),
            ManagerCommand::AddUpdateGroups(groups) => write!(f, "AddUpdateGroups({})", groups.len()),
            ManagerCommand::AddReplay { final_state, .. } => {
                write!(f, "AddReplay(pts {})", final_state.state.pts)
            }
            ManagerCommand::AddCustomOperation(_) => write!(f, "AddCustomOperation"),
            ManagerCommand::AddPollCompletion { subscriber_id, .. } => {
                write!(f, "AddPollCompletion({})", subscriber_id)
            }
            ManagerCommand::RemovePollCompletion { subscriber_id } => {
                write!(f, "RemovePollCompletion({})", subscriber_id)
            }
            ManagerCommand::SubscribeWebpage {
                webpage_id,
                subscriber_id,
                ..
            } => write!(f, "SubscribeWebpage({:?}, {})", webpage_id, subscriber_id),
            ManagerCommand::UnsubscribeWebpage {
                webpage_id,
                subscriber_id,
            } => write!(f, "UnsubscribeWebpage({:?}, {})", webpage_id, subscriber_id),
            ManagerCommand::PendingOperations(_) => write!(f, "PendingOperations"),
            ManagerCommand::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Commands handled in a row before a due collect timer gets its turn
const COMMAND_BURST: usize = 32;

// ============================================================================
// HANDLE
// ============================================================================

/// Handle to a running account state manager.
///
/// Cloning is cheap. The manager stops once [`shutdown`](Self::shutdown) is
/// called or every handle and subscription is dropped.
#[derive(Clone)]
pub struct AccountStateManager {
    command_tx: mpsc::UnboundedSender<ManagerCommand>,
    event_tx: broadcast::Sender<AccountEvent>,
    is_updating: watch::Receiver<bool>,
    next_subscriber_id: Arc<AtomicU64>,
}

impl AccountStateManager {
    /// Spawn the manager loop on the current tokio runtime
    pub fn new<N: AccountNetwork>(postbox: Postbox, network: Arc<N>, config: AccountStateManagerConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let (is_updating_tx, is_updating) = watch::channel(false);

        let manager = ManagerLoop::new(postbox, network, config, event_tx.clone(), is_updating_tx);
        tokio::spawn(run_manager_loop(command_rx, manager));

        Self {
            command_tx,
            event_tx,
            is_updating,
            next_subscriber_id: Arc::new(AtomicU64::new(0)),
        }
    }

    fn send(&self, command: ManagerCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| Error::ShutdownInProgress)
    }

    fn take_subscriber_id(&self) -> u64 {
        self.next_subscriber_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Drop pending work and poll the difference from the stored cursor.
    ///
    /// Poll completion waiters and pending replays survive.
    pub fn reset(&self) -> Result<()> {
        self.send(ManagerCommand::Reset)
    }

    /// Queue a pushed update batch
    pub fn add_updates(&self, updates: Updates) -> Result<()> {
        self.add_update_groups(updates.into_groups())
    }

    /// Queue pushed update groups
    pub fn add_update_groups(&self, groups: Vec<UpdateGroup>) -> Result<()> {
        if groups.is_empty() {
            return Ok(());
        }
        self.send(ManagerCommand::AddUpdateGroups(groups))
    }

    /// Apply a final state built elsewhere, in order with queued work.
    ///
    /// Resolves to whether it was applied; `false` means the stored cursor
    /// had moved past its base.
    pub async fn add_replay_asynchronously_built_final_state(&self, final_state: AccountFinalState) -> Result<bool> {
        let (completion, rx) = oneshot::channel();
        self.send(ManagerCommand::AddReplay { final_state, completion })?;
        rx.await.map_err(|_| Error::ShutdownInProgress)
    }

    /// Run `work` in the operation queue, never concurrently with replays.
    ///
    /// Fails with [`Error::OperationCancelled`] if a reset drops it first.
    pub async fn add_custom_operation<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let work: CustomWork = Box::pin(async move {
            let _ = tx.send(work.await);
        });
        self.send(ManagerCommand::AddCustomOperation(work))?;
        rx.await
            .map_err(|_| Error::OperationCancelled("custom operation dropped".into()))
    }

    /// Resolves once every update known at this point has been applied.
    ///
    /// Yields the incoming messages stored in the meantime. Dropping the
    /// future deregisters it.
    pub fn poll_state_update_completion(&self) -> PollStateUpdateCompletion {
        let subscriber_id = self.take_subscriber_id();
        let (reply, rx) = oneshot::channel();
        // On failure the reply sender is dropped and the future resolves to an error.
        let _ = self.send(ManagerCommand::AddPollCompletion { subscriber_id, reply });
        PollStateUpdateCompletion {
            subscriber_id,
            reply: rx,
            command_tx: self.command_tx.clone(),
            done: false,
        }
    }

    /// Stream of updates for one link preview
    pub fn updated_webpage(&self, webpage_id: MediaId) -> WebpageSubscription {
        let subscriber_id = self.take_subscriber_id();
        let (updates, rx) = mpsc::unbounded_channel();
        let _ = self.send(ManagerCommand::SubscribeWebpage {
            webpage_id,
            subscriber_id,
            updates,
        });
        WebpageSubscription {
            webpage_id,
            subscriber_id,
            updates: rx,
            command_tx: self.command_tx.clone(),
        }
    }

    /// Subscribe to delivered side effects
    pub fn subscribe(&self) -> broadcast::Receiver<AccountEvent> {
        self.event_tx.subscribe()
    }

    /// Whether a difference poll is in progress
    pub fn is_updating(&self) -> watch::Receiver<bool> {
        self.is_updating.clone()
    }

    /// Snapshot of the queue, head first
    pub async fn pending_operations(&self) -> Result<Vec<OperationKind>> {
        let (tx, rx) = oneshot::channel();
        self.send(ManagerCommand::PendingOperations(tx))?;
        rx.await.map_err(|_| Error::ShutdownInProgress)
    }

    /// Stop the manager, cancelling the running operation
    pub fn shutdown(&self) -> Result<()> {
        self.send(ManagerCommand::Shutdown)
    }
}

/// Future returned by [`AccountStateManager::poll_state_update_completion`]
pub struct PollStateUpdateCompletion {
    subscriber_id: u64,
    reply: oneshot::Receiver<Vec<MessageId>>,
    command_tx: mpsc::UnboundedSender<ManagerCommand>,
    done: bool,
}

impl Future for PollStateUpdateCompletion {
    type Output = Result<Vec<MessageId>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = ready!(Pin::new(&mut self.reply).poll(cx));
        self.done = true;
        Poll::Ready(result.map_err(|_| Error::ShutdownInProgress))
    }
}

impl Drop for PollStateUpdateCompletion {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.command_tx.send(ManagerCommand::RemovePollCompletion {
                subscriber_id: self.subscriber_id,
            });
        }
    }
}

/// Stream returned by [`AccountStateManager::updated_webpage`]
pub struct WebpageSubscription {
    webpage_id: MediaId,
    subscriber_id: u64,
    updates: mpsc::UnboundedReceiver<Webpage>,
    command_tx: mpsc::UnboundedSender<ManagerCommand>,
}

impl Stream for WebpageSubscription {
    type Item = Webpage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Webpage>> {
        self.updates.poll_recv(cx)
    }
}

impl Drop for WebpageSubscription {
    fn drop(&mut self) {
        let _ = self.command_tx.send(ManagerCommand::UnsubscribeWebpage {
            webpage_id: self.webpage_id,
            subscriber_id: self.subscriber_id,
        });
    }
}

// ============================================================================
// MANAGER LOOP
// ============================================================================

/// Result of a difference poll task
enum PollDifferenceOutcome {
    /// No authorized account; nothing to poll
    Unauthorized,
    /// A difference was replayed
    Applied {
        replayed: AccountReplayedFinalState,
        slice: bool,
    },
    /// Nothing replayed; poll again from the stored cursor
    Retry { state_reset: bool },
}

/// Result reported by the task running the head operation
enum Outcome {
    PollDifference(PollDifferenceOutcome),
    ProcessUpdateGroups(Result<Option<AccountReplayedFinalState>>),
    Custom,
    PollCompletion,
    ProcessEvents(Result<Vec<Message>>),
    Replay(Result<Option<AccountReplayedFinalState>>),
}

struct InFlight {
    token: u64,
    handle: JoinHandle<()>,
}

/// What starting the head operation requires, copied out of the queue
enum Start {
    Timer(Duration),
    PollDifference,
    ProcessUpdateGroups(Vec<UpdateGroup>),
    Custom(Option<CustomWork>),
    PollCompletion,
    ProcessEvents(AccountFinalStateEvents),
    Replay(AccountFinalState),
}

struct ManagerLoop<N: AccountNetwork> {
    postbox: Postbox,
    network: Arc<N>,
    config: AccountStateManagerConfig,
    queue: OperationQueue,
    event_tx: broadcast::Sender<AccountEvent>,
    is_updating_tx: watch::Sender<bool>,
    /// Armed while a collect operation is at the head
    timer: Option<Pin<Box<Sleep>>>,
    in_flight: Option<InFlight>,
    /// A reset arrived while the running head was committing
    head_superseded: bool,
    /// Commands handled since the collect timer was last checked
    commands_since_timer: usize,
    next_token: u64,
    outcome_tx: mpsc::UnboundedSender<(u64, Outcome)>,
    outcome_rx: mpsc::UnboundedReceiver<(u64, Outcome)>,
    webpage_subscribers: HashMap<MediaId, HashMap<u64, mpsc::UnboundedSender<Webpage>>>,
}

/// Drive the manager until shutdown or until every handle is gone
async fn run_manager_loop<N: AccountNetwork>(
    mut command_rx: mpsc::UnboundedReceiver<ManagerCommand>,
    mut manager: ManagerLoop<N>,
) {
    tracing::info!("Account state manager starting");

    loop {
        tokio::select! {
            biased;

            command = command_rx.recv() => {
                match command {
                    Some(cmd) => {
                        if !manager.handle_command(cmd) {
                            tracing::info!("Shutdown command received, exiting account state manager");
                            break;
                        }
                        manager.check_timer_after_command();
                    }
                    None => {
                        tracing::info!("Command channel closed, exiting account state manager");
                        break;
                    }
                }
            }

            Some((token, outcome)) = manager.outcome_rx.recv() => {
                manager.handle_outcome(token, outcome);
            }

            _ = wait_timer(&mut manager.timer) => {
                manager.handle_timer();
            }
        }
    }

    manager.cancel_in_flight();
    tracing::info!("Account state manager stopped");
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

impl<N: AccountNetwork> ManagerLoop<N> {
    fn new(
        postbox: Postbox,
        network: Arc<N>,
        config: AccountStateManagerConfig,
        event_tx: broadcast::Sender<AccountEvent>,
        is_updating_tx: watch::Sender<bool>,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            postbox,
            network,
            config,
            queue: OperationQueue::new(),
            event_tx,
            is_updating_tx,
            timer: None,
            in_flight: None,
            head_superseded: false,
            commands_since_timer: 0,
            next_token: 0,
            outcome_tx,
            outcome_rx,
            webpage_subscribers: HashMap::new(),
        }
    }

    /// Handle a command from a handle
    ///
    /// Returns `false` if the loop should stop.
    fn handle_command(&mut self, command: ManagerCommand) -> bool {
        tracing::debug!("Handling command: {:?}", command);

        match command {
            ManagerCommand::Reset => self.reset(),
            ManagerCommand::AddUpdateGroups(groups) => {
                if self.queue.add_update_groups(groups) {
                    self.start_first_operation();
                }
            }
            ManagerCommand::AddReplay { final_state, completion } => {
                let was_empty = self.queue.push_back(Operation::ReplayAsynchronouslyBuiltFinalState {
                    final_state,
                    completion: Some(completion),
                });
                if was_empty {
                    self.start_first_operation();
                }
            }
            ManagerCommand::AddCustomOperation(work) => {
                let id = self.queue.take_id();
                if self.queue.push_back(Operation::Custom { id, work: Some(work) }) {
                    self.start_first_operation();
                }
            }
            ManagerCommand::AddPollCompletion { subscriber_id, reply } => {
                let subscriber = PollSubscriber {
                    id: subscriber_id,
                    reply,
                };
                if self.queue.add_poll_completion(subscriber) {
                    self.start_first_operation();
                }
            }
            ManagerCommand::RemovePollCompletion { subscriber_id } => {
                self.queue.remove_poll_completion(subscriber_id);
            }
            ManagerCommand::SubscribeWebpage {
                webpage_id,
                subscriber_id,
                updates,
            } => {
                self.webpage_subscribers
                    .entry(webpage_id)
                    .or_default()
                    .insert(subscriber_id, updates);
            }
            ManagerCommand::UnsubscribeWebpage {
                webpage_id,
                subscriber_id,
            } => {
                if let Some(subscribers) = self.webpage_subscribers.get_mut(&webpage_id) {
                    subscribers.remove(&subscriber_id);
                    if subscribers.is_empty() {
                        self.webpage_subscribers.remove(&webpage_id);
                    }
                }
            }
            ManagerCommand::PendingOperations(reply) => {
                let _ = reply.send(self.queue.kinds());
            }
            ManagerCommand::Shutdown => return false,
        }
        true
    }

    fn reset(&mut self) {
        tracing::info!("Resetting account state manager");
        self.timer = None;
        let poll = Operation::PollDifference {
            events: AccountFinalStateEvents::default(),
        };

        // The running transaction commits whether or not its task is aborted,
        // so its result is still delivered and only the rest is replaced.
        let head_commits = self.in_flight.is_some() && self.queue.front().map_or(false, Operation::runs_transactions);
        if head_commits {
            tracing::debug!("Reset waits for running {:?}", self.queue.front());
            self.queue.replace_operations_behind_head(poll);
            self.head_superseded = true;
            return;
        }

        self.cancel_in_flight();
        self.queue.replace_operations(poll);
        self.start_first_operation();
    }

    fn cancel_in_flight(&mut self) {
        self.head_superseded = false;
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.handle.abort();
        }
    }

    /// Fire a due collect timer during a burst of commands.
    ///
    /// Commands win the biased select, so without this a steady stream of
    /// pushes would hold a finished collect back.
    fn check_timer_after_command(&mut self) {
        self.commands_since_timer += 1;
        if self.commands_since_timer < COMMAND_BURST {
            return;
        }
        self.commands_since_timer = 0;
        let due = self
            .timer
            .as_ref()
            .map_or(false, |sleep| sleep.deadline() <= Instant::now());
        if due {
            self.handle_timer();
        }
    }

    fn emit(&self, event: AccountEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    fn set_updating(&self, updating: bool) {
        self.is_updating_tx.send_if_modified(|current| {
            if *current == updating {
                return false;
            }
            *current = updating;
            true
        });
    }

    fn spawn_operation<F>(&mut self, operation: F)
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        self.next_token += 1;
        let token = self.next_token;
        let outcome_tx = self.outcome_tx.clone();
        let handle = tokio::spawn(async move {
            let outcome = operation.await;
            let _ = outcome_tx.send((token, outcome));
        });
        self.in_flight = Some(InFlight { token, handle });
    }

    // ========================================================================
    // STARTING THE HEAD
    // ========================================================================

    fn start_first_operation(&mut self) {
        loop {
            if self.in_flight.is_some() {
                return;
            }

            let start = match self.queue.front_mut() {
                None => {
                    self.timer = None;
                    return;
                }
                Some(Operation::CollectUpdateGroups { timeout, .. }) => Start::Timer(*timeout),
                Some(Operation::PollDifference { .. }) => Start::PollDifference,
                Some(Operation::ProcessUpdateGroups { groups }) => Start::ProcessUpdateGroups(groups.clone()),
                Some(Operation::Custom { work, .. }) => Start::Custom(work.take()),
                Some(Operation::PollCompletion { .. }) => Start::PollCompletion,
                Some(Operation::ProcessEvents { events, .. }) => Start::ProcessEvents(events.clone()),
                Some(Operation::ReplayAsynchronouslyBuiltFinalState { final_state, .. }) => {
                    Start::Replay(final_state.clone())
                }
            };

            if let Start::Timer(timeout) = start {
                tracing::trace!("Collecting update groups for {:?}", timeout);
                self.timer = Some(Box::pin(tokio::time::sleep(timeout)));
                return;
            }
            self.timer = None;

            match start {
                Start::Timer(_) => {}
                Start::PollDifference => {
                    self.set_updating(true);
                    let postbox = self.postbox.clone();
                    let network = self.network.clone();
                    let backoff = self.config.retry;
                    self.spawn_operation(async move {
                        Outcome::PollDifference(poll_difference(postbox, network, backoff).await)
                    });
                }
                Start::ProcessUpdateGroups(groups) => {
                    let postbox = self.postbox.clone();
                    self.spawn_operation(async move {
                        Outcome::ProcessUpdateGroups(
                            postbox
                                .modify(move |modifier| replay_update_groups(modifier, &groups))
                                .await,
                        )
                    });
                }
                Start::Custom(work) => {
                    self.spawn_operation(async move {
                        if let Some(work) = work {
                            work.await;
                        }
                        Outcome::Custom
                    });
                }
                Start::PollCompletion => {
                    if self.queue.len() > 1 {
                        if let Some(Operation::PollCompletion {
                            message_ids,
                            subscribers,
                            ..
                        }) = self.queue.pop_front()
                        {
                            self.queue.postpone_poll_completion(message_ids, subscribers);
                        }
                        continue;
                    }
                    let network = self.network.clone();
                    self.spawn_operation(async move {
                        if let Err(e) = network.ping().await {
                            tracing::warn!("Poll completion ping failed: {}", e);
                        }
                        Outcome::PollCompletion
                    });
                }
                Start::ProcessEvents(events) => {
                    self.deliver_events(&events);
                    let postbox = self.postbox.clone();
                    let message_ids = events.added_incoming_message_ids;
                    self.spawn_operation(async move {
                        Outcome::ProcessEvents(notification_messages(postbox, message_ids).await)
                    });
                }
                Start::Replay(final_state) => {
                    let postbox = self.postbox.clone();
                    self.spawn_operation(async move {
                        Outcome::Replay(
                            postbox
                                .modify(move |modifier| replay_final_state(modifier, final_state))
                                .await,
                        )
                    });
                }
            }
            return;
        }
    }

    fn deliver_events(&self, events: &AccountFinalStateEvents) {
        if !events.typing_activities.is_empty() {
            self.emit(AccountEvent::TypingActivities(events.typing_activities.clone()));
        }
        if !events.updated_webpages.is_empty() {
            for webpage in &events.updated_webpages {
                if let Some(subscribers) = self.webpage_subscribers.get(&webpage.id) {
                    for updates in subscribers.values() {
                        let _ = updates.send(webpage.clone());
                    }
                }
            }
            self.emit(AccountEvent::WebpagesUpdated(events.updated_webpages.clone()));
        }
        if !events.call_updates.is_empty() {
            self.emit(AccountEvent::CallUpdates(events.call_updates.clone()));
        }
        if !events.read_state_sync_peers.is_empty() {
            self.emit(AccountEvent::ReadStateSyncRequired(events.read_state_sync_peers.clone()));
        }
    }

    // ========================================================================
    // COMPLETIONS
    // ========================================================================

    fn handle_outcome(&mut self, token: u64, outcome: Outcome) {
        match &self.in_flight {
            Some(in_flight) if in_flight.token == token => {}
            _ => {
                tracing::debug!("Ignoring stale operation result {}", token);
                return;
            }
        }
        self.in_flight = None;
        let superseded = std::mem::take(&mut self.head_superseded);

        match (self.queue.pop_front(), outcome) {
            (Some(Operation::PollDifference { events }), Outcome::PollDifference(result)) => {
                self.finish_poll_difference(events, result)
            }
            (Some(Operation::ProcessUpdateGroups { groups }), Outcome::ProcessUpdateGroups(result)) => {
                self.finish_process_update_groups(groups, result, superseded)
            }
            (Some(Operation::Custom { .. }), Outcome::Custom) => {}
            (
                Some(Operation::PollCompletion {
                    message_ids,
                    subscribers,
                    ..
                }),
                Outcome::PollCompletion,
            ) => {
                if self.queue.is_empty() {
                    tracing::debug!("Poll completion reached {} subscribers", subscribers.len());
                    for subscriber in subscribers {
                        let _ = subscriber.reply.send(message_ids.clone());
                    }
                } else {
                    self.queue.postpone_poll_completion(message_ids, subscribers);
                }
            }
            (Some(Operation::ProcessEvents { events, .. }), Outcome::ProcessEvents(result)) => {
                match result {
                    Ok(messages) if !messages.is_empty() => {
                        self.emit(AccountEvent::NotificationMessages(messages))
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Failed to load notification messages: {}", e),
                }
                self.queue
                    .merge_incoming_message_ids(&events.added_incoming_message_ids);
            }
            (
                Some(Operation::ReplayAsynchronouslyBuiltFinalState { completion, .. }),
                Outcome::Replay(result),
            ) => {
                let applied = match result {
                    Ok(Some(replayed)) => {
                        self.queue.insert_process_events(replayed.events());
                        true
                    }
                    Ok(None) => {
                        tracing::debug!("Asynchronously built final state was stale");
                        false
                    }
                    Err(e) => {
                        tracing::warn!("Failed to replay final state: {}", e);
                        false
                    }
                };
                if let Some(completion) = completion {
                    let _ = completion.send(applied);
                }
            }
            (head, _) => {
                tracing::error!("Operation result does not match queue head {:?}", head);
                if let Some(head) = head {
                    self.queue.push_front(head);
                }
            }
        }

        self.start_first_operation();
    }

    fn finish_poll_difference(&mut self, events: AccountFinalStateEvents, outcome: PollDifferenceOutcome) {
        match outcome {
            PollDifferenceOutcome::Applied { replayed, slice } => {
                let events = events.union(replayed.events());
                if slice {
                    self.queue.push_front(Operation::PollDifference { events });
                } else {
                    self.queue.insert_process_events(events);
                    self.set_updating(false);
                }
            }
            PollDifferenceOutcome::Retry { state_reset } => {
                if state_reset {
                    self.emit(AccountEvent::StateReset);
                }
                self.queue.replace_operations(Operation::PollDifference {
                    events: AccountFinalStateEvents::default(),
                });
                self.queue.insert_process_events(events);
            }
            PollDifferenceOutcome::Unauthorized => {
                tracing::warn!("No authorized account state, skipping difference poll");
                self.queue.insert_process_events(events);
                self.set_updating(false);
            }
        }
    }

    fn finish_process_update_groups(
        &mut self,
        groups: Vec<UpdateGroup>,
        result: Result<Option<AccountReplayedFinalState>>,
        superseded: bool,
    ) {
        match result {
            Ok(Some(replayed)) if !replayed.state.should_poll => {
                // After a reset the queued difference poll fills the gap.
                if replayed.state.incomplete && !superseded {
                    tracing::debug!(
                        "Update groups incomplete, waiting {:?} for the gap to fill",
                        self.config.incomplete_update_timeout
                    );
                    self.queue.push_front(Operation::CollectUpdateGroups {
                        groups,
                        timeout: self.config.incomplete_update_timeout,
                    });
                }
                self.queue.insert_process_events(replayed.events());
            }
            Ok(_) => {
                tracing::debug!("Update groups require a difference poll");
                self.queue.replace_operations(Operation::PollDifference {
                    events: AccountFinalStateEvents::default(),
                });
            }
            Err(e) => {
                tracing::warn!("Failed to process update groups: {}", e);
                self.queue.replace_operations(Operation::PollDifference {
                    events: AccountFinalStateEvents::default(),
                });
            }
        }
    }

    fn handle_timer(&mut self) {
        self.timer = None;
        self.commands_since_timer = 0;
        let timeout = match self.queue.front() {
            Some(Operation::CollectUpdateGroups { timeout, .. }) => *timeout,
            _ => return,
        };

        if timeout.is_zero() {
            if let Some(Operation::CollectUpdateGroups { groups, .. }) = self.queue.pop_front() {
                self.queue
                    .push_front(Operation::ProcessUpdateGroups { groups });
            }
        } else {
            tracing::warn!("Timeout while waiting for updates, polling difference");
            self.queue.replace_operations(Operation::PollDifference {
                events: AccountFinalStateEvents::default(),
            });
        }
        self.start_first_operation();
    }
}

// ============================================================================
// OPERATION TASKS
// ============================================================================

async fn poll_difference<N: AccountNetwork>(
    postbox: Postbox,
    network: Arc<N>,
    backoff: RetryBackoff,
) -> PollDifferenceOutcome {
    let stored: Option<AuthorizedAccountState> =
        retry_request(backoff, || postbox.modify(|modifier| modifier.get_state())).await;
    let Some(authorized) = stored else {
        return PollDifferenceOutcome::Unauthorized;
    };

    let Some(state) = authorized.state else {
        let state = retry_request(backoff, || network.get_state()).await;
        tracing::info!("Fetched initial account state at pts {}", state.pts);
        let updated = AuthorizedAccountState {
            state: Some(state),
            ..authorized
        };
        retry_request(backoff, || postbox.modify(move |modifier| modifier.set_state(&updated))).await;
        return PollDifferenceOutcome::Retry { state_reset: false };
    };

    let difference = retry_request(backoff, || network.get_difference(state)).await;
    if let Difference::TooLong { pts } = difference {
        tracing::warn!("Difference too long at pts {}, resetting account state", pts);
        let snapshot = retry_request(backoff, || network.fetch_state_reset()).await;
        retry_request(backoff, || {
            let snapshot = snapshot.clone();
            postbox.modify(move |modifier| apply_state_reset(modifier, snapshot))
        })
        .await;
        return PollDifferenceOutcome::Retry { state_reset: true };
    }

    let slice = difference.is_slice();
    let final_state = final_state_with_difference(state, &difference);
    let replayed = retry_request(backoff, || {
        let final_state = final_state.clone();
        postbox.modify(move |modifier| replay_final_state(modifier, final_state))
    })
    .await;

    match replayed {
        Some(replayed) => PollDifferenceOutcome::Applied { replayed, slice },
        None => {
            tracing::debug!("Difference built on a stale cursor, polling again");
            PollDifferenceOutcome::Retry { state_reset: false }
        }
    }
}

/// Incoming messages among `message_ids` that are still unread
async fn notification_messages(postbox: Postbox, message_ids: Vec<MessageId>) -> Result<Vec<Message>> {
    if message_ids.is_empty() {
        return Ok(Vec::new());
    }
    postbox
        .modify(move |modifier| {
            let mut messages = Vec::new();
            for message_id in message_ids {
                let Some(message) = modifier.get_message(message_id)? else {
                    continue;
                };
                if !message.incoming {
                    continue;
                }
                let read = modifier
                    .get_combined_peer_read_state(message_id.peer_id)?
                    .map_or(false, |state| state.is_incoming_message_index_read(&message.index()));
                if !read {
                    messages.push(message);
                }
            }
            Ok(messages)
        })
        .await
}

// ============================================================================
// TESTS
// ============================================================================
