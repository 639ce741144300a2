//! # Operation Queue
//!
//! The pending work of the account state manager. Only the head operation
//! ever runs; every rule below rewrites the queue around it.
//!
//! ```text
//! add_update_groups     tail collect(timeout 0)   merge into it
//!                       tail collect(waiting)     becomes process(all groups)
//!                       anything else / empty     append collect(groups, 0)
//! replace_operations    keep poll completions (merged) and replays, drop the rest
//! insert_process_events ahead of everything except earlier process events
//! poll completion       postponed to the back until it is the only operation
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::oneshot;

use super::final_state::{AccountFinalState, AccountFinalStateEvents};
use super::types::UpdateGroup;
use crate::postbox::MessageId;

/// Arbitrary work serialized with state replay
pub type CustomWork = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Caller waiting for a poll completion
pub(crate) struct PollSubscriber {
    pub(crate) id: u64,
    pub(crate) reply: oneshot::Sender<Vec<MessageId>>,
}

/// One unit of queued work
pub(crate) enum Operation {
    PollDifference {
        events: AccountFinalStateEvents,
    },
    CollectUpdateGroups {
        groups: Vec<UpdateGroup>,
        timeout: Duration,
    },
    ProcessUpdateGroups {
        groups: Vec<UpdateGroup>,
    },
    Custom {
        id: u64,
        /// Taken when the operation starts
        work: Option<CustomWork>,
    },
    PollCompletion {
        id: u64,
        message_ids: Vec<MessageId>,
        subscribers: Vec<PollSubscriber>,
    },
    ProcessEvents {
        id: u64,
        events: AccountFinalStateEvents,
    },
    ReplayAsynchronouslyBuiltFinalState {
        final_state: AccountFinalState,
        completion: Option<oneshot::Sender<bool>>,
    },
}

impl Operation {
    /// Whether running this operation commits postbox transactions.
    ///
    /// A blocking transaction cannot be cancelled once it has started.
    pub(crate) fn runs_transactions(&self) -> bool {
        matches!(
            self,
            Operation::PollDifference { .. }
                | Operation::ProcessUpdateGroups { .. }
                | Operation::ProcessEvents { .. }
                | Operation::ReplayAsynchronouslyBuiltFinalState { .. }
        )
    }

    pub(crate) fn kind(&self) -> OperationKind {
        match self {
            Operation::PollDifference { .. } => OperationKind::PollDifference,
            Operation::CollectUpdateGroups { groups, timeout } => OperationKind::CollectUpdateGroups {
                groups: groups.len(),
                timeout: *timeout,
            },
            Operation::ProcessUpdateGroups { groups } => OperationKind::ProcessUpdateGroups { groups: groups.len() },
            Operation::Custom { .. } => OperationKind::Custom,
            Operation::PollCompletion {
                message_ids,
                subscribers,
                ..
            } => OperationKind::PollCompletion {
                message_ids: message_ids.len(),
                subscribers: subscribers.len(),
            },
            Operation::ProcessEvents { .. } => OperationKind::ProcessEvents,
            Operation::ReplayAsynchronouslyBuiltFinalState { .. } => {
                OperationKind::ReplayAsynchronouslyBuiltFinalState
            }
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind())
    }
}

/// Public view of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Fetching the difference
    PollDifference,
    /// Batching pushed groups
    CollectUpdateGroups { groups: usize, timeout: Duration },
    /// Replaying a batch
    ProcessUpdateGroups { groups: usize },
    /// Caller-supplied work
    Custom,
    /// Waiting for the queue to drain
    PollCompletion { message_ids: usize, subscribers: usize },
    /// Delivering side effects
    ProcessEvents,
    /// Replaying a prebuilt final state
    ReplayAsynchronouslyBuiltFinalState,
}

/// Pending operations, head first
#[derive(Debug, Default)]
pub(crate) struct OperationQueue {
    operations: VecDeque<Operation>,
    next_id: u64,
}

impl OperationQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn len(&self) -> usize {
        self.operations.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub(crate) fn front(&self) -> Option<&Operation> {
        self.operations.front()
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut Operation> {
        self.operations.front_mut()
    }

    pub(crate) fn pop_front(&mut self) -> Option<Operation> {
        self.operations.pop_front()
    }

    pub(crate) fn push_front(&mut self, operation: Operation) {
        self.operations.push_front(operation);
    }

    pub(crate) fn kinds(&self) -> Vec<OperationKind> {
        self.operations.iter().map(Operation::kind).collect()
    }

    /// Append; returns whether the queue was empty
    pub(crate) fn push_back(&mut self, operation: Operation) -> bool {
        let was_empty = self.operations.is_empty();
        self.operations.push_back(operation);
        was_empty
    }

    /// Queue pushed update groups; returns whether the head must be started
    pub(crate) fn add_update_groups(&mut self, groups: Vec<UpdateGroup>) -> bool {
        enum Tail {
            Collecting,
            Waiting,
            Other,
            Empty,
        }

        let tail = match self.operations.back() {
            Some(Operation::CollectUpdateGroups { timeout, .. }) if timeout.is_zero() => Tail::Collecting,
            Some(Operation::CollectUpdateGroups { .. }) => Tail::Waiting,
            Some(_) => Tail::Other,
            None => Tail::Empty,
        };

        match tail {
            Tail::Collecting => {
                if let Some(Operation::CollectUpdateGroups { groups: current, .. }) = self.operations.back_mut() {
                    current.extend(groups);
                }
                false
            }
            Tail::Waiting => {
                let mut current = match self.operations.pop_back() {
                    Some(Operation::CollectUpdateGroups { groups, .. }) => groups,
                    _ => Vec::new(),
                };
                current.extend(groups);
                self.operations
                    .push_back(Operation::ProcessUpdateGroups { groups: current });
                true
            }
            Tail::Other => {
                self.operations.push_back(Operation::CollectUpdateGroups {
                    groups,
                    timeout: Duration::ZERO,
                });
                false
            }
            Tail::Empty => {
                self.operations.push_back(Operation::CollectUpdateGroups {
                    groups,
                    timeout: Duration::ZERO,
                });
                true
            }
        }
    }

    /// Drop everything except poll completions and replays, then queue
    /// `operation` at the head.
    ///
    /// Poll completions are merged into one that follows `operation`;
    /// replays keep their order after it.
    pub(crate) fn replace_operations(&mut self, operation: Operation) {
        let mut message_ids = Vec::new();
        let mut subscribers = Vec::new();
        let mut replays = Vec::new();

        for dropped in self.operations.drain(..) {
            match dropped {
                Operation::PollCompletion {
                    message_ids: ids,
                    subscribers: subs,
                    ..
                } => {
                    message_ids.extend(ids);
                    subscribers.extend(subs);
                }
                replay @ Operation::ReplayAsynchronouslyBuiltFinalState { .. } => replays.push(replay),
                other => tracing::trace!("Dropping queued {:?}", other),
            }
        }

        self.operations.push_back(operation);
        if !message_ids.is_empty() || !subscribers.is_empty() {
            let id = self.take_id();
            self.operations.push_back(Operation::PollCompletion {
                id,
                message_ids,
                subscribers,
            });
        }
        self.operations.extend(replays);
    }

    /// [`replace_operations`](Self::replace_operations) for everything
    /// behind the running head
    pub(crate) fn replace_operations_behind_head(&mut self, operation: Operation) {
        let head = self.operations.pop_front();
        self.replace_operations(operation);
        if let Some(head) = head {
            self.operations.push_front(head);
        }
    }

    /// Queue side effects ahead of pending work but behind earlier events
    pub(crate) fn insert_process_events(&mut self, events: AccountFinalStateEvents) {
        if events.is_empty() {
            return;
        }
        let position = self
            .operations
            .iter()
            .take_while(|operation| matches!(operation, Operation::ProcessEvents { .. }))
            .count();
        let id = self.take_id();
        self.operations
            .insert(position, Operation::ProcessEvents { id, events });
    }

    /// Move a poll completion to the back under a fresh id
    pub(crate) fn postpone_poll_completion(&mut self, message_ids: Vec<MessageId>, subscribers: Vec<PollSubscriber>) {
        let id = self.take_id();
        self.operations.push_back(Operation::PollCompletion {
            id,
            message_ids,
            subscribers,
        });
    }

    /// Register a poll completion subscriber; returns whether the head must
    /// be started
    pub(crate) fn add_poll_completion(&mut self, subscriber: PollSubscriber) -> bool {
        let existing = self
            .operations
            .iter_mut()
            .find_map(|operation| match operation {
                Operation::PollCompletion { subscribers, .. } => Some(subscribers),
                _ => None,
            });
        if let Some(subscribers) = existing {
            subscribers.push(subscriber);
            return false;
        }

        let id = self.take_id();
        self.push_back(Operation::PollCompletion {
            id,
            message_ids: Vec::new(),
            subscribers: vec![subscriber],
        })
    }

    /// Forget a poll completion subscriber; the operation itself stays
    pub(crate) fn remove_poll_completion(&mut self, subscriber_id: u64) {
        for operation in self.operations.iter_mut() {
            if let Operation::PollCompletion { subscribers, .. } = operation {
                subscribers.retain(|subscriber| subscriber.id != subscriber_id);
            }
        }
    }

    /// Report newly stored incoming messages to waiting poll completions
    pub(crate) fn merge_incoming_message_ids(&mut self, added: &[MessageId]) {
        if added.is_empty() {
            return;
        }
        for operation in self.operations.iter_mut() {
            if let Operation::PollCompletion { message_ids, .. } = operation {
                message_ids.extend_from_slice(added);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postbox::PeerId;

    fn group(pts: i32) -> UpdateGroup {
        UpdateGroup::WithPts {
            updates: vec![],
            pts,
            pts_count: 1,
        }
    }

    fn events(id: i32) -> AccountFinalStateEvents {
        AccountFinalStateEvents {
            added_incoming_message_ids: vec![MessageId::new(PeerId::new(0, 1), 0, id)],
            ..Default::default()
        }
    }

    fn subscriber(id: u64) -> (PollSubscriber, oneshot::Receiver<Vec<MessageId>>) {
        let (reply, rx) = oneshot::channel();
        (PollSubscriber { id, reply }, rx)
    }

    #[test]
    fn test_update_groups_on_empty_queue_start_collecting() {
        let mut queue = OperationQueue::new();
        assert!(queue.add_update_groups(vec![group(1)]));
        assert_eq!(
            queue.kinds(),
            vec![OperationKind::CollectUpdateGroups {
                groups: 1,
                timeout: Duration::ZERO
            }]
        );
    }

    #[test]
    fn test_update_groups_merge_into_collecting_tail() {
        let mut queue = OperationQueue::new();
        queue.add_update_groups(vec![group(1)]);
        assert!(!queue.add_update_groups(vec![group(2), group(3)]));
        assert_eq!(
            queue.kinds(),
            vec![OperationKind::CollectUpdateGroups {
                groups: 3,
                timeout: Duration::ZERO
            }]
        );
    }

    #[test]
    fn test_update_groups_end_waiting_collect() {
        let mut queue = OperationQueue::new();
        queue.push_back(Operation::CollectUpdateGroups {
            groups: vec![group(3)],
            timeout: Duration::from_secs(2),
        });
        assert!(queue.add_update_groups(vec![group(2)]));
        assert_eq!(queue.kinds(), vec![OperationKind::ProcessUpdateGroups { groups: 2 }]);
    }

    #[test]
    fn test_update_groups_behind_other_work() {
        let mut queue = OperationQueue::new();
        queue.push_back(Operation::PollDifference {
            events: AccountFinalStateEvents::default(),
        });
        assert!(!queue.add_update_groups(vec![group(1)]));
        assert_eq!(queue.len(), 2);
        assert!(matches!(
            queue.kinds()[1],
            OperationKind::CollectUpdateGroups { groups: 1, .. }
        ));
    }

    #[test]
    fn test_replace_keeps_completions_and_replays() {
        let mut queue = OperationQueue::new();
        let (first, _rx1) = subscriber(1);
        let (second, _rx2) = subscriber(2);
        let (completion, _completion_rx) = oneshot::channel();
        let base = crate::account::types::AccountSyncState {
            pts: 0,
            qts: 0,
            date: 0,
            seq: 0,
        };

        queue.push_back(Operation::ProcessUpdateGroups { groups: vec![group(1)] });
        queue.push_back(Operation::PollCompletion {
            id: 10,
            message_ids: vec![MessageId::new(PeerId::new(0, 1), 0, 5)],
            subscribers: vec![first],
        });
        queue.push_back(Operation::ReplayAsynchronouslyBuiltFinalState {
            final_state: AccountFinalState::new(base),
            completion: Some(completion),
        });
        queue.push_back(Operation::Custom { id: 11, work: None });
        queue.push_back(Operation::PollCompletion {
            id: 12,
            message_ids: vec![],
            subscribers: vec![second],
        });

        queue.replace_operations(Operation::PollDifference {
            events: AccountFinalStateEvents::default(),
        });
        assert_eq!(
            queue.kinds(),
            vec![
                OperationKind::PollDifference,
                OperationKind::PollCompletion {
                    message_ids: 1,
                    subscribers: 2
                },
                OperationKind::ReplayAsynchronouslyBuiltFinalState,
            ]
        );
    }

    #[test]
    fn test_replace_behind_head_keeps_running_replay_once() {
        let mut queue = OperationQueue::new();
        let (running, _running_rx) = oneshot::channel();
        let (queued, _queued_rx) = oneshot::channel();
        let base = crate::account::types::AccountSyncState {
            pts: 0,
            qts: 0,
            date: 0,
            seq: 0,
        };

        queue.push_back(Operation::ReplayAsynchronouslyBuiltFinalState {
            final_state: AccountFinalState::new(base),
            completion: Some(running),
        });
        queue.push_back(Operation::Custom { id: 1, work: None });
        queue.push_back(Operation::ReplayAsynchronouslyBuiltFinalState {
            final_state: AccountFinalState::new(base),
            completion: Some(queued),
        });
        assert!(queue.front().map_or(false, Operation::runs_transactions));

        queue.replace_operations_behind_head(Operation::PollDifference {
            events: AccountFinalStateEvents::default(),
        });
        assert_eq!(
            queue.kinds(),
            vec![
                OperationKind::ReplayAsynchronouslyBuiltFinalState,
                OperationKind::PollDifference,
                OperationKind::ReplayAsynchronouslyBuiltFinalState,
            ]
        );
        assert!(!Operation::Custom { id: 2, work: None }.runs_transactions());
    }

    #[test]
    fn test_replace_without_completions() {
        let mut queue = OperationQueue::new();
        queue.push_back(Operation::Custom { id: 1, work: None });
        queue.replace_operations(Operation::PollDifference {
            events: AccountFinalStateEvents::default(),
        });
        assert_eq!(queue.kinds(), vec![OperationKind::PollDifference]);
    }

    #[test]
    fn test_process_events_keep_arrival_order() {
        let mut queue = OperationQueue::new();
        queue.push_back(Operation::Custom { id: 1, work: None });
        queue.insert_process_events(events(1));
        queue.insert_process_events(events(2));
        queue.insert_process_events(AccountFinalStateEvents::default());

        assert_eq!(queue.len(), 3);
        let Some(Operation::ProcessEvents { events: first, .. }) = queue.pop_front() else {
            panic!("expected process events at the head");
        };
        assert_eq!(first, events(1));
        assert!(matches!(queue.pop_front(), Some(Operation::ProcessEvents { .. })));
        assert!(matches!(queue.pop_front(), Some(Operation::Custom { .. })));
    }

    #[test]
    fn test_poll_completion_subscribers_share_one_operation() {
        let mut queue = OperationQueue::new();
        let (first, _rx1) = subscriber(1);
        let (second, _rx2) = subscriber(2);
        assert!(queue.add_poll_completion(first));
        assert!(!queue.add_poll_completion(second));
        assert_eq!(
            queue.kinds(),
            vec![OperationKind::PollCompletion {
                message_ids: 0,
                subscribers: 2
            }]
        );

        queue.remove_poll_completion(1);
        queue.merge_incoming_message_ids(&[MessageId::new(PeerId::new(0, 1), 0, 3)]);
        assert_eq!(
            queue.kinds(),
            vec![OperationKind::PollCompletion {
                message_ids: 1,
                subscribers: 1
            }]
        );
    }

    #[test]
    fn test_postponed_completion_gets_new_id() {
        let mut queue = OperationQueue::new();
        queue.push_back(Operation::Custom { id: 0, work: None });
        let before = queue.take_id();
        queue.postpone_poll_completion(vec![], vec![]);
        match queue.operations.back() {
            Some(Operation::PollCompletion { id, .. }) => assert!(*id > before),
            other => panic!("unexpected tail {:?}", other),
        }
    }
}
