//! # Account Synchronization
//!
//! Keeps the postbox in step with the server: pushed updates are batched and
//! replayed, gaps fall back to polling the difference, and side effects are
//! delivered once the storage changes are committed.
//!
//! ## Update Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        UPDATE FLOW                                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  push ──► add_updates ──► collect(groups, 0) ──► process(groups)       │
//! │                                                     │                   │
//! │                      ┌──── ok ─────────────────────┼─── gap ──────┐    │
//! │                      ▼                             ▼              ▼    │
//! │               processEvents              collect(groups, 2s)   poll   │
//! │                      │                          (timeout) ──► difference│
//! │                      ▼                                            │    │
//! │         typing / webpages / calls /          slice ◄──────────────┤    │
//! │         notifications / read-state sync        │     final ───────┘    │
//! │                                                 ▼                       │
//! │                                          poll again                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod events;
mod final_state;
mod manager;
mod network;
mod operations;
mod replay;
mod types;

pub use events::AccountEvent;
pub use final_state::{
    final_state_with_difference, final_state_with_update_groups, AccountFinalState, AccountFinalStateEvents,
    AccountMutation, AccountReplayedFinalState,
};
pub use manager::{AccountStateManager, PollStateUpdateCompletion, WebpageSubscription};
pub use network::{retry_request, AccountNetwork, RetryBackoff};
pub use operations::{CustomWork, OperationKind};
pub use replay::{apply_state_reset, replay_final_state, replay_update_groups};
pub use types::{
    AccountSyncState, AccountUpdate, AuthorizedAccountState, CallSessionState, CallSessionUpdate,
    DialogSnapshot, Difference, MediaId, PeerInputActivity, StateResetSnapshot, TypingActivity, UpdateGroup,
    UpdateSequence, Updates, Webpage,
};

use std::time::Duration;

/// Default capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long an incomplete batch waits for missing updates
const INCOMPLETE_UPDATE_TIMEOUT: Duration = Duration::from_secs(2);

/// Account state manager configuration
#[derive(Debug, Clone)]
pub struct AccountStateManagerConfig {
    /// Wait before an incomplete batch falls back to a difference poll
    pub incomplete_update_timeout: Duration,
    /// Backoff for network and storage requests
    pub retry: RetryBackoff,
    /// Capacity of the [`AccountEvent`] broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for AccountStateManagerConfig {
    fn default() -> Self {
        Self {
            incomplete_update_timeout: INCOMPLETE_UPDATE_TIMEOUT,
            retry: RetryBackoff::default(),
            event_channel_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }
}
