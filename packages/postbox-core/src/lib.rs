//! # Postbox Core
//!
//! Transactional local storage and update synchronization for one messaging
//! account.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         POSTBOX CORE MODULES                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                    Account State Manager                         │  │
//! │  │                                                                  │  │
//! │  │  - Operation queue (one operation at a time)                     │  │
//! │  │  - Update batching, gap detection, difference polling            │  │
//! │  │  - Side-effect delivery (typing, webpages, calls, notifications) │  │
//! │  └───────────────┬──────────────────────────────┬───────────────────┘  │
//! │                  │ modify(body)                  │ AccountNetwork       │
//! │                  ▼                               ▼                      │
//! │  ┌──────────────────────────────────┐   ┌─────────────────────────┐    │
//! │  │             Postbox              │   │  Server (collaborator)  │    │
//! │  │                                  │   │                         │    │
//! │  │  - Read states (unread counts)   │   │  - get_difference       │    │
//! │  │  - Message history + holes       │   │  - get_state            │    │
//! │  │  - Global ids, metadata          │   │  - fetch_state_reset    │    │
//! │  └───────────────┬──────────────────┘   └─────────────────────────┘    │
//! │                  ▼                                                      │
//! │  ┌──────────────────────────────────┐                                  │
//! │  │   ValueBox (ordered KV, SQLite)  │                                  │
//! │  └──────────────────────────────────┘                                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`postbox`] - Tables, transactions and the key-value engine
//! - [`account`] - Update synchronization state machine

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod account;
pub mod error;
pub mod postbox;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use account::{AccountEvent, AccountNetwork, AccountStateManager, AccountStateManagerConfig};
pub use error::{Error, Result};
pub use postbox::{CombinedPeerReadState, Modifier, PeerReadState, Postbox, PostboxConfig};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of Postbox Core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
