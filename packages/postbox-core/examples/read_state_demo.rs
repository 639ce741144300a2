//! # Read State Demo
//!
//! This example walks one chat through the unread-count bookkeeping:
//! 1. The server snapshot seeds the read state
//! 2. New incoming messages raise the unread counter
//! 3. A read receipt lowers it using the stored history
//! 4. The persisted blob is shown byte for byte
//!
//! ## Run
//!
//! ```bash
//! cargo run --example read_state_demo
//! ```

use std::collections::{BTreeMap, HashMap};

use postbox_core::postbox::{
    encode_read_states, message_namespaces, peer_namespaces, Message, MessageId, PeerId, PeerReadState,
};
use postbox_core::{Postbox, PostboxConfig};

fn main() {
    println!("=================================================");
    println!("           POSTBOX READ STATE DEMO");
    println!("=================================================\n");

    let postbox = Postbox::open(PostboxConfig::default()).expect("Failed to open postbox");
    let peer_id = PeerId::new(peer_namespaces::CLOUD_USER, 42);
    let mut summaries = postbox.subscribe();

    // =========================================================================
    // STEP 1: Seed the read state from a server snapshot
    // =========================================================================
    println!("1. Seeding read state (read up to 5, known up to 10, 3 unread)...\n");

    let snapshot = PeerReadState::IdBased {
        max_incoming_read_id: 5,
        max_outgoing_read_id: 5,
        max_known_id: 10,
        count: 3,
    };
    postbox
        .transaction(|modifier| {
            modifier.reset_incoming_read_states(HashMap::from([(
                peer_id,
                BTreeMap::from([(message_namespaces::CLOUD, snapshot)]),
            )]))
        })
        .expect("Failed to reset read state");
    print_count(&postbox, peer_id);

    // =========================================================================
    // STEP 2: Receive new messages
    // =========================================================================
    println!("2. Receiving messages 11 and 12...\n");

    let messages: Vec<Message> = (11..=12)
        .map(|id| Message {
            id: MessageId::new(peer_id, message_namespaces::CLOUD, id),
            timestamp: 1_700_000_000 + id,
            global_id: None,
            author_id: Some(peer_id),
            incoming: true,
            text: format!("message {}", id),
        })
        .collect();
    postbox
        .transaction(|modifier| modifier.add_messages(&messages))
        .expect("Failed to add messages");
    print_count(&postbox, peer_id);

    // =========================================================================
    // STEP 3: Apply a read receipt
    // =========================================================================
    println!("3. Reading up to message 11...\n");

    postbox
        .transaction(|modifier| {
            modifier.apply_incoming_read_max_id(MessageId::new(peer_id, message_namespaces::CLOUD, 11))
        })
        .expect("Failed to apply read receipt");
    print_count(&postbox, peer_id);

    while let Ok(summary) = summaries.try_recv() {
        println!(
            "   Summary: deltas {:?}, sync {:?}, total {:?}",
            summary.unread_count_deltas, summary.peers_requiring_read_state_sync, summary.total_unread_count
        );
    }
    println!();

    // =========================================================================
    // STEP 4: Show the stored blob
    // =========================================================================
    println!("4. Persisted read state:\n");

    let combined = postbox
        .transaction(|modifier| modifier.get_combined_peer_read_state(peer_id))
        .expect("Failed to read state")
        .expect("Read state missing");
    let states: BTreeMap<_, _> = combined.states().iter().copied().collect();
    println!("   {}", hex::encode(encode_read_states(&states)));

    println!("\n=================================================");
    println!("                 DEMO COMPLETE");
    println!("=================================================");
}

fn print_count(postbox: &Postbox, peer_id: PeerId) {
    let combined = postbox
        .transaction(|modifier| modifier.get_combined_peer_read_state(peer_id))
        .expect("Failed to read state");
    match combined {
        Some(state) => println!("   Unread: {}\n", state.count()),
        None => println!("   No read state\n"),
    }
}
