//! Simple chat example demonstrating basic courier functionality.
//!
//! This example shows how to:
//! - Start two nodes on an in-memory network
//! - Connect them and exchange signed messages
//! - Send a file in chunks
//! - Delete a message at both ends

use peer_courier::{
    app::{Node, NodeEvent, NodeHandle},
    connection::ConnectionStatus,
    MemoryNetwork, MemoryStore, MessengerConfig, UserProfile,
};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Duration};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    println!("🔐 Peer Courier - Simple Chat Example");
    println!("=====================================");

    let network = MemoryNetwork::new();
    let mut config = MessengerConfig::default();
    config.transfer.chunk_size = 1024;

    println!("🚀 Starting nodes...");
    let (alice, _) = start_node(&network, &config, "alice", "Alice")?;
    let (bob, mut bob_events) = start_node(&network, &config, "bob", "Bob")?;

    while !network.is_registered("alice") || !network.is_registered("bob") {
        sleep(Duration::from_millis(10)).await;
    }
    println!("✅ Both nodes registered");

    println!("\n🔗 Alice opens the chat with Bob...");
    alice.focus(Some("bob")).await?;
    wait_connected(&alice, "bob").await?;
    wait_connected(&bob, "alice").await?;
    println!("   Connected");

    println!("\n💬 Exchanging messages...");
    let hello = alice.send_message("bob", "Hi Bob, it's Alice").await?;
    let received = next_message(&mut bob_events).await?;
    println!(
        "   Bob got '{}' (verified: {})",
        received.text, received.is_verified
    );
    bob.send_message("alice", "Hello Alice!").await?;

    println!("\n📎 Sending a file...");
    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let file_id = alice
        .send_file("bob", "notes.bin", "application/octet-stream", payload.clone())
        .await?;
    println!("   Alice sent transfer {}", file_id);
    let handle = loop {
        match timeout(Duration::from_secs(2), bob_events.recv()).await?? {
            NodeEvent::FileReceived { message, .. } => break message.file_url.unwrap_or_default(),
            NodeEvent::TransferFailed { reason, .. } => return Err(reason.into()),
            _ => continue,
        }
    };
    let stored = bob.file(&handle).await?.unwrap_or_default();
    println!("   Bob stored {} bytes (intact: {})", stored.len(), stored == payload);

    println!("\n🗑  Alice deletes her first message...");
    alice.delete_message("bob", hello.id).await?;
    loop {
        if let NodeEvent::MessageDeleted { message_id, .. } =
            timeout(Duration::from_secs(2), bob_events.recv()).await??
        {
            println!("   Bob saw {} deleted", message_id);
            break;
        }
    }

    println!("\n📜 Bob's history with Alice:");
    for message in bob.history("alice").await? {
        let text = if message.deleted {
            "(deleted)".to_string()
        } else {
            message.text
        };
        println!("   [{}] {:?}: {}", message.time, message.sender, text);
    }

    let stats = alice.stats().await?;
    println!("\n📊 Alice's stats:");
    println!("   Connected peers: {}", stats.connections.connected);
    println!("   Frames sent: {}", stats.connections.frames_sent);
    println!("   Contacts: {}", stats.contacts);

    println!("\n🛑 Shutting down...");
    alice.shutdown();
    bob.shutdown();
    sleep(Duration::from_millis(50)).await;
    println!("✅ Shutdown complete");

    Ok(())
}

fn start_node(
    network: &MemoryNetwork,
    config: &MessengerConfig,
    username: &str,
    display_name: &str,
) -> peer_courier::Result<(NodeHandle, broadcast::Receiver<NodeEvent>)> {
    let (transport, events) = network.endpoint();
    let profile = UserProfile::new(username.to_string(), display_name.to_string());
    let (node, handle) = Node::new(config, profile, transport, events, Box::new(MemoryStore::new()))?;
    let subscription = handle.subscribe();
    tokio::spawn(node.run());
    Ok((handle, subscription))
}

async fn wait_connected(handle: &NodeHandle, peer_id: &str) -> peer_courier::Result<()> {
    loop {
        if let Some(info) = handle.connection(peer_id).await? {
            if info.status == ConnectionStatus::Connected && info.standby == 0 {
                return Ok(());
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
}

async fn next_message(
    events: &mut broadcast::Receiver<NodeEvent>,
) -> Result<peer_courier::storage::ChatMessage, Box<dyn std::error::Error>> {
    loop {
        if let NodeEvent::MessageReceived { message, .. } =
            timeout(Duration::from_secs(2), events.recv()).await??
        {
            return Ok(message);
        }
    }
}
