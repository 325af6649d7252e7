//! LAN chat example demonstrating basic peerline functionality.
//!
//! This example shows how to:
//! - Start two nodes on loopback with their own inbox listeners
//! - Dial one node from the other and exchange lines
//! - Read the tagged event stream and the stored chat history

use peerline::{
    storage::{make_peer_key, ContactStore},
    utils::PeerlineConfig,
    Inbound, Node,
};
use tokio::time::{timeout, Duration};

fn demo_config(name: &str, beacon_port: u16) -> PeerlineConfig {
    let mut config = PeerlineConfig::default();
    config.identity.display_name = name.to_string();
    config.network.listen_host = "127.0.0.1".to_string();
    config.beacon.port = beacon_port;
    config.beacon.broadcast_address = "127.0.0.1".to_string();
    config
}

async fn wait_for_line(node: &Node) -> Option<String> {
    while let Ok(Some(event)) = timeout(Duration::from_secs(5), node.next_event()).await {
        println!("   {} <- {}", node.name(), event);
        if let Inbound::Content(text) = event.item {
            return Some(text);
        }
    }
    None
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    println!("Peerline - LAN Chat Example");
    println!("===========================");

    let alice = Node::new(demo_config("alice", 45901))?;
    let bob = Node::new(demo_config("bob", 45902))?;

    let alice_port = alice.start().await?;
    let bob_port = bob.start().await?;
    println!("alice listening on {alice_port}, bob listening on {bob_port}");

    let (id, connected) = alice.connect("127.0.0.1", bob_port, Some("bob")).await;
    if !connected {
        return Err("alice could not reach bob".into());
    }

    alice.send(id, "hi bob, this is alice").await;
    if let Some(line) = wait_for_line(&bob).await {
        println!("bob got: {line}");
    }

    bob.broadcast("hello alice!").await;
    if let Some(line) = wait_for_line(&alice).await {
        println!("alice got: {line}");
    }

    let history = alice
        .store()
        .get_messages(&make_peer_key("bob", "127.0.0.1", bob_port), 0)?;
    println!("alice's history with bob:");
    for message in history {
        println!("   {:?}: {}", message.role, message.text);
    }

    let stats = alice.stats();
    println!("alice stats: {} connection(s), {} LAN peer(s)", stats.connections, stats.lan_peers);

    println!("Shutting down...");
    alice.shutdown().await;
    bob.shutdown().await;
    println!("Shutdown complete");
    Ok(())
}
