//! channelbox loopback demo.
//!
//! Usage:
//!
//!   channelbox-loopback
//!
//! Starts two clients on an in-process hub, lets them handshake, makes the
//! second one master, and sends it an encrypted payload from the first.
//!
//! Environment:
//!
//!   RUST_LOG   log filter (default: info)

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use channelbox::{
    ChannelBoxError, Client, ClientConfig, ConnectionStatus, MemoryHub, Result, SessionEvent,
};

const CHANNEL_ID: &str = "loopback";
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Err(e) = run().await {
        tracing::error!("loopback failed: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let hub = MemoryHub::new();
    hub.create_channel(CHANNEL_ID);
    let config = ClientConfig::new("loopback-token", CHANNEL_ID);

    let (alice, mut alice_events) = Client::spawn(config.clone(), hub.transport());
    let (bob, mut bob_events) = Client::spawn(config, hub.transport());

    bob.connect().await?;
    wait_for(&mut bob_events, "bob connected", |e| {
        *e == SessionEvent::Connection(ConnectionStatus::Connected)
    })
    .await?;

    alice.connect().await?;
    wait_for(&mut alice_events, "alice learns bob's key", |e| {
        matches!(e, SessionEvent::PeerDiscovered { user_id, .. } if user_id == bob.user_id())
    })
    .await?;

    bob.announce_master().await?;
    wait_for(&mut alice_events, "alice sees bob as master", |e| {
        matches!(e, SessionEvent::MasterChanged { user_id, .. } if user_id == bob.user_id())
    })
    .await?;

    alice
        .transmit(&json!({"greeting": "hello from the loopback demo"}), None)
        .await?;
    let received = wait_for(&mut bob_events, "bob receives payload", |e| {
        matches!(e, SessionEvent::Payload { .. })
    })
    .await?;
    if let SessionEvent::Payload {
        from_user_id,
        payload,
    } = received
    {
        println!("{} -> {}: {}", from_user_id, bob.user_id(), payload);
    }

    let snapshot = alice.snapshot().await?;
    println!(
        "{}: status={}, peers={:?}, stats={:?}",
        snapshot.user_id, snapshot.status, snapshot.known_peers, snapshot.stats
    );

    alice.shutdown().await?;
    bob.shutdown().await?;
    println!("channel carried {} messages", hub.history(CHANNEL_ID).len());
    Ok(())
}

async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    what: &str,
    wanted: impl Fn(&SessionEvent) -> bool,
) -> Result<SessionEvent> {
    let search = async {
        while let Some(event) = events.recv().await {
            if wanted(&event) {
                return Some(event);
            }
        }
        None
    };
    match tokio::time::timeout(EVENT_TIMEOUT, search).await {
        Ok(Some(event)) => Ok(event),
        Ok(None) => Err(ChannelBoxError::StateError(format!(
            "event stream closed while waiting for: {what}"
        ))),
        Err(_) => Err(ChannelBoxError::StateError(format!(
            "timed out waiting for: {what}"
        ))),
    }
}
