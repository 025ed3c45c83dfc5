//! Granite integration harness.
//!
//! Each test builds full in-process nodes — real keys, real loopback
//! sockets, the production `Network::start` path — and drives them
//! through the public handle only. Ports are OS-assigned so tests can
//! run concurrently.
//!
//!   RUST_LOG=granite_net=debug cargo test --test integration

mod capacity;
mod discovery;
mod sessions;

use std::sync::Once;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{broadcast, mpsc};

use granite_core::config::NetConfig;
use granite_core::rlp::{Item, RlpError};
use granite_core::Keypair;
use granite_net::peerman::{Network, NetworkHandle, PeerEvent};
use granite_net::session::{InboundMessage, Protocol};
use granite_net::{CodecRegistry, Payload, SupportedCapability};

// ── Harness ───────────────────────────────────────────────────────────────────

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// The eth status message exchanged right after a session goes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub protocol_version: u64,
    pub network_id: u64,
    pub total_difficulty: u64,
    pub best_hash: [u8; 32],
    pub genesis_hash: [u8; 32],
}

impl Payload for Status {
    fn to_item(&self) -> Item {
        Item::list(vec![
            Item::u64(self.protocol_version),
            Item::u64(self.network_id),
            Item::u64(self.total_difficulty),
            Item::bytes(self.best_hash),
            Item::bytes(self.genesis_hash),
        ])
    }

    fn from_item(item: &Item) -> Result<Self, RlpError> {
        Ok(Self {
            protocol_version: item.at(0)?.as_u64()?,
            network_id: item.at(1)?.as_u64()?,
            total_difficulty: item.at(2)?.as_u64()?,
            best_hash: item.at(3)?.as_array()?,
            genesis_hash: item.at(4)?.as_array()?,
        })
    }
}

pub fn sample_status() -> Status {
    Status {
        protocol_version: 63,
        network_id: 1,
        total_difficulty: 17_179_869_184,
        best_hash: [0xd4; 32],
        genesis_hash: [0x41; 32],
    }
}

/// Loopback config with OS-assigned ports and test-friendly timings.
pub fn test_config(max_peers: usize) -> NetConfig {
    let mut config = NetConfig::default();
    config.listen.address = "127.0.0.1".to_string();
    config.listen.tcp_port = 0;
    config.listen.udp_port = 0;
    config.peers.max_peers = max_peers;
    config.peers.dial_interval_secs = 1;
    config.peers.handshake_timeout_secs = 3;
    config.peers.read_timeout_secs = 10;
    config.peers.ping_interval_secs = 2;
    config.discovery.enabled = false;
    config.discovery.refresh_interval_secs = 1;
    config.discovery.probe_timeout_ms = 500;
    config
}

/// An in-process node plus the collaborator-side channel ends.
pub struct Node {
    pub handle: NetworkHandle,
    pub inbound: mpsc::Receiver<InboundMessage>,
    pub events: broadcast::Receiver<PeerEvent>,
}

/// Start a node advertising eth/63 with the status codec registered.
pub async fn start_node(config: NetConfig) -> Result<Node> {
    init_tracing();
    let mut registry = CodecRegistry::new();
    registry.register::<Status>("eth", 0);
    let (tx, rx) = mpsc::channel(64);
    let protocols = vec![Protocol {
        capability: SupportedCapability::new("eth", 63, 17),
        inbound: tx,
    }];
    let handle = Network::start(config, Keypair::generate(), registry, protocols)
        .await
        .context("network failed to start")?;
    let events = handle.subscribe();
    Ok(Node {
        handle,
        inbound: rx,
        events,
    })
}

/// Poll until `check` holds or the deadline passes.
pub async fn wait_until<F>(what: &str, timeout: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    Ok(())
}

/// Receive the next event within the timeout.
pub async fn next_event(rx: &mut broadcast::Receiver<PeerEvent>) -> Result<PeerEvent> {
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .context("timed out waiting for a peer event")??;
    Ok(event)
}
