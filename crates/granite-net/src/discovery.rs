//! UDP discovery: signed ping/pong bonding, find-node/neighbours
//! lookups, and the liveness-probed eviction pipeline that keeps the
//! node table honest.
//!
//! Every packet is `hash(32) ‖ signature(65) ‖ type(1) ‖ rlp-payload`,
//! where the hash covers everything after itself and the recoverable
//! signature covers `type ‖ payload` — so a receiver learns the sender's
//! identity from the wire. Payloads carry an expiration timestamp;
//! expired, tampered, or unverifiable packets are dropped before any
//! state is touched.
//!
//! A node enters the table only after bonding: our ping answered by a
//! pong echoing that ping's hash. A full bucket probes its least
//! -recently-seen incumbent the same way; silence within the probe
//! timeout evicts it, a pong refreshes it and drops the candidate.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};

use granite_core::config::DiscoveryConfig;
use granite_core::crypto::{self, keccak256, Keypair, NodeId};
use granite_core::rlp::{self, Item, RlpError};
use granite_core::wire::{
    Endpoint, DISCOVERY_EXPIRATION_SECS, DISCOVERY_MAX_PACKET, MAX_NEIGHBOURS_PER_PACKET,
};

use crate::error::DiscoveryError;
use crate::table::{Insert, NodeEntry, NodeTable};

/// Discovery protocol version carried in ping.
const DISCOVERY_VERSION: u64 = 4;

/// Packet type bytes.
const KIND_PING: u8 = 0x01;
const KIND_PONG: u8 = 0x02;
const KIND_FIND_NODE: u8 = 0x03;
const KIND_NEIGHBOURS: u8 = 0x04;

/// hash(32) ‖ signature(65).
const HEAD_SIZE: usize = 32 + 65;

/// Nodes returned per lookup.
const LOOKUP_WIDTH: usize = 16;

/// Concurrent recipients per lookup target.
const ALPHA: usize = 3;

/// Pseudo-random targets per refresh round, besides the local identity.
const RANDOM_TARGETS: usize = 3;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

fn expiry() -> u64 {
    unix_now() + DISCOVERY_EXPIRATION_SECS
}

// ── Packets ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub version: u64,
    pub from: Endpoint,
    pub to: Endpoint,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub to: Endpoint,
    /// Hash of the ping being answered — what makes bonding verifiable.
    pub echo: [u8; 32],
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNode {
    pub target: NodeId,
    pub expiration: u64,
}

/// A node advertised in a neighbours packet: endpoint fields flat,
/// identity appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRecord {
    pub endpoint: Endpoint,
    pub id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbours {
    pub nodes: Vec<NodeRecord>,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Ping(Ping),
    Pong(Pong),
    FindNode(FindNode),
    Neighbours(Neighbours),
}

impl NodeRecord {
    fn to_item(&self) -> Item {
        let ip = match self.endpoint.ip {
            std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
            std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        Item::list(vec![
            Item::Bytes(ip),
            Item::u16(self.endpoint.udp_port),
            Item::u16(self.endpoint.tcp_port),
            Item::bytes(self.id.as_bytes()),
        ])
    }

    fn from_item(item: &Item) -> Result<Self, RlpError> {
        Ok(Self {
            endpoint: Endpoint::from_item(item)?,
            id: NodeId::from_bytes(item.at(3)?.as_array()?),
        })
    }
}

impl Packet {
    fn kind(&self) -> u8 {
        match self {
            Packet::Ping(_) => KIND_PING,
            Packet::Pong(_) => KIND_PONG,
            Packet::FindNode(_) => KIND_FIND_NODE,
            Packet::Neighbours(_) => KIND_NEIGHBOURS,
        }
    }

    fn expiration(&self) -> u64 {
        match self {
            Packet::Ping(p) => p.expiration,
            Packet::Pong(p) => p.expiration,
            Packet::FindNode(p) => p.expiration,
            Packet::Neighbours(p) => p.expiration,
        }
    }

    fn to_item(&self) -> Item {
        match self {
            Packet::Ping(p) => Item::list(vec![
                Item::u64(p.version),
                p.from.to_item(),
                p.to.to_item(),
                Item::u64(p.expiration),
            ]),
            Packet::Pong(p) => Item::list(vec![
                p.to.to_item(),
                Item::bytes(p.echo),
                Item::u64(p.expiration),
            ]),
            Packet::FindNode(p) => Item::list(vec![
                Item::bytes(p.target.as_bytes()),
                Item::u64(p.expiration),
            ]),
            Packet::Neighbours(p) => Item::list(vec![
                Item::List(p.nodes.iter().map(NodeRecord::to_item).collect()),
                Item::u64(p.expiration),
            ]),
        }
    }

    fn from_item(kind: u8, item: &Item) -> Result<Self, DiscoveryError> {
        Ok(match kind {
            KIND_PING => Packet::Ping(Ping {
                version: item.at(0)?.as_u64()?,
                from: Endpoint::from_item(item.at(1)?)?,
                to: Endpoint::from_item(item.at(2)?)?,
                expiration: item.at(3)?.as_u64()?,
            }),
            KIND_PONG => Packet::Pong(Pong {
                to: Endpoint::from_item(item.at(0)?)?,
                echo: item.at(1)?.as_array()?,
                expiration: item.at(2)?.as_u64()?,
            }),
            KIND_FIND_NODE => Packet::FindNode(FindNode {
                target: NodeId::from_bytes(item.at(0)?.as_array()?),
                expiration: item.at(1)?.as_u64()?,
            }),
            KIND_NEIGHBOURS => Packet::Neighbours(Neighbours {
                nodes: item
                    .at(0)?
                    .as_list()?
                    .iter()
                    .map(NodeRecord::from_item)
                    .collect::<Result<Vec<_>, _>>()?,
                expiration: item.at(1)?.as_u64()?,
            }),
            other => return Err(DiscoveryError::UnknownKind(other)),
        })
    }
}

// ── Wire encoding ─────────────────────────────────────────────────────────────

/// Sign and frame a packet. Returns the wire bytes and the packet hash
/// (what a pong must echo).
pub fn encode_packet(keypair: &Keypair, packet: &Packet) -> (Vec<u8>, [u8; 32]) {
    let payload = rlp::encode(&packet.to_item());
    let mut signed = Vec::with_capacity(1 + payload.len());
    signed.push(packet.kind());
    signed.extend_from_slice(&payload);
    let signature = keypair.sign_recoverable(&keccak256(&signed));

    let mut out = vec![0u8; 32];
    out.extend_from_slice(&signature);
    out.extend_from_slice(&signed);
    let hash = keccak256(&out[32..]);
    out[..32].copy_from_slice(&hash);
    (out, hash)
}

/// Verify and decode a packet: hash first, then signature recovery, then
/// payload, then expiration. Returns the recovered sender identity and
/// the packet hash.
pub fn decode_packet(buf: &[u8], now: u64) -> Result<(NodeId, [u8; 32], Packet), DiscoveryError> {
    if buf.len() <= HEAD_SIZE + 1 || buf.len() > DISCOVERY_MAX_PACKET {
        return Err(DiscoveryError::BadLength);
    }
    let hash = keccak256(&buf[32..]);
    if hash != buf[..32] {
        return Err(DiscoveryError::BadHash);
    }

    let signature: [u8; 65] = buf[32..HEAD_SIZE]
        .try_into()
        .map_err(|_| DiscoveryError::BadSignature)?;
    let sender = crypto::recover(&keccak256(&buf[HEAD_SIZE..]), &signature)
        .map_err(|_| DiscoveryError::BadSignature)?;

    let kind = buf[HEAD_SIZE];
    let item = rlp::decode(&buf[HEAD_SIZE + 1..])?;
    let packet = Packet::from_item(kind, &item)?;
    if packet.expiration() < now {
        return Err(DiscoveryError::Expired);
    }
    Ok((sender, hash, packet))
}

// ── Service ───────────────────────────────────────────────────────────────────

/// Why a ping is outstanding.
enum PingPurpose {
    /// Liveness confirmation before a candidate's first insertion.
    Bond,
    /// Eviction check of a full bucket's least-recently-seen incumbent.
    /// The candidate enters only if the incumbent stays silent.
    Probe {
        candidate: NodeId,
        candidate_endpoint: Endpoint,
    },
}

struct PendingPing {
    endpoint: Endpoint,
    ping_hash: [u8; 32],
    purpose: PingPurpose,
    sent_at: Instant,
}

/// The discovery service. Owns the UDP socket and all per-query state;
/// the node table is shared with the peer manager through a mutex whose
/// critical sections never span an await on the socket.
pub struct Discovery {
    socket: Arc<UdpSocket>,
    keypair: Arc<Keypair>,
    table: Arc<Mutex<NodeTable>>,
    local_endpoint: Endpoint,
    bootnodes: Vec<(NodeId, Endpoint)>,
    pending: HashMap<NodeId, PendingPing>,
    queries: HashMap<NodeId, Instant>,
    probe_timeout: Duration,
    refresh_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Discovery {
    pub fn new(
        socket: UdpSocket,
        keypair: Arc<Keypair>,
        table: Arc<Mutex<NodeTable>>,
        local_endpoint: Endpoint,
        bootnodes: Vec<(NodeId, Endpoint)>,
        config: &DiscoveryConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            socket: Arc::new(socket),
            keypair,
            table,
            local_endpoint,
            bootnodes,
            pending: HashMap::new(),
            queries: HashMap::new(),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            refresh_interval: Duration::from_secs(config.refresh_interval_secs),
            shutdown,
        }
    }

    /// Serve until shutdown. Per-packet failures never end the loop.
    pub async fn run(mut self) {
        let mut refresh = tokio::time::interval(self.refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let sweep_period = (self.probe_timeout / 4).max(Duration::from_millis(50));
        let mut sweep = tokio::time::interval(sweep_period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut buf = vec![0u8; DISCOVERY_MAX_PACKET + 1];
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("discovery shutting down");
                        return;
                    }
                }
                _ = refresh.tick() => self.refresh().await,
                _ = sweep.tick() => self.sweep().await,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                    Err(err) => tracing::warn!(error = %err, "discovery recv failed"),
                }
            }
        }
    }

    async fn handle_datagram(&mut self, buf: &[u8], from: SocketAddr) {
        let (sender, hash, packet) = match decode_packet(buf, unix_now()) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::trace!(%from, error = %err, "rejected discovery packet");
                return;
            }
        };
        if sender == self.keypair.id() {
            return;
        }
        match packet {
            Packet::Ping(ping) => self.handle_ping(sender, hash, ping, from).await,
            Packet::Pong(pong) => self.handle_pong(sender, pong, from).await,
            Packet::FindNode(find) => self.handle_find_node(sender, find, from).await,
            Packet::Neighbours(neighbours) => self.handle_neighbours(sender, neighbours).await,
        }
    }

    /// Answer with a pong echoing the ping's hash. An unknown sender is
    /// bonded from our side too — insertion always waits for OUR pong.
    async fn handle_ping(&mut self, sender: NodeId, hash: [u8; 32], ping: Ping, from: SocketAddr) {
        // The datagram source wins over whatever the payload claims.
        let endpoint = Endpoint::new(from.ip(), from.port(), ping.from.tcp_port);

        let pong = Packet::Pong(Pong {
            to: endpoint,
            echo: hash,
            expiration: expiry(),
        });
        let (bytes, _) = encode_packet(&self.keypair, &pong);
        if let Err(err) = self.socket.send_to(&bytes, from).await {
            tracing::debug!(%from, error = %err, "pong send failed");
        }

        let mut table = self.table.lock().await;
        if table.contains(&sender) {
            table.insert(sender, endpoint);
        } else {
            drop(table);
            if !self.pending.contains_key(&sender) {
                self.send_ping(sender, endpoint, PingPurpose::Bond).await;
            }
        }
    }

    /// A pong settles whichever ping we had outstanding to this node:
    /// bonding inserts (possibly starting an eviction probe), a probe
    /// answer refreshes the incumbent and drops the waiting candidate.
    async fn handle_pong(&mut self, sender: NodeId, pong: Pong, from: SocketAddr) {
        match self.pending.get(&sender) {
            None => {
                tracing::trace!(node = %sender, "unsolicited pong");
                return;
            }
            Some(pending) if pending.ping_hash != pong.echo => {
                tracing::trace!(node = %sender, "pong echo mismatch");
                return;
            }
            Some(_) => {}
        }
        let Some(pending) = self.pending.remove(&sender) else {
            return;
        };
        let endpoint = Endpoint::new(from.ip(), from.port(), pending.endpoint.tcp_port);

        match pending.purpose {
            PingPurpose::Bond => {
                let mut table = self.table.lock().await;
                match table.insert(sender, endpoint) {
                    Insert::Added => {
                        tracing::debug!(node = %sender, %endpoint, "bonded");
                    }
                    Insert::Refreshed | Insert::IsSelf => {}
                    Insert::Full { incumbent } => {
                        drop(table);
                        tracing::debug!(
                            candidate = %sender,
                            incumbent = %incumbent.id,
                            "bucket full, probing incumbent"
                        );
                        self.send_ping(
                            incumbent.id,
                            incumbent.endpoint,
                            PingPurpose::Probe {
                                candidate: sender,
                                candidate_endpoint: endpoint,
                            },
                        )
                        .await;
                    }
                }
            }
            PingPurpose::Probe { candidate, .. } => {
                self.table.lock().await.note_seen(&sender);
                tracing::trace!(
                    incumbent = %sender,
                    candidate = %candidate,
                    "incumbent alive, candidate dropped"
                );
            }
        }
    }

    /// Only bonded nodes get answers; responses are chunked to the
    /// datagram budget.
    async fn handle_find_node(&mut self, sender: NodeId, find: FindNode, from: SocketAddr) {
        let table = self.table.lock().await;
        if !table.contains(&sender) {
            tracing::trace!(node = %sender, "find-node from unbonded node");
            return;
        }
        let closest = table.closest(&find.target.address(), LOOKUP_WIDTH);
        drop(table);

        for chunk in closest.chunks(MAX_NEIGHBOURS_PER_PACKET) {
            let neighbours = Packet::Neighbours(Neighbours {
                nodes: chunk
                    .iter()
                    .map(|entry| NodeRecord {
                        endpoint: entry.endpoint,
                        id: entry.id,
                    })
                    .collect(),
                expiration: expiry(),
            });
            let (bytes, _) = encode_packet(&self.keypair, &neighbours);
            if let Err(err) = self.socket.send_to(&bytes, from).await {
                tracing::debug!(%from, error = %err, "neighbours send failed");
                return;
            }
        }
    }

    /// Candidates from a neighbours answer enter through bonding, never
    /// directly.
    async fn handle_neighbours(&mut self, sender: NodeId, neighbours: Neighbours) {
        if !self.queries.contains_key(&sender) {
            tracing::trace!(node = %sender, "unsolicited neighbours");
            return;
        }
        for record in neighbours.nodes {
            if record.id == self.keypair.id() {
                continue;
            }
            let known = self.table.lock().await.contains(&record.id);
            if !known && !self.pending.contains_key(&record.id) {
                self.send_ping(record.id, record.endpoint, PingPurpose::Bond)
                    .await;
            }
        }
    }

    async fn send_ping(&mut self, id: NodeId, endpoint: Endpoint, purpose: PingPurpose) {
        if self.pending.contains_key(&id) {
            return;
        }
        let ping = Packet::Ping(Ping {
            version: DISCOVERY_VERSION,
            from: self.local_endpoint,
            to: endpoint,
            expiration: expiry(),
        });
        let (bytes, ping_hash) = encode_packet(&self.keypair, &ping);
        if let Err(err) = self.socket.send_to(&bytes, endpoint.udp_addr()).await {
            tracing::debug!(node = %id, error = %err, "ping send failed");
            return;
        }
        self.pending.insert(
            id,
            PendingPing {
                endpoint,
                ping_hash,
                purpose,
                sent_at: Instant::now(),
            },
        );
    }

    async fn send_find_node(&mut self, node: &NodeEntry, target: NodeId) {
        let find = Packet::FindNode(FindNode {
            target,
            expiration: expiry(),
        });
        let (bytes, _) = encode_packet(&self.keypair, &find);
        match self.socket.send_to(&bytes, node.endpoint.udp_addr()).await {
            Ok(_) => {
                self.queries.insert(node.id, Instant::now());
            }
            Err(err) => tracing::debug!(node = %node.id, error = %err, "find-node send failed"),
        }
    }

    /// Periodic table maintenance: re-bond missing bootnodes, then look
    /// up the local identity and a few pseudo-random targets.
    async fn refresh(&mut self) {
        for (id, endpoint) in self.bootnodes.clone() {
            if id == self.keypair.id() {
                continue;
            }
            let known = self.table.lock().await.contains(&id);
            if !known && !self.pending.contains_key(&id) {
                self.send_ping(id, endpoint, PingPurpose::Bond).await;
            }
        }

        let mut targets = vec![self.keypair.id()];
        {
            let mut rng = rand::thread_rng();
            for _ in 0..RANDOM_TARGETS {
                let mut bytes = [0u8; 64];
                rng.fill_bytes(&mut bytes);
                // Only the derived address matters for a lookup target.
                targets.push(NodeId::from_bytes(bytes));
            }
        }

        for target in targets {
            let recipients = self.table.lock().await.closest(&target.address(), ALPHA);
            for node in recipients {
                self.send_find_node(&node, target).await;
            }
        }

        let size = self.table.lock().await.len();
        tracing::debug!(nodes = size, pending = self.pending.len(), "discovery refresh");
    }

    /// Drop expired pings and queries. A timed-out bond is silent; a
    /// timed-out eviction probe replaces the incumbent with its waiting
    /// candidate.
    async fn sweep(&mut self) {
        let now = Instant::now();
        let timeout = self.probe_timeout;
        let mut evictions = Vec::new();

        self.pending.retain(|id, pending| {
            if now.duration_since(pending.sent_at) < timeout {
                return true;
            }
            match pending.purpose {
                PingPurpose::Bond => {
                    tracing::trace!(node = %id, "bond timed out");
                }
                PingPurpose::Probe {
                    candidate,
                    candidate_endpoint,
                } => evictions.push((*id, candidate, candidate_endpoint)),
            }
            false
        });

        if !evictions.is_empty() {
            let mut table = self.table.lock().await;
            for (incumbent, candidate, endpoint) in evictions {
                if table.evict_replace(&incumbent, candidate, endpoint) {
                    tracing::debug!(
                        evicted = %incumbent,
                        inserted = %candidate,
                        "replaced unresponsive node"
                    );
                }
            }
        }

        self.queries
            .retain(|_, sent_at| now.duration_since(*sent_at) < timeout);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
