//! The peer manager: session pool, dial/accept loops, and the network
//! front door.
//!
//! The pool holds at most `max_peers` live sessions, at most one per
//! remote identity. Inbound connections beyond capacity are dropped
//! before any cryptography runs; duplicates and self-connections are
//! turned away with their wire reason. Disconnect reasons feed a
//! per-node reputation that backs off reconnection attempts and
//! permanently deprioritizes repeat offenders.

use std::any::Any;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use granite_core::config::NetConfig;
use granite_core::crypto::{Keypair, NodeId};
use granite_core::wire::{DisconnectReason, Endpoint, Hello, BASE_PROTOCOL_VERSION, MSG_DISCONNECT};

use crate::capability::{self, SupportedCapability};
use crate::codec::CodecRegistry;
use crate::discovery::Discovery;
use crate::error::{HandshakeError, NetError};
use crate::framing::{self, FrameReader, FrameWriter};
use crate::handshake;
use crate::session::{
    self, BoxedRead, BoxedWrite, Protocol, Session, SessionState, SessionTiming, StateCell,
};
use crate::table::NodeTable;

const EVENT_CHANNEL_SIZE: usize = 256;

/// Strikes of `BreachOfProtocol` or `UselessPeer` before a node is never
/// dialed again.
const BAN_STRIKES: u8 = 3;

// ── Events ────────────────────────────────────────────────────────────────────

/// Pool lifecycle notifications, broadcast to subscribers.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Connected { peer: NodeId, inbound: bool },
    Disconnected { peer: NodeId, reason: DisconnectReason },
    /// An inbound socket was turned away before a session existed.
    InboundRejected { addr: SocketAddr, reason: DisconnectReason },
}

/// A live peer, as reported by [`NetworkHandle::peers`].
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: NodeId,
    pub client_id: String,
    pub capabilities: Vec<(String, u64)>,
    pub inbound: bool,
}

// ── Pool entries ──────────────────────────────────────────────────────────────

/// Everything remembered about a peer identity: its at-most-one live
/// session plus the reputation that outlives it.
#[derive(Default)]
struct PeerEntry {
    session: Option<Arc<Session>>,
    inbound: bool,
    score: i32,
    breach_strikes: u8,
    useless_strikes: u8,
    banned: bool,
    backoff_until: Option<Instant>,
}

fn apply_reputation(entry: &mut PeerEntry, reason: DisconnectReason) {
    use DisconnectReason::*;
    let backoff = match reason {
        BreachOfProtocol | UnexpectedIdentity => {
            entry.breach_strikes = entry.breach_strikes.saturating_add(1);
            entry.score -= 4;
            Duration::from_secs(900)
        }
        UselessPeer | IncompatibleP2PVersion => {
            entry.useless_strikes = entry.useless_strikes.saturating_add(1);
            entry.score -= 2;
            Duration::from_secs(600)
        }
        ReceiveMessageTimeout | TcpSubsystemError => {
            entry.score -= 1;
            Duration::from_secs(60)
        }
        _ => Duration::from_secs(30),
    };
    if entry.breach_strikes >= BAN_STRIKES || entry.useless_strikes >= BAN_STRIKES {
        entry.banned = true;
    }
    entry.backoff_until = Some(Instant::now() + backoff);
}

// ── Network ───────────────────────────────────────────────────────────────────

struct Inner {
    keypair: Arc<Keypair>,
    config: NetConfig,
    registry: Arc<CodecRegistry>,
    protocols: Arc<Vec<Protocol>>,
    supported: Vec<SupportedCapability>,
    pool: DashMap<NodeId, PeerEntry>,
    active: AtomicUsize,
    table: Arc<Mutex<NodeTable>>,
    bootnodes: Vec<(NodeId, SocketAddr)>,
    events: broadcast::Sender<PeerEvent>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    tcp_addr: SocketAddr,
    udp_addr: Option<SocketAddr>,
    timing: SessionTiming,
    handshake_timeout: Duration,
}

/// The Granite network subsystem.
pub struct Network;

impl Network {
    /// Bind the listeners, start the accept/dial/discovery loops, and
    /// return the handle collaborators drive the subsystem through.
    ///
    /// Failing to bind a socket is the only fatal error; everything that
    /// happens to an individual connection afterwards stays local to it.
    pub async fn start(
        config: NetConfig,
        keypair: Keypair,
        registry: CodecRegistry,
        protocols: Vec<Protocol>,
    ) -> Result<NetworkHandle, NetError> {
        let keypair = Arc::new(keypair);
        let listener =
            TcpListener::bind((config.listen.address.as_str(), config.listen.tcp_port)).await?;
        let tcp_addr = listener.local_addr()?;

        let discovery_socket = if config.discovery.enabled {
            Some(UdpSocket::bind((config.listen.address.as_str(), config.listen.udp_port)).await?)
        } else {
            None
        };
        let udp_addr = match &discovery_socket {
            Some(socket) => Some(socket.local_addr()?),
            None => None,
        };

        let supported: Vec<SupportedCapability> =
            protocols.iter().map(|p| p.capability.clone()).collect();
        let bootnodes = parse_bootnodes(&config.peers.bootnodes);
        let table = Arc::new(Mutex::new(NodeTable::new(keypair.id())));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (shutdown, _) = watch::channel(false);
        let timing = SessionTiming {
            ping_interval: Duration::from_secs(config.peers.ping_interval_secs),
            read_timeout: Duration::from_secs(config.peers.read_timeout_secs),
        };
        let handshake_timeout = Duration::from_secs(config.peers.handshake_timeout_secs);

        let inner = Arc::new(Inner {
            keypair: keypair.clone(),
            config,
            registry: Arc::new(registry),
            protocols: Arc::new(protocols),
            supported,
            pool: DashMap::new(),
            active: AtomicUsize::new(0),
            table: table.clone(),
            bootnodes,
            events,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            tcp_addr,
            udp_addr,
            timing,
            handshake_timeout,
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(accept_loop(inner.clone(), listener)));
        tasks.push(tokio::spawn(dial_loop(inner.clone())));

        if let (Some(socket), Some(udp_addr)) = (discovery_socket, udp_addr) {
            let local_endpoint = Endpoint::new(udp_addr.ip(), udp_addr.port(), tcp_addr.port());
            let boot_endpoints = inner
                .bootnodes
                .iter()
                // The discovery port is assumed equal to the session port.
                .map(|(id, addr)| (*id, Endpoint::new(addr.ip(), addr.port(), addr.port())))
                .collect();
            let discovery = Discovery::new(
                socket,
                keypair.clone(),
                table,
                local_endpoint,
                boot_endpoints,
                &inner.config.discovery,
                inner.shutdown.subscribe(),
            );
            tasks.push(tokio::spawn(discovery.run()));
        }
        inner.tasks.lock().await.extend(tasks);

        tracing::info!(
            id = %keypair.id(),
            %tcp_addr,
            udp = ?udp_addr,
            max_peers = inner.config.peers.max_peers,
            "network started"
        );
        Ok(NetworkHandle { inner })
    }
}

/// Cloneable handle to a running network.
#[derive(Clone)]
pub struct NetworkHandle {
    inner: Arc<Inner>,
}

impl NetworkHandle {
    pub fn local_id(&self) -> NodeId {
        self.inner.keypair.id()
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.inner.tcp_addr
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.inner.udp_addr
    }

    /// Live sessions right now. Never exceeds `max_peers`.
    pub fn peer_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner
            .pool
            .iter()
            .filter_map(|entry| {
                let session = entry.session.as_ref()?;
                Some(PeerInfo {
                    id: *entry.key(),
                    client_id: session.remote_hello().client_id.clone(),
                    capabilities: session
                        .capabilities()
                        .iter()
                        .map(|cap| (cap.name.clone(), cap.version))
                        .collect(),
                    inbound: entry.inbound,
                })
            })
            .collect()
    }

    pub fn session(&self, peer: &NodeId) -> Option<Arc<Session>> {
        self.inner.pool.get(peer)?.session.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    /// Nodes the discovery table currently tracks.
    pub async fn known_nodes(&self) -> usize {
        self.inner.table.lock().await.len()
    }

    /// Dial a specific peer now, outside the periodic candidate loop.
    pub async fn connect(&self, peer: NodeId, addr: SocketAddr) -> Result<(), NetError> {
        connect(&self.inner, peer, addr).await
    }

    /// Encode and send one typed message to one peer.
    pub async fn send(
        &self,
        peer: &NodeId,
        capability: &str,
        id: u64,
        message: &(dyn Any + Send + Sync),
    ) -> Result<(), NetError> {
        let session = self.session(peer).ok_or(NetError::Closed)?;
        session.send(capability, id, message).await
    }

    /// Send one typed message to every active session that negotiated
    /// the capability. Returns how many peers it went to.
    pub async fn broadcast(&self, capability: &str, id: u64, message: &(dyn Any + Send + Sync)) -> usize {
        let sessions: Vec<Arc<Session>> = self
            .inner
            .pool
            .iter()
            .filter_map(|entry| entry.session.clone())
            .collect();
        let mut sent = 0;
        for session in sessions {
            if session.send(capability, id, message).await.is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Disconnect one peer with an explicit reason.
    pub async fn disconnect(&self, peer: &NodeId, reason: DisconnectReason) {
        if let Some(session) = self.session(peer) {
            session.disconnect(reason).await;
        }
    }

    /// Cooperative shutdown: signal every loop and session, then wait
    /// for them to finish.
    pub async fn shutdown(&self) {
        tracing::info!("network shutting down");
        let _ = self.inner.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = self.inner.tasks.lock().await.drain(..).collect();
        let _ = tokio::time::timeout(
            Duration::from_secs(5),
            futures::future::join_all(handles),
        )
        .await;
    }
}

// ── Establishment ─────────────────────────────────────────────────────────────

fn local_hello(inner: &Inner) -> Hello {
    Hello {
        protocol_version: BASE_PROTOCOL_VERSION,
        client_id: inner.config.identity.client_id.clone(),
        capabilities: inner
            .supported
            .iter()
            .map(SupportedCapability::advertised)
            .collect(),
        listen_port: inner.tcp_addr.port(),
        node_id: inner.keypair.id(),
    }
}

async fn connect(inner: &Arc<Inner>, peer: NodeId, addr: SocketAddr) -> Result<(), NetError> {
    if peer == inner.keypair.id() {
        return Err(NetError::SelfConnection);
    }
    if let Some(entry) = inner.pool.get(&peer) {
        if entry.session.is_some() {
            return Err(NetError::DuplicateIdentity);
        }
    }
    if inner.active.load(Ordering::SeqCst) >= inner.config.peers.max_peers {
        return Err(NetError::CapacityExceeded);
    }

    let state = StateCell::new();
    let mut stream = TcpStream::connect(addr).await?;
    state.advance(SessionState::Handshaking);
    let secrets =
        handshake::initiate(&mut stream, &inner.keypair, &peer, inner.handshake_timeout).await?;
    finish_establish(inner, stream, secrets, peer, state, false).await
}

async fn accept_one(
    inner: &Arc<Inner>,
    mut stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), NetError> {
    let state = StateCell::new();
    state.advance(SessionState::Handshaking);
    let (secrets, remote_id) =
        handshake::accept(&mut stream, &inner.keypair, inner.handshake_timeout).await?;
    tracing::debug!(%addr, peer = %remote_id, "inbound handshake complete");
    finish_establish(inner, stream, secrets, remote_id, state, true).await
}

/// Shared tail of both directions: hello exchange, pool registration,
/// read-loop spawn. Failures announce their reason on the live
/// transport before closing.
async fn finish_establish(
    inner: &Arc<Inner>,
    stream: TcpStream,
    secrets: handshake::SessionSecrets,
    remote_id: NodeId,
    state: StateCell,
    inbound: bool,
) -> Result<(), NetError> {
    state.advance(SessionState::NegotiatingCapabilities);
    let (egress, ingress) = framing::split(&secrets);
    let (read_half, write_half) = stream.into_split();
    let mut writer = FrameWriter::new(Box::new(write_half) as BoxedWrite, egress);
    let mut reader = FrameReader::new(Box::new(read_half) as BoxedRead, ingress);

    let hello = local_hello(inner);
    let exchange = capability::exchange(
        &mut reader,
        &mut writer,
        &hello,
        &inner.supported,
        &remote_id,
    );
    let (remote_hello, caps) = match tokio::time::timeout(inner.handshake_timeout, exchange).await {
        Ok(Ok(negotiated)) => negotiated,
        Ok(Err(err)) => {
            if !matches!(err, NetError::RemoteDisconnect(_)) {
                let reason = err.disconnect_reason();
                let _ = writer
                    .send(MSG_DISCONNECT, &session::encode_disconnect(reason))
                    .await;
            }
            return Err(err);
        }
        Err(_) => return Err(NetError::Handshake(HandshakeError::Timeout)),
    };

    let session = Session::new(
        remote_id,
        remote_hello,
        caps,
        inner.registry.clone(),
        writer,
        state.clone(),
    );

    if let Err(err) = register(inner, session.clone(), inbound) {
        session.disconnect(err.disconnect_reason()).await;
        return Err(err);
    }
    state.advance(SessionState::Active);
    tracing::info!(peer = %remote_id, inbound, "session established");
    let _ = inner.events.send(PeerEvent::Connected {
        peer: remote_id,
        inbound,
    });

    let loop_inner = inner.clone();
    let handle = tokio::spawn(async move {
        let reason = session::read_loop(
            session.clone(),
            reader,
            loop_inner.protocols.clone(),
            loop_inner.timing,
            loop_inner.shutdown.subscribe(),
        )
        .await;
        unregister(&loop_inner, &session, reason);
    });
    inner.tasks.lock().await.push(handle);
    Ok(())
}

/// Claim a pool slot. The identity check, duplicate check, and capacity
/// check all happen here, under the entry lock, so races between
/// concurrent establishments cannot overshoot the pool.
///
/// Crossed connections (both nodes dialing each other at once) would
/// otherwise kill each other on both ends: each side keeps the
/// connection initiated by the smaller identity, so exactly one
/// survives. Every other duplicate loses with `AlreadyConnected`.
fn register(inner: &Arc<Inner>, session: Arc<Session>, inbound: bool) -> Result<(), NetError> {
    let id = session.remote();
    let local = inner.keypair.id();
    if id == local {
        return Err(NetError::SelfConnection);
    }
    let mut entry = inner.pool.entry(id).or_default();
    if let Some(existing) = &entry.session {
        let new_initiator = if inbound { id } else { local };
        let existing_initiator = if entry.inbound { id } else { local };
        if existing_initiator <= new_initiator {
            return Err(NetError::DuplicateIdentity);
        }
        tracing::debug!(peer = %id, "crossed connection, replacing the losing direction");
        let replaced = existing.clone();
        entry.session = Some(session);
        entry.inbound = inbound;
        drop(entry);
        tokio::spawn(async move {
            replaced
                .disconnect(DisconnectReason::AlreadyConnected)
                .await;
        });
        return Ok(());
    }
    if inner.active.fetch_add(1, Ordering::SeqCst) >= inner.config.peers.max_peers {
        inner.active.fetch_sub(1, Ordering::SeqCst);
        return Err(NetError::CapacityExceeded);
    }
    entry.session = Some(session);
    entry.inbound = inbound;
    Ok(())
}

/// Release `session`'s slot. A session that was replaced by its crossed
/// twin is no longer the entry's current one; its end must not disturb
/// the survivor.
fn unregister(inner: &Arc<Inner>, session: &Arc<Session>, reason: DisconnectReason) {
    let id = session.remote();
    let mut current = false;
    if let Some(mut entry) = inner.pool.get_mut(&id) {
        current = entry
            .session
            .as_ref()
            .map_or(false, |held| Arc::ptr_eq(held, session));
        if current {
            entry.session = None;
            inner.active.fetch_sub(1, Ordering::SeqCst);
            apply_reputation(&mut entry, reason);
        }
    }
    if current {
        tracing::info!(peer = %id, %reason, "session closed");
        let _ = inner.events.send(PeerEvent::Disconnected { peer: id, reason });
    }
}

// ── Loops ─────────────────────────────────────────────────────────────────────

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("listener shutting down");
                    return;
                }
            }
            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    // Over capacity: drop before any crypto runs.
                    if inner.active.load(Ordering::SeqCst) >= inner.config.peers.max_peers {
                        tracing::debug!(%addr, "inbound rejected: session pool full");
                        let _ = inner.events.send(PeerEvent::InboundRejected {
                            addr,
                            reason: DisconnectReason::TooManyPeers,
                        });
                        continue;
                    }
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        if let Err(err) = accept_one(&inner, stream, addr).await {
                            tracing::debug!(%addr, error = %err, "inbound establishment failed");
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

async fn dial_loop(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut tick =
        tokio::time::interval(Duration::from_secs(inner.config.peers.dial_interval_secs));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("dialer shutting down");
                    return;
                }
            }
            _ = tick.tick() => {
                let free = inner
                    .config
                    .peers
                    .max_peers
                    .saturating_sub(inner.active.load(Ordering::SeqCst));
                if free == 0 {
                    continue;
                }
                let candidates = select_candidates(&inner).await;
                let dials = candidates.into_iter().take(free).map(|(id, addr)| {
                    let inner = inner.clone();
                    async move {
                        match connect(&inner, id, addr).await {
                            Ok(()) => {}
                            Err(err) => {
                                tracing::debug!(peer = %id, %addr, error = %err, "dial failed")
                            }
                        }
                    }
                });
                futures::future::join_all(dials).await;
            }
        }
    }
}

/// Non-connected candidates, bootnodes first, then table nodes closest
/// to us ordered by reputation. Banned and backing-off nodes are
/// filtered out.
async fn select_candidates(inner: &Arc<Inner>) -> Vec<(NodeId, SocketAddr)> {
    let now = Instant::now();
    let usable = |id: &NodeId| -> bool {
        if *id == inner.keypair.id() {
            return false;
        }
        match inner.pool.get(id) {
            Some(entry) => {
                entry.session.is_none()
                    && !entry.banned
                    && entry.backoff_until.map_or(true, |until| until <= now)
            }
            None => true,
        }
    };

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for (id, addr) in &inner.bootnodes {
        if usable(id) && seen.insert(*id) {
            out.push((*id, *addr));
        }
    }

    let local = inner.keypair.id().address();
    let known = inner.table.lock().await.closest(&local, 16);
    let mut scored: Vec<_> = known
        .into_iter()
        .filter(|entry| usable(&entry.id) && !seen.contains(&entry.id))
        .collect();
    scored.sort_by_key(|entry| {
        std::cmp::Reverse(inner.pool.get(&entry.id).map_or(0, |peer| peer.score))
    });
    out.extend(
        scored
            .into_iter()
            .map(|entry| (entry.id, entry.endpoint.tcp_addr())),
    );
    out
}

/// Parse `id-hex@ip:port` bootnode strings, skipping (and logging)
/// malformed ones.
fn parse_bootnodes(configured: &[String]) -> Vec<(NodeId, SocketAddr)> {
    let mut out = Vec::new();
    for text in configured {
        match parse_bootnode(text) {
            Some(parsed) => out.push(parsed),
            None => tracing::warn!(bootnode = %text, "ignoring malformed bootnode"),
        }
    }
    out
}

fn parse_bootnode(text: &str) -> Option<(NodeId, SocketAddr)> {
    let (id_hex, addr) = text.split_once('@')?;
    let bytes: [u8; 64] = hex::decode(id_hex).ok()?.try_into().ok()?;
    Some((NodeId::from_bytes(bytes), addr.parse().ok()?))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
