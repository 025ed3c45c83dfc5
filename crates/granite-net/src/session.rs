//! The live session: lifecycle state machine, per-session send lock,
//! base-protocol keepalive, and inbound dispatch.
//!
//! All outbound frames pass through one `tokio::sync::Mutex` around the
//! frame writer — concurrent senders serialize, never interleave, which
//! is what keeps the running MAC stream ordered. Inbound frames are read
//! by a single task per session; decoded application messages cross to
//! collaborators over mpsc channels, one per registered sub-protocol.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};

use granite_core::rlp::{self, Item};
use granite_core::wire::{
    DisconnectReason, Hello, BASE_PROTOCOL_SPACE, MSG_DISCONNECT, MSG_HELLO, MSG_PING, MSG_PONG,
};
use granite_core::NodeId;

use crate::capability::{CapabilitySet, SupportedCapability};
use crate::codec::{CodecRegistry, Decoded};
use crate::error::{FrameError, NetError};
use crate::framing::{FrameReader, FrameWriter};

/// Boxed stream halves so sessions run over TCP in production and
/// in-memory duplex pipes in tests.
pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

// ── Lifecycle ─────────────────────────────────────────────────────────────────

/// Connection lifecycle. Application sends and dispatch happen only in
/// `Active`; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    NegotiatingCapabilities,
    Active,
    Disconnecting,
    Closed,
}

impl SessionState {
    /// Whether `next` is a legal successor of this state. Teardown from
    /// any live state passes through `Disconnecting`; nothing leaves
    /// `Closed`.
    pub fn can_advance(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Handshaking)
                | (Handshaking, NegotiatingCapabilities)
                | (NegotiatingCapabilities, Active)
                | (
                    Connecting | Handshaking | NegotiatingCapabilities | Active,
                    Disconnecting
                )
                | (Disconnecting, Closed)
        )
    }
}

/// Shared, observable lifecycle state of one connection. Illegal
/// transitions are ignored, so terminal states stick.
#[derive(Clone)]
pub struct StateCell {
    tx: Arc<watch::Sender<SessionState>>,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(SessionState::Connecting).0),
        }
    }

    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// Advance to `next` if the transition is legal. Returns whether the
    /// state changed.
    pub fn advance(&self, next: SessionState) -> bool {
        let mut advanced = false;
        self.tx.send_modify(|state| {
            if state.can_advance(next) {
                *state = next;
                advanced = true;
            }
        });
        advanced
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

// ── Disconnect payload ────────────────────────────────────────────────────────

/// Decode a disconnect payload: `rlp([reason])`, tolerating the bare
/// scalar form some peers send. Anything unreadable maps to `Other`.
pub fn parse_disconnect(payload: &[u8]) -> DisconnectReason {
    let Ok(item) = rlp::decode(payload) else {
        return DisconnectReason::Other;
    };
    let code = item
        .at(0)
        .and_then(|inner| inner.as_u64())
        .or_else(|_| item.as_u64());
    match code {
        Ok(code) => u8::try_from(code)
            .ok()
            .and_then(|code| DisconnectReason::try_from(code).ok())
            .unwrap_or(DisconnectReason::Other),
        Err(_) => DisconnectReason::Other,
    }
}

pub fn encode_disconnect(reason: DisconnectReason) -> Vec<u8> {
    rlp::encode(&Item::list(vec![Item::u64(reason.code() as u64)]))
}

fn empty_list() -> Vec<u8> {
    rlp::encode(&Item::List(Vec::new()))
}

// ── Collaborator handoff ──────────────────────────────────────────────────────

/// One registered sub-protocol: the capability this node advertises for
/// it and the channel its decoded inbound messages are delivered on.
pub struct Protocol {
    pub capability: SupportedCapability,
    pub inbound: mpsc::Sender<InboundMessage>,
}

/// A decoded application message crossing to a collaborator, in arrival
/// order per session.
pub struct InboundMessage {
    pub peer: NodeId,
    pub capability: String,
    /// Message id relative to the capability's offset.
    pub id: u64,
    pub message: Decoded,
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Timing knobs of a live session, resolved from `NetConfig`.
#[derive(Debug, Clone, Copy)]
pub struct SessionTiming {
    pub ping_interval: Duration,
    pub read_timeout: Duration,
}

/// An established, authenticated connection to one remote node.
pub struct Session {
    remote: NodeId,
    remote_hello: Hello,
    caps: CapabilitySet,
    registry: Arc<CodecRegistry>,
    writer: Mutex<FrameWriter<BoxedWrite>>,
    state: StateCell,
}

impl Session {
    pub fn new(
        remote: NodeId,
        remote_hello: Hello,
        caps: CapabilitySet,
        registry: Arc<CodecRegistry>,
        writer: FrameWriter<BoxedWrite>,
        state: StateCell,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            remote_hello,
            caps,
            registry,
            writer: Mutex::new(writer),
            state,
        })
    }

    pub fn remote(&self) -> NodeId {
        self.remote
    }

    pub fn remote_hello(&self) -> &Hello {
        &self.remote_hello
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.caps
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Encode a typed message and send it under its capability's wire-id
    /// range. Only legal in `Active`.
    pub async fn send(
        &self,
        capability: &str,
        id: u64,
        message: &(dyn Any + Send + Sync),
    ) -> Result<(), NetError> {
        if self.state.get() != SessionState::Active {
            return Err(NetError::Closed);
        }
        let cap = self
            .caps
            .get(capability)
            .ok_or_else(|| NetError::CapabilityNotNegotiated(capability.to_string()))?;
        let payload = self.registry.encode(capability, id, message)?;
        self.send_wire(cap.offset + id, &payload).await
    }

    /// Send a raw frame by absolute wire id, serialized behind the
    /// session's send lock.
    async fn send_wire(&self, wire_id: u64, payload: &[u8]) -> Result<(), NetError> {
        let mut writer = self.writer.lock().await;
        writer.send(wire_id, payload).await?;
        Ok(())
    }

    /// Announce `reason` to the peer and close. Best-effort on the wire;
    /// the state always ends at `Closed`.
    pub async fn disconnect(&self, reason: DisconnectReason) {
        if !self.state.advance(SessionState::Disconnecting) {
            return;
        }
        tracing::debug!(peer = %self.remote, %reason, "disconnecting");
        let mut writer = self.writer.lock().await;
        let _ = writer.send(MSG_DISCONNECT, &encode_disconnect(reason)).await;
        let _ = writer.shutdown().await;
        self.state.advance(SessionState::Closed);
    }

    /// Close without sending anything — the peer already disconnected or
    /// the transport is gone.
    async fn close(&self) {
        if !self.state.advance(SessionState::Disconnecting) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        self.state.advance(SessionState::Closed);
    }

    /// Route one inbound message. `Ok(Some(reason))` means the remote
    /// disconnected; errors are protocol violations that tear the
    /// session down.
    async fn dispatch(
        &self,
        wire_id: u64,
        payload: Vec<u8>,
        protocols: &[Protocol],
    ) -> Result<Option<DisconnectReason>, NetError> {
        match wire_id {
            MSG_PING => {
                let _ = self.send_wire(MSG_PONG, &empty_list()).await;
                Ok(None)
            }
            MSG_PONG => Ok(None),
            MSG_DISCONNECT => Ok(Some(parse_disconnect(&payload))),
            // A second hello after negotiation is a protocol violation.
            MSG_HELLO => Err(NetError::UnexpectedMessage(MSG_HELLO)),
            id if id < BASE_PROTOCOL_SPACE => {
                tracing::trace!(peer = %self.remote, id, "ignoring reserved base-protocol message");
                Ok(None)
            }
            id => {
                let Some((cap, rel)) = self.caps.resolve(id) else {
                    return Err(NetError::UnexpectedMessage(id));
                };
                let decoded = self.registry.decode(&cap.name, rel, &payload)?;
                if decoded.is_unrecognized() {
                    tracing::trace!(peer = %self.remote, cap = %cap.name, id = rel, "unrecognized message id");
                }
                if let Some(proto) = protocols.iter().find(|p| p.capability.name == cap.name) {
                    let _ = proto
                        .inbound
                        .send(InboundMessage {
                            peer: self.remote,
                            capability: cap.name.clone(),
                            id: rel,
                            message: decoded,
                        })
                        .await;
                }
                Ok(None)
            }
        }
    }
}

// ── Read loop ─────────────────────────────────────────────────────────────────

/// Drive a session until it ends, returning the disconnect reason.
///
/// Owns the read half; sends keepalive pings on `ping_interval` and
/// drops the session after `read_timeout` of frame silence. A shutdown
/// signal sends `ClientQuitting` best-effort and closes.
pub async fn read_loop(
    session: Arc<Session>,
    mut reader: FrameReader<BoxedRead>,
    protocols: Arc<Vec<Protocol>>,
    timing: SessionTiming,
    mut shutdown: watch::Receiver<bool>,
) -> DisconnectReason {
    let mut keepalive = tokio::time::interval(timing.ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    keepalive.reset();
    let mut last_frame = Instant::now();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                // A dropped sender means the network is gone; quit either way.
                if changed.is_err() || *shutdown.borrow() {
                    session.disconnect(DisconnectReason::ClientQuitting).await;
                    return DisconnectReason::ClientQuitting;
                }
            }

            _ = keepalive.tick() => {
                if last_frame.elapsed() >= timing.read_timeout {
                    tracing::debug!(peer = %session.remote, "read timeout");
                    session.disconnect(DisconnectReason::ReceiveMessageTimeout).await;
                    return DisconnectReason::ReceiveMessageTimeout;
                }
                let _ = session.send_wire(MSG_PING, &empty_list()).await;
            }

            result = reader.recv() => match result {
                Ok((wire_id, payload)) => {
                    last_frame = Instant::now();
                    match session.dispatch(wire_id, payload, &protocols).await {
                        Ok(None) => {}
                        Ok(Some(reason)) => {
                            tracing::debug!(peer = %session.remote, %reason, "remote disconnected");
                            session.close().await;
                            return reason;
                        }
                        Err(err) => {
                            let reason = err.disconnect_reason();
                            tracing::warn!(peer = %session.remote, error = %err, "session violation");
                            session.disconnect(reason).await;
                            return reason;
                        }
                    }
                }
                Err(err) => {
                    // MAC mismatches and framing violations are breaches;
                    // an io error means the transport already died.
                    let reason = match &err {
                        FrameError::Io(_) => DisconnectReason::TcpSubsystemError,
                        _ => DisconnectReason::BreachOfProtocol,
                    };
                    tracing::debug!(peer = %session.remote, error = %err, "transport ended");
                    session.close().await;
                    return reason;
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
