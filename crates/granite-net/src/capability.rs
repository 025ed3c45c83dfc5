//! Capability negotiation: the hello exchange and message-id space
//! assignment that configure dispatch on a fresh transport.
//!
//! Both sides advertise (name, version) pairs. The negotiated set is the
//! intersection, deduplicated by name keeping the highest shared version,
//! sorted by name — so both ends compute identical offsets regardless of
//! who initiated.

use tokio::io::{AsyncRead, AsyncWrite};

use granite_core::rlp;
use granite_core::wire::{
    Capability, Hello, BASE_PROTOCOL_SPACE, BASE_PROTOCOL_VERSION, MSG_DISCONNECT, MSG_HELLO,
};
use granite_core::NodeId;

use crate::error::{HandshakeError, NetError};
use crate::framing::{FrameReader, FrameWriter};
use crate::session;

/// A sub-protocol this node can speak, with the size of its message-id
/// space (needed to lay out dispatch offsets).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedCapability {
    pub name: String,
    pub version: u64,
    pub message_count: u64,
}

impl SupportedCapability {
    pub fn new(name: &str, version: u64, message_count: u64) -> Self {
        Self {
            name: name.to_string(),
            version,
            message_count,
        }
    }

    pub fn advertised(&self) -> Capability {
        Capability {
            name: self.name.clone(),
            version: self.version,
        }
    }
}

/// A capability both sides agreed on, pinned to its wire-id range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedCapability {
    pub name: String,
    pub version: u64,
    pub message_count: u64,
    pub offset: u64,
}

/// The negotiated capability table of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    caps: Vec<NegotiatedCapability>,
}

impl CapabilitySet {
    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NegotiatedCapability> {
        self.caps.iter()
    }

    pub fn get(&self, name: &str) -> Option<&NegotiatedCapability> {
        self.caps.iter().find(|c| c.name == name)
    }

    /// Map a wire message id to its capability and relative id.
    ///
    /// Ids below [`BASE_PROTOCOL_SPACE`] belong to the base protocol and
    /// resolve to `None`, as do ids beyond every assigned range.
    pub fn resolve(&self, msg_id: u64) -> Option<(&NegotiatedCapability, u64)> {
        self.caps
            .iter()
            .find(|c| msg_id >= c.offset && msg_id < c.offset + c.message_count)
            .map(|c| (c, msg_id - c.offset))
    }
}

/// Intersect the local and remote capability lists.
///
/// Offsets are the running sum of message-space sizes over the name-sorted
/// set, starting just past the base-protocol range.
pub fn negotiate(local: &[SupportedCapability], remote: &[Capability]) -> CapabilitySet {
    let mut chosen: Vec<NegotiatedCapability> = Vec::new();
    for cap in local {
        let shared = remote
            .iter()
            .any(|r| r.name == cap.name && r.version == cap.version);
        if !shared {
            continue;
        }
        match chosen.iter_mut().find(|c| c.name == cap.name) {
            Some(existing) if existing.version >= cap.version => {}
            Some(existing) => {
                existing.version = cap.version;
                existing.message_count = cap.message_count;
            }
            None => chosen.push(NegotiatedCapability {
                name: cap.name.clone(),
                version: cap.version,
                message_count: cap.message_count,
                offset: 0,
            }),
        }
    }

    chosen.sort_by(|a, b| a.name.cmp(&b.name));
    let mut offset = BASE_PROTOCOL_SPACE;
    for cap in &mut chosen {
        cap.offset = offset;
        offset += cap.message_count;
    }
    CapabilitySet { caps: chosen }
}

/// Exchange hellos over a live transport and negotiate.
///
/// `expected_id` is the identity the crypto handshake established; a
/// hello claiming anything else is a protocol violation. Fails with
/// `IncompatibleVersion` on a base-protocol mismatch and
/// `NoSharedCapabilities` on an empty intersection.
pub async fn exchange<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    local_hello: &Hello,
    local_caps: &[SupportedCapability],
    expected_id: &NodeId,
) -> Result<(Hello, CapabilitySet), NetError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer
        .send(MSG_HELLO, &rlp::encode(&local_hello.to_item()))
        .await?;

    let (msg_id, payload) = reader.recv().await?;
    if msg_id == MSG_DISCONNECT {
        return Err(NetError::RemoteDisconnect(session::parse_disconnect(
            &payload,
        )));
    }
    if msg_id != MSG_HELLO {
        return Err(NetError::UnexpectedMessage(msg_id));
    }

    let item = rlp::decode(&payload).map_err(HandshakeError::Malformed)?;
    let remote_hello = Hello::from_item(&item).map_err(HandshakeError::Malformed)?;

    if remote_hello.protocol_version != BASE_PROTOCOL_VERSION {
        return Err(NetError::IncompatibleVersion(remote_hello.protocol_version));
    }
    if remote_hello.node_id != *expected_id {
        return Err(NetError::Handshake(HandshakeError::UnexpectedIdentity));
    }

    let negotiated = negotiate(local_caps, &remote_hello.capabilities);
    if negotiated.is_empty() {
        return Err(NetError::NoSharedCapabilities);
    }
    tracing::debug!(
        remote = %remote_hello.node_id,
        caps = ?negotiated.caps.iter().map(|c| format!("{}/{}", c.name, c.version)).collect::<Vec<_>>(),
        "capabilities negotiated"
    );
    Ok((remote_hello, negotiated))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
