//! Error taxonomy for the network layer.
//!
//! Every per-session failure stays local to its session: the peer manager
//! maps it to a disconnect reason and moves on. Only listener allocation
//! failures propagate to the caller of [`crate::Network::start`].

use granite_core::crypto::CryptoError;
use granite_core::rlp::RlpError;
use granite_core::wire::DisconnectReason;
use thiserror::Error;

/// Handshake failures. No partial session survives any of these.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("auth signature does not match transmitted identity")]
    IdentityMismatch,

    #[error("remote identity is not the dialed identity")]
    UnexpectedIdentity,

    #[error("malformed handshake message: {0}")]
    Malformed(#[from] RlpError),

    #[error("handshake message under either wire framing failed to decrypt")]
    Undecodable,

    #[error("timed out waiting for the peer")]
    Timeout,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame-transport failures. All of them tear the session down with
/// `BreachOfProtocol`.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame MAC mismatch")]
    MacMismatch,

    #[error("declared length {0} exceeds the message cap")]
    Oversized(usize),

    #[error("unknown frame flag 0x{0:02x}")]
    BadFlag(u8),

    #[error("continuation frame without a pending message")]
    OrphanContinuation,

    #[error("new message started before the previous one completed")]
    InterleavedMessage,

    #[error("fragment exceeds the declared total length")]
    FragmentOverflow,

    #[error("malformed message id: {0}")]
    BadMessageId(#[from] RlpError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Discovery failures. None of these are fatal to the service; timed-out
/// queries are dropped silently.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("packet too short or too long")]
    BadLength,

    #[error("packet hash mismatch")]
    BadHash,

    #[error("packet signature invalid")]
    BadSignature,

    #[error("packet expired")]
    Expired,

    #[error("unknown packet type 0x{0:02x}")]
    UnknownKind(u8),

    #[error("malformed payload: {0}")]
    Malformed(#[from] RlpError),
}

/// Top-level error surfaced by the network front door.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("frame transport: {0}")]
    Frame(#[from] FrameError),

    #[error("expected hello, got message 0x{0:02x}")]
    UnexpectedMessage(u64),

    #[error("no shared capabilities with peer")]
    NoSharedCapabilities,

    #[error("peer speaks incompatible base protocol version {0}")]
    IncompatibleVersion(u64),

    #[error("session pool is full")]
    CapacityExceeded,

    #[error("peer already has an active session")]
    DuplicateIdentity,

    #[error("refusing to connect to self")]
    SelfConnection,

    #[error("capability {0} not negotiated on this session")]
    CapabilityNotNegotiated(String),

    #[error("codec: {0}")]
    Codec(#[from] crate::codec::CodecError),

    #[error("remote disconnected: {0}")]
    RemoteDisconnect(DisconnectReason),

    #[error("session closed")]
    Closed,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// The disconnect reason this error puts on the wire, if the session
    /// is far enough along to send one.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            NetError::Frame(_) | NetError::UnexpectedMessage(_) | NetError::Codec(_) => {
                DisconnectReason::BreachOfProtocol
            }
            NetError::NoSharedCapabilities => DisconnectReason::UselessPeer,
            NetError::IncompatibleVersion(_) => DisconnectReason::IncompatibleP2PVersion,
            NetError::CapacityExceeded => DisconnectReason::TooManyPeers,
            NetError::DuplicateIdentity => DisconnectReason::AlreadyConnected,
            NetError::SelfConnection => DisconnectReason::IdentitySameAsSelf,
            NetError::Handshake(HandshakeError::UnexpectedIdentity) => {
                DisconnectReason::UnexpectedIdentity
            }
            NetError::Handshake(_) | NetError::Io(_) => DisconnectReason::TcpSubsystemError,
            NetError::RemoteDisconnect(reason) => *reason,
            NetError::CapabilityNotNegotiated(_) => DisconnectReason::Other,
            NetError::Closed => DisconnectReason::DisconnectRequested,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_to_reason_mapping() {
        assert_eq!(
            NetError::Frame(FrameError::MacMismatch).disconnect_reason(),
            DisconnectReason::BreachOfProtocol
        );
        assert_eq!(
            NetError::NoSharedCapabilities.disconnect_reason(),
            DisconnectReason::UselessPeer
        );
        assert_eq!(
            NetError::CapacityExceeded.disconnect_reason(),
            DisconnectReason::TooManyPeers
        );
        assert_eq!(
            NetError::DuplicateIdentity.disconnect_reason(),
            DisconnectReason::AlreadyConnected
        );
        assert_eq!(
            NetError::SelfConnection.disconnect_reason(),
            DisconnectReason::IdentitySameAsSelf
        );
    }
}
