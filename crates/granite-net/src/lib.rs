//! granite-net — the Granite peer-to-peer engine.
//!
//! Everything between a raw socket and a typed sub-protocol message
//! lives here: the authenticated key-agreement handshake, the encrypted
//! frame transport with its running MACs, capability negotiation and
//! message-id dispatch, the XOR-distance node table, UDP discovery, and
//! the peer manager that ties them into a bounded session pool.
//!
//! The library is driven through [`Network::start`], which returns a
//! [`NetworkHandle`]. Sub-protocols (sync, tx-pool) register a
//! [`Protocol`] per capability and receive decoded messages over its
//! channel; they never touch sockets or key material.

pub mod capability;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod peerman;
pub mod session;
pub mod table;

pub use capability::{CapabilitySet, NegotiatedCapability, SupportedCapability};
pub use codec::{CodecRegistry, Decoded, Payload};
pub use error::{DiscoveryError, FrameError, HandshakeError, NetError};
pub use peerman::{Network, NetworkHandle, PeerEvent, PeerInfo};
pub use session::{InboundMessage, Protocol, Session, SessionState};
