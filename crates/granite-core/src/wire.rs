//! Granite wire contract — constants and message types both ends of a
//! connection must agree on.
//!
//! Every numeric value here is part of the wire format. The disconnect
//! reason codes in particular are matched byte-for-byte by remote peers;
//! changing any of them is a breaking protocol change.

use std::fmt;
use std::net::IpAddr;

use crate::crypto::NodeId;
use crate::rlp::{Item, RlpError};

// ── Base protocol ─────────────────────────────────────────────────────────────

/// Version of the base (capability-negotiation) protocol, carried in Hello.
pub const BASE_PROTOCOL_VERSION: u64 = 5;

/// Base-protocol message ids. Everything below `BASE_PROTOCOL_SPACE` is
/// transport-level; negotiated capabilities are assigned offsets above it.
pub const MSG_HELLO: u64 = 0x00;
pub const MSG_DISCONNECT: u64 = 0x01;
pub const MSG_PING: u64 = 0x02;
pub const MSG_PONG: u64 = 0x03;

/// Message-id space reserved for the base protocol.
pub const BASE_PROTOCOL_SPACE: u64 = 0x10;

// ── Frame geometry ────────────────────────────────────────────────────────────

/// Size of the encrypted frame header.
pub const FRAME_HEADER_SIZE: usize = 16;

/// Size of the MAC appended to the header and to the body.
pub const FRAME_MAC_SIZE: usize = 16;

/// Logical messages longer than this are split across physical frames.
pub const MAX_FRAME_BODY: usize = 16 * 1024;

/// Hard cap on any declared frame or message length. Frames claiming more
/// tear the session down before a single byte is buffered.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

// ── Discovery ─────────────────────────────────────────────────────────────────

/// Maximum UDP discovery packet size.
pub const DISCOVERY_MAX_PACKET: usize = 1280;

/// Seconds before a discovery packet's expiration timestamp lapses.
pub const DISCOVERY_EXPIRATION_SECS: u64 = 60;

/// Neighbours entries per packet, sized to the datagram budget.
pub const MAX_NEIGHBOURS_PER_PACKET: usize = 12;

// ── Disconnect reasons ────────────────────────────────────────────────────────

/// Enumerated session-termination cause, sent in the Disconnect message.
///
/// The numeric codes are the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DisconnectReason {
    DisconnectRequested = 0x00,
    TcpSubsystemError = 0x01,
    BreachOfProtocol = 0x02,
    UselessPeer = 0x03,
    TooManyPeers = 0x04,
    AlreadyConnected = 0x05,
    IncompatibleP2PVersion = 0x06,
    NullNodeIdentity = 0x07,
    ClientQuitting = 0x08,
    UnexpectedIdentity = 0x09,
    IdentitySameAsSelf = 0x0a,
    ReceiveMessageTimeout = 0x0b,
    Other = 0x10,
}

impl DisconnectReason {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for DisconnectReason {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use DisconnectReason::*;
        Ok(match value {
            0x00 => DisconnectRequested,
            0x01 => TcpSubsystemError,
            0x02 => BreachOfProtocol,
            0x03 => UselessPeer,
            0x04 => TooManyPeers,
            0x05 => AlreadyConnected,
            0x06 => IncompatibleP2PVersion,
            0x07 => NullNodeIdentity,
            0x08 => ClientQuitting,
            0x09 => UnexpectedIdentity,
            0x0a => IdentitySameAsSelf,
            0x0b => ReceiveMessageTimeout,
            0x10 => Other,
            other => return Err(WireError::UnknownDisconnectReason(other)),
        })
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::DisconnectRequested => "disconnect requested",
            DisconnectReason::TcpSubsystemError => "TCP subsystem error",
            DisconnectReason::BreachOfProtocol => "breach of protocol",
            DisconnectReason::UselessPeer => "useless peer",
            DisconnectReason::TooManyPeers => "too many peers",
            DisconnectReason::AlreadyConnected => "already connected",
            DisconnectReason::IncompatibleP2PVersion => "incompatible p2p version",
            DisconnectReason::NullNodeIdentity => "null node identity",
            DisconnectReason::ClientQuitting => "client quitting",
            DisconnectReason::UnexpectedIdentity => "unexpected identity",
            DisconnectReason::IdentitySameAsSelf => "identity is own identity",
            DisconnectReason::ReceiveMessageTimeout => "receive message timeout",
            DisconnectReason::Other => "other",
        };
        f.write_str(s)
    }
}

// ── Endpoint ──────────────────────────────────────────────────────────────────

/// A node's reachable address: IP plus the UDP (discovery) and TCP
/// (session) ports. Appears in discovery payloads; last-seen wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, udp_port: u16, tcp_port: u16) -> Self {
        Self {
            ip,
            udp_port,
            tcp_port,
        }
    }

    pub fn udp_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.udp_port)
    }

    pub fn tcp_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.tcp_port)
    }

    pub fn to_item(&self) -> Item {
        let ip = match self.ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        Item::list(vec![
            Item::Bytes(ip),
            Item::u16(self.udp_port),
            Item::u16(self.tcp_port),
        ])
    }

    pub fn from_item(item: &Item) -> Result<Self, RlpError> {
        let ip_bytes = item.at(0)?.as_bytes()?;
        let ip = match ip_bytes.len() {
            4 => {
                let octets: [u8; 4] = ip_bytes.try_into().expect("length checked");
                IpAddr::from(octets)
            }
            16 => {
                let octets: [u8; 16] = ip_bytes.try_into().expect("length checked");
                IpAddr::from(octets)
            }
            found => {
                return Err(RlpError::WrongSize {
                    expected: 4,
                    found,
                })
            }
        };
        Ok(Self {
            ip,
            udp_port: item.at(1)?.as_u16()?,
            tcp_port: item.at(2)?.as_u16()?,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.ip, self.udp_port, self.tcp_port)
    }
}

// ── Capability ────────────────────────────────────────────────────────────────

/// A (name, version) sub-protocol pair as advertised in Hello.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Capability {
    pub name: String,
    pub version: u64,
}

impl Capability {
    pub fn new(name: &str, version: u64) -> Self {
        Self {
            name: name.to_string(),
            version,
        }
    }

    pub fn to_item(&self) -> Item {
        Item::list(vec![Item::str(&self.name), Item::u64(self.version)])
    }

    pub fn from_item(item: &Item) -> Result<Self, RlpError> {
        Ok(Self {
            name: item.at(0)?.as_str()?.to_string(),
            version: item.at(1)?.as_u64()?,
        })
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

// ── Hello ─────────────────────────────────────────────────────────────────────

/// First message on a live transport: advertises the base-protocol
/// version, the client, the capability list, the session listen port, and
/// the node's public identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub protocol_version: u64,
    pub client_id: String,
    pub capabilities: Vec<Capability>,
    pub listen_port: u16,
    pub node_id: NodeId,
}

impl Hello {
    pub fn to_item(&self) -> Item {
        Item::list(vec![
            Item::u64(self.protocol_version),
            Item::str(&self.client_id),
            Item::List(self.capabilities.iter().map(Capability::to_item).collect()),
            Item::u16(self.listen_port),
            Item::bytes(self.node_id.as_bytes()),
        ])
    }

    pub fn from_item(item: &Item) -> Result<Self, RlpError> {
        let capabilities = item
            .at(2)?
            .as_list()?
            .iter()
            .map(Capability::from_item)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            protocol_version: item.at(0)?.as_u64()?,
            client_id: item.at(1)?.as_str()?.to_string(),
            capabilities,
            listen_port: item.at(3)?.as_u16()?,
            node_id: NodeId::from_bytes(item.at(4)?.as_array()?),
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors interpreting wire-level values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown disconnect reason: 0x{0:02x}")]
    UnknownDisconnectReason(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::rlp;

    #[test]
    fn disconnect_reason_codes_are_wire_exact() {
        assert_eq!(DisconnectReason::DisconnectRequested.code(), 0x00);
        assert_eq!(DisconnectReason::BreachOfProtocol.code(), 0x02);
        assert_eq!(DisconnectReason::UselessPeer.code(), 0x03);
        assert_eq!(DisconnectReason::TooManyPeers.code(), 0x04);
        assert_eq!(DisconnectReason::AlreadyConnected.code(), 0x05);
        assert_eq!(DisconnectReason::IncompatibleP2PVersion.code(), 0x06);
        assert_eq!(DisconnectReason::IdentitySameAsSelf.code(), 0x0a);
        assert_eq!(DisconnectReason::ReceiveMessageTimeout.code(), 0x0b);
        assert_eq!(DisconnectReason::Other.code(), 0x10);
    }

    #[test]
    fn disconnect_reason_roundtrip() {
        for code in (0x00..=0x0b).chain([0x10]) {
            let reason = DisconnectReason::try_from(code).unwrap();
            assert_eq!(reason.code(), code);
        }
    }

    #[test]
    fn unknown_disconnect_reason_rejected() {
        assert_eq!(
            DisconnectReason::try_from(0x0c),
            Err(WireError::UnknownDisconnectReason(0x0c))
        );
        assert!(DisconnectReason::try_from(0xff).is_err());
    }

    #[test]
    fn endpoint_v4_roundtrip() {
        let ep = Endpoint::new("10.3.58.6".parse().unwrap(), 30303, 30303);
        let bytes = rlp::encode(&ep.to_item());
        let back = Endpoint::from_item(&rlp::decode(&bytes).unwrap()).unwrap();
        assert_eq!(back, ep);
    }

    #[test]
    fn endpoint_v6_roundtrip() {
        let ep = Endpoint::new("fe80::1".parse().unwrap(), 30303, 30304);
        let back = Endpoint::from_item(&ep.to_item()).unwrap();
        assert_eq!(back, ep);
    }

    #[test]
    fn endpoint_bad_ip_width_rejected() {
        let item = Item::list(vec![
            Item::Bytes(vec![1, 2, 3]),
            Item::u16(1),
            Item::u16(2),
        ]);
        assert!(Endpoint::from_item(&item).is_err());
    }

    #[test]
    fn hello_roundtrip() {
        let kp = Keypair::generate();
        let hello = Hello {
            protocol_version: BASE_PROTOCOL_VERSION,
            client_id: "granite/0.1.0".to_string(),
            capabilities: vec![Capability::new("eth", 63), Capability::new("snap", 1)],
            listen_port: 30303,
            node_id: kp.id(),
        };
        let bytes = rlp::encode(&hello.to_item());
        let back = Hello::from_item(&rlp::decode(&bytes).unwrap()).unwrap();
        assert_eq!(back, hello);
    }

    #[test]
    fn hello_with_no_capabilities_roundtrip() {
        let kp = Keypair::generate();
        let hello = Hello {
            protocol_version: BASE_PROTOCOL_VERSION,
            client_id: String::new(),
            capabilities: Vec::new(),
            listen_port: 0,
            node_id: kp.id(),
        };
        let back = Hello::from_item(&hello.to_item()).unwrap();
        assert_eq!(back, hello);
    }
}
