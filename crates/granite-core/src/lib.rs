//! granite-core — wire contract, serialization, and cryptographic
//! primitives shared by both ends of every Granite connection.

pub mod config;
pub mod crypto;
pub mod rlp;
pub mod wire;

pub use crypto::{Keypair, NodeId};
pub use wire::{Capability, DisconnectReason, Endpoint, Hello};
