//! Typed message codecs, keyed by (capability, relative message id).
//!
//! Each entry is an independent encode/decode function pair — no shared
//! base type, no virtual dispatch. Sub-protocol crates register their
//! message types once; the session then moves opaque bytes and this
//! registry moves types.
//!
//! An unknown message id inside a known capability's range decodes to an
//! explicit [`Decoded::Unrecognized`] outcome, never an error: peers are
//! allowed to speak newer minor revisions at us. An id outside every
//! capability range is a dispatch error and never reaches this registry.

use std::any::Any;
use std::collections::HashMap;

use granite_core::rlp::{self, Item, RlpError};

/// A message type that crosses the wire under some (capability, id).
pub trait Payload: Any + Send + Sync + Sized {
    fn to_item(&self) -> Item;
    fn from_item(item: &Item) -> Result<Self, RlpError>;
}

/// Outcome of decoding an application message.
pub enum Decoded {
    /// A registered message, ready to downcast to its concrete type.
    Message(Box<dyn Any + Send + Sync>),
    /// Valid capability range, no codec registered for this id.
    Unrecognized { id: u64 },
}

impl Decoded {
    pub fn downcast<P: Payload>(self) -> Option<P> {
        match self {
            Decoded::Message(boxed) => boxed.downcast::<P>().ok().map(|b| *b),
            Decoded::Unrecognized { .. } => None,
        }
    }

    pub fn is_unrecognized(&self) -> bool {
        matches!(self, Decoded::Unrecognized { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("malformed payload: {0}")]
    Rlp(#[from] RlpError),

    #[error("message type does not match the registered codec")]
    TypeMismatch,

    #[error("no codec registered for {capability}/{id}")]
    NotRegistered { capability: String, id: u64 },
}

type EncodeFn = fn(&(dyn Any + Send + Sync)) -> Result<Vec<u8>, CodecError>;
type DecodeFn = fn(&[u8]) -> Result<Box<dyn Any + Send + Sync>, CodecError>;

struct CodecEntry {
    encode: EncodeFn,
    decode: DecodeFn,
}

fn encode_erased<P: Payload>(message: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, CodecError> {
    let message = message.downcast_ref::<P>().ok_or(CodecError::TypeMismatch)?;
    Ok(rlp::encode(&message.to_item()))
}

fn decode_erased<P: Payload>(payload: &[u8]) -> Result<Box<dyn Any + Send + Sync>, CodecError> {
    let item = rlp::decode(payload)?;
    Ok(Box::new(P::from_item(&item)?))
}

/// The codec registry: (capability name, relative id) → encode/decode.
#[derive(Default)]
pub struct CodecRegistry {
    entries: HashMap<(String, u64), CodecEntry>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `P` as the message type for `capability`/`id`.
    pub fn register<P: Payload>(&mut self, capability: &str, id: u64) {
        self.entries.insert(
            (capability.to_string(), id),
            CodecEntry {
                encode: encode_erased::<P>,
                decode: decode_erased::<P>,
            },
        );
    }

    /// Encode a typed message. Unregistered ids cannot be encoded —
    /// unlike decoding, sending a message nobody agreed on is a bug.
    pub fn encode(
        &self,
        capability: &str,
        id: u64,
        message: &(dyn Any + Send + Sync),
    ) -> Result<Vec<u8>, CodecError> {
        let entry = self
            .entries
            .get(&(capability.to_string(), id))
            .ok_or_else(|| CodecError::NotRegistered {
                capability: capability.to_string(),
                id,
            })?;
        (entry.encode)(message)
    }

    /// Decode a payload arriving under `capability`/`id`.
    pub fn decode(&self, capability: &str, id: u64, payload: &[u8]) -> Result<Decoded, CodecError> {
        match self.entries.get(&(capability.to_string(), id)) {
            Some(entry) => Ok(Decoded::Message((entry.decode)(payload)?)),
            None => Ok(Decoded::Unrecognized { id }),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
