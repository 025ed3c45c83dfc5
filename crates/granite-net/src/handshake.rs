//! The session handshake: mutual authentication and key agreement.
//!
//! The initiator seals an auth message to the responder's static key; the
//! responder proves nothing in advance — its identity is already known to
//! the dialer — and answers with an ack. Both sides then derive one
//! AES-256 key and one running-MAC seed per direction. The derivation is
//! order-sensitive, so the initiator's egress pair is the responder's
//! ingress pair and vice versa.
//!
//! Two wire encodings exist and both must be accepted:
//!   * legacy: fixed-size ECIES envelope, no prefix (auth 338, ack 209)
//!   * padded: 2-byte size prefix + ECIES envelope over an RLP body with
//!     random padding; the prefix is authenticated as associated data
//! Receivers detect the framing by attempting both decodings. Replies use
//! whichever framing the peer's message arrived in.

use std::time::Duration;

use rand::{Rng, RngCore};
use secp256k1::PublicKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::{Zeroize, ZeroizeOnDrop};

use granite_core::crypto::{self, ecies_seal, Hasher, Keypair, NodeId, ECIES_OVERHEAD};
use granite_core::rlp::{self, Item};

use crate::error::HandshakeError;

/// Handshake wire version carried in the padded body.
const HANDSHAKE_VERSION: u64 = 4;

/// Legacy auth plaintext: sig(65) ‖ static(64) ‖ ephemeral(64) ‖ nonce(32).
const AUTH_BODY_LEN: usize = 65 + 64 + 64 + 32;
const AUTH_FIXED_LEN: usize = AUTH_BODY_LEN + ECIES_OVERHEAD;

/// Legacy ack plaintext: ephemeral(64) ‖ nonce(32).
const ACK_BODY_LEN: usize = 64 + 32;
const ACK_FIXED_LEN: usize = ACK_BODY_LEN + ECIES_OVERHEAD;

/// Upper bound on a padded handshake message (prefix value).
const MAX_PADDED_LEN: usize = 2048;

/// Random padding appended to padded bodies before sealing.
const PAD_RANGE: std::ops::RangeInclusive<usize> = 100..=250;

// ── Messages ──────────────────────────────────────────────────────────────────

/// Which wire encoding a handshake message arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Legacy,
    Padded,
}

/// Initiator → responder.
///
/// The signature is recoverable ECDSA by the STATIC key over
/// keccak256(ephemeral ‖ nonce); the responder recovers the signer and
/// requires it to equal `static_id`, which lets it authenticate a peer it
/// has never seen before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthMessage {
    pub signature: [u8; 65],
    pub static_id: NodeId,
    pub ephemeral_id: NodeId,
    pub nonce: [u8; 32],
}

/// Responder → initiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMessage {
    pub ephemeral_id: NodeId,
    pub nonce: [u8; 32],
}

impl AuthMessage {
    fn legacy_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(AUTH_BODY_LEN);
        body.extend_from_slice(&self.signature);
        body.extend_from_slice(self.static_id.as_bytes());
        body.extend_from_slice(self.ephemeral_id.as_bytes());
        body.extend_from_slice(&self.nonce);
        body
    }

    fn from_legacy_body(body: &[u8]) -> Result<Self, HandshakeError> {
        if body.len() != AUTH_BODY_LEN {
            return Err(HandshakeError::Undecodable);
        }
        Ok(Self {
            signature: body[..65].try_into().expect("length checked"),
            static_id: NodeId::from_bytes(body[65..129].try_into().expect("length checked")),
            ephemeral_id: NodeId::from_bytes(body[129..193].try_into().expect("length checked")),
            nonce: body[193..].try_into().expect("length checked"),
        })
    }

    fn padded_body(&self) -> Item {
        Item::list(vec![
            Item::bytes(self.signature),
            Item::bytes(self.static_id.as_bytes()),
            Item::bytes(self.ephemeral_id.as_bytes()),
            Item::bytes(self.nonce),
            Item::u64(HANDSHAKE_VERSION),
        ])
    }

    fn from_padded_body(item: &Item) -> Result<Self, HandshakeError> {
        Ok(Self {
            signature: item.at(0)?.as_array()?,
            static_id: NodeId::from_bytes(item.at(1)?.as_array()?),
            ephemeral_id: NodeId::from_bytes(item.at(2)?.as_array()?),
            nonce: item.at(3)?.as_array()?,
        })
    }

    /// The digest the auth signature covers.
    pub fn signed_digest(ephemeral_id: &NodeId, nonce: &[u8; 32]) -> [u8; 32] {
        let mut h = Hasher::new();
        h.update(ephemeral_id.as_bytes());
        h.update(nonce);
        h.finalize()
    }
}

impl AckMessage {
    fn legacy_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(ACK_BODY_LEN);
        body.extend_from_slice(self.ephemeral_id.as_bytes());
        body.extend_from_slice(&self.nonce);
        body
    }

    fn from_legacy_body(body: &[u8]) -> Result<Self, HandshakeError> {
        if body.len() != ACK_BODY_LEN {
            return Err(HandshakeError::Undecodable);
        }
        Ok(Self {
            ephemeral_id: NodeId::from_bytes(body[..64].try_into().expect("length checked")),
            nonce: body[64..].try_into().expect("length checked"),
        })
    }

    fn padded_body(&self) -> Item {
        Item::list(vec![
            Item::bytes(self.ephemeral_id.as_bytes()),
            Item::bytes(self.nonce),
            Item::u64(HANDSHAKE_VERSION),
        ])
    }

    fn from_padded_body(item: &Item) -> Result<Self, HandshakeError> {
        Ok(Self {
            ephemeral_id: NodeId::from_bytes(item.at(0)?.as_array()?),
            nonce: item.at(1)?.as_array()?,
        })
    }
}

// ── Sealing ───────────────────────────────────────────────────────────────────

fn seal_legacy(body: &[u8], recipient: &PublicKey) -> Vec<u8> {
    ecies_seal(recipient, body, b"")
}

/// Seal an RLP body with random padding under a size-prefixed envelope.
fn seal_padded(body: &Item, recipient: &PublicKey) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut plaintext = rlp::encode(body);
    let pad_len = rng.gen_range(PAD_RANGE);
    let mut padding = vec![0u8; pad_len];
    rng.fill_bytes(&mut padding);
    plaintext.extend_from_slice(&padding);

    let envelope_len = plaintext.len() + ECIES_OVERHEAD;
    let prefix = (envelope_len as u16).to_be_bytes();
    let envelope = ecies_seal(recipient, &plaintext, &prefix);

    let mut out = Vec::with_capacity(2 + envelope.len());
    out.extend_from_slice(&prefix);
    out.extend_from_slice(&envelope);
    out
}

pub(crate) fn seal_auth(
    auth: &AuthMessage,
    recipient: &PublicKey,
    framing: Framing,
) -> Vec<u8> {
    match framing {
        Framing::Legacy => seal_legacy(&auth.legacy_body(), recipient),
        Framing::Padded => seal_padded(&auth.padded_body(), recipient),
    }
}

pub(crate) fn seal_ack(ack: &AckMessage, recipient: &PublicKey, framing: Framing) -> Vec<u8> {
    match framing {
        Framing::Legacy => seal_legacy(&ack.legacy_body(), recipient),
        Framing::Padded => seal_padded(&ack.padded_body(), recipient),
    }
}

// ── Reading ───────────────────────────────────────────────────────────────────

/// Open a padded plaintext: one RLP item, trailing padding ignored.
fn open_padded_item(plaintext: &[u8]) -> Result<Item, HandshakeError> {
    let (item, _padding) = rlp::decode_prefix(plaintext)?;
    Ok(item)
}

/// Read one handshake message from the stream, attempting both framings.
///
/// Returns the decrypted body interpretation, the exact ciphertext bytes
/// as they appeared on the wire (prefix included for padded — they feed
/// the handshake transcript hash), and the framing that succeeded.
async fn read_sealed<R, T>(
    stream: &mut R,
    keypair: &Keypair,
    fixed_len: usize,
    decode_legacy: fn(&[u8]) -> Result<T, HandshakeError>,
    decode_padded: fn(&Item) -> Result<T, HandshakeError>,
) -> Result<(T, Vec<u8>, Framing), HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 2];
    stream.read_exact(&mut prefix).await?;

    if prefix[0] == 0x04 {
        // Looks like a bare ECIES point — the legacy fixed-size framing.
        let mut raw = vec![0u8; fixed_len];
        raw[..2].copy_from_slice(&prefix);
        stream.read_exact(&mut raw[2..]).await?;

        if let Ok(body) = keypair.ecies_open(&raw, b"") {
            let msg = decode_legacy(&body)?;
            return Ok((msg, raw, Framing::Legacy));
        }

        // A padded message whose length prefix happens to start 0x04.
        let declared = u16::from_be_bytes(prefix) as usize;
        if declared <= fixed_len - 2 || declared > MAX_PADDED_LEN {
            return Err(HandshakeError::Undecodable);
        }
        let mut envelope = raw.split_off(2);
        let already = envelope.len();
        envelope.resize(declared, 0);
        stream.read_exact(&mut envelope[already..]).await?;

        let plaintext = keypair
            .ecies_open(&envelope, &prefix)
            .map_err(|_| HandshakeError::Undecodable)?;
        let msg = decode_padded(&open_padded_item(&plaintext)?)?;
        let mut wire = prefix.to_vec();
        wire.extend_from_slice(&envelope);
        return Ok((msg, wire, Framing::Padded));
    }

    let declared = u16::from_be_bytes(prefix) as usize;
    if declared < ECIES_OVERHEAD || declared > MAX_PADDED_LEN {
        return Err(HandshakeError::Undecodable);
    }
    let mut envelope = vec![0u8; declared];
    stream.read_exact(&mut envelope).await?;

    let plaintext = keypair
        .ecies_open(&envelope, &prefix)
        .map_err(|_| HandshakeError::Undecodable)?;
    let msg = decode_padded(&open_padded_item(&plaintext)?)?;
    let mut wire = prefix.to_vec();
    wire.extend_from_slice(&envelope);
    Ok((msg, wire, Framing::Padded))
}

// ── Secrets ───────────────────────────────────────────────────────────────────

/// Which side of the handshake this node played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Per-direction symmetric material derived from a completed handshake.
///
/// Owned by exactly one session and wiped on drop. Never reused.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionSecrets {
    /// AES-256-CTR key for frames this node sends.
    pub aes_egress: [u8; 32],
    /// AES-256-CTR key for frames this node receives.
    pub aes_ingress: [u8; 32],
    /// Seed of the running MAC over sent frames.
    pub mac_egress_seed: [u8; 32],
    /// Seed of the running MAC over received frames.
    pub mac_ingress_seed: [u8; 32],
}

fn keccak_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut h = Hasher::new();
    for part in parts {
        h.update(part);
    }
    h.finalize()
}

/// Derive both directions' keys and MAC seeds.
///
/// Initiator and responder call this with mirrored roles and obtain
/// bit-identical material: one side's egress pair is the other's ingress
/// pair.
pub fn derive_secrets(
    role: Role,
    ephemeral_x: &[u8; 32],
    local_nonce: &[u8; 32],
    remote_nonce: &[u8; 32],
    auth_wire: &[u8],
    ack_wire: &[u8],
) -> SessionSecrets {
    let (init_nonce, resp_nonce) = match role {
        Role::Initiator => (local_nonce, remote_nonce),
        Role::Responder => (remote_nonce, local_nonce),
    };

    let transcript = keccak_concat(&[auth_wire, ack_wire]);
    let nonce_hash = keccak_concat(&[resp_nonce, init_nonce]);
    let secret = keccak_concat(&[ephemeral_x, &nonce_hash]);

    let aes_i2r = keccak_concat(&[&secret, init_nonce]);
    let aes_r2i = keccak_concat(&[&secret, resp_nonce]);
    let mac_i2r = keccak_concat(&[&secret, &aes_i2r, &transcript]);
    let mac_r2i = keccak_concat(&[&secret, &aes_r2i, &transcript]);

    match role {
        Role::Initiator => SessionSecrets {
            aes_egress: aes_i2r,
            aes_ingress: aes_r2i,
            mac_egress_seed: mac_i2r,
            mac_ingress_seed: mac_r2i,
        },
        Role::Responder => SessionSecrets {
            aes_egress: aes_r2i,
            aes_ingress: aes_i2r,
            mac_egress_seed: mac_r2i,
            mac_ingress_seed: mac_i2r,
        },
    }
}

// ── Drivers ───────────────────────────────────────────────────────────────────

fn random_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Dial-side handshake. The remote identity is known (it was dialed).
///
/// The auth goes out in the padded framing; the ack is accepted in either.
pub async fn initiate<S>(
    stream: &mut S,
    keypair: &Keypair,
    remote_id: &NodeId,
    deadline: Duration,
) -> Result<SessionSecrets, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let inner = initiate_inner(stream, keypair, remote_id, Framing::Padded);
    match tokio::time::timeout(deadline, inner).await {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::Timeout),
    }
}

async fn initiate_inner<S>(
    stream: &mut S,
    keypair: &Keypair,
    remote_id: &NodeId,
    framing: Framing,
) -> Result<SessionSecrets, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote_pub = remote_id.to_public()?;
    let ephemeral = Keypair::generate();
    let nonce = random_nonce();

    let digest = AuthMessage::signed_digest(&ephemeral.id(), &nonce);
    let auth = AuthMessage {
        signature: keypair.sign_recoverable(&digest),
        static_id: keypair.id(),
        ephemeral_id: ephemeral.id(),
        nonce,
    };
    let auth_wire = seal_auth(&auth, &remote_pub, framing);
    stream.write_all(&auth_wire).await?;
    tracing::trace!(remote = %remote_id, "sent auth");

    let (ack, ack_wire, framing) = read_sealed(
        stream,
        keypair,
        ACK_FIXED_LEN,
        AckMessage::from_legacy_body,
        AckMessage::from_padded_body,
    )
    .await?;
    tracing::trace!(remote = %remote_id, ?framing, "received ack");

    let remote_eph = ack.ephemeral_id.to_public()?;
    let ephemeral_x = ephemeral.ecdh_x(&remote_eph);

    Ok(derive_secrets(
        Role::Initiator,
        &ephemeral_x,
        &nonce,
        &ack.nonce,
        &auth_wire,
        &ack_wire,
    ))
}

/// Listen-side handshake. Learns the remote identity from the auth
/// signature; returns it alongside the derived secrets.
pub async fn accept<S>(
    stream: &mut S,
    keypair: &Keypair,
    deadline: Duration,
) -> Result<(SessionSecrets, NodeId), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(deadline, accept_inner(stream, keypair)).await {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::Timeout),
    }
}

async fn accept_inner<S>(
    stream: &mut S,
    keypair: &Keypair,
) -> Result<(SessionSecrets, NodeId), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (auth, auth_wire, framing) = read_sealed(
        stream,
        keypair,
        AUTH_FIXED_LEN,
        AuthMessage::from_legacy_body,
        AuthMessage::from_padded_body,
    )
    .await?;

    // The signature must recover to the identity the peer claims.
    let digest = AuthMessage::signed_digest(&auth.ephemeral_id, &auth.nonce);
    let recovered = crypto::recover(&digest, &auth.signature)
        .map_err(|_| HandshakeError::IdentityMismatch)?;
    if recovered != auth.static_id {
        return Err(HandshakeError::IdentityMismatch);
    }
    tracing::trace!(remote = %auth.static_id, ?framing, "received auth");

    let remote_static = auth.static_id.to_public()?;
    let remote_eph = auth.ephemeral_id.to_public()?;

    let ephemeral = Keypair::generate();
    let nonce = random_nonce();
    let ack = AckMessage {
        ephemeral_id: ephemeral.id(),
        nonce,
    };
    // Reply in the framing the peer used.
    let ack_wire = seal_ack(&ack, &remote_static, framing);
    stream.write_all(&ack_wire).await?;
    tracing::trace!(remote = %auth.static_id, "sent ack");

    let ephemeral_x = ephemeral.ecdh_x(&remote_eph);
    let secrets = derive_secrets(
        Role::Responder,
        &ephemeral_x,
        &nonce,
        &auth.nonce,
        &auth_wire,
        &ack_wire,
    );
    Ok((secrets, auth.static_id))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
