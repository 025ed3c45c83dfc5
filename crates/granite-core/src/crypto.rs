//! Cryptographic primitives for Granite.
//!
//! Provides four things:
//!   1. Keccak-256 hashing — node addresses, packet hashes, MAC seeds
//!   2. secp256k1 identities — every node IS its public key
//!   3. Recoverable ECDSA — discovery packets and the auth message are
//!      signed so the sender's identity can be learned from the wire
//!   4. An ECIES envelope — asymmetric encryption of handshake messages
//!      to a peer's static key
//!
//! Key material passing through derivations is wrapped in Zeroizing and
//! wiped when dropped. There is no unsafe code in this module.

use std::fmt;
use std::sync::OnceLock;

use aes::Aes128;
use cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::RngCore;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use sha2::Sha256;
use sha3::{Digest, Keccak256};
use thiserror::Error;
use zeroize::Zeroizing;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Shared verification/signing context, built once.
fn secp() -> &'static Secp256k1<All> {
    static SECP: OnceLock<Secp256k1<All>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::new)
}

// ── Keccak-256 ────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte Keccak-256 digest.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(data));
    out
}

/// Incremental Keccak-256 state.
///
/// Cloneable so a running state can be snapshotted — the frame codec
/// digests its MAC state after every frame without resetting it.
#[derive(Clone)]
pub struct Hasher(Keccak256);

impl Hasher {
    pub fn new() -> Self {
        Self(Keccak256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.0.finalize());
        out
    }

    /// Digest of the current state, leaving the state untouched.
    pub fn snapshot(&self) -> [u8; 32] {
        self.clone().finalize()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Node identity ─────────────────────────────────────────────────────────────

/// A node's identity: its uncompressed secp256k1 public key, without the
/// 0x04 point prefix. 64 bytes, immutable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 64]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub fn from_public(public: &PublicKey) -> Self {
        let ser = public.serialize_uncompressed();
        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(&ser[1..]);
        Self(bytes)
    }

    /// Reconstruct the public key. Fails if the bytes are not a curve point.
    pub fn to_public(&self) -> Result<PublicKey, CryptoError> {
        let mut ser = [0u8; 65];
        ser[0] = 0x04;
        ser[1..].copy_from_slice(&self.0);
        PublicKey::from_slice(&ser).map_err(|_| CryptoError::InvalidPoint)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// The node's 160-bit address: the last 20 bytes of the keccak-256
    /// hash of the identity. XOR distances in the node table are computed
    /// over addresses, not raw identities.
    pub fn address(&self) -> [u8; 20] {
        let hash = keccak256(&self.0);
        let mut addr = [0u8; 20];
        addr.copy_from_slice(&hash[12..]);
        addr
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}…", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A node's long-term static secp256k1 keypair.
///
/// Generated once and stored persistently; the public half is the node's
/// identity on every wire surface. The secret is erased on drop.
pub struct Keypair {
    secret: SecretKey,
    public: PublicKey,
    id: NodeId,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = SecretKey::new(&mut rand::thread_rng());
        Self::from_secret(secret)
    }

    /// Reconstruct a keypair from stored secret-key bytes.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidSecret)?;
        Ok(Self::from_secret(secret))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let public = PublicKey::from_secret_key(secp(), &secret);
        let id = NodeId::from_public(&public);
        Self { secret, public, id }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Serialize the secret key for persistent storage (mode 0600).
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.secret_bytes())
    }

    /// Sign a 32-byte digest, returning a 65-byte recoverable signature
    /// (r ‖ s ‖ recovery-id).
    pub fn sign_recoverable(&self, digest: &[u8; 32]) -> [u8; 65] {
        let msg = Message::from_digest(*digest);
        let sig = secp().sign_ecdsa_recoverable(&msg, &self.secret);
        let (rec_id, compact) = sig.serialize_compact();
        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&compact);
        out[64] = rec_id.to_i32() as u8;
        out
    }

    /// Raw-x ECDH agreement with a remote public key.
    pub fn ecdh_x(&self, remote: &PublicKey) -> Zeroizing<[u8; 32]> {
        ecdh_x(&self.secret, remote)
    }

    /// Open an ECIES envelope sealed to this keypair's public key.
    pub fn ecies_open(&self, envelope: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        ecies_open(&self.secret, envelope, aad)
    }
}

impl Drop for Keypair {
    fn drop(&mut self) {
        self.secret.non_secure_erase();
    }
}

/// Recover the signer's identity from a 65-byte recoverable signature
/// over a 32-byte digest.
pub fn recover(digest: &[u8; 32], signature: &[u8; 65]) -> Result<NodeId, CryptoError> {
    let rec_id =
        RecoveryId::from_i32(signature[64] as i32).map_err(|_| CryptoError::Signature)?;
    let sig = RecoverableSignature::from_compact(&signature[..64], rec_id)
        .map_err(|_| CryptoError::Signature)?;
    let msg = Message::from_digest(*digest);
    let public = secp()
        .recover_ecdsa(&msg, &sig)
        .map_err(|_| CryptoError::Signature)?;
    Ok(NodeId::from_public(&public))
}

/// ECDH returning the raw x coordinate of the shared point.
pub fn ecdh_x(secret: &SecretKey, remote: &PublicKey) -> Zeroizing<[u8; 32]> {
    let point = secp256k1::ecdh::shared_secret_point(remote, secret);
    let mut x = Zeroizing::new([0u8; 32]);
    x.copy_from_slice(&point[..32]);
    x
}

// ── ECIES envelope ────────────────────────────────────────────────────────────

/// Envelope layout: 0x04 ‖ ephemeral-x ‖ ephemeral-y (65) ‖ iv (16) ‖
/// ciphertext ‖ hmac-sha256 tag (32).
pub const ECIES_OVERHEAD: usize = 65 + 16 + 32;

/// Seal a plaintext to a recipient's public key.
///
/// `aad` is authenticated but not encrypted — the padded handshake
/// framing binds its size prefix through it.
pub fn ecies_seal(recipient: &PublicKey, plaintext: &[u8], aad: &[u8]) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let eph_secret = SecretKey::new(&mut rng);
    let eph_public = PublicKey::from_secret_key(secp(), &eph_secret);

    let x = ecdh_x(&eph_secret, recipient);
    let (enc_key, mac_key) = ecies_keys(&x);

    let mut iv = [0u8; 16];
    rng.fill_bytes(&mut iv);

    let mut ciphertext = plaintext.to_vec();
    let mut cipher = Aes128Ctr::new((&*enc_key).into(), (&iv).into());
    cipher.apply_keystream(&mut ciphertext);

    let mut mac = HmacSha256::new_from_slice(&*mac_key).expect("hmac accepts any key length");
    mac.update(&iv);
    mac.update(&ciphertext);
    mac.update(aad);
    let tag = mac.finalize().into_bytes();

    let mut out = Vec::with_capacity(ECIES_OVERHEAD + plaintext.len());
    out.extend_from_slice(&eph_public.serialize_uncompressed());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&tag);
    out
}

/// Open an ECIES envelope. Verifies the tag before decrypting.
pub fn ecies_open(secret: &SecretKey, envelope: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if envelope.len() < ECIES_OVERHEAD {
        return Err(CryptoError::Envelope);
    }
    let (eph_bytes, rest) = envelope.split_at(65);
    let (iv, rest) = rest.split_at(16);
    let (ciphertext, tag) = rest.split_at(rest.len() - 32);

    let eph_public = PublicKey::from_slice(eph_bytes).map_err(|_| CryptoError::InvalidPoint)?;
    let x = ecdh_x(secret, &eph_public);
    let (enc_key, mac_key) = ecies_keys(&x);

    let mut mac = HmacSha256::new_from_slice(&*mac_key).expect("hmac accepts any key length");
    mac.update(iv);
    mac.update(ciphertext);
    mac.update(aad);
    mac.verify_slice(tag).map_err(|_| CryptoError::Envelope)?;

    let mut plaintext = ciphertext.to_vec();
    let iv: [u8; 16] = iv.try_into().expect("split_at yields 16 bytes");
    let mut cipher = Aes128Ctr::new((&*enc_key).into(), (&iv).into());
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}

/// NIST concatenation KDF over SHA-256, one round: 32 bytes of output,
/// split into the AES-128 key and the (rehashed) HMAC key.
fn ecies_keys(x: &[u8; 32]) -> (Zeroizing<[u8; 16]>, Zeroizing<[u8; 32]>) {
    let mut h = Sha256::new();
    h.update(1u32.to_be_bytes());
    h.update(x);
    let derived = Zeroizing::new(<[u8; 32]>::from(h.finalize()));

    let mut enc_key = Zeroizing::new([0u8; 16]);
    enc_key.copy_from_slice(&derived[..16]);

    let mut h = Sha256::new();
    h.update(&derived[16..]);
    let mac_key = Zeroizing::new(<[u8; 32]>::from(h.finalize()));

    (enc_key, mac_key)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("secret key bytes out of range")]
    InvalidSecret,

    #[error("bytes are not a secp256k1 curve point")]
    InvalidPoint,

    #[error("signature recovery failed")]
    Signature,

    #[error("envelope truncated or authentication tag mismatch")]
    Envelope,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Keccak-256 ───────────────────────────────────────────────────────────

    #[test]
    fn keccak_known_vector() {
        // Keccak-256 of the empty input
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn incremental_hasher_matches_oneshot() {
        let mut h = Hasher::new();
        h.update(b"gran");
        h.update(b"ite");
        assert_eq!(h.finalize(), keccak256(b"granite"));
    }

    #[test]
    fn hasher_snapshot_leaves_state_running() {
        let mut h = Hasher::new();
        h.update(b"one");
        let snap = h.snapshot();
        assert_eq!(snap, keccak256(b"one"));
        h.update(b"two");
        assert_eq!(h.finalize(), keccak256(b"onetwo"));
    }

    // ── Identity ─────────────────────────────────────────────────────────────

    #[test]
    fn keypair_roundtrip_via_secret_bytes() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::from_secret_bytes(&kp1.secret_bytes()).unwrap();
        assert_eq!(kp1.id(), kp2.id());
    }

    #[test]
    fn node_id_public_key_roundtrip() {
        let kp = Keypair::generate();
        let public = kp.id().to_public().unwrap();
        assert_eq!(NodeId::from_public(&public), kp.id());
    }

    #[test]
    fn address_is_deterministic_and_distinct() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_eq!(a.id().address(), a.id().address());
        assert_ne!(a.id().address(), b.id().address());
    }

    #[test]
    fn garbage_node_id_is_not_a_point() {
        let id = NodeId::from_bytes([0xff; 64]);
        assert!(id.to_public().is_err());
    }

    // ── Recoverable signatures ───────────────────────────────────────────────

    #[test]
    fn sign_and_recover() {
        let kp = Keypair::generate();
        let digest = keccak256(b"payload");
        let sig = kp.sign_recoverable(&digest);
        assert_eq!(recover(&digest, &sig).unwrap(), kp.id());
    }

    #[test]
    fn recover_with_wrong_digest_yields_different_identity() {
        let kp = Keypair::generate();
        let sig = kp.sign_recoverable(&keccak256(b"payload"));
        let recovered = recover(&keccak256(b"other"), &sig);
        // Recovery either fails outright or produces a different key —
        // never the signer's identity.
        if let Ok(id) = recovered {
            assert_ne!(id, kp.id());
        }
    }

    #[test]
    fn tampered_signature_rejected_or_misattributed() {
        let kp = Keypair::generate();
        let digest = keccak256(b"payload");
        let mut sig = kp.sign_recoverable(&digest);
        sig[10] ^= 0xff;
        if let Ok(id) = recover(&digest, &sig) {
            assert_ne!(id, kp.id());
        }
    }

    // ── ECDH ─────────────────────────────────────────────────────────────────

    #[test]
    fn ecdh_is_commutative() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_eq!(*a.ecdh_x(b.public()), *b.ecdh_x(a.public()));
    }

    // ── ECIES ────────────────────────────────────────────────────────────────

    #[test]
    fn ecies_seal_open_roundtrip() {
        let kp = Keypair::generate();
        let sealed = ecies_seal(kp.public(), b"auth body", b"");
        assert_eq!(sealed.len(), ECIES_OVERHEAD + 9);
        assert_eq!(kp.ecies_open(&sealed, b"").unwrap(), b"auth body");
    }

    #[test]
    fn ecies_empty_plaintext() {
        let kp = Keypair::generate();
        let sealed = ecies_seal(kp.public(), b"", b"");
        assert_eq!(kp.ecies_open(&sealed, b"").unwrap(), b"");
    }

    #[test]
    fn ecies_tampered_ciphertext_rejected() {
        let kp = Keypair::generate();
        let mut sealed = ecies_seal(kp.public(), b"auth body", b"");
        sealed[70] ^= 0x01;
        assert_eq!(kp.ecies_open(&sealed, b""), Err(CryptoError::Envelope));
    }

    #[test]
    fn ecies_wrong_aad_rejected() {
        let kp = Keypair::generate();
        let sealed = ecies_seal(kp.public(), b"auth body", b"\x01\x5e");
        assert!(kp.ecies_open(&sealed, b"\x01\x5f").is_err());
        assert!(kp.ecies_open(&sealed, b"\x01\x5e").is_ok());
    }

    #[test]
    fn ecies_wrong_recipient_rejected() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let sealed = ecies_seal(kp.public(), b"auth body", b"");
        assert!(other.ecies_open(&sealed, b"").is_err());
    }

    #[test]
    fn ecies_truncated_rejected() {
        let kp = Keypair::generate();
        assert_eq!(
            kp.ecies_open(&[0u8; 64], b""),
            Err(CryptoError::Envelope)
        );
    }
}
