//! The frame transport: an encrypted duplex byte stream cut into
//! discrete, authenticated message frames.
//!
//! Each physical frame is `header(16) ‖ header-MAC(16) ‖ body ‖
//! body-MAC(16)`, with header and body encrypted by the direction's
//! AES-256-CTR stream and authenticated by a running Keccak-256 state
//! seeded from the handshake. Every ciphertext advances the MAC state, so
//! a single tampered, dropped, or reordered frame desynchronizes the
//! stream and is detected on the very next MAC check.
//!
//! Logical messages longer than [`MAX_FRAME_BODY`] are split across
//! physical frames and reassembled before delivery. MACs are verified
//! before any ciphertext is interpreted.

use aes::Aes256;
use bytes::BytesMut;
use cipher::{KeyIvInit, StreamCipher};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use granite_core::crypto::Hasher;
use granite_core::rlp::{self, Item};
use granite_core::wire::{FRAME_HEADER_SIZE, FRAME_MAC_SIZE, MAX_FRAME_BODY, MAX_MESSAGE_SIZE};

use crate::error::FrameError;
use crate::handshake::SessionSecrets;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

const FLAG_SINGLE: u8 = 0;
const FLAG_FIRST: u8 = 1;
const FLAG_CONTINUATION: u8 = 2;

fn cipher_for(key: &[u8; 32]) -> Aes256Ctr {
    // The stream is continuous for the life of the session; a fixed IV is
    // sound because each direction's key is unique and never reused.
    Aes256Ctr::new(key.into(), (&[0u8; 16]).into())
}

fn mac_for(seed: &[u8; 32]) -> Hasher {
    let mut mac = Hasher::new();
    mac.update(seed);
    mac
}

fn mac_tag(mac: &mut Hasher, ciphertext: &[u8]) -> [u8; FRAME_MAC_SIZE] {
    mac.update(ciphertext);
    let digest = mac.snapshot();
    let mut tag = [0u8; FRAME_MAC_SIZE];
    tag.copy_from_slice(&digest[..FRAME_MAC_SIZE]);
    tag
}

/// Build both directions' codec halves from a completed handshake.
pub fn split(secrets: &SessionSecrets) -> (FrameEgress, FrameIngress) {
    (FrameEgress::new(secrets), FrameIngress::new(secrets))
}

// ── Egress ────────────────────────────────────────────────────────────────────

/// Encrypts and authenticates outgoing messages. One per session
/// direction; all senders must serialize behind the session's send lock.
pub struct FrameEgress {
    cipher: Aes256Ctr,
    mac: Hasher,
}

impl FrameEgress {
    pub fn new(secrets: &SessionSecrets) -> Self {
        Self {
            cipher: cipher_for(&secrets.aes_egress),
            mac: mac_for(&secrets.mac_egress_seed),
        }
    }

    /// Encode a logical message into one or more physical frames,
    /// concatenated and ready for the wire.
    pub fn encode_message(&mut self, msg_id: u64, payload: &[u8]) -> Vec<u8> {
        let mut logical = rlp::encode(&Item::u64(msg_id));
        logical.extend_from_slice(payload);

        let mut out = Vec::new();
        if logical.len() <= MAX_FRAME_BODY {
            self.encode_frame(&logical, FLAG_SINGLE, 0, &mut out);
            return out;
        }

        let total = logical.len();
        let mut flag = FLAG_FIRST;
        for chunk in logical.chunks(MAX_FRAME_BODY) {
            self.encode_frame(chunk, flag, if flag == FLAG_FIRST { total } else { 0 }, &mut out);
            flag = FLAG_CONTINUATION;
        }
        out
    }

    fn encode_frame(&mut self, chunk: &[u8], flag: u8, total: usize, out: &mut Vec<u8>) {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[..3].copy_from_slice(&(chunk.len() as u32).to_be_bytes()[1..]);
        header[3] = flag;
        header[4..8].copy_from_slice(&(total as u32).to_be_bytes());
        self.cipher.apply_keystream(&mut header);
        out.extend_from_slice(&header);
        out.extend_from_slice(&mac_tag(&mut self.mac, &header));

        let padded = (chunk.len() + 15) & !15;
        let body_start = out.len();
        out.resize(body_start + padded, 0);
        out[body_start..body_start + chunk.len()].copy_from_slice(chunk);
        self.cipher.apply_keystream(&mut out[body_start..]);
        let tag = mac_tag(&mut self.mac, &out[body_start..]);
        out.extend_from_slice(&tag);
    }
}

// ── Ingress ───────────────────────────────────────────────────────────────────

/// A decoded, MAC-verified frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    len: usize,
    flag: u8,
    total: usize,
}

impl FrameHeader {
    /// Ciphertext length of the body (padded to the cipher block).
    pub fn padded_len(&self) -> usize {
        (self.len + 15) & !15
    }

    /// Bytes remaining on the wire for this frame: body plus its MAC.
    pub fn body_wire_len(&self) -> usize {
        self.padded_len() + FRAME_MAC_SIZE
    }
}

struct Reassembly {
    total: usize,
    buf: Vec<u8>,
}

/// Decrypts and authenticates incoming frames, reassembling fragmented
/// messages before exposing them.
pub struct FrameIngress {
    cipher: Aes256Ctr,
    mac: Hasher,
    pending: Option<Reassembly>,
}

impl FrameIngress {
    pub fn new(secrets: &SessionSecrets) -> Self {
        Self {
            cipher: cipher_for(&secrets.aes_ingress),
            mac: mac_for(&secrets.mac_ingress_seed),
            pending: None,
        }
    }

    /// Verify and decrypt a frame header. MAC first, always.
    pub fn decode_header(
        &mut self,
        wire: &[u8; FRAME_HEADER_SIZE + FRAME_MAC_SIZE],
    ) -> Result<FrameHeader, FrameError> {
        let (ciphertext, tag) = wire.split_at(FRAME_HEADER_SIZE);
        if mac_tag(&mut self.mac, ciphertext) != tag {
            return Err(FrameError::MacMismatch);
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(ciphertext);
        self.cipher.apply_keystream(&mut header);

        let len = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
        let flag = header[3];
        let total = u32::from_be_bytes(header[4..8].try_into().expect("fixed slice")) as usize;

        if len > MAX_FRAME_BODY {
            return Err(FrameError::Oversized(len));
        }
        match flag {
            FLAG_SINGLE | FLAG_CONTINUATION => {}
            FLAG_FIRST => {
                if total > MAX_MESSAGE_SIZE {
                    return Err(FrameError::Oversized(total));
                }
            }
            other => return Err(FrameError::BadFlag(other)),
        }
        Ok(FrameHeader { len, flag, total })
    }

    /// Verify and decrypt a frame body (`wire` is ciphertext plus MAC).
    ///
    /// Returns the completed logical message, or `None` while a
    /// fragmented message is still being reassembled.
    pub fn decode_body(
        &mut self,
        header: &FrameHeader,
        wire: &mut [u8],
    ) -> Result<Option<(u64, Vec<u8>)>, FrameError> {
        let (ciphertext, tag) = wire.split_at_mut(header.padded_len());
        if mac_tag(&mut self.mac, ciphertext) != &tag[..] {
            return Err(FrameError::MacMismatch);
        }
        self.cipher.apply_keystream(ciphertext);
        let chunk = &ciphertext[..header.len];

        match header.flag {
            FLAG_SINGLE => {
                if self.pending.is_some() {
                    return Err(FrameError::InterleavedMessage);
                }
                Ok(Some(Self::parse_message(chunk.to_vec())?))
            }
            FLAG_FIRST => {
                if self.pending.is_some() {
                    return Err(FrameError::InterleavedMessage);
                }
                if chunk.len() > header.total {
                    return Err(FrameError::FragmentOverflow);
                }
                let reassembly = Reassembly {
                    total: header.total,
                    buf: chunk.to_vec(),
                };
                if reassembly.buf.len() == reassembly.total {
                    return Ok(Some(Self::parse_message(reassembly.buf)?));
                }
                self.pending = Some(reassembly);
                Ok(None)
            }
            FLAG_CONTINUATION => {
                let mut reassembly =
                    self.pending.take().ok_or(FrameError::OrphanContinuation)?;
                reassembly.buf.extend_from_slice(chunk);
                if reassembly.buf.len() > reassembly.total {
                    return Err(FrameError::FragmentOverflow);
                }
                if reassembly.buf.len() == reassembly.total {
                    return Ok(Some(Self::parse_message(reassembly.buf)?));
                }
                self.pending = Some(reassembly);
                Ok(None)
            }
            _ => unreachable!("decode_header rejects unknown flags"),
        }
    }

    fn parse_message(logical: Vec<u8>) -> Result<(u64, Vec<u8>), FrameError> {
        let (id_item, payload) = rlp::decode_prefix(&logical)?;
        let id = id_item.as_u64()?;
        Ok((id, payload.to_vec()))
    }
}

// ── Async wrappers ────────────────────────────────────────────────────────────

/// Write half of a framed session stream.
pub struct FrameWriter<W> {
    io: W,
    egress: FrameEgress,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(io: W, egress: FrameEgress) -> Self {
        Self { io, egress }
    }

    pub async fn send(&mut self, msg_id: u64, payload: &[u8]) -> Result<(), FrameError> {
        let bytes = self.egress.encode_message(msg_id, payload);
        self.io.write_all(&bytes).await?;
        self.io.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.io.shutdown().await?;
        Ok(())
    }
}

/// Read half of a framed session stream.
pub struct FrameReader<R> {
    io: R,
    ingress: FrameIngress,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R, ingress: FrameIngress) -> Self {
        Self { io, ingress }
    }

    /// Read physical frames until a logical message completes.
    pub async fn recv(&mut self) -> Result<(u64, Vec<u8>), FrameError> {
        loop {
            let mut header_wire = [0u8; FRAME_HEADER_SIZE + FRAME_MAC_SIZE];
            self.io.read_exact(&mut header_wire).await?;
            let header = self.ingress.decode_header(&header_wire)?;

            let mut body_wire = BytesMut::zeroed(header.body_wire_len());
            self.io.read_exact(&mut body_wire).await?;
            if let Some(message) = self.ingress.decode_body(&header, &mut body_wire)? {
                return Ok(message);
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_secrets() -> SessionSecrets {
        SessionSecrets {
            aes_egress: [0x11; 32],
            aes_ingress: [0x22; 32],
            mac_egress_seed: [0x33; 32],
            mac_ingress_seed: [0x44; 32],
        }
    }

    /// The peer's view of the same secrets: directions swapped.
    fn mirrored(secrets: &SessionSecrets) -> SessionSecrets {
        SessionSecrets {
            aes_egress: secrets.aes_ingress,
            aes_ingress: secrets.aes_egress,
            mac_egress_seed: secrets.mac_ingress_seed,
            mac_ingress_seed: secrets.mac_egress_seed,
        }
    }

    fn pair() -> (FrameEgress, FrameIngress) {
        let local = test_secrets();
        let remote = mirrored(&local);
        (FrameEgress::new(&local), FrameIngress::new(&remote))
    }

    fn decode_all(ingress: &mut FrameIngress, mut wire: &[u8]) -> Option<(u64, Vec<u8>)> {
        while !wire.is_empty() {
            let header_wire: [u8; 32] = wire[..32].try_into().unwrap();
            wire = &wire[32..];
            let header = ingress.decode_header(&header_wire).unwrap();
            let mut body = wire[..header.body_wire_len()].to_vec();
            wire = &wire[header.body_wire_len()..];
            if let Some(msg) = ingress.decode_body(&header, &mut body).unwrap() {
                assert!(wire.is_empty(), "message completed before input ran out");
                return Some(msg);
            }
        }
        None
    }

    #[test]
    fn single_frame_roundtrip() {
        let (mut egress, mut ingress) = pair();
        let wire = egress.encode_message(0x10, b"status payload");
        let (id, payload) = decode_all(&mut ingress, &wire).unwrap();
        assert_eq!(id, 0x10);
        assert_eq!(payload, b"status payload");
    }

    #[test]
    fn empty_payload_roundtrip() {
        let (mut egress, mut ingress) = pair();
        let wire = egress.encode_message(0x02, b"");
        let (id, payload) = decode_all(&mut ingress, &wire).unwrap();
        assert_eq!(id, 0x02);
        assert!(payload.is_empty());
    }

    #[test]
    fn message_stream_stays_in_sync() {
        let (mut egress, mut ingress) = pair();
        for i in 0..20u64 {
            let body = vec![i as u8; (i * 97) as usize % 1500];
            let wire = egress.encode_message(i, &body);
            let (id, payload) = decode_all(&mut ingress, &wire).unwrap();
            assert_eq!(id, i);
            assert_eq!(payload, body);
        }
    }

    #[test]
    fn large_message_fragments_and_reassembles() {
        let (mut egress, mut ingress) = pair();
        let payload: Vec<u8> = (0..MAX_FRAME_BODY * 3 + 500).map(|i| i as u8).collect();
        let wire = egress.encode_message(0x17, &payload);
        // More than one physical frame on the wire.
        assert!(wire.len() > payload.len() + FRAME_HEADER_SIZE + 2 * FRAME_MAC_SIZE);
        let (id, back) = decode_all(&mut ingress, &wire).unwrap();
        assert_eq!(id, 0x17);
        assert_eq!(back, payload);
    }

    #[test]
    fn encoding_is_deterministic_for_equal_state() {
        // Same secrets, same message sequence — bit-identical wire bytes.
        let local = test_secrets();
        let mut a = FrameEgress::new(&local);
        let mut b = FrameEgress::new(&local);
        for i in 0..5u64 {
            let wire_a = a.encode_message(i, &vec![0xab; 100 * i as usize]);
            let wire_b = b.encode_message(i, &vec![0xab; 100 * i as usize]);
            assert_eq!(wire_a, wire_b);
        }
    }

    #[test]
    fn tampered_header_rejected() {
        let (mut egress, mut ingress) = pair();
        let mut wire = egress.encode_message(0x10, b"payload");
        wire[3] ^= 0x01;
        let header_wire: [u8; 32] = wire[..32].try_into().unwrap();
        assert!(matches!(
            ingress.decode_header(&header_wire),
            Err(FrameError::MacMismatch)
        ));
    }

    #[test]
    fn tampered_body_rejected() {
        let (mut egress, mut ingress) = pair();
        let mut wire = egress.encode_message(0x10, b"payload");
        let last = wire.len() - FRAME_MAC_SIZE - 1;
        wire[last] ^= 0x01;
        let header_wire: [u8; 32] = wire[..32].try_into().unwrap();
        let header = ingress.decode_header(&header_wire).unwrap();
        let mut body = wire[32..].to_vec();
        assert!(matches!(
            ingress.decode_body(&header, &mut body),
            Err(FrameError::MacMismatch)
        ));
    }

    #[test]
    fn replayed_frame_rejected() {
        // The running MAC advances; feeding the same bytes twice cannot verify.
        let (mut egress, mut ingress) = pair();
        let wire = egress.encode_message(0x10, b"once");
        decode_all(&mut ingress, &wire).unwrap();
        let header_wire: [u8; 32] = wire[..32].try_into().unwrap();
        assert!(matches!(
            ingress.decode_header(&header_wire),
            Err(FrameError::MacMismatch)
        ));
    }

    #[test]
    fn orphan_continuation_rejected() {
        let local = test_secrets();
        let remote = mirrored(&local);
        let mut egress = FrameEgress::new(&local);
        let mut ingress = FrameIngress::new(&remote);

        // Hand-build a continuation frame with a valid MAC stream.
        let mut wire = Vec::new();
        egress.encode_frame(b"stray", FLAG_CONTINUATION, 0, &mut wire);
        let header_wire: [u8; 32] = wire[..32].try_into().unwrap();
        let header = ingress.decode_header(&header_wire).unwrap();
        let mut body = wire[32..].to_vec();
        assert!(matches!(
            ingress.decode_body(&header, &mut body),
            Err(FrameError::OrphanContinuation)
        ));
    }

    #[test]
    fn oversized_total_rejected() {
        let local = test_secrets();
        let remote = mirrored(&local);
        let mut egress = FrameEgress::new(&local);
        let mut ingress = FrameIngress::new(&remote);

        let mut wire = Vec::new();
        egress.encode_frame(b"x", FLAG_FIRST, MAX_MESSAGE_SIZE + 1, &mut wire);
        let header_wire: [u8; 32] = wire[..32].try_into().unwrap();
        assert!(matches!(
            ingress.decode_header(&header_wire),
            Err(FrameError::Oversized(_))
        ));
    }

    #[tokio::test]
    async fn async_reader_writer_roundtrip() {
        let local = test_secrets();
        let remote = mirrored(&local);
        let (a, b) = tokio::io::duplex(64 * 1024);

        let mut writer = FrameWriter::new(a, FrameEgress::new(&local));
        let mut reader = FrameReader::new(b, FrameIngress::new(&remote));

        let payload: Vec<u8> = (0..40_000).map(|i| (i % 251) as u8).collect();
        let send = async {
            writer.send(0x21, &payload).await.unwrap();
            writer.send(0x02, b"").await.unwrap();
        };
        let recv = async {
            let (id, body) = reader.recv().await.unwrap();
            assert_eq!(id, 0x21);
            assert_eq!(body, payload);
            let (id, body) = reader.recv().await.unwrap();
            assert_eq!(id, 0x02);
            assert!(body.is_empty());
        };
        tokio::join!(send, recv);
    }
}
