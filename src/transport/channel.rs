//! Encrypted, ordered channel over any `WireProtocol`.
//!
//! ## Sealed frame layout
//!
//! ```text
//! [sequence: u64 BE][AES-256-GCM( [flags: u8][CBOR(Frame) or LZ4(CBOR(Frame))] ) + tag]
//! ```
//!
//! - Key: HKDF-derived per participant (see `ChannelKeyring`)
//! - Nonce: `[direction: u32 BE][sequence: u64 BE]`, never reused under a key
//! - AAD: participant id, binding the frame to its channel
//! - Ordering: each side expects sequence numbers 0, 1, 2, ... exactly;
//!   gaps, replays and reordering are rejected
//!
//! The accepting side learns which key to use from a plaintext `Handshake`
//! frame sent by the connecting participant before any sealed frame.

use super::codec::{compress_bytes, decompress_bytes};
use super::frame::{Frame, Handshake, HANDSHAKE_VERSION};
use super::traits::{TransportError, TransportResult, WireProtocol};
use crate::crypto::ChannelKeyring;
use crate::model::{unix_now, ParticipantId};
use crate::serialization::{from_cbor, to_cbor};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::debug;

const FLAG_LZ4: u8 = 0b0000_0001;

/// Frames below this size are never compressed.
const COMPRESS_THRESHOLD: usize = 256;

/// Which end of the connection this channel is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Orchestrator side
    Coordinator,
    /// Participant side
    Participant,
}

impl ChannelRole {
    fn send_direction(&self) -> u32 {
        match self {
            ChannelRole::Coordinator => 1,
            ChannelRole::Participant => 2,
        }
    }

    fn recv_direction(&self) -> u32 {
        match self {
            ChannelRole::Coordinator => 2,
            ChannelRole::Participant => 1,
        }
    }
}

/// Channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed,
}

/// Encrypted channel to a single peer.
pub struct SecureChannel {
    protocol: Arc<dyn WireProtocol>,
    participant: ParticipantId,
    role: ChannelRole,
    key: LessSafeKey,
    compress: bool,
    send_seq: tokio::sync::Mutex<u64>,
    recv_seq: tokio::sync::Mutex<u64>,
    state: Mutex<ConnectionState>,
    last_received: Mutex<Instant>,
}

impl SecureChannel {
    fn new(
        protocol: Arc<dyn WireProtocol>,
        participant: ParticipantId,
        role: ChannelRole,
        key_bytes: &[u8; 32],
        compress: bool,
    ) -> TransportResult<Self> {
        let unbound =
            UnboundKey::new(&AES_256_GCM, key_bytes).map_err(|_| TransportError::SealFailed)?;
        Ok(Self {
            protocol,
            participant,
            role,
            key: LessSafeKey::new(unbound),
            compress,
            send_seq: tokio::sync::Mutex::new(0),
            recv_seq: tokio::sync::Mutex::new(0),
            state: Mutex::new(ConnectionState::Open),
            last_received: Mutex::new(Instant::now()),
        })
    }

    /// Participant side: announce the id, then switch to sealed frames.
    pub async fn connect(
        protocol: Arc<dyn WireProtocol>,
        participant: ParticipantId,
        channel_key: &[u8; 32],
        compress: bool,
    ) -> TransportResult<Self> {
        let handshake = Handshake {
            version: HANDSHAKE_VERSION,
            participant_id: participant.as_str().to_string(),
        };
        let bytes = to_cbor(&handshake).map_err(|e| TransportError::Handshake(e.to_string()))?;
        protocol.send_frame(bytes).await?;
        Self::new(protocol, participant, ChannelRole::Participant, channel_key, compress)
    }

    /// Orchestrator side: read the handshake and derive the participant's key.
    pub async fn accept(
        protocol: Arc<dyn WireProtocol>,
        keyring: &ChannelKeyring,
        compress: bool,
    ) -> TransportResult<Self> {
        let bytes = protocol
            .recv_frame()
            .await?
            .ok_or_else(|| TransportError::Handshake("connection closed before handshake".into()))?;
        let handshake: Handshake =
            from_cbor(&bytes).map_err(|e| TransportError::Handshake(e.to_string()))?;
        if handshake.version != HANDSHAKE_VERSION {
            return Err(TransportError::Handshake(format!(
                "unsupported version {}",
                handshake.version
            )));
        }
        if handshake.participant_id.is_empty() {
            return Err(TransportError::Handshake("empty participant id".into()));
        }

        let participant = ParticipantId::new(handshake.participant_id);
        let key = keyring
            .channel_key(&participant)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        Self::new(protocol, participant, ChannelRole::Coordinator, &key, compress)
    }

    /// Build both ends over an in-memory protocol pair.
    pub fn memory_pair(
        participant: ParticipantId,
        channel_key: &[u8; 32],
        compress: bool,
    ) -> TransportResult<(Self, Self)> {
        let (a, b) = super::memory::MemoryProtocol::pair();
        let coordinator = Self::new(
            Arc::new(a),
            participant.clone(),
            ChannelRole::Coordinator,
            channel_key,
            compress,
        )?;
        let remote = Self::new(Arc::new(b), participant, ChannelRole::Participant, channel_key, compress)?;
        Ok((coordinator, remote))
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Time since the last frame arrived from the peer.
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    fn nonce(direction: u32, seq: u64) -> TransportResult<Nonce> {
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&direction.to_be_bytes());
        bytes[4..].copy_from_slice(&seq.to_be_bytes());
        Nonce::try_assume_unique_for_key(&bytes).map_err(|_| TransportError::SealFailed)
    }

    fn seal(&self, seq: u64, frame: &Frame) -> TransportResult<Vec<u8>> {
        let body = frame
            .encode()
            .map_err(|e| TransportError::Codec(e.to_string()))?;

        let mut plaintext = Vec::with_capacity(body.len() + 1);
        if self.compress && body.len() >= COMPRESS_THRESHOLD {
            plaintext.push(FLAG_LZ4);
            plaintext.extend_from_slice(&compress_bytes(&body));
        } else {
            plaintext.push(0);
            plaintext.extend_from_slice(&body);
        }

        let nonce = Self::nonce(self.role.send_direction(), seq)?;
        self.key
            .seal_in_place_append_tag(
                nonce,
                Aad::from(self.participant.as_str().as_bytes()),
                &mut plaintext,
            )
            .map_err(|_| TransportError::SealFailed)?;

        let mut wire = Vec::with_capacity(8 + plaintext.len());
        wire.extend_from_slice(&seq.to_be_bytes());
        wire.extend_from_slice(&plaintext);
        Ok(wire)
    }

    fn open(&self, expected: u64, wire: &[u8]) -> TransportResult<Frame> {
        if wire.len() < 8 + AES_256_GCM.tag_len() + 1 {
            return Err(TransportError::Malformed(format!(
                "sealed frame of {} bytes is too short",
                wire.len()
            )));
        }
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&wire[..8]);
        let seq = u64::from_be_bytes(seq_bytes);
        if seq != expected {
            return Err(TransportError::OutOfOrder { expected, got: seq });
        }

        let nonce = Self::nonce(self.role.recv_direction(), seq)?;
        let mut ciphertext = wire[8..].to_vec();
        let plaintext = self
            .key
            .open_in_place(
                nonce,
                Aad::from(self.participant.as_str().as_bytes()),
                &mut ciphertext,
            )
            .map_err(|_| TransportError::OpenFailed)?;

        let (flags, body) = plaintext
            .split_first()
            .ok_or_else(|| TransportError::Malformed("empty plaintext".into()))?;
        let frame = if flags & FLAG_LZ4 != 0 {
            let raw = decompress_bytes(body).map_err(|e| TransportError::Codec(e.to_string()))?;
            Frame::decode(&raw)
        } else {
            Frame::decode(body)
        };
        frame.map_err(|e| TransportError::Codec(e.to_string()))
    }

    /// Seal and send one frame.
    pub async fn send(&self, frame: &Frame) -> TransportResult<()> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        // Holding the counter across the send keeps wire order equal to
        // sequence order.
        let mut seq = self.send_seq.lock().await;
        let wire = self.seal(*seq, frame)?;
        self.protocol.send_frame(wire).await?;
        *seq += 1;
        debug!(
            participant = %self.participant,
            protocol = self.protocol.name(),
            kind = frame.kind(),
            "frame sent"
        );
        Ok(())
    }

    /// Receive and open the next frame; `Ok(None)` once the peer has closed.
    pub async fn recv(&self) -> TransportResult<Option<Frame>> {
        let mut seq = self.recv_seq.lock().await;
        let wire = match self.protocol.recv_frame().await? {
            Some(wire) => wire,
            None => {
                self.mark_closed();
                return Ok(None);
            }
        };
        let frame = self.open(*seq, &wire)?;
        *seq += 1;
        *self.last_received.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        Ok(Some(frame))
    }

    /// Send a liveness ping.
    pub async fn heartbeat(&self) -> TransportResult<()> {
        self.send(&Frame::Heartbeat {
            sent_at: unix_now(),
        })
        .await
    }

    fn mark_closed(&self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = ConnectionState::Closed;
    }

    /// Close the channel. Idempotent.
    pub async fn close(&self) -> TransportResult<()> {
        let was_open = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, ConnectionState::Closed) == ConnectionState::Open
        };
        if was_open {
            self.protocol.close().await?;
        }
        Ok(())
    }
}
