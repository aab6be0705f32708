//! Key derivation from the orchestrator's master secret.
//!
//! All symmetric keys the engine uses are derived from one 32-byte master
//! secret using HKDF-SHA256 with domain separation.
//!
//! ## Key Hierarchy
//!
//! ```text
//! master secret (32 bytes, hex in config)
//!         │
//!         ▼
//! HKDF-SHA256(salt="cohort-master-v1", secret)
//!         │
//!         ├─► expand("channel-key" || participant id) → per-participant AES-256-GCM key
//!         └─► expand("privacy-proof")                 → proof token secret
//! ```
//!
//! Participants are provisioned with their own channel key out of band; the
//! orchestrator can always re-derive it from the participant id.

use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

use crate::model::ParticipantId;

/// Domain separation salt (versioned for rotation)
const MASTER_SALT: &[u8] = b"cohort-master-v1";

mod purposes {
    pub const CHANNEL_KEY: &[u8] = b"channel-key";
    pub const PRIVACY_PROOF: &[u8] = b"privacy-proof";
}

/// Key derivation errors.
#[derive(Debug, Error)]
pub enum KeyringError {
    #[error("Invalid master secret: {0}")]
    InvalidSecret(String),

    #[error("Key derivation failed: {0}")]
    DerivationFailed(String),
}

/// Derives channel and proof keys from the master secret.
///
/// Key material is zeroized on drop.
pub struct ChannelKeyring {
    epoch: u64,
    master: [u8; 32],
    proof_secret: [u8; 32],
}

impl Drop for ChannelKeyring {
    fn drop(&mut self) {
        self.master.zeroize();
        self.proof_secret.zeroize();
    }
}

impl ChannelKeyring {
    /// Build a keyring from a 32-byte master secret.
    pub fn from_secret(secret: &[u8]) -> Result<Self, KeyringError> {
        if secret.len() != 32 {
            return Err(KeyringError::InvalidSecret(format!(
                "expected 32 bytes, got {}",
                secret.len()
            )));
        }

        let hkdf = Hkdf::<Sha256>::new(Some(MASTER_SALT), secret);
        let mut master = [0u8; 32];
        master.copy_from_slice(secret);
        let proof_secret = Self::derive_key(&hkdf, purposes::PRIVACY_PROOF)?;

        Ok(Self {
            epoch: 1,
            master,
            proof_secret,
        })
    }

    /// Build a keyring from the hex form stored in the config file.
    pub fn from_hex(secret_hex: &str) -> Result<Self, KeyringError> {
        let bytes = Zeroizing::new(
            hex::decode(secret_hex.trim())
                .map_err(|e| KeyringError::InvalidSecret(e.to_string()))?,
        );
        Self::from_secret(&bytes)
    }

    /// Fresh random master secret, hex encoded.
    pub fn generate_secret_hex() -> String {
        let mut secret = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut secret[..]);
        hex::encode(&secret[..])
    }

    fn derive_key(hkdf: &Hkdf<Sha256>, info: &[u8]) -> Result<[u8; 32], KeyringError> {
        let mut key = [0u8; 32];
        hkdf.expand(info, &mut key)
            .map_err(|e| KeyringError::DerivationFailed(format!("{:?}", e)))?;
        Ok(key)
    }

    /// Key epoch (derivation generation).
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// AES-256-GCM key for the channel to `participant`.
    pub fn channel_key(&self, participant: &ParticipantId) -> Result<Zeroizing<[u8; 32]>, KeyringError> {
        let hkdf = Hkdf::<Sha256>::new(Some(MASTER_SALT), &self.master);
        let mut info = purposes::CHANNEL_KEY.to_vec();
        info.push(0);
        info.extend_from_slice(participant.as_str().as_bytes());
        Ok(Zeroizing::new(Self::derive_key(&hkdf, &info)?))
    }

    /// Secret backing `ProofTokenGuard`.
    pub fn proof_secret(&self) -> &[u8; 32] {
        &self.proof_secret
    }
}
