//! Cryptographic layer for Ferry.
//!
//! Provides three things:
//!   1. AES-256-GCM chunk sealing with deterministic, sequence-derived nonces
//!   2. AES-256-GCM control-plane sealing with random nonces
//!   3. Streaming SHA-256 for the end-to-end file digest
//!
//! Key agreement is delegated (ECDH → HKDF happens outside the engine); this
//! module consumes the derived 256-bit key as opaque bytes. Key material is
//! zeroized on drop. There is no unsafe code in this module.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

// ── Transfer key ──────────────────────────────────────────────────────────────

/// The shared 256-bit AES-GCM key for one transfer.
///
/// Produced by the delegated key agreement and installed exactly once per
/// session. Freshness per transfer is what makes the deterministic chunk
/// nonces below safe: a (key, seq) pair is never reused.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct TransferKey {
    bytes: Zeroizing<[u8; 32]>,
}

impl TransferKey {
    /// Wrap the derived key bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
        }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new((&*self.bytes).into())
    }
}

impl std::fmt::Debug for TransferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material, even at trace level.
        f.write_str("TransferKey(..)")
    }
}

// ── Deterministic chunk nonces ────────────────────────────────────────────────

/// Derive the data-plane nonce for a chunk: a 12-byte big-endian integer
/// whose low 4 bytes are the sequence number and whose high 8 bytes are zero.
///
/// The nonce is never transmitted — both sides reconstruct it from `seq`,
/// which makes retransmission stateless (re-encrypting the same chunk yields
/// the same ciphertext). Unique per transfer because seqs are dense from 0
/// and the key is fresh per transfer. The u32 seq type bounds any transfer
/// to 2³² chunks; the sender refuses to allocate past that.
pub fn data_nonce(seq: u32) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[8..].copy_from_slice(&seq.to_be_bytes());
    nonce
}

/// Encrypt one chunk payload under the deterministic nonce for `seq`.
///
/// Returns ciphertext with the 16-byte authentication tag appended.
pub fn seal_chunk(key: &TransferKey, seq: u32, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce = data_nonce(seq);
    key.cipher()
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt { seq })
}

/// Decrypt one chunk payload, reconstructing the nonce from `seq`.
///
/// Fails on authentication-tag mismatch: corruption, a wrong key, or a
/// ciphertext replayed under a different seq.
pub fn open_chunk(key: &TransferKey, seq: u32, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce = data_nonce(seq);
    key.cipher()
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt { seq })
}

// ── Control-plane sealing ─────────────────────────────────────────────────────

/// Encrypt a control-plane value (the file digest, a wrapped key) under a
/// fresh random nonce. The nonce is returned and must travel with the
/// ciphertext — control values have no seq to derive one from.
pub fn seal_control(
    key: &TransferKey,
    plaintext: &[u8],
) -> Result<([u8; NONCE_LEN], Vec<u8>), CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let cipher = key
        .cipher()
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &[],
            },
        )
        .map_err(|_| CryptoError::ControlEncrypt)?;
    Ok((nonce, cipher))
}

/// Decrypt a control-plane value with its carried nonce.
pub fn open_control(
    key: &TransferKey,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    key.cipher()
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::ControlDecrypt)
}

// ── File digest ───────────────────────────────────────────────────────────────

/// Incremental SHA-256 over the plaintext file bytes.
///
/// The sender feeds chunks as they are produced and sends the final digest
/// (encrypted) after the last data chunk; the receiver recomputes it over
/// the assembled plaintext and compares.
pub struct FileHasher(Sha256);

impl FileHasher {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        self.0.finalize().into()
    }
}

impl Default for FileHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot SHA-256 of a byte slice.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("chunk encryption failed at seq {seq}")]
    Encrypt { seq: u32 },

    #[error("chunk authentication failed at seq {seq}")]
    Decrypt { seq: u32 },

    #[error("control-plane encryption failed")]
    ControlEncrypt,

    #[error("control-plane authentication failed")]
    ControlDecrypt,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
