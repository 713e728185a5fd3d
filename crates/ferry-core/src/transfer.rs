//! Transfer identity — pairing codes, transfer ids, file descriptors.

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::sha256;

// ── Pairing code ──────────────────────────────────────────────────────────────

/// Characters a pairing code may contain. Ambiguous glyphs (0/O, 1/l/I)
/// are excluded so codes survive being read aloud.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghjkmnpqrstuvwxyz23456789";

/// Pairing code length in characters.
pub const CODE_LEN: usize = 6;

/// A 6-character opaque, case-sensitive pairing code.
///
/// Issued to the sender by the signaling service and typed in by the
/// receiver. Possession of the code is the only peer authentication the
/// protocol provides.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PairingCode(String);

impl PairingCode {
    /// Generate a random code from the unambiguous alphabet.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let code = (0..CODE_LEN)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    /// Validate and wrap a code received from the peer or the user.
    pub fn parse(s: &str) -> Result<Self, TransferIdError> {
        if s.len() != CODE_LEN || !s.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(TransferIdError::BadCode(s.len()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PairingCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PairingCode {
    type Error = TransferIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<PairingCode> for String {
    fn from(c: PairingCode) -> String {
        c.0
    }
}

// ── Transfer id ───────────────────────────────────────────────────────────────

/// Stable identifier for a resumable transfer: `code ∥ fileName ∥ fileSize`.
///
/// Both sides derive it independently from the pairing code and the file
/// metadata, so a receiver restarted mid-transfer recognises the same file
/// being offered again and can resume from its persisted chunks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(String);

impl TransferId {
    pub fn derive(code: &PairingCode, file_name: &str, file_size: u64) -> Self {
        Self(format!("{}{}{}", code.as_str(), file_name, file_size))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe form: hex SHA-256 of the raw id. File names can
    /// contain path separators; this form cannot.
    pub fn fs_key(&self) -> String {
        hex::encode(sha256(self.0.as_bytes()))
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Role ──────────────────────────────────────────────────────────────────────

/// Which side of the transfer this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

// ── File descriptor ───────────────────────────────────────────────────────────

/// File metadata announced by the sender before any data flows.
///
/// `total_chunks` and `chunk_size` are nominal: adaptive sizing means the
/// actual chunk count is only known once the final chunk (flagged last) has
/// been produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    pub mime: String,
    pub total_chunks: u64,
    pub chunk_size: u32,
    pub encrypted: bool,
}

impl FileDescriptor {
    pub fn new(name: impl Into<String>, size: u64, mime: impl Into<String>, chunk_size: u32) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            name: name.into(),
            size,
            mime: mime.into(),
            total_chunks: size.div_ceil(chunk_size as u64).max(1),
            chunk_size,
            encrypted: true,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferIdError {
    #[error("pairing code must be {CODE_LEN} alphanumeric characters, got {0}")]
    BadCode(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
