//! Control-plane messages.
//!
//! Small, self-describing records exchanged on the ordered, reliable control
//! channel. Encoding is JSON text — both sides agree and the records are
//! tiny next to the data plane. The `type` tag discriminates.

use serde::{Deserialize, Serialize};

use crate::crypto::NONCE_LEN;
use crate::transfer::FileDescriptor;

/// A record on the control channel. Symmetric: either side may send any
/// variant, though in practice direction follows the protocol roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Sender → receiver: the file being offered. First message of a transfer.
    Metadata { descriptor: FileDescriptor },

    /// Receiver → sender: no prior state, start from byte 0.
    StartTransfer,

    /// Receiver → sender: persisted chunks exist; continue from `byte_offset`
    /// with sequence numbering continuing after `received_chunks`.
    ResumeFrom {
        byte_offset: u64,
        received_chunks: Vec<u32>,
    },

    /// Receiver → sender: batched selective acknowledgement. Covers the
    /// contiguous prefix below `cumulative_ack` plus the listed ranges.
    ChunkBatchAck {
        cumulative_ack: u32,
        ranges: Vec<(u32, u32)>,
        received_bytes: u64,
    },

    /// Receiver → sender: re-send these chunks.
    RetransmitRequest { sequences: Vec<u32> },

    /// Wrapped key material from the delegated key agreement, relayed
    /// opaquely through the engine.
    Key { payload: Vec<u8> },

    /// Both sides have derived the shared key; data may flow.
    Ready,

    /// Sender → receiver: encrypted SHA-256 of the full plaintext, sent
    /// after the final data chunk. The nonce travels with the ciphertext —
    /// control values have no seq to derive one from.
    Hash {
        nonce: [u8; NONCE_LEN],
        cipher: Vec<u8>,
    },

    /// Sender → receiver: all chunks sent and acknowledged.
    End,

    /// Either direction: terminal protocol error / cooperative cancel.
    Error { code: ErrorCode, message: String },

    /// Keepalive — keeps NAT mappings warm on the underlying transport.
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

impl ControlMessage {
    /// Encode to the wire text form.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from the wire text form.
    pub fn decode(buf: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(buf)
    }
}

/// Machine-readable cause carried by [`ControlMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Cancelled,
    PeerUnresponsive,
    KeyMismatch,
    IntegrityMismatch,
    SessionTimeout,
    Protocol,
}
