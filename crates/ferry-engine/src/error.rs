//! Engine error taxonomy.
//!
//! Per-chunk recoverable conditions (framing damage, checksum or AEAD
//! failure on one frame) never appear here — the engines handle those
//! internally with retransmit requests. These are the conditions that end a
//! transfer or reject an operation.

use std::time::Duration;

use ferry_core::config::ConfigError;
use ferry_core::crypto::CryptoError;
use ferry_core::wire::WireError;
use thiserror::Error;

use crate::session::SessionState;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid session transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    #[error("shared key not established — refusing to touch data frames")]
    KeyMissing,

    #[error("a shared key was already installed for this session; keys must be fresh per transfer")]
    KeyAlreadyInstalled,

    #[error("operation invalid in terminal state {0:?}")]
    TerminalState(SessionState),

    #[error("sequence space exhausted — transfer exceeds 2^32 chunks")]
    SequenceExhausted,

    #[error("file of {size} bytes exceeds the wire format's 32-bit byte offsets")]
    FileTooLarge { size: u64 },

    #[error("chunk of {size} bytes exceeds channel message limit {limit}")]
    ChunkTooLarge { size: usize, limit: usize },

    #[error("peer unresponsive: seq {seq} still unacknowledged after {retries} retries")]
    PeerUnresponsive { seq: u32, retries: u32 },

    #[error("presumed key mismatch: {0} consecutive chunks failed authentication")]
    KeyMismatch(u32),

    #[error("integrity mismatch: sender digest {expected}, assembled digest {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("no data channel is open")]
    ChannelsClosed,

    #[error("session inactive for {0:?}")]
    SessionTimeout(Duration),

    #[error("peer reported error ({code:?}): {message}")]
    PeerError {
        code: ferry_core::ErrorCode,
        message: String,
    },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("file read failed at offset {offset}: {source}")]
    SourceRead {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// The control-plane error code reported to the peer when this error
    /// terminates a transfer.
    pub fn peer_code(&self) -> ferry_core::ErrorCode {
        use ferry_core::ErrorCode;
        match self {
            EngineError::PeerUnresponsive { .. } => ErrorCode::PeerUnresponsive,
            EngineError::KeyMismatch(_) => ErrorCode::KeyMismatch,
            EngineError::IntegrityMismatch { .. } => ErrorCode::IntegrityMismatch,
            EngineError::SessionTimeout(_) => ErrorCode::SessionTimeout,
            EngineError::Cancelled => ErrorCode::Cancelled,
            // A peer-reported failure keeps the peer's own classification.
            EngineError::PeerError { code, .. } => *code,
            _ => ErrorCode::Protocol,
        }
    }
}
