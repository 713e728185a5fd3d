//! Events the engines surface to the embedding application.

use bytes::Bytes;

use ferry_core::{ErrorCode, FileDescriptor};

use crate::session::SessionState;

/// Outcome of end-to-end digest verification at assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Digest computed and matched.
    Verified,
    /// File exceeded the verification size cap; digest check skipped.
    SkippedLargeFile,
    /// Sender never supplied a digest.
    NoDigest,
    /// Digest mismatch — the delivered bytes are suspect.
    Mismatch,
}

/// Progress and lifecycle notifications, delivered over an mpsc channel.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Session state moved.
    State(SessionState),

    /// Periodic transfer progress.
    Progress {
        /// Bytes durably acknowledged (sender) or persisted (receiver).
        bytes_done: u64,
        bytes_total: u64,
    },

    /// A chunk crossed the soft retry limit; the transfer continues.
    RetryWarning { seq: u32, retries: u32 },

    /// Opaque key-agreement material arrived in a `Key` control record.
    /// The embedder's (delegated) key exchange consumes it and eventually
    /// injects the derived key back into the engine.
    KeyMaterial { payload: Vec<u8> },

    /// Sender finished: every chunk acknowledged, digest and End sent.
    SendComplete { digest: [u8; 32] },

    /// Receiver finished: file assembled.
    ///
    /// On `VerifyOutcome::Mismatch` the transfer is marked failed but the
    /// bytes are still delivered here — the embedder decides whether to
    /// surface or discard a corrupt-flagged file.
    FileReady {
        descriptor: FileDescriptor,
        verify: VerifyOutcome,
        bytes: Bytes,
    },

    /// Terminal failure.
    Failed { code: ErrorCode, message: String },
}
