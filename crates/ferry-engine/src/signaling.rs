//! Signaling surface — the rendezvous collaborator's interface.
//!
//! The signaling service itself (REST session endpoints plus the WebSocket
//! relay) is an external collaborator. Both engines hold the outbound half
//! as a capability and report lifecycle milestones through it —
//! `transfer_ready` when the offer is posted, `transfer_complete` at either
//! end of a finished transfer, `error` on terminal failure. Inbound
//! signaling events arrive through the engine mailbox like everything else.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use ferry_core::Role;

/// Messages relayed through the signaling WebSocket (`/ws/{code}/{role}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    IceCandidate { candidate: String, role: Role },
    PeerReady,
    Offer { sdp: String },
    Answer { sdp: String },
    Ping,
    Pong,
    TransferReady,
    TransferComplete,
    Error { message: String },
}

/// Outbound half of the signaling connection.
///
/// Implemented by the embedder; the in-memory test harness provides one.
pub trait SignalingClient: Send + Sync {
    fn send(&self, msg: &SignalMessage) -> Result<(), SignalingError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("signaling connection lost")]
    Disconnected,
}

/// A signaling client for embedders that drive the engine without a live
/// signaling connection (tests, local loopback transfers).
pub struct NullSignaling;

impl SignalingClient for NullSignaling {
    fn send(&self, _msg: &SignalMessage) -> Result<(), SignalingError> {
        Ok(())
    }
}
