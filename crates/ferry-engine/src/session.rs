//! Session state machine.
//!
//! Shared by both roles: `Idle → Waiting (sender only) → Ready →
//! Transferring → Complete | Failed`. The tracker also sequences key
//! exchange — the shared key is installed exactly once per session, and
//! data transfer cannot begin without it. That ordering is what makes the
//! deterministic chunk nonces safe.

use ferry_core::crypto::TransferKey;
use ferry_core::Role;

use crate::error::EngineError;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session yet.
    Idle,
    /// Sender has posted an offer and holds a pairing code; no peer yet.
    Waiting,
    /// Peer is present and the shared key is derived; data may be offered.
    Ready,
    /// Metadata exchanged; chunks are flowing.
    Transferring,
    /// Terminal: transfer finished.
    Complete,
    /// Terminal: transfer aborted.
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Failed)
    }
}

/// Tracks session state and key-exchange sequencing for one endpoint.
#[derive(Debug)]
pub struct SessionTracker {
    role: Role,
    state: SessionState,
    key: Option<TransferKey>,
}

impl SessionTracker {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: SessionState::Idle,
            key: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Validate and perform a transition.
    pub fn transition(&mut self, to: SessionState) -> Result<(), EngineError> {
        use SessionState::*;
        let valid = match (self.state, to) {
            (Idle, Waiting) => self.role == Role::Sender,
            // Ready means the peer is present AND the shared key is derived;
            // the receiver joins an existing session and skips Waiting.
            (Idle, Ready) | (Waiting, Ready) => self.key.is_some(),
            (Ready, Transferring) => self.key.is_some(),
            (Transferring, Complete) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        };

        if !valid {
            return Err(EngineError::InvalidTransition {
                from: self.state,
                to,
            });
        }

        tracing::debug!(role = ?self.role, from = ?self.state, to = ?to, "session transition");
        self.state = to;
        Ok(())
    }

    /// Install the shared key derived by the delegated key agreement.
    ///
    /// Exactly once per session: a second install is refused so a stale key
    /// can never be reused across transfers (which would repeat nonces).
    pub fn install_key(&mut self, key: TransferKey) -> Result<(), EngineError> {
        if self.key.is_some() {
            return Err(EngineError::KeyAlreadyInstalled);
        }
        if self.state.is_terminal() {
            return Err(EngineError::TerminalState(self.state));
        }
        self.key = Some(key);
        Ok(())
    }

    /// The shared key, if the exchange has completed.
    pub fn key(&self) -> Option<&TransferKey> {
        self.key.as_ref()
    }

    /// The key, or the error every data-plane operation maps its absence to.
    pub fn require_key(&self) -> Result<&TransferKey, EngineError> {
        self.key.as_ref().ok_or(EngineError::KeyMissing)
    }

    /// True when this endpoint may produce or accept DATA frames.
    pub fn can_move_data(&self) -> bool {
        self.state == SessionState::Transferring && self.key.is_some()
    }
}
