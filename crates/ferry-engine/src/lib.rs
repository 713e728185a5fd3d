//! ferry-engine — the peer-to-peer reliable transfer engine.
//!
//! Two asymmetric halves share one protocol: [`sender::SenderEngine`] chunks,
//! encrypts, paces, and retransmits; [`receiver::ReceiverEngine`] reorders,
//! persists, acknowledges, and assembles. Both are driven as single tasks
//! fed through mailboxes; the transport and signaling collaborators are
//! capability traits supplied by the embedder.

pub mod chunker;
pub mod error;
pub mod events;
pub mod flow;
pub mod receiver;
pub mod reorder;
pub mod sender;
pub mod session;
pub mod signaling;
pub mod store;
pub mod transport;

pub use chunker::{ByteSource, FileSource, MemorySource};
pub use error::EngineError;
pub use events::{EngineEvent, VerifyOutcome};
pub use receiver::{ReceiverEngine, ReceiverInput};
pub use sender::{SenderEngine, SenderInput};
pub use session::{SessionState, SessionTracker};
pub use signaling::{NullSignaling, SignalMessage, SignalingClient};
pub use transport::{ChannelSet, ControlChannel, DataChannel};
