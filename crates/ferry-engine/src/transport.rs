//! Transport capability traits.
//!
//! The engine never owns a socket. The embedder (a WebRTC stack, the test
//! harness) implements these traits and hands them in, inverting the
//! dependency so transport, protocol, and engine stay acyclic. Incoming
//! frames and control records are pushed into the engine mailbox by the
//! adapter; these traits cover only the outbound half plus backpressure.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::oneshot;

use ferry_core::ControlMessage;

/// Sending a message on a channel the transport has torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("channel closed")]
pub struct ChannelClosed;

/// One datagram-shaped data channel (ordered delivery not assumed by the
/// engine even if the transport provides it).
///
/// `send` is an enqueue: the transport buffers and reports the backlog via
/// `buffered_amount`. When the sender finds every channel over its buffer
/// ceiling it parks a one-shot waker with `notify_buffered_low` instead of
/// polling.
pub trait DataChannel: Send + Sync {
    /// Enqueue one wire frame. Must not block.
    fn send(&self, frame: Bytes) -> Result<(), ChannelClosed>;

    /// Bytes accepted but not yet handed to the network.
    fn buffered_amount(&self) -> usize;

    /// Register a one-shot waker fired the next time `buffered_amount`
    /// drops below the transport's low threshold. Dropping the receiver
    /// cancels the registration.
    fn notify_buffered_low(&self, waker: oneshot::Sender<()>);

    fn is_open(&self) -> bool;

    /// Largest message the transport will carry. Chunks are capped to this
    /// minus framing overhead.
    fn max_message_size(&self) -> usize {
        262_144
    }
}

/// The ordered, reliable control channel.
pub trait ControlChannel: Send + Sync {
    fn send(&self, msg: &ControlMessage) -> Result<(), ChannelClosed>;
}

/// The sender's view of its parallel data channels plus the control channel.
pub struct ChannelSet {
    data: Vec<Arc<dyn DataChannel>>,
    control: Arc<dyn ControlChannel>,
}

impl ChannelSet {
    /// The engine accepts 1–6 parallel data channels.
    pub const MAX_DATA_CHANNELS: usize = 6;

    pub fn new(
        data: Vec<Arc<dyn DataChannel>>,
        control: Arc<dyn ControlChannel>,
    ) -> Result<Self, ChannelSetError> {
        if data.is_empty() || data.len() > Self::MAX_DATA_CHANNELS {
            return Err(ChannelSetError::BadChannelCount(data.len()));
        }
        Ok(Self { data, control })
    }

    pub fn control(&self) -> &Arc<dyn ControlChannel> {
        &self.control
    }

    pub fn data_channel_count(&self) -> usize {
        self.data.len()
    }

    /// Smallest max-message-size across the data channels.
    pub fn max_message_size(&self) -> usize {
        self.data
            .iter()
            .map(|c| c.max_message_size())
            .min()
            .unwrap_or(262_144)
    }

    /// True when no data channel remains open.
    pub fn all_closed(&self) -> bool {
        self.data.iter().all(|c| !c.is_open())
    }

    /// Pick the channel for the next frame: skip closed channels and those
    /// at or over `max_buffer`; among the rest take the least-buffered,
    /// ties broken by index. None means every open channel is saturated.
    pub fn pick(&self, max_buffer: usize) -> Option<&Arc<dyn DataChannel>> {
        self.data
            .iter()
            .filter(|c| c.is_open() && c.buffered_amount() < max_buffer)
            .min_by_key(|c| c.buffered_amount())
    }

    /// Park until some open channel signals buffered-low, or the bounded
    /// fallback elapses (the low edge can be missed around a race; the
    /// fallback re-probes rather than trusting the transport forever).
    pub async fn wait_buffered_low(&self, fallback: Duration) {
        let mut wakers = Vec::with_capacity(self.data.len());
        for channel in self.data.iter().filter(|c| c.is_open()) {
            let (tx, rx) = oneshot::channel();
            channel.notify_buffered_low(tx);
            wakers.push(rx);
        }
        if wakers.is_empty() {
            tokio::time::sleep(fallback).await;
            return;
        }

        let any_low = async move {
            let mut set: tokio::task::JoinSet<()> = tokio::task::JoinSet::new();
            for rx in wakers {
                set.spawn(async move {
                    let _ = rx.await;
                });
            }
            set.join_next().await;
        };

        tokio::select! {
            _ = any_low => {}
            _ = tokio::time::sleep(fallback) => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelSetError {
    #[error("engine accepts 1-6 data channels, got {0}")]
    BadChannelCount(usize),
}
