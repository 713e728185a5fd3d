//! Sender engine — sliding window, pacing, retransmission, completion.
//!
//! One engine owns one outbound transfer. All state lives in this struct
//! and is mutated only by its own task: inputs (control messages, key
//! installation, cancellation) arrive through a mailbox and are serialized
//! with the retransmit tick and the send path in a single select loop.
//!
//! The send path suspends at exactly four points: transport backpressure
//! (a one-shot buffered-low waker), an empty token bucket (a refill-length
//! sleep), file slice reads, and encryption — the last two are inline and
//! fast at chunk granularity.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;

use ferry_core::control::ControlMessage;
use ferry_core::crypto::{seal_chunk, seal_control, FileHasher, TransferKey, TAG_LEN};
use ferry_core::wire::{self, FrameKind, HEADER_LEN};
use ferry_core::{EngineConfig, FileDescriptor, Role};

use crate::chunker::ByteSource;
use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::flow::FlowController;
use crate::session::{SessionState, SessionTracker};
use crate::signaling::{SignalMessage, SignalingClient};
use crate::transport::ChannelSet;

/// Mailbox inputs for the sender task.
#[derive(Debug)]
pub enum SenderInput {
    /// A record arrived on the control channel.
    Control(ControlMessage),
    /// Signaling reported `peer_ready`.
    PeerJoined,
    /// The delegated key agreement produced the shared key.
    KeyEstablished([u8; 32]),
    /// Relay opaque key-agreement material to the peer as a `Key` record.
    SendKey(Vec<u8>),
    /// Cooperative cancel from the local application.
    Cancel,
}

/// Why the send path stopped making progress this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    /// Nothing to do until an input arrives.
    Idle,
    /// Window full — waiting on acknowledgements.
    WindowFull,
    /// Token bucket empty — wait roughly this long for a refill.
    NoTokens(Duration),
    /// Every open data channel is at or over the buffer ceiling.
    Backpressure,
    /// Transfer complete.
    Done,
}

/// One unacknowledged chunk.
#[derive(Debug)]
struct Inflight {
    payload: Bytes,
    offset: u64,
    is_last: bool,
    first_sent: Instant,
    last_sent: Instant,
    retries: u32,
}

/// The sending half of a transfer.
pub struct SenderEngine {
    cfg: EngineConfig,
    session: SessionTracker,
    flow: FlowController,
    channels: ChannelSet,
    signaling: Arc<dyn SignalingClient>,
    source: Box<dyn ByteSource>,
    descriptor: FileDescriptor,

    hasher: Option<FileHasher>,
    inflight: BTreeMap<u32, Inflight>,
    window_base: u32,
    next_seq: u32,
    file_offset: u64,

    offered: bool,
    started: bool,
    bytes_acked: u64,
    last_activity: Instant,

    input_rx: mpsc::Receiver<SenderInput>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl SenderEngine {
    /// Build a sender for one file. Returns the engine (drive it with
    /// [`run`](Self::run)), its input mailbox, and its event stream.
    pub fn new(
        cfg: EngineConfig,
        descriptor: FileDescriptor,
        source: Box<dyn ByteSource>,
        channels: ChannelSet,
        signaling: Arc<dyn SignalingClient>,
    ) -> Result<
        (
            Self,
            mpsc::Sender<SenderInput>,
            mpsc::UnboundedReceiver<EngineEvent>,
        ),
        EngineError,
    > {
        if descriptor.size > u32::MAX as u64 {
            // The wire format carries a u32 byte offset.
            return Err(EngineError::FileTooLarge {
                size: descriptor.size,
            });
        }

        let (input_tx, input_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let flow = FlowController::new(&cfg);

        let engine = Self {
            session: SessionTracker::new(Role::Sender),
            flow,
            channels,
            signaling,
            source,
            descriptor,
            hasher: Some(FileHasher::new()),
            inflight: BTreeMap::new(),
            window_base: 0,
            next_seq: 0,
            file_offset: 0,
            offered: false,
            started: false,
            bytes_acked: 0,
            last_activity: Instant::now(),
            input_rx,
            events: event_tx,
            cfg,
        };
        Ok((engine, input_tx, event_rx))
    }

    /// Drive the transfer to completion or failure.
    pub async fn run(mut self) -> Result<(), EngineError> {
        // The offer is posted and the pairing code issued by the embedder;
        // the engine starts out waiting for the peer.
        self.transition(SessionState::Waiting)?;

        match self.drive().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<(), EngineError> {
        let mut tick = tokio::time::interval(self.cfg.timing.retransmit_base());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut keepalive = tokio::time::interval(self.cfg.timing.keepalive());
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let block = self.pump()?;
            if matches!(block, Block::Done) {
                return Ok(());
            }

            let token_wait = match block {
                Block::NoTokens(d) => d.max(Duration::from_millis(1)),
                _ => Duration::ZERO,
            };
            let backpressured = matches!(block, Block::Backpressure);

            tokio::select! {
                maybe = self.input_rx.recv() => match maybe {
                    Some(input) => self.handle_input(input)?,
                    // The embedder dropped the mailbox; nothing more can arrive.
                    None => return Ok(()),
                },
                _ = tick.tick() => self.on_tick()?,
                _ = keepalive.tick() => self.send_control(&ControlMessage::Ping)?,
                _ = self.channels.wait_buffered_low(self.cfg.timing.backpressure_fallback()),
                    if backpressured => {},
                _ = tokio::time::sleep(token_wait), if !token_wait.is_zero() => {},
            }
        }
    }

    // ── Input handling ────────────────────────────────────────────────────────

    fn handle_input(&mut self, input: SenderInput) -> Result<(), EngineError> {
        match input {
            SenderInput::KeyEstablished(bytes) => {
                self.session.install_key(TransferKey::new(bytes))?;
                Ok(())
            }
            SenderInput::PeerJoined => self.on_peer_joined(),
            SenderInput::SendKey(payload) => self.send_control(&ControlMessage::Key { payload }),
            SenderInput::Cancel => Err(EngineError::Cancelled),
            SenderInput::Control(msg) => self.handle_control(msg),
        }
    }

    fn on_peer_joined(&mut self) -> Result<(), EngineError> {
        if self.session.state() != SessionState::Waiting {
            tracing::debug!(state = ?self.session.state(), "peer_ready ignored");
            return Ok(());
        }
        self.transition(SessionState::Ready)?;
        self.offer_file()
    }

    /// Announce the file. Idempotent; refused in terminal states.
    fn offer_file(&mut self) -> Result<(), EngineError> {
        if self.session.state().is_terminal() {
            return Err(EngineError::TerminalState(self.session.state()));
        }
        if self.offered {
            return Ok(());
        }
        self.send_control(&ControlMessage::Metadata {
            descriptor: self.descriptor.clone(),
        })?;
        self.offered = true;
        tracing::info!(
            file = %self.descriptor.name,
            size = self.descriptor.size,
            "file offered"
        );
        self.signal(SignalMessage::TransferReady);
        Ok(())
    }

    fn handle_control(&mut self, msg: ControlMessage) -> Result<(), EngineError> {
        self.last_activity = Instant::now();
        match msg {
            ControlMessage::StartTransfer => self.begin(0, &[]),
            ControlMessage::ResumeFrom {
                byte_offset,
                received_chunks,
            } => self.begin(byte_offset, &received_chunks),
            ControlMessage::ChunkBatchAck {
                cumulative_ack,
                ranges,
                received_bytes,
            } => {
                self.on_sack(cumulative_ack, &ranges, received_bytes);
                Ok(())
            }
            ControlMessage::RetransmitRequest { sequences } => self.on_retransmit_request(&sequences),
            ControlMessage::Ping => self.send_control(&ControlMessage::Pong),
            ControlMessage::Pong => Ok(()),
            ControlMessage::Key { payload } => {
                // Opaque key-agreement material for the embedder.
                self.emit(EngineEvent::KeyMaterial { payload });
                Ok(())
            }
            ControlMessage::Error { code, message } => {
                Err(EngineError::PeerError { code, message })
            }
            other => {
                tracing::debug!(?other, "control message not meaningful to a sender, ignored");
                Ok(())
            }
        }
    }

    /// Initialise (or re-initialise, on reconnect) the send cursor.
    ///
    /// On resume the receiver names its persisted contiguous prefix; seq
    /// numbering continues after it and the skipped bytes are folded into
    /// the digest so the final hash still covers the whole file.
    fn begin(&mut self, byte_offset: u64, received_chunks: &[u32]) -> Result<(), EngineError> {
        if self.session.state() == SessionState::Ready {
            self.transition(SessionState::Transferring)?;
        } else if self.session.state() != SessionState::Transferring {
            return Err(EngineError::TerminalState(self.session.state()));
        }

        self.inflight.clear();
        self.next_seq = received_chunks
            .iter()
            .max()
            .map(|&m| m + 1)
            .unwrap_or(0);
        self.window_base = self.next_seq;
        self.file_offset = byte_offset.min(self.descriptor.size);
        self.bytes_acked = self.file_offset;
        self.started = true;

        // Digest the prefix the receiver already holds.
        if byte_offset > 0 {
            if let Some(hasher) = self.hasher.as_mut() {
                let mut hashed = 0u64;
                while hashed < self.file_offset {
                    let len = ((self.file_offset - hashed) as usize).min(1 << 20);
                    let slice = self.source.read_slice(hashed, len).map_err(|e| {
                        EngineError::SourceRead {
                            offset: hashed,
                            source: e,
                        }
                    })?;
                    hasher.update(&slice);
                    hashed += len as u64;
                }
            }
        }

        tracing::info!(
            byte_offset,
            next_seq = self.next_seq,
            resumed = byte_offset > 0,
            "transfer started"
        );
        Ok(())
    }

    // ── Acknowledgements ──────────────────────────────────────────────────────

    fn on_sack(&mut self, cumulative_ack: u32, ranges: &[(u32, u32)], received_bytes: u64) {
        let mut newest_clean: Option<Instant> = None;
        let mut acked = 0usize;

        // The cumulative prefix is a promise: everything below it is
        // persisted and never needs re-reading.
        while let Some((&seq, _)) = self.inflight.first_key_value() {
            if seq >= cumulative_ack {
                break;
            }
            if let Some(entry) = self.inflight.remove(&seq) {
                acked += 1;
                if entry.retries == 0 {
                    newest_clean = Some(newest_clean.map_or(entry.first_sent, |t: Instant| {
                        t.max(entry.first_sent)
                    }));
                }
            }
        }

        for &(start, end) in ranges {
            for seq in start..=end {
                if let Some(entry) = self.inflight.remove(&seq) {
                    acked += 1;
                    if entry.retries == 0 {
                        newest_clean = Some(newest_clean.map_or(entry.first_sent, |t: Instant| {
                            t.max(entry.first_sent)
                        }));
                    }
                }
            }
        }

        self.window_base = self
            .inflight
            .first_key_value()
            .map(|(&seq, _)| seq)
            .unwrap_or(self.next_seq);

        // Karn's rule: only unretransmitted chunks give unambiguous RTT.
        if let Some(first_sent) = newest_clean {
            self.flow
                .observe_rtt(first_sent.elapsed().as_secs_f64() * 1000.0);
        }

        self.bytes_acked = self.bytes_acked.max(received_bytes);
        if acked > 0 {
            self.emit(EngineEvent::Progress {
                bytes_done: self.bytes_acked,
                bytes_total: self.descriptor.size,
            });
        }
        tracing::trace!(
            cumulative_ack,
            range_count = ranges.len(),
            acked,
            window_base = self.window_base,
            inflight = self.inflight.len(),
            "sack applied"
        );
    }

    // ── Send path ─────────────────────────────────────────────────────────────

    /// Push chunks until something blocks. Sends are non-blocking enqueues;
    /// this method never awaits.
    fn pump(&mut self) -> Result<Block, EngineError> {
        if !self.started || !self.session.can_move_data() {
            return Ok(Block::Idle);
        }

        loop {
            if self.file_offset >= self.descriptor.size {
                if self.inflight.is_empty() {
                    self.finish()?;
                    return Ok(Block::Done);
                }
                return Ok(Block::Idle); // tail chunks still unacked
            }

            let window = self.flow.window_size();
            if (self.next_seq - self.window_base) as usize >= window {
                return Ok(Block::WindowFull);
            }

            let size = self.next_chunk_size()?;
            let Some(channel) = self.channels.pick(self.cfg.channels.max_buffer) else {
                if self.channels.all_closed() {
                    return Err(EngineError::ChannelsClosed);
                }
                return Ok(Block::Backpressure);
            };

            if !self.flow.can_send(size) {
                return Ok(Block::NoTokens(self.flow.time_until(size)));
            }

            let offset = self.file_offset;
            let payload = self
                .source
                .read_slice(offset, size)
                .map_err(|e| EngineError::SourceRead { offset, source: e })?;

            let seq = self.next_seq;
            let is_last = offset + size as u64 == self.descriptor.size;
            let key = self.session.require_key()?;
            let cipher = seal_chunk(key, seq, &payload)?;

            let mut flags = wire::FLAG_ENCRYPTED;
            if is_last {
                flags |= wire::FLAG_LAST;
            }
            let frame = wire::encode_frame(FrameKind::Data, seq, offset as u32, flags, &cipher);

            if channel.send(frame.into()).is_err() {
                // That channel died between pick and send; try again.
                if self.channels.all_closed() {
                    return Err(EngineError::ChannelsClosed);
                }
                continue;
            }

            // Hash only after the chunk is definitely produced — a failed
            // send loops back here and must not digest the slice twice.
            if let Some(hasher) = self.hasher.as_mut() {
                hasher.update(&payload);
            }

            let now = Instant::now();
            self.inflight.insert(
                seq,
                Inflight {
                    payload,
                    offset,
                    is_last,
                    first_sent: now,
                    last_sent: now,
                    retries: 0,
                },
            );
            self.next_seq = self
                .next_seq
                .checked_add(1)
                .ok_or(EngineError::SequenceExhausted)?;
            self.file_offset += size as u64;

            tracing::trace!(seq, offset, size, is_last, "chunk sent");
        }
    }

    /// Size of the next chunk: the RTT-tier choice, capped by the remaining
    /// bytes and by what the transport will carry in one message.
    fn next_chunk_size(&self) -> Result<usize, EngineError> {
        let limit = self
            .channels
            .max_message_size()
            .saturating_sub(HEADER_LEN + TAG_LEN);
        if limit == 0 {
            return Err(EngineError::ChunkTooLarge {
                size: self.cfg.transfer.chunk_size_min as usize,
                limit: self.channels.max_message_size(),
            });
        }
        let remaining = self.descriptor.size - self.file_offset;
        Ok((self.flow.optimal_chunk_size() as u64)
            .min(remaining)
            .min(limit as u64) as usize)
    }

    // ── Retransmission ────────────────────────────────────────────────────────

    fn on_tick(&mut self) -> Result<(), EngineError> {
        let idle = self.last_activity.elapsed();
        if idle >= self.cfg.timing.session_timeout() {
            return Err(EngineError::SessionTimeout(idle));
        }
        self.scan_retransmits()
    }

    /// Walk the inflight table and resend everything past its backoff.
    fn scan_retransmits(&mut self) -> Result<(), EngineError> {
        if self.inflight.is_empty() {
            return Ok(());
        }
        let now = Instant::now();
        let base = self.cfg.timing.retransmit_base();
        let due: Vec<u32> = self
            .inflight
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_sent) >= backoff(base, e.retries))
            .map(|(&seq, _)| seq)
            .collect();

        for seq in due {
            self.resend(seq)?;
        }
        Ok(())
    }

    /// Re-encrypt (deterministic nonce) and resend one chunk.
    fn resend(&mut self, seq: u32) -> Result<(), EngineError> {
        // A saturated transport defers the resend to the next scan without
        // burning a retry.
        let Some(channel) = self.channels.pick(self.cfg.channels.max_buffer) else {
            if self.channels.all_closed() {
                return Err(EngineError::ChannelsClosed);
            }
            return Ok(());
        };

        let key = self.session.require_key()?;
        let Some(entry) = self.inflight.get_mut(&seq) else {
            tracing::debug!(seq, "retransmit for already-acknowledged seq ignored");
            return Ok(());
        };

        entry.retries += 1;
        if entry.retries > self.cfg.retry.hard_retry_limit {
            return Err(EngineError::PeerUnresponsive {
                seq,
                retries: entry.retries,
            });
        }

        let cipher = seal_chunk(key, seq, &entry.payload)?;
        let mut flags = wire::FLAG_ENCRYPTED;
        if entry.is_last {
            flags |= wire::FLAG_LAST;
        }
        let frame = wire::encode_frame(FrameKind::Data, seq, entry.offset as u32, flags, &cipher);
        if channel.send(frame.into()).is_err() {
            entry.retries -= 1; // never sent; not a retry
            return Ok(());
        }
        entry.last_sent = Instant::now();

        let retries = entry.retries;
        if retries == self.cfg.retry.soft_retry_limit + 1 {
            tracing::warn!(seq, retries, "chunk crossed the soft retry limit");
            self.emit(EngineEvent::RetryWarning { seq, retries });
        } else {
            tracing::debug!(seq, retries, "chunk retransmitted");
        }
        Ok(())
    }

    /// The receiver found gaps at assembly; resend the named chunks now.
    fn on_retransmit_request(&mut self, sequences: &[u32]) -> Result<(), EngineError> {
        tracing::debug!(count = sequences.len(), "retransmit request");
        for &seq in sequences {
            self.resend(seq)?;
        }
        Ok(())
    }

    // ── Completion and failure ────────────────────────────────────────────────

    fn finish(&mut self) -> Result<(), EngineError> {
        let Some(hasher) = self.hasher.take() else {
            return Ok(()); // already finished
        };
        let digest = hasher.finalize();

        let key = self.session.require_key()?;
        let (nonce, cipher) = seal_control(key, &digest)?;
        self.send_control(&ControlMessage::Hash { nonce, cipher })?;
        self.send_control(&ControlMessage::End)?;
        self.transition(SessionState::Complete)?;

        tracing::info!(
            file = %self.descriptor.name,
            bytes = self.descriptor.size,
            chunks = self.next_seq,
            digest = hex::encode(digest),
            "transfer complete"
        );
        self.emit(EngineEvent::SendComplete { digest });
        self.signal(SignalMessage::TransferComplete);
        Ok(())
    }

    fn fail(&mut self, error: &EngineError) {
        let code = error.peer_code();
        // Best effort: the peer may already be gone. Never echo a peer's
        // own error report back at it.
        if !matches!(error, EngineError::PeerError { .. }) {
            let _ = self.channels.control().send(&ControlMessage::Error {
                code,
                message: error.to_string(),
            });
        }
        if !self.session.state().is_terminal() {
            let _ = self.session.transition(SessionState::Failed);
            self.emit(EngineEvent::State(SessionState::Failed));
        }
        tracing::error!(error = %error, "transfer failed");
        self.emit(EngineEvent::Failed {
            code,
            message: error.to_string(),
        });
        self.signal(SignalMessage::Error {
            message: error.to_string(),
        });
    }

    // ── Small helpers ─────────────────────────────────────────────────────────

    fn transition(&mut self, to: SessionState) -> Result<(), EngineError> {
        self.session.transition(to)?;
        self.emit(EngineEvent::State(to));
        Ok(())
    }

    fn send_control(&self, msg: &ControlMessage) -> Result<(), EngineError> {
        self.channels
            .control()
            .send(msg)
            .map_err(|_| EngineError::ChannelsClosed)
    }

    /// Best-effort lifecycle relay toward the rendezvous service.
    fn signal(&self, msg: SignalMessage) {
        if let Err(e) = self.signaling.send(&msg) {
            tracing::debug!(error = %e, "signaling relay unavailable");
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

/// Exponential retransmit backoff: base · 2^min(retries, 3), absolute cap
/// of 10× base.
fn backoff(base: Duration, retries: u32) -> Duration {
    let factor = 1u32 << retries.min(3);
    (base * factor).min(base * 10)
}
