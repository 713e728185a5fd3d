//! Receiver engine — reorder, persist, acknowledge, assemble.
//!
//! Mirror of the sender: one engine per inbound transfer, all state owned
//! by one task, inputs serialized through a mailbox. Incoming frames are
//! validated (size, checksum), decrypted with the seq-derived nonce, staged
//! in the reorder buffer, and drained in order into the durable chunk
//! store. Acknowledgements are batched — a seq enters the pending-ACK set
//! only after its chunk is persisted, so every ACK is a durability promise.

use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;

use ferry_core::control::ControlMessage;
use ferry_core::crypto::{open_chunk, open_control, sha256, TransferKey, NONCE_LEN};
use ferry_core::wire::{self, FrameKind, Sack, WireError};
use ferry_core::{EngineConfig, FileDescriptor, PairingCode, Role, TransferId};

use crate::error::EngineError;
use crate::events::{EngineEvent, VerifyOutcome};
use crate::flow::{window_for_rtt, RttWindow};
use crate::reorder::{Insert, ReorderBuffer, StagedChunk};
use crate::session::{SessionState, SessionTracker};
use crate::signaling::{SignalMessage, SignalingClient};
use crate::store::{ChunkStore, StoreMeta};
use crate::transport::ControlChannel;

/// Consecutive framing failures that imply the data path is unusable.
const FRAMING_STORM_LIMIT: u32 = 128;

/// Mailbox inputs for the receiver task.
#[derive(Debug)]
pub enum ReceiverInput {
    /// A raw message arrived on any data channel.
    Frame(Bytes),
    /// A record arrived on the control channel.
    Control(ControlMessage),
    /// The transport is connected to the peer.
    PeerJoined,
    /// The delegated key agreement produced the shared key.
    KeyEstablished([u8; 32]),
    /// Relay opaque key-agreement material to the peer as a `Key` record.
    SendKey(Vec<u8>),
    /// Cooperative cancel from the local application.
    Cancel,
}

/// Receive-side phase within a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for metadata.
    Connecting,
    /// Accepting data frames.
    Receiving,
    /// End seen, reading the store back and verifying.
    Assembling,
    Completed,
}

/// Per-transfer state, created when metadata arrives.
struct ActiveTransfer {
    id: TransferId,
    descriptor: FileDescriptor,
    store: ChunkStore,
    reorder: ReorderBuffer,
    received_bytes: u64,
    /// Seq of the chunk flagged last, once seen.
    last_seq: Option<u32>,
    pending_acks: Vec<u32>,
    /// A stale or duplicate frame arrived: the peer is missing an ACK, so
    /// flush one at the next timer even with nothing newly persisted.
    ack_nudge: bool,
    remote_digest: Option<[u8; 32]>,
    end_received: bool,
}

/// The receiving half of a transfer.
pub struct ReceiverEngine {
    cfg: EngineConfig,
    session: SessionTracker,
    phase: Phase,
    code: PairingCode,
    control: std::sync::Arc<dyn ControlChannel>,
    signaling: std::sync::Arc<dyn SignalingClient>,

    transfer: Option<ActiveTransfer>,
    ready_pending: bool,
    consecutive_decrypt_failures: u32,
    last_decrypt_fail_seq: Option<u32>,
    consecutive_framing_errors: u32,
    last_activity: Instant,
    /// Control-channel RTT measured off the keepalive echo; sizes the
    /// reorder buffer against the sender's window tier.
    control_rtt: RttWindow,
    ping_sent_at: Option<Instant>,

    input_rx: mpsc::Receiver<ReceiverInput>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl ReceiverEngine {
    /// Build a receiver for one pairing code. Returns the engine, its input
    /// mailbox, and its event stream.
    pub fn new(
        cfg: EngineConfig,
        code: PairingCode,
        control: std::sync::Arc<dyn ControlChannel>,
        signaling: std::sync::Arc<dyn SignalingClient>,
    ) -> (
        Self,
        mpsc::Sender<ReceiverInput>,
        mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        let (input_tx, input_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let engine = Self {
            session: SessionTracker::new(Role::Receiver),
            phase: Phase::Connecting,
            code,
            control,
            signaling,
            transfer: None,
            ready_pending: false,
            consecutive_decrypt_failures: 0,
            last_decrypt_fail_seq: None,
            consecutive_framing_errors: 0,
            last_activity: Instant::now(),
            control_rtt: RttWindow::default(),
            ping_sent_at: None,
            input_rx,
            events: event_tx,
            cfg,
        };
        (engine, input_tx, event_rx)
    }

    /// Drive the transfer to completion or failure.
    pub async fn run(mut self) -> Result<(), EngineError> {
        match self.drive().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<(), EngineError> {
        let mut flush = tokio::time::interval(self.cfg.timing.sack_flush());
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut keepalive = tokio::time::interval(self.cfg.timing.keepalive());
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.phase == Phase::Completed {
                return Ok(());
            }

            tokio::select! {
                maybe = self.input_rx.recv() => match maybe {
                    Some(input) => self.handle_input(input)?,
                    None => return Ok(()),
                },
                _ = flush.tick() => self.on_flush_tick()?,
                _ = keepalive.tick() => {
                    self.send_keepalive()?;
                    let idle = self.last_activity.elapsed();
                    if idle >= self.cfg.timing.session_timeout() {
                        return Err(EngineError::SessionTimeout(idle));
                    }
                }
            }
        }
    }

    // ── Input handling ────────────────────────────────────────────────────────

    fn handle_input(&mut self, input: ReceiverInput) -> Result<(), EngineError> {
        match input {
            ReceiverInput::Frame(buf) => self.on_data_frame(&buf),
            ReceiverInput::Control(msg) => self.handle_control(msg),
            ReceiverInput::PeerJoined => {
                if self.session.key().is_some() {
                    self.ensure_ready()
                } else {
                    self.ready_pending = true;
                    Ok(())
                }
            }
            ReceiverInput::KeyEstablished(bytes) => {
                self.session.install_key(TransferKey::new(bytes))?;
                if self.ready_pending {
                    self.ready_pending = false;
                    self.ensure_ready()?;
                }
                Ok(())
            }
            ReceiverInput::SendKey(payload) => self.send_control(&ControlMessage::Key { payload }),
            ReceiverInput::Cancel => Err(EngineError::Cancelled),
        }
    }

    fn ensure_ready(&mut self) -> Result<(), EngineError> {
        if self.session.state() == SessionState::Idle {
            self.transition(SessionState::Ready)?;
        }
        Ok(())
    }

    fn handle_control(&mut self, msg: ControlMessage) -> Result<(), EngineError> {
        self.last_activity = Instant::now();
        match msg {
            ControlMessage::Metadata { descriptor } => self.on_metadata(descriptor),
            ControlMessage::Hash { nonce, cipher } => self.on_hash(&nonce, &cipher),
            ControlMessage::End => self.on_end(),
            ControlMessage::Ping => self.send_control(&ControlMessage::Pong),
            ControlMessage::Pong => {
                self.on_pong();
                Ok(())
            }
            ControlMessage::Key { payload } => {
                self.emit(EngineEvent::KeyMaterial { payload });
                Ok(())
            }
            ControlMessage::Error { code, message } => Err(EngineError::PeerError { code, message }),
            other => {
                tracing::debug!(?other, "control message not meaningful to a receiver, ignored");
                Ok(())
            }
        }
    }

    // ── Metadata / resume ─────────────────────────────────────────────────────

    /// The sender announced a file: open its store and decide between a
    /// fresh start and a resume from persisted chunks.
    fn on_metadata(&mut self, descriptor: FileDescriptor) -> Result<(), EngineError> {
        self.ensure_ready()?;
        if self.session.state() == SessionState::Ready {
            self.transition(SessionState::Transferring)?;
        } else if self.session.state() != SessionState::Transferring {
            return Err(EngineError::TerminalState(self.session.state()));
        }

        let id = TransferId::derive(&self.code, &descriptor.name, descriptor.size);
        let store = ChunkStore::open(&self.cfg.store.root, &id)?;
        let meta = store.load_meta()?;
        let persisted = store.sequences()?;

        let resume = match meta {
            Some(meta) if !persisted.is_empty() && meta.descriptor == descriptor => Some(meta),
            _ => None,
        };

        let reorder_cap = self.reorder_cap();
        let transfer = match resume {
            Some(_) => {
                // The chunk files, not the sidecar, are authoritative: a
                // crash can land between a put and the sidecar write, so
                // rebuild the cursor from the contiguous persisted prefix.
                let mut next_expected = 0u32;
                for &seq in &persisted {
                    if seq == next_expected {
                        next_expected += 1;
                    } else {
                        break;
                    }
                }
                let prefix: Vec<u32> = (0..next_expected).collect();
                let mut received_bytes = 0u64;
                let mut last_seq = None;
                for &seq in &prefix {
                    if let Some(record) = store.get(seq)? {
                        received_bytes += record.payload.len() as u64;
                        if record.is_last {
                            last_seq = Some(seq);
                        }
                    }
                }

                tracing::info!(
                    transfer = %id,
                    byte_offset = received_bytes,
                    chunks = prefix.len(),
                    "resuming from persisted state"
                );
                self.send_control(&ControlMessage::ResumeFrom {
                    byte_offset: received_bytes,
                    received_chunks: prefix,
                })?;
                ActiveTransfer {
                    id,
                    descriptor,
                    reorder: ReorderBuffer::new(next_expected, reorder_cap),
                    received_bytes,
                    last_seq,
                    pending_acks: Vec::new(),
                    ack_nudge: false,
                    remote_digest: None,
                    end_received: false,
                    store,
                }
            }
            None => {
                // Anything on disk belongs to an older, incompatible run.
                store.delete_all()?;
                let store = ChunkStore::open(&self.cfg.store.root, &id)?;
                tracing::info!(transfer = %id, size = descriptor.size, "starting fresh");
                self.send_control(&ControlMessage::StartTransfer)?;
                ActiveTransfer {
                    id,
                    descriptor,
                    reorder: ReorderBuffer::new(0, reorder_cap),
                    received_bytes: 0,
                    last_seq: None,
                    pending_acks: Vec::new(),
                    ack_nudge: false,
                    remote_digest: None,
                    end_received: false,
                    store,
                }
            }
        };

        self.transfer = Some(transfer);
        self.phase = Phase::Receiving;
        Ok(())
    }

    /// Reorder staging cap: 4× the window tier for the measured control
    /// RTT, 4× the initial window until a keepalive echo sizes it.
    fn reorder_cap(&self) -> usize {
        4 * window_for_rtt(self.control_rtt.mean(), self.cfg.retry.initial_window)
    }

    /// The keepalive doubles as the receiver's RTT probe. A new ping
    /// supersedes an unanswered one.
    fn send_keepalive(&mut self) -> Result<(), EngineError> {
        self.ping_sent_at = Some(Instant::now());
        self.send_control(&ControlMessage::Ping)
    }

    /// Sample the echo and re-bound the reorder buffer for the tier the
    /// sender's window will be running at.
    fn on_pong(&mut self) {
        let Some(sent) = self.ping_sent_at.take() else {
            return;
        };
        let rtt_ms = sent.elapsed().as_secs_f64() * 1000.0;
        self.control_rtt.push(rtt_ms);
        let cap = self.reorder_cap();
        if let Some(t) = self.transfer.as_mut() {
            t.reorder.set_capacity(cap);
        }
        tracing::trace!(rtt_ms, cap, "keepalive echo sampled");
    }

    // ── Data path ─────────────────────────────────────────────────────────────

    fn on_data_frame(&mut self, buf: &[u8]) -> Result<(), EngineError> {
        self.last_activity = Instant::now();

        let frame = match wire::decode_frame(buf) {
            Ok(frame) => {
                self.consecutive_framing_errors = 0;
                frame
            }
            Err(e) => return self.on_framing_error(e),
        };

        match frame.kind {
            FrameKind::Data => {}
            FrameKind::VideoData | FrameKind::Fec => {
                tracing::debug!(kind = ?frame.kind, "ack-less mode frame ignored");
                return Ok(());
            }
            other => {
                tracing::debug!(kind = ?other, "unexpected frame kind on data channel");
                return Ok(());
            }
        }

        if self.phase != Phase::Receiving && self.phase != Phase::Assembling {
            tracing::debug!(seq = frame.seq, phase = ?self.phase, "data frame outside transfer");
            return Ok(());
        }
        let Some(key) = self.session.key() else {
            tracing::warn!(seq = frame.seq, "data frame before key exchange, dropped");
            return Ok(());
        };

        // Decrypt with the seq-derived nonce.
        let plaintext = if frame.is_encrypted {
            match open_chunk(key, frame.seq, &frame.payload) {
                Ok(p) => {
                    self.consecutive_decrypt_failures = 0;
                    self.last_decrypt_fail_seq = None;
                    Bytes::from(p)
                }
                Err(_) => return self.on_decrypt_failure(frame.seq),
            }
        } else {
            frame.payload.clone()
        };

        let Some(t) = self.transfer.as_mut() else {
            return Ok(());
        };

        let outcome = t.reorder.insert(
            frame.seq,
            StagedChunk {
                offset: frame.offset,
                is_last: frame.is_last,
                payload: plaintext,
            },
        );
        match outcome {
            Insert::Staged => {
                // The tail is known as soon as the flagged chunk is seen,
                // even while it waits in the reorder buffer.
                if frame.is_last {
                    t.last_seq = Some(frame.seq);
                }
            }
            Insert::Duplicate | Insert::Stale => {
                // The peer is resending something we hold: its ACK got lost.
                t.ack_nudge = true;
                return Ok(());
            }
            Insert::Overflow => {
                tracing::warn!(
                    seq = frame.seq,
                    staged = t.reorder.len(),
                    "reorder buffer full, frame dropped"
                );
                return Ok(());
            }
        }

        self.drain_ready()?;

        let flush_now = self
            .transfer
            .as_ref()
            .is_some_and(|t| t.pending_acks.len() >= self.cfg.retry.sack_batch_size);
        if flush_now {
            self.flush_acks()?;
        }
        self.maybe_assemble()
    }

    /// Move the contiguous prefix out of the reorder buffer into the store.
    /// Each persisted seq joins the pending-ACK set; the sidecar is updated
    /// after every put so a crash never forgets persisted chunks.
    fn drain_ready(&mut self) -> Result<(), EngineError> {
        let Some(t) = self.transfer.as_mut() else {
            return Ok(());
        };

        while let Some((seq, chunk)) = t.reorder.pop_ready() {
            t.store.put(seq, chunk.offset, chunk.is_last, &chunk.payload)?;
            t.received_bytes += chunk.payload.len() as u64;
            if chunk.is_last {
                t.last_seq = Some(seq);
            }
            t.pending_acks.push(seq);
            t.store.save_meta(&StoreMeta {
                next_expected: t.reorder.next_expected(),
                received_bytes: t.received_bytes,
                last_seq: t.last_seq,
                descriptor: t.descriptor.clone(),
                updated_at: crate::store::unix_now(),
            })?;
        }
        Ok(())
    }

    fn on_framing_error(&mut self, e: WireError) -> Result<(), EngineError> {
        self.consecutive_framing_errors += 1;
        if self.consecutive_framing_errors >= FRAMING_STORM_LIMIT {
            return Err(e.into());
        }
        tracing::warn!(error = %e, "framing error");
        if let Some(seq) = e.seq() {
            self.send_control(&ControlMessage::RetransmitRequest {
                sequences: vec![seq],
            })?;
        }
        Ok(())
    }

    /// An AEAD failure on one chunk asks for a retransmit; a run of them
    /// across distinct seqs means the two sides disagree on the key.
    fn on_decrypt_failure(&mut self, seq: u32) -> Result<(), EngineError> {
        if self.last_decrypt_fail_seq != Some(seq) {
            self.consecutive_decrypt_failures += 1;
            self.last_decrypt_fail_seq = Some(seq);
        }
        if self.consecutive_decrypt_failures >= self.cfg.retry.decrypt_failure_limit {
            return Err(EngineError::KeyMismatch(self.consecutive_decrypt_failures));
        }
        tracing::warn!(seq, "chunk failed authentication, requesting retransmit");
        self.send_control(&ControlMessage::RetransmitRequest {
            sequences: vec![seq],
        })
    }

    // ── Acknowledgement batching ──────────────────────────────────────────────

    fn on_flush_tick(&mut self) -> Result<(), EngineError> {
        let due = self
            .transfer
            .as_ref()
            .is_some_and(|t| !t.pending_acks.is_empty() || t.ack_nudge);
        if due {
            self.flush_acks()?;
        }
        Ok(())
    }

    /// Emit one `ChunkBatchAck` covering everything persisted so far.
    /// Quiet when there is nothing new to acknowledge and no nudge pending.
    fn flush_acks(&mut self) -> Result<(), EngineError> {
        let Some(t) = self.transfer.as_mut() else {
            return Ok(());
        };
        if t.pending_acks.is_empty() && !t.ack_nudge {
            return Ok(());
        }
        let sack = Sack::from_sequences(t.reorder.next_expected(), &t.pending_acks);
        let received_bytes = t.received_bytes;
        let acked = t.pending_acks.len();
        t.pending_acks.clear();
        t.ack_nudge = false;
        let total = t.descriptor.size;

        self.send_control(&ControlMessage::ChunkBatchAck {
            cumulative_ack: sack.cumulative_ack,
            ranges: sack.ranges,
            received_bytes,
        })?;
        tracing::trace!(
            cumulative_ack = sack.cumulative_ack,
            acked,
            received_bytes,
            "ack batch flushed"
        );
        self.emit(EngineEvent::Progress {
            bytes_done: received_bytes,
            bytes_total: total,
        });
        Ok(())
    }

    // ── Completion ────────────────────────────────────────────────────────────

    fn on_hash(&mut self, nonce: &[u8; NONCE_LEN], cipher: &[u8]) -> Result<(), EngineError> {
        let Some(key) = self.session.key() else {
            tracing::warn!("hash frame before key exchange, dropped");
            return Ok(());
        };
        match open_control(key, nonce, cipher) {
            Ok(digest) if digest.len() == 32 => {
                let mut d = [0u8; 32];
                d.copy_from_slice(&digest);
                if let Some(t) = self.transfer.as_mut() {
                    t.remote_digest = Some(d);
                }
                Ok(())
            }
            Ok(_) | Err(_) => {
                // Delivery can proceed without a digest; verification will
                // report that nothing could be checked.
                tracing::warn!("hash frame failed authentication, digest unavailable");
                Ok(())
            }
        }
    }

    fn on_end(&mut self) -> Result<(), EngineError> {
        if let Some(t) = self.transfer.as_mut() {
            t.end_received = true;
        }
        self.maybe_assemble()
    }

    /// Assemble once End has arrived and every seq up to the last chunk is
    /// persisted. End (not the last chunk itself) gates assembly so the
    /// digest, which the sender emits just before End, is on hand to verify.
    fn maybe_assemble(&mut self) -> Result<(), EngineError> {
        let Some(t) = self.transfer.as_ref() else {
            return Ok(());
        };
        if !t.end_received {
            return Ok(());
        }
        let ready = if t.descriptor.size == 0 {
            // Empty file: no chunks exist, End is the whole signal.
            true
        } else {
            match t.last_seq {
                Some(last) => t.reorder.next_expected() > last,
                None => false,
            }
        };
        if !ready {
            // End arrived while holes remain: ask for what's missing.
            return self.request_missing();
        }
        self.assemble()
    }

    /// Gap check between the persisted prefix and the known tail; revert to
    /// receiving until retransmissions fill the holes.
    fn request_missing(&mut self) -> Result<(), EngineError> {
        let Some(t) = self.transfer.as_ref() else {
            return Ok(());
        };
        let Some(last) = t.last_seq else {
            // Tail still unknown; the sender's retransmit scan re-offers it.
            return Ok(());
        };
        let missing: Vec<u32> = (t.reorder.next_expected()..=last)
            .filter(|&seq| !t.reorder.contains(seq))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        self.phase = Phase::Receiving;
        tracing::info!(count = missing.len(), "gaps at assembly, requesting retransmits");
        self.send_control(&ControlMessage::RetransmitRequest { sequences: missing })
    }

    fn assemble(&mut self) -> Result<(), EngineError> {
        self.phase = Phase::Assembling;
        // Final ACK flush so the sender's window clears before we verify.
        self.flush_acks()?;

        let Some(t) = self.transfer.as_mut() else {
            return Ok(());
        };

        let size = t.descriptor.size as usize;
        let mut buffer = vec![0u8; size];
        let mut written = 0usize;
        for record in t.store.get_all()? {
            let start = record.offset as usize;
            let end = start + record.payload.len();
            if end > size {
                return Err(EngineError::Wire(WireError::LengthMismatch {
                    seq: record.seq,
                    declared: end,
                    actual: size,
                }));
            }
            buffer[start..end].copy_from_slice(&record.payload);
            written += record.payload.len();
        }
        if written != size {
            // Should be unreachable behind the gap check; treat as holes.
            tracing::warn!(written, size, "assembly found missing bytes");
            return self.request_missing();
        }

        let bytes = Bytes::from(buffer);
        let mut mismatch = None;
        let verify = match t.remote_digest {
            None => VerifyOutcome::NoDigest,
            Some(_)
                if self.cfg.transfer.verify_cap_bytes > 0
                    && t.descriptor.size > self.cfg.transfer.verify_cap_bytes =>
            {
                VerifyOutcome::SkippedLargeFile
            }
            Some(expected) => {
                let actual = sha256(&bytes);
                if actual == expected {
                    VerifyOutcome::Verified
                } else {
                    mismatch = Some((hex::encode(expected), hex::encode(actual)));
                    VerifyOutcome::Mismatch
                }
            }
        };

        let descriptor = t.descriptor.clone();
        tracing::info!(
            transfer = %t.id,
            bytes = descriptor.size,
            ?verify,
            "file assembled"
        );
        t.store.delete_all()?;

        // Deliver even on mismatch — the embedder sees the verdict and
        // decides whether a corrupt-flagged file is worth keeping.
        self.emit(EngineEvent::FileReady {
            descriptor,
            verify,
            bytes,
        });

        if let Some((expected, actual)) = mismatch {
            return Err(EngineError::IntegrityMismatch { expected, actual });
        }

        self.transition(SessionState::Complete)?;
        self.phase = Phase::Completed;
        self.signal(SignalMessage::TransferComplete);
        Ok(())
    }

    // ── Failure and helpers ───────────────────────────────────────────────────

    fn fail(&mut self, error: &EngineError) {
        let code = error.peer_code();
        if !matches!(error, EngineError::PeerError { .. }) {
            let _ = self.control.send(&ControlMessage::Error {
                code,
                message: error.to_string(),
            });
        }
        if !self.session.state().is_terminal() {
            let _ = self.session.transition(SessionState::Failed);
            self.emit(EngineEvent::State(SessionState::Failed));
        }
        // Persisted chunks are kept: the same transfer id can resume later.
        tracing::error!(error = %error, "transfer failed");
        self.emit(EngineEvent::Failed {
            code,
            message: error.to_string(),
        });
        self.signal(SignalMessage::Error {
            message: error.to_string(),
        });
    }

    fn transition(&mut self, to: SessionState) -> Result<(), EngineError> {
        self.session.transition(to)?;
        self.emit(EngineEvent::State(to));
        Ok(())
    }

    fn send_control(&self, msg: &ControlMessage) -> Result<(), EngineError> {
        self.control
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
