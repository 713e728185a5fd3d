//! Ferry integration test harness.
//!
//! Scenarios drive a real sender engine and a real receiver engine against
//! the simulated network in `fault.rs` — no sockets, no signaling server.
//! Both engines run as tasks; the tests inject the shared key and peer
//! presence the way a signaling adapter would, then watch the event
//! streams and the wire taps.
//!
//!   RUST_LOG=ferry_engine=debug cargo test --test integration

mod failures;
mod resume;
mod transfer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ferry_core::{EngineConfig, FileDescriptor, PairingCode};
use ferry_engine::events::{EngineEvent, VerifyOutcome};
use ferry_engine::signaling::SignalingClient;
use ferry_engine::transport::{ChannelSet, ControlChannel, DataChannel};
use ferry_engine::{
    EngineError, MemorySource, ReceiverEngine, ReceiverInput, SenderEngine, SenderInput,
};

use fault::{FaultPlan, NetStats, ReceiverControl, SenderControl, SimDataChannel, SimSignaling};

/// Shared test key, as if both sides just finished the delegated exchange.
pub const TEST_KEY: [u8; 32] = [0x42; 32];

static RUN_ID: AtomicU64 = AtomicU64::new(0);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Unique store root per simulation run.
pub fn temp_root(tag: &str) -> std::path::PathBuf {
    let id = RUN_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("ferry-it-{tag}-{}-{id}", std::process::id()))
}

/// Deterministic pseudo-random file content.
pub fn content(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64).wrapping_mul(2654435761) >> 7) as u8)
        .collect()
}

/// A wired pair of engines over the simulated network.
pub struct Sim {
    pub stats: Arc<NetStats>,
    pub sender_tx: mpsc::Sender<SenderInput>,
    pub receiver_tx: mpsc::Sender<ReceiverInput>,
    pub sender_events: mpsc::UnboundedReceiver<EngineEvent>,
    pub receiver_events: mpsc::UnboundedReceiver<EngineEvent>,
    pub sender_task: JoinHandle<std::result::Result<(), EngineError>>,
    pub receiver_task: JoinHandle<std::result::Result<(), EngineError>>,
    pub data_channels: Vec<Arc<SimDataChannel>>,
}

pub struct SimOptions {
    pub plan: FaultPlan,
    pub data_channels: usize,
    pub store_root: std::path::PathBuf,
    pub code: &'static str,
    pub chunk_size: Option<u32>,
    /// Session key injected on both sides; fresh per session in real use.
    pub key: [u8; 32],
    /// A deliberately different receiver key, for key-mismatch scenarios.
    pub receiver_key: Option<[u8; 32]>,
}

impl SimOptions {
    pub fn new(plan: FaultPlan, store_root: std::path::PathBuf) -> Self {
        Self {
            plan,
            data_channels: 1,
            store_root,
            code: "itest1",
            chunk_size: None,
            key: TEST_KEY,
            receiver_key: None,
        }
    }
}

/// Build both engines, wire them through the fault plan, and start them.
/// The handshake (key + peer presence) is injected before returning.
pub async fn launch(file: Vec<u8>, opts: SimOptions) -> Result<Sim> {
    let stats = Arc::new(NetStats::default());
    let code = PairingCode::parse(opts.code).context("bad test pairing code")?;

    // Receiver first: the data channels deliver into its mailbox.
    let mut receiver_cfg = EngineConfig::default();
    receiver_cfg.store.root = opts.store_root.clone();
    let receiver_control = Arc::new(ReceiverControl::new(stats.clone(), opts.plan.latency));
    let (receiver, receiver_tx, receiver_events) = ReceiverEngine::new(
        receiver_cfg,
        code,
        receiver_control.clone() as Arc<dyn ControlChannel>,
        Arc::new(SimSignaling::new(stats.clone())) as Arc<dyn SignalingClient>,
    );

    // Sender and its channel set, pointing at the receiver mailbox.
    let mut sender_cfg = EngineConfig::default();
    if let Some(chunk) = opts.chunk_size {
        sender_cfg.transfer.chunk_size = chunk;
        sender_cfg.transfer.chunk_size_min = chunk;
        sender_cfg.transfer.chunk_size_max = chunk;
    }
    let data_channels: Vec<Arc<SimDataChannel>> = (0..opts.data_channels)
        .map(|i| {
            let mut plan = opts.plan.clone();
            plan.seed = plan.seed.wrapping_add(i as u64);
            Arc::new(SimDataChannel::new(
                receiver_tx.clone(),
                plan,
                stats.clone(),
            ))
        })
        .collect();
    let channels = ChannelSet::new(
        data_channels
            .iter()
            .map(|c| c.clone() as Arc<dyn DataChannel>)
            .collect(),
        Arc::new(SenderControl::new(receiver_tx.clone(), opts.plan.latency))
            as Arc<dyn ControlChannel>,
    )
    .context("channel set")?;

    let descriptor = FileDescriptor::new(
        "payload.bin",
        file.len() as u64,
        "application/octet-stream",
        sender_cfg.transfer.chunk_size,
    );
    let (sender, sender_tx, sender_events) = SenderEngine::new(
        sender_cfg,
        descriptor,
        Box::new(MemorySource::new(file)),
        channels,
        Arc::new(SimSignaling::new(stats.clone())) as Arc<dyn SignalingClient>,
    )
    .context("sender construction")?;

    // Close the loop: receiver control messages now reach the sender.
    receiver_control.connect(sender_tx.clone());

    let sender_task = tokio::spawn(sender.run());
    let receiver_task = tokio::spawn(receiver.run());

    // The signaling adapter's job: keys first, then peer presence.
    receiver_tx
        .send(ReceiverInput::KeyEstablished(
            opts.receiver_key.unwrap_or(opts.key),
        ))
        .await
        .ok();
    receiver_tx.send(ReceiverInput::PeerJoined).await.ok();
    sender_tx
        .send(SenderInput::KeyEstablished(opts.key))
        .await
        .ok();
    sender_tx.send(SenderInput::PeerJoined).await.ok();

    Ok(Sim {
        stats,
        sender_tx,
        receiver_tx,
        sender_events,
        receiver_events,
        sender_task,
        receiver_task,
        data_channels,
    })
}

/// Wait for the receiver to deliver a file (or fail), with a deadline.
pub async fn wait_for_file(
    events: &mut mpsc::UnboundedReceiver<EngineEvent>,
    deadline: Duration,
) -> Result<(FileDescriptor, VerifyOutcome, Bytes)> {
    let fut = async {
        loop {
            match events.recv().await {
                Some(EngineEvent::FileReady {
                    descriptor,
                    verify,
                    bytes,
                }) => return Ok((descriptor, verify, bytes)),
                Some(EngineEvent::Failed { code, message }) => {
                    bail!("transfer failed: {code:?}: {message}")
                }
                Some(_) => continue,
                None => bail!("receiver event stream closed"),
            }
        }
    };
    tokio::time::timeout(deadline, fut)
        .await
        .context("timed out waiting for file delivery")?
}

/// Wait for an engine to report terminal failure.
pub async fn wait_for_failure(
    events: &mut mpsc::UnboundedReceiver<EngineEvent>,
    deadline: Duration,
) -> Result<(ferry_core::ErrorCode, String)> {
    let fut = async {
        loop {
            match events.recv().await {
                Some(EngineEvent::Failed { code, message }) => return Ok((code, message)),
                Some(EngineEvent::FileReady { .. }) => {
                    bail!("transfer unexpectedly succeeded")
                }
                Some(_) => continue,
                None => bail!("event stream closed without a failure report"),
            }
        }
    };
    tokio::time::timeout(deadline, fut)
        .await
        .context("timed out waiting for failure")?
}

/// Wait for the sender to report completion, returning its digest.
pub async fn wait_for_send_complete(
    events: &mut mpsc::UnboundedReceiver<EngineEvent>,
    deadline: Duration,
) -> Result<[u8; 32]> {
    let fut = async {
        loop {
            match events.recv().await {
                Some(EngineEvent::SendComplete { digest }) => return Ok(digest),
                Some(EngineEvent::Failed { code, message }) => {
                    bail!("sender failed: {code:?}: {message}")
                }
                Some(_) => continue,
                None => bail!("sender event stream closed"),
            }
        }
    };
    tokio::time::timeout(deadline, fut)
        .await
        .context("timed out waiting for sender completion")?
}
