//! End-to-end transfer scenarios over clean, lossy, reordering, and
//! high-latency links.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::Result;

use ferry_core::crypto::sha256;
use ferry_engine::events::VerifyOutcome;
use ferry_engine::signaling::SignalMessage;

use crate::fault::FaultPlan;
use crate::*;

/// Clean 1 MiB transfer on one channel: byte-exact, verified, at least one
/// batched ACK, and not a single retransmission.
#[tokio::test]
async fn lossless_single_channel() -> Result<()> {
    init_tracing();
    let file = content(1024 * 1024);
    let digest = sha256(&file);

    let opts = SimOptions::new(
        FaultPlan::lossless(Duration::from_millis(10)),
        temp_root("lossless"),
    );
    let mut sim = launch(file.clone(), opts).await?;

    let (descriptor, verify, bytes) =
        wait_for_file(&mut sim.receiver_events, Duration::from_secs(30)).await?;
    let sender_digest =
        wait_for_send_complete(&mut sim.sender_events, Duration::from_secs(30)).await?;

    assert_eq!(descriptor.size, 1024 * 1024);
    assert_eq!(verify, VerifyOutcome::Verified);
    assert_eq!(&bytes[..], &file[..]);
    assert_eq!(sender_digest, digest);
    assert_eq!(sha256(&bytes), digest);

    assert!(sim.stats.ack_messages.load(Ordering::Relaxed) >= 1);
    assert_eq!(sim.stats.total_retransmits(), 0, "clean link, no retransmits");

    // Few chunks, so every flush is timer-driven: acks pace out at the
    // flush interval, never in bursts.
    let instants = sim.stats.ack_instants.lock().unwrap();
    assert!(instants
        .windows(2)
        .all(|w| w[1].duration_since(w[0]) >= Duration::from_millis(50)));
    drop(instants);

    // Lifecycle relay toward signaling: the offer announced the transfer
    // and both ends reported completion.
    let signals = sim.stats.signals.lock().unwrap();
    assert!(signals
        .iter()
        .any(|s| matches!(s, SignalMessage::TransferReady)));
    let completes = signals
        .iter()
        .filter(|s| matches!(s, SignalMessage::TransferComplete))
        .count();
    assert_eq!(completes, 2, "both engines report transfer_complete");
    Ok(())
}

/// Drop every 7th data frame: every dropped seq is eventually retransmitted
/// and the file still arrives byte-exact.
#[tokio::test]
async fn recovers_from_periodic_drops() -> Result<()> {
    init_tracing();
    let file = content(2 * 1024 * 1024);

    let mut plan = FaultPlan::lossless(Duration::from_millis(10));
    plan.drop_every = Some(7);
    let mut sim = launch(file.clone(), SimOptions::new(plan, temp_root("drops"))).await?;

    let (_, verify, bytes) =
        wait_for_file(&mut sim.receiver_events, Duration::from_secs(60)).await?;
    assert_eq!(verify, VerifyOutcome::Verified);
    assert_eq!(&bytes[..], &file[..]);

    let dropped = sim.stats.dropped.load(Ordering::Relaxed);
    assert!(dropped > 0, "the plan should have dropped frames");
    assert!(
        sim.stats.total_retransmits() as usize >= dropped,
        "every dropped frame needs at least one retransmission"
    );

    // Average retry burden stays modest even at 1-in-7 loss.
    let sends = sim.stats.sends_per_seq.lock().unwrap();
    let total: u32 = sends.values().sum();
    let avg = total as f64 / sends.len() as f64;
    assert!(avg < 6.0, "average sends per chunk too high: {avg}");
    Ok(())
}

/// Swap every adjacent pair of frames: the reorder buffer restores order
/// and the cumulative ack trace never moves backwards.
#[tokio::test]
async fn reordered_pairs_are_restored() -> Result<()> {
    init_tracing();
    let file = content(2 * 1024 * 1024);

    let mut plan = FaultPlan::lossless(Duration::from_millis(10));
    plan.swap_pairs = true;
    let mut sim = launch(file.clone(), SimOptions::new(plan, temp_root("reorder"))).await?;

    let (_, _, bytes) = wait_for_file(&mut sim.receiver_events, Duration::from_secs(60)).await?;
    assert_eq!(&bytes[..], &file[..]);

    let trace = sim.stats.cumulative_trace.lock().unwrap();
    assert!(
        trace.windows(2).all(|w| w[0] <= w[1]),
        "cumulative ack went backwards: {trace:?}"
    );
    Ok(())
}

/// Heavy latency with jitter (≈500 ms ± 100 ms RTT): slow but correct.
#[tokio::test]
async fn survives_jittery_half_second_rtt() -> Result<()> {
    init_tracing();
    let file = content(512 * 1024);

    let mut plan = FaultPlan::lossless(Duration::from_millis(250));
    plan.jitter = Duration::from_millis(100);
    let mut sim = launch(file.clone(), SimOptions::new(plan, temp_root("jitter"))).await?;

    let (_, _, bytes) = wait_for_file(&mut sim.receiver_events, Duration::from_secs(120)).await?;
    assert_eq!(&bytes[..], &file[..]);
    Ok(())
}

/// Four parallel channels on a fast link: the window opens past its
/// initial 16, chunks grow to the fast-path tier, and ACK batching keeps
/// the feedback channel quiet.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_channels_scale_up() -> Result<()> {
    init_tracing();
    let file = content(32 * 1024 * 1024);
    let started = Instant::now();

    let mut opts = SimOptions::new(
        FaultPlan::lossless(Duration::from_millis(15)),
        temp_root("parallel"),
    );
    opts.data_channels = 4;
    let mut sim = launch(file.clone(), opts).await?;

    let (_, verify, bytes) =
        wait_for_file(&mut sim.receiver_events, Duration::from_secs(120)).await?;
    let elapsed = started.elapsed();
    assert_eq!(verify, VerifyOutcome::Verified);
    assert_eq!(&bytes[..], &file[..]);

    // Window growth: more chunks in flight at once than the initial 16.
    let peak = sim.stats.max_outstanding.load(Ordering::Relaxed);
    assert!(peak >= 24, "window never opened up: peak inflight {peak}");

    // Chunk adaptation: the fast tier produces ≥ 384 KiB payloads
    // (ciphertext = chunk + 16-byte tag).
    let max_payload = sim.stats.max_payload.load(Ordering::Relaxed);
    assert!(
        max_payload >= 384 * 1024,
        "chunks never grew: max payload {max_payload}"
    );

    // ACK batching: bounded by one per flush interval plus one per full
    // batch, with slack for the final flush and timer skew.
    let chunks = sim.stats.sends_per_seq.lock().unwrap().len();
    let acks = sim.stats.ack_messages.load(Ordering::Relaxed);
    let bound = chunks / 50 + (elapsed.as_millis() / 100) as usize + 4;
    assert!(acks <= bound, "too many ack messages: {acks} > {bound}");
    Ok(())
}

/// Every simulated profile delivers byte-identical content (the fidelity
/// property, run at a smaller size across all fault shapes at once).
#[tokio::test]
async fn byte_fidelity_across_profiles() -> Result<()> {
    init_tracing();
    let file = content(768 * 1024);

    let profiles: Vec<(&str, FaultPlan)> = vec![
        ("clean", FaultPlan::lossless(Duration::from_millis(5))),
        ("drop5", {
            let mut p = FaultPlan::lossless(Duration::from_millis(5));
            p.drop_every = Some(5);
            p
        }),
        ("swap", {
            let mut p = FaultPlan::lossless(Duration::from_millis(5));
            p.swap_pairs = true;
            p
        }),
        ("drop-and-swap", {
            let mut p = FaultPlan::lossless(Duration::from_millis(5));
            p.drop_every = Some(9);
            p.swap_pairs = true;
            p
        }),
    ];

    for (tag, plan) in profiles {
        let mut sim = launch(
            file.clone(),
            SimOptions::new(plan, temp_root(&format!("fidelity-{tag}"))),
        )
        .await?;
        let (_, _, bytes) =
            wait_for_file(&mut sim.receiver_events, Duration::from_secs(60)).await?;
        assert_eq!(sha256(&bytes), sha256(&file), "profile {tag} corrupted data");
    }
    Ok(())
}
