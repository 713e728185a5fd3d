//! Crash-restart resume: kill the receiver mid-transfer, bring up a fresh
//! pair against the same store, and finish the file.

use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use ferry_core::crypto::sha256;
use ferry_engine::events::{EngineEvent, VerifyOutcome};

use crate::fault::FaultPlan;
use crate::*;

const CHUNK: u32 = 256 * 1024;
const FILE_LEN: usize = 16 * 1024 * 1024;
const KILL_AT: u64 = 3 * 1024 * 1024;

/// Kill the receiver once ≥ 3 MiB is persisted; a restarted receiver must
/// announce RESUME_FROM at its persisted offset and the transfer must end
/// byte-exact. A second session means a second, different key.
#[tokio::test]
async fn receiver_restart_resumes_and_completes() -> Result<()> {
    init_tracing();
    let file = content(FILE_LEN);
    let store_root = temp_root("resume");

    // ── Session one: run until enough is persisted, then "crash" ─────────
    let mut opts = SimOptions::new(
        FaultPlan::lossless(Duration::from_millis(20)),
        store_root.clone(),
    );
    opts.chunk_size = Some(CHUNK);
    let mut sim = launch(file.clone(), opts).await?;

    let persisted = loop {
        let event = tokio::time::timeout(Duration::from_secs(60), sim.receiver_events.recv())
            .await
            .context("no progress before kill point")?;
        match event {
            Some(EngineEvent::Progress { bytes_done, .. }) if bytes_done >= KILL_AT => {
                break bytes_done;
            }
            Some(EngineEvent::FileReady { .. }) => {
                bail!("transfer finished before the kill point; slow the link down")
            }
            Some(_) => continue,
            None => bail!("receiver died before the kill point"),
        }
    };

    // Kill both ends without ceremony, as a crash would.
    sim.receiver_task.abort();
    sim.sender_task.abort();
    drop(sim);

    // ── Session two: same code, same file, same store — fresh key ────────
    // Nonces derive from seq, so each session must bring its own key; the
    // persisted chunks are plaintext and survive the key change.
    let mut opts = SimOptions::new(
        FaultPlan::lossless(Duration::from_millis(20)),
        store_root.clone(),
    );
    opts.chunk_size = Some(CHUNK);
    opts.key = [0x43; 32];
    let mut sim = launch(file.clone(), opts).await?;

    let (_, verify, bytes) =
        wait_for_file(&mut sim.receiver_events, Duration::from_secs(120)).await?;
    assert_eq!(verify, VerifyOutcome::Verified);
    assert_eq!(sha256(&bytes), sha256(&file));

    // The restarted receiver resumed rather than starting over.
    let offsets = sim.stats.resume_offsets.lock().unwrap().clone();
    assert_eq!(offsets.len(), 1, "expected exactly one ResumeFrom: {offsets:?}");
    let offset = offsets[0];
    assert_eq!(offset % CHUNK as u64, 0, "resume lands on a chunk boundary");
    // Persisting continues briefly between the observed progress event and
    // the abort; the announced offset sits between the kill point and a
    // modest overshoot, and well short of the whole file.
    assert!(
        offset >= KILL_AT && offset <= (FILE_LEN as u64) / 2,
        "resume offset {offset} outside [{KILL_AT}, {}] (persisted {persisted} at kill)",
        FILE_LEN / 2
    );
    assert_eq!(sim.stats.start_transfers.load(Ordering::Relaxed), 0);

    let _ = std::fs::remove_dir_all(&store_root);
    Ok(())
}

/// A restart against a clean store starts from zero — no phantom resume.
#[tokio::test]
async fn fresh_store_starts_from_zero() -> Result<()> {
    init_tracing();
    let file = content(512 * 1024);
    let store_root = temp_root("fresh");

    let mut sim = launch(
        file.clone(),
        SimOptions::new(FaultPlan::lossless(Duration::from_millis(5)), store_root.clone()),
    )
    .await?;
    let (_, _, bytes) = wait_for_file(&mut sim.receiver_events, Duration::from_secs(30)).await?;
    assert_eq!(&bytes[..], &file[..]);

    assert_eq!(sim.stats.start_transfers.load(Ordering::Relaxed), 1);
    assert!(sim.stats.resume_offsets.lock().unwrap().is_empty());

    let _ = std::fs::remove_dir_all(&store_root);
    Ok(())
}

/// Completion wipes the store: running the same transfer twice start-to-end
/// never resumes.
#[tokio::test]
async fn completed_transfer_leaves_no_state() -> Result<()> {
    init_tracing();
    let file = content(512 * 1024);
    let store_root = temp_root("wipe");

    for _ in 0..2 {
        let mut sim = launch(
            file.clone(),
            SimOptions::new(
                FaultPlan::lossless(Duration::from_millis(5)),
                store_root.clone(),
            ),
        )
        .await?;
        let (_, _, bytes) =
            wait_for_file(&mut sim.receiver_events, Duration::from_secs(30)).await?;
        assert_eq!(&bytes[..], &file[..]);
        assert!(sim.stats.resume_offsets.lock().unwrap().is_empty());
    }

    let _ = std::fs::remove_dir_all(&store_root);
    Ok(())
}
