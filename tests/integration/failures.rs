//! Failure modes: key mismatch, cancellation, dead transport.

use std::time::Duration;

use anyhow::Result;

use ferry_core::ErrorCode;
use ferry_engine::events::EngineEvent;
use ferry_engine::SenderInput;

use crate::fault::FaultPlan;
use crate::*;

/// Two sides with different keys: every chunk fails authentication, and
/// after enough distinct failures the receiver declares a key mismatch
/// rather than requesting retransmits forever.
#[tokio::test]
async fn mismatched_keys_fail_closed() -> Result<()> {
    init_tracing();
    let file = content(8 * 1024 * 1024);

    let mut opts = SimOptions::new(
        FaultPlan::lossless(Duration::from_millis(5)),
        temp_root("keymismatch"),
    );
    opts.receiver_key = Some([0x99; 32]);
    let mut sim = launch(file, opts).await?;

    let (code, message) =
        wait_for_failure(&mut sim.receiver_events, Duration::from_secs(60)).await?;
    assert_eq!(code, ErrorCode::KeyMismatch, "got: {message}");

    // The receiver's Error record also takes the sender down.
    let (code, _) = wait_for_failure(&mut sim.sender_events, Duration::from_secs(60)).await?;
    assert_eq!(code, ErrorCode::KeyMismatch);
    Ok(())
}

/// Local cancel mid-transfer: the peer is told, and the receiver keeps its
/// persisted chunks so the same transfer id can resume later.
#[tokio::test]
async fn cancel_notifies_peer_and_keeps_partial_state() -> Result<()> {
    init_tracing();
    let file = content(16 * 1024 * 1024);
    let store_root = temp_root("cancel");

    let mut sim = launch(
        file,
        SimOptions::new(
            FaultPlan::lossless(Duration::from_millis(20)),
            store_root.clone(),
        ),
    )
    .await?;

    // Let some chunks land first.
    loop {
        match tokio::time::timeout(Duration::from_secs(60), sim.receiver_events.recv()).await? {
            Some(EngineEvent::Progress { bytes_done, .. }) if bytes_done > 0 => break,
            Some(_) => continue,
            None => anyhow::bail!("receiver exited early"),
        }
    }

    sim.sender_tx.send(SenderInput::Cancel).await.ok();

    let (code, _) = wait_for_failure(&mut sim.sender_events, Duration::from_secs(30)).await?;
    assert_eq!(code, ErrorCode::Cancelled);
    let (code, _) = wait_for_failure(&mut sim.receiver_events, Duration::from_secs(30)).await?;
    assert_eq!(code, ErrorCode::Cancelled);

    // Partial state survives for a later resume.
    let kept = std::fs::read_dir(&store_root)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert!(kept > 0, "receiver discarded resumable state on cancel");

    let _ = std::fs::remove_dir_all(&store_root);
    Ok(())
}

/// Every data channel closed under the sender: the transfer fails instead
/// of spinning on backpressure.
#[tokio::test]
async fn dead_transport_fails_the_sender() -> Result<()> {
    init_tracing();
    let file = content(32 * 1024 * 1024);

    let mut sim = launch(
        file,
        SimOptions::new(
            FaultPlan::lossless(Duration::from_millis(20)),
            temp_root("deadlink"),
        ),
    )
    .await?;

    // Give the transfer a moment to get moving, then cut the link.
    tokio::time::sleep(Duration::from_millis(200)).await;
    for channel in &sim.data_channels {
        channel.close();
    }

    let (code, message) =
        wait_for_failure(&mut sim.sender_events, Duration::from_secs(60)).await?;
    assert_eq!(code, ErrorCode::Protocol, "got: {message}");
    assert!(message.contains("data channel"), "got: {message}");
    Ok(())
}
