//! Single-peer engine scenarios: pin/unpin semantics, effect ordering,
//! snapshot replay across restarts, and the rollback protocol.

mod common;

use capstan_consensus::{ConsensusError, MeshNetwork};
use capstan_core::Request;
use common::{spawn_peer, spawn_solo, test_cid, wait_for_applied, FailingAddState};
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn pin_unpin_round_trip_with_effects() {
    let dir = TempDir::new().unwrap();
    let network = MeshNetwork::new();
    let mut peer = spawn_solo(&network, dir.path());
    let cid = test_cid(1);

    peer.consensus.log_pin(&cid).await.unwrap();
    let view = peer.consensus.log_head().await.unwrap();
    assert!(view.has(&cid));
    match peer.requests.recv().await.unwrap() {
        Request::Track(tracked) => assert_eq!(tracked, cid),
        other => panic!("expected track, got {other:?}"),
    }

    peer.consensus.log_unpin(&cid).await.unwrap();
    let view = peer.consensus.log_head().await.unwrap();
    assert!(view.is_empty());
    match peer.requests.recv().await.unwrap() {
        Request::Untrack(untracked) => assert_eq!(untracked, cid),
        other => panic!("expected untrack, got {other:?}"),
    }

    // Unpinning again succeeds (the log is authoritative) with no effect.
    peer.consensus.log_unpin(&cid).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(peer.requests.try_recv().is_err());

    peer.consensus.shutdown().await.unwrap();
}

#[tokio::test]
async fn effects_preserve_commit_order() {
    let dir = TempDir::new().unwrap();
    let network = MeshNetwork::new();
    let mut peer = spawn_solo(&network, dir.path());

    for n in 0..20u32 {
        peer.consensus.log_pin(&test_cid(n)).await.unwrap();
    }

    for n in 0..20u32 {
        match peer.requests.recv().await.unwrap() {
            Request::Track(cid) => assert_eq!(cid, test_cid(n), "effect out of order at {n}"),
            other => panic!("expected track, got {other:?}"),
        }
    }

    peer.consensus.shutdown().await.unwrap();
}

#[tokio::test]
async fn pinning_twice_is_idempotent_in_state() {
    let dir = TempDir::new().unwrap();
    let network = MeshNetwork::new();
    let mut peer = spawn_solo(&network, dir.path());
    let cid = test_cid(7);

    peer.consensus.log_pin(&cid).await.unwrap();
    peer.consensus.log_pin(&cid).await.unwrap();

    let view = peer.consensus.log_head().await.unwrap();
    assert_eq!(view.len(), 1);

    // Both applies emit Track: delivery is at-least-once and consumers
    // must tolerate it.
    let mut tracks = 0;
    while let Ok(request) = peer.requests.try_recv() {
        if matches!(request, Request::Track(_)) {
            tracks += 1;
        }
    }
    assert_eq!(tracks, 2);

    peer.consensus.shutdown().await.unwrap();
}

#[tokio::test]
async fn state_replays_from_snapshot_after_restart() {
    let dir = TempDir::new().unwrap();
    let network = MeshNetwork::new();
    let cids: Vec<_> = (0..100u32).map(test_cid).collect();

    let id = {
        let peer = spawn_solo(&network, dir.path());
        for cid in &cids {
            peer.consensus.log_pin(cid).await.unwrap();
        }
        peer.consensus.shutdown().await.unwrap();
        peer.id
    };

    // Reboot the same peer from the same data directory.
    let peer = spawn_peer(
        &network,
        id,
        Vec::new(),
        dir.path(),
        Box::new(capstan_state::MemPinState::new()),
    );
    let view = peer.consensus.log_head().await.unwrap();
    assert_eq!(view.len(), 100);
    for cid in &cids {
        assert!(view.has(cid), "missing {cid} after restart");
    }

    peer.consensus.shutdown().await.unwrap();
}

#[tokio::test]
async fn rollback_on_apply_failure_restores_previous_snapshot() {
    let dir = TempDir::new().unwrap();
    let network = MeshNetwork::new();
    // The 5th add fails hard.
    let mut peer = spawn_peer(
        &network,
        capstan_core::PeerId::random(),
        Vec::new(),
        dir.path(),
        Box::new(FailingAddState::new(5)),
    );

    let mut committed = Vec::new();
    let mut rollback_error = None;
    for n in 0..10u32 {
        let cid = test_cid(n);
        match peer.consensus.log_pin(&cid).await {
            Ok(_) => committed.push(cid),
            Err(e) => {
                rollback_error = Some(e);
                break;
            }
        }
    }
    assert_eq!(committed.len(), 4);
    assert!(matches!(
        rollback_error,
        Some(ConsensusError::RollbackRequested(_))
    ));

    // The applier published exactly one leader-directed rollback request
    // carrying the last known-good snapshot.
    let mut snapshot_bytes = None;
    while let Some(request) = peer.requests.recv().await {
        match request {
            Request::Track(_) => continue,
            Request::LeaderEnvelope(inner) => {
                match *inner {
                    Request::Rollback(bytes) => {
                        snapshot_bytes = Some(bytes);
                        break;
                    }
                    other => panic!("unexpected envelope payload: {other:?}"),
                }
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }
    let snapshot_bytes = snapshot_bytes.expect("rollback request emitted");

    // This peer is the leader; act on the envelope.
    let rollback_index = peer.consensus.rollback(snapshot_bytes).await.unwrap();
    wait_for_applied(&peer.consensus, rollback_index).await;

    let view = peer.consensus.log_head().await.unwrap();
    let mut expected = committed.clone();
    expected.sort();
    assert_eq!(view.pins, expected, "state should match the pre-failure snapshot");

    peer.consensus.shutdown().await.unwrap();
}

#[tokio::test]
async fn second_engine_cannot_open_the_same_log() {
    let dir = TempDir::new().unwrap();
    let network = MeshNetwork::new();
    let peer = spawn_solo(&network, dir.path());

    let config = capstan_consensus::RaftConfig::for_testing(dir.path().join(peer.id.to_string()));
    let (transport, inbound) = network.join(capstan_core::PeerId::random());
    let result = capstan_consensus::Consensus::new(
        &config,
        capstan_consensus::Membership::solo(capstan_core::PeerId::random()),
        std::sync::Arc::new(transport),
        inbound,
        Box::new(capstan_state::MemPinState::new()),
    );
    assert!(matches!(result, Err(ConsensusError::LogLocked(_))));

    peer.consensus.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let network = MeshNetwork::new();
    let peer = spawn_solo(&network, dir.path());
    peer.consensus.log_pin(&test_cid(0)).await.unwrap();

    peer.consensus.shutdown().await.unwrap();
    peer.consensus.shutdown().await.unwrap();
}
