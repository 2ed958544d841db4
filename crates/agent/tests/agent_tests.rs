//! End-to-end agent scenarios: the public operations surface, bootstrap
//! sync, the automatic rollback route, and configuration-driven boot.

mod common;

use capstan_agent::{AgentError, Cluster, ClusterSection};
use capstan_config::{Manager, SectionType};
use capstan_consensus::{ConsensusError, MeshNetwork, RaftSection};
use capstan_core::Request;
use capstan_state::StateSection;
use common::{boot_solo, boot_solo_with_state, next_matching, test_cid, FailingAddState};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn single_peer_pin_unpin_surface() {
    let dir = TempDir::new().unwrap();
    let network = MeshNetwork::new();
    let (cluster, mut requests) = boot_solo(&network, dir.path());
    let cid = test_cid(1);

    // Bootstrap ends in a local sync request for the tracker.
    next_matching(&mut requests, |r| matches!(r, Request::LocalSync)).await;

    cluster.pin(&cid).await.unwrap();
    let view = cluster.state_view().await.unwrap();
    assert!(view.has(&cid));
    assert_eq!(
        next_matching(&mut requests, |r| matches!(r, Request::Track(_))).await,
        Request::Track(cid)
    );

    cluster.unpin(&cid).await.unwrap();
    let view = cluster.state_view().await.unwrap();
    assert!(view.is_empty());
    assert_eq!(
        next_matching(&mut requests, |r| matches!(r, Request::Untrack(_))).await,
        Request::Untrack(cid)
    );

    // A second unpin succeeds with no further effect.
    cluster.unpin(&cid).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(requests.try_recv().is_err());

    // The leader of a cluster of one is this peer.
    assert_eq!(cluster.leader().await.unwrap(), cluster.id());

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn request_stream_can_only_be_taken_once() {
    let dir = TempDir::new().unwrap();
    let network = MeshNetwork::new();
    let (cluster, _requests) = boot_solo(&network, dir.path());
    assert!(cluster.requests().is_none());
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn apply_failure_rolls_back_without_operator_help() {
    let dir = TempDir::new().unwrap();
    let network = MeshNetwork::new();
    // The 3rd add fails hard; the agent's router must restore the cluster.
    let (cluster, mut requests) =
        boot_solo_with_state(&network, dir.path(), Box::new(FailingAddState::new(3)));

    let mut committed = Vec::new();
    let mut failure = None;
    for n in 0..5u32 {
        match cluster.pin(&test_cid(n)).await {
            Ok(()) => committed.push(test_cid(n)),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    assert_eq!(committed.len(), 2);
    assert!(matches!(
        failure,
        Some(AgentError::Consensus(ConsensusError::RollbackRequested(_)))
    ));

    // The rollback request stays observable on the public stream.
    next_matching(&mut requests, |r| {
        matches!(r, Request::LeaderEnvelope(inner) if matches!(**inner, Request::Rollback(_)))
    })
    .await;

    // The router acts on it: state converges back to the pre-failure set.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let view = cluster.state_view().await.unwrap();
        let mut expected = committed.clone();
        expected.sort();
        if view.pins == expected && view.version > 3 {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("state did not converge after rollback, view: {view:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_is_idempotent_and_releases_the_log() {
    let dir = TempDir::new().unwrap();
    let network = MeshNetwork::new();
    let (cluster, _requests) = boot_solo(&network, dir.path());
    cluster.pin(&test_cid(0)).await.unwrap();

    cluster.shutdown().await.unwrap();
    cluster.shutdown().await.unwrap();

    // The data directory can be reopened afterwards.
    let (cluster2, _requests2) = boot_solo_with_state(
        &network,
        dir.path(),
        Box::new(capstan_state::MemPinState::new()),
    );
    // Fresh identity, same log dir: the previous engine let go of the lock.
    cluster2.shutdown().await.unwrap();
}

#[tokio::test]
async fn agent_boots_from_a_configuration_document() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("service.json");

    let document = serde_json::json!({
        "cluster": {
            "id": capstan_core::PeerId::random(),
            "listen_address": "127.0.0.1:9196",
            "catch_up_interval_ms": 20,
            "first_sync_delay_ms": 2000
        },
        "consensus": {
            "raft": {
                "data_dir": "raft-data",
                "single_peer": true,
                "heartbeat_interval_ms": 20,
                "election_timeout_min_ms": 100,
                "election_timeout_max_ms": 200
            }
        },
        "state": {
            "pinset": { "type": "memory" }
        }
    });
    std::fs::write(&config_path, serde_json::to_vec_pretty(&document).unwrap()).unwrap();

    let manager = Manager::new();
    let cluster_section = ClusterSection::new();
    let raft_section = RaftSection::new();
    let state_section = StateSection::new();
    manager.register_component(SectionType::Cluster, cluster_section.clone());
    manager.register_component(SectionType::Consensus, raft_section.clone());
    manager.register_component(SectionType::State, state_section.clone());
    manager.load_from_file(&config_path).await.unwrap();

    // The raft data dir resolves relative to the config file.
    let raft_config = raft_section.current();
    assert_eq!(raft_config.data_dir, dir.path().join("raft-data"));

    let cluster_config = cluster_section.current();
    let state = capstan_state::from_config(&state_section.current());
    let network = MeshNetwork::new();
    let (transport, inbound) = network.join(cluster_config.id);
    let cluster = Arc::new(
        Cluster::new(
            &cluster_config,
            &raft_config,
            state,
            Arc::new(transport),
            inbound,
            Some(manager.clone()),
        )
        .unwrap(),
    );

    let cid = test_cid(42);
    cluster.pin(&cid).await.unwrap();
    assert!(cluster.state_view().await.unwrap().has(&cid));

    cluster.shutdown().await.unwrap();
}
