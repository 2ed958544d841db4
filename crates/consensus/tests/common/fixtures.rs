//! Cluster fixtures for consensus integration tests.

use capstan_consensus::{Consensus, Membership, MeshNetwork, RaftConfig};
use capstan_core::{PeerId, PinCid, Request};
use capstan_state::{MemPinState, PinState};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A deterministic CID for test data.
pub fn test_cid(n: u32) -> PinCid {
    PinCid::from_raw_data(&n.to_le_bytes())
}

/// One running consensus peer plus its outbound request stream.
pub struct TestPeer {
    pub id: PeerId,
    pub consensus: Arc<Consensus>,
    pub requests: mpsc::Receiver<Request>,
}

/// Start a peer on `network` with the given membership.
pub fn spawn_peer(
    network: &MeshNetwork,
    id: PeerId,
    others: Vec<PeerId>,
    data_dir: &Path,
    state: Box<dyn PinState>,
) -> TestPeer {
    let (transport, inbound) = network.join(id);
    let mut config = RaftConfig::for_testing(data_dir.join(id.to_string()));
    config.single_peer = others.is_empty();
    let consensus = Consensus::new(
        &config,
        Membership { id, peers: others },
        Arc::new(transport),
        inbound,
        state,
    )
    .expect("consensus should start");
    let requests = consensus.take_requests().expect("requests taken once");
    TestPeer {
        id,
        consensus: Arc::new(consensus),
        requests,
    }
}

/// Start a single-peer cluster with an in-memory state.
pub fn spawn_solo(network: &MeshNetwork, data_dir: &Path) -> TestPeer {
    spawn_peer(
        network,
        PeerId::random(),
        Vec::new(),
        data_dir,
        Box::new(MemPinState::new()),
    )
}

/// Start a cluster of `n` peers with in-memory states.
pub fn spawn_cluster(network: &MeshNetwork, n: usize, data_dir: &Path) -> Vec<TestPeer> {
    let ids: Vec<PeerId> = (0..n).map(|_| PeerId::random()).collect();
    ids.iter()
        .map(|&id| {
            let others: Vec<PeerId> = ids.iter().copied().filter(|&p| p != id).collect();
            spawn_peer(network, id, others, data_dir, Box::new(MemPinState::new()))
        })
        .collect()
}

/// Wait until every listed peer reports the same leader.
pub async fn wait_for_leader(peers: &[&Consensus]) -> PeerId {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let mut leaders = Vec::new();
        for consensus in peers {
            if let Ok(leader) = consensus.leader().await {
                leaders.push(leader);
            }
        }
        if leaders.len() == peers.len() && leaders.iter().all(|&l| l == leaders[0]) {
            return leaders[0];
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for leader election");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait until `consensus` reports at least the given applied index.
pub async fn wait_for_applied(consensus: &Consensus, index: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(status) = consensus.status().await {
            if status.applied_index >= index {
                return;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for entries to apply");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
