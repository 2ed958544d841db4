//! Agent fixtures.

use capstan_agent::{Cluster, ClusterConfig};
use capstan_consensus::{MeshNetwork, RaftConfig};
use capstan_core::{PinCid, Request};
use capstan_state::{MemPinState, PinState};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A deterministic CID for test data.
pub fn test_cid(n: u32) -> PinCid {
    PinCid::from_raw_data(&n.to_le_bytes())
}

/// Boot a single-peer agent with the given state implementation.
pub fn boot_solo_with_state(
    network: &MeshNetwork,
    data_dir: &Path,
    state: Box<dyn PinState>,
) -> (Arc<Cluster>, mpsc::Receiver<Request>) {
    let cluster_config = ClusterConfig::for_testing();
    let mut raft_config = RaftConfig::for_testing(data_dir.join("raft"));
    raft_config.single_peer = true;

    let (transport, inbound) = network.join(cluster_config.id);
    let cluster = Cluster::new(
        &cluster_config,
        &raft_config,
        state,
        Arc::new(transport),
        inbound,
        None,
    )
    .expect("agent should boot");
    let requests = cluster.requests().expect("requests taken once");
    (Arc::new(cluster), requests)
}

/// Boot a single-peer agent with the in-memory state.
pub fn boot_solo(
    network: &MeshNetwork,
    data_dir: &Path,
) -> (Arc<Cluster>, mpsc::Receiver<Request>) {
    boot_solo_with_state(network, data_dir, Box::new(MemPinState::new()))
}

/// Receive requests until one matches `want`, skipping the others. Panics
/// on timeout.
pub async fn next_matching(
    requests: &mut mpsc::Receiver<Request>,
    want: impl Fn(&Request) -> bool,
) -> Request {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or_else(|| panic!("timed out waiting for request"));
        match tokio::time::timeout(remaining, requests.recv()).await {
            Ok(Some(request)) if want(&request) => return request,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("request stream closed"),
            Err(_) => panic!("timed out waiting for request"),
        }
    }
}
