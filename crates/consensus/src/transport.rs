//! The peer-to-peer transport contract and an in-process implementation.
//!
//! The consensus engine talks to its peers through [`PeerTransport`], a
//! request/response channel between peer identities. Real network
//! transports live outside the core; [`MeshNetwork`] wires peers together
//! inside one process for single-process clusters and tests, including
//! partition control.

use crate::error::{ConsensusError, ConsensusResult};
use crate::log::LogEntry;
use async_trait::async_trait;
use capstan_core::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// How long a mesh call waits for the remote driver to answer.
const MESH_CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Queue depth of each peer's inbound mailbox.
const INBOX_CAPACITY: usize = 256;

/// A request sent between consensus peers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PeerMessage {
    RequestVote {
        term: u64,
        candidate: PeerId,
        last_log_index: u64,
        last_log_term: u64,
    },
    AppendEntries {
        term: u64,
        leader: PeerId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    InstallSnapshot {
        term: u64,
        leader: PeerId,
        index: u64,
        snapshot_term: u64,
        state: Vec<u8>,
    },
    /// A follower forwarding a submission to the leader.
    ForwardCommit { payload: Vec<u8> },
    /// A leader-directed request (rollback snapshot bytes) routed by the
    /// agent's envelope handler.
    LeaderRequest { state: Vec<u8> },
}

/// The answer to a [`PeerMessage`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PeerReply {
    Vote { term: u64, granted: bool },
    Append {
        term: u64,
        success: bool,
        match_index: u64,
    },
    SnapshotInstalled { term: u64, index: u64 },
    Committed { index: u64 },
    Failed { reason: String },
}

/// An inbound request paired with its reply slot.
pub type InboundRequest = (PeerMessage, oneshot::Sender<PeerReply>);

/// Receiving half of a peer's mailbox, consumed by its consensus driver.
pub type InboundReceiver = mpsc::Receiver<InboundRequest>;

/// Request/response channel between peer identities.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// The identity calls originate from.
    fn local_peer(&self) -> PeerId;

    /// Deliver `msg` to `to` and wait for its reply.
    async fn call(&self, to: PeerId, msg: PeerMessage) -> ConsensusResult<PeerReply>;

    /// Detach from the network. Idempotent; the default does nothing.
    async fn close(&self) {}
}

struct MeshInner {
    inboxes: HashMap<PeerId, mpsc::Sender<InboundRequest>>,
    /// Peers currently cut off from the mesh (both directions).
    down: HashSet<PeerId>,
}

/// An in-process mesh of consensus peers.
#[derive(Clone)]
pub struct MeshNetwork {
    inner: Arc<Mutex<MeshInner>>,
}

impl MeshNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MeshInner {
                inboxes: HashMap::new(),
                down: HashSet::new(),
            })),
        }
    }

    /// Attach a peer, returning its transport handle and the mailbox its
    /// driver must consume.
    pub fn join(&self, peer: PeerId) -> (MeshTransport, InboundReceiver) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.inboxes.insert(peer, tx);
            inner.down.remove(&peer);
        }
        (
            MeshTransport {
                network: self.clone(),
                local: peer,
            },
            rx,
        )
    }

    /// Cut a peer off from the mesh (or reconnect it). Simulates a network
    /// partition: calls from and to a down peer fail.
    pub fn set_partitioned(&self, peer: PeerId, partitioned: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if partitioned {
            inner.down.insert(peer);
        } else {
            inner.down.remove(&peer);
        }
    }

    /// Remove a peer entirely.
    pub fn leave(&self, peer: PeerId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.inboxes.remove(&peer);
        inner.down.remove(&peer);
    }

    fn route(&self, from: PeerId, to: PeerId) -> ConsensusResult<mpsc::Sender<InboundRequest>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.down.contains(&from) || inner.down.contains(&to) {
            return Err(ConsensusError::Transport(format!(
                "peer {to} unreachable from {from}"
            )));
        }
        inner
            .inboxes
            .get(&to)
            .cloned()
            .ok_or_else(|| ConsensusError::Transport(format!("unknown peer {to}")))
    }
}

impl Default for MeshNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// A peer's handle onto a [`MeshNetwork`].
#[derive(Clone)]
pub struct MeshTransport {
    network: MeshNetwork,
    local: PeerId,
}

#[async_trait]
impl PeerTransport for MeshTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn call(&self, to: PeerId, msg: PeerMessage) -> ConsensusResult<PeerReply> {
        let inbox = self.network.route(self.local, to)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        inbox
            .send((msg, reply_tx))
            .await
            .map_err(|_| ConsensusError::Transport(format!("peer {to} mailbox closed")))?;
        match tokio::time::timeout(MESH_CALL_TIMEOUT, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ConsensusError::Transport(format!(
                "peer {to} dropped the request"
            ))),
            Err(_) => Err(ConsensusError::Transport(format!("call to {to} timed out"))),
        }
    }

    async fn close(&self) {
        self.network.leave(self.local);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_reaches_peer_and_returns_reply() {
        let network = MeshNetwork::new();
        let a = PeerId::random();
        let b = PeerId::random();
        let (transport_a, _inbox_a) = network.join(a);
        let (_transport_b, mut inbox_b) = network.join(b);

        tokio::spawn(async move {
            let (msg, reply) = inbox_b.recv().await.unwrap();
            match msg {
                PeerMessage::ForwardCommit { payload } => {
                    assert_eq!(payload, b"op");
                    let _ = reply.send(PeerReply::Committed { index: 42 });
                }
                other => panic!("unexpected message: {other:?}"),
            }
        });

        let reply = transport_a
            .call(b, PeerMessage::ForwardCommit { payload: b"op".to_vec() })
            .await
            .unwrap();
        assert!(matches!(reply, PeerReply::Committed { index: 42 }));
    }

    #[tokio::test]
    async fn partitioned_peer_is_unreachable_both_ways() {
        let network = MeshNetwork::new();
        let a = PeerId::random();
        let b = PeerId::random();
        let (transport_a, _inbox_a) = network.join(a);
        let (transport_b, _inbox_b) = network.join(b);

        network.set_partitioned(b, true);
        assert!(transport_a
            .call(b, PeerMessage::LeaderRequest { state: vec![] })
            .await
            .is_err());
        assert!(transport_b
            .call(a, PeerMessage::LeaderRequest { state: vec![] })
            .await
            .is_err());

        network.set_partitioned(b, false);
        // Reconnected: the call now at least reaches the mailbox.
        let handle = tokio::spawn({
            let transport_a = transport_a.clone();
            async move {
                transport_a
                    .call(b, PeerMessage::LeaderRequest { state: vec![] })
                    .await
            }
        });
        // Nobody answers the mailbox in this test; the call times out rather
        // than failing fast, which is what distinguishes routed from cut.
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ConsensusError::Transport(r)) if r.contains("timed out")));
    }

    #[tokio::test]
    async fn unknown_peer_fails_fast() {
        let network = MeshNetwork::new();
        let a = PeerId::random();
        let (transport_a, _inbox_a) = network.join(a);
        let err = transport_a
            .call(PeerId::random(), PeerMessage::LeaderRequest { state: vec![] })
            .await
            .unwrap_err();
        assert!(matches!(err, ConsensusError::Transport(_)));
    }
}
