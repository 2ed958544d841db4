//! The agent controller.
//!
//! [`Cluster`] wires the consensus engine to the rest of the agent: it
//! turns pin/unpin intents into log submissions, re-publishes the engine's
//! effect stream for the pin tracker, routes leader-directed rollback
//! envelopes, and runs the bootstrap catch-up that ends in a `LocalSync`.

use crate::config::ClusterConfig;
use crate::error::AgentResult;
use capstan_config::Manager;
use capstan_consensus::{
    Consensus, ConsensusResult, InboundReceiver, Membership, PeerMessage, PeerTransport,
    RaftConfig,
};
use capstan_core::{request_channel, PeerId, PinCid, Request, RequestSender};
use capstan_state::{PinState, StateView};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The cluster agent controller of one peer.
pub struct Cluster {
    id: PeerId,
    consensus: Arc<Consensus>,
    config_manager: Option<Arc<Manager>>,
    requests_rx: Mutex<Option<mpsc::Receiver<Request>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_done: tokio::sync::Mutex<bool>,
}

impl Cluster {
    /// Boot the agent: start consensus (restoring the last snapshot into
    /// the state), spawn the request router and the catch-up loop.
    ///
    /// `config_manager`, when given, is shut down with the cluster so its
    /// deferred saves drain.
    pub fn new(
        cluster_config: &ClusterConfig,
        raft_config: &RaftConfig,
        state: Box<dyn PinState>,
        transport: Arc<dyn PeerTransport>,
        inbound: InboundReceiver,
        config_manager: Option<Arc<Manager>>,
    ) -> AgentResult<Self> {
        let id = cluster_config.id;
        let membership = Membership {
            id,
            peers: cluster_config.peer_ids(),
        };
        let consensus = Arc::new(Consensus::new(
            raft_config,
            membership,
            transport.clone(),
            inbound,
            state,
        )?);

        let engine_rx = consensus
            .take_requests()
            .unwrap_or_else(|| unreachable!("engine requests taken exactly once, here"));
        let (public_tx, public_rx) = request_channel(id);
        let cancel = CancellationToken::new();

        let router = tokio::spawn(route_requests(
            engine_rx,
            public_tx.clone(),
            consensus.clone(),
            transport,
            id,
            cancel.clone(),
        ));
        let catch_up = tokio::spawn(catch_up(
            consensus.clone(),
            public_tx,
            cluster_config.catch_up_interval(),
            cluster_config.first_sync_delay(),
            cancel.clone(),
        ));

        Ok(Self {
            id,
            consensus,
            config_manager,
            requests_rx: Mutex::new(Some(public_rx)),
            cancel,
            tasks: Mutex::new(vec![router, catch_up]),
            shutdown_done: tokio::sync::Mutex::new(false),
        })
    }

    /// This peer's identity.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Pin a CID cluster-wide.
    pub async fn pin(&self, cid: &PinCid) -> AgentResult<()> {
        tracing::info!(cid = %cid, "pinning");
        self.consensus.log_pin(cid).await?;
        Ok(())
    }

    /// Unpin a CID cluster-wide.
    pub async fn unpin(&self, cid: &PinCid) -> AgentResult<()> {
        tracing::info!(cid = %cid, "unpinning");
        self.consensus.log_unpin(cid).await?;
        Ok(())
    }

    /// A read-only view of the shared state.
    pub async fn state_view(&self) -> AgentResult<StateView> {
        Ok(self.consensus.log_head().await?)
    }

    /// The current cluster leader.
    pub async fn leader(&self) -> AgentResult<PeerId> {
        Ok(self.consensus.leader().await?)
    }

    /// Take the outbound request stream consumed by the pin tracker and
    /// other collaborators. Yields `None` after the first call.
    pub fn requests(&self) -> Option<mpsc::Receiver<Request>> {
        self.requests_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Stop the agent: consensus (final snapshot, transport, log), then the
    /// router and catch-up tasks, then the config manager. Idempotent.
    pub async fn shutdown(&self) -> AgentResult<()> {
        let mut done = self.shutdown_done.lock().await;
        if *done {
            tracing::debug!("cluster already shutdown");
            return Ok(());
        }
        tracing::info!(peer = %self.id, "shutting down cluster agent");

        self.consensus.shutdown().await?;
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        if let Some(manager) = &self.config_manager {
            manager.shutdown().await;
        }
        *done = true;
        tracing::info!(peer = %self.id, "cluster agent stopped");
        Ok(())
    }
}

/// Re-publish the engine's requests for external consumers and act on
/// leader-directed envelopes.
async fn route_requests(
    mut engine_rx: mpsc::Receiver<Request>,
    public: RequestSender,
    consensus: Arc<Consensus>,
    transport: Arc<dyn PeerTransport>,
    id: PeerId,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = engine_rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        match request {
            Request::LeaderEnvelope(inner) => {
                // Keep the envelope observable on the public stream, then
                // route its payload to whoever leads.
                public.emit(Request::LeaderEnvelope(inner.clone()));
                match *inner {
                    Request::Rollback(bytes) => {
                        route_rollback(&consensus, &transport, id, bytes).await;
                    }
                    other => {
                        tracing::warn!(kind = other.tag(), "unhandled leader envelope payload");
                    }
                }
            }
            other => {
                public.emit(other);
            }
        }
    }
}

async fn route_rollback(
    consensus: &Arc<Consensus>,
    transport: &Arc<dyn PeerTransport>,
    id: PeerId,
    bytes: Vec<u8>,
) {
    match consensus.leader().await {
        Ok(leader) if leader == id => {
            let outcome: ConsensusResult<u64> = consensus.rollback(bytes).await;
            match outcome {
                Ok(index) => tracing::info!(index, "cluster rollback issued"),
                Err(e) => tracing::error!(error = %e, "cluster rollback failed"),
            }
        }
        Ok(leader) => {
            match transport
                .call(leader, PeerMessage::LeaderRequest { state: bytes })
                .await
            {
                Ok(_) => tracing::info!(leader = %leader, "rollback request forwarded to leader"),
                Err(e) => {
                    tracing::error!(leader = %leader, error = %e, "could not forward rollback request");
                }
            }
        }
        Err(_) => {
            tracing::warn!("dropping rollback request, no leader known");
        }
    }
}

/// Bootstrap catch-up: poll the applied/last indexes until they meet, then
/// tell the tracker to reconcile. If `first_sync_delay` elapses first, a
/// sync is emitted anyway so the system is live against a possibly-partial
/// state, and another follows once caught up.
async fn catch_up(
    consensus: Arc<Consensus>,
    requests: RequestSender,
    interval: Duration,
    first_sync_delay: Duration,
    cancel: CancellationToken,
) {
    tracing::info!("consensus state is catching up");
    let delay_deadline = tokio::time::Instant::now() + first_sync_delay;
    let mut delay_fired = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(delay_deadline), if !delay_fired => {
                tracing::info!("first sync delay elapsed, reconciling against partial state");
                requests.emit(Request::LocalSync);
                delay_fired = true;
            }
            _ = tokio::time::sleep(interval) => {
                let Ok(status) = consensus.status().await else { return };
                tracing::debug!(
                    applied = status.applied_index,
                    last = status.last_index,
                    "current consensus index"
                );
                if status.applied_index >= status.last_index {
                    requests.emit(Request::LocalSync);
                    return;
                }
            }
        }
    }
}
