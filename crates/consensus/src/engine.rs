//! The consensus engine facade.
//!
//! [`Consensus`] owns the replicated log, the snapshots, and the active pin
//! state, all confined to the driver task. It exposes the shared-state
//! operations the rest of the agent builds on: committing operations,
//! reading the log head, leader discovery, cluster rollback, and shutdown.

use crate::config::RaftConfig;
use crate::error::{ConsensusError, ConsensusResult};
use crate::log::OpLog;
use crate::op::LogOp;
use crate::raft::{Command, RaftDriver, StatusReport};
use crate::snapshots::SnapshotStore;
use crate::transport::{InboundReceiver, PeerTransport};
use capstan_core::{request_channel, PeerId, PinCid, Request, RequestSender};
use capstan_state::{PinState, Snapshot, StateView};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SNAPSHOTS_SUBDIR: &str = "snapshots";

/// This peer's identity and the other members of the cluster.
#[derive(Clone, Debug)]
pub struct Membership {
    pub id: PeerId,
    pub peers: Vec<PeerId>,
}

impl Membership {
    /// A cluster of one.
    pub fn solo(id: PeerId) -> Self {
        Self {
            id,
            peers: Vec::new(),
        }
    }
}

/// Handle onto the consensus subsystem of one peer.
pub struct Consensus {
    id: PeerId,
    commands: mpsc::Sender<Command>,
    requests_tx: RequestSender,
    requests_rx: Mutex<Option<mpsc::Receiver<Request>>>,
    transport: Arc<dyn PeerTransport>,
    commit_timeout: Duration,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
    shutdown_done: tokio::sync::Mutex<bool>,
}

impl Consensus {
    /// Build and start the consensus component.
    ///
    /// Opens the durable log (taking its exclusive lock), restores the pin
    /// state from the latest snapshot, and spawns the driver. Must run
    /// inside a tokio runtime.
    pub fn new(
        config: &RaftConfig,
        membership: Membership,
        transport: Arc<dyn PeerTransport>,
        inbound: InboundReceiver,
        mut state: Box<dyn PinState>,
    ) -> ConsensusResult<Self> {
        tracing::info!(peer = %membership.id, "starting consensus component");

        let log = OpLog::open(&config.data_dir)?;
        let snapshots =
            SnapshotStore::open(&config.data_dir.join(SNAPSHOTS_SUBDIR), config.max_snapshots)?;
        if let Some(snapshot) = snapshots.latest()? {
            state.restore(&snapshot.state)?;
            tracing::info!(
                index = snapshot.index,
                pins = state.list().len(),
                "state restored from snapshot"
            );
        }

        let (requests_tx, requests_rx) = request_channel(membership.id);
        let cancel = CancellationToken::new();
        let (commands_tx, commands_rx) = mpsc::channel(64);

        let (driver, events_rx) = RaftDriver::new(
            membership.id,
            membership.peers,
            config.clone(),
            transport.clone(),
            log,
            snapshots,
            state,
            requests_tx.clone(),
            cancel.clone(),
        );
        let handle = tokio::spawn(driver.run(commands_rx, inbound, events_rx));

        Ok(Self {
            id: membership.id,
            commands: commands_tx,
            requests_tx,
            requests_rx: Mutex::new(Some(requests_rx)),
            transport,
            commit_timeout: config.commit_timeout(),
            cancel,
            driver: Mutex::new(Some(handle)),
            shutdown_done: tokio::sync::Mutex::new(false),
        })
    }

    /// This peer's identity.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Submit a pin of `cid` to the shared state of the cluster.
    pub async fn log_pin(&self, cid: &PinCid) -> ConsensusResult<u64> {
        let index = self.commit_op(LogOp::pin(cid)).await?;
        tracing::info!(cid = %cid, "pin committed to global state");
        Ok(index)
    }

    /// Submit an unpin of `cid` to the shared state of the cluster.
    pub async fn log_unpin(&self, cid: &PinCid) -> ConsensusResult<u64> {
        let index = self.commit_op(LogOp::unpin(cid)).await?;
        tracing::info!(cid = %cid, "unpin committed to global state");
        Ok(index)
    }

    /// Commit an operation to the replicated log and wait until it applies
    /// locally. Returns the log index it landed at.
    pub async fn commit_op(&self, op: LogOp) -> ConsensusResult<u64> {
        let payload = crate::op::LogCommand::Op(op).encode()?;
        self.commit_payload(payload).await
    }

    /// Issue a cluster-wide restore from `state_bytes`. Leader-side
    /// validation rejects bytes that are not a pin-set snapshot.
    pub async fn rollback(&self, state_bytes: Vec<u8>) -> ConsensusResult<u64> {
        Snapshot::decode(&state_bytes)?;
        let payload = crate::op::LogCommand::Rollback(state_bytes).encode()?;
        self.commit_payload(payload).await
    }

    async fn commit_payload(&self, payload: Vec<u8>) -> ConsensusResult<u64> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Commit { payload, reply: tx })
            .await
            .map_err(|_| ConsensusError::ShuttingDown)?;
        match tokio::time::timeout(self.commit_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConsensusError::ShuttingDown),
            Err(_) => Err(ConsensusError::CommitTimeout),
        }
    }

    /// A consistent read-only view of the applied state.
    pub async fn log_head(&self) -> ConsensusResult<StateView> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::View { reply: tx })
            .await
            .map_err(|_| ConsensusError::ShuttingDown)?;
        rx.await.map_err(|_| ConsensusError::ShuttingDown)
    }

    /// The current cluster leader.
    pub async fn leader(&self) -> ConsensusResult<PeerId> {
        self.status().await?.leader.ok_or(ConsensusError::NoLeader)
    }

    /// Driver status: role, term, leader, applied and last log indexes.
    pub async fn status(&self) -> ConsensusResult<StatusReport> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Status { reply: tx })
            .await
            .map_err(|_| ConsensusError::ShuttingDown)?;
        rx.await.map_err(|_| ConsensusError::ShuttingDown)
    }

    /// Take the outbound request stream. Yields `None` after the first call.
    pub fn take_requests(&self) -> Option<mpsc::Receiver<Request>> {
        self.requests_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// A sender onto the outbound request channel, for components (like the
    /// agent's catch-up loop) that emit requests of their own.
    pub fn request_sender(&self) -> RequestSender {
        self.requests_tx.clone()
    }

    /// Stop the engine: final snapshot, driver shutdown, transport close,
    /// log release. Idempotent.
    pub async fn shutdown(&self) -> ConsensusResult<()> {
        let mut done = self.shutdown_done.lock().await;
        if *done {
            tracing::debug!("consensus already shutdown");
            return Ok(());
        }
        tracing::info!("stopping consensus component");

        // Final snapshot; "nothing new" is not a failure.
        match self.take_snapshot().await {
            Ok(Some(index)) => tracing::info!(index, "final snapshot taken"),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(error = %e, "shutdown snapshot failed, continuing");
            }
        }

        self.cancel.cancel();
        let handle = self
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.transport.close().await;
        *done = true;
        Ok(())
    }

    /// Snapshot the applied state and compact the log. `None` when there is
    /// nothing new to snapshot.
    pub async fn take_snapshot(&self) -> ConsensusResult<Option<u64>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::TakeSnapshot { reply: tx })
            .await
            .map_err(|_| ConsensusError::ShuttingDown)?;
        rx.await.map_err(|_| ConsensusError::ShuttingDown)?
    }
}
