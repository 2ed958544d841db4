//! The Raft-family replication driver.
//!
//! One task per peer owns the whole consensus state: role, term, durable
//! log, snapshots, and the pin state the applier mutates. Everything else
//! talks to it through command and event channels, so there is exactly one
//! writer and no locks around the log or the state.

use crate::config::RaftConfig;
use crate::error::{ConsensusError, ConsensusResult};
use crate::log::{LogEntry, OpLog};
use crate::op::{self, Effect, LogCommand};
use crate::snapshots::{SnapshotRecord, SnapshotStore};
use crate::transport::{InboundReceiver, PeerMessage, PeerReply, PeerTransport};
use capstan_core::{PeerId, Request, RequestSender};
use capstan_state::{PinState, Snapshot, StateView};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A peer's role in the current term.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Follower => f.write_str("follower"),
            Self::Candidate => f.write_str("candidate"),
            Self::Leader => f.write_str("leader"),
        }
    }
}

/// Point-in-time driver status for callers.
#[derive(Clone, Debug)]
pub struct StatusReport {
    pub role: Role,
    pub term: u64,
    pub leader: Option<PeerId>,
    pub applied_index: u64,
    pub last_index: u64,
}

/// Requests from the engine facade into the driver.
pub(crate) enum Command {
    Commit {
        payload: Vec<u8>,
        reply: oneshot::Sender<ConsensusResult<u64>>,
    },
    Status {
        reply: oneshot::Sender<StatusReport>,
    },
    View {
        reply: oneshot::Sender<StateView>,
    },
    TakeSnapshot {
        reply: oneshot::Sender<ConsensusResult<Option<u64>>>,
    },
}

/// Someone waiting for an entry to apply.
enum Waiter {
    Local(oneshot::Sender<ConsensusResult<u64>>),
    Remote(oneshot::Sender<PeerReply>),
}

/// Results of the RPCs the driver fans out.
pub(crate) enum RaftEvent {
    VoteReply {
        election_term: u64,
        from: PeerId,
        reply: ConsensusResult<PeerReply>,
    },
    AppendReply {
        peer: PeerId,
        sent_term: u64,
        reply: ConsensusResult<PeerReply>,
    },
}

pub(crate) struct RaftDriver {
    id: PeerId,
    peers: Vec<PeerId>,
    config: RaftConfig,
    transport: Arc<dyn PeerTransport>,
    log: OpLog,
    snapshots: SnapshotStore,
    state: Box<dyn PinState>,
    requests: RequestSender,

    role: Role,
    term: u64,
    voted_for: Option<PeerId>,
    leader: Option<PeerId>,
    votes: HashSet<PeerId>,
    commit_index: u64,
    next_index: HashMap<PeerId, u64>,
    match_index: HashMap<PeerId, u64>,
    /// Peers with an append or snapshot RPC already in the air.
    inflight: HashSet<PeerId>,
    /// Waiters keyed by log index, resolved when the entry applies.
    pending: HashMap<u64, Vec<Waiter>>,

    events_tx: mpsc::UnboundedSender<RaftEvent>,
    election_deadline: Instant,
    cancel: CancellationToken,
}

impl RaftDriver {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: PeerId,
        peers: Vec<PeerId>,
        config: RaftConfig,
        transport: Arc<dyn PeerTransport>,
        log: OpLog,
        snapshots: SnapshotStore,
        state: Box<dyn PinState>,
        requests: RequestSender,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<RaftEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let commit_index = state.version();
        let term = log.last_term();
        let driver = Self {
            id,
            peers,
            config,
            transport,
            log,
            snapshots,
            state,
            requests,
            role: Role::Follower,
            term,
            voted_for: None,
            leader: None,
            votes: HashSet::new(),
            commit_index,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            inflight: HashSet::new(),
            pending: HashMap::new(),
            events_tx,
            election_deadline: Instant::now(),
            cancel,
        };
        (driver, events_rx)
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut inbound: InboundReceiver,
        mut events: mpsc::UnboundedReceiver<RaftEvent>,
    ) {
        self.reset_election_deadline();
        if self.single_node() {
            // A cluster of one elects itself and commits immediately.
            self.start_election();
        }
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(command) = commands.recv() => self.handle_command(command),
                Some((msg, reply)) = inbound.recv() => self.handle_peer_message(msg, reply),
                Some(event) = events.recv() => self.handle_event(event),
                _ = tokio::time::sleep_until(self.election_deadline),
                    if self.role != Role::Leader && !self.single_node() =>
                {
                    self.start_election();
                }
                _ = heartbeat.tick(), if self.role == Role::Leader && !self.peers.is_empty() => {
                    self.replicate_all();
                }
            }
        }

        self.fail_pending(ConsensusError::ShuttingDown);
        tracing::debug!(peer = %self.id, "consensus driver stopped");
    }

    fn single_node(&self) -> bool {
        self.peers.is_empty() || self.config.single_peer
    }

    fn member_count(&self) -> usize {
        self.peers.len() + 1
    }

    fn reset_election_deadline(&mut self) {
        let (min, max) = self.config.election_timeout_range();
        let jitter = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis()) as u64;
        self.election_deadline = Instant::now() + std::time::Duration::from_millis(jitter);
    }

    fn status(&self) -> StatusReport {
        StatusReport {
            role: self.role,
            term: self.term,
            leader: self.leader,
            applied_index: self.state.version(),
            last_index: self.log.last_index(),
        }
    }

    // ===== Commands from the engine facade =====

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Commit { payload, reply } => self.submit(payload, Waiter::Local(reply)),
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::View { reply } => {
                let _ = reply.send(StateView {
                    pins: self.state.list(),
                    version: self.state.version(),
                });
            }
            Command::TakeSnapshot { reply } => {
                let _ = reply.send(self.take_snapshot());
            }
        }
    }

    fn submit(&mut self, payload: Vec<u8>, waiter: Waiter) {
        if self.role == Role::Leader {
            match self.log.append(self.term, payload) {
                Ok(index) => {
                    self.pending.entry(index).or_default().push(waiter);
                    self.advance_commit();
                    self.replicate_all();
                }
                Err(e) => {
                    tracing::error!(error = %e, "could not append submission to log");
                    match waiter {
                        Waiter::Local(tx) => {
                            let _ = tx.send(Err(e));
                        }
                        Waiter::Remote(tx) => {
                            let _ = tx.send(PeerReply::Failed {
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
            return;
        }

        // Forward to the leader, if one is known.
        let Some(leader) = self.leader else {
            match waiter {
                Waiter::Local(tx) => {
                    let _ = tx.send(Err(ConsensusError::NoLeader));
                }
                Waiter::Remote(tx) => {
                    let _ = tx.send(PeerReply::Failed {
                        reason: ConsensusError::NoLeader.to_string(),
                    });
                }
            }
            return;
        };
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let result = transport
                .call(leader, PeerMessage::ForwardCommit { payload })
                .await;
            match (waiter, result) {
                (Waiter::Local(tx), Ok(PeerReply::Committed { index })) => {
                    let _ = tx.send(Ok(index));
                }
                (Waiter::Local(tx), Ok(PeerReply::Failed { reason })) => {
                    let _ = tx.send(Err(ConsensusError::Transport(reason)));
                }
                (Waiter::Local(tx), Ok(other)) => {
                    let _ = tx.send(Err(ConsensusError::Transport(format!(
                        "unexpected forward reply: {other:?}"
                    ))));
                }
                (Waiter::Local(tx), Err(e)) => {
                    let _ = tx.send(Err(e));
                }
                (Waiter::Remote(tx), Ok(reply)) => {
                    let _ = tx.send(reply);
                }
                (Waiter::Remote(tx), Err(e)) => {
                    let _ = tx.send(PeerReply::Failed {
                        reason: e.to_string(),
                    });
                }
            }
        });
    }

    fn take_snapshot(&mut self) -> ConsensusResult<Option<u64>> {
        let applied = self.state.version();
        let latest = self
            .snapshots
            .latest_index()
            .map_err(|e| ConsensusError::SnapshotFailure(e.to_string()))?;
        if applied == 0 || applied <= latest {
            // Nothing new to snapshot.
            return Ok(None);
        }
        let state_bytes = self
            .state
            .snapshot()
            .map_err(|e| ConsensusError::SnapshotFailure(e.to_string()))?;
        let term = self.log.term_at(applied).unwrap_or(self.term);
        self.snapshots
            .save(&SnapshotRecord {
                index: applied,
                term,
                state: state_bytes,
            })
            .map_err(|e| ConsensusError::SnapshotFailure(e.to_string()))?;
        self.log
            .compact_through(applied, term)
            .map_err(|e| ConsensusError::SnapshotFailure(e.to_string()))?;
        tracing::info!(index = applied, "snapshot taken, log compacted");
        Ok(Some(applied))
    }

    // ===== Elections =====

    fn start_election(&mut self) {
        self.term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.id);
        self.leader = None;
        self.votes.clear();
        self.votes.insert(self.id);
        self.reset_election_deadline();
        tracing::debug!(peer = %self.id, term = self.term, "starting election");

        if self.votes.len() * 2 > self.member_count() {
            self.become_leader();
            return;
        }

        let last_log_index = self.log.last_index();
        let last_log_term = self.log.last_term();
        for &peer in &self.peers {
            let transport = self.transport.clone();
            let events = self.events_tx.clone();
            let election_term = self.term;
            let msg = PeerMessage::RequestVote {
                term: self.term,
                candidate: self.id,
                last_log_index,
                last_log_term,
            };
            tokio::spawn(async move {
                let reply = transport.call(peer, msg).await;
                let _ = events.send(RaftEvent::VoteReply {
                    election_term,
                    from: peer,
                    reply,
                });
            });
        }
    }

    fn become_leader(&mut self) {
        tracing::info!(peer = %self.id, term = self.term, "elected leader");
        self.role = Role::Leader;
        self.leader = Some(self.id);
        self.inflight.clear();
        let next = self.log.last_index() + 1;
        for &peer in &self.peers {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }
        // Barrier entry: entries from earlier terms become committable once
        // it replicates under this term.
        let barrier = LogCommand::Noop
            .encode()
            .and_then(|payload| self.log.append(self.term, payload));
        if let Err(e) = barrier {
            tracing::error!(error = %e, "could not append leadership barrier entry");
        }
        self.advance_commit();
        self.replicate_all();
    }

    fn step_down(&mut self, term: u64) {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
        }
        if self.role != Role::Follower {
            tracing::info!(peer = %self.id, term = self.term, "stepping down to follower");
        }
        self.role = Role::Follower;
        self.leader = None;
        self.votes.clear();
        self.reset_election_deadline();
        // Whatever was waiting on this leadership has an unknown outcome
        // now; callers must consult the state.
        self.fail_pending(ConsensusError::CommitTimeout);
    }

    // ===== Replication =====

    fn replicate_all(&mut self) {
        for peer in self.peers.clone() {
            self.replicate_to(peer);
        }
        self.advance_commit();
    }

    fn replicate_to(&mut self, peer: PeerId) {
        if self.role != Role::Leader || self.inflight.contains(&peer) {
            return;
        }
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1);

        let msg = if next <= self.log.compacted_index() {
            // The entries this follower needs are compacted away; ship the
            // latest snapshot instead.
            match self.snapshots.latest() {
                Ok(Some(snapshot)) => PeerMessage::InstallSnapshot {
                    term: self.term,
                    leader: self.id,
                    index: snapshot.index,
                    snapshot_term: snapshot.term,
                    state: snapshot.state,
                },
                other => {
                    if let Err(e) = other {
                        tracing::error!(error = %e, "could not load snapshot for lagging follower");
                    }
                    return;
                }
            }
        } else {
            let prev_log_index = next - 1;
            let Some(prev_log_term) = self.log.term_at(prev_log_index) else {
                tracing::error!(peer = %peer, prev_log_index, "no term for previous log index");
                return;
            };
            PeerMessage::AppendEntries {
                term: self.term,
                leader: self.id,
                prev_log_index,
                prev_log_term,
                entries: self.log.slice_from(next),
                leader_commit: self.commit_index,
            }
        };

        self.inflight.insert(peer);
        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        let sent_term = self.term;
        tokio::spawn(async move {
            let reply = transport.call(peer, msg).await;
            let _ = events.send(RaftEvent::AppendReply {
                peer,
                sent_term,
                reply,
            });
        });
    }

    fn advance_commit(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let candidate = if self.single_node() {
            // Single-peer mode commits without waiting for a quorum.
            self.log.last_index()
        } else {
            let mut indexes: Vec<u64> = self
                .peers
                .iter()
                .map(|p| self.match_index.get(p).copied().unwrap_or(0))
                .collect();
            indexes.push(self.log.last_index());
            indexes.sort_unstable();
            let majority = self.member_count() / 2 + 1;
            indexes[self.member_count() - majority]
        };
        // Only entries from the current term commit by counting; earlier
        // ones ride along via the barrier entry.
        if candidate > self.commit_index && self.log.term_at(candidate) == Some(self.term) {
            self.commit_index = candidate;
            self.apply_committed();
        }
    }

    // ===== Event handling =====

    fn handle_event(&mut self, event: RaftEvent) {
        match event {
            RaftEvent::VoteReply {
                election_term,
                from,
                reply,
            } => {
                let Ok(PeerReply::Vote { term, granted }) = reply else {
                    return;
                };
                if term > self.term {
                    self.step_down(term);
                    return;
                }
                if self.role != Role::Candidate || election_term != self.term || !granted {
                    return;
                }
                self.votes.insert(from);
                if self.votes.len() * 2 > self.member_count() {
                    self.become_leader();
                }
            }
            RaftEvent::AppendReply {
                peer,
                sent_term,
                reply,
            } => {
                self.inflight.remove(&peer);
                let Ok(reply) = reply else {
                    // Unreachable peer; the next heartbeat retries.
                    return;
                };
                match reply {
                    PeerReply::Append {
                        term,
                        success,
                        match_index,
                    } => {
                        if term > self.term {
                            self.step_down(term);
                            return;
                        }
                        if self.role != Role::Leader || sent_term != self.term {
                            return;
                        }
                        if success {
                            self.match_index.insert(peer, match_index);
                            self.next_index.insert(peer, match_index + 1);
                            self.advance_commit();
                            if self.log.last_index() > match_index {
                                self.replicate_to(peer);
                            }
                        } else {
                            // Conflict: the follower hints how far its log
                            // plausibly matches.
                            let current = self.next_index.get(&peer).copied().unwrap_or(1);
                            let next = current
                                .saturating_sub(1)
                                .min(match_index + 1)
                                .max(1);
                            self.next_index.insert(peer, next);
                            self.replicate_to(peer);
                        }
                    }
                    PeerReply::SnapshotInstalled { term, index } => {
                        if term > self.term {
                            self.step_down(term);
                            return;
                        }
                        if self.role != Role::Leader || index == 0 {
                            return;
                        }
                        self.match_index.insert(peer, index);
                        self.next_index.insert(peer, index + 1);
                        self.advance_commit();
                        self.replicate_to(peer);
                    }
                    _ => {}
                }
            }
        }
    }

    // ===== Peer messages =====

    fn handle_peer_message(&mut self, msg: PeerMessage, reply: oneshot::Sender<PeerReply>) {
        match msg {
            PeerMessage::RequestVote {
                term,
                candidate,
                last_log_index,
                last_log_term,
            } => {
                if term > self.term {
                    self.step_down(term);
                }
                let log_ok = (last_log_term, last_log_index)
                    >= (self.log.last_term(), self.log.last_index());
                let granted = term == self.term
                    && log_ok
                    && self.voted_for.is_none_or(|v| v == candidate);
                if granted {
                    self.voted_for = Some(candidate);
                    self.reset_election_deadline();
                }
                let _ = reply.send(PeerReply::Vote {
                    term: self.term,
                    granted,
                });
            }
            PeerMessage::AppendEntries {
                term,
                leader,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                self.handle_append_entries(
                    term,
                    leader,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                    reply,
                );
            }
            PeerMessage::InstallSnapshot {
                term,
                leader,
                index,
                snapshot_term,
                state,
            } => {
                self.handle_install_snapshot(term, leader, index, snapshot_term, state, reply);
            }
            PeerMessage::ForwardCommit { payload } => {
                if self.role == Role::Leader {
                    self.submit(payload, Waiter::Remote(reply));
                } else {
                    let _ = reply.send(PeerReply::Failed {
                        reason: "not the leader".to_string(),
                    });
                }
            }
            PeerMessage::LeaderRequest { state } => {
                if self.role != Role::Leader {
                    let _ = reply.send(PeerReply::Failed {
                        reason: "not the leader".to_string(),
                    });
                    return;
                }
                // Validate the snapshot before proposing the cluster-wide
                // restore.
                if let Err(e) = Snapshot::decode(&state) {
                    tracing::warn!(error = %e, "rejecting rollback request with invalid snapshot");
                    let _ = reply.send(PeerReply::Failed {
                        reason: e.to_string(),
                    });
                    return;
                }
                match LogCommand::Rollback(state).encode() {
                    Ok(payload) => self.submit(payload, Waiter::Remote(reply)),
                    Err(e) => {
                        let _ = reply.send(PeerReply::Failed {
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_append_entries(
        &mut self,
        term: u64,
        leader: PeerId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
        reply: oneshot::Sender<PeerReply>,
    ) {
        if term < self.term {
            let _ = reply.send(PeerReply::Append {
                term: self.term,
                success: false,
                match_index: 0,
            });
            return;
        }
        if term > self.term || self.role != Role::Follower {
            self.step_down(term);
        }
        self.leader = Some(leader);
        self.reset_election_deadline();

        let prev_ok = prev_log_index == 0
            || prev_log_index <= self.log.compacted_index()
            || self.log.term_at(prev_log_index) == Some(prev_log_term);
        if !prev_ok {
            if self.log.term_at(prev_log_index).is_some() {
                // Conflicting suffix: drop it so the leader's log wins.
                if let Err(e) = self.log.truncate_from(prev_log_index) {
                    tracing::error!(error = %e, "could not truncate conflicting log suffix");
                }
            }
            let hint = self.log.last_index().min(prev_log_index.saturating_sub(1));
            let _ = reply.send(PeerReply::Append {
                term: self.term,
                success: false,
                match_index: hint,
            });
            return;
        }

        // Skip entries we already have; truncate at the first conflict.
        let mut to_append: Vec<LogEntry> = Vec::new();
        for entry in entries {
            if entry.index <= self.log.compacted_index() {
                continue;
            }
            if !to_append.is_empty() {
                to_append.push(entry);
                continue;
            }
            match self.log.term_at(entry.index) {
                Some(existing) if existing == entry.term => {}
                Some(_) => {
                    if let Err(e) = self.log.truncate_from(entry.index) {
                        tracing::error!(error = %e, "could not truncate conflicting entries");
                        let _ = reply.send(PeerReply::Failed {
                            reason: e.to_string(),
                        });
                        return;
                    }
                    to_append.push(entry);
                }
                None => to_append.push(entry),
            }
        }
        if !to_append.is_empty() {
            if let Err(e) = self.log.append_replicated(&to_append) {
                tracing::error!(error = %e, "could not append replicated entries");
                let _ = reply.send(PeerReply::Failed {
                    reason: e.to_string(),
                });
                return;
            }
        }

        if leader_commit > self.commit_index {
            self.commit_index = leader_commit.min(self.log.last_index());
            self.apply_committed();
        }
        let _ = reply.send(PeerReply::Append {
            term: self.term,
            success: true,
            match_index: self.log.last_index(),
        });
    }

    fn handle_install_snapshot(
        &mut self,
        term: u64,
        leader: PeerId,
        index: u64,
        snapshot_term: u64,
        state: Vec<u8>,
        reply: oneshot::Sender<PeerReply>,
    ) {
        if term < self.term {
            let _ = reply.send(PeerReply::SnapshotInstalled {
                term: self.term,
                index: 0,
            });
            return;
        }
        if term > self.term || self.role != Role::Follower {
            self.step_down(term);
        }
        self.leader = Some(leader);
        self.reset_election_deadline();

        if let Err(e) = self.state.restore(&state) {
            tracing::error!(error = %e, "could not restore state from shipped snapshot");
            let _ = reply.send(PeerReply::Failed {
                reason: e.to_string(),
            });
            return;
        }
        self.state.set_version(index);
        self.commit_index = index;
        if let Err(e) = self.log.reset_to(index, snapshot_term) {
            tracing::error!(error = %e, "could not reset log after snapshot install");
        }
        // Keep the shipped snapshot locally so a restart replays from it.
        if let Err(e) = self.snapshots.save(&SnapshotRecord {
            index,
            term: snapshot_term,
            state,
        }) {
            tracing::warn!(error = %e, "could not persist shipped snapshot");
        }
        tracing::info!(index, "installed snapshot from leader");
        let _ = reply.send(PeerReply::SnapshotInstalled {
            term: self.term,
            index,
        });
    }

    // ===== Applying =====

    fn apply_committed(&mut self) {
        while self.state.version() < self.commit_index {
            let index = self.state.version() + 1;
            let Some(entry) = self.log.get(index).cloned() else {
                tracing::error!(index, "committed entry missing from log");
                break;
            };
            match op::apply(&entry.payload, self.state.as_mut(), index) {
                Ok(effect) => {
                    match effect {
                        Effect::Track(cid) => {
                            self.requests.emit(Request::Track(cid));
                        }
                        Effect::Untrack(cid) => {
                            self.requests.emit(Request::Untrack(cid));
                        }
                        Effect::None => {}
                    }
                    self.resolve_pending(index, Ok(index));
                }
                Err(e) => {
                    // Hard apply failure: keep the pre-apply state and ask
                    // the leader for a cluster-wide restore. The entry is
                    // consumed so every peer converges on skipping it.
                    tracing::error!(index, error = %e, "an error occurred applying an operation to the state");
                    let was_rollback = matches!(
                        LogCommand::decode(&entry.payload),
                        Ok(LogCommand::Rollback(_))
                    );
                    if was_rollback {
                        tracing::error!(index, "rollback entry failed to apply, skipping");
                    } else {
                        match self.state.snapshot() {
                            Ok(snapshot) => {
                                tracing::error!("a rollback was requested");
                                self.requests.emit(Request::LeaderEnvelope(Box::new(
                                    Request::Rollback(snapshot),
                                )));
                            }
                            Err(snap_err) => {
                                tracing::error!(error = %snap_err, "could not snapshot state for rollback request");
                            }
                        }
                    }
                    self.state.set_version(index);
                    self.resolve_pending(index, Err(e.to_string()));
                }
            }
        }
    }

    fn resolve_pending(&mut self, index: u64, result: Result<u64, String>) {
        let Some(waiters) = self.pending.remove(&index) else {
            return;
        };
        for waiter in waiters {
            resolve_waiter(waiter, result.clone());
        }
    }

    fn fail_pending(&mut self, error: ConsensusError) {
        let reason = error.to_string();
        let shutting_down = matches!(error, ConsensusError::ShuttingDown);
        for (_, waiters) in self.pending.drain() {
            for waiter in waiters {
                match waiter {
                    Waiter::Local(tx) => {
                        let e = if shutting_down {
                            ConsensusError::ShuttingDown
                        } else {
                            ConsensusError::CommitTimeout
                        };
                        let _ = tx.send(Err(e));
                    }
                    Waiter::Remote(tx) => {
                        let _ = tx.send(PeerReply::Failed {
                            reason: reason.clone(),
                        });
                    }
                }
            }
        }
    }
}

fn resolve_waiter(waiter: Waiter, result: Result<u64, String>) {
    match (waiter, result) {
        (Waiter::Local(tx), Ok(index)) => {
            let _ = tx.send(Ok(index));
        }
        (Waiter::Local(tx), Err(reason)) => {
            let _ = tx.send(Err(ConsensusError::RollbackRequested(reason)));
        }
        (Waiter::Remote(tx), Ok(index)) => {
            let _ = tx.send(PeerReply::Committed { index });
        }
        (Waiter::Remote(tx), Err(reason)) => {
            let _ = tx.send(PeerReply::Failed { reason });
        }
    }
}
