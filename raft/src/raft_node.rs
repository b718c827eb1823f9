use std::{cmp, sync::Arc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::cluster::ClusterConfiguration;
use crate::config::EngineConfig;
use crate::election::{ElectionManager, VoteTally};
use crate::error::{RaftError, Result, TransportError};
use crate::membership::ChangeResponder;
use crate::msg::{
    AppendEntriesRequest, AppendEntriesResponse, ConfigurationChangeRequest, ConfigurationEntry,
    EntryContent, InstallSnapshotRequest, InstallSnapshotResponse, LogEntry, LogIndex,
    NodeConfiguration, NodeId, RaftNodeSummary, RequestVoteRequest, RequestVoteResponse,
    SnapshotHeader, StateValue, Term,
};
use crate::pronouncer::LeaderPronouncer;
use crate::replication::{
    build_payload, resolve_next_index, LeaderVolatileState, PayloadContext, ReplicationPayload,
};
use crate::rpc::{Outbound, PeerReply};
use crate::state::{CommandResponder, LeaderState, RaftState};
use crate::storage::PersistentStore;
use crate::timer::{self, ElectionTimer, HeartbeatTimer};
use crate::transport::{StateMachine, Transport};

const REPLY_CHANNEL_CAPACITY: usize = 1024;

/// Requests delivered to the node task by its handles.
#[derive(Debug)]
pub(crate) enum NodeMsg {
    RequestVote {
        request: RequestVoteRequest,
        tx: oneshot::Sender<RequestVoteResponse>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        tx: oneshot::Sender<AppendEntriesResponse>,
    },
    InstallSnapshot {
        request: InstallSnapshotRequest,
        tx: oneshot::Sender<InstallSnapshotResponse>,
    },
    ClientCommand {
        command: Vec<u8>,
        tx: CommandResponder,
    },
    ConfigurationChange {
        request: ConfigurationChangeRequest,
        tx: ChangeResponder,
    },
    Summary {
        tx: oneshot::Sender<RaftNodeSummary>,
    },
}

/// Everything a node task is built from.
pub(crate) struct NodeContext {
    pub this_node: NodeConfiguration,
    pub config: EngineConfig,
    pub store: Box<dyn PersistentStore>,
    pub state_machine: Box<dyn StateMachine>,
    pub transport: Arc<dyn Transport>,
    pub initial_configuration: Vec<NodeConfiguration>,
    pub pronouncer: LeaderPronouncer,
    pub state_tx: watch::Sender<StateValue>,
    pub inbox_rx: mpsc::Receiver<NodeMsg>,
    pub shutdown: CancellationToken,
}

/// Implementation of the Raft role state machine.
///
/// One task owns all node state. Inbound RPCs, client requests, peer replies and timer expiries
/// are handled one at a time, and no handler awaits, so every step sees a consistent view.
pub(crate) struct RaftNode {
    id: NodeId,
    config: EngineConfig,
    state: RaftState,
    /// Bumped on every role change. Replies issued under an older epoch are stale.
    epoch: u64,
    /// Cancelled on every role change; parent of all of the role's outbound RPCs.
    role_token: CancellationToken,
    term: Term,
    voted_for: Option<NodeId>,
    store: Box<dyn PersistentStore>,
    state_machine: Box<dyn StateMachine>,
    /// Index of highest log entry known to be committed
    commit_index: LogIndex,
    last_applied: LogIndex,
    snapshot_index: LogIndex,
    snapshot_term: Term,
    snapshot_configuration: Option<ConfigurationEntry>,
    last_log_index: LogIndex,
    last_log_term: Term,
    cluster: ClusterConfiguration,
    /// Index of the entry the current roster came from.
    configuration_index: LogIndex,
    initial_configuration: Vec<NodeConfiguration>,
    pronouncer: LeaderPronouncer,
    state_tx: watch::Sender<StateValue>,
    outbound: Outbound,
    elections: ElectionManager,
    election_timer: ElectionTimer,
    heartbeat_timer: HeartbeatTimer,
    inbox_rx: mpsc::Receiver<NodeMsg>,
    replies_rx: mpsc::Receiver<PeerReply>,
    shutdown: CancellationToken,
}

impl RaftNode {
    /// Builds the node from whatever its store holds, so a restarted node resumes where it left
    /// off.
    pub fn new(ctx: NodeContext) -> Result<Self> {
        let (replies_tx, replies_rx) = mpsc::channel(REPLY_CHANNEL_CAPACITY);
        let outbound = Outbound::new(ctx.transport, replies_tx, ctx.config.rpc_timeout());
        let cluster = ClusterConfiguration::new(
            ctx.this_node.clone(),
            ctx.initial_configuration.clone(),
        );
        let mut node = Self {
            id: ctx.this_node.unique_id.clone(),
            election_timer: ElectionTimer::new(
                ctx.config.election_timeout_min_ms,
                ctx.config.election_timeout_max_ms,
            ),
            heartbeat_timer: HeartbeatTimer::new(ctx.config.heartbeat_interval()),
            config: ctx.config,
            state: RaftState::Follower,
            epoch: 0,
            role_token: CancellationToken::new(),
            term: 0,
            voted_for: None,
            store: ctx.store,
            state_machine: ctx.state_machine,
            commit_index: 0,
            last_applied: 0,
            snapshot_index: 0,
            snapshot_term: 0,
            snapshot_configuration: None,
            last_log_index: 0,
            last_log_term: 0,
            cluster,
            configuration_index: 0,
            initial_configuration: ctx.initial_configuration,
            pronouncer: ctx.pronouncer,
            state_tx: ctx.state_tx,
            elections: ElectionManager::new(outbound.clone()),
            outbound,
            inbox_rx: ctx.inbox_rx,
            replies_rx,
            shutdown: ctx.shutdown,
        };
        node.restore()?;
        node.state_tx.send_replace(node.state.value());
        Ok(node)
    }

    fn restore(&mut self) -> Result<()> {
        self.term = self.store.load_term()?;
        self.voted_for = self.store.load_voted_for()?;
        let applied = self.store.load_last_applied()?;
        if let Some((header, data)) = self.store.load_snapshot()? {
            // The state machine already holds everything up to `applied`.
            if header.last_included_index > applied {
                self.state_machine.restore_from_snapshot(&header, &data)?;
            }
            self.snapshot_index = header.last_included_index;
            self.snapshot_term = header.last_included_term;
            self.snapshot_configuration = Some(header.configuration);
        }
        self.last_applied = cmp::max(applied, self.snapshot_index);
        // Everything applied was committed.
        self.commit_index = self.last_applied;
        self.last_log_index = self.store.load_last_index()?;
        self.last_log_term = self.term_at(self.last_log_index)?;
        if self.last_log_index < self.last_applied {
            return Err(RaftError::InvariantViolation(format!(
                "last applied {} is beyond the log end {}",
                self.last_applied, self.last_log_index
            )));
        }
        self.reload_configuration()?;
        info!(
            node = %self.id,
            term = self.term,
            last_log_index = self.last_log_index,
            last_applied = self.last_applied,
            snapshot_index = self.snapshot_index,
            "Restored node state"
        );
        Ok(())
    }

    pub async fn run(mut self) -> Result<()> {
        self.reset_election_timer();
        loop {
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(msg) = self.inbox_rx.recv() => self.receive_message(msg),
                Some(reply) = self.replies_rx.recv() => self.receive_reply(reply),
                _ = timer::expire(self.election_timer.deadline()) => self.on_election_timeout(),
                _ = timer::expire(self.heartbeat_timer.deadline()) => self.on_heartbeat_timeout(),
                else => break,
            };
            if let Err(e) = result {
                if e.is_fatal() {
                    error!(node = %self.id, term = self.term, error = %e, "Halting node");
                    self.halt();
                    return Err(e);
                }
                warn!(node = %self.id, term = self.term, error = %e, "Request failed");
            }
        }
        info!(node = %self.id, term = self.term, "Node stopped");
        self.halt();
        Ok(())
    }

    fn halt(&mut self) {
        self.role_token.cancel();
        self.election_timer.stop();
        self.heartbeat_timer.stop();
        if let Some(leader) = self.state.leader_mut() {
            leader.release_waiters(|| RaftError::NodeStopped);
        }
        self.pronouncer.forget();
        self.state_tx.send_replace(StateValue::Stopped);
    }

    fn receive_message(&mut self, msg: NodeMsg) -> Result<()> {
        match msg {
            NodeMsg::RequestVote { request, tx } => {
                let response = self.receive_request_vote(request)?;
                let _ = tx.send(response);
            }
            NodeMsg::AppendEntries { request, tx } => {
                let response = self.receive_append_entries(request)?;
                let _ = tx.send(response);
            }
            NodeMsg::InstallSnapshot { request, tx } => {
                let response = self.receive_install_snapshot(request)?;
                let _ = tx.send(response);
            }
            NodeMsg::ClientCommand { command, tx } => self.handle_client_command(command, tx)?,
            NodeMsg::ConfigurationChange { request, tx } => {
                self.handle_configuration_change(request, tx)?
            }
            NodeMsg::Summary { tx } => {
                let _ = tx.send(self.summary());
            }
        }
        Ok(())
    }

    fn receive_reply(&mut self, reply: PeerReply) -> Result<()> {
        if reply.epoch() != self.epoch {
            trace!(node = %self.id, epoch = reply.epoch(), current = self.epoch, "Dropping stale reply");
            return Ok(());
        }
        match reply {
            PeerReply::Vote { peer, result, .. } => self.receive_vote_reply(peer, result),
            PeerReply::Append {
                peer,
                previous_log_index,
                entry_count,
                result,
                ..
            } => self.receive_append_reply(peer, previous_log_index, entry_count, result),
            PeerReply::Snapshot {
                peer,
                last_included_index,
                result,
                ..
            } => self.receive_snapshot_reply(peer, last_included_index, result),
        }
    }

    ///////////////////////////////////////////////////
    // Term rule
    ///////////////////////////////////////////////////

    /// Applies the term rule to an incoming term. Returns false when the term is stale; a newer
    /// term is adopted and the node steps down before the caller continues.
    fn observe_term(&mut self, term: Term) -> Result<bool> {
        if term < self.term {
            return Ok(false);
        }
        if term > self.term {
            debug!(node = %self.id, term = self.term, newer = term, "Observed newer term");
            self.update_term(term, None)?;
            if matches!(self.state, RaftState::Candidate { .. } | RaftState::Leader(_)) {
                self.become_follower();
            }
        }
        Ok(true)
    }

    /// Persists term and vote before either takes effect.
    fn update_term(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        self.store.save_term_and_vote(term, voted_for.as_ref())?;
        if term > self.term {
            self.pronouncer.forget();
        }
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    ///////////////////////////////////////////////////
    // Inbound RPCs
    ///////////////////////////////////////////////////

    fn receive_request_vote(&mut self, request: RequestVoteRequest) -> Result<RequestVoteResponse> {
        let denied = |term| RequestVoteResponse {
            term,
            vote_granted: false,
        };
        if matches!(self.state, RaftState::Abandoned) {
            return Ok(denied(self.term));
        }
        if !self.observe_term(request.term)? {
            trace!(node = %self.id, term = self.term, candidate = %request.candidate_id, stale = request.term, "Rejecting stale vote request");
            return Ok(denied(self.term));
        }

        let up_to_date = (request.last_log_term, request.last_log_index)
            >= (self.last_log_term, self.last_log_index);
        let free_to_vote = self
            .voted_for
            .as_ref()
            .map_or(true, |v| v == &request.candidate_id);
        let granted = up_to_date && free_to_vote;
        if granted {
            if self.voted_for.is_none() {
                self.update_term(self.term, Some(request.candidate_id.clone()))?;
            }
            self.reset_election_timer();
        }
        debug!(
            node = %self.id,
            term = self.term,
            candidate = %request.candidate_id,
            granted,
            up_to_date,
            "Vote requested"
        );
        Ok(RequestVoteResponse {
            term: self.term,
            vote_granted: granted,
        })
    }

    /// Same-term traffic from a leader settles any competing claim in its favour.
    fn accept_leader(&mut self, leader_id: &NodeId) {
        match self.state {
            RaftState::Candidate { .. } => self.become_follower(),
            RaftState::Leader(_) => {
                warn!(node = %self.id, term = self.term, other = %leader_id, "Another leader in the same term, stepping down");
                self.become_follower();
            }
            _ => {}
        }
        let leader = self
            .cluster
            .peer(leader_id)
            .cloned()
            .unwrap_or_else(|| NodeConfiguration::new(leader_id.clone(), ""));
        self.pronouncer.recognize(leader);
        self.reset_election_timer();
    }

    fn receive_append_entries(
        &mut self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        if matches!(self.state, RaftState::Abandoned) {
            return Ok(AppendEntriesResponse::decommissioned(self.term));
        }
        if !self.observe_term(request.term)? {
            trace!(node = %self.id, term = self.term, leader = %request.leader_id, stale = request.term, "Rejecting stale append");
            return Ok(AppendEntriesResponse::rejected(self.term));
        }
        self.accept_leader(&request.leader_id);

        let previous = request.previous_log_index;
        if previous > self.last_log_index {
            debug!(node = %self.id, previous, last = self.last_log_index, "Log too short for append");
            return Ok(AppendEntriesResponse::conflict(
                self.term,
                None,
                self.last_log_index + 1,
            ));
        }
        if previous >= self.snapshot_index {
            let local = self.term_at(previous)?;
            if local != request.previous_log_term {
                let first = self.first_index_of_term(previous, local)?;
                debug!(
                    node = %self.id,
                    previous,
                    local_term = local,
                    leader_term = request.previous_log_term,
                    first,
                    "Log mismatch"
                );
                return Ok(AppendEntriesResponse::conflict(self.term, Some(local), first));
            }
        }

        let last_new_index = previous + request.entries.len() as LogIndex;
        let mut fresh: Vec<LogEntry> = Vec::new();
        for entry in request.entries {
            // Compacted entries are committed and therefore already match.
            if entry.index <= self.snapshot_index {
                continue;
            }
            if fresh.is_empty() && entry.index <= self.last_log_index {
                if self.term_at(entry.index)? == entry.term {
                    continue;
                }
                if entry.index <= self.commit_index {
                    return Err(RaftError::InvariantViolation(format!(
                        "leader {} conflicts with committed entry {}",
                        request.leader_id, entry.index
                    )));
                }
                self.truncate_from(entry.index)?;
            }
            fresh.push(entry);
        }
        if !fresh.is_empty() {
            self.persist_entries(&fresh)?;
        }

        let leader_commit = cmp::min(request.leader_commit_index, last_new_index);
        if leader_commit > self.commit_index {
            self.commit_index = leader_commit;
            self.apply_committed()?;
        }
        Ok(AppendEntriesResponse::accepted(self.term))
    }

    fn receive_install_snapshot(
        &mut self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let reply = InstallSnapshotResponse::new;
        if matches!(self.state, RaftState::Abandoned) {
            return Ok(InstallSnapshotResponse::decommissioned(self.term));
        }
        if !self.observe_term(request.term)? {
            trace!(node = %self.id, term = self.term, stale = request.term, "Rejecting stale snapshot");
            return Ok(reply(self.term, false));
        }
        self.accept_leader(&request.leader_id);

        let header = request.snapshot_header;
        if header.last_included_index <= self.snapshot_index {
            debug!(node = %self.id, snapshot = %header.snapshot_id, "Snapshot already installed");
            return Ok(reply(self.term, true));
        }

        self.store.save_snapshot(&header, &request.data)?;
        if header.last_included_index > self.last_applied {
            self.state_machine
                .restore_from_snapshot(&header, &request.data)?;
            self.last_applied = header.last_included_index;
            self.store.save_last_applied(self.last_applied)?;
        }
        self.commit_index = cmp::max(self.commit_index, header.last_included_index);
        self.snapshot_index = header.last_included_index;
        self.snapshot_term = header.last_included_term;
        self.last_log_index = self.store.load_last_index()?;
        self.last_log_term = self.term_at(self.last_log_index)?;
        info!(
            node = %self.id,
            term = self.term,
            snapshot = %header.snapshot_id,
            last_log_index = self.last_log_index,
            "Installed snapshot"
        );
        self.snapshot_configuration = Some(header.configuration);
        self.reload_configuration()?;
        Ok(reply(self.term, true))
    }

    ///////////////////////////////////////////////////
    // Client requests
    ///////////////////////////////////////////////////

    fn not_leader(&self) -> RaftError {
        RaftError::NotLeader {
            leader_hint: self.pronouncer.leader(),
        }
    }

    fn handle_client_command(&mut self, command: Vec<u8>, tx: CommandResponder) -> Result<()> {
        match self.state {
            RaftState::Leader(_) => {}
            RaftState::Abandoned => {
                let _ = tx.send(Err(RaftError::Decommissioned));
                return Ok(());
            }
            _ => {
                let _ = tx.send(Err(self.not_leader()));
                return Ok(());
            }
        }
        let index = self.append_local(EntryContent::Command(command))?;
        if let Some(leader) = self.state.leader_mut() {
            leader.waiters.insert(index, tx);
        }
        debug!(node = %self.id, term = self.term, index, "Appended client command");
        self.replicate_all()?;
        self.advance_commit_index()
    }

    fn handle_configuration_change(
        &mut self,
        request: ConfigurationChangeRequest,
        tx: ChangeResponder,
    ) -> Result<()> {
        match self.state {
            RaftState::Leader(_) => {}
            RaftState::Abandoned => {
                let _ = tx.send(Err(RaftError::Decommissioned));
                return Ok(());
            }
            _ => {
                let _ = tx.send(Err(self.not_leader()));
                return Ok(());
            }
        }
        let Some(leader) = self.state.leader_mut() else {
            return Ok(());
        };
        if let Err(e) = leader.membership.validate(&self.cluster, &request) {
            warn!(node = %self.id, change = %request.unique_id, error = %e, "Rejected configuration change");
            let _ = tx.send(Err(e));
            return Ok(());
        }
        let joint = leader
            .membership
            .begin(request, &self.cluster, self.last_log_index, tx);
        let index = self.append_local(EntryContent::Configuration(joint))?;
        if let Some(leader) = self.state.leader_mut() {
            leader.membership.joint_appended(index);
        }
        self.replicate_all()?;
        self.advance_commit_index()
    }

    ///////////////////////////////////////////////////
    // Timers
    ///////////////////////////////////////////////////

    fn on_election_timeout(&mut self) -> Result<()> {
        match self.state {
            RaftState::Leader(_) | RaftState::Abandoned => {
                self.election_timer.stop();
                Ok(())
            }
            RaftState::Follower | RaftState::Candidate { .. } => {
                if !self.cluster.is_this_node_part_of_cluster() {
                    debug!(node = %self.id, "Not a member, waiting to be added");
                    self.election_timer.stop();
                    return Ok(());
                }
                self.start_election()
            }
        }
    }

    fn on_heartbeat_timeout(&mut self) -> Result<()> {
        if !matches!(self.state, RaftState::Leader(_)) {
            self.heartbeat_timer.stop();
            return Ok(());
        }
        self.replicate_all()?;
        self.heartbeat_timer.reset();
        Ok(())
    }

    fn reset_election_timer(&mut self) {
        let waiting = matches!(self.state, RaftState::Follower | RaftState::Candidate { .. });
        if waiting && self.cluster.is_this_node_part_of_cluster() {
            self.election_timer.reset_with_different_timeout();
        } else {
            self.election_timer.stop();
        }
    }

    ///////////////////////////////////////////////////
    // Role transitions
    ///////////////////////////////////////////////////

    /// Cancels the outgoing role's work and opens a new epoch.
    fn next_epoch(&mut self) -> u64 {
        self.role_token.cancel();
        self.role_token = CancellationToken::new();
        self.epoch += 1;
        self.epoch
    }

    fn set_state(&mut self, state: RaftState) {
        let old = std::mem::replace(&mut self.state, state);
        let (from, to) = (old.value(), self.state.value());
        if let RaftState::Leader(mut leader) = old {
            let error: fn() -> RaftError = if to.is_abandoned() {
                || RaftError::Decommissioned
            } else {
                || RaftError::LeadershipLost
            };
            leader.release_waiters(error);
        }
        if from != to {
            info!(node = %self.id, term = self.term, %from, %to, "Role changed");
        }
        self.state_tx.send_replace(to);
    }

    fn become_follower(&mut self) {
        self.next_epoch();
        self.heartbeat_timer.stop();
        self.set_state(RaftState::Follower);
        self.reset_election_timer();
    }

    fn start_election(&mut self) -> Result<()> {
        self.update_term(self.term + 1, Some(self.id.clone()))?;
        let epoch = self.next_epoch();
        let request = RequestVoteRequest {
            term: self.term,
            candidate_id: self.id.clone(),
            last_log_index: self.last_log_index,
            last_log_term: self.last_log_term,
        };
        let session =
            self.elections
                .initiate(request, &self.cluster, epoch, self.role_token.child_token());
        let tally = session.tally(&self.cluster);
        self.set_state(RaftState::Candidate { session });
        self.election_timer.reset_with_different_timeout();
        if tally == VoteTally::Won {
            self.become_leader()?;
        }
        Ok(())
    }

    fn become_leader(&mut self) -> Result<()> {
        self.next_epoch();
        self.election_timer.stop();
        let replication = LeaderVolatileState::new(&self.cluster.peers(), self.last_log_index);
        self.set_state(RaftState::Leader(LeaderState::new(replication)));
        self.pronouncer.recognize(self.cluster.this_node().clone());
        info!(node = %self.id, term = self.term, "Won election");

        self.append_local(EntryContent::NoOperation)?;
        self.resume_membership_change()?;
        self.replicate_all()?;
        self.heartbeat_timer.reset();
        self.advance_commit_index()
    }

    /// A joint entry that committed under a previous leader still needs its C-new.
    fn resume_membership_change(&mut self) -> Result<()> {
        if !self.cluster.is_joint() || self.configuration_index > self.commit_index {
            return Ok(());
        }
        let joint = self.cluster.as_entry();
        self.complete_joint_change(&joint, self.configuration_index)
    }

    fn become_abandoned(&mut self) {
        self.next_epoch();
        self.election_timer.stop();
        self.heartbeat_timer.stop();
        self.pronouncer.forget();
        self.set_state(RaftState::Abandoned);
        info!(
            node = %self.id,
            term = self.term,
            commit_index = self.commit_index,
            last_applied = self.last_applied,
            "Removed from the cluster"
        );
    }

    /// Leaves the cluster as leader. Members get one last round so they learn the commit index.
    fn decommission(&mut self) -> Result<()> {
        let Some(leader) = self.state.leader() else {
            return Ok(());
        };
        let next_indexes = leader.replication.next_indexes();
        let ctx = self.payload_context();
        let final_round = CancellationToken::new();
        for peer in self.replication_targets() {
            let next_index = next_indexes
                .get(&peer.unique_id)
                .copied()
                .unwrap_or(self.last_log_index + 1);
            match build_payload(ctx, next_index, self.store.as_ref())? {
                ReplicationPayload::Append(request) => {
                    self.outbound
                        .append_entries(peer, request, self.epoch, final_round.clone())
                }
                ReplicationPayload::Snapshot(request) => {
                    self.outbound
                        .install_snapshot(peer, request, self.epoch, final_round.clone())
                }
            }
        }
        self.become_abandoned();
        Ok(())
    }

    ///////////////////////////////////////////////////
    // Replies from peers
    ///////////////////////////////////////////////////

    fn receive_vote_reply(
        &mut self,
        peer: NodeId,
        result: std::result::Result<RequestVoteResponse, TransportError>,
    ) -> Result<()> {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                debug!(node = %self.id, peer = %peer, error = %e, "Vote request failed");
                return Ok(());
            }
        };
        if !self.observe_term(response.term)? {
            trace!(node = %self.id, peer = %peer, "Ignoring stale vote");
            return Ok(());
        }
        let RaftState::Candidate { session } = &mut self.state else {
            trace!(node = %self.id, peer = %peer, "Ignoring vote outside candidacy");
            return Ok(());
        };
        let tally = session.record_vote(response.term, &peer, response.vote_granted, &self.cluster);
        debug!(
            node = %self.id,
            term = self.term,
            peer = %peer,
            granted = response.vote_granted,
            votes = session.votes(),
            "Vote received"
        );
        if tally == VoteTally::Won {
            self.become_leader()?;
        }
        Ok(())
    }

    fn receive_append_reply(
        &mut self,
        peer: NodeId,
        previous_log_index: LogIndex,
        entry_count: u64,
        result: std::result::Result<AppendEntriesResponse, TransportError>,
    ) -> Result<()> {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                debug!(node = %self.id, peer = %peer, error = %e, "Append failed, retrying next heartbeat");
                if let Some(leader) = self.state.leader_mut() {
                    leader.replication.finish_send(&peer);
                }
                return Ok(());
            }
        };
        if response.term > self.term {
            self.observe_term(response.term)?;
            return Ok(());
        }
        if response.decommissioned {
            self.retire_peer(&peer);
            return Ok(());
        }

        if response.success {
            let advanced = match self.state.leader_mut() {
                Some(leader) => leader
                    .replication
                    .record_success(&peer, previous_log_index + entry_count),
                None => return Ok(()),
            };
            if advanced {
                self.advance_commit_index()?;
                self.progress_membership()?;
                self.release_departed()?;
            }
            return self.continue_catch_up(&peer);
        }

        let next_index = {
            let store = self.store.as_ref();
            let term_at = |index| store.entry(index).ok().flatten().map(|e| e.term);
            resolve_next_index(
                previous_log_index,
                response.conflicting_entry_term,
                response.first_index_of_conflicting_entry_term,
                self.snapshot_index,
                term_at,
            )
        };
        if let Some(leader) = self.state.leader_mut() {
            leader.replication.record_conflict(&peer, next_index);
            debug!(
                node = %self.id,
                peer = %peer,
                conflicting_term = ?response.conflicting_entry_term,
                next_index,
                "Backing off"
            );
        }
        Ok(())
    }

    fn receive_snapshot_reply(
        &mut self,
        peer: NodeId,
        last_included_index: LogIndex,
        result: std::result::Result<InstallSnapshotResponse, TransportError>,
    ) -> Result<()> {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                debug!(node = %self.id, peer = %peer, error = %e, "Snapshot install failed");
                if let Some(leader) = self.state.leader_mut() {
                    leader.replication.finish_send(&peer);
                }
                return Ok(());
            }
        };
        if response.term > self.term {
            self.observe_term(response.term)?;
            return Ok(());
        }
        if response.decommissioned {
            self.retire_peer(&peer);
            return Ok(());
        }
        let Some(leader) = self.state.leader_mut() else {
            return Ok(());
        };
        if !response.success {
            leader.replication.finish_send(&peer);
            return Ok(());
        }
        if leader.replication.record_success(&peer, last_included_index) {
            info!(node = %self.id, peer = %peer, last_included_index, "Peer installed snapshot");
            self.advance_commit_index()?;
            self.progress_membership()?;
            self.release_departed()?;
        }
        self.continue_catch_up(&peer)
    }

    /// A peer that reports itself decommissioned left for good; stop replicating to it.
    fn retire_peer(&mut self, peer: &NodeId) {
        let Some(leader) = self.state.leader_mut() else {
            return;
        };
        leader.departing.retain(|n| &n.unique_id != peer);
        leader.replication.retire(peer);
        info!(node = %self.id, term = self.term, peer = %peer, "Peer is decommissioned, no longer replicating to it");
    }

    /// Sends the next batch right away to a peer that is still behind.
    fn continue_catch_up(&mut self, peer: &NodeId) -> Result<()> {
        let behind = self
            .state
            .leader()
            .and_then(|leader| leader.replication.progress(peer))
            .is_some_and(|p| p.next_index <= self.last_log_index);
        match self.replication_target(peer) {
            Some(peer) if behind => self.replicate_to(peer),
            _ => Ok(()),
        }
    }

    ///////////////////////////////////////////////////
    // Replication and commit
    ///////////////////////////////////////////////////

    fn payload_context(&self) -> PayloadContext<'_> {
        PayloadContext {
            term: self.term,
            leader_id: &self.id,
            commit_index: self.commit_index,
            snapshot_index: self.snapshot_index,
            max_entries: self.config.max_entries_per_append,
        }
    }

    fn replicate_all(&mut self) -> Result<()> {
        for peer in self.replication_targets() {
            self.replicate_to(peer)?;
        }
        Ok(())
    }

    /// Current peers plus removed members still being told about their removal.
    fn replication_targets(&self) -> Vec<NodeConfiguration> {
        let mut targets = self.cluster.peers();
        if let Some(leader) = self.state.leader() {
            targets.extend(
                leader
                    .departing
                    .iter()
                    .filter(|n| !self.cluster.contains(&n.unique_id))
                    .cloned(),
            );
        }
        targets
    }

    fn replication_target(&self, id: &str) -> Option<NodeConfiguration> {
        self.replication_targets()
            .into_iter()
            .find(|n| n.unique_id == id)
    }

    fn replicate_to(&mut self, peer: NodeConfiguration) -> Result<()> {
        let Some(leader) = self.state.leader_mut() else {
            return Ok(());
        };
        if !leader.replication.begin_send(&peer.unique_id) {
            return Ok(());
        }
        let next_index = leader
            .replication
            .progress(&peer.unique_id)
            .map_or(self.last_log_index + 1, |p| p.next_index);
        let payload = build_payload(self.payload_context(), next_index, self.store.as_ref())?;
        let cancel = self.role_token.child_token();
        match payload {
            ReplicationPayload::Append(request) => {
                trace!(
                    node = %self.id,
                    peer = %peer.unique_id,
                    previous = request.previous_log_index,
                    entries = request.entries.len(),
                    "Sending append"
                );
                self.outbound
                    .append_entries(peer, request, self.epoch, cancel)
            }
            ReplicationPayload::Snapshot(request) => {
                debug!(
                    node = %self.id,
                    peer = %peer.unique_id,
                    snapshot = %request.snapshot_header.snapshot_id,
                    "Sending snapshot"
                );
                self.outbound
                    .install_snapshot(peer, request, self.epoch, cancel)
            }
        }
        Ok(())
    }

    /// Moves the commit index to the highest entry of this term held by a majority of every
    /// active member set.
    fn advance_commit_index(&mut self) -> Result<()> {
        let Some(leader) = self.state.leader() else {
            return Ok(());
        };
        let majority = self.cluster.majority_index(|id| {
            if id == &self.id {
                self.last_log_index
            } else {
                leader.replication.match_index(id)
            }
        });
        if majority <= self.commit_index || self.term_at(majority)? != self.term {
            return Ok(());
        }
        debug!(node = %self.id, term = self.term, from = self.commit_index, to = majority, "Advancing commit index");
        self.commit_index = majority;
        self.apply_committed()?;
        self.release_departed()
    }

    /// Hands committed entries to the state machine in index order.
    fn apply_committed(&mut self) -> Result<()> {
        if self.commit_index < self.last_applied {
            return Err(RaftError::InvariantViolation(format!(
                "commit index {} behind last applied {}",
                self.commit_index, self.last_applied
            )));
        }
        while self.last_applied < self.commit_index {
            if matches!(self.state, RaftState::Abandoned) {
                break;
            }
            let index = self.last_applied + 1;
            let entry = self.store.entry(index)?.ok_or_else(|| {
                RaftError::InvariantViolation(format!("committed entry {index} missing"))
            })?;
            let outcome = match &entry.content {
                EntryContent::Command(command) => Some(
                    self.state_machine
                        .apply(index, command)
                        .map_err(RaftError::from),
                ),
                _ => None,
            };
            self.last_applied = index;
            self.store.save_last_applied(index)?;

            if let Some(result) = outcome {
                if let Err(e) = &result {
                    warn!(node = %self.id, index, error = %e, "State machine rejected command");
                }
                if let Some(leader) = self.state.leader_mut() {
                    leader.notify_applied(index, result);
                }
            }
            if let EntryContent::Configuration(configuration) = entry.content {
                self.on_configuration_committed(index, &configuration)?;
            }
        }
        self.compact_if_needed()
    }

    ///////////////////////////////////////////////////
    // Membership
    ///////////////////////////////////////////////////

    fn on_configuration_committed(
        &mut self,
        index: LogIndex,
        configuration: &ConfigurationEntry,
    ) -> Result<()> {
        info!(
            node = %self.id,
            term = self.term,
            index,
            joint = configuration.is_joint(),
            "Configuration committed"
        );
        // Only the newest configuration drives the change forward.
        if index != self.configuration_index {
            return Ok(());
        }
        if configuration.is_joint() {
            return self.complete_joint_change(configuration, index);
        }

        let member = configuration.contains(&self.id);
        match &mut self.state {
            RaftState::Leader(leader) => {
                leader.membership.on_new_committed(index);
                if leader.membership.is_in_flight() {
                    self.progress_membership()
                } else if !member {
                    self.decommission()
                } else {
                    Ok(())
                }
            }
            RaftState::Follower | RaftState::Candidate { .. } => {
                if !member && self.was_member_before(index)? {
                    self.become_abandoned();
                }
                Ok(())
            }
            RaftState::Abandoned => Ok(()),
        }
    }

    /// Appends C-new after the joint entry at `index` committed.
    fn complete_joint_change(
        &mut self,
        joint: &ConfigurationEntry,
        index: LogIndex,
    ) -> Result<()> {
        let next_index = self.last_log_index + 1;
        let Some(leader) = self.state.leader_mut() else {
            return Ok(());
        };
        let settled = leader.membership.on_joint_committed(joint, index);
        leader.departing = joint
            .old
            .iter()
            .flatten()
            .filter(|n| n.unique_id != self.id && !settled.contains(&n.unique_id))
            .cloned()
            .collect();
        leader.departure_index = next_index;
        let new_index = self.append_local(EntryContent::Configuration(settled))?;
        if let Some(leader) = self.state.leader_mut() {
            leader.membership.new_appended(new_index);
        }
        info!(node = %self.id, term = self.term, index = new_index, "Appended new configuration");
        self.replicate_all()
    }

    /// Settles the change in flight once C-new committed and newcomers caught up.
    fn progress_membership(&mut self) -> Result<()> {
        let Some(LeaderState {
            replication,
            membership,
            ..
        }) = self.state.leader_mut()
        else {
            return Ok(());
        };
        let Some(target) = membership.try_settle(|id| replication.match_index(id)) else {
            return Ok(());
        };
        if target.iter().any(|n| n.unique_id == self.id) {
            return Ok(());
        }
        self.decommission()
    }

    /// Once C-new is committed, sends each removed member that already holds it one last round
    /// carrying the commit index, then stops replicating to it.
    fn release_departed(&mut self) -> Result<()> {
        let commit_index = self.commit_index;
        let Some(leader) = self.state.leader_mut() else {
            return Ok(());
        };
        if leader.departing.is_empty() || commit_index < leader.departure_index {
            return Ok(());
        }
        let departure_index = leader.departure_index;
        let (released, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut leader.departing)
            .into_iter()
            .partition(|n| leader.replication.match_index(&n.unique_id) >= departure_index);
        leader.departing = waiting;
        if released.is_empty() {
            return Ok(());
        }

        let ctx = self.payload_context();
        for peer in released {
            info!(node = %self.id, term = self.term, peer = %peer.unique_id, "Releasing removed member");
            let cancel = CancellationToken::new();
            match build_payload(ctx, departure_index + 1, self.store.as_ref())? {
                ReplicationPayload::Append(request) => {
                    self.outbound
                        .append_entries(peer, request, self.epoch, cancel)
                }
                ReplicationPayload::Snapshot(request) => {
                    self.outbound
                        .install_snapshot(peer, request, self.epoch, cancel)
                }
            }
        }
        let targets = self.replication_targets();
        if let Some(leader) = self.state.leader_mut() {
            leader
                .replication
                .update_membership(&targets, self.last_log_index);
        }
        Ok(())
    }

    fn was_member_before(&self, index: LogIndex) -> Result<bool> {
        let (_, previous) = self.configuration_upto(index.saturating_sub(1))?;
        Ok(previous.contains(&self.id))
    }

    /// Propagates a roster change to the active role.
    fn on_membership_updated(&mut self) {
        let peers = self.cluster.peers();
        let targets = self.replication_targets();
        let member = self.cluster.is_this_node_part_of_cluster();
        info!(
            node = %self.id,
            configuration = ?self.cluster.member_ids(),
            joint = ?self.cluster.joint_member_ids(),
            member,
            "Membership updated"
        );
        match &mut self.state {
            RaftState::Leader(leader) => {
                let added = leader
                    .replication
                    .update_membership(&targets, self.last_log_index);
                if !added.is_empty() {
                    debug!(node = %self.id, added = ?added, "Tracking new peers");
                }
            }
            RaftState::Candidate { session } => {
                self.elections.solicit(session, &peers, self.epoch);
            }
            RaftState::Follower => {
                if !member {
                    self.election_timer.stop();
                } else if !self.election_timer.is_running() {
                    self.election_timer.reset_with_different_timeout();
                }
            }
            RaftState::Abandoned => {}
        }
    }

    /// Newest configuration at or below `index`, with the index it came from.
    fn configuration_upto(&self, index: LogIndex) -> Result<(LogIndex, ConfigurationEntry)> {
        let mut cursor = cmp::min(index, self.last_log_index);
        while cursor > self.snapshot_index {
            if let Some(LogEntry {
                content: EntryContent::Configuration(configuration),
                ..
            }) = self.store.entry(cursor)?
            {
                return Ok((cursor, configuration));
            }
            cursor -= 1;
        }
        let base = self
            .snapshot_configuration
            .clone()
            .filter(|c| !c.new.is_empty())
            .unwrap_or_else(|| ConfigurationEntry::settled(self.initial_configuration.clone()));
        Ok((self.snapshot_index, base))
    }

    fn reload_configuration(&mut self) -> Result<()> {
        let (index, configuration) = self.configuration_upto(self.last_log_index)?;
        self.configuration_index = index;
        if configuration != self.cluster.as_entry() {
            self.cluster.update_configuration(&configuration);
            self.on_membership_updated();
        }
        Ok(())
    }

    ///////////////////////////////////////////////////
    // Log
    ///////////////////////////////////////////////////

    fn append_local(&mut self, content: EntryContent) -> Result<LogIndex> {
        let entry = LogEntry::new(self.last_log_index + 1, self.term, content);
        let index = entry.index;
        self.persist_entries(&[entry])?;
        Ok(index)
    }

    /// Appends to the durable log. Configuration entries take effect as soon as they are stored.
    fn persist_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.store.persist_entries(entries)?;
        let mut reconfigured = false;
        for entry in entries {
            self.last_log_index = entry.index;
            self.last_log_term = entry.term;
            if let EntryContent::Configuration(configuration) = &entry.content {
                self.cluster.update_configuration(configuration);
                self.configuration_index = entry.index;
                reconfigured = true;
            }
        }
        if reconfigured {
            self.on_membership_updated();
        }
        Ok(())
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        debug!(node = %self.id, index, last = self.last_log_index, "Truncating conflicting entries");
        self.store.truncate_from(index)?;
        self.last_log_index = index - 1;
        self.last_log_term = self.term_at(self.last_log_index)?;
        if self.configuration_index >= index {
            self.reload_configuration()?;
        }
        Ok(())
    }

    fn term_at(&self, index: LogIndex) -> Result<Term> {
        if index == self.snapshot_index {
            return Ok(self.snapshot_term);
        }
        self.store
            .entry(index)?
            .map(|e| e.term)
            .ok_or_else(|| RaftError::InvariantViolation(format!("no entry at index {index}")))
    }

    fn first_index_of_term(&self, from: LogIndex, term: Term) -> Result<LogIndex> {
        let mut index = from;
        while index > self.snapshot_index + 1 && self.term_at(index - 1)? == term {
            index -= 1;
        }
        Ok(index)
    }

    fn compact_if_needed(&mut self) -> Result<()> {
        if self.last_applied - self.snapshot_index <= self.config.snapshot_threshold {
            return Ok(());
        }
        let index = self.last_applied;
        let term = self.term_at(index)?;
        let (_, configuration) = self.configuration_upto(index)?;
        let data = self.state_machine.take_snapshot(index)?;
        let header = SnapshotHeader::new(index, term, configuration);
        self.store.save_snapshot(&header, &data)?;
        self.snapshot_index = index;
        self.snapshot_term = term;
        info!(node = %self.id, term = self.term, snapshot = %header.snapshot_id, "Compacted log");
        self.snapshot_configuration = Some(header.configuration);
        Ok(())
    }

    fn summary(&self) -> RaftNodeSummary {
        let leader = self.state.leader();
        RaftNodeSummary {
            id: self.id.clone(),
            state: self.state.value(),
            term: self.term,
            voted_for: self.voted_for.clone(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.last_log_index,
            last_log_term: self.last_log_term,
            snapshot_index: self.snapshot_index,
            leader: self.pronouncer.leader().map(|n| n.unique_id),
            configuration: self.cluster.member_ids(),
            joint_configuration: self.cluster.joint_member_ids(),
            next_indexes: leader
                .map(|l| l.replication.next_indexes())
                .unwrap_or_default(),
            match_indexes: leader
                .map(|l| l.replication.match_indexes())
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::error::StateMachineError;
    use crate::storage::MemoryStore;

    /// Fails every RPC. Tests hand the node its replies directly.
    struct Unreachable;

    #[async_trait]
    impl Transport for Unreachable {
        async fn request_vote(
            &self,
            peer: &NodeConfiguration,
            _request: RequestVoteRequest,
        ) -> std::result::Result<RequestVoteResponse, TransportError> {
            Err(TransportError::Unreachable(peer.unique_id.clone()))
        }

        async fn append_entries(
            &self,
            peer: &NodeConfiguration,
            _request: AppendEntriesRequest,
        ) -> std::result::Result<AppendEntriesResponse, TransportError> {
            Err(TransportError::Unreachable(peer.unique_id.clone()))
        }

        async fn install_snapshot(
            &self,
            peer: &NodeConfiguration,
            _request: InstallSnapshotRequest,
        ) -> std::result::Result<InstallSnapshotResponse, TransportError> {
            Err(TransportError::Unreachable(peer.unique_id.clone()))
        }
    }

    struct Echo;

    impl StateMachine for Echo {
        fn apply(
            &mut self,
            _index: LogIndex,
            command: &[u8],
        ) -> std::result::Result<Vec<u8>, StateMachineError> {
            Ok(command.to_vec())
        }

        fn take_snapshot(
            &mut self,
            upto_index: LogIndex,
        ) -> std::result::Result<Vec<u8>, StateMachineError> {
            Ok(upto_index.to_be_bytes().to_vec())
        }

        fn restore_from_snapshot(
            &mut self,
            _header: &SnapshotHeader,
            _data: &[u8],
        ) -> std::result::Result<(), StateMachineError> {
            Ok(())
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            election_timeout_min_ms: 1000,
            election_timeout_max_ms: 1500,
            ..EngineConfig::default()
        }
    }

    /// The first id in `roster` is the node under test.
    fn new_node(roster: &[&str], config: EngineConfig) -> RaftNode {
        let members: Vec<_> = roster
            .iter()
            .map(|id| NodeConfiguration::new(*id, ""))
            .collect();
        let (pronouncer, _) = LeaderPronouncer::new();
        let (state_tx, _) = watch::channel(StateValue::None);
        let (_, inbox_rx) = mpsc::channel(1);
        RaftNode::new(NodeContext {
            this_node: members[0].clone(),
            config,
            store: Box::new(MemoryStore::new()),
            state_machine: Box::new(Echo),
            transport: Arc::new(Unreachable),
            initial_configuration: members,
            pronouncer,
            state_tx,
            inbox_rx,
            shutdown: CancellationToken::new(),
        })
        .unwrap()
    }

    fn heartbeat(term: Term, leader: &str) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term,
            leader_id: leader.to_string(),
            previous_log_index: 0,
            previous_log_term: 0,
            entries: vec![],
            leader_commit_index: 0,
        }
    }

    fn grant(node: &mut RaftNode, peer: &str, epoch: u64, term: Term) {
        node.receive_reply(PeerReply::Vote {
            peer: peer.to_string(),
            epoch,
            result: Ok(RequestVoteResponse {
                term,
                vote_granted: true,
            }),
        })
        .unwrap();
    }

    /// Replies to an append that carried entries `1..=upto`.
    fn ack(
        node: &mut RaftNode,
        peer: &str,
        epoch: u64,
        upto: LogIndex,
        response: AppendEntriesResponse,
    ) {
        node.receive_reply(PeerReply::Append {
            peer: peer.to_string(),
            epoch,
            previous_log_index: 0,
            entry_count: upto,
            result: Ok(response),
        })
        .unwrap();
    }

    fn command(node: &mut RaftNode) -> oneshot::Receiver<Result<Vec<u8>>> {
        let (tx, rx) = oneshot::channel();
        node.handle_client_command(b"x".to_vec(), tx).unwrap();
        rx
    }

    #[tokio::test]
    async fn late_grants_do_not_revive_a_candidacy() {
        let mut node = new_node(&["a", "b", "c"], config());
        node.start_election().unwrap();
        assert_eq!(node.state.value(), StateValue::Candidate);
        let (candidacy, term) = (node.epoch, node.term);

        // c already won this term.
        assert!(node.receive_append_entries(heartbeat(term, "c")).unwrap().success);
        assert_eq!(node.state.value(), StateValue::Follower);

        grant(&mut node, "b", candidacy, term);
        grant(&mut node, "c", candidacy, term);
        assert_eq!(node.state.value(), StateValue::Follower);
        assert_eq!(
            node.pronouncer.leader().map(|n| n.unique_id),
            Some("c".to_string())
        );

        // Nor do they count toward the next candidacy, even when the term lines up.
        node.start_election().unwrap();
        let (epoch, term) = (node.epoch, node.term);
        grant(&mut node, "b", candidacy, term);
        assert_eq!(node.state.value(), StateValue::Candidate);
        grant(&mut node, "b", epoch, term);
        assert_eq!(node.state.value(), StateValue::Leader);
    }

    #[tokio::test]
    async fn acks_from_a_previous_reign_do_not_move_commit() {
        let mut node = new_node(&["a", "b", "c"], config());
        node.start_election().unwrap();
        let epoch = node.epoch;
        grant(&mut node, "b", epoch, 1);
        assert_eq!(node.state.value(), StateValue::Leader);
        let first_reign = node.epoch;
        let mut pending = command(&mut node);
        assert_eq!((node.last_log_index, node.commit_index), (2, 0));

        // Deposed while the append of 1..=2 is still out.
        assert!(node.receive_append_entries(heartbeat(2, "b")).unwrap().success);
        assert_eq!(node.state.value(), StateValue::Follower);
        assert!(matches!(pending.try_recv(), Ok(Err(RaftError::LeadershipLost))));

        node.start_election().unwrap();
        let epoch = node.epoch;
        grant(&mut node, "c", epoch, 3);
        assert_eq!(node.state.value(), StateValue::Leader);
        assert_eq!(node.last_log_index, 3);

        ack(&mut node, "b", first_reign, 2, AppendEntriesResponse::accepted(1));
        ack(&mut node, "c", first_reign, 2, AppendEntriesResponse::accepted(1));
        assert_eq!(node.commit_index, 0);
        let summary = node.summary();
        assert_eq!(summary.match_indexes.get("b"), Some(&0));
        assert_eq!(summary.match_indexes.get("c"), Some(&0));

        let reign = node.epoch;
        ack(&mut node, "b", reign, 3, AppendEntriesResponse::accepted(3));
        assert_eq!(node.commit_index, 3);
        assert_eq!(node.last_applied, 3);
    }

    #[tokio::test]
    async fn compaction_waits_until_threshold_is_exceeded() {
        let mut node = new_node(
            &["a"],
            EngineConfig {
                snapshot_threshold: 2,
                ..config()
            },
        );
        node.start_election().unwrap();
        assert_eq!(node.state.value(), StateValue::Leader);
        assert_eq!(node.last_applied, 1);

        let mut first = command(&mut node);
        assert_eq!(node.last_applied, 2);
        assert_eq!(node.snapshot_index, 0);
        assert_eq!(first.try_recv().unwrap().unwrap(), b"x".to_vec());

        let _second = command(&mut node);
        assert_eq!(node.last_applied, 3);
        assert_eq!(node.snapshot_index, 3);
        let (header, data) = node.store.load_snapshot().unwrap().unwrap();
        assert_eq!(header.last_included_index, 3);
        assert_eq!(data, 3u64.to_be_bytes().to_vec());
    }

    #[tokio::test]
    async fn abandoned_node_marks_its_replies() {
        let mut node = new_node(&["a", "b", "c"], config());
        node.become_abandoned();

        let append = node.receive_append_entries(heartbeat(5, "b")).unwrap();
        assert!(!append.success);
        assert!(append.decommissioned);

        let snapshot = node
            .receive_install_snapshot(InstallSnapshotRequest {
                term: 5,
                leader_id: "b".to_string(),
                snapshot_header: SnapshotHeader::new(3, 1, ConfigurationEntry::settled(vec![])),
                data: vec![],
            })
            .unwrap();
        assert!(!snapshot.success);
        assert!(snapshot.decommissioned);
        assert_eq!(node.term, 0);
    }

    #[tokio::test]
    async fn leader_stops_replicating_to_a_decommissioned_peer() {
        let mut node = new_node(&["a", "b", "c"], config());
        node.start_election().unwrap();
        let epoch = node.epoch;
        grant(&mut node, "b", epoch, 1);
        assert_eq!(node.state.value(), StateValue::Leader);

        let reign = node.epoch;
        ack(&mut node, "c", reign, 1, AppendEntriesResponse::decommissioned(1));
        node.on_heartbeat_timeout().unwrap();

        let replication = &node.state.leader().unwrap().replication;
        let c = replication.progress("c").unwrap();
        assert!(c.retired);
        assert!(!c.in_flight);
        assert_eq!(c.match_index, 0);
        assert!(replication.progress("b").unwrap().in_flight);
    }
}
