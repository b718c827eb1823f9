use ahash::{HashMap, HashMapExt};
use tracing::debug;

use crate::error::{RaftError, Result};
use crate::msg::{
    AppendEntriesRequest, InstallSnapshotRequest, LogIndex, NodeConfiguration, NodeId, Term,
};
use crate::storage::PersistentStore;

/// What the leader knows about one follower's log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerProgress {
    pub next_index: LogIndex,
    pub match_index: LogIndex,
    /// One request per peer at a time; cleared by the reply or its timeout.
    pub in_flight: bool,
    /// The peer left the cluster for good and gets no further requests.
    pub retired: bool,
}

impl PeerProgress {
    fn new(last_log_index: LogIndex) -> Self {
        Self {
            next_index: last_log_index + 1,
            match_index: 0,
            in_flight: false,
            retired: false,
        }
    }
}

/// Per-peer replication bookkeeping. Lives exactly as long as the leader role.
#[derive(Debug, Default)]
pub struct LeaderVolatileState {
    peers: HashMap<NodeId, PeerProgress>,
}

impl LeaderVolatileState {
    pub fn new(peers: &[NodeConfiguration], last_log_index: LogIndex) -> Self {
        let mut state = Self {
            peers: HashMap::with_capacity(peers.len()),
        };
        state.update_membership(peers, last_log_index);
        state
    }

    /// Starts tracking peers that joined the roster and forgets the ones that left.
    /// Returns the ids that were added.
    pub fn update_membership(
        &mut self,
        peers: &[NodeConfiguration],
        last_log_index: LogIndex,
    ) -> Vec<NodeId> {
        self.peers
            .retain(|id, _| peers.iter().any(|p| &p.unique_id == id));
        let mut added = Vec::new();
        for peer in peers {
            if !self.peers.contains_key(&peer.unique_id) {
                self.peers
                    .insert(peer.unique_id.clone(), PeerProgress::new(last_log_index));
                added.push(peer.unique_id.clone());
            }
        }
        added
    }

    pub fn progress(&self, peer: &str) -> Option<&PeerProgress> {
        self.peers.get(peer)
    }

    pub fn match_index(&self, peer: &str) -> LogIndex {
        self.peers.get(peer).map(|p| p.match_index).unwrap_or(0)
    }

    /// Marks a request as outstanding. False when one already is.
    pub fn begin_send(&mut self, peer: &str) -> bool {
        match self.peers.get_mut(peer) {
            Some(p) if !p.in_flight && !p.retired => {
                p.in_flight = true;
                true
            }
            _ => false,
        }
    }

    pub fn finish_send(&mut self, peer: &str) {
        if let Some(p) = self.peers.get_mut(peer) {
            p.in_flight = false;
        }
    }

    /// Stops sending to a peer. Its match index still counts while it stays in the roster.
    pub fn retire(&mut self, peer: &str) {
        if let Some(p) = self.peers.get_mut(peer) {
            p.in_flight = false;
            p.retired = true;
        }
    }

    /// Records an acknowledged append or snapshot. `match_index` never moves backwards.
    pub fn record_success(&mut self, peer: &str, matched: LogIndex) -> bool {
        let Some(p) = self.peers.get_mut(peer) else {
            return false;
        };
        p.in_flight = false;
        let advanced = matched > p.match_index;
        p.match_index = p.match_index.max(matched);
        p.next_index = p.match_index + 1;
        advanced
    }

    pub fn record_conflict(&mut self, peer: &str, next_index: LogIndex) {
        if let Some(p) = self.peers.get_mut(peer) {
            p.in_flight = false;
            // Never back off below what the peer is known to hold.
            p.next_index = next_index.max(p.match_index + 1);
        }
    }

    pub fn next_indexes(&self) -> HashMap<NodeId, LogIndex> {
        self.peers
            .iter()
            .map(|(id, p)| (id.clone(), p.next_index))
            .collect()
    }

    pub fn match_indexes(&self) -> HashMap<NodeId, LogIndex> {
        self.peers
            .iter()
            .map(|(id, p)| (id.clone(), p.match_index))
            .collect()
    }
}

/// Picks the follower's next index after a rejected append.
///
/// With a conflicting term, jumps to the leader's first entry of that term, or of the nearest
/// earlier term it holds, and falls back to the follower's reported index. The result always lies
/// in `[1, previous_log_index]` so each rejection makes progress.
pub fn resolve_next_index(
    previous_log_index: LogIndex,
    conflicting_term: Option<Term>,
    reported_first_index: Option<LogIndex>,
    snapshot_index: LogIndex,
    term_at: impl Fn(LogIndex) -> Option<Term>,
) -> LogIndex {
    let reported = reported_first_index.unwrap_or(previous_log_index);
    let target = conflicting_term
        .and_then(|term| {
            first_index_at_or_before(term, previous_log_index, snapshot_index, &term_at)
        })
        .unwrap_or(reported);
    target.clamp(1, previous_log_index.max(1))
}

fn first_index_at_or_before(
    term: Term,
    from: LogIndex,
    floor: LogIndex,
    term_at: &impl Fn(LogIndex) -> Option<Term>,
) -> Option<LogIndex> {
    let mut index = from;
    let held = loop {
        let t = term_at(index)?;
        if t <= term {
            break t;
        }
        if index <= floor {
            return None;
        }
        index -= 1;
    };
    // The sentinel is not a term anyone holds.
    if held == 0 {
        return None;
    }
    while index > floor && term_at(index - 1) == Some(held) {
        index -= 1;
    }
    Some(index)
}

#[derive(Debug)]
pub enum ReplicationPayload {
    Append(AppendEntriesRequest),
    Snapshot(InstallSnapshotRequest),
}

/// Leader-side facts every outgoing payload needs.
#[derive(Clone, Copy, Debug)]
pub struct PayloadContext<'a> {
    pub term: Term,
    pub leader_id: &'a NodeId,
    pub commit_index: LogIndex,
    pub snapshot_index: LogIndex,
    pub max_entries: usize,
}

/// Builds the request that moves a peer forward from `next_index`: an append when the previous
/// entry is still in the log, the snapshot when it has been compacted away.
pub fn build_payload(
    ctx: PayloadContext<'_>,
    next_index: LogIndex,
    store: &dyn PersistentStore,
) -> Result<ReplicationPayload> {
    let next_index = next_index.max(1);
    if ctx.snapshot_index > 0 && next_index <= ctx.snapshot_index {
        let (snapshot_header, data) = store.load_snapshot()?.ok_or_else(|| {
            RaftError::InvariantViolation(format!(
                "snapshot index {} recorded but no snapshot stored",
                ctx.snapshot_index
            ))
        })?;
        debug!(
            next_index,
            snapshot = %snapshot_header.snapshot_id,
            "Peer is behind the snapshot boundary"
        );
        return Ok(ReplicationPayload::Snapshot(InstallSnapshotRequest {
            term: ctx.term,
            leader_id: ctx.leader_id.clone(),
            snapshot_header,
            data,
        }));
    }

    let previous_log_index = next_index - 1;
    let previous = store.entry(previous_log_index)?.ok_or_else(|| {
        RaftError::InvariantViolation(format!(
            "entry {previous_log_index} missing from log above snapshot {}",
            ctx.snapshot_index
        ))
    })?;
    let entries = store.entries(next_index, ctx.max_entries)?;
    Ok(ReplicationPayload::Append(AppendEntriesRequest {
        term: ctx.term,
        leader_id: ctx.leader_id.clone(),
        previous_log_index,
        previous_log_term: previous.term,
        entries,
        leader_commit_index: ctx.commit_index,
    }))
}
