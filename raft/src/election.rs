use ahash::{HashSet, HashSetExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::cluster::ClusterConfiguration;
use crate::msg::{NodeConfiguration, NodeId, RequestVoteRequest, Term};
use crate::rpc::Outbound;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteTally {
    /// Quorum not reached yet.
    Pending,
    /// Quorum reached; the candidate should become leader.
    Won,
    /// The vote does not belong to this session.
    Discarded,
}

/// One election attempt, keyed by term. Dropping the session abandons it: outstanding vote
/// requests are cancelled and their replies never arrive.
#[derive(Debug)]
pub struct ElectionSession {
    term: Term,
    request: RequestVoteRequest,
    votes: HashSet<NodeId>,
    solicited: HashSet<NodeId>,
    cancel: CancellationToken,
}

impl ElectionSession {
    pub fn votes(&self) -> usize {
        self.votes.len()
    }

    /// Records a vote and re-evaluates the quorum against the (possibly joint) configuration.
    pub fn record_vote(
        &mut self,
        term: Term,
        voter: &NodeId,
        granted: bool,
        cluster: &ClusterConfiguration,
    ) -> VoteTally {
        if term != self.term || self.cancel.is_cancelled() {
            trace!(term, session_term = self.term, voter = %voter, "Discarding vote for another session");
            return VoteTally::Discarded;
        }
        if granted {
            self.votes.insert(voter.clone());
        }
        self.tally(cluster)
    }

    pub fn tally(&self, cluster: &ClusterConfiguration) -> VoteTally {
        if cluster.is_quorum(|id| self.votes.contains(id)) {
            VoteTally::Won
        } else {
            VoteTally::Pending
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ElectionSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Runs a single election round per term: fans RequestVote out to every peer and leaves
/// counting to the session.
pub(crate) struct ElectionManager {
    outbound: Outbound,
}

impl ElectionManager {
    pub fn new(outbound: Outbound) -> Self {
        Self { outbound }
    }

    pub fn initiate(
        &self,
        request: RequestVoteRequest,
        cluster: &ClusterConfiguration,
        epoch: u64,
        cancel: CancellationToken,
    ) -> ElectionSession {
        let mut votes = HashSet::new();
        // Our own vote is already persisted by the caller.
        votes.insert(request.candidate_id.clone());
        let mut session = ElectionSession {
            term: request.term,
            request,
            votes,
            solicited: HashSet::new(),
            cancel,
        };
        info!(
            node = %session.request.candidate_id,
            term = session.term,
            "Starting election"
        );
        self.solicit(&mut session, &cluster.peers(), epoch);
        session
    }

    /// Sends the session's vote request to any of `peers` not asked yet.
    pub fn solicit(&self, session: &mut ElectionSession, peers: &[NodeConfiguration], epoch: u64) {
        for peer in peers {
            if !session.solicited.insert(peer.unique_id.clone()) {
                continue;
            }
            debug!(term = session.term, peer = %peer.unique_id, "Requesting vote");
            self.outbound.request_vote(
                peer.clone(),
                session.request.clone(),
                epoch,
                session.cancel.child_token(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(ids: &[&str]) -> ClusterConfiguration {
        ClusterConfiguration::new(
            NodeConfiguration::new(ids[0], ""),
            ids.iter().map(|id| NodeConfiguration::new(*id, "")).collect(),
        )
    }

    fn session(term: Term, candidate: &str) -> ElectionSession {
        let mut votes = HashSet::new();
        votes.insert(candidate.to_string());
        ElectionSession {
            term,
            request: RequestVoteRequest {
                term,
                candidate_id: candidate.to_string(),
                last_log_index: 0,
                last_log_term: 0,
            },
            votes,
            solicited: HashSet::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn single_node_wins_with_own_vote() {
        let s = session(1, "a");
        assert_eq!(s.tally(&cluster(&["a"])), VoteTally::Won);
    }

    #[test]
    fn three_nodes_need_one_more_vote() {
        let c = cluster(&["a", "b", "c"]);
        let mut s = session(2, "a");
        assert_eq!(s.tally(&c), VoteTally::Pending);
        assert_eq!(s.record_vote(2, &"b".to_string(), false, &c), VoteTally::Pending);
        assert_eq!(s.record_vote(2, &"c".to_string(), true, &c), VoteTally::Won);
        assert_eq!(s.votes(), 2);
    }

    #[test]
    fn votes_from_other_terms_are_discarded() {
        let c = cluster(&["a", "b", "c"]);
        let mut s = session(3, "a");
        assert_eq!(s.record_vote(2, &"b".to_string(), true, &c), VoteTally::Discarded);
        assert_eq!(s.votes(), 1);
    }

    #[test]
    fn cancelled_session_discards_votes() {
        let c = cluster(&["a", "b", "c"]);
        let mut s = session(3, "a");
        s.cancel();
        assert_eq!(s.record_vote(3, &"b".to_string(), true, &c), VoteTally::Discarded);
    }

    #[test]
    fn joint_configuration_requires_both_majorities() {
        let mut c = cluster(&["a", "b", "c"]);
        c.update_configuration(&crate::msg::ConfigurationEntry::joint(
            ["a", "b", "c"].iter().map(|id| NodeConfiguration::new(*id, "")).collect(),
            ["a", "d", "e"].iter().map(|id| NodeConfiguration::new(*id, "")).collect(),
        ));
        let mut s = session(1, "a");
        assert_eq!(s.record_vote(1, &"b".to_string(), true, &c), VoteTally::Pending);
        assert_eq!(s.record_vote(1, &"d".to_string(), true, &c), VoteTally::Won);
    }
}
