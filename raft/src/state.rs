use std::collections::BTreeMap;
use tokio::sync::oneshot;

use crate::election::ElectionSession;
use crate::error::{RaftError, Result};
use crate::membership::MembershipChanger;
use crate::msg::{LogIndex, NodeConfiguration, StateValue};
use crate::replication::LeaderVolatileState;

pub(crate) type CommandResponder = oneshot::Sender<Result<Vec<u8>>>;

/// Role of a node. Each variant owns exactly the state that must not outlive the role; dropping
/// it cancels the role's in-flight work.
#[derive(Debug)]
pub(crate) enum RaftState {
    Follower,
    Candidate { session: ElectionSession },
    Leader(LeaderState),
    /// Removed from the cluster. Terminal.
    Abandoned,
}

impl RaftState {
    pub fn value(&self) -> StateValue {
        match self {
            RaftState::Follower => StateValue::Follower,
            RaftState::Candidate { .. } => StateValue::Candidate,
            RaftState::Leader(_) => StateValue::Leader,
            RaftState::Abandoned => StateValue::Abandoned,
        }
    }

    pub fn leader_mut(&mut self) -> Option<&mut LeaderState> {
        match self {
            RaftState::Leader(leader) => Some(leader),
            _ => None,
        }
    }

    pub fn leader(&self) -> Option<&LeaderState> {
        match self {
            RaftState::Leader(leader) => Some(leader),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct LeaderState {
    pub replication: LeaderVolatileState,
    pub membership: MembershipChanger,
    /// Client commands waiting for their entry to be applied, by log index.
    pub waiters: BTreeMap<LogIndex, CommandResponder>,
    /// Members removed by the C-new at `departure_index`. They keep receiving entries until
    /// they hold it and have been told it committed.
    pub departing: Vec<NodeConfiguration>,
    pub departure_index: LogIndex,
}

impl LeaderState {
    pub fn new(replication: LeaderVolatileState) -> Self {
        Self {
            replication,
            membership: MembershipChanger::new(),
            waiters: BTreeMap::new(),
            departing: Vec::new(),
            departure_index: 0,
        }
    }

    pub fn notify_applied(&mut self, index: LogIndex, result: Result<Vec<u8>>) {
        if let Some(waiter) = self.waiters.remove(&index) {
            // The caller may have cancelled.
            let _ = waiter.send(result);
        }
    }

    /// Fails every outstanding client request with `error`.
    pub fn release_waiters(&mut self, error: impl Fn() -> RaftError) {
        for (_, waiter) in std::mem::take(&mut self.waiters) {
            let _ = waiter.send(Err(error()));
        }
        self.membership.abort(error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::NodeConfiguration;

    #[test]
    fn waiters_are_released_with_error() {
        let mut leader = LeaderState::new(LeaderVolatileState::new(
            &[NodeConfiguration::new("b", "")],
            1,
        ));
        let (tx, mut rx) = oneshot::channel();
        leader.waiters.insert(2, tx);
        leader.release_waiters(|| RaftError::LeadershipLost);
        assert!(matches!(rx.try_recv(), Ok(Err(RaftError::LeadershipLost))));
        assert!(leader.waiters.is_empty());
    }

    #[test]
    fn applied_entry_notifies_only_its_waiter() {
        let mut leader = LeaderState::new(LeaderVolatileState::default());
        let (tx2, mut rx2) = oneshot::channel();
        let (tx3, mut rx3) = oneshot::channel();
        leader.waiters.insert(2, tx2);
        leader.waiters.insert(3, tx3);
        leader.notify_applied(2, Ok(b"ok".to_vec()));
        assert!(matches!(rx2.try_recv(), Ok(Ok(v)) if v == b"ok"));
        assert!(rx3.try_recv().is_err());
        assert_eq!(RaftState::Leader(leader).value(), StateValue::Leader);
    }
}
