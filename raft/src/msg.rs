use ahash::HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::RaftError;

pub type Term = u64;
pub type LogIndex = u64;
pub type NodeId = String;

pub const HEARTBEAT_INTERVAL_MS: u64 = 50;
pub const ELECTION_TIMEOUT_MS_LOW: u64 = 150;
pub const ELECTION_TIMEOUT_MS_HIGH: u64 = 300;
pub const RPC_TIMEOUT_MS: u64 = 100;

/// Identity and address of one cluster member.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeConfiguration {
    pub unique_id: NodeId,
    pub address: String,
}

impl NodeConfiguration {
    pub fn new(unique_id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            unique_id: unique_id.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for NodeConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.unique_id, self.address)
    }
}

/// A membership entry. `old` is present only for the joint (C-old,new) entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationEntry {
    pub old: Option<Vec<NodeConfiguration>>,
    pub new: Vec<NodeConfiguration>,
}

impl ConfigurationEntry {
    pub fn joint(old: Vec<NodeConfiguration>, new: Vec<NodeConfiguration>) -> Self {
        Self { old: Some(old), new }
    }

    pub fn settled(new: Vec<NodeConfiguration>) -> Self {
        Self { old: None, new }
    }

    pub fn is_joint(&self) -> bool {
        self.old.is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.new
            .iter()
            .chain(self.old.iter().flatten())
            .any(|n| n.unique_id == id)
    }
}

/// Describes the compacted prefix of the log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub snapshot_id: String,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    /// Membership in force at `last_included_index`.
    pub configuration: ConfigurationEntry,
}

impl SnapshotHeader {
    pub fn new(
        last_included_index: LogIndex,
        last_included_term: Term,
        configuration: ConfigurationEntry,
    ) -> Self {
        Self {
            snapshot_id: format!("{last_included_term}-{last_included_index}"),
            last_included_index,
            last_included_term,
            configuration,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    None,
    NoOperation,
    Command,
    Configuration,
    Snapshot,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryContent {
    None,
    NoOperation,
    Command(Vec<u8>),
    Configuration(ConfigurationEntry),
    Snapshot(SnapshotHeader),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub content: EntryContent,
}

impl LogEntry {
    /// The 0th entry is always a placeholder.
    pub fn sentinel() -> Self {
        Self {
            index: 0,
            term: 0,
            content: EntryContent::None,
        }
    }

    pub fn new(index: LogIndex, term: Term, content: EntryContent) -> Self {
        Self {
            index,
            term,
            content,
        }
    }

    pub fn entry_type(&self) -> EntryType {
        match self.content {
            EntryContent::None => EntryType::None,
            EntryContent::NoOperation => EntryType::NoOperation,
            EntryContent::Command(_) => EntryType::Command,
            EntryContent::Configuration(_) => EntryType::Configuration,
            EntryContent::Snapshot(_) => EntryType::Snapshot,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub previous_log_index: LogIndex,
    pub previous_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit_index: LogIndex,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub conflicting_entry_term: Option<Term>,
    pub first_index_of_conflicting_entry_term: Option<LogIndex>,
    /// Set by a node that was removed from the cluster. It will never accept entries again.
    #[serde(default)]
    pub decommissioned: bool,
}

impl AppendEntriesResponse {
    pub fn accepted(term: Term) -> Self {
        Self {
            term,
            success: true,
            conflicting_entry_term: None,
            first_index_of_conflicting_entry_term: None,
            decommissioned: false,
        }
    }

    pub fn rejected(term: Term) -> Self {
        Self {
            term,
            success: false,
            conflicting_entry_term: None,
            first_index_of_conflicting_entry_term: None,
            decommissioned: false,
        }
    }

    pub fn conflict(term: Term, conflicting_term: Option<Term>, first_index: LogIndex) -> Self {
        Self {
            term,
            success: false,
            conflicting_entry_term: conflicting_term,
            first_index_of_conflicting_entry_term: Some(first_index),
            decommissioned: false,
        }
    }

    pub fn decommissioned(term: Term) -> Self {
        Self {
            decommissioned: true,
            ..Self::rejected(term)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub snapshot_header: SnapshotHeader,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub success: bool,
    #[serde(default)]
    pub decommissioned: bool,
}

impl InstallSnapshotResponse {
    pub fn new(term: Term, success: bool) -> Self {
        Self {
            term,
            success,
            decommissioned: false,
        }
    }

    pub fn decommissioned(term: Term) -> Self {
        Self {
            term,
            success: false,
            decommissioned: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationChangeRequest {
    pub unique_id: String,
    pub new_configuration: Vec<NodeConfiguration>,
}

/// Wire-shaped outcome of a configuration change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationChangeResponse {
    pub is_successful: bool,
    pub error: Option<String>,
    pub leader_hint: Option<NodeConfiguration>,
}

impl From<Result<(), RaftError>> for ConfigurationChangeResponse {
    fn from(result: Result<(), RaftError>) -> Self {
        match result {
            Ok(()) => Self {
                is_successful: true,
                error: None,
                leader_hint: None,
            },
            Err(e) => Self {
                is_successful: false,
                leader_hint: e.leader_hint().cloned(),
                error: Some(e.to_string()),
            },
        }
    }
}

/// Wire-shaped outcome of a client command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCommandResponse {
    pub is_successful: bool,
    pub command_result: Option<Vec<u8>>,
    pub error: Option<String>,
    pub leader_hint: Option<NodeConfiguration>,
}

impl From<Result<Vec<u8>, RaftError>> for ClientCommandResponse {
    fn from(result: Result<Vec<u8>, RaftError>) -> Self {
        match result {
            Ok(output) => Self {
                is_successful: true,
                command_result: Some(output),
                error: None,
                leader_hint: None,
            },
            Err(e) => Self {
                is_successful: false,
                command_result: None,
                leader_hint: e.leader_hint().cloned(),
                error: Some(e.to_string()),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateValue {
    #[default]
    None,
    Follower,
    Candidate,
    Leader,
    Abandoned,
    Stopped,
}

impl StateValue {
    pub fn is_leader(self) -> bool {
        self == StateValue::Leader
    }

    pub fn is_abandoned(self) -> bool {
        self == StateValue::Abandoned
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

///////////////////////////////////////////////////
// Point-in-time capture of a node, for tests and tooling.
///////////////////////////////////////////////////
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaftNodeSummary {
    pub id: NodeId,
    pub state: StateValue,
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    pub snapshot_index: LogIndex,
    pub leader: Option<NodeId>,
    pub configuration: Vec<NodeId>,
    pub joint_configuration: Option<Vec<NodeId>>,
    /// Only populated while the node is leader.
    pub next_indexes: HashMap<NodeId, LogIndex>,
    pub match_indexes: HashMap<NodeId, LogIndex>,
}

impl RaftNodeSummary {
    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joint_entry_contains_old_and_new_members() {
        let entry = ConfigurationEntry::joint(
            vec![NodeConfiguration::new("a", ""), NodeConfiguration::new("b", "")],
            vec![NodeConfiguration::new("b", ""), NodeConfiguration::new("c", "")],
        );
        assert!(entry.is_joint());
        assert!(entry.contains("a"));
        assert!(entry.contains("c"));
        assert!(!entry.contains("d"));
        assert!(!ConfigurationEntry::settled(entry.new.clone()).contains("a"));
    }

    #[test]
    fn not_leader_error_carries_hint_into_response() {
        let leader = NodeConfiguration::new("n1", "local://n1");
        let response = ClientCommandResponse::from(Err(RaftError::NotLeader {
            leader_hint: Some(leader.clone()),
        }));
        assert!(!response.is_successful);
        assert_eq!(response.leader_hint, Some(leader));
        assert!(response.error.is_some());
    }

    #[test]
    fn snapshot_id_derives_from_term_and_index() {
        let header = SnapshotHeader::new(12, 3, ConfigurationEntry::default());
        assert_eq!(header.snapshot_id, "3-12");
    }
}
