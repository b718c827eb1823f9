use thiserror::Error;

use crate::msg::NodeConfiguration;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Not the leader, recognized leader is {leader_hint:?}")]
    NotLeader {
        leader_hint: Option<NodeConfiguration>,
    },

    #[error("Node has been removed from the cluster")]
    Decommissioned,

    #[error("A configuration change is already in flight")]
    ConfigurationChangeInFlight,

    #[error("Invalid configuration change: {0}")]
    InvalidConfigurationChange(String),

    #[error("Leadership was lost before the request completed")]
    LeadershipLost,

    #[error("Request cancelled by caller")]
    Cancelled,

    #[error("Node not initialized or not started yet")]
    NodeNotReady,

    #[error("Node has stopped")]
    NodeStopped,

    #[error("Invalid engine configuration: {0}")]
    InvalidEngineConfig(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Node task failed: {0}")]
    TaskFailed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("State machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),
}

impl RaftError {
    pub fn leader_hint(&self) -> Option<&NodeConfiguration> {
        match self {
            RaftError::NotLeader { leader_hint } => leader_hint.as_ref(),
            _ => None,
        }
    }

    /// Errors after which the node must stop participating.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RaftError::Storage(_) | RaftError::InvariantViolation(_) | RaftError::TaskFailed(_)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct StorageError(pub String);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct StateMachineError(pub String);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct DiscoveryError(pub String);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Remote error: {0}")]
    Remote(String),
}

pub type Result<T> = std::result::Result<T, RaftError>;
