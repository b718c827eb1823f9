use async_trait::async_trait;

use crate::error::{DiscoveryError, StateMachineError, TransportError};
use crate::msg::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    LogIndex, NodeConfiguration, RequestVoteRequest, RequestVoteResponse, SnapshotHeader,
};

/// Outbound RPCs to peers. Failures are expected and are retried by the core.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        peer: &NodeConfiguration,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError>;

    async fn append_entries(
        &self,
        peer: &NodeConfiguration,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;

    async fn install_snapshot(
        &self,
        peer: &NodeConfiguration,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, TransportError>;
}

/// The replicated application. Commands reach it exactly once, in index order.
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Result<Vec<u8>, StateMachineError>;

    /// Serializes the application state covering every command up to `upto_index`.
    fn take_snapshot(&mut self, upto_index: LogIndex) -> Result<Vec<u8>, StateMachineError>;

    fn restore_from_snapshot(
        &mut self,
        header: &SnapshotHeader,
        data: &[u8],
    ) -> Result<(), StateMachineError>;
}

/// Bootstraps the initial roster before a node starts.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    async fn enroll(&self, this_node: &NodeConfiguration) -> Result<(), DiscoveryError>;

    async fn discover_peers(&self) -> Result<Vec<NodeConfiguration>, DiscoveryError>;
}
