use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::EngineConfig;
use crate::error::{RaftError, Result};
use crate::msg::{
    AppendEntriesRequest, AppendEntriesResponse, ConfigurationChangeRequest,
    InstallSnapshotRequest, InstallSnapshotResponse, NodeConfiguration, NodeId, RaftNodeSummary,
    RequestVoteRequest, RequestVoteResponse, StateValue,
};
use crate::pronouncer::LeaderPronouncer;
use crate::raft_node::{NodeContext, NodeMsg, RaftNode};
use crate::storage::PersistentStore;
use crate::transport::{Discovery, StateMachine, Transport};

const INBOX_CAPACITY: usize = 256;

/// Collaborators held until the node task is spawned.
struct Pending {
    store: Box<dyn PersistentStore>,
    state_machine: Box<dyn StateMachine>,
    pronouncer: LeaderPronouncer,
    state_tx: watch::Sender<StateValue>,
    inbox_rx: mpsc::Receiver<NodeMsg>,
}

/// A Raft participant: `new`, then `initialize_configuration`, then `start`.
pub struct Node {
    this_node: NodeConfiguration,
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    discovery: Arc<dyn Discovery>,
    initial_configuration: Option<Vec<NodeConfiguration>>,
    pending: Option<Pending>,
    handle: NodeHandle,
    shutdown: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl Node {
    pub fn new(
        this_node: NodeConfiguration,
        config: EngineConfig,
        store: impl PersistentStore,
        state_machine: impl StateMachine,
        transport: Arc<dyn Transport>,
        discovery: Arc<dyn Discovery>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (state_tx, state_rx) = watch::channel(StateValue::None);
        let (pronouncer, leader_rx) = LeaderPronouncer::new();
        let handle = NodeHandle {
            node: this_node.clone(),
            inbox_tx,
            state_rx,
            leader_rx,
        };
        Self {
            this_node,
            config,
            transport,
            discovery,
            initial_configuration: None,
            pending: Some(Pending {
                store: Box::new(store),
                state_machine: Box::new(state_machine),
                pronouncer,
                state_tx,
                inbox_rx,
            }),
            handle,
            shutdown: CancellationToken::new(),
            task: None,
        }
    }

    /// Validates the engine configuration, enrolls with discovery and fetches the initial roster.
    pub async fn initialize_configuration(&mut self) -> Result<()> {
        self.config.validate()?;
        self.discovery.enroll(&self.this_node).await?;
        let roster = self.discovery.discover_peers().await?;
        info!(
            node = %self.this_node.unique_id,
            roster = ?roster.iter().map(|n| n.unique_id.as_str()).collect::<Vec<_>>(),
            "Discovered initial configuration"
        );
        self.initial_configuration = Some(roster);
        Ok(())
    }

    /// Loads persisted state and spawns the node task.
    pub fn start(&mut self) -> Result<()> {
        let Some(initial_configuration) = self.initial_configuration.clone() else {
            return Err(RaftError::NodeNotReady);
        };
        let Some(pending) = self.pending.take() else {
            // Already started.
            return Ok(());
        };
        let node = RaftNode::new(NodeContext {
            this_node: self.this_node.clone(),
            config: self.config.clone(),
            store: pending.store,
            state_machine: pending.state_machine,
            transport: self.transport.clone(),
            initial_configuration,
            pronouncer: pending.pronouncer,
            state_tx: pending.state_tx,
            inbox_rx: pending.inbox_rx,
            shutdown: self.shutdown.clone(),
        })?;
        self.task = Some(tokio::spawn(node.run()));
        info!(node = %self.this_node.unique_id, "Node started");
        Ok(())
    }

    /// Stops the node task and reports how it ended.
    pub async fn stop(&mut self) -> Result<()> {
        self.shutdown.cancel();
        self.join().await
    }

    /// Waits for the node task to end on its own, e.g. after a fatal error.
    pub async fn join(&mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| RaftError::TaskFailed(e.to_string()))?,
            None => Ok(()),
        }
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    pub fn this_node(&self) -> &NodeConfiguration {
        &self.this_node
    }

    pub fn is_initialized(&self) -> bool {
        self.initial_configuration.is_some()
    }

    pub fn is_started(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Cheap, cloneable access to a running node. RPCs from peers and client calls both go through
/// here.
#[derive(Clone, Debug)]
pub struct NodeHandle {
    node: NodeConfiguration,
    inbox_tx: mpsc::Sender<NodeMsg>,
    state_rx: watch::Receiver<StateValue>,
    leader_rx: watch::Receiver<Option<NodeConfiguration>>,
}

impl NodeHandle {
    pub fn node(&self) -> &NodeConfiguration {
        &self.node
    }

    pub fn id(&self) -> &NodeId {
        &self.node.unique_id
    }

    pub fn state(&self) -> StateValue {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every role change.
    pub fn state_changes(&self) -> watch::Receiver<StateValue> {
        self.state_rx.clone()
    }

    /// The leader this node currently recognizes.
    pub fn leader(&self) -> Option<NodeConfiguration> {
        self.leader_rx.borrow().clone()
    }

    pub async fn request_vote(&self, request: RequestVoteRequest) -> Result<RequestVoteResponse> {
        self.call(|tx| NodeMsg::RequestVote { request, tx }).await
    }

    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.call(|tx| NodeMsg::AppendEntries { request, tx }).await
    }

    pub async fn install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.call(|tx| NodeMsg::InstallSnapshot { request, tx }).await
    }

    /// Replicates `command` and returns the state machine's output once it is applied.
    /// Cancelling only abandons the wait; the entry may still commit.
    pub async fn execute_command(
        &self,
        command: Vec<u8>,
        cancel: CancellationToken,
    ) -> Result<Vec<u8>> {
        let rx = self
            .submit(|tx| NodeMsg::ClientCommand { command, tx })
            .await?;
        self.wait(rx, cancel).await
    }

    /// Runs a joint-consensus change to `request.new_configuration`. Resolves once the new
    /// configuration is committed and every added node has caught up.
    pub async fn change_configuration(
        &self,
        request: ConfigurationChangeRequest,
        cancel: CancellationToken,
    ) -> Result<()> {
        let rx = self
            .submit(|tx| NodeMsg::ConfigurationChange { request, tx })
            .await?;
        self.wait(rx, cancel).await
    }

    pub async fn summary(&self) -> Result<RaftNodeSummary> {
        self.call(|tx| NodeMsg::Summary { tx }).await
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            StateValue::None => Err(RaftError::NodeNotReady),
            StateValue::Stopped => Err(RaftError::NodeStopped),
            _ => Ok(()),
        }
    }

    async fn submit<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> NodeMsg) -> Result<oneshot::Receiver<T>> {
        self.ensure_running()?;
        let (tx, rx) = oneshot::channel();
        self.inbox_tx
            .send(build(tx))
            .await
            .map_err(|_| RaftError::NodeStopped)?;
        Ok(rx)
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> NodeMsg) -> Result<T> {
        let rx = self.submit(build).await?;
        rx.await.map_err(|_| RaftError::NodeStopped)
    }

    async fn wait<T>(
        &self,
        rx: impl Future<Output = std::result::Result<Result<T>, oneshot::error::RecvError>>,
        cancel: CancellationToken,
    ) -> Result<T> {
        tokio::select! {
            _ = cancel.cancelled() => Err(RaftError::Cancelled),
            outcome = rx => match outcome {
                Ok(result) => result,
                Err(_) if self.state() == StateValue::Stopped => Err(RaftError::NodeStopped),
                Err(_) => Err(RaftError::LeadershipLost),
            },
        }
    }
}
