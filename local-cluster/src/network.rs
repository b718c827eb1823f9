use ahash::{HashMap, HashMapExt};
use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::trace;

use jointraft_raft::msg::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    NodeConfiguration, NodeId, RequestVoteRequest, RequestVoteResponse,
};
use jointraft_raft::{NodeHandle, RaftError, Transport, TransportError};

#[derive(Debug, Default)]
struct Endpoint {
    /// Absent while the node is dead.
    handle: Option<NodeHandle>,
    is_disconnected: bool,
}

/// Simulates a network between nodes running in the same process. A disconnected node neither
/// sends nor receives; replies are dropped if either side disconnects mid-call.
#[derive(Clone, Debug, Default)]
pub struct LocalNetwork {
    endpoints: Arc<RwLock<HashMap<NodeId, Endpoint>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self {
            endpoints: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<NodeId, Endpoint>> {
        self.endpoints.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<NodeId, Endpoint>> {
        self.endpoints.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes a started node reachable. Connectivity survives restarts.
    pub fn attach(&self, id: &NodeId, handle: NodeHandle) {
        self.write().entry(id.clone()).or_default().handle = Some(handle);
    }

    pub fn detach(&self, id: &NodeId) {
        if let Some(endpoint) = self.write().get_mut(id) {
            endpoint.handle = None;
        }
    }

    pub fn connect(&self, id: &NodeId) {
        self.write().entry(id.clone()).or_default().is_disconnected = false;
    }

    pub fn disconnect(&self, id: &NodeId) {
        self.write().entry(id.clone()).or_default().is_disconnected = true;
    }

    pub fn is_disconnected(&self, id: &NodeId) -> bool {
        self.read().get(id).is_some_and(|e| e.is_disconnected)
    }

    pub fn transport(&self, from: &NodeId) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            from: from.clone(),
            network: self.clone(),
        })
    }

    /// The handle of a live node, regardless of connectivity. Clients sit outside the
    /// simulated network.
    pub fn handle(&self, id: &NodeId) -> Option<NodeHandle> {
        self.read().get(id).and_then(|e| e.handle.clone())
    }

    fn route(&self, from: &NodeId, to: &NodeId) -> Result<NodeHandle, TransportError> {
        let endpoints = self.read();
        if endpoints.get(from).is_some_and(|e| e.is_disconnected) {
            return Err(TransportError::Unreachable(to.clone()));
        }
        match endpoints.get(to) {
            Some(Endpoint {
                handle: Some(handle),
                is_disconnected: false,
            }) => Ok(handle.clone()),
            _ => Err(TransportError::Unreachable(to.clone())),
        }
    }

    fn still_linked(&self, from: &NodeId, to: &NodeId) -> bool {
        let endpoints = self.read();
        let up = |id: &NodeId| {
            endpoints
                .get(id)
                .is_some_and(|e| e.handle.is_some() && !e.is_disconnected)
        };
        up(from) && up(to)
    }
}

/// One node's view of the [`LocalNetwork`].
#[derive(Debug)]
pub struct LocalTransport {
    from: NodeId,
    network: LocalNetwork,
}

impl LocalTransport {
    fn deliver<T>(
        &self,
        to: &NodeId,
        outcome: Result<T, RaftError>,
    ) -> Result<T, TransportError> {
        if !self.network.still_linked(&self.from, to) {
            trace!(from = %self.from, to = %to, "Dropping reply across partition");
            return Err(TransportError::Unreachable(to.clone()));
        }
        outcome.map_err(|e| match e {
            RaftError::NodeStopped | RaftError::NodeNotReady => {
                TransportError::Unreachable(to.clone())
            }
            e => TransportError::Remote(e.to_string()),
        })
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request_vote(
        &self,
        peer: &NodeConfiguration,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError> {
        let handle = self.network.route(&self.from, &peer.unique_id)?;
        let outcome = handle.request_vote(request).await;
        self.deliver(&peer.unique_id, outcome)
    }

    async fn append_entries(
        &self,
        peer: &NodeConfiguration,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        let handle = self.network.route(&self.from, &peer.unique_id)?;
        let outcome = handle.append_entries(request).await;
        self.deliver(&peer.unique_id, outcome)
    }

    async fn install_snapshot(
        &self,
        peer: &NodeConfiguration,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, TransportError> {
        let handle = self.network.route(&self.from, &peer.unique_id)?;
        let outcome = handle.install_snapshot(request).await;
        self.deliver(&peer.unique_id, outcome)
    }
}
