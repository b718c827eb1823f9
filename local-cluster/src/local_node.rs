use color_eyre::eyre::{eyre, Result};
use std::sync::Arc;
use tracing::{info, warn};

use jointraft_raft::msg::{NodeConfiguration, NodeId, RaftNodeSummary};
use jointraft_raft::{EngineConfig, MemoryStore, Node, NodeHandle};

use crate::discovery::Registrar;
use crate::kv::KvStateMachine;
use crate::network::LocalNetwork;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalNodeSummary {
    /// Position of the node in the cluster, stable across restarts.
    pub slot: usize,
    pub id: NodeId,
    pub is_dead: bool,
    pub is_disconnected: bool,
    /// Absent while the node is dead.
    pub raft: Option<RaftNodeSummary>,
}

impl LocalNodeSummary {
    pub fn is_live(&self) -> bool {
        !self.is_dead && !self.is_disconnected && self.raft.is_some()
    }

    pub fn is_leader(&self) -> bool {
        self.raft.as_ref().is_some_and(|r| r.is_leader())
    }

    pub fn term(&self) -> u64 {
        self.raft.as_ref().map_or(0, |r| r.term)
    }

    pub fn commit_index(&self) -> u64 {
        self.raft.as_ref().map_or(0, |r| r.commit_index)
    }
}

/// Simulates a node on a network but run locally. Its store and state machine outlive crashes,
/// standing in for a disk.
pub struct LocalNode {
    pub slot: usize,
    pub config: NodeConfiguration,
    pub is_dead: bool,
    engine: EngineConfig,
    store: MemoryStore,
    kv: KvStateMachine,
    network: LocalNetwork,
    registrar: Arc<Registrar>,
    node: Option<Node>,
}

impl LocalNode {
    pub fn new(
        slot: usize,
        config: NodeConfiguration,
        engine: EngineConfig,
        network: LocalNetwork,
        registrar: Arc<Registrar>,
    ) -> Self {
        Self {
            slot,
            config,
            is_dead: true,
            engine,
            store: MemoryStore::new(),
            kv: KvStateMachine::new(),
            network,
            registrar,
            node: None,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.config.unique_id
    }

    /// Boots a node from whatever the store holds. Starting a live node is a no-op.
    pub async fn start(&mut self) -> Result<()> {
        if !self.is_dead {
            return Ok(());
        }
        let mut node = Node::new(
            self.config.clone(),
            self.engine.clone(),
            self.store.clone(),
            self.kv.clone(),
            self.network.transport(self.id()),
            self.registrar.clone(),
        );
        node.initialize_configuration().await?;
        node.start()?;
        self.network.attach(self.id(), node.handle());
        self.node = Some(node);
        self.is_dead = false;
        info!(node = %self.config, slot = self.slot, "Local node up");
        Ok(())
    }

    /// Stops the node as if its process died. Persistent state is kept.
    pub async fn kill(&mut self) -> Result<()> {
        self.network.detach(self.id());
        self.is_dead = true;
        if let Some(mut node) = self.node.take() {
            if let Err(e) = node.stop().await {
                warn!(node = %self.config, error = %e, "Node had already failed");
            }
        }
        Ok(())
    }

    pub fn handle(&self) -> Result<NodeHandle> {
        self.node
            .as_ref()
            .map(Node::handle)
            .ok_or_else(|| eyre!("{} is dead", self.id()))
    }

    pub fn kv(&self) -> &KvStateMachine {
        &self.kv
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub async fn summary(&self) -> LocalNodeSummary {
        let raft = match &self.node {
            Some(node) => node.handle().summary().await.ok(),
            None => None,
        };
        LocalNodeSummary {
            slot: self.slot,
            id: self.id().clone(),
            is_dead: self.is_dead,
            is_disconnected: self.network.is_disconnected(self.id()),
            raft,
        }
    }
}
