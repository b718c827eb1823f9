//! An in-process Raft cluster: nodes talk over a simulated network that can be partitioned,
//! and their storage survives crashes so restarts can be exercised.

use color_eyre::eyre::{eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub mod client;
pub mod discovery;
pub mod kv;
pub mod local_cluster_tester;
pub mod local_node;
pub mod network;

use crate::client::RaftClient;
use crate::discovery::Registrar;
use crate::kv::KvStateMachine;
use crate::local_node::{LocalNode, LocalNodeSummary};
use crate::network::LocalNetwork;
use jointraft_raft::msg::{ConfigurationChangeRequest, NodeConfiguration, NodeId};
use jointraft_raft::{EngineConfig, NodeHandle};

pub fn node_config(slot: usize) -> NodeConfiguration {
    NodeConfiguration::new(format!("node-{slot}"), format!("local://node-{slot}"))
}

pub struct LocalCluster {
    engine: EngineConfig,
    network: LocalNetwork,
    registrar: Arc<Registrar>,
    /// Indexed by slot.
    nodes: Vec<LocalNode>,
}

impl LocalCluster {
    /// Starts `node_count` founding members.
    pub async fn new(node_count: usize, engine: EngineConfig) -> Result<Self> {
        let founders: Vec<NodeConfiguration> = (0..node_count).map(node_config).collect();
        let mut cluster = Self {
            engine,
            network: LocalNetwork::new(),
            registrar: Arc::new(Registrar::new(founders.clone())),
            nodes: Vec::new(),
        };
        for config in founders {
            cluster.spawn(config).await?;
        }
        info!(node_count, "Local cluster up");
        Ok(cluster)
    }

    async fn spawn(&mut self, config: NodeConfiguration) -> Result<usize> {
        let slot = self.nodes.len();
        let mut node = LocalNode::new(
            slot,
            config,
            self.engine.clone(),
            self.network.clone(),
            self.registrar.clone(),
        );
        node.start().await?;
        self.nodes.push(node);
        Ok(slot)
    }

    /// Starts a node outside the configuration. It stays idle until a configuration change
    /// adds it.
    pub async fn add_node(&mut self) -> Result<usize> {
        let slot = self.nodes.len();
        self.spawn(node_config(slot)).await
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn node(&self, slot: usize) -> Result<&LocalNode> {
        self.nodes.get(slot).ok_or_else(|| eyre!("no node in slot {slot}"))
    }

    fn node_mut(&mut self, slot: usize) -> Result<&mut LocalNode> {
        self.nodes
            .get_mut(slot)
            .ok_or_else(|| eyre!("no node in slot {slot}"))
    }

    pub fn id(&self, slot: usize) -> Result<NodeId> {
        Ok(self.node(slot)?.id().clone())
    }

    pub fn handle(&self, slot: usize) -> Result<NodeHandle> {
        self.node(slot)?.handle()
    }

    pub fn kv(&self, slot: usize) -> Result<&KvStateMachine> {
        Ok(self.node(slot)?.kv())
    }

    pub fn connect(&self, slot: usize) -> Result<()> {
        self.network.connect(self.node(slot)?.id());
        Ok(())
    }

    pub fn disconnect(&self, slot: usize) -> Result<()> {
        self.network.disconnect(self.node(slot)?.id());
        Ok(())
    }

    pub async fn crash(&mut self, slot: usize) -> Result<()> {
        self.node_mut(slot)?.kill().await
    }

    pub async fn restart(&mut self, slot: usize) -> Result<()> {
        self.node_mut(slot)?.start().await
    }

    pub async fn summaries(&self) -> Vec<LocalNodeSummary> {
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            nodes.push(node.summary().await);
        }
        nodes
    }

    /// A client that knows every node ever started here.
    pub fn client(&self) -> RaftClient {
        RaftClient::new(
            self.network.clone(),
            self.nodes.iter().map(|n| n.id().clone()).collect(),
            Duration::from_millis(4 * self.engine.election_timeout_max_ms),
            self.engine.no_leader_retry_interval(),
        )
    }

    pub fn change_request(&self, slots: &[usize]) -> Result<ConfigurationChangeRequest> {
        let new_configuration = slots
            .iter()
            .map(|slot| Ok(self.node(*slot)?.config.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(ConfigurationChangeRequest {
            unique_id: format!("change-{slots:?}"),
            new_configuration,
        })
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        for node in &mut self.nodes {
            node.kill().await?;
        }
        info!("Local cluster shut down");
        Ok(())
    }
}
