use color_eyre::eyre::{bail, Result};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use jointraft_raft::msg::{LogIndex, Term};
use jointraft_raft::EngineConfig;

use crate::client::RaftClient;
use crate::kv::{KvCommand, KvStateMachine};
use crate::local_node::LocalNodeSummary;
use crate::LocalCluster;

pub type Nodes = Vec<LocalNodeSummary>;

/// Drives a [`LocalCluster`] for protocol tests. Nodes are addressed by slot.
pub struct LocalClusterRunner {
    cluster: LocalCluster,
    engine: EngineConfig,
}

impl LocalClusterRunner {
    pub async fn new(node_count: usize) -> Result<Self> {
        Self::with_config(node_count, EngineConfig::default()).await
    }

    pub async fn with_config(node_count: usize, engine: EngineConfig) -> Result<Self> {
        let cluster = LocalCluster::new(node_count, engine.clone()).await?;
        Ok(Self { cluster, engine })
    }

    pub fn cluster(&self) -> &LocalCluster {
        &self.cluster
    }

    pub fn client(&self) -> RaftClient {
        self.cluster.client()
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(4 * self.engine.election_timeout_max_ms)
    }

    pub async fn get_cluster_state(&self) -> Nodes {
        self.cluster.summaries().await
    }

    pub async fn sleep(&self, ms: u64) {
        sleep(Duration::from_millis(ms)).await;
    }

    pub fn connect(&self, slot: usize) {
        if let Err(e) = self.cluster.connect(slot) {
            warn!(slot, error = %e, "Failed to connect");
        }
    }

    pub fn disconnect(&self, slot: usize) {
        if let Err(e) = self.cluster.disconnect(slot) {
            warn!(slot, error = %e, "Failed to disconnect");
        }
    }

    pub async fn crash(&mut self, slot: usize) -> Result<()> {
        self.cluster.crash(slot).await
    }

    pub async fn restart(&mut self, slot: usize) -> Result<()> {
        self.cluster.restart(slot).await
    }

    pub async fn add_node(&mut self) -> Result<usize> {
        self.cluster.add_node().await
    }

    /// Replaces the configuration with the nodes in `slots` and waits for the change to settle.
    pub async fn change_membership(&self, slots: &[usize]) -> Result<()> {
        let request = self.cluster.change_request(slots)?;
        self.client().change_configuration(request).await?;
        Ok(())
    }

    // Only one leader at the highest term
    pub async fn check_one_leader(&self) -> Result<LocalNodeSummary> {
        let iterations = 40;
        for _ in 0..iterations {
            self.sleep(100).await;
            let nodes = &self.get_cluster_state().await;
            let highest_leaders = leaders(nodes);
            match highest_leaders.len() {
                1 => return Ok(highest_leaders[0].clone()),
                l if l > 1 => bail!("More than one leader on the same term!"),
                _ => {}
            }
        }
        bail!("No leader elected in time!")
    }

    /// Hands a command to the node in `slot` without waiting for the outcome. The control
    /// plane ignores partitions, so a cut-off leader still accepts it.
    pub fn send_cmd(&self, slot: usize, cmd: KvCommand) {
        let handle = match self.cluster.handle(slot) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(slot, error = %e, "Cannot send command");
                return;
            }
        };
        let bytes = match cmd.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(slot, error = %e, "Cannot encode command");
                return;
            }
        };
        let request_timeout = self.request_timeout();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let outcome = timeout(request_timeout, handle.execute_command(bytes, cancel.clone())).await;
            if outcome.is_err() {
                cancel.cancel();
            }
            debug!(slot, ?outcome, "Fire-and-forget command finished");
        });
    }

    /// Submits `cmd` to the current leader. True once a majority of the configuration has
    /// committed it.
    pub async fn try_to_commit(&self, cmd: KvCommand) -> Result<bool> {
        let leader = self.check_one_leader().await?;
        let Some(raft) = leader.raft.as_ref() else {
            bail!("Leader {} has no summary", leader.id);
        };
        let members = raft.configuration.len();
        let handle = self.cluster.handle(leader.slot)?;

        let cancel = CancellationToken::new();
        match timeout(
            self.request_timeout(),
            handle.execute_command(cmd.encode()?, cancel.clone()),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!(leader = %leader.id, error = %e, "Command not committed");
                return Ok(false);
            }
            Err(_) => {
                cancel.cancel();
                return Ok(false);
            }
        }

        let committed = handle.summary().await?.commit_index;
        for _ in 0..40 {
            if self.n_committed(committed).await > members / 2 {
                return Ok(true);
            }
            self.sleep(50).await;
        }
        Ok(false)
    }

    pub async fn n_committed(&self, commit_index: LogIndex) -> usize {
        self.get_cluster_state()
            .await
            .iter()
            .filter(|n| n.commit_index() >= commit_index)
            .count()
    }

    /// More than half the leader's configuration has committed exactly `n`.
    pub async fn is_highest_committed(&self, n: LogIndex) -> bool {
        let nodes = self.get_cluster_state().await;
        let Some(members) = leaders(&nodes)
            .first()
            .and_then(|l| l.raft.as_ref())
            .map(|r| r.configuration.len())
        else {
            return false;
        };
        nodes.iter().filter(|node| node.commit_index() == n).count() > members / 2
    }

    pub async fn has_no_leader(&self) -> bool {
        leaders(&self.get_cluster_state().await).is_empty()
    }

    pub async fn current_term(&self) -> Term {
        self.get_cluster_state()
            .await
            .iter()
            .map(LocalNodeSummary::term)
            .max()
            .unwrap_or(0)
    }

    pub async fn live_term_agreement(&self) -> bool {
        let nodes = self.get_cluster_state().await;
        let mut terms = nodes.iter().filter(|n| n.is_live()).map(LocalNodeSummary::term);
        match terms.next() {
            Some(term) => terms.all(|t| t == term),
            None => true,
        }
    }

    /// Number of nodes whose store maps `key` to `value`, dead or alive.
    pub fn n_holding(&self, key: &str, value: &str) -> usize {
        self.stores()
            .filter(|kv| kv.get(key).as_deref() == Some(value))
            .count()
    }

    pub fn n_holding_key(&self, key: &str) -> usize {
        self.stores().filter(|kv| kv.get(key).is_some()).count()
    }

    /// Polls until at least `count` nodes hold `key = value`.
    pub async fn wait_holding(&self, key: &str, value: &str, count: usize) -> Result<()> {
        for _ in 0..100 {
            if self.n_holding(key, value) >= count {
                return Ok(());
            }
            self.sleep(50).await;
        }
        bail!(
            "only {} of {count} nodes hold {key}={value}",
            self.n_holding(key, value)
        )
    }

    fn stores(&self) -> impl Iterator<Item = &KvStateMachine> {
        (0..self.cluster.len()).filter_map(|slot| self.cluster.kv(slot).ok())
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.cluster.shutdown().await
    }
}

fn leaders(nodes: &Nodes) -> Vec<LocalNodeSummary> {
    let mut highest_term = 0;
    let mut highest_leaders = Vec::new();
    for node in nodes {
        if !node.is_live() {
            continue;
        }
        if node.term() > highest_term {
            highest_term = node.term();
            highest_leaders.clear();
        }
        if node.term() == highest_term && node.is_leader() {
            highest_leaders.push(node.clone());
        }
    }
    highest_leaders
}
