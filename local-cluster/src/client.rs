use color_eyre::eyre::Result;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use jointraft_raft::msg::{ConfigurationChangeRequest, NodeConfiguration, NodeId};
use jointraft_raft::{NodeHandle, RaftError};

use crate::kv::{decode_output, KvCommand, KvOutput};
use crate::network::LocalNetwork;

const MAX_ATTEMPTS: usize = 30;

/// Finds the leader by following `NotLeader` hints. A request whose outcome is unknown is sent
/// again, so commands may be applied more than once.
#[derive(Clone, Debug)]
pub struct RaftClient {
    network: LocalNetwork,
    members: Vec<NodeId>,
    leader: Arc<Mutex<Option<NodeId>>>,
    request_timeout: Duration,
    no_leader_retry_interval: Duration,
}

impl RaftClient {
    pub fn new(
        network: LocalNetwork,
        members: Vec<NodeId>,
        request_timeout: Duration,
        no_leader_retry_interval: Duration,
    ) -> Self {
        Self {
            network,
            members,
            leader: Arc::new(Mutex::new(None)),
            request_timeout,
            no_leader_retry_interval,
        }
    }

    pub fn set_members(&mut self, members: Vec<NodeId>) {
        self.members = members;
    }

    pub fn known_leader(&self) -> Option<NodeId> {
        self.leader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn remember(&self, leader: Option<NodeId>) {
        *self.leader.lock().unwrap_or_else(PoisonError::into_inner) = leader;
    }

    pub async fn execute(&self, command: Vec<u8>) -> Result<Vec<u8>, RaftError> {
        self.redirect(|handle, cancel| {
            let command = command.clone();
            async move { handle.execute_command(command, cancel).await }
        })
        .await
    }

    pub async fn change_configuration(
        &self,
        request: ConfigurationChangeRequest,
    ) -> Result<(), RaftError> {
        self.redirect(|handle, cancel| {
            let request = request.clone();
            async move { handle.change_configuration(request, cancel).await }
        })
        .await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<KvOutput> {
        self.kv(KvCommand::set(key, value)).await
    }

    pub async fn get(&self, key: &str) -> Result<KvOutput> {
        self.kv(KvCommand::get(key)).await
    }

    pub async fn delete(&self, key: &str) -> Result<KvOutput> {
        self.kv(KvCommand::delete(key)).await
    }

    async fn kv(&self, command: KvCommand) -> Result<KvOutput> {
        let output = self.execute(command.encode()?).await?;
        Ok(decode_output(&output)?)
    }

    async fn redirect<T, F, Fut>(&self, call: F) -> Result<T, RaftError>
    where
        F: Fn(NodeHandle, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, RaftError>>,
    {
        let mut target = self.known_leader();
        let mut rotation = 0;
        let mut last_error = RaftError::NotLeader { leader_hint: None };
        for _ in 0..MAX_ATTEMPTS {
            let id = match target.take() {
                Some(id) => id,
                None => {
                    if self.members.is_empty() {
                        break;
                    }
                    rotation += 1;
                    self.members[rotation % self.members.len()].clone()
                }
            };
            let Some(handle) = self.network.handle(&id) else {
                debug!(node = %id, "Node unreachable, trying another");
                continue;
            };

            let cancel = CancellationToken::new();
            let outcome = match timeout(self.request_timeout, call(handle, cancel.clone())).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    cancel.cancel();
                    Err(RaftError::Cancelled)
                }
            };
            match outcome {
                Ok(value) => {
                    self.remember(Some(id));
                    return Ok(value);
                }
                Err(RaftError::NotLeader {
                    leader_hint: Some(NodeConfiguration { unique_id, .. }),
                }) if unique_id != id => {
                    debug!(from = %id, to = %unique_id, "Redirected");
                    target = Some(unique_id);
                }
                Err(
                    e @ (RaftError::NotLeader { .. }
                    | RaftError::LeadershipLost
                    | RaftError::Cancelled),
                ) => {
                    debug!(node = %id, error = %e, "No usable leader, retrying");
                    self.remember(None);
                    last_error = e;
                    sleep(self.no_leader_retry_interval).await;
                }
                Err(
                    e @ (RaftError::Decommissioned
                    | RaftError::NodeStopped
                    | RaftError::NodeNotReady),
                ) => {
                    self.remember(None);
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }
}
