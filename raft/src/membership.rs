use ahash::{HashSet, HashSetExt};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::cluster::ClusterConfiguration;
use crate::error::{RaftError, Result};
use crate::msg::{ConfigurationChangeRequest, ConfigurationEntry, LogIndex, NodeConfiguration, NodeId};

pub type ChangeResponder = oneshot::Sender<Result<()>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangePhase {
    /// C-old,new appended at `index`, waiting for the joint majority.
    Joint { index: LogIndex },
    /// C-new appended at `index`, waiting for the new majority.
    New { index: LogIndex },
    /// C-new committed; waiting only for added nodes to catch up.
    Committed,
}

#[derive(Debug)]
pub struct MembershipChange {
    pub unique_id: String,
    pub target: Vec<NodeConfiguration>,
    pub phase: ChangePhase,
    /// Leader's last log index when the change was requested.
    pub catch_up_index: LogIndex,
    pub added: Vec<NodeId>,
    responder: Option<ChangeResponder>,
}

/// Drives one joint-consensus change at a time, on the leader.
#[derive(Debug, Default)]
pub struct MembershipChanger {
    in_flight: Option<MembershipChange>,
}

impl MembershipChanger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn validate(
        &self,
        cluster: &ClusterConfiguration,
        request: &ConfigurationChangeRequest,
    ) -> Result<()> {
        if self.in_flight.is_some() || cluster.is_joint() {
            return Err(RaftError::ConfigurationChangeInFlight);
        }
        if request.new_configuration.is_empty() {
            return Err(RaftError::InvalidConfigurationChange(
                "new configuration is empty".to_string(),
            ));
        }
        let mut ids = HashSet::new();
        for node in &request.new_configuration {
            if node.unique_id.is_empty() {
                return Err(RaftError::InvalidConfigurationChange(
                    "node id must not be empty".to_string(),
                ));
            }
            if !ids.insert(node.unique_id.as_str()) {
                return Err(RaftError::InvalidConfigurationChange(format!(
                    "node {} listed twice",
                    node.unique_id
                )));
            }
        }
        let current = cluster.current_configuration();
        if current.len() == ids.len() && current.iter().all(|n| ids.contains(n.unique_id.as_str()))
        {
            return Err(RaftError::InvalidConfigurationChange(
                "new configuration matches the current one".to_string(),
            ));
        }
        Ok(())
    }

    /// Starts a change and returns the joint entry to append. The caller reports the index it
    /// landed at through [`MembershipChanger::joint_appended`].
    pub fn begin(
        &mut self,
        request: ConfigurationChangeRequest,
        cluster: &ClusterConfiguration,
        catch_up_index: LogIndex,
        responder: ChangeResponder,
    ) -> ConfigurationEntry {
        let current = cluster.current_configuration().to_vec();
        let added = newcomers(&current, &request.new_configuration);
        info!(
            change = %request.unique_id,
            added = ?added,
            catch_up_index,
            "Beginning configuration change"
        );
        let entry = ConfigurationEntry::joint(current, request.new_configuration.clone());
        self.in_flight = Some(MembershipChange {
            unique_id: request.unique_id,
            target: request.new_configuration,
            phase: ChangePhase::Joint { index: 0 },
            catch_up_index,
            added,
            responder: Some(responder),
        });
        entry
    }

    pub fn joint_appended(&mut self, index: LogIndex) {
        if let Some(change) = self.in_flight.as_mut() {
            change.phase = ChangePhase::Joint { index };
        }
    }

    /// Called when a joint entry commits on the leader. Returns the C-new entry to append next.
    /// A joint entry committed without a local change (inherited from a previous leader) is
    /// adopted as a change of its own.
    pub fn on_joint_committed(&mut self, entry: &ConfigurationEntry, index: LogIndex) -> ConfigurationEntry {
        let change = self.in_flight.get_or_insert_with(|| {
            let old = entry.old.clone().unwrap_or_default();
            info!(index, "Completing configuration change started by a previous leader");
            MembershipChange {
                unique_id: format!("inherited-{index}"),
                target: entry.new.clone(),
                phase: ChangePhase::Joint { index },
                catch_up_index: index,
                added: newcomers(&old, &entry.new),
                responder: None,
            }
        });
        debug!(change = %change.unique_id, index, "Joint configuration committed");
        ConfigurationEntry::settled(change.target.clone())
    }

    pub fn new_appended(&mut self, index: LogIndex) {
        if let Some(change) = self.in_flight.as_mut() {
            change.phase = ChangePhase::New { index };
        }
    }

    pub fn on_new_committed(&mut self, index: LogIndex) {
        if let Some(change) = self.in_flight.as_mut() {
            if matches!(change.phase, ChangePhase::New { index: i } if i <= index) {
                debug!(change = %change.unique_id, index, "New configuration committed");
                change.phase = ChangePhase::Committed;
            }
        }
    }

    /// Nodes added by the change that have not yet replicated up to the catch-up index.
    pub fn lagging(&self, match_of: impl Fn(&NodeId) -> LogIndex) -> Vec<NodeId> {
        self.in_flight
            .as_ref()
            .map(|change| {
                change
                    .added
                    .iter()
                    .filter(|id| match_of(id) < change.catch_up_index)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Completes the change once C-new is committed and every added node has caught up.
    /// Returns the settled target configuration.
    pub fn try_settle(
        &mut self,
        match_of: impl Fn(&NodeId) -> LogIndex,
    ) -> Option<Vec<NodeConfiguration>> {
        let committed = matches!(
            self.in_flight.as_ref().map(|c| c.phase),
            Some(ChangePhase::Committed)
        );
        if !committed || !self.lagging(match_of).is_empty() {
            return None;
        }
        let mut change = self.in_flight.take()?;
        info!(change = %change.unique_id, "Configuration change settled");
        if let Some(responder) = change.responder.take() {
            // The caller may have given up waiting.
            let _ = responder.send(Ok(()));
        }
        Some(change.target)
    }

    /// Fails the change in flight, if any, without touching the log.
    pub fn abort(&mut self, error: RaftError) {
        if let Some(mut change) = self.in_flight.take() {
            if let Some(responder) = change.responder.take() {
                let _ = responder.send(Err(error));
            }
        }
    }
}

fn newcomers(old: &[NodeConfiguration], new: &[NodeConfiguration]) -> Vec<NodeId> {
    new.iter()
        .filter(|n| !old.iter().any(|o| o.unique_id == n.unique_id))
        .map(|n| n.unique_id.clone())
        .collect()
}
