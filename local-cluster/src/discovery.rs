use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use jointraft_raft::msg::NodeConfiguration;
use jointraft_raft::{Discovery, DiscoveryError};

/// In-memory registry. Every node discovers the founding roster; nodes that enroll later are
/// recorded but must be added through a configuration change.
#[derive(Debug)]
pub struct Registrar {
    founders: Vec<NodeConfiguration>,
    enrolled: Mutex<Vec<NodeConfiguration>>,
}

impl Registrar {
    pub fn new(founders: Vec<NodeConfiguration>) -> Self {
        Self {
            founders,
            enrolled: Mutex::new(Vec::new()),
        }
    }

    pub fn founders(&self) -> &[NodeConfiguration] {
        &self.founders
    }

    pub fn enrolled(&self) -> Vec<NodeConfiguration> {
        self.enrolled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Discovery for Registrar {
    async fn enroll(&self, this_node: &NodeConfiguration) -> Result<(), DiscoveryError> {
        if this_node.unique_id.is_empty() {
            return Err(DiscoveryError("cannot enroll a node without an id".to_string()));
        }
        let mut enrolled = self.enrolled.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = enrolled.iter().find(|n| n.unique_id == this_node.unique_id) {
            if existing.address != this_node.address {
                return Err(DiscoveryError(format!(
                    "{} already enrolled at {}",
                    existing.unique_id, existing.address
                )));
            }
            return Ok(());
        }
        debug!(node = %this_node, "Enrolled");
        enrolled.push(this_node.clone());
        Ok(())
    }

    async fn discover_peers(&self) -> Result<Vec<NodeConfiguration>, DiscoveryError> {
        if self.founders.is_empty() {
            return Err(DiscoveryError("no founding members registered".to_string()));
        }
        Ok(self.founders.clone())
    }
}
