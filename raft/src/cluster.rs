use ahash::{HashSet, HashSetExt};

use crate::msg::{ConfigurationEntry, LogIndex, NodeConfiguration, NodeId};

/// Votes needed among `member_count` voters.
pub fn quorum_size(member_count: usize) -> usize {
    member_count / 2 + 1
}

/// In-memory roster of this node and its peers.
///
/// During a membership change the roster holds both the old and the new member sets, and every
/// majority decision has to be reached in each set independently.
#[derive(Clone, Debug)]
pub struct ClusterConfiguration {
    this_node: NodeConfiguration,
    current: Vec<NodeConfiguration>,
    joint_new: Option<Vec<NodeConfiguration>>,
}

impl ClusterConfiguration {
    pub fn new(this_node: NodeConfiguration, members: Vec<NodeConfiguration>) -> Self {
        Self {
            this_node,
            current: dedup(members),
            joint_new: None,
        }
    }

    pub fn this_node(&self) -> &NodeConfiguration {
        &self.this_node
    }

    pub fn current_configuration(&self) -> &[NodeConfiguration] {
        &self.current
    }

    pub fn joint_configuration(&self) -> Option<&[NodeConfiguration]> {
        self.joint_new.as_deref()
    }

    pub fn is_joint(&self) -> bool {
        self.joint_new.is_some()
    }

    /// The configuration entry that reproduces this roster.
    pub fn as_entry(&self) -> ConfigurationEntry {
        match &self.joint_new {
            Some(new) => ConfigurationEntry::joint(self.current.clone(), new.clone()),
            None => ConfigurationEntry::settled(self.current.clone()),
        }
    }

    pub fn is_this_node_part_of_cluster(&self) -> bool {
        self.contains(&self.this_node.unique_id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sets().any(|set| set.iter().any(|n| n.unique_id == id))
    }

    /// Everyone but this node, across both sets when joint.
    pub fn peers(&self) -> Vec<NodeConfiguration> {
        let mut seen = HashSet::new();
        let mut peers = Vec::new();
        for node in self.joint_new.iter().flatten().chain(self.current.iter()) {
            if node.unique_id == self.this_node.unique_id {
                continue;
            }
            if seen.insert(node.unique_id.clone()) {
                peers.push(node.clone());
            }
        }
        peers
    }

    pub fn peer(&self, id: &str) -> Option<&NodeConfiguration> {
        self.joint_new
            .iter()
            .flatten()
            .chain(self.current.iter())
            .find(|n| n.unique_id == id)
    }

    pub fn update_configuration(&mut self, entry: &ConfigurationEntry) {
        match &entry.old {
            Some(old) => {
                self.current = dedup(old.clone());
                self.joint_new = Some(dedup(entry.new.clone()));
            }
            None => {
                self.current = dedup(entry.new.clone());
                self.joint_new = None;
            }
        }
    }

    /// True once `granted` holds for a majority of every active member set.
    pub fn is_quorum(&self, granted: impl Fn(&NodeId) -> bool) -> bool {
        self.sets().all(|set| {
            let votes = set.iter().filter(|n| granted(&n.unique_id)).count();
            votes >= quorum_size(set.len())
        })
    }

    /// Highest index replicated on a majority of every active member set.
    pub fn majority_index(&self, matched: impl Fn(&NodeId) -> LogIndex) -> LogIndex {
        self.sets()
            .map(|set| {
                let mut indexes: Vec<LogIndex> =
                    set.iter().map(|n| matched(&n.unique_id)).collect();
                indexes.sort_unstable_by(|a, b| b.cmp(a));
                indexes
                    .get(quorum_size(set.len()).saturating_sub(1))
                    .copied()
                    .unwrap_or(0)
            })
            .min()
            .unwrap_or(0)
    }

    pub fn member_ids(&self) -> Vec<NodeId> {
        self.current.iter().map(|n| n.unique_id.clone()).collect()
    }

    pub fn joint_member_ids(&self) -> Option<Vec<NodeId>> {
        self.joint_new
            .as_ref()
            .map(|set| set.iter().map(|n| n.unique_id.clone()).collect())
    }

    fn sets(&self) -> impl Iterator<Item = &Vec<NodeConfiguration>> {
        std::iter::once(&self.current).chain(self.joint_new.iter())
    }
}

fn dedup(nodes: Vec<NodeConfiguration>) -> Vec<NodeConfiguration> {
    let mut seen = HashSet::new();
    nodes
        .into_iter()
        .filter(|n| seen.insert(n.unique_id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[&str]) -> Vec<NodeConfiguration> {
        ids.iter()
            .map(|id| NodeConfiguration::new(*id, format!("local://{id}")))
            .collect()
    }

    fn cluster(this: &str, ids: &[&str]) -> ClusterConfiguration {
        ClusterConfiguration::new(NodeConfiguration::new(this, ""), nodes(ids))
    }

    #[test]
    fn quorum_sizes() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(2), 2);
        assert_eq!(quorum_size(3), 2);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(5), 3);
        assert_eq!(quorum_size(7), 4);
    }

    #[test]
    fn peers_exclude_this_node() {
        let c = cluster("a", &["a", "b", "c"]);
        let peers: Vec<_> = c.peers().into_iter().map(|n| n.unique_id).collect();
        assert_eq!(peers.len(), 2);
        assert!(!peers.contains(&"a".to_string()));
        assert!(c.is_this_node_part_of_cluster());
    }

    #[test]
    fn node_outside_roster_is_not_part_of_cluster() {
        let c = cluster("z", &["a", "b", "c"]);
        assert!(!c.is_this_node_part_of_cluster());
        assert_eq!(c.peers().len(), 3);
    }

    #[test]
    fn simple_majority() {
        let c = cluster("a", &["a", "b", "c"]);
        assert!(c.is_quorum(|id| id == "a" || id == "b"));
        assert!(!c.is_quorum(|id| id == "a"));
    }

    #[test]
    fn joint_quorum_needs_both_sets() {
        let mut c = cluster("a", &["a", "b", "c"]);
        c.update_configuration(&ConfigurationEntry::joint(
            nodes(&["a", "b", "c"]),
            nodes(&["c", "d", "e"]),
        ));
        assert!(c.is_joint());
        // Majority of old only.
        assert!(!c.is_quorum(|id| id == "a" || id == "b"));
        // Majority of new only.
        assert!(!c.is_quorum(|id| id == "d" || id == "e"));
        // Both.
        assert!(c.is_quorum(|id| ["a", "c", "d"].contains(&id.as_str())));
        assert_eq!(c.peers().len(), 4);
    }

    #[test]
    fn settled_entry_replaces_joint_roster() {
        let mut c = cluster("a", &["a", "b"]);
        c.update_configuration(&ConfigurationEntry::joint(nodes(&["a", "b"]), nodes(&["b", "c"])));
        c.update_configuration(&ConfigurationEntry::settled(nodes(&["b", "c"])));
        assert!(!c.is_joint());
        assert!(!c.is_this_node_part_of_cluster());
        assert_eq!(c.member_ids(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn majority_index_takes_median_of_set() {
        let c = cluster("a", &["a", "b", "c"]);
        let idx = c.majority_index(|id| match id.as_str() {
            "a" => 7,
            "b" => 5,
            _ => 2,
        });
        assert_eq!(idx, 5);
    }

    #[test]
    fn majority_index_is_minimum_across_joint_sets() {
        let mut c = cluster("a", &["a", "b", "c"]);
        c.update_configuration(&ConfigurationEntry::joint(
            nodes(&["a", "b", "c"]),
            nodes(&["a", "d", "e"]),
        ));
        let idx = c.majority_index(|id| match id.as_str() {
            "a" | "b" | "c" => 9,
            "d" => 4,
            _ => 0,
        });
        assert_eq!(idx, 4);
    }
}
