use tokio::sync::watch;

use crate::msg::NodeConfiguration;

/// Tracks which node is currently recognized as leader.
///
/// Written only by the role state machine; readers hold a `watch::Receiver` so they never need a
/// round-trip through the node task.
#[derive(Debug)]
pub struct LeaderPronouncer {
    tx: watch::Sender<Option<NodeConfiguration>>,
}

impl LeaderPronouncer {
    pub fn new() -> (Self, watch::Receiver<Option<NodeConfiguration>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }

    pub fn recognize(&self, leader: NodeConfiguration) {
        self.tx.send_if_modified(|current| {
            if current.as_ref() == Some(&leader) {
                return false;
            }
            *current = Some(leader);
            true
        });
    }

    pub fn forget(&self) {
        self.tx.send_if_modified(|current| current.take().is_some());
    }

    pub fn leader(&self) -> Option<NodeConfiguration> {
        self.tx.borrow().clone()
    }
}
