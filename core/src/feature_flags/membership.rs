//! Cluster-membership oracle

use super::NodeId;
use parking_lot::RwLock;

/// The peers of this node, self excluded
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    /// Every configured peer, running or not
    pub all: Vec<NodeId>,
    /// The peers currently running
    pub running: Vec<NodeId>,
}

/// Authoritative source of cluster membership
pub trait MembershipOracle: Send + Sync {
    fn members(&self) -> ClusterView;
}

/// Fixed membership view for single-process hosts and tests
#[derive(Debug, Default)]
pub struct StaticMembership {
    view: RwLock<ClusterView>,
}

impl StaticMembership {
    pub fn new(all: Vec<NodeId>, running: Vec<NodeId>) -> Self {
        Self {
            view: RwLock::new(ClusterView { all, running }),
        }
    }

    /// A view with no peers at all
    pub fn single_node() -> Self {
        Self::default()
    }

    pub fn set_running(&self, running: Vec<NodeId>) {
        self.view.write().running = running;
    }
}

impl MembershipOracle for StaticMembership {
    fn members(&self) -> ClusterView {
        self.view.read().clone()
    }
}
