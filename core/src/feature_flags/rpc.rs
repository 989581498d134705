//! Peer invocation transport
//!
//! The coordinator never talks to a socket directly; it invokes named
//! operations on remote peers through [`PeerRpc`] and serves the same
//! operations for its own node via
//! [`FeatureFlagController::handle_peer_request`]. Hosts bind this trait to
//! their inter-broker transport; [`InMemoryClusterRpc`] binds it to direct
//! dispatch for single-process clusters and tests.

use super::{FeatureFlagController, FlagDescriptor, FlagFilter, FlagName, NodeId};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;

/// Operations invokable on a remote peer's coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerRequest {
    ListFlags(FlagFilter),
    AreSupportedLocally(Vec<FlagName>),
    MarkAsEnabledLocally(FlagName),
}

/// Normal replies to [`PeerRequest`]s
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerReply {
    Flags(BTreeMap<FlagName, FlagDescriptor>),
    Supported(bool),
    Ack,
}

/// Transport-error sentinels
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RpcError {
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),

    #[error("request to node {0} timed out")]
    Timeout(NodeId),

    /// The peer was reached but its coordinator failed the operation
    #[error("node {0} failed the request: {1}")]
    Remote(NodeId, String),

    #[error("node {0} returned an unexpected reply")]
    BadReply(NodeId),
}

/// Invoke a named operation on a remote peer within a timeout
///
/// `timeout` of `None` means unbounded. Implementations must map an elapsed
/// timeout to [`RpcError::Timeout`] rather than blocking the caller forever.
#[async_trait]
pub trait PeerRpc: Send + Sync {
    async fn invoke(
        &self,
        peer: NodeId,
        request: PeerRequest,
        timeout: Option<Duration>,
    ) -> Result<PeerReply, RpcError>;
}

/// Loopback transport dispatching directly to coordinators in this process
///
/// Nodes are held by weak reference, so dropping a controller makes its node
/// unreachable rather than keeping it alive through the transport. Peers can
/// also be forced unreachable to exercise failure paths.
#[derive(Default)]
pub struct InMemoryClusterRpc {
    nodes: RwLock<HashMap<NodeId, Weak<FeatureFlagController>>>,
    down: RwLock<HashSet<NodeId>>,
}

impl InMemoryClusterRpc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_node(&self, node: NodeId, controller: &Arc<FeatureFlagController>) {
        self.nodes.write().insert(node, Arc::downgrade(controller));
    }

    /// Force a node to appear unreachable
    pub fn set_node_down(&self, node: NodeId, down: bool) {
        if down {
            self.down.write().insert(node);
        } else {
            self.down.write().remove(&node);
        }
    }

    fn target(&self, peer: NodeId) -> Result<Arc<FeatureFlagController>, RpcError> {
        if self.down.read().contains(&peer) {
            return Err(RpcError::Unreachable(peer));
        }
        self.nodes
            .read()
            .get(&peer)
            .and_then(Weak::upgrade)
            .ok_or(RpcError::Unreachable(peer))
    }
}

#[async_trait]
impl PeerRpc for InMemoryClusterRpc {
    async fn invoke(
        &self,
        peer: NodeId,
        request: PeerRequest,
        timeout: Option<Duration>,
    ) -> Result<PeerReply, RpcError> {
        let controller = self.target(peer)?;
        let call = controller.handle_peer_request(request);
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| RpcError::Timeout(peer))?,
            None => call.await,
        };
        outcome.map_err(|err| RpcError::Remote(peer, err.to_string()))
    }
}
