//! # PulseMQ Core Library
//!
//! This crate provides the cluster-control subsystems of the PulseMQ message
//! broker. It is library code embedded in a host broker service; it spawns no
//! listeners and installs no global state of its own.
//!
//! ## Architecture Overview
//!
//! Two node-local services coordinate with their siblings in a cluster:
//!
//! - [`feature_flags`] - Cluster-wide capability gating. Each node advertises
//!   the feature flags it *supports* (compiled into its applications) and
//!   persists the set it has *enabled*. Enabling a flag is a cluster-wide
//!   transition: every running peer must support it, dependency flags are
//!   pulled in first, an associated migration runs exactly once per node, and
//!   the enabled-state is propagated to every running peer.
//! - [`memory`] - A per-node memory-pressure feedback controller. Registered
//!   queues report how long they expect their backlog to last; the controller
//!   derives a target duration from the node's memory usage ratio and pushes
//!   it back to queues that need to shed.
//!
//! External collaborators are reached only through narrow trait seams:
//! cluster membership ([`MembershipOracle`]), the peer invocation transport
//! ([`PeerRpc`]), the application registry ([`AppCatalog`]), and the VM
//! memory oracle ([`MemoryOracle`]). Hosts plug in their own implementations;
//! in-memory implementations ship for single-process hosts and tests.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pulsemq::{
//!     FeatureFlagConfig, FeatureFlagController, InMemoryClusterRpc, StaticCatalog,
//!     StaticMembership,
//! };
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let rpc = InMemoryClusterRpc::new();
//! let controller = Arc::new(FeatureFlagController::new(
//!     1,
//!     FeatureFlagConfig::default(),
//!     Arc::new(StaticCatalog::new()),
//!     Arc::new(StaticMembership::single_node()),
//!     rpc.clone(),
//! ));
//! rpc.register_node(1, &controller);
//! controller.init().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod feature_flags;
pub mod memory;

pub use config::{FeatureFlagConfig, MemoryMonitorConfig};
pub use feature_flags::catalog::{AppCatalog, AppId, FlagDeclaration, FlagProvider, StaticCatalog};
pub use feature_flags::membership::{ClusterView, MembershipOracle, StaticMembership};
pub use feature_flags::registry::{FlagRegistry, RegistrySnapshot};
pub use feature_flags::rpc::{InMemoryClusterRpc, PeerReply, PeerRequest, PeerRpc, RpcError};
pub use feature_flags::store::{EnabledStore, StoreError};
pub use feature_flags::{
    FeatureFlagController, FeatureFlagError, FlagDef, FlagDescriptor, FlagEvent, FlagFilter,
    FlagName, MigrationHook, NodeId, Stability,
};
pub use memory::oracle::{FixedMemoryOracle, MemoryOracle, ProcMemoryOracle};
pub use memory::{MemoryMonitor, PushbackFn, QueueId};

use thiserror::Error;

/// PulseMQ error types
///
/// Host-facing failures surfaced by this crate. Feature-flag operations carry
/// their own domain taxonomy in [`FeatureFlagError`]; the memory monitor has
/// no domain taxonomy of its own, so only its lifecycle failures appear here.
#[derive(Debug, Error)]
pub enum PulsemqError {
    /// Configuration validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Feature-flag coordination errors
    #[error("Feature flag error: {0}")]
    FeatureFlag(#[from] FeatureFlagError),

    /// Memory monitor lifecycle errors
    #[error("Memory monitor error: {0}")]
    Monitor(String),
}

/// Result type alias for PulseMQ operations
pub type Result<T> = std::result::Result<T, PulsemqError>;
