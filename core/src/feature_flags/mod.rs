//! Cluster-wide feature-flag coordination
//!
//! Each node *supports* the feature flags declared by its loaded applications
//! and persists the subset it has *enabled*. Supported-ness is a property of
//! the running code; enabled-ness is a cluster-wide agreement. Enabling a
//! flag requires that every running peer also supports it, pulls in the
//! flag's dependencies first, executes the flag's migration hook on this
//! node, persists and republishes the local registry, and finally marks the
//! flag enabled on every running peer.
//!
//! The enable transition is deliberately not transactional: a peer failure
//! during propagation leaves the cluster partially enabled, which is
//! surfaced to the caller. Recovery is manual. Nothing in this module retries
//! transparently.

pub mod catalog;
pub mod membership;
pub mod registry;
pub mod rpc;
pub mod store;

#[cfg(test)]
mod tests;

use crate::config::FeatureFlagConfig;
use catalog::AppCatalog;
use futures::future::{BoxFuture, FutureExt};
use membership::MembershipOracle;
use registry::{FlagRegistry, RegistrySnapshot};
use rpc::{PeerReply, PeerRequest, PeerRpc, RpcError};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use store::{EnabledStore, StoreError};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Unique identifier for cluster nodes
pub type NodeId = u32;

/// Short symbolic feature-flag identifier, unique across the cluster
pub type FlagName = String;

/// Event passed to a flag's migration hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagEvent {
    Enable,
}

/// Informational stability label of a flag
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stability {
    #[default]
    Stable,
    Experimental,
}

/// Migration callback tied to a flag, executed once per node per enable
/// event. A non-ok return aborts the enable with the returned reason; a
/// panic is caught and surfaced as [`FeatureFlagError::MigrationCrash`].
pub type MigrationHook = Arc<dyn Fn(FlagEvent) -> Result<(), String> + Send + Sync>;

/// Properties of a declared feature flag
#[derive(Clone)]
pub struct FlagDef {
    pub description: String,
    /// Flags that must be enabled before this one, in declared order
    pub depends_on: Vec<FlagName>,
    pub migration: Option<MigrationHook>,
    pub stability: Stability,
}

impl FlagDef {
    pub fn new(description: &str) -> Self {
        Self {
            description: description.to_string(),
            depends_on: Vec::new(),
            migration: None,
            stability: Stability::default(),
        }
    }

    pub fn with_depends_on(mut self, depends_on: &[&str]) -> Self {
        self.depends_on = depends_on.iter().map(|name| name.to_string()).collect();
        self
    }

    pub fn with_migration<F>(mut self, hook: F) -> Self
    where
        F: Fn(FlagEvent) -> Result<(), String> + Send + Sync + 'static,
    {
        self.migration = Some(Arc::new(hook));
        self
    }

    pub fn with_stability(mut self, stability: Stability) -> Self {
        self.stability = stability;
        self
    }

    /// Wire-safe projection of this flag, everything but the migration hook
    pub fn descriptor(&self) -> FlagDescriptor {
        FlagDescriptor {
            description: self.description.clone(),
            depends_on: self.depends_on.clone(),
            has_migration: self.migration.is_some(),
            stability: self.stability,
        }
    }
}

impl fmt::Debug for FlagDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlagDef")
            .field("description", &self.description)
            .field("depends_on", &self.depends_on)
            .field("migration", &self.migration.is_some())
            .field("stability", &self.stability)
            .finish()
    }
}

/// Serializable flag metadata used in list results and peer replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagDescriptor {
    pub description: String,
    pub depends_on: Vec<FlagName>,
    pub has_migration: bool,
    pub stability: Stability,
}

/// Filter for listing feature flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagFilter {
    All,
    Enabled,
    Disabled,
}

/// Feature-flag coordination errors
#[derive(Debug, Error)]
pub enum FeatureFlagError {
    /// At least one node in the cluster does not support the flag, or the
    /// operation itself is unsupported (flag disable)
    #[error("feature flag is not supported by every running node")]
    Unsupported,

    /// The flag's migration hook returned an error value, surfaced unchanged
    #[error("migration failed: {reason}")]
    MigrationFailed { reason: String },

    /// The flag's migration hook panicked
    #[error("migration crashed: {reason}")]
    MigrationCrash { reason: String },

    /// The two-sided node compatibility check failed
    #[error("local and remote feature flags are incompatible")]
    IncompatibleFeatureFlags,

    /// Peer transport failure during enable propagation, surfaced verbatim
    #[error("peer rpc failed: {0}")]
    Rpc(#[from] RpcError),

    /// Enabled-flag record could not be read or written
    #[error("enabled-flag store: {0}")]
    Store(#[from] StoreError),
}

/// Node-local coordinator for cluster-wide feature flags
///
/// One instance per node. All reads go through the published registry
/// snapshot and are lock-free; enables are serialised node-locally so that
/// two concurrent enables cannot interleave their registry rebuilds.
pub struct FeatureFlagController {
    node_id: NodeId,
    config: FeatureFlagConfig,
    registry: FlagRegistry,
    store: EnabledStore,
    catalog: Arc<dyn AppCatalog>,
    membership: Arc<dyn MembershipOracle>,
    rpc: Arc<dyn PeerRpc>,
    enable_lock: Mutex<()>,
}

impl FeatureFlagController {
    pub fn new(
        node_id: NodeId,
        config: FeatureFlagConfig,
        catalog: Arc<dyn AppCatalog>,
        membership: Arc<dyn MembershipOracle>,
        rpc: Arc<dyn PeerRpc>,
    ) -> Self {
        let store = EnabledStore::new(config.enabled_file.clone());
        Self {
            node_id,
            config,
            registry: FlagRegistry::new(),
            store,
            catalog,
            membership,
            rpc,
            enable_lock: Mutex::new(()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Build and publish the first registry snapshot
    pub async fn init(&self) -> Result<(), FeatureFlagError> {
        info!("Initializing feature flags on node {}", self.node_id);
        self.rebuild_registry().await
    }

    /// List feature flags matching the filter
    pub fn list(&self, filter: FlagFilter) -> BTreeMap<FlagName, FlagDescriptor> {
        self.registry.list(filter)
    }

    /// Whether the flag is supported locally and on every running peer
    pub async fn is_supported(&self, name: &str) -> bool {
        let names = [name.to_string()];
        self.are_supported(&names).await
    }

    /// Whether every named flag is supported locally and on every running
    /// peer
    pub async fn are_supported(&self, names: &[FlagName]) -> bool {
        self.are_supported_locally(names)
            && self
                .is_supported_remotely(names, self.config.rpc_timeout())
                .await
    }

    /// Whether every named flag is supported by this node alone
    pub fn are_supported_locally(&self, names: &[FlagName]) -> bool {
        let snapshot = self.registry.snapshot();
        names.iter().all(|name| snapshot.is_supported(name))
    }

    /// Whether the flag is enabled per the local registry
    pub fn is_enabled(&self, name: &str) -> bool {
        self.registry.is_enabled(name)
    }

    /// Enable a feature flag cluster-wide
    ///
    /// On success every running peer has the flag in its enabled set and the
    /// local registry reflects it. Dependencies are enabled first, in
    /// declared order. The flag's migration hook runs on this node before
    /// anything is persisted. A peer failure during the final propagation is
    /// fatal and surfaced verbatim; the flag stays enabled on the nodes that
    /// were already reached.
    pub async fn enable(&self, name: &str) -> Result<(), FeatureFlagError> {
        let _guard = self.enable_lock.lock().await;
        self.enable_unlocked(name).await
    }

    /// Disabling an enabled flag is not supported
    pub fn disable(&self, _name: &str) -> Result<(), FeatureFlagError> {
        Err(FeatureFlagError::Unsupported)
    }

    fn enable_unlocked<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), FeatureFlagError>> {
        async move {
            if self.is_enabled(name) {
                return Ok(());
            }

            let names = [name.to_string()];
            if !self.are_supported_locally(&names) {
                return Err(FeatureFlagError::Unsupported);
            }
            if !self
                .is_supported_remotely(&names, self.config.rpc_timeout())
                .await
            {
                return Err(FeatureFlagError::Unsupported);
            }

            info!("Enabling feature flag `{}` on node {}", name, self.node_id);

            let def = match self.registry.snapshot().flag(name) {
                Some(def) => def.clone(),
                None => return Err(FeatureFlagError::Unsupported),
            };

            for dependency in &def.depends_on {
                debug!(
                    "Feature flag `{}` depends on `{}`, enabling it first",
                    name, dependency
                );
                self.enable_unlocked(dependency).await?;
            }

            self.run_migration(name, &def)?;
            self.mark_as_enabled_locally(name).await?;
            self.mark_as_enabled_remotely(name).await?;

            info!("Feature flag `{}` enabled", name);
            Ok(())
        }
        .boxed()
    }

    fn run_migration(&self, name: &str, def: &FlagDef) -> Result<(), FeatureFlagError> {
        let Some(hook) = def.migration.clone() else {
            return Ok(());
        };
        debug!("Running enable migration for feature flag `{}`", name);
        match catch_unwind(AssertUnwindSafe(|| hook(FlagEvent::Enable))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(FeatureFlagError::MigrationFailed { reason }),
            Err(panic) => {
                let reason = panic_reason(panic);
                error!("Migration for feature flag `{}` crashed: {}", name, reason);
                Err(FeatureFlagError::MigrationCrash { reason })
            }
        }
    }

    /// Append the flag to the persisted enabled list and republish the local
    /// registry. This is the entry point peers invoke during propagation.
    pub async fn mark_as_enabled_locally(&self, name: &str) -> Result<(), FeatureFlagError> {
        let mut names = self.store.read().await?;
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
            self.store.write(&names).await?;
        }
        self.rebuild_registry().await
    }

    async fn mark_as_enabled_remotely(&self, name: &str) -> Result<(), FeatureFlagError> {
        let view = self.membership.members();
        for peer in view.running {
            let request = PeerRequest::MarkAsEnabledLocally(name.to_string());
            match self
                .rpc
                .invoke(peer, request, self.config.rpc_timeout())
                .await
            {
                Ok(PeerReply::Ack) => {}
                Ok(_) => return Err(RpcError::BadReply(peer).into()),
                Err(err) => {
                    error!(
                        "Failed to mark feature flag `{}` enabled on node {}: {}",
                        name, peer, err
                    );
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Whether every running peer supports the named flags
    ///
    /// With no running peers this is trivially true. Peers are queried one at
    /// a time; the first peer answering `false` short-circuits. A transport
    /// failure or timeout counts as "does not support".
    pub async fn is_supported_remotely(
        &self,
        names: &[FlagName],
        timeout: Option<Duration>,
    ) -> bool {
        let view = self.membership.members();
        if view.running.is_empty() {
            return true;
        }
        for peer in view.running {
            if !self.does_node_support(peer, names, timeout).await {
                return false;
            }
        }
        true
    }

    async fn does_node_support(
        &self,
        peer: NodeId,
        names: &[FlagName],
        timeout: Option<Duration>,
    ) -> bool {
        let request = PeerRequest::AreSupportedLocally(names.to_vec());
        match self.rpc.invoke(peer, request, timeout).await {
            Ok(PeerReply::Supported(supported)) => supported,
            Ok(_) => {
                warn!("Node {} answered a support query with the wrong reply", peer);
                false
            }
            Err(err) => {
                warn!(
                    "Support query to node {} failed, treating as unsupported: {}",
                    peer, err
                );
                false
            }
        }
    }

    /// Two-sided compatibility check against a peer
    ///
    /// Passes iff every locally-enabled flag is supported by the peer and
    /// every flag the peer has enabled is supported locally. Any transport
    /// failure during either half yields incompatibility.
    pub async fn check_node_compatibility(
        &self,
        peer: NodeId,
        timeout: Option<Duration>,
    ) -> Result<(), FeatureFlagError> {
        let local_enabled = self.registry.snapshot().enabled_names();
        if !self.does_node_support(peer, &local_enabled, timeout).await {
            return Err(FeatureFlagError::IncompatibleFeatureFlags);
        }

        let request = PeerRequest::ListFlags(FlagFilter::Enabled);
        let remote_enabled: Vec<FlagName> = match self.rpc.invoke(peer, request, timeout).await {
            Ok(PeerReply::Flags(flags)) => flags.into_keys().collect(),
            Ok(_) | Err(_) => return Err(FeatureFlagError::IncompatibleFeatureFlags),
        };
        if !self.are_supported_locally(&remote_enabled) {
            return Err(FeatureFlagError::IncompatibleFeatureFlags);
        }
        Ok(())
    }

    pub async fn is_node_compatible(&self, peer: NodeId, timeout: Option<Duration>) -> bool {
        self.check_node_compatibility(peer, timeout).await.is_ok()
    }

    /// Serve a request arriving from a peer's coordinator
    ///
    /// Hosts route the remote half of the RPC surface here; the in-memory
    /// transport dispatches to it directly.
    pub async fn handle_peer_request(
        &self,
        request: PeerRequest,
    ) -> Result<PeerReply, FeatureFlagError> {
        match request {
            PeerRequest::ListFlags(filter) => Ok(PeerReply::Flags(self.list(filter))),
            PeerRequest::AreSupportedLocally(names) => {
                Ok(PeerReply::Supported(self.are_supported_locally(&names)))
            }
            PeerRequest::MarkAsEnabledLocally(name) => {
                self.mark_as_enabled_locally(&name).await?;
                Ok(PeerReply::Ack)
            }
        }
    }

    /// Merge application declarations with the persisted enabled list and
    /// publish the result as a new snapshot. All rebuilds are serialised
    /// process-wide by the registry's rebuild lock.
    pub async fn rebuild_registry(&self) -> Result<(), FeatureFlagError> {
        let _guard = self.registry.rebuild_guard().await;
        let flags = catalog::merge_declarations(self.catalog.as_ref());
        let persisted = self.store.read().await?;
        self.registry
            .publish(RegistrySnapshot::build(flags, &persisted));
        Ok(())
    }
}

impl fmt::Debug for FeatureFlagController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureFlagController")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .finish()
    }
}

fn panic_reason(panic: Box<dyn Any + Send>) -> String {
    if let Some(reason) = panic.downcast_ref::<&str>() {
        (*reason).to_string()
    } else if let Some(reason) = panic.downcast_ref::<String>() {
        reason.clone()
    } else {
        "unknown panic".to_string()
    }
}
