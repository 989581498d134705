//! Published registry of declared and enabled feature flags
//!
//! Reads are on a hot path: every operation gate and every cluster-wide
//! compatibility check consults the registry. Snapshots are immutable values
//! published through an atomic pointer swap, so readers never take a lock
//! and always observe either the pre- or post-rebuild snapshot, never a mix.
//! Rebuild cost is amortised against the rare enable and startup events.

use super::{FlagDef, FlagDescriptor, FlagFilter, FlagName};
use arc_swap::ArcSwap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Immutable pairing of all declared flags with the enabled subset
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    flags: BTreeMap<FlagName, FlagDef>,
    enabled: BTreeSet<FlagName>,
}

impl RegistrySnapshot {
    /// Pair merged declarations with the persisted enabled list. Persisted
    /// names with no matching declaration are dropped.
    pub fn build(flags: BTreeMap<FlagName, FlagDef>, persisted_enabled: &[FlagName]) -> Self {
        let enabled = persisted_enabled
            .iter()
            .filter(|name| flags.contains_key(*name))
            .cloned()
            .collect();
        Self { flags, enabled }
    }

    pub fn is_supported(&self, name: &str) -> bool {
        self.flags.contains_key(name)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.contains(name)
    }

    pub fn flag(&self, name: &str) -> Option<&FlagDef> {
        self.flags.get(name)
    }

    pub fn enabled_names(&self) -> Vec<FlagName> {
        self.enabled.iter().cloned().collect()
    }

    pub fn list(&self, filter: FlagFilter) -> BTreeMap<FlagName, FlagDescriptor> {
        self.flags
            .iter()
            .filter(|(name, _)| match filter {
                FlagFilter::All => true,
                FlagFilter::Enabled => self.enabled.contains(*name),
                FlagFilter::Disabled => !self.enabled.contains(*name),
            })
            .map(|(name, def)| (name.clone(), def.descriptor()))
            .collect()
    }
}

/// Atomically-published registry snapshot
#[derive(Debug)]
pub struct FlagRegistry {
    current: ArcSwap<RegistrySnapshot>,
    rebuild_lock: Mutex<()>,
}

impl Default for FlagRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FlagRegistry {
    /// A registry holding an empty snapshot until the first rebuild
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RegistrySnapshot::default()),
            rebuild_lock: Mutex::new(()),
        }
    }

    /// The currently-published snapshot
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    pub fn is_supported(&self, name: &str) -> bool {
        self.current.load().is_supported(name)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.current.load().is_enabled(name)
    }

    pub fn list(&self, filter: FlagFilter) -> BTreeMap<FlagName, FlagDescriptor> {
        self.current.load().list(filter)
    }

    /// Serialises rebuilds; hold the guard from reading inputs through
    /// [`publish`](Self::publish)
    pub async fn rebuild_guard(&self) -> MutexGuard<'_, ()> {
        self.rebuild_lock.lock().await
    }

    pub fn publish(&self, snapshot: RegistrySnapshot) {
        self.current.store(Arc::new(snapshot));
    }
}
