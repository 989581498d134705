//! Application registry: which applications are loaded and which feature
//! flags each of them declares

use super::{FlagDef, FlagName};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Identifier of a loaded application
pub type AppId = String;

/// Callable yielding an application's flag map on demand
pub type FlagProvider =
    Arc<dyn Fn() -> Result<BTreeMap<FlagName, FlagDef>, String> + Send + Sync>;

/// How an application declares its feature flags
#[derive(Clone)]
pub enum FlagDeclaration {
    /// A static map baked into the application
    Declared(BTreeMap<FlagName, FlagDef>),
    /// A callable invoked with no arguments that must yield a map
    Computed(FlagProvider),
    Absent,
}

/// Enumerates installed applications and their declared flag maps
pub trait AppCatalog: Send + Sync {
    fn applications(&self) -> Vec<AppId>;
    fn flags_for(&self, app: &str) -> FlagDeclaration;
}

/// Merge every application's declarations into one flag map
///
/// Later declarations win on name collisions. A failing provider is logged
/// and treated as absent; it never aborts initialization.
pub fn merge_declarations(catalog: &dyn AppCatalog) -> BTreeMap<FlagName, FlagDef> {
    let mut merged = BTreeMap::new();
    for app in catalog.applications() {
        let declared = match catalog.flags_for(&app) {
            FlagDeclaration::Declared(map) => map,
            FlagDeclaration::Computed(provider) => match provider() {
                Ok(map) => map,
                Err(reason) => {
                    warn!(
                        "Feature-flag provider of application `{}` failed: {}",
                        app, reason
                    );
                    continue;
                }
            },
            FlagDeclaration::Absent => continue,
        };
        for (name, def) in declared {
            if merged.insert(name.clone(), def).is_some() {
                warn!(
                    "Feature flag `{}` redeclared by application `{}`, keeping the later declaration",
                    name, app
                );
            }
        }
    }
    merged
}

/// In-memory application catalog for single-process hosts and tests
#[derive(Clone, Default)]
pub struct StaticCatalog {
    apps: Vec<(AppId, FlagDeclaration)>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an application with a static flag map
    pub fn with_app(mut self, app: &str, flags: BTreeMap<FlagName, FlagDef>) -> Self {
        self.apps.push((app.to_string(), FlagDeclaration::Declared(flags)));
        self
    }

    /// Add an application whose flag map is computed on demand
    pub fn with_computed_app(mut self, app: &str, provider: FlagProvider) -> Self {
        self.apps
            .push((app.to_string(), FlagDeclaration::Computed(provider)));
        self
    }
}

impl AppCatalog for StaticCatalog {
    fn applications(&self) -> Vec<AppId> {
        self.apps.iter().map(|(app, _)| app.clone()).collect()
    }

    fn flags_for(&self, app: &str) -> FlagDeclaration {
        self.apps
            .iter()
            .find(|(candidate, _)| candidate == app)
            .map(|(_, declaration)| declaration.clone())
            .unwrap_or(FlagDeclaration::Absent)
    }
}
