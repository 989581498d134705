//! Feature-flag coordination tests

use super::catalog::{merge_declarations, StaticCatalog};
use super::membership::StaticMembership;
use super::registry::RegistrySnapshot;
use super::rpc::InMemoryClusterRpc;
use super::store::EnabledStore;
use super::*;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

fn flag_map(entries: Vec<(&str, FlagDef)>) -> BTreeMap<FlagName, FlagDef> {
    entries
        .into_iter()
        .map(|(name, def)| (name.to_string(), def))
        .collect()
}

async fn single_node(catalog: StaticCatalog) -> (Arc<FeatureFlagController>, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = FeatureFlagConfig::default().with_enabled_file(dir.path().join("enabled.json"));
    let rpc = InMemoryClusterRpc::new();
    let controller = Arc::new(FeatureFlagController::new(
        1,
        config,
        Arc::new(catalog),
        Arc::new(StaticMembership::single_node()),
        rpc.clone(),
    ));
    rpc.register_node(1, &controller);
    controller.init().await.unwrap();
    (controller, dir)
}

#[test]
fn snapshot_drops_persisted_names_without_declaration() {
    let flags = flag_map(vec![("ff_a", FlagDef::new("a"))]);
    let snapshot = RegistrySnapshot::build(flags, &["ff_a".to_string(), "ghost".to_string()]);

    assert!(snapshot.is_enabled("ff_a"));
    assert!(!snapshot.is_enabled("ghost"));
    assert!(!snapshot.is_supported("ghost"));
    assert_eq!(snapshot.enabled_names(), vec!["ff_a".to_string()]);

    // Everything enabled must be supported.
    for name in snapshot.enabled_names() {
        assert!(snapshot.is_supported(&name));
    }
}

#[test]
fn unknown_names_are_neither_supported_nor_enabled() {
    let snapshot = RegistrySnapshot::build(BTreeMap::new(), &[]);
    assert!(!snapshot.is_supported("nope"));
    assert!(!snapshot.is_enabled("nope"));
}

#[tokio::test]
async fn disabled_is_all_minus_enabled() {
    let catalog = StaticCatalog::new().with_app(
        "broker",
        flag_map(vec![
            ("ff_a", FlagDef::new("a")),
            ("ff_b", FlagDef::new("b")),
            ("ff_c", FlagDef::new("c")),
        ]),
    );
    let (controller, _dir) = single_node(catalog).await;
    controller.enable("ff_a").await.unwrap();

    let all: Vec<_> = controller.list(FlagFilter::All).into_keys().collect();
    let enabled: Vec<_> = controller.list(FlagFilter::Enabled).into_keys().collect();
    let disabled: Vec<_> = controller.list(FlagFilter::Disabled).into_keys().collect();

    assert_eq!(all, vec!["ff_a", "ff_b", "ff_c"]);
    assert_eq!(enabled, vec!["ff_a"]);
    assert_eq!(disabled, vec!["ff_b", "ff_c"]);
}

#[tokio::test]
async fn store_reads_empty_when_record_is_missing() {
    let dir = TempDir::new().unwrap();
    let store = EnabledStore::new(dir.path().join("enabled.json"));
    assert_eq!(store.read().await.unwrap(), Vec::<FlagName>::new());
}

#[tokio::test]
async fn store_write_replaces_the_record() {
    let dir = TempDir::new().unwrap();
    let store = EnabledStore::new(dir.path().join("enabled.json"));

    store
        .write(&["ff_a".to_string(), "ff_b".to_string()])
        .await
        .unwrap();
    assert_eq!(
        store.read().await.unwrap(),
        vec!["ff_a".to_string(), "ff_b".to_string()]
    );

    store.write(&["ff_c".to_string()]).await.unwrap();
    assert_eq!(store.read().await.unwrap(), vec!["ff_c".to_string()]);
}

#[test]
fn later_declaration_wins_on_duplicate_names() {
    let catalog = StaticCatalog::new()
        .with_app("first", flag_map(vec![("ff_dup", FlagDef::new("old"))]))
        .with_app("second", flag_map(vec![("ff_dup", FlagDef::new("new"))]));

    let merged = merge_declarations(&catalog);
    assert_eq!(merged.len(), 1);
    assert_eq!(merged["ff_dup"].description, "new");
}

#[test]
fn failing_provider_is_treated_as_absent() {
    let catalog = StaticCatalog::new()
        .with_app("stable", flag_map(vec![("ff_a", FlagDef::new("a"))]))
        .with_computed_app("broken", Arc::new(|| Err("boom".to_string())));

    let merged = merge_declarations(&catalog);
    assert_eq!(merged.into_keys().collect::<Vec<_>>(), vec!["ff_a"]);
}

#[test]
fn computed_provider_contributes_flags() {
    let catalog = StaticCatalog::new().with_computed_app(
        "dynamic",
        Arc::new(|| {
            Ok([("ff_dyn".to_string(), FlagDef::new("computed"))]
                .into_iter()
                .collect())
        }),
    );

    let merged = merge_declarations(&catalog);
    assert!(merged.contains_key("ff_dyn"));
}

#[tokio::test]
async fn enable_pulls_in_dependencies() {
    let catalog = StaticCatalog::new().with_app(
        "broker",
        flag_map(vec![
            ("ff_a", FlagDef::new("a")),
            ("ff_b", FlagDef::new("b").with_depends_on(&["ff_a"])),
        ]),
    );
    let (controller, _dir) = single_node(catalog).await;

    controller.enable("ff_b").await.unwrap();
    let enabled: Vec<_> = controller.list(FlagFilter::Enabled).into_keys().collect();
    assert_eq!(enabled, vec!["ff_a", "ff_b"]);
}

#[tokio::test]
async fn enable_is_idempotent_and_migration_runs_once() {
    let runs = Arc::new(AtomicUsize::new(0));
    let observed = runs.clone();
    let catalog = StaticCatalog::new().with_app(
        "broker",
        flag_map(vec![(
            "ff_m",
            FlagDef::new("migrated").with_migration(move |_| {
                observed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )]),
    );
    let (controller, _dir) = single_node(catalog).await;

    controller.enable("ff_m").await.unwrap();
    controller.enable("ff_m").await.unwrap();

    assert!(controller.is_enabled("ff_m"));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dependencies_enable_in_declared_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let recording = |name: &'static str, order: &Arc<Mutex<Vec<&'static str>>>| {
        let order = order.clone();
        move |_: FlagEvent| {
            order.lock().push(name);
            Ok(())
        }
    };
    let catalog = StaticCatalog::new().with_app(
        "broker",
        flag_map(vec![
            ("ff_a", FlagDef::new("a").with_migration(recording("ff_a", &order))),
            ("ff_b", FlagDef::new("b").with_migration(recording("ff_b", &order))),
            (
                "ff_c",
                FlagDef::new("c")
                    .with_depends_on(&["ff_a", "ff_b"])
                    .with_migration(recording("ff_c", &order)),
            ),
        ]),
    );
    let (controller, _dir) = single_node(catalog).await;

    controller.enable("ff_c").await.unwrap();
    assert_eq!(*order.lock(), vec!["ff_a", "ff_b", "ff_c"]);
}

#[tokio::test]
async fn dependency_failure_aborts_the_chain() {
    let catalog = StaticCatalog::new().with_app(
        "broker",
        flag_map(vec![
            ("ff_a", FlagDef::new("a")),
            (
                "ff_b",
                FlagDef::new("b").with_migration(|_| Err("b is broken".to_string())),
            ),
            ("ff_c", FlagDef::new("c").with_depends_on(&["ff_a", "ff_b"])),
        ]),
    );
    let (controller, _dir) = single_node(catalog).await;

    let err = controller.enable("ff_c").await.unwrap_err();
    assert!(matches!(
        err,
        FeatureFlagError::MigrationFailed { reason } if reason == "b is broken"
    ));

    // The dependency enabled before the failure stays enabled; nothing after
    // it does.
    assert!(controller.is_enabled("ff_a"));
    assert!(!controller.is_enabled("ff_b"));
    assert!(!controller.is_enabled("ff_c"));
}

#[tokio::test]
async fn migration_error_value_is_surfaced_unchanged() {
    let catalog = StaticCatalog::new().with_app(
        "broker",
        flag_map(vec![(
            "ff_m",
            FlagDef::new("m").with_migration(|_| Err("disk_full".to_string())),
        )]),
    );
    let (controller, _dir) = single_node(catalog).await;

    let err = controller.enable("ff_m").await.unwrap_err();
    assert!(matches!(
        err,
        FeatureFlagError::MigrationFailed { reason } if reason == "disk_full"
    ));
    assert!(!controller.is_enabled("ff_m"));
}

#[tokio::test]
async fn migration_panic_is_caught() {
    let catalog = StaticCatalog::new().with_app(
        "broker",
        flag_map(vec![(
            "ff_m",
            FlagDef::new("m").with_migration(|_| panic!("kaboom")),
        )]),
    );
    let (controller, _dir) = single_node(catalog).await;

    let err = controller.enable("ff_m").await.unwrap_err();
    assert!(matches!(
        err,
        FeatureFlagError::MigrationCrash { reason } if reason.contains("kaboom")
    ));
    assert!(!controller.is_enabled("ff_m"));
}

#[tokio::test]
async fn enabling_an_undeclared_flag_is_unsupported() {
    let (controller, _dir) = single_node(StaticCatalog::new()).await;
    let err = controller.enable("ff_missing").await.unwrap_err();
    assert!(matches!(err, FeatureFlagError::Unsupported));
}

#[tokio::test]
async fn disable_is_always_unsupported() {
    let catalog =
        StaticCatalog::new().with_app("broker", flag_map(vec![("ff_a", FlagDef::new("a"))]));
    let (controller, _dir) = single_node(catalog).await;

    controller.enable("ff_a").await.unwrap();
    let err = controller.disable("ff_a").unwrap_err();
    assert!(matches!(err, FeatureFlagError::Unsupported));
    assert!(controller.is_enabled("ff_a"));
}

#[tokio::test]
async fn enabled_state_survives_a_rebuild() {
    let catalog =
        StaticCatalog::new().with_app("broker", flag_map(vec![("ff_a", FlagDef::new("a"))]));
    let (controller, _dir) = single_node(catalog).await;

    controller.enable("ff_a").await.unwrap();
    controller.rebuild_registry().await.unwrap();
    assert!(controller.is_enabled("ff_a"));
}

#[tokio::test]
async fn peer_requests_are_served_locally() {
    let catalog = StaticCatalog::new().with_app(
        "broker",
        flag_map(vec![
            ("ff_a", FlagDef::new("a")),
            ("ff_b", FlagDef::new("b")),
        ]),
    );
    let (controller, _dir) = single_node(catalog).await;

    let reply = controller
        .handle_peer_request(PeerRequest::AreSupportedLocally(vec![
            "ff_a".to_string(),
            "ff_b".to_string(),
        ]))
        .await
        .unwrap();
    assert_eq!(reply, PeerReply::Supported(true));

    let reply = controller
        .handle_peer_request(PeerRequest::AreSupportedLocally(vec![
            "ff_z".to_string()
        ]))
        .await
        .unwrap();
    assert_eq!(reply, PeerReply::Supported(false));

    let reply = controller
        .handle_peer_request(PeerRequest::MarkAsEnabledLocally("ff_a".to_string()))
        .await
        .unwrap();
    assert_eq!(reply, PeerReply::Ack);
    assert!(controller.is_enabled("ff_a"));

    let reply = controller
        .handle_peer_request(PeerRequest::ListFlags(FlagFilter::Enabled))
        .await
        .unwrap();
    match reply {
        PeerReply::Flags(flags) => {
            assert_eq!(flags.into_keys().collect::<Vec<_>>(), vec!["ff_a"]);
        }
        other => panic!("expected flags, got {:?}", other),
    }
}
