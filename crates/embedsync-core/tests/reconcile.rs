//! End-to-end reconciliation runs against an in-memory world

use embedsync_core::{EmbedSync, ReconcileConfig, ReconcileError};
use embedsync_model::{
    ChangeType, ConsumerId, ContainerId, DeletedEntry, InstanceConfig, InstanceOutcome, Phase, ProgressRecord,
    ReconcileSummary, ReferenceIndex, SourceId, VersionSnapshot,
};
use embedsync_store::DocumentError;
use embedsync_test_utils::{config, reference, ts, FaultyStorage, World};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn sync(world: &World) -> EmbedSync {
    sync_with(world, ReconcileConfig::default())
}

fn sync_with(world: &World, config: ReconcileConfig) -> EmbedSync {
    EmbedSync::new(world.records.clone(), world.documents.clone(), config)
}

async fn run(sync: &EmbedSync, dry_run: bool) -> ReconcileSummary {
    sync.queue()
        .enqueue("P1".into(), dry_run)
        .await
        .unwrap()
        .join()
        .await
        .unwrap()
}

async fn index(world: &World, source: &str) -> Option<ReferenceIndex> {
    world.records.load::<ReferenceIndex>(source).await.unwrap()
}

/// S1 deleted; E1 on existing C1, E2 on missing C2
async fn deleted_source_world() -> World {
    let world = World::new();
    world.embed("S1", "E1", "C1", Some(ts(1))).await;
    world.embed("S1", "E2", "C2", Some(ts(1))).await;
    world.add_container("C1", &["E1"]);
    world
}

#[tokio::test]
async fn deleted_source_is_broken_and_missing_container_is_orphaned() {
    let world = deleted_source_world().await;
    let summary = run(&sync(&world), false).await;

    assert_eq!(summary.total_checked, 2);
    assert_eq!(summary.broken_reference_count, 1);
    assert_eq!(summary.orphaned_count, 1);
    assert_eq!(summary.orphaned_entries_removed, 1);
    assert_eq!(summary.broken_references, vec![ConsumerId::from("E1")]);

    let e1 = summary.instance(&"E1".into()).unwrap();
    assert_eq!(e1.outcome, InstanceOutcome::Broken);
    assert_eq!(e1.reason.as_deref(), Some("source deleted"));

    let e2 = summary.instance(&"E2".into()).unwrap();
    assert_eq!(e2.outcome, InstanceOutcome::Orphaned);
    assert_eq!(e2.reason.as_deref(), Some("container deleted"));

    // Broken references are reported, never removed.
    let remaining = index(&world, "S1").await.unwrap();
    assert!(remaining.find(&"E1".into()).is_some());
    assert!(remaining.find(&"E2".into()).is_none());
    assert!(world.records.load::<InstanceConfig>("E1").await.unwrap().is_some());

    let quarantined = world.records.load::<DeletedEntry>("E2").await.unwrap().unwrap();
    assert!(quarantined.can_recover);
    assert_eq!(quarantined.metadata.container_exists, Some(false));
    assert_eq!(quarantined.deletion_reason, "container deleted");
}

#[tokio::test]
async fn missing_node_is_orphaned_with_container_present() {
    let world = World::new();
    world.put_source("S1", ts(0)).await;
    world.embed("S1", "E1", "C1", Some(ts(1))).await;
    world.add_container("C1", &[]);

    let summary = run(&sync(&world), false).await;
    let e1 = summary.instance(&"E1".into()).unwrap();
    assert_eq!(e1.outcome, InstanceOutcome::Orphaned);
    assert_eq!(e1.reason.as_deref(), Some("node not found in container"));

    let quarantined = world.records.load::<DeletedEntry>("E1").await.unwrap().unwrap();
    assert_eq!(quarantined.metadata.container_exists, Some(true));
    // Last entry gone, so the index is deleted.
    assert!(index(&world, "S1").await.is_none());
}

#[tokio::test]
async fn empty_source_id_is_repaired_from_instance_config() {
    let world = World::new();
    world.put_source("S2", ts(0)).await;
    let mut legacy = ReferenceIndex::new(SourceId::default());
    legacy.upsert(reference("E3", "C1"));
    world.records.save("legacy", &legacy).await.unwrap();
    world.put_config("E3", &config(Some("S2"), Some(ts(1)))).await;
    world.add_container("C1", &["E3"]);

    let dry = run(&sync(&world), true).await;
    assert_eq!(dry.repaired_reference_count, 1);
    assert!(index(&world, "legacy").await.is_some());

    let live = run(&sync(&world), false).await;
    assert_eq!(live.repaired_reference_count, 1);
    assert_eq!(live.active_count, 1);
    let e3 = live.instance(&"E3".into()).unwrap();
    assert_eq!(e3.source_id, Some(SourceId::from("S2")));

    assert!(index(&world, "legacy").await.is_none());
    assert!(index(&world, "S2").await.unwrap().find(&"E3".into()).is_some());

    // Once moved, the entry is an ordinary active reference.
    let again = run(&sync(&world), false).await;
    assert_eq!((again.active_count, again.repaired_reference_count), (1, 0));
}

#[tokio::test]
async fn live_counts_are_stable_across_a_repair() {
    let world = World::new();
    world.put_source("S2", ts(5)).await;
    let mut legacy = ReferenceIndex::new(SourceId::default());
    legacy.upsert(reference("E3", "C1"));
    world.records.save("legacy", &legacy).await.unwrap();
    world.put_config("E3", &config(Some("S2"), Some(ts(1)))).await;
    world.add_container("C1", &["E3"]);

    let first = run(&sync(&world), false).await;
    let second = run(&sync(&world), false).await;

    assert_eq!(first.repaired_reference_count, 1);
    assert_eq!(second.repaired_reference_count, 0);
    assert_eq!(
        (first.active_count, first.stale_count),
        (second.active_count, second.stale_count)
    );
    assert_eq!((second.active_count, second.stale_count), (1, 1));
}

#[tokio::test]
async fn unrecoverable_source_id_is_broken() {
    let world = World::new();
    let mut legacy = ReferenceIndex::new(SourceId::default());
    legacy.upsert(reference("E4", "C1"));
    world.records.save("legacy", &legacy).await.unwrap();
    world.put_config("E4", &config(None, None)).await;
    world.add_container("C1", &["E4"]);

    let summary = run(&sync(&world), false).await;
    let e4 = summary.instance(&"E4".into()).unwrap();
    assert_eq!(e4.outcome, InstanceOutcome::Broken);
    assert_eq!(e4.reason.as_deref(), Some("source id missing and unrecoverable"));
    assert!(index(&world, "legacy").await.is_some());
}

#[tokio::test]
async fn staleness_follows_last_synced() {
    let world = World::new();
    world.put_source("S1", ts(10)).await;
    world.embed("S1", "E1", "C1", Some(ts(10))).await;
    world.embed("S1", "E2", "C1", Some(ts(5))).await;
    world.put_reference("S1", "E3", "C1").await;
    world.add_container("C1", &["E1", "E2", "E3"]);

    let summary = run(&sync(&world), true).await;
    assert_eq!(summary.active_count, 3);
    assert_eq!(summary.stale_count, 2);

    let e1 = summary.instance(&"E1".into()).unwrap();
    assert_eq!(e1.is_stale, Some(false));
    assert_eq!(e1.cached_content.as_deref(), Some("rendered E1"));
    assert_eq!(e1.variable_values["customer"], "acme");
    assert_eq!(summary.instance(&"E2".into()).unwrap().is_stale, Some(true));
    // No config: last sync unknown.
    assert_eq!(summary.instance(&"E3".into()).unwrap().is_stale, Some(true));
}

#[tokio::test]
async fn dry_run_leaves_live_state_untouched() {
    let world = deleted_source_world().await;
    world.put_source("S9", ts(0)).await;
    world.embed("S9", "E5", "C3", None).await;
    let before = world.live_state();

    let summary = run(&sync(&world), true).await;
    assert!(summary.dry_run);
    assert_eq!(summary.orphaned_count, 2);
    assert_eq!(summary.orphaned_entries_removed, 0);
    assert_eq!(summary.backup_id, None);

    assert_eq!(world.live_state(), before);
    assert!(world.keys("deleted:").is_empty());
    assert!(world.keys("version:").is_empty());
    assert!(world.keys("backup-").is_empty());
}

#[tokio::test]
async fn second_live_run_is_idempotent() {
    let world = World::new();
    world.put_source("S1", ts(10)).await;
    world.embed("S1", "E1", "C1", Some(ts(10))).await;
    world.embed("S1", "E2", "C1", Some(ts(2))).await;
    world.embed("S1", "E3", "C2", None).await;
    world.add_container("C1", &["E1", "E2"]);

    let first = run(&sync(&world), false).await;
    assert_eq!(first.orphaned_entries_removed, 1);

    let second = run(&sync(&world), false).await;
    assert_eq!(second.orphaned_entries_removed, 0);
    assert_eq!(second.active_count, first.active_count);
    assert_eq!(second.stale_count, first.stale_count);
}

#[tokio::test]
async fn container_lookup_failure_never_orphans() {
    let world = deleted_source_world().await;
    world
        .documents
        .fail_with("C2", DocumentError::Transport("connection reset".into()));

    let summary = run(&sync(&world), false).await;
    assert_eq!(summary.orphaned_count, 0);
    assert_eq!(summary.orphaned_entries_removed, 0);
    assert_eq!(summary.unverified_count, 1);
    assert_eq!(summary.container_errors.len(), 1);
    assert_eq!(summary.container_errors[0].container_id, ContainerId::from("C2"));

    assert!(world.keys("deleted:").is_empty());
    assert!(index(&world, "S1").await.unwrap().find(&"E2".into()).is_some());
}

#[tokio::test]
async fn undecodable_instance_records_are_reported_not_fatal() {
    let world = World::new();
    world.put_source("S1", ts(0)).await;
    world.embed("S1", "E1", "C1", Some(ts(1))).await;
    world.embed("S1", "E2", "C1", Some(ts(1))).await;
    world.embed("S1", "E3", "C2", Some(ts(1))).await;
    world.add_container("C1", &["E1", "E2"]);

    let legacy = serde_json::json!({"sourceId": "S1", "variableValues": {}});
    world.put_unchecked("macro-vars:E2", legacy.clone()).await;
    world.put_unchecked("macro-vars:E3", legacy.clone()).await;
    world.put_unchecked("macro-cache:E1", serde_json::json!({"html": "old"})).await;

    let summary = run(&sync(&world), false).await;

    let e1 = summary.instance(&"E1".into()).unwrap();
    assert_eq!(e1.outcome, InstanceOutcome::Active);
    assert_eq!(e1.is_stale, Some(false));
    assert_eq!(e1.cached_content, None);

    // No decodable config means lastSynced is unknown.
    let e2 = summary.instance(&"E2".into()).unwrap();
    assert_eq!(e2.outcome, InstanceOutcome::Active);
    assert_eq!(e2.is_stale, Some(true));

    // The orphan keeps its live records rather than losing an unreadable config.
    let e3 = summary.instance(&"E3".into()).unwrap();
    assert_eq!(e3.outcome, InstanceOutcome::Orphaned);
    assert_eq!(summary.orphaned_entries_removed, 0);
    assert!(world.keys("deleted:").is_empty());
    assert_eq!(world.storage.snapshot()["macro-vars:E3"], legacy);

    let reasons: Vec<&str> = summary.container_errors.iter().map(|e| e.reason.as_str()).collect();
    assert_eq!(summary.container_errors.len(), 3, "{reasons:?}");
    for key in ["macro-vars:E2", "macro-vars:E3", "macro-cache:E1"] {
        assert!(reasons.iter().any(|r| r.contains(key)), "{key} not reported: {reasons:?}");
    }

    let progress: ProgressRecord = world.records.load("P1").await.unwrap().unwrap();
    assert_eq!(progress.phase, Phase::Complete);
}

#[tokio::test]
async fn destructive_steps_are_preceded_by_backup_and_snapshots() {
    let world = deleted_source_world().await;
    let sync = sync(&world);
    let summary = run(&sync, false).await;

    let backup_id = summary.backup_id.unwrap();
    let backups = sync.resolvers().list_backups().await.unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].backup_id, backup_id);
    assert_eq!(backups[0].total_entities, 2);

    let snapshots = world
        .records
        .scan::<VersionSnapshot>()
        .await
        .unwrap()
        .into_records();
    let keys: Vec<(&str, ChangeType)> = snapshots
        .iter()
        .map(|s| (s.entity_key.as_str(), s.change_type))
        .collect();
    assert!(keys.contains(&("macro-vars:E2", ChangeType::Delete)));
    assert!(keys.contains(&("usage:S1", ChangeType::Update)));
}

#[tokio::test]
async fn failed_backup_aborts_only_when_required() {
    let storage = Arc::new(FaultyStorage::new());
    let world = World::with_storage(storage.clone());
    world.embed("S1", "E1", "C1", None).await;
    world.add_container("C1", &["E1"]);
    storage.fail_writes_with_prefix("backup-");

    let lenient = run(&sync(&world), false).await;
    assert_eq!(lenient.backup_id, None);

    let strict = sync_with(&world, ReconcileConfig::default().with_require_backup(true));
    let err = strict
        .queue()
        .enqueue("P2".into(), false)
        .await
        .unwrap()
        .join()
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Backup(_)));

    let progress: ProgressRecord = world.records.load("P2").await.unwrap().unwrap();
    assert_eq!(progress.phase, Phase::Error);
}

#[tokio::test]
async fn duplicate_references_keep_the_configured_source() {
    let world = World::new();
    world.put_source("S1", ts(0)).await;
    world.put_source("S2", ts(0)).await;
    world.put_reference("S1", "E1", "C1").await;
    world.put_reference("S2", "E1", "C1").await;
    world.put_config("E1", &config(Some("S2"), Some(ts(1)))).await;
    world.add_container("C1", &["E1"]);

    let dry = run(&sync(&world), true).await;
    assert_eq!(dry.duplicate_references.len(), 1);
    assert_eq!(dry.duplicate_references[0].kept_index, SourceId::from("S2"));
    assert_eq!(dry.duplicate_references[0].dropped_indices, vec![SourceId::from("S1")]);
    assert_eq!(dry.duplicate_references_resolved, 0);
    assert_eq!(dry.total_checked, 1);

    let live = run(&sync(&world), false).await;
    assert_eq!(live.duplicate_references_resolved, 1);
    assert!(index(&world, "S1").await.is_none());
    assert!(index(&world, "S2").await.unwrap().find(&"E1".into()).is_some());

    let clean = run(&sync(&world), false).await;
    assert!(clean.duplicate_references.is_empty());
}

#[tokio::test]
async fn many_orphans_in_one_index_are_all_removed() {
    let world = World::new();
    world.put_source("S1", ts(0)).await;
    for i in 0..24 {
        world.embed("S1", &format!("E{i}"), &format!("C{i}"), None).await;
    }

    let config = ReconcileConfig::default().with_container_concurrency(6);
    let summary = run(&sync_with(&world, config), false).await;

    assert_eq!(summary.containers_checked, 24);
    assert_eq!(summary.orphaned_entries_removed, 24);
    assert!(index(&world, "S1").await.is_none());
    assert_eq!(world.keys("deleted:").len(), 24);
}

#[tokio::test]
async fn large_indices_survive_chunked_storage() {
    let world = World::with_max_value_bytes(2_048);
    world.put_source("S1", ts(0)).await;
    let consumers: Vec<String> = (0..40).map(|i| format!("E{i}")).collect();
    for consumer in &consumers {
        world.embed("S1", consumer, "C1", Some(ts(1))).await;
    }
    let on_page: Vec<&str> = consumers.iter().take(30).map(String::as_str).collect();
    world.add_container("C1", &on_page);
    assert!(!world.keys("chunk:usage:S1#").is_empty());

    let summary = run(&sync(&world), false).await;
    assert_eq!(summary.active_count, 30);
    assert_eq!(summary.orphaned_entries_removed, 10);
    assert_eq!(index(&world, "S1").await.unwrap().references.len(), 30);
}

#[tokio::test]
async fn completed_run_writes_final_progress() {
    let world = deleted_source_world().await;
    let sync = sync(&world);
    let summary = run(&sync, true).await;

    let progress = sync.resolvers().get_check_progress(&"P1".into()).await.unwrap().unwrap();
    assert_eq!(progress.phase, Phase::Complete);
    assert_eq!(progress.percent, 100);
    assert_eq!((progress.processed, progress.total), (2, 2));
    assert!(progress.dry_run);
    assert_eq!(progress.results, Some(summary));
}

#[tokio::test]
async fn cancelled_run_ends_in_error() {
    let world = deleted_source_world().await;
    let sync = sync(&world);

    let job = sync.queue().enqueue("P1".into(), false).await.unwrap();
    job.cancel();
    let err = job.join().await.unwrap_err();
    assert!(err.is_cancelled());

    let progress = sync.resolvers().get_check_progress(&"P1".into()).await.unwrap().unwrap();
    assert_eq!(progress.phase, Phase::Error);
    assert_eq!(progress.status, "cancelled");
    assert!(world.keys("deleted:").is_empty());
}

#[tokio::test]
async fn storage_failure_is_fatal_and_recorded() {
    let storage = Arc::new(FaultyStorage::new());
    let world = World::with_storage(storage.clone());
    world.embed("S1", "E1", "C1", None).await;
    storage.fail_reads_with_prefix("usage:");

    let sync = sync(&world);
    let err = sync
        .queue()
        .enqueue("P1".into(), true)
        .await
        .unwrap()
        .join()
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Store(_)));
    assert!(err.is_retryable());

    let progress: ProgressRecord = world.records.load("P1").await.unwrap().unwrap();
    assert_eq!(progress.phase, Phase::Error);
    assert_eq!(progress.status, "failed");
    assert!(progress.error.unwrap().contains("injected failure"));
}
