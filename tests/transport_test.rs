// ABOUTME: Two-sided migration tests: export and ship on one host, import on the other
// ABOUTME: Covers verified transfer, transfer failures, and resumable destination-side import

mod common;

use clickhouse_seren_migrator::commands::{self, ExportTarget};
use clickhouse_seren_migrator::migration::RunMode;
use clickhouse_seren_migrator::transport::{LocalTransport, Transport};
use clickhouse_seren_migrator::unit::{QualifiedName, UnitState};
use common::{context, sample_source, test_config, FlakyTransport, MemoryEndpoint, Op};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::tempdir;

#[tokio::test]
async fn test_export_ship_then_import_on_destination() {
    let export_dir = tempdir().unwrap();
    let remote_dir = tempdir().unwrap();
    let source = sample_source();
    let destination = MemoryEndpoint::new("destination");

    let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new(remote_dir.path()));
    let ctx = context(test_config(export_dir.path()), Some(source.clone()), None, Some(transport)).await;
    let summary = commands::export(ctx.clone(), ExportTarget::All).await.unwrap();
    assert!(summary.is_success(), "{}", summary);
    assert!(ctx
        .store
        .units()
        .iter()
        .all(|u| u.state == UnitState::Transferred));

    let orders = ctx.store.unit(&QualifiedName::new("sales", "orders")).unwrap();
    assert_eq!(orders.transferred_batches(), 3);
    assert!(remote_dir.path().join("sales/orders/kind.txt").exists());
    assert!(remote_dir.path().join("access_control/grants.sql").exists());
    assert!(!remote_dir.path().join("access_control/quotas.sql").exists());

    let import_ctx = context(test_config(remote_dir.path()), None, Some(destination.clone()), None).await;
    let summary = commands::import(import_ctx.clone(), true).await.unwrap();
    assert!(summary.is_success(), "{}", summary);
    assert_eq!(summary.total().migrated, 9);
    assert_eq!(
        destination.rows("sales", "orders").unwrap(),
        source.rows("sales", "orders").unwrap()
    );
    assert!(remote_dir.path().join("import.log").exists());
}

#[tokio::test]
async fn test_failed_import_resumes_after_last_loaded_batch() {
    let export_dir = tempdir().unwrap();
    let remote_dir = tempdir().unwrap();
    let source = sample_source();
    let destination = MemoryEndpoint::new("destination");

    let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new(remote_dir.path()));
    let ctx = context(test_config(export_dir.path()), Some(source.clone()), None, Some(transport)).await;
    commands::export(ctx, ExportTarget::All).await.unwrap();

    // Batch 0 loads; batch 1 fails on the attempt and on the immediate retry
    destination.fail_times(Op::Import, "sales.orders", 1, Some(2));
    let import_ctx = context(test_config(remote_dir.path()), None, Some(destination.clone()), None).await;
    let summary = commands::import(import_ctx.clone(), true).await.unwrap();

    let orders = QualifiedName::new("sales", "orders");
    assert_eq!(summary.failed_units, vec![orders.clone()]);
    assert_eq!(destination.rows("sales", "orders").unwrap().len(), 10);
    let log = std::fs::read_to_string(import_ctx.store.path()).unwrap();
    assert!(log.contains("\"kind\":\"batch_import_failure\""));
    drop(import_ctx);

    let import_ctx = context(test_config(remote_dir.path()), None, Some(destination.clone()), None).await;
    let summary = commands::resume(import_ctx.clone(), RunMode::Import).await.unwrap();
    assert!(summary.is_success(), "{}", summary);

    // No duplicates: batch 0 was not loaded a second time
    assert_eq!(
        destination.rows("sales", "orders").unwrap(),
        source.rows("sales", "orders").unwrap()
    );
    assert_eq!(import_ctx.store.current_state(&orders), Some(UnitState::Imported));
}

#[tokio::test]
async fn test_transient_send_failures_are_retried() {
    let export_dir = tempdir().unwrap();
    let remote_dir = tempdir().unwrap();
    let source = sample_source();

    let flaky = FlakyTransport::new(remote_dir.path(), 2);
    let mut config = test_config(export_dir.path());
    config.max_retries = 3;
    config.workers = 1;
    let ctx = context(config, Some(source.clone()), None, Some(flaky.clone())).await;

    let summary = commands::export(ctx, ExportTarget::All).await.unwrap();
    assert!(summary.is_success(), "{}", summary);
    assert!(flaky.sends.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_transfer_failure_keeps_exported_batches() {
    let export_dir = tempdir().unwrap();
    let remote_dir = tempdir().unwrap();
    let source = MemoryEndpoint::new("source");
    source.add_database("events");
    source.add_table("events", "clicks", 25);
    let clicks = QualifiedName::new("events", "clicks");

    let flaky = FlakyTransport::new(remote_dir.path(), usize::MAX);
    let mut config = test_config(export_dir.path());
    config.retry_batch_size = config.batch_size;
    let ctx = context(config.clone(), Some(source.clone()), None, Some(flaky.clone())).await;

    let summary = commands::export(ctx.clone(), ExportTarget::All).await.unwrap();
    assert!(summary.failed_units.contains(&clicks));
    assert_eq!(ctx.store.unit(&clicks).unwrap().batches.len(), 1);
    let log = std::fs::read_to_string(ctx.store.path()).unwrap();
    assert!(log.contains("\"kind\":\"batch_transfer_failure\""));
    drop(ctx);

    flaky.set_failures(0);
    let ctx = context(config, Some(source.clone()), None, Some(flaky.clone())).await;
    let summary = commands::resume(ctx.clone(), RunMode::Export).await.unwrap();
    assert!(summary.is_success(), "{}", summary);

    // Batch 0 was shipped from disk, not extracted again
    assert_eq!(source.calls(Op::Export, "events.clicks"), 3);
    assert_eq!(ctx.store.current_state(&clicks), Some(UnitState::Transferred));
    assert!(remote_dir
        .path()
        .join("events/clicks/batch_000002.native.gz")
        .exists());
}
