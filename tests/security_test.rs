// ABOUTME: Security tests for catalog names, endpoint configuration, and run directory reuse
// ABOUTME: Validates protection against path traversal, self-migration, and mixing runs

mod common;

use clickhouse_seren_migrator::checkpoint::RunManifest;
use clickhouse_seren_migrator::commands::{self, ExportTarget};
use clickhouse_seren_migrator::config::{ConfigOverrides, MigrationConfig};
use clickhouse_seren_migrator::unit::{QualifiedName, UnitState};
use common::{context, test_config, MemoryEndpoint};
use std::io::Write;
use tempfile::tempdir;

// ============================================================================
// Path Traversal Prevention Tests
// ============================================================================

#[tokio::test]
async fn test_table_name_cannot_escape_run_directory() {
    let dir = tempdir().unwrap();
    let run_dir = dir.path().join("run");
    let source = MemoryEndpoint::new("source");
    source.add_database("sales");
    source.add_table("sales", "orders", 3);
    source.add_table("sales", "../escape", 3);
    source.add_table("sales", "..", 3);

    let ctx = context(test_config(&run_dir), Some(source), None, None).await;
    let summary = commands::export(ctx.clone(), ExportTarget::All).await.unwrap();

    let escape = QualifiedName::new("sales", "../escape");
    let dotdot = QualifiedName::new("sales", "..");
    assert!(summary.failed_units.contains(&escape));
    assert!(summary.failed_units.contains(&dotdot));
    assert_eq!(summary.failed_units.len(), 2);
    assert_eq!(
        ctx.store.current_state(&QualifiedName::new("sales", "orders")),
        Some(UnitState::DataExported)
    );

    // Nothing landed beside or above the run directory
    assert!(!run_dir.join("escape").exists());
    assert!(!dir.path().join("escape").exists());
    assert!(!run_dir.join("schema.ddl").exists());
}

#[tokio::test]
async fn test_reserved_database_names_are_rejected() {
    let dir = tempdir().unwrap();
    let source = MemoryEndpoint::new("source");
    source.add_database("checkpoint.log");
    source.add_database("access_control");
    source.add_database("sales");

    let ctx = context(test_config(dir.path()), Some(source), None, None).await;
    let summary = commands::export(ctx.clone(), ExportTarget::All).await.unwrap();

    assert_eq!(summary.failed_units.len(), 2);
    assert!(summary
        .failed_units
        .contains(&QualifiedName::database("checkpoint.log")));
    assert!(summary
        .failed_units
        .contains(&QualifiedName::database("access_control")));
    // The checkpoint log is still a file, not a directory
    assert!(std::fs::metadata(ctx.store.path()).unwrap().is_file());
    assert!(!dir.path().join("access_control/schema.ddl").exists());
}

// ============================================================================
// Endpoint Configuration Tests
// ============================================================================

#[test]
fn test_non_http_endpoints_are_rejected() {
    for url in [
        "postgresql://localhost:5432/db",
        "clickhouse://localhost:9000",
        "localhost:8123",
        "",
    ] {
        let result = MigrationConfig::load(
            None,
            ConfigOverrides {
                source: Some(url.to_string()),
                ..ConfigOverrides::default()
            },
        );
        assert!(result.is_err(), "accepted {:?}", url);
    }
}

#[test]
fn test_source_and_destination_must_differ() {
    let result = MigrationConfig::load(
        None,
        ConfigOverrides {
            source: Some("http://CH-1.internal".to_string()),
            destination: Some("http://ch-1.internal:8123".to_string()),
            ..ConfigOverrides::default()
        },
    );
    let err = result.unwrap_err();
    assert!(format!("{:#}", err).contains("same server"));
}

#[test]
fn test_unknown_config_keys_are_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[source]\nurl = \"http://a:8123\"\npasword = \"typo\"\n"
    )
    .unwrap();
    assert!(MigrationConfig::load(Some(file.path()), ConfigOverrides::default()).is_err());
}

// ============================================================================
// Run Directory Reuse Tests
// ============================================================================

#[test]
fn test_run_directory_is_bound_to_its_source() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("run.json");

    RunManifest::load_or_create(&path, RunManifest::new("http://a:8123", None)).unwrap();
    assert!(RunManifest::load_or_create(&path, RunManifest::new("http://a:8123", None)).is_ok());

    let err = RunManifest::load_or_create(&path, RunManifest::new("http://b:8123", None)).unwrap_err();
    assert!(err.to_string().contains("different source"));
}

#[test]
fn test_run_directory_is_bound_to_its_destination() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("run.json");

    RunManifest::load_or_create(&path, RunManifest::new("http://a:8123", Some("http://b:8123"))).unwrap();
    let err = RunManifest::load_or_create(&path, RunManifest::new("http://a:8123", Some("http://c:8123")))
        .unwrap_err();
    assert!(err.to_string().contains("different destination"));
}
