// ABOUTME: Catalog classification of the source instance into migration units
// ABOUTME: Enumerates databases and objects, assigns kinds, and collects size statistics

use anyhow::{Context, Result};

use crate::checkpoint::FailureKind;
use crate::config::MigrationConfig;
use crate::endpoint::{is_system_namespace, DatabaseEndpoint};
use crate::unit::{MigrationUnit, QualifiedName, UnitKind, UnitState};
use crate::utils::{retry_with_backoff, sanitize_identifier};

/// Enumerate and classify every migratable object on `endpoint`
///
/// Units come back sorted by phase, then by name. A namespace whose catalog
/// cannot be listed yields a `Failed` database unit and classification moves
/// on; the same goes for a table whose statistics cannot be read.
///
/// # Errors
///
/// Returns an error only when the list of namespaces itself is unavailable.
pub async fn classify(
    endpoint: &dyn DatabaseEndpoint,
    config: &MigrationConfig,
) -> Result<Vec<MigrationUnit>> {
    let filter = &config.filter;
    let namespaces = retry_with_backoff(
        || endpoint.list_namespaces(),
        config.max_retries,
        config.retry_delay,
    )
    .await
    .with_context(|| format!("Failed to list databases on {}", endpoint.label()))
    .context(FailureKind::CatalogFailure)?;

    let mut units = Vec::new();
    for namespace in namespaces {
        if is_system_namespace(&namespace) || !filter.should_migrate_database(&namespace) {
            tracing::debug!("Skipping database '{}'", sanitize_identifier(&namespace));
            continue;
        }

        let mut database = MigrationUnit::new(QualifiedName::database(&namespace), UnitKind::Database);
        match classify_namespace(endpoint, config, &namespace).await {
            Ok(objects) => {
                units.push(database);
                units.extend(objects);
            }
            Err(e) => {
                tracing::warn!(
                    "⚠ Could not list objects in '{}': {:#}",
                    sanitize_identifier(&namespace),
                    e
                );
                mark_failed(&mut database, &e);
                units.push(database);
            }
        }
    }

    if filter.includes_access_control() {
        units.push(MigrationUnit::new(
            QualifiedName::access_control(),
            UnitKind::AccessControlBundle,
        ));
    }

    units.sort_by(|a, b| (a.phase(), &a.name).cmp(&(b.phase(), &b.name)));
    Ok(units)
}

/// Enumerate and classify the objects of one namespace
///
/// The namespace's own database unit is not included. Objects whose
/// statistics cannot be read come back `Failed`.
///
/// # Errors
///
/// Returns a `CatalogFailure` when the namespace's catalog cannot be listed.
pub async fn classify_namespace(
    endpoint: &dyn DatabaseEndpoint,
    config: &MigrationConfig,
    namespace: &str,
) -> Result<Vec<MigrationUnit>> {
    let objects = retry_with_backoff(
        || endpoint.list_objects(namespace),
        config.max_retries,
        config.retry_delay,
    )
    .await
    .with_context(|| format!("Failed to list objects in '{}'", namespace))
    .context(FailureKind::CatalogFailure)?;

    let mut units = Vec::new();
    for object in objects {
        if !config.filter.should_migrate_object(namespace, &object.name) {
            continue;
        }
        let mut unit = MigrationUnit::new(QualifiedName::new(namespace, &object.name), object.kind);
        if object.kind == UnitKind::DataTable {
            match endpoint.table_stats(&unit.name).await {
                Ok(stats) => {
                    unit.row_count = Some(stats.rows);
                    unit.total_bytes = Some(stats.bytes);
                }
                Err(e) => {
                    tracing::warn!("⚠ Could not read statistics for '{}': {:#}", unit.name, e);
                    mark_failed(&mut unit, &e);
                }
            }
        }
        units.push(unit);
    }
    units.sort_by(|a, b| (a.phase(), &a.name).cmp(&(b.phase(), &b.name)));
    Ok(units)
}

fn mark_failed(unit: &mut MigrationUnit, err: &anyhow::Error) {
    unit.state = UnitState::Failed;
    unit.last_error = Some(format!("{:#}", err));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RowFormat;
    use crate::endpoint::{AccessEntity, CatalogObject, Rows, TableAggregate, TableStats};
    use crate::filters::MigrationFilter;
    use anyhow::bail;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Catalog;

    #[async_trait]
    impl DatabaseEndpoint for Catalog {
        fn label(&self) -> &str {
            "source"
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn query(&self, _sql: &str) -> Result<Rows> {
            Ok(Vec::new())
        }
        async fn execute(&self, _sql: &str) -> Result<()> {
            Ok(())
        }
        async fn list_namespaces(&self) -> Result<Vec<String>> {
            Ok(vec![
                "system".to_string(),
                "sales".to_string(),
                "broken".to_string(),
            ])
        }
        async fn list_objects(&self, namespace: &str) -> Result<Vec<CatalogObject>> {
            match namespace {
                "sales" => Ok(vec![
                    CatalogObject {
                        name: "orders_mv".to_string(),
                        kind: UnitKind::MaterializedView,
                    },
                    CatalogObject {
                        name: "orders".to_string(),
                        kind: UnitKind::DataTable,
                    },
                    CatalogObject {
                        name: "flaky".to_string(),
                        kind: UnitKind::DataTable,
                    },
                ]),
                _ => bail!("Code: 81. Database {} does not exist", namespace),
            }
        }
        async fn describe_schema(&self, _object: &QualifiedName, _kind: UnitKind) -> Result<String> {
            Ok(String::new())
        }
        async fn table_stats(&self, table: &QualifiedName) -> Result<TableStats> {
            if table.name == "flaky" {
                bail!("Code: 159. Timeout exceeded");
            }
            Ok(TableStats { rows: 42, bytes: 4096 })
        }
        async fn export_rows(
            &self,
            _table: &QualifiedName,
            _format: RowFormat,
            _offset: u64,
            _limit: u64,
        ) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn import_rows(&self, _table: &QualifiedName, _format: RowFormat, _data: Vec<u8>) -> Result<u64> {
            Ok(0)
        }
        async fn table_aggregate(&self, _table: &QualifiedName, _with_checksum: bool) -> Result<TableAggregate> {
            Ok(TableAggregate { rows: 0, checksum: None })
        }
        async fn access_entities(&self, _entity: AccessEntity) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn config() -> MigrationConfig {
        MigrationConfig {
            max_retries: 0,
            retry_delay: Duration::from_millis(1),
            ..MigrationConfig::default()
        }
    }

    #[tokio::test]
    async fn test_classify_orders_by_phase_and_isolates_failures() {
        let units = classify(&Catalog, &config()).await.unwrap();
        let names: Vec<String> = units.iter().map(|u| u.name.to_string()).collect();
        assert_eq!(
            names,
            vec![
                "broken",
                "sales",
                "sales.flaky",
                "sales.orders",
                "sales.orders_mv",
                "@access_control",
            ]
        );

        let broken = &units[0];
        assert_eq!(broken.state, UnitState::Failed);
        assert!(broken.last_error.as_deref().unwrap().contains("does not exist"));

        let flaky = &units[2];
        assert_eq!(flaky.state, UnitState::Failed);

        let orders = &units[3];
        assert_eq!(orders.state, UnitState::Pending);
        assert_eq!(orders.row_count, Some(42));
        assert_eq!(orders.total_bytes, Some(4096));
    }

    #[tokio::test]
    async fn test_classify_namespace_reports_catalog_failure() {
        let units = classify_namespace(&Catalog, &config(), "sales").await.unwrap();
        assert_eq!(units.len(), 3);
        assert!(units.iter().all(|u| u.kind != UnitKind::Database));

        let err = classify_namespace(&Catalog, &config(), "broken").await.unwrap_err();
        assert_eq!(FailureKind::of(&err), Some(FailureKind::CatalogFailure));
    }

    #[tokio::test]
    async fn test_classify_applies_filter() {
        let mut config = config();
        config.filter = MigrationFilter::new(
            None,
            Some(vec!["broken".to_string()]),
            None,
            Some(vec!["sales.flaky".to_string()]),
            false,
        )
        .unwrap();

        let units = classify(&Catalog, &config).await.unwrap();
        let names: Vec<String> = units.iter().map(|u| u.name.to_string()).collect();
        assert_eq!(names, vec!["sales", "sales.orders", "sales.orders_mv"]);
    }
}
