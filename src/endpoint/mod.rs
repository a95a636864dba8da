// ABOUTME: Database endpoint abstraction consumed by the orchestrator
// ABOUTME: Defines catalog, bulk row transfer and aggregate operations against one instance

pub mod access;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::RowFormat;
use crate::unit::{QualifiedName, UnitKind};

pub use access::AccessEntity;

/// Namespaces owned by the server itself, never migrated
pub const SYSTEM_NAMESPACES: &[&str] = &[
    "system",
    "information_schema",
    "INFORMATION_SCHEMA",
    "_temporary_and_external_tables",
];

pub fn is_system_namespace(namespace: &str) -> bool {
    SYSTEM_NAMESPACES.contains(&namespace)
}

/// Tabular query result, one `Vec<String>` per row
pub type Rows = Vec<Vec<String>>;

/// An object listed in a namespace's catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogObject {
    pub name: String,
    pub kind: UnitKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub rows: u64,
    pub bytes: u64,
}

/// Aggregate used to reconcile a table between two instances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableAggregate {
    pub rows: u64,
    pub checksum: Option<u64>,
}

/// One analytical database instance
///
/// Connection parameters are owned by the implementation; the orchestrator
/// only sequences calls.
#[async_trait]
pub trait DatabaseEndpoint: Send + Sync {
    /// Human-readable label for logs
    fn label(&self) -> &str;

    /// Cheap reachability check
    async fn ping(&self) -> Result<()>;

    /// Run a query and return its rows
    async fn query(&self, sql: &str) -> Result<Rows>;

    /// Run a statement that returns no rows (DDL, grants)
    async fn execute(&self, sql: &str) -> Result<()>;

    /// User namespaces (databases) on the instance
    async fn list_namespaces(&self) -> Result<Vec<String>>;

    async fn list_objects(&self, namespace: &str) -> Result<Vec<CatalogObject>>;

    /// DDL text that recreates `object`
    async fn describe_schema(&self, object: &QualifiedName, kind: UnitKind) -> Result<String>;

    async fn table_stats(&self, table: &QualifiedName) -> Result<TableStats>;

    /// Serialized rows `[offset, offset + limit)` in a stable order
    async fn export_rows(
        &self,
        table: &QualifiedName,
        format: RowFormat,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<u8>>;

    /// Bulk insert serialized rows, returning the number of rows written
    async fn import_rows(&self, table: &QualifiedName, format: RowFormat, data: Vec<u8>)
        -> Result<u64>;

    async fn table_aggregate(
        &self,
        table: &QualifiedName,
        with_checksum: bool,
    ) -> Result<TableAggregate>;

    /// DDL statements recreating every non-builtin entity of one kind
    async fn access_entities(&self, entity: AccessEntity) -> Result<Vec<String>>;
}

/// True when a DDL error only says the object is already there
///
/// Resumed runs replay DDL that may have succeeded before the interruption.
pub fn is_already_exists(err: &anyhow::Error) -> bool {
    let message = format!("{:#}", err);
    message.contains("already exists")
        || message.contains("Code: 57.")
        || message.contains("Code: 82.")
        || message.contains("Code: 493.")
}
