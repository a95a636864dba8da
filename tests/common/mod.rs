// ABOUTME: Shared fixtures for integration tests
// ABOUTME: In-memory ClickHouse stand-in with fault injection, plus a transport that can be made to fail

#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use clickhouse_seren_migrator::checkpoint::CheckpointStore;
use clickhouse_seren_migrator::config::{MigrationConfig, RowFormat};
use clickhouse_seren_migrator::endpoint::{
    AccessEntity, CatalogObject, DatabaseEndpoint, Rows, TableAggregate, TableStats,
};
use clickhouse_seren_migrator::migration::{MigrationContext, RunLayout};
use clickhouse_seren_migrator::transport::{CommandOutput, LocalTransport, Transport};
use clickhouse_seren_migrator::unit::{QualifiedName, UnitKind};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Endpoint operations that can be counted and made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    ListObjects,
    Describe,
    Stats,
    Export,
    Import,
    Execute,
    Aggregate,
}

/// Something the endpoint did, in the order it happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Created { name: QualifiedName, kind: UnitKind },
    Exported { table: QualifiedName, offset: u64, limit: u64 },
    Imported { table: QualifiedName, rows: usize },
    Access(String),
}

#[derive(Debug, Clone)]
struct Object {
    kind: UnitKind,
    ddl: String,
    rows: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    /// Calls allowed to succeed before the fault kicks in
    after: usize,
    /// How many calls fail once it does; `None` fails forever
    times: Option<usize>,
    failed: usize,
}

#[derive(Default)]
struct State {
    databases: BTreeMap<String, String>,
    objects: BTreeMap<QualifiedName, Object>,
    access: Vec<(AccessEntity, String)>,
    principals: BTreeSet<String>,
    faults: HashMap<(Op, String), Fault>,
    panics: HashSet<(Op, String)>,
    calls: HashMap<(Op, String), usize>,
    events: Vec<Event>,
    lag: u64,
}

/// In-memory instance speaking just enough DDL for the migrator
///
/// Rows travel as newline-terminated text regardless of the requested
/// format.
pub struct MemoryEndpoint {
    label: String,
    state: Mutex<State>,
}

impl MemoryEndpoint {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(State::default()),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_database(&self, namespace: &str) {
        self.state().databases.insert(
            namespace.to_string(),
            format!("CREATE DATABASE {} ENGINE = Atomic", namespace),
        );
    }

    /// Add a MergeTree table with `rows` generated rows
    pub fn add_table(&self, namespace: &str, name: &str, rows: usize) {
        let table = QualifiedName::new(namespace, name);
        let rows = (0..rows).map(|i| format!("{}\t{}", i, table)).collect();
        self.state().objects.insert(
            table.clone(),
            Object {
                kind: UnitKind::DataTable,
                ddl: format!("CREATE TABLE {} (id UInt64, tag String) ENGINE = MergeTree ORDER BY id", table),
                rows,
            },
        );
    }

    pub fn add_object(&self, namespace: &str, name: &str, kind: UnitKind) {
        let object = QualifiedName::new(namespace, name);
        let keyword = match kind {
            UnitKind::MaterializedView => "MATERIALIZED VIEW",
            UnitKind::View => "VIEW",
            UnitKind::Dictionary => "DICTIONARY",
            _ => "TABLE",
        };
        self.state().objects.insert(
            object.clone(),
            Object {
                kind,
                ddl: format!("CREATE {} {} AS SELECT 1", keyword, object),
                rows: Vec::new(),
            },
        );
    }

    pub fn add_access(&self, entity: AccessEntity, statement: &str) {
        self.state().access.push((entity, statement.to_string()));
    }

    pub fn rows(&self, namespace: &str, name: &str) -> Option<Vec<String>> {
        self.state()
            .objects
            .get(&QualifiedName::new(namespace, name))
            .map(|o| o.rows.clone())
    }

    pub fn truncate_rows(&self, namespace: &str, name: &str, keep: usize) {
        if let Some(object) = self.state().objects.get_mut(&QualifiedName::new(namespace, name)) {
            object.rows.truncate(keep);
        }
    }

    pub fn push_row(&self, namespace: &str, name: &str, row: &str) {
        if let Some(object) = self.state().objects.get_mut(&QualifiedName::new(namespace, name)) {
            object.rows.push(row.to_string());
        }
    }

    pub fn has_object(&self, namespace: &str, name: &str) -> bool {
        self.state()
            .objects
            .contains_key(&QualifiedName::new(namespace, name))
    }

    pub fn set_lag(&self, lag: u64) {
        self.state().lag = lag;
    }

    /// Fail every call of `op` on `target` after `after` successful ones
    pub fn fail(&self, op: Op, target: &str, after: usize) {
        self.fail_times(op, target, after, None);
    }

    /// Fail `times` calls of `op` on `target` after `after` successful ones
    pub fn fail_times(&self, op: Op, target: &str, after: usize, times: Option<usize>) {
        let mut state = self.state();
        let already = state.calls.get(&(op, target.to_string())).copied().unwrap_or(0);
        state.faults.insert(
            (op, target.to_string()),
            Fault {
                after: already + after,
                times,
                failed: 0,
            },
        );
    }

    /// Panic inside every call of `op` on `target`
    pub fn panic_on(&self, op: Op, target: &str) {
        self.state().panics.insert((op, target.to_string()));
    }

    pub fn clear_faults(&self) {
        let mut state = self.state();
        state.faults.clear();
        state.panics.clear();
    }

    /// Attempts of `op` on `target`, successful or not
    pub fn calls(&self, op: Op, target: &str) -> usize {
        self.state()
            .calls
            .get(&(op, target.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self, op: Op) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|((o, _), _)| *o == op)
            .map(|(_, n)| n)
            .sum()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    fn enter(&self, op: Op, target: &str) -> Result<()> {
        let key = (op, target.to_string());
        if self.state().panics.contains(&key) {
            panic!("injected {:?} panic on {}", op, target);
        }
        let mut state = self.state();
        let count = {
            let calls = state.calls.entry(key.clone()).or_insert(0);
            *calls += 1;
            *calls
        };
        if let Some(fault) = state.faults.get_mut(&key) {
            let exhausted = fault.times.is_some_and(|times| fault.failed >= times);
            if count > fault.after && !exhausted {
                fault.failed += 1;
                bail!("Code: 210. DB::NetException: injected {:?} failure on {}", op, target);
            }
        }
        Ok(())
    }

    fn apply_ddl(&self, sql: &str) -> Result<()> {
        let mut state = self.state();
        let words: Vec<&str> = sql.split_whitespace().collect();

        match words.as_slice() {
            ["CREATE", "DATABASE", "IF", "NOT", "EXISTS", name, ..] => {
                let name = unquote(name);
                state
                    .databases
                    .entry(name.clone())
                    .or_insert_with(|| format!("CREATE DATABASE {}", name));
                Ok(())
            }
            ["CREATE", "DATABASE", name, ..] => {
                let name = unquote(name);
                if state.databases.contains_key(&name) {
                    bail!("Code: 82. DB::Exception: Database {} already exists", name);
                }
                state.databases.insert(name.clone(), sql.to_string());
                state.events.push(Event::Created {
                    name: QualifiedName::database(&name),
                    kind: UnitKind::Database,
                });
                Ok(())
            }
            ["CREATE", rest @ ..] => {
                let (kind, name) = match rest {
                    ["TABLE", name, ..] => (UnitKind::DataTable, name),
                    ["MATERIALIZED", "VIEW", name, ..] => (UnitKind::MaterializedView, name),
                    ["VIEW", name, ..] => (UnitKind::View, name),
                    ["DICTIONARY", name, ..] => (UnitKind::Dictionary, name),
                    ["ROLE" | "USER" | "QUOTA", name, ..]
                    | ["SETTINGS", "PROFILE", name, ..] => {
                        let principal = unquote(name);
                        if !state.principals.insert(principal.clone()) {
                            bail!("Code: 493. DB::Exception: {} already exists", principal);
                        }
                        state.events.push(Event::Access(sql.to_string()));
                        return Ok(());
                    }
                    _ => bail!("Code: 62. DB::Exception: Syntax error: {}", sql),
                };
                let name: QualifiedName = unquote(name).parse()?;
                if !state.databases.contains_key(&name.namespace) {
                    bail!("Code: 81. DB::Exception: Database {} does not exist", name.namespace);
                }
                if state.objects.contains_key(&name) {
                    bail!("Code: 57. DB::Exception: Table {} already exists", name);
                }
                state.objects.insert(
                    name.clone(),
                    Object {
                        kind,
                        ddl: sql.to_string(),
                        rows: Vec::new(),
                    },
                );
                state.events.push(Event::Created { name, kind });
                Ok(())
            }
            ["GRANT", .., "TO", grantee] => {
                let grantee = unquote(grantee);
                if !state.principals.contains(&grantee) {
                    bail!("Code: 511. DB::Exception: There is no role or user `{}`", grantee);
                }
                state.events.push(Event::Access(sql.to_string()));
                Ok(())
            }
            _ => bail!("Code: 62. DB::Exception: Syntax error: {}", sql),
        }
    }
}

fn unquote(identifier: &str) -> String {
    identifier.replace('`', "")
}

fn checksum(rows: &[String]) -> u64 {
    rows.iter().fold(0u64, |acc, row| {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in row.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        acc.wrapping_add(hash)
    })
}

#[async_trait]
impl DatabaseEndpoint for MemoryEndpoint {
    fn label(&self) -> &str {
        &self.label
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn query(&self, _sql: &str) -> Result<Rows> {
        Ok(vec![vec![self.state().lag.to_string()]])
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        self.enter(Op::Execute, sql)?;
        self.apply_ddl(sql)
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let mut namespaces: Vec<String> = self.state().databases.keys().cloned().collect();
        namespaces.push("system".to_string());
        Ok(namespaces)
    }

    async fn list_objects(&self, namespace: &str) -> Result<Vec<CatalogObject>> {
        self.enter(Op::ListObjects, namespace)?;
        Ok(self
            .state()
            .objects
            .iter()
            .filter(|(name, _)| name.namespace == namespace)
            .map(|(name, object)| CatalogObject {
                name: name.name.clone(),
                kind: object.kind,
            })
            .collect())
    }

    async fn describe_schema(&self, object: &QualifiedName, kind: UnitKind) -> Result<String> {
        self.enter(Op::Describe, &object.to_string())?;
        let state = self.state();
        if kind == UnitKind::Database {
            return state
                .databases
                .get(&object.namespace)
                .cloned()
                .ok_or_else(|| anyhow!("Code: 81. Database {} does not exist", object.namespace));
        }
        state
            .objects
            .get(object)
            .map(|o| o.ddl.clone())
            .ok_or_else(|| anyhow!("Code: 60. Table {} does not exist", object))
    }

    async fn table_stats(&self, table: &QualifiedName) -> Result<TableStats> {
        self.enter(Op::Stats, &table.to_string())?;
        let state = self.state();
        let object = state
            .objects
            .get(table)
            .ok_or_else(|| anyhow!("Code: 60. Table {} does not exist", table))?;
        Ok(TableStats {
            rows: object.rows.len() as u64,
            bytes: object.rows.iter().map(|r| r.len() as u64 + 1).sum(),
        })
    }

    async fn export_rows(
        &self,
        table: &QualifiedName,
        _format: RowFormat,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<u8>> {
        self.enter(Op::Export, &table.to_string())?;
        let mut state = self.state();
        let object = state
            .objects
            .get(table)
            .ok_or_else(|| anyhow!("Code: 60. Table {} does not exist", table))?;
        let mut out = Vec::new();
        for row in object
            .rows
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
        {
            out.extend_from_slice(row.as_bytes());
            out.push(b'\n');
        }
        state.events.push(Event::Exported {
            table: table.clone(),
            offset,
            limit,
        });
        Ok(out)
    }

    async fn import_rows(&self, table: &QualifiedName, _format: RowFormat, data: Vec<u8>) -> Result<u64> {
        self.enter(Op::Import, &table.to_string())?;
        let text = String::from_utf8(data)?;
        let mut state = self.state();
        let object = state
            .objects
            .get_mut(table)
            .ok_or_else(|| anyhow!("Code: 60. Table {} does not exist", table))?;
        let rows: Vec<String> = text.lines().map(str::to_string).collect();
        let count = rows.len();
        object.rows.extend(rows);
        state.events.push(Event::Imported {
            table: table.clone(),
            rows: count,
        });
        Ok(count as u64)
    }

    async fn table_aggregate(&self, table: &QualifiedName, with_checksum: bool) -> Result<TableAggregate> {
        self.enter(Op::Aggregate, &table.to_string())?;
        let state = self.state();
        let object = state
            .objects
            .get(table)
            .ok_or_else(|| anyhow!("Code: 60. Table {} does not exist", table))?;
        Ok(TableAggregate {
            rows: object.rows.len() as u64,
            checksum: with_checksum.then(|| checksum(&object.rows)),
        })
    }

    async fn access_entities(&self, entity: AccessEntity) -> Result<Vec<String>> {
        Ok(self
            .state()
            .access
            .iter()
            .filter(|(e, _)| *e == entity)
            .map(|(_, s)| s.clone())
            .collect())
    }
}

/// Local transport whose sends fail a set number of times
pub struct FlakyTransport {
    inner: LocalTransport,
    failures_left: AtomicUsize,
    pub sends: AtomicUsize,
}

impl FlakyTransport {
    pub fn new(root: &Path, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: LocalTransport::new(root),
            failures_left: AtomicUsize::new(failures),
            sends: AtomicUsize::new(0),
        })
    }

    pub fn set_failures(&self, failures: usize) {
        self.failures_left.store(failures, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    fn describe(&self) -> String {
        format!("flaky {}", self.inner.describe())
    }

    async fn ensure_remote_dir(&self, path: &Path) -> Result<()> {
        self.inner.ensure_remote_dir(path).await
    }

    async fn send(&self, local_path: &Path, remote_path: &Path) -> Result<()> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            bail!("Connection reset while sending {}", remote_path.display());
        }
        self.inner.send(local_path, remote_path).await
    }

    async fn remote_size(&self, remote_path: &Path) -> Result<Option<u64>> {
        self.inner.remote_size(remote_path).await
    }

    async fn run_remote_command(&self, host: &str, cmd: &str) -> Result<CommandOutput> {
        self.inner.run_remote_command(host, cmd).await
    }
}

/// Configuration suited to fast, deterministic tests
pub fn test_config(run_dir: &Path) -> MigrationConfig {
    MigrationConfig {
        run_dir: run_dir.to_path_buf(),
        workers: 4,
        batch_size: 10,
        retry_batch_size: 5,
        batch_delay: Duration::ZERO,
        object_delay: Duration::ZERO,
        max_retries: 0,
        retry_delay: Duration::from_millis(1),
        progress: false,
        ..MigrationConfig::default()
    }
}

/// Build a context over `run_dir` with a fresh or reopened checkpoint log
pub async fn context(
    config: MigrationConfig,
    source: Option<Arc<MemoryEndpoint>>,
    destination: Option<Arc<MemoryEndpoint>>,
    transport: Option<Arc<dyn Transport>>,
) -> Arc<MigrationContext> {
    let layout = RunLayout::new(&config.run_dir);
    let log = if source.is_some() {
        layout.checkpoint_log()
    } else {
        layout.import_log()
    };
    let store = Arc::new(CheckpointStore::open(&log).await.unwrap());
    let mut ctx = MigrationContext::new(Arc::new(config), store, layout);
    if let Some(source) = source {
        ctx = ctx.with_source(source);
    }
    if let Some(destination) = destination {
        ctx = ctx.with_destination(destination);
    }
    if let Some(transport) = transport {
        ctx = ctx.with_transport(transport);
    }
    Arc::new(ctx)
}

/// A source with two databases covering every unit kind
pub fn sample_source() -> Arc<MemoryEndpoint> {
    let source = MemoryEndpoint::new("source");
    source.add_database("sales");
    source.add_database("hr");
    source.add_table("sales", "orders", 25);
    source.add_table("sales", "customers", 10);
    source.add_table("hr", "staff", 3);
    source.add_object("sales", "orders_by_day", UnitKind::MaterializedView);
    source.add_object("sales", "recent_orders", UnitKind::View);
    source.add_object("hr", "departments", UnitKind::Dictionary);
    source.add_access(AccessEntity::Role, "CREATE ROLE analyst");
    source.add_access(AccessEntity::User, "CREATE USER alice IDENTIFIED WITH no_password");
    source.add_access(AccessEntity::Grant, "GRANT SELECT ON sales.* TO analyst");
    source.add_access(AccessEntity::Grant, "GRANT analyst TO alice");
    source
}
