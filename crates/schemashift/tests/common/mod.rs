//! In-memory source and target used by the pipeline tests.

#![allow(dead_code)]

use async_trait::async_trait;
use schemashift::config::Config;
use schemashift::error::{MigrateError, Result};
use schemashift::plan::TablePlan;
use schemashift::schema_def::NewColumn;
use schemashift::source::{
    Batch, Column, ForeignKey, KeyConstraint, QualifiedName, RejectedRow, SchemaFailure,
    SchemaMetadata, SourcePool, Table, ViewDefinition,
};
use schemashift::target::{
    ApplyStatus, ConflictPolicy, SqlNullType, SqlValue, TargetConstraint, TargetPool, WriteTarget,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

pub fn make_test_config() -> Config {
    Config::from_yaml(
        r#"
source:
  host: mssql.local
  database: Sales
  user: sa
  password: secret
target:
  host: pg.local
  database: sales
  user: postgres
  password: secret
  ssl_mode: disable
migration:
  workers: 2
  batch_size: 2
  progress_interval: 2
  retry_backoff_ms: 1
"#,
    )
    .unwrap()
}

pub fn make_test_column(name: &str, data_type: &str, ordinal: i32) -> Column {
    Column {
        name: name.to_string(),
        data_type: data_type.to_string(),
        max_length: if data_type.contains("char") { 100 } else { 4 },
        precision: if data_type == "int" { 10 } else { 0 },
        scale: 0,
        is_nullable: ordinal != 1,
        default: None,
        is_identity: false,
        ordinal_pos: ordinal,
    }
}

/// `dbo.<name>(id int PK, name nvarchar(100))`.
pub fn make_test_table(name: &str) -> Table {
    let mut table = Table::new(QualifiedName::new("dbo", name));
    table.columns = vec![
        make_test_column("id", "int", 1),
        make_test_column("name", "nvarchar", 2),
    ];
    table.primary_key = Some(KeyConstraint {
        name: format!("PK_{}", name),
        columns: vec!["id".to_string()],
    });
    table
}

pub fn make_test_fk(child_col: &str, parent: &str, parent_col: &str) -> ForeignKey {
    ForeignKey {
        name: format!("FK_{}_{}", child_col, parent),
        columns: vec![child_col.to_string()],
        ref_table: QualifiedName::new("dbo", parent),
        ref_columns: vec![parent_col.to_string()],
        on_delete: "NO_ACTION".to_string(),
        on_update: "NO_ACTION".to_string(),
    }
}

pub fn row(id: i32, name: &str) -> Vec<SqlValue> {
    vec![SqlValue::I32(id), SqlValue::String(name.to_string())]
}

/// Source backed by vectors of rows.
#[derive(Default)]
pub struct MemorySource {
    metadata: SchemaMetadata,
    rows: HashMap<QualifiedName, Vec<Vec<SqlValue>>>,
    rejected: HashMap<QualifiedName, BTreeSet<i64>>,
    /// Remaining connection failures per table; `usize::MAX` fails forever.
    failures: Mutex<HashMap<QualifiedName, usize>>,
    /// Result sets returned for custom queries, keyed by query text.
    query_rows: HashMap<String, Vec<Vec<SqlValue>>>,
    fetch_delay: Option<Duration>,
    unreachable: bool,
    pub fetch_calls: AtomicUsize,
    pub stream_calls: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    async fn before_read(&self, table: &QualifiedName) -> Result<()> {
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        let mut failures = self.failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(table) {
            if *remaining > 0 {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                return Err(MigrateError::pool(
                    "connection reset by peer",
                    format!("reading {}", table),
                ));
            }
        }
        Ok(())
    }

    fn make_batch(&self, table: &QualifiedName, rows: &[Vec<SqlValue>], start: usize) -> Batch {
        let rejected = self.rejected.get(table);
        let mut batch = Batch {
            fetched: rows.len(),
            ..Default::default()
        };
        for (i, r) in rows.iter().enumerate() {
            let position = (start + i) as i64;
            if rejected.map(|set| set.contains(&position)).unwrap_or(false) {
                batch.rejected.push(RejectedRow {
                    position,
                    message: "invalid UTF-16 in column name".to_string(),
                });
            } else {
                batch.rows.push(r.clone());
            }
        }
        batch
    }

    pub fn with_table(mut self, mut table: Table, rows: Vec<Vec<SqlValue>>) -> Self {
        table.row_count = rows.len() as i64;
        self.rows.insert(table.name.clone(), rows);
        self.metadata.insert(table);
        self
    }

    pub fn with_view(mut self, schema: &str, name: &str, definition: &str) -> Self {
        self.metadata.views.push(ViewDefinition {
            name: QualifiedName::new(schema, name),
            definition: definition.to_string(),
        });
        self
    }

    pub fn with_failed_schema(mut self, schema: &str, message: &str) -> Self {
        self.metadata.failed_schemas.push(SchemaFailure {
            schema: schema.to_string(),
            message: message.to_string(),
        });
        self
    }

    /// Make the row at `position` fail conversion.
    pub fn with_rejected_row(mut self, table: &str, position: i64) -> Self {
        self.rejected
            .entry(QualifiedName::new("dbo", table))
            .or_default()
            .insert(position);
        self
    }

    /// Fail the next `times` reads of `table` with a connection error.
    pub fn with_connection_failures(self, table: &str, times: usize) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(QualifiedName::new("dbo", table), times);
        self
    }

    /// Rows produced when `query` is run as a custom query.
    pub fn with_query_rows(mut self, query: &str, rows: Vec<Vec<SqlValue>>) -> Self {
        self.query_rows.insert(query.to_string(), rows);
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }
}

#[async_trait]
impl SourcePool for MemorySource {
    async fn read_schema(&self, schemas: &[String]) -> Result<SchemaMetadata> {
        if self.unreachable {
            return Err(MigrateError::Connectivity("source unreachable".into()));
        }
        let mut metadata = self.metadata.clone();
        metadata.retain_tables(|n| schemas.iter().any(|s| s.eq_ignore_ascii_case(&n.schema)));
        metadata
            .views
            .retain(|v| schemas.iter().any(|s| s.eq_ignore_ascii_case(&v.name.schema)));
        Ok(metadata)
    }

    async fn row_count(&self, table: &Table) -> Result<i64> {
        Ok(self.rows.get(&table.name).map(|r| r.len() as i64).unwrap_or(0))
    }

    async fn fetch_batch(
        &self,
        table: &Table,
        _key: &[String],
        offset: i64,
        limit: usize,
    ) -> Result<Batch> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.before_read(&table.name).await?;

        let all = self.rows.get(&table.name).cloned().unwrap_or_default();
        let start = (offset.max(0) as usize).min(all.len());
        let end = (start + limit).min(all.len());
        Ok(self.make_batch(&table.name, &all[start..end], start))
    }

    async fn stream_rows(
        &self,
        table: &Table,
        custom_query: Option<&str>,
        batch_size: usize,
        tx: mpsc::Sender<Batch>,
    ) -> Result<()> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.before_read(&table.name).await?;

        let all = match custom_query {
            Some(query) => self.query_rows.get(query).cloned().unwrap_or_default(),
            None => self.rows.get(&table.name).cloned().unwrap_or_default(),
        };
        for (n, chunk) in all.chunks(batch_size.max(1)).enumerate() {
            let batch = self.make_batch(&table.name, chunk, n * batch_size.max(1));
            if tx.send(batch).await.is_err() {
                return Ok(());
            }
            if let Some(delay) = self.fetch_delay {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if self.unreachable {
            Err(MigrateError::Connectivity("source unreachable".into()))
        } else {
            Ok(())
        }
    }

    fn db_type(&self) -> &str {
        "memory"
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    pub primary_key: Option<Vec<usize>>,
    pub constraints: BTreeSet<String>,
}

impl MemTable {
    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    fn indexes(&self, names: &[String]) -> Result<Vec<usize>> {
        names
            .iter()
            .map(|n| {
                self.column_index(n)
                    .ok_or_else(|| MigrateError::Config(format!("column \"{}\" does not exist", n)))
            })
            .collect()
    }

    fn key(row: &[SqlValue], idx: &[usize]) -> Vec<SqlValue> {
        idx.iter().map(|&i| row[i].clone()).collect()
    }

    fn has_duplicates(&self, idx: &[usize]) -> bool {
        let keys: Vec<Vec<SqlValue>> = self.rows.iter().map(|r| Self::key(r, idx)).collect();
        keys.iter()
            .enumerate()
            .any(|(i, k)| keys[..i].iter().any(|other| other == k))
    }
}

#[derive(Default)]
struct TargetState {
    schemas: BTreeSet<String>,
    tables: BTreeMap<(String, String), MemTable>,
    views: BTreeMap<(String, String), String>,
    identity_resets: Vec<(String, String, String)>,
    failing_writes: HashSet<String>,
    failing_creates: HashSet<String>,
}

/// Target that keeps tables in memory and enforces keys the way PostgreSQL would.
#[derive(Default)]
pub struct MemoryTarget {
    state: Mutex<TargetState>,
    pub write_calls: AtomicUsize,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write to this target table fails with a connection error.
    pub fn fail_writes_to(self, table: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .failing_writes
            .insert(table.to_string());
        self
    }

    /// `CREATE TABLE` for this target table fails.
    pub fn fail_create_of(self, table: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .failing_creates
            .insert(table.to_string());
        self
    }

    pub fn table(&self, schema: &str, name: &str) -> Option<MemTable> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(&(schema.to_string(), name.to_string()))
            .cloned()
    }

    pub fn rows(&self, schema: &str, name: &str) -> Vec<Vec<SqlValue>> {
        self.table(schema, name).map(|t| t.rows).unwrap_or_default()
    }

    pub fn view(&self, schema: &str, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .views
            .get(&(schema.to_string(), name.to_string()))
            .cloned()
    }

    pub fn identity_resets(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().identity_resets.clone()
    }

    /// Seed a table directly, as if a previous tool had created it.
    pub fn seed_table(&self, schema: &str, name: &str, columns: &[&str], rows: Vec<Vec<SqlValue>>) {
        self.state.lock().unwrap().tables.insert(
            (schema.to_string(), name.to_string()),
            MemTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
                ..Default::default()
            },
        );
    }
}

fn missing_table(schema: &str, table: &str) -> MigrateError {
    MigrateError::Config(format!("relation \"{}.{}\" does not exist", schema, table))
}

#[async_trait]
impl TargetPool for MemoryTarget {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn create_schema(&self, schema: &str) -> Result<()> {
        self.state.lock().unwrap().schemas.insert(schema.to_string());
        Ok(())
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tables
            .contains_key(&(schema.to_string(), table.to_string())))
    }

    async fn drop_table(&self, schema: &str, table: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .tables
            .remove(&(schema.to_string(), table.to_string()));
        Ok(())
    }

    async fn create_table(&self, plan: &TablePlan) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_creates.contains(&plan.target_name) {
            return Err(MigrateError::Config(format!(
                "type \"geography\" does not exist for table {}",
                plan.target_name
            )));
        }
        if !state.schemas.contains(&plan.target_schema) {
            return Err(MigrateError::Config(format!(
                "schema \"{}\" does not exist",
                plan.target_schema
            )));
        }
        state
            .tables
            .entry((plan.target_schema.clone(), plan.target_name.clone()))
            .or_insert_with(|| MemTable {
                columns: plan.target_columns(),
                ..Default::default()
            });
        Ok(())
    }

    async fn has_primary_key(&self, schema: &str, table: &str) -> Result<bool> {
        Ok(self
            .table(schema, table)
            .map(|t| t.primary_key.is_some())
            .unwrap_or(false))
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<i64> {
        Ok(self.rows(schema, table).len() as i64)
    }

    async fn existing_columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        self.table(schema, table)
            .map(|t| t.columns)
            .ok_or_else(|| missing_table(schema, table))
    }

    async fn add_column(&self, schema: &str, table: &str, column: &NewColumn) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let t = state
            .tables
            .get_mut(&(schema.to_string(), table.to_string()))
            .ok_or_else(|| missing_table(schema, table))?;
        if t.columns.iter().any(|c| c.eq_ignore_ascii_case(&column.name)) {
            return Ok(());
        }
        t.columns.push(column.name.clone());
        for r in t.rows.iter_mut() {
            r.push(SqlValue::Null(SqlNullType::String));
        }
        Ok(())
    }

    async fn write_batch(&self, target: &WriteTarget, rows: &[Vec<SqlValue>]) -> Result<u64> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.failing_writes.contains(&target.table) {
            return Err(MigrateError::pool(
                "connection closed",
                format!("writing {}", target.table),
            ));
        }
        let t = state
            .tables
            .get_mut(&(target.schema.clone(), target.table.clone()))
            .ok_or_else(|| missing_table(&target.schema, &target.table))?;
        let idx = t.indexes(&target.columns)?;

        // One transaction: validate everything before inserting anything
        let mut staged: Vec<Vec<SqlValue>> = Vec::with_capacity(rows.len());
        for r in rows {
            let mut full = vec![SqlValue::Null(SqlNullType::String); t.columns.len()];
            for (value, &i) in r.iter().zip(&idx) {
                full[i] = value.clone();
            }
            if let Some(pk) = &t.primary_key {
                let key = MemTable::key(&full, pk);
                let exists = t
                    .rows
                    .iter()
                    .chain(staged.iter())
                    .any(|existing| MemTable::key(existing, pk) == key);
                if exists {
                    match target.conflict {
                        ConflictPolicy::DoNothing => continue,
                        ConflictPolicy::Error => {
                            return Err(MigrateError::data_copy(
                                &target.table,
                                "duplicate key value violates unique constraint",
                            ))
                        }
                    }
                }
            }
            staged.push(full);
        }

        let inserted = staged.len() as u64;
        t.rows.extend(staged);
        Ok(inserted)
    }

    async fn apply_constraint(
        &self,
        schema: &str,
        table: &str,
        constraint: &TargetConstraint,
    ) -> Result<ApplyStatus> {
        let mut state = self.state.lock().unwrap();
        let key = (schema.to_string(), table.to_string());
        let t = state.tables.get(&key).ok_or_else(|| missing_table(schema, table))?;
        if t.constraints.contains(constraint.name()) {
            return Ok(ApplyStatus::AlreadyPresent);
        }

        let violation = |what: &str| {
            MigrateError::constraint(table, constraint.name(), format!("{} violated by existing rows", what))
        };

        let mut primary_key = None;
        match constraint {
            TargetConstraint::PrimaryKey { columns, .. } => {
                let idx = t.indexes(columns)?;
                if t.has_duplicates(&idx) {
                    return Err(violation("primary key"));
                }
                primary_key = Some(idx);
            }
            TargetConstraint::Unique { columns, .. } => {
                let idx = t.indexes(columns)?;
                if t.has_duplicates(&idx) {
                    return Err(violation("unique constraint"));
                }
            }
            TargetConstraint::Index { columns, unique, .. } => {
                let idx = t.indexes(columns)?;
                if *unique && t.has_duplicates(&idx) {
                    return Err(violation("unique index"));
                }
            }
            TargetConstraint::ForeignKey {
                columns,
                ref_schema,
                ref_table,
                ref_columns,
                ..
            } => {
                let parent = state
                    .tables
                    .get(&(ref_schema.clone(), ref_table.clone()))
                    .ok_or_else(|| missing_table(ref_schema, ref_table))?;
                let child_idx = t.indexes(columns)?;
                let parent_idx = parent.indexes(ref_columns)?;
                let orphan = t.rows.iter().any(|r| {
                    let k = MemTable::key(r, &child_idx);
                    !k.iter().any(|v| matches!(v, SqlValue::Null(_)))
                        && !parent.rows.iter().any(|p| MemTable::key(p, &parent_idx) == k)
                });
                if orphan {
                    return Err(violation("foreign key"));
                }
            }
        }

        let Some(t) = state.tables.get_mut(&key) else {
            return Err(missing_table(schema, table));
        };
        if primary_key.is_some() {
            t.primary_key = primary_key;
        }
        t.constraints.insert(constraint.name().to_string());
        Ok(ApplyStatus::Created)
    }

    async fn reset_identity(&self, schema: &str, table: &str, column: &str) -> Result<()> {
        self.state.lock().unwrap().identity_resets.push((
            schema.to_string(),
            table.to_string(),
            column.to_string(),
        ));
        Ok(())
    }

    async fn create_view(&self, schema: &str, name: &str, sql: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        // A view over a relation that does not exist yet fails, like PostgreSQL
        if let Some(dep) = sql.split("FROM public.").nth(1) {
            let dep = dep.trim_start_matches('"');
            let dep: String = dep.chars().take_while(|c| *c != '"' && !c.is_whitespace()).collect();
            let is_table = state.tables.contains_key(&("public".to_string(), dep.clone()));
            let is_view = state.views.contains_key(&("public".to_string(), dep.clone()));
            if !is_table && !is_view {
                return Err(missing_table("public", &dep));
            }
        }
        state
            .views
            .insert((schema.to_string(), name.to_string()), sql.to_string());
        Ok(())
    }

    fn db_type(&self) -> &str {
        "memory"
    }
}
