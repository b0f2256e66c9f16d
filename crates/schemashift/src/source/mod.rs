//! SQL Server source: catalog introspection, paged and streamed row reads.

mod types;

pub use types::*;

use crate::config::SourceConfig;
use crate::error::{MigrateError, Result};
use crate::target::{SqlNullType, SqlValue};
use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use futures::TryStreamExt;
use rust_decimal::Decimal;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, Query, Row};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

type TdsClient = Client<Compat<TcpStream>>;

/// Trait for source database operations.
#[async_trait]
pub trait SourcePool: Send + Sync {
    /// Read tables, columns, keys, indexes and views for the given schemas.
    ///
    /// A schema whose catalog cannot be read is listed in
    /// [`SchemaMetadata::failed_schemas`]; a lost connection is returned as an error.
    async fn read_schema(&self, schemas: &[String]) -> Result<SchemaMetadata>;

    /// Exact row count for a table.
    async fn row_count(&self, table: &Table) -> Result<i64>;

    /// Read up to `limit` rows starting at `offset`, ordered by the unique
    /// `key` columns.
    async fn fetch_batch(
        &self,
        table: &Table,
        key: &[String],
        offset: i64,
        limit: usize,
    ) -> Result<Batch>;

    /// Run one query over the table (or `custom_query` when set) and send
    /// its rows on `tx` in batches of `batch_size`. Returns once the result
    /// set is exhausted or the receiver is dropped.
    async fn stream_rows(
        &self,
        table: &Table,
        custom_query: Option<&str>,
        batch_size: usize,
        tx: mpsc::Sender<Batch>,
    ) -> Result<()>;

    /// Round-trip a trivial query.
    async fn ping(&self) -> Result<()>;

    /// Get the database type.
    fn db_type(&self) -> &str;
}

/// Connection manager for bb8 pool with tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    config: SourceConfig,
}

impl TiberiusConnectionManager {
    fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(&self.config.user, &self.config.password));

        if self.config.encrypt {
            if self.config.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = TdsClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            })?;

        tcp.set_nodelay(true).ok();

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// SQL Server source pool implementation with connection pooling.
pub struct MssqlPool {
    pool: Pool<TiberiusConnectionManager>,
}

impl MssqlPool {
    /// Create a new pool and verify that a connection can be opened.
    pub async fn new(config: SourceConfig, max_size: u32) -> Result<Self> {
        let manager = TiberiusConnectionManager::new(config.clone());
        let pool = Pool::builder()
            .max_size(max_size.max(1))
            .min_idle(Some(1))
            .build(manager)
            .await
            .map_err(|e| {
                MigrateError::Connectivity(format!(
                    "cannot reach SQL Server at {}:{}: {}",
                    config.host, config.port, e
                ))
            })?;

        let source = Self { pool };
        source.ping().await.map_err(|e| {
            MigrateError::Connectivity(format!(
                "cannot reach SQL Server at {}:{}: {}",
                config.host, config.port, e
            ))
        })?;

        info!(
            "Connected to SQL Server: {}:{}/{} (pool_size={})",
            config.host, config.port, config.database, max_size
        );

        Ok(source)
    }

    /// Get a pooled connection.
    async fn get_client(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "getting SQL Server connection"))
    }

    async fn list_tables(&self, client: &mut TdsClient, schema: &str) -> Result<Vec<Table>> {
        let query = r#"
            SELECT t.TABLE_SCHEMA, t.TABLE_NAME
            FROM INFORMATION_SCHEMA.TABLES t
            WHERE t.TABLE_TYPE = 'BASE TABLE'
              AND t.TABLE_SCHEMA = @P1
            ORDER BY t.TABLE_NAME
        "#;

        let mut q = Query::new(query);
        q.bind(schema);
        let rows = q.query(client).await?.into_first_result().await?;

        rows.iter()
            .map(|row| {
                Ok(Table::new(QualifiedName::new(
                    required_str(row, 0, schema)?,
                    required_str(row, 1, schema)?,
                )))
            })
            .collect()
    }

    /// Load columns for a table.
    async fn load_columns(&self, client: &mut TdsClient, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT
                COLUMN_NAME,
                DATA_TYPE,
                CAST(ISNULL(CHARACTER_MAXIMUM_LENGTH, 0) AS INT),
                CAST(ISNULL(NUMERIC_PRECISION, 0) AS INT),
                CAST(ISNULL(NUMERIC_SCALE, 0) AS INT),
                CASE WHEN IS_NULLABLE = 'YES' THEN 1 ELSE 0 END,
                COLUMN_DEFAULT,
                CAST(ISNULL(COLUMNPROPERTY(OBJECT_ID(QUOTENAME(TABLE_SCHEMA) + '.' + QUOTENAME(TABLE_NAME)), COLUMN_NAME, 'IsIdentity'), 0) AS INT),
                CAST(ORDINAL_POSITION AS INT)
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2
            ORDER BY ORDINAL_POSITION
        "#;

        let mut query = Query::new(query);
        query.bind(table.name.schema.as_str());
        query.bind(table.name.name.as_str());
        let rows = query.query(client).await?.into_first_result().await?;

        for row in rows {
            let col = Column {
                name: required_str(&row, 0, &table.name.schema)?,
                data_type: required_str(&row, 1, &table.name.schema)?,
                max_length: row.try_get::<i32, _>(2).ok().flatten().unwrap_or(0),
                precision: row.try_get::<i32, _>(3).ok().flatten().unwrap_or(0),
                scale: row.try_get::<i32, _>(4).ok().flatten().unwrap_or(0),
                is_nullable: row.try_get::<i32, _>(5).ok().flatten().unwrap_or(1) == 1,
                default: row
                    .try_get::<&str, _>(6)
                    .ok()
                    .flatten()
                    .map(str::to_string),
                is_identity: row.try_get::<i32, _>(7).ok().flatten().unwrap_or(0) == 1,
                ordinal_pos: row.try_get::<i32, _>(8).ok().flatten().unwrap_or(0),
            };
            table.columns.push(col);
        }

        debug!("Loaded {} columns for {}", table.columns.len(), table.name);
        Ok(())
    }

    /// Load primary key and unique constraints for a table.
    async fn load_key_constraints(&self, client: &mut TdsClient, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT tc.CONSTRAINT_NAME, tc.CONSTRAINT_TYPE, c.COLUMN_NAME
            FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
            JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE c
                ON c.CONSTRAINT_NAME = tc.CONSTRAINT_NAME
                AND c.TABLE_SCHEMA = tc.TABLE_SCHEMA
                AND c.TABLE_NAME = tc.TABLE_NAME
            WHERE tc.CONSTRAINT_TYPE IN ('PRIMARY KEY', 'UNIQUE')
              AND tc.TABLE_SCHEMA = @P1
              AND tc.TABLE_NAME = @P2
            ORDER BY tc.CONSTRAINT_TYPE, tc.CONSTRAINT_NAME, c.ORDINAL_POSITION
        "#;

        let mut query = Query::new(query);
        query.bind(table.name.schema.as_str());
        query.bind(table.name.name.as_str());
        let rows = query.query(client).await?.into_first_result().await?;

        for row in rows {
            let name = required_str(&row, 0, &table.name.schema)?;
            let kind = required_str(&row, 1, &table.name.schema)?;
            let column = required_str(&row, 2, &table.name.schema)?;

            if kind == "PRIMARY KEY" {
                table
                    .primary_key
                    .get_or_insert_with(|| KeyConstraint {
                        name: name.clone(),
                        columns: Vec::new(),
                    })
                    .columns
                    .push(column);
            } else {
                match table.unique_constraints.iter_mut().find(|u| u.name == name) {
                    Some(existing) => existing.columns.push(column),
                    None => table.unique_constraints.push(KeyConstraint {
                        name,
                        columns: vec![column],
                    }),
                }
            }
        }

        debug!(
            "Keys for {}: pk={:?}, unique={}",
            table.name,
            table.primary_key.as_ref().map(|pk| &pk.columns),
            table.unique_constraints.len()
        );
        Ok(())
    }

    async fn load_indexes(&self, client: &mut TdsClient, table: &mut Table) -> Result<()> {
        // Ordered string aggregation that works before STRING_AGG existed
        let query = r#"
            SELECT
                i.name AS index_name,
                i.is_unique,
                STUFF((
                    SELECT ',' + c2.name
                    FROM sys.index_columns ic2
                    JOIN sys.columns c2 ON ic2.object_id = c2.object_id AND ic2.column_id = c2.column_id
                    WHERE ic2.object_id = i.object_id AND ic2.index_id = i.index_id AND ic2.is_included_column = 0
                    ORDER BY ic2.key_ordinal
                    FOR XML PATH('')
                ), 1, 1, '') AS columns,
                ISNULL(STUFF((
                    SELECT ',' + c2.name
                    FROM sys.index_columns ic2
                    JOIN sys.columns c2 ON ic2.object_id = c2.object_id AND ic2.column_id = c2.column_id
                    WHERE ic2.object_id = i.object_id AND ic2.index_id = i.index_id AND ic2.is_included_column = 1
                    ORDER BY ic2.index_column_id
                    FOR XML PATH('')
                ), 1, 1, ''), '') AS include_columns
            FROM sys.indexes i
            JOIN sys.tables tb ON i.object_id = tb.object_id
            JOIN sys.schemas s ON tb.schema_id = s.schema_id
            WHERE s.name = @P1
              AND tb.name = @P2
              AND i.is_primary_key = 0
              AND i.is_unique_constraint = 0
              AND i.is_hypothetical = 0
              AND i.type > 0
            ORDER BY i.name
        "#;

        let mut q = Query::new(query);
        q.bind(table.name.schema.as_str());
        q.bind(table.name.name.as_str());
        let rows = q.query(client).await?.into_first_result().await?;

        for row in rows {
            let index = Index {
                name: required_str(&row, 0, &table.name.schema)?,
                is_unique: row.try_get::<bool, _>(1).ok().flatten().unwrap_or(false),
                columns: split_list(row.try_get::<&str, _>(2).ok().flatten()),
                include_cols: split_list(row.try_get::<&str, _>(3).ok().flatten()),
            };
            if index.columns.is_empty() {
                warn!("Skipping index {} on {}: no key columns", index.name, table.name);
                continue;
            }
            table.indexes.push(index);
        }

        debug!("Loaded {} indexes for {}", table.indexes.len(), table.name);
        Ok(())
    }

    async fn load_foreign_keys(&self, client: &mut TdsClient, table: &mut Table) -> Result<()> {
        let query = r#"
            SELECT
                fk.name AS fk_name,
                STUFF((
                    SELECT ',' + pc2.name
                    FROM sys.foreign_key_columns fkc2
                    JOIN sys.columns pc2 ON fkc2.parent_object_id = pc2.object_id AND fkc2.parent_column_id = pc2.column_id
                    WHERE fkc2.constraint_object_id = fk.object_id
                    ORDER BY fkc2.constraint_column_id
                    FOR XML PATH('')
                ), 1, 1, '') AS parent_columns,
                rs.name AS ref_schema,
                rt.name AS ref_table,
                STUFF((
                    SELECT ',' + rc2.name
                    FROM sys.foreign_key_columns fkc2
                    JOIN sys.columns rc2 ON fkc2.referenced_object_id = rc2.object_id AND fkc2.referenced_column_id = rc2.column_id
                    WHERE fkc2.constraint_object_id = fk.object_id
                    ORDER BY fkc2.constraint_column_id
                    FOR XML PATH('')
                ), 1, 1, '') AS ref_columns,
                fk.delete_referential_action_desc,
                fk.update_referential_action_desc
            FROM sys.foreign_keys fk
            JOIN sys.tables pt ON fk.parent_object_id = pt.object_id
            JOIN sys.schemas ps ON pt.schema_id = ps.schema_id
            JOIN sys.tables rt ON fk.referenced_object_id = rt.object_id
            JOIN sys.schemas rs ON rt.schema_id = rs.schema_id
            WHERE ps.name = @P1 AND pt.name = @P2
            ORDER BY fk.name
        "#;

        let mut q = Query::new(query);
        q.bind(table.name.schema.as_str());
        q.bind(table.name.name.as_str());
        let rows = q.query(client).await?.into_first_result().await?;

        for row in rows {
            let fk = ForeignKey {
                name: required_str(&row, 0, &table.name.schema)?,
                columns: split_list(row.try_get::<&str, _>(1).ok().flatten()),
                ref_table: QualifiedName::new(
                    required_str(&row, 2, &table.name.schema)?,
                    required_str(&row, 3, &table.name.schema)?,
                ),
                ref_columns: split_list(row.try_get::<&str, _>(4).ok().flatten()),
                on_delete: row.try_get::<&str, _>(5).ok().flatten().unwrap_or("NO_ACTION").to_string(),
                on_update: row.try_get::<&str, _>(6).ok().flatten().unwrap_or("NO_ACTION").to_string(),
            };
            if fk.columns.is_empty() || fk.columns.len() != fk.ref_columns.len() {
                return Err(MigrateError::Introspection {
                    schema: table.name.schema.clone(),
                    message: format!("foreign key {} on {} has mismatched column lists", fk.name, table.name),
                });
            }
            table.foreign_keys.push(fk);
        }

        debug!("Loaded {} foreign keys for {}", table.foreign_keys.len(), table.name);
        Ok(())
    }

    async fn load_row_count(&self, client: &mut TdsClient, table: &mut Table) -> Result<()> {
        // Fast approximate count from partition stats
        let query = r#"
            SELECT CAST(SUM(p.rows) AS BIGINT)
            FROM sys.partitions p
            JOIN sys.tables t ON p.object_id = t.object_id
            JOIN sys.schemas s ON t.schema_id = s.schema_id
            WHERE s.name = @P1 AND t.name = @P2 AND p.index_id IN (0, 1)
        "#;

        let mut query = Query::new(query);
        query.bind(table.name.schema.as_str());
        query.bind(table.name.name.as_str());
        let row = query.query(client).await?.into_row().await?;

        table.row_count = row
            .and_then(|r| r.try_get::<i64, _>(0).ok().flatten())
            .unwrap_or(0);
        Ok(())
    }

    async fn load_views(&self, client: &mut TdsClient, schema: &str) -> Result<Vec<ViewDefinition>> {
        let query = r#"
            SELECT s.name, v.name, m.definition
            FROM sys.views v
            JOIN sys.schemas s ON v.schema_id = s.schema_id
            JOIN sys.sql_modules m ON m.object_id = v.object_id
            WHERE s.name = @P1
            ORDER BY v.name
        "#;

        let mut q = Query::new(query);
        q.bind(schema);
        let rows = q.query(client).await?.into_first_result().await?;

        let mut views = Vec::with_capacity(rows.len());
        for row in rows {
            let name = QualifiedName::new(required_str(&row, 0, schema)?, required_str(&row, 1, schema)?);
            match row.try_get::<&str, _>(2).ok().flatten() {
                Some(definition) => views.push(ViewDefinition {
                    name,
                    definition: definition.to_string(),
                }),
                // Encrypted views have no readable definition
                None => warn!("View {} has no readable definition, skipping", name),
            }
        }
        Ok(views)
    }

    /// Read one schema's tables and views into `metadata`.
    async fn read_one_schema(&self, schema: &str, metadata: &mut SchemaMetadata) -> Result<()> {
        let mut client = self.get_client().await?;

        let mut tables = self.list_tables(&mut client, schema).await?;
        for table in &mut tables {
            self.load_columns(&mut client, table).await?;
            self.load_key_constraints(&mut client, table).await?;
            self.load_indexes(&mut client, table).await?;
            self.load_foreign_keys(&mut client, table).await?;
            self.load_row_count(&mut client, table).await?;
        }
        let views = self.load_views(&mut client, schema).await?;

        info!(
            "Read schema '{}': {} tables, {} views",
            schema,
            tables.len(),
            views.len()
        );
        for table in tables {
            metadata.insert(table);
        }
        metadata.views.extend(views);
        Ok(())
    }

    fn page_sql(table: &Table, key: &[String], offset: i64, limit: usize) -> String {
        let cols: Vec<String> = table.columns.iter().map(|c| bracket(&c.name)).collect();
        let order: Vec<String> = key.iter().map(|k| bracket(k)).collect();
        format!(
            "SELECT {} FROM {}.{} ORDER BY {} OFFSET {} ROWS FETCH NEXT {} ROWS ONLY",
            cols.join(", "),
            bracket(&table.name.schema),
            bracket(&table.name.name),
            order.join(", "),
            offset,
            limit
        )
    }

    fn scan_sql(table: &Table, custom_query: Option<&str>) -> String {
        if let Some(custom) = custom_query {
            return custom.trim().trim_end_matches(';').to_string();
        }
        let cols: Vec<String> = table.columns.iter().map(|c| bracket(&c.name)).collect();
        let mut sql = format!(
            "SELECT {} FROM {}.{}",
            cols.join(", "),
            bracket(&table.name.schema),
            bracket(&table.name.name)
        );
        let order: Vec<String> = table.orderable_columns().into_iter().map(bracket).collect();
        if !order.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
        }
        sql
    }
}

/// Convert one row into `batch`, or record it as rejected at `position`.
fn push_row(batch: &mut Batch, row: Row, position: i64) {
    batch.fetched += 1;
    match convert_row(row) {
        Ok(values) => batch.rows.push(values),
        Err(message) => batch.rejected.push(RejectedRow { position, message }),
    }
}

#[async_trait]
impl SourcePool for MssqlPool {
    async fn read_schema(&self, schemas: &[String]) -> Result<SchemaMetadata> {
        let mut metadata = SchemaMetadata::default();

        for schema in schemas {
            if let Err(e) = self.read_one_schema(schema, &mut metadata).await {
                if e.is_connection_error() {
                    return Err(e);
                }
                warn!("Introspection of schema '{}' failed: {}", schema, e);
                // Drop anything partially read from this schema
                metadata.retain_tables(|name| &name.schema != schema);
                metadata.views.retain(|v| &v.name.schema != schema);
                metadata.failed_schemas.push(SchemaFailure {
                    schema: schema.clone(),
                    message: e.to_string(),
                });
            }
        }

        metadata.views.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(metadata)
    }

    async fn row_count(&self, table: &Table) -> Result<i64> {
        let mut client = self.get_client().await?;

        let query = format!(
            "SELECT COUNT_BIG(*) FROM {}.{}",
            bracket(&table.name.schema),
            bracket(&table.name.name)
        );
        let row = client.simple_query(query).await?.into_row().await?;

        Ok(row
            .and_then(|r| r.try_get::<i64, _>(0).ok().flatten())
            .unwrap_or(0))
    }

    async fn fetch_batch(
        &self,
        table: &Table,
        key: &[String],
        offset: i64,
        limit: usize,
    ) -> Result<Batch> {
        let mut client = self.get_client().await?;
        let sql = Self::page_sql(table, key, offset, limit);
        let rows = client.simple_query(sql).await?.into_first_result().await?;

        let mut batch = Batch {
            rows: Vec::with_capacity(rows.len()),
            ..Batch::default()
        };
        for (i, row) in rows.into_iter().enumerate() {
            push_row(&mut batch, row, offset + i as i64);
        }
        Ok(batch)
    }

    async fn stream_rows(
        &self,
        table: &Table,
        custom_query: Option<&str>,
        batch_size: usize,
        tx: mpsc::Sender<Batch>,
    ) -> Result<()> {
        let batch_size = batch_size.max(1);
        let mut client = self.get_client().await?;
        let sql = Self::scan_sql(table, custom_query);
        debug!("Single-pass read of {}", table.name);

        let mut stream = client.simple_query(sql).await?.into_row_stream();
        let mut batch = Batch::default();
        let mut position = 0i64;

        while let Some(row) = stream.try_next().await? {
            push_row(&mut batch, row, position);
            position += 1;
            if batch.fetched >= batch_size && tx.send(std::mem::take(&mut batch)).await.is_err() {
                // Receiver gone: the copy was cancelled or failed
                return Ok(());
            }
        }

        if batch.fetched > 0 {
            let _ = tx.send(batch).await;
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut client = self.get_client().await?;
        client.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "mssql"
    }
}

/// Bracket-quote a SQL Server identifier.
fn bracket(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn required_str(row: &Row, idx: usize, schema: &str) -> Result<String> {
    match row.try_get::<&str, _>(idx) {
        Ok(Some(value)) => Ok(value.to_string()),
        Ok(None) => Err(MigrateError::Introspection {
            schema: schema.to_string(),
            message: format!("catalog column {} was NULL", idx),
        }),
        Err(e) => Err(MigrateError::Introspection {
            schema: schema.to_string(),
            message: format!("catalog column {} has an unexpected type: {}", idx, e),
        }),
    }
}

/// Convert every value of a row, failing the row on the first bad value.
fn convert_row(row: Row) -> std::result::Result<Vec<SqlValue>, String> {
    row.into_iter()
        .enumerate()
        .map(|(idx, data)| {
            convert_value(&data).map_err(|e| format!("column {}: {}", idx + 1, e))
        })
        .collect()
}

fn convert_value(data: &ColumnData<'static>) -> std::result::Result<SqlValue, tiberius::error::Error> {
    let value = match data {
        ColumnData::U8(v) => v
            .map(|v| SqlValue::I16(v as i16))
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        ColumnData::I16(v) => v.map(SqlValue::I16).unwrap_or(SqlValue::Null(SqlNullType::I16)),
        ColumnData::I32(v) => v.map(SqlValue::I32).unwrap_or(SqlValue::Null(SqlNullType::I32)),
        ColumnData::I64(v) => v.map(SqlValue::I64).unwrap_or(SqlValue::Null(SqlNullType::I64)),
        ColumnData::F32(v) => v.map(SqlValue::F32).unwrap_or(SqlValue::Null(SqlNullType::F32)),
        ColumnData::F64(v) => v.map(SqlValue::F64).unwrap_or(SqlValue::Null(SqlNullType::F64)),
        ColumnData::Bit(v) => v.map(SqlValue::Bool).unwrap_or(SqlValue::Null(SqlNullType::Bool)),
        ColumnData::String(v) => v
            .as_ref()
            .map(|s| SqlValue::String(s.to_string()))
            .unwrap_or(SqlValue::Null(SqlNullType::String)),
        ColumnData::Guid(v) => v.map(SqlValue::Uuid).unwrap_or(SqlValue::Null(SqlNullType::Uuid)),
        ColumnData::Binary(v) => v
            .as_ref()
            .map(|b| SqlValue::Bytes(b.to_vec()))
            .unwrap_or(SqlValue::Null(SqlNullType::Bytes)),
        ColumnData::Xml(v) => v
            .as_ref()
            .map(|x| SqlValue::String(x.clone().into_owned().into_string()))
            .unwrap_or(SqlValue::Null(SqlNullType::String)),
        ColumnData::Numeric(_) => Decimal::from_sql(data)?
            .map(SqlValue::Decimal)
            .unwrap_or(SqlValue::Null(SqlNullType::Decimal)),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(data)?
                .map(SqlValue::DateTime)
                .unwrap_or(SqlValue::Null(SqlNullType::DateTime))
        }
        ColumnData::Date(_) => NaiveDate::from_sql(data)?
            .map(SqlValue::Date)
            .unwrap_or(SqlValue::Null(SqlNullType::Date)),
        ColumnData::Time(_) => NaiveTime::from_sql(data)?
            .map(SqlValue::Time)
            .unwrap_or(SqlValue::Null(SqlNullType::Time)),
        ColumnData::DateTimeOffset(_) => DateTime::<FixedOffset>::from_sql(data)?
            .map(SqlValue::DateTimeOffset)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTimeOffset)),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    fn make_test_table() -> Table {
        let mut table = Table::new(QualifiedName::new("dbo", "Order Lines"));
        for (i, (name, dt)) in [("id", "int"), ("sku", "varchar"), ("notes", "ntext")]
            .iter()
            .enumerate()
        {
            table.columns.push(Column {
                name: name.to_string(),
                data_type: dt.to_string(),
                max_length: 50,
                precision: 0,
                scale: 0,
                is_nullable: true,
                default: None,
                is_identity: false,
                ordinal_pos: i as i32 + 1,
            });
        }
        table
    }

    #[test]
    fn test_page_sql_orders_by_key() {
        let table = make_test_table();
        let sql = MssqlPool::page_sql(&table, &["id".to_string()], 2000, 1000);
        assert_eq!(
            sql,
            "SELECT [id], [sku], [notes] FROM [dbo].[Order Lines] ORDER BY [id] OFFSET 2000 ROWS FETCH NEXT 1000 ROWS ONLY"
        );
    }

    #[test]
    fn test_scan_sql_without_keys_skips_lob_columns() {
        let table = make_test_table();
        let sql = MssqlPool::scan_sql(&table, None);
        assert_eq!(
            sql,
            "SELECT [id], [sku], [notes] FROM [dbo].[Order Lines] ORDER BY [id], [sku]"
        );
    }

    #[test]
    fn test_scan_sql_runs_custom_query_unpaged() {
        let table = make_test_table();
        let sql = MssqlPool::scan_sql(&table, Some("SELECT id, sku FROM dbo.Lines WHERE active = 1;"));
        assert_eq!(sql, "SELECT id, sku FROM dbo.Lines WHERE active = 1");
        assert!(!sql.contains("OFFSET"));
    }

    #[test]
    fn test_bracket_escapes_closing_bracket() {
        assert_eq!(bracket("we]ird"), "[we]]ird]");
    }

    #[test]
    fn test_convert_value_nulls_keep_type_hint() {
        let value = convert_value(&ColumnData::I32(None)).unwrap();
        assert!(matches!(value, SqlValue::Null(SqlNullType::I32)));

        let value = convert_value(&ColumnData::String(Some(Cow::Borrowed("abc")))).unwrap();
        assert_eq!(value, SqlValue::String("abc".into()));

        let value = convert_value(&ColumnData::U8(Some(7))).unwrap();
        assert_eq!(value, SqlValue::I16(7));
    }
}
