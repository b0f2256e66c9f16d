//! PostgreSQL target database operations.

mod sql;
mod tls;

pub use sql::*;
pub use tls::SslMode;

use crate::config::TargetConfig;
use crate::error::{MigrateError, Result};
use crate::plan::TablePlan;
use crate::schema_def::NewColumn;
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::{debug, info};

/// Rows per INSERT statement inside one batch transaction.
const ROWS_PER_STATEMENT: usize = 500;

/// Whether an idempotent DDL call did any work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStatus {
    Created,
    AlreadyPresent,
}

/// Trait for target database operations.
#[async_trait]
pub trait TargetPool: Send + Sync {
    /// Round-trip a trivial query.
    async fn ping(&self) -> Result<()>;

    /// Create a schema if it doesn't exist.
    async fn create_schema(&self, schema: &str) -> Result<()>;

    /// Check if a table exists.
    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool>;

    /// Drop a table if it exists, cascading to dependent objects.
    async fn drop_table(&self, schema: &str, table: &str) -> Result<()>;

    /// Create a table from its plan. Must be a no-op if the table exists.
    async fn create_table(&self, plan: &TablePlan) -> Result<()>;

    /// Check if a table has a primary key.
    async fn has_primary_key(&self, schema: &str, table: &str) -> Result<bool>;

    /// Get the row count for a table.
    async fn row_count(&self, schema: &str, table: &str) -> Result<i64>;

    /// Column names currently on the table, in ordinal order.
    async fn existing_columns(&self, schema: &str, table: &str) -> Result<Vec<String>>;

    /// Add a column if it is not already there.
    async fn add_column(&self, schema: &str, table: &str, column: &NewColumn) -> Result<()>;

    /// Insert rows in a single transaction. Returns rows actually inserted.
    async fn write_batch(&self, target: &WriteTarget, rows: &[Vec<SqlValue>]) -> Result<u64>;

    /// Apply a constraint or index unless one with that name already exists.
    async fn apply_constraint(
        &self,
        schema: &str,
        table: &str,
        constraint: &TargetConstraint,
    ) -> Result<ApplyStatus>;

    /// Move an identity column's sequence past the highest copied value.
    async fn reset_identity(&self, schema: &str, table: &str, column: &str) -> Result<()>;

    /// Create or replace a view.
    async fn create_view(&self, schema: &str, name: &str, sql: &str) -> Result<()>;

    /// Get the database type.
    fn db_type(&self) -> &str;
}

/// PostgreSQL target pool implementation.
pub struct PgPool {
    pool: Pool,
}

impl PgPool {
    /// Create a new pool and verify that a connection can be opened.
    pub async fn new(config: &TargetConfig, max_conns: usize) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.application_name("schemashift");

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = match SslMode::parse(&config.ssl_mode)?.connector()? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => Manager::from_config(pg_config, NoTls, mgr_config),
        };
        let pool = Pool::builder(mgr)
            .max_size(max_conns.max(1))
            .build()
            .map_err(|e| MigrateError::Config(format!("invalid PostgreSQL pool settings: {}", e)))?;

        let target = Self { pool };
        target.ping().await.map_err(|e| {
            MigrateError::Connectivity(format!(
                "cannot reach PostgreSQL at {}:{}: {}",
                config.host, config.port, e
            ))
        })?;

        info!(
            "Connected to PostgreSQL: {}:{}/{} (pool_size={})",
            config.host, config.port, config.database, max_conns
        );

        Ok(target)
    }

    async fn client(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "getting PostgreSQL connection"))
    }

    async fn constraint_exists(&self, client: &Object, schema: &str, table: &str, constraint: &TargetConstraint) -> Result<bool> {
        let row = match constraint {
            // A table has at most one primary key, whatever its name
            TargetConstraint::PrimaryKey { .. } => {
                client
                    .query_opt(
                        "SELECT 1 FROM pg_constraint c
                         JOIN pg_class t ON t.oid = c.conrelid
                         JOIN pg_namespace n ON n.oid = t.relnamespace
                         WHERE n.nspname = $1 AND t.relname = $2 AND c.contype = 'p'",
                        &[&schema, &table],
                    )
                    .await?
            }
            TargetConstraint::Index { name, .. } => {
                client
                    .query_opt(
                        "SELECT 1 FROM pg_indexes WHERE schemaname = $1 AND indexname = $2",
                        &[&schema, &name.as_str()],
                    )
                    .await?
            }
            TargetConstraint::Unique { name, .. } | TargetConstraint::ForeignKey { name, .. } => {
                client
                    .query_opt(
                        "SELECT 1 FROM pg_constraint c
                         JOIN pg_class t ON t.oid = c.conrelid
                         JOIN pg_namespace n ON n.oid = t.relnamespace
                         WHERE n.nspname = $1 AND t.relname = $2 AND c.conname = $3",
                        &[&schema, &table, &name.as_str()],
                    )
                    .await?
            }
        };
        Ok(row.is_some())
    }
}

#[async_trait]
impl TargetPool for PgPool {
    async fn ping(&self) -> Result<()> {
        let client = self.client().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn create_schema(&self, schema: &str) -> Result<()> {
        let client = self.client().await?;
        let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema));
        client.batch_execute(&sql).await?;

        debug!("Created schema '{}'", schema);
        Ok(())
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2)",
                &[&schema, &table],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn drop_table(&self, schema: &str, table: &str) -> Result<()> {
        let client = self.client().await?;
        let sql = format!("DROP TABLE IF EXISTS {} CASCADE", qualify_table(schema, table));
        client.batch_execute(&sql).await?;

        debug!("Dropped table {}.{}", schema, table);
        Ok(())
    }

    async fn create_table(&self, plan: &TablePlan) -> Result<()> {
        let client = self.client().await?;
        client.batch_execute(&plan.ddl).await?;

        debug!("Created table {}.{}", plan.target_schema, plan.target_name);
        Ok(())
    }

    async fn has_primary_key(&self, schema: &str, table: &str) -> Result<bool> {
        let client = self.client().await?;
        let pk = TargetConstraint::PrimaryKey {
            name: String::new(),
            columns: Vec::new(),
        };
        self.constraint_exists(&client, schema, table, &pk).await
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<i64> {
        let client = self.client().await?;
        let sql = format!("SELECT COUNT(*) FROM {}", qualify_table(schema, table));
        let row = client.query_one(&sql, &[]).await?;
        Ok(row.get(0))
    }

    async fn existing_columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT column_name::text FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[&schema, &table],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn add_column(&self, schema: &str, table: &str, column: &NewColumn) -> Result<()> {
        let client = self.client().await?;
        let mut sql = format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
            qualify_table(schema, table),
            quote_ident(&column.name),
            column.sql_type
        );
        if let Some(default) = &column.default {
            sql.push_str(&format!(" DEFAULT {}", default));
        }
        if !column.nullable {
            sql.push_str(" NOT NULL");
        }
        client.batch_execute(&sql).await?;

        if let Some(description) = &column.description {
            let comment = format!(
                "COMMENT ON COLUMN {}.{} IS '{}'",
                qualify_table(schema, table),
                quote_ident(&column.name),
                escape_sql_string(description)
            );
            client.batch_execute(&comment).await?;
        }

        debug!("Added column {} to {}.{}", column.name, schema, table);
        Ok(())
    }

    async fn write_batch(&self, target: &WriteTarget, rows: &[Vec<SqlValue>]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut client = self.client().await?;
        let tx = client.transaction().await?;

        let mut inserted = 0u64;
        for chunk in rows.chunks(ROWS_PER_STATEMENT) {
            let sql = build_insert_sql_literals(target, chunk);
            inserted += tx.execute(sql.as_str(), &[]).await?;
        }
        tx.commit().await?;

        Ok(inserted)
    }

    async fn apply_constraint(
        &self,
        schema: &str,
        table: &str,
        constraint: &TargetConstraint,
    ) -> Result<ApplyStatus> {
        let client = self.client().await?;
        if self.constraint_exists(&client, schema, table, constraint).await? {
            debug!("{} {} already exists on {}.{}", constraint.kind(), constraint.name(), schema, table);
            return Ok(ApplyStatus::AlreadyPresent);
        }

        client.batch_execute(&constraint.to_sql(schema, table)).await?;

        debug!("Created {} {} on {}.{}", constraint.kind(), constraint.name(), schema, table);
        Ok(ApplyStatus::Created)
    }

    async fn reset_identity(&self, schema: &str, table: &str, column: &str) -> Result<()> {
        let client = self.client().await?;
        client
            .query_one(reset_identity_sql(schema, table, column).as_str(), &[])
            .await?;

        debug!("Reset identity for {}.{}.{}", schema, table, column);
        Ok(())
    }

    async fn create_view(&self, schema: &str, name: &str, sql: &str) -> Result<()> {
        let client = self.client().await?;
        let ddl = format!("CREATE OR REPLACE VIEW {} AS\n{}", qualify_table(schema, name), sql);
        client.batch_execute(&ddl).await?;

        debug!("Created view {}.{}", schema, name);
        Ok(())
    }

    fn db_type(&self) -> &str {
        "postgres"
    }
}
