//! Target schema and table creation.

use crate::error::{MigrateError, Result};
use crate::plan::{CopyStrategy, MigrationPlan, TablePlan};
use crate::report::{ErrorKind, ErrorScope, RecordedError};
use crate::source::QualifiedName;
use crate::target::TargetPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of creating one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedTable {
    /// Source name of the table.
    pub table: QualifiedName,
    /// The table was already on the target and was kept.
    pub existed: bool,
    pub strategy: CopyStrategy,
    /// Rows already in a kept table that has no primary key.
    pub keyless_rows: Option<i64>,
}

impl CreatedTable {
    /// Report entry for a kept table skipped because it holds rows and has no
    /// primary key. Without `drop_existing` every later run skips it as well.
    pub fn keyless_warning(&self) -> Option<RecordedError> {
        let rows = self.keyless_rows?;
        Some(RecordedError::new(
            ErrorScope::Table,
            self.table.to_string(),
            ErrorKind::SchemaCreation,
            format!(
                "existing target table has {} rows and no primary key, so no rows were copied; \
                 re-run with drop_existing to reload it",
                rows
            ),
        ))
    }
}

/// Creates schemas and tables on the target.
pub struct SchemaBuilder<'a> {
    target: &'a dyn TargetPool,
    drop_existing: bool,
}

impl<'a> SchemaBuilder<'a> {
    pub fn new(target: &'a dyn TargetPool, drop_existing: bool) -> Self {
        Self {
            target,
            drop_existing,
        }
    }

    pub async fn create_schema(&self, name: &str) -> Result<()> {
        self.target
            .create_schema(name)
            .await
            .map_err(|e| MigrateError::schema_creation(name, e.to_string()))
    }

    /// Create a table and decide how its rows will be written.
    ///
    /// Without `drop_existing` an existing table is left as it is: rows go in
    /// with conflicts ignored when it has a primary key, and are not copied at
    /// all when it has no key but already holds data.
    pub async fn create_table(&self, plan: &TablePlan) -> Result<CreatedTable> {
        let name = plan.name().to_string();
        self.create_table_inner(plan)
            .await
            .map_err(|e| match e {
                MigrateError::SchemaCreation { .. } => e,
                other => MigrateError::schema_creation(&name, other.to_string()),
            })
    }

    async fn create_table_inner(&self, plan: &TablePlan) -> Result<CreatedTable> {
        let schema = &plan.target_schema;
        let table = &plan.target_name;

        let mut existed = self.target.table_exists(schema, table).await?;
        if existed && self.drop_existing {
            info!("Dropping existing table {}.{}", schema, table);
            self.target.drop_table(schema, table).await?;
            existed = false;
        }

        if !existed {
            debug!("Creating table {}.{}", schema, table);
            self.target.create_table(plan).await?;
        }

        let mut keyless_rows = None;
        let strategy = if plan.skip_migration {
            CopyStrategy::Skip("skip_migration is set in the schema definition".to_string())
        } else if !existed {
            CopyStrategy::Bulk
        } else if self.target.has_primary_key(schema, table).await? {
            CopyStrategy::InsertIgnore
        } else {
            let rows = self.target.row_count(schema, table).await?;
            if rows > 0 {
                warn!(
                    "Table {}.{} already has {} rows and no primary key; skipping it (use drop_existing to reload)",
                    schema, table, rows
                );
                keyless_rows = Some(rows);
                CopyStrategy::Skip(format!(
                    "existing table has {} rows and no primary key",
                    rows
                ))
            } else {
                CopyStrategy::Bulk
            }
        };

        if existed {
            debug!(
                "Table {}.{} already exists, strategy {}",
                schema,
                table,
                strategy.as_str()
            );
        }

        Ok(CreatedTable {
            table: plan.name().clone(),
            existed,
            strategy,
            keyless_rows,
        })
    }

    /// Create every target schema in the plan.
    pub async fn create_schemas(&self, plan: &MigrationPlan) -> Vec<RecordedError> {
        let mut errors = Vec::new();
        for schema in plan.target_schemas() {
            info!("Creating schema '{}'", schema);
            if let Err(e) = self.create_schema(&schema).await {
                warn!("{}", e);
                errors.push(RecordedError::from_error(ErrorScope::Schema, &schema, &e));
            }
        }
        errors
    }

    /// Create every table in creation order. A failed table is recorded and
    /// left out of the returned list.
    pub async fn create_tables(
        &self,
        plan: &MigrationPlan,
        cancel: &CancellationToken,
    ) -> (Vec<CreatedTable>, Vec<RecordedError>) {
        let mut created = Vec::with_capacity(plan.tables.len());
        let mut errors = Vec::new();

        for table in &plan.tables {
            if cancel.is_cancelled() {
                break;
            }
            match self.create_table(table).await {
                Ok(t) => created.push(t),
                Err(e) => {
                    warn!("{}", e);
                    errors.push(RecordedError::from_error(
                        ErrorScope::Table,
                        table.name().to_string(),
                        &e,
                    ));
                }
            }
        }

        (created, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_created(keyless_rows: Option<i64>) -> CreatedTable {
        CreatedTable {
            table: QualifiedName::new("dbo", "Legacy"),
            existed: true,
            strategy: CopyStrategy::Skip("existing table has 4 rows and no primary key".into()),
            keyless_rows,
        }
    }

    #[test]
    fn test_keyless_warning_names_the_remedy() {
        let warning = make_test_created(Some(4)).keyless_warning().unwrap();
        assert_eq!(warning.identifier, "dbo.Legacy");
        assert_eq!(warning.scope, ErrorScope::Table);
        assert!(warning.message.contains("4 rows"));
        assert!(warning.message.contains("drop_existing"));

        assert!(make_test_created(None).keyless_warning().is_none());
    }
}
