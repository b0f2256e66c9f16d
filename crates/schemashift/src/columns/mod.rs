//! Additive column synchronization.

use crate::plan::TablePlan;
use crate::report::{ErrorKind, ErrorScope, RecordedError};
use crate::schema_def::{append_added_columns, NewColumn};
use crate::source::QualifiedName;
use crate::target::TargetPool;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A column added to a target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddedColumn {
    /// Source table the declaration belongs to.
    pub table: QualifiedName,
    /// Target table that was altered.
    pub target: QualifiedName,
    pub column: NewColumn,
}

#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub added: Vec<AddedColumn>,
    pub errors: Vec<RecordedError>,
}

impl SyncOutcome {
    fn merge(&mut self, other: SyncOutcome) {
        self.added.extend(other.added);
        self.errors.extend(other.errors);
    }
}

/// Adds declared columns that the target tables do not have yet.
pub struct ColumnSynchronizer<'a> {
    target: &'a dyn TargetPool,
}

impl<'a> ColumnSynchronizer<'a> {
    pub fn new(target: &'a dyn TargetPool) -> Self {
        Self { target }
    }

    /// Add each declared column unless a column with that name (compared
    /// case-insensitively) already exists. Never drops or alters a column.
    pub async fn synchronize(&self, plan: &TablePlan, declared: &[NewColumn]) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        if declared.is_empty() {
            return outcome;
        }

        let schema = &plan.target_schema;
        let table = &plan.target_name;
        let mut existing = match self.target.existing_columns(schema, table).await {
            Ok(cols) => cols,
            Err(e) => {
                warn!("{}: cannot read target columns: {}", plan.name(), e);
                outcome.errors.push(RecordedError::new(
                    ErrorScope::Table,
                    plan.name().to_string(),
                    ErrorKind::Column,
                    format!("cannot read target columns: {}", e),
                ));
                return outcome;
            }
        };

        for column in declared {
            if existing.iter().any(|c| c.eq_ignore_ascii_case(&column.name)) {
                debug!("{}.{}: column {} already present", schema, table, column.name);
                continue;
            }

            match self.target.add_column(schema, table, column).await {
                Ok(()) => {
                    info!("Added column {} {} to {}.{}", column.name, column.sql_type, schema, table);
                    existing.push(column.name.clone());
                    outcome.added.push(AddedColumn {
                        table: plan.name().clone(),
                        target: plan.target_qualified(),
                        column: column.clone(),
                    });
                }
                Err(e) => {
                    let identifier = format!("{}.{}", plan.name(), column.name);
                    warn!("Failed to add column {}: {}", identifier, e);
                    outcome.errors.push(RecordedError::new(
                        ErrorScope::Column,
                        identifier,
                        ErrorKind::Column,
                        e.to_string(),
                    ));
                }
            }
        }

        outcome
    }

    /// Synchronize every table with declared columns, then record what was
    /// added in the schema-definition artifact, if one is configured.
    pub async fn synchronize_all<'p, I>(
        &self,
        plans: I,
        artifact: Option<&Path>,
        cancel: &CancellationToken,
    ) -> SyncOutcome
    where
        I: IntoIterator<Item = &'p TablePlan>,
    {
        let mut outcome = SyncOutcome::default();
        for plan in plans {
            if cancel.is_cancelled() {
                break;
            }
            outcome.merge(self.synchronize(plan, &plan.new_columns).await);
        }

        if let Some(path) = artifact {
            let mut by_table: BTreeMap<QualifiedName, Vec<NewColumn>> = BTreeMap::new();
            for added in &outcome.added {
                by_table
                    .entry(added.table.clone())
                    .or_default()
                    .push(added.column.clone());
            }
            if let Err(e) = append_added_columns(path, &by_table) {
                warn!("Could not update schema definition file {}: {}", path.display(), e);
                outcome.errors.push(RecordedError::new(
                    ErrorScope::Column,
                    path.display().to_string(),
                    ErrorKind::Other,
                    format!("schema definition file not updated: {}", e),
                ));
            }
        }

        outcome
    }
}
