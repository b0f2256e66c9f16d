//! Post-load row-count comparison between source and target.

use crate::copier::CopyResult;
use crate::error::Result;
use crate::plan::{MigrationPlan, TablePlan};
use crate::report::{ErrorKind, ErrorScope, RecordedError, TableStatus};
use crate::source::{QualifiedName, SourcePool};
use crate::target::TargetPool;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source and target row counts for one loaded table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowCountCheck {
    pub table: QualifiedName,
    pub target: QualifiedName,
    pub source_rows: i64,
    pub target_rows: i64,
}

impl RowCountCheck {
    pub fn matches(&self) -> bool {
        self.source_rows == self.target_rows
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub checks: Vec<RowCountCheck>,
    pub errors: Vec<RecordedError>,
}

impl ValidationOutcome {
    pub fn mismatches(&self) -> impl Iterator<Item = &RowCountCheck> {
        self.checks.iter().filter(|c| !c.matches())
    }
}

/// Compare exact row counts for every table whose copy completed.
///
/// Skipped tables and tables read through a custom query are not compared:
/// their target contents are not meant to mirror the source table. A count
/// that cannot be read is recorded and the remaining tables are still checked.
pub async fn validate_row_counts(
    source: &dyn SourcePool,
    target: &dyn TargetPool,
    plan: &MigrationPlan,
    results: &[CopyResult],
    cancel: &CancellationToken,
) -> ValidationOutcome {
    let mut outcome = ValidationOutcome::default();

    for result in results.iter().filter(|r| r.status == TableStatus::Completed) {
        if cancel.is_cancelled() {
            break;
        }
        let Some(table) = plan.table(&result.table) else {
            continue;
        };
        if table.custom_query.is_some() {
            debug!("{}: custom query, row counts not compared", result.table);
            continue;
        }

        let (source_rows, target_rows) = match count_both(source, target, table).await {
            Ok(counts) => counts,
            Err(e) => {
                warn!("{}: could not compare row counts: {}", result.table, e);
                outcome.errors.push(RecordedError::new(
                    ErrorScope::Table,
                    result.table.to_string(),
                    ErrorKind::Validation,
                    format!("could not compare row counts: {}", e),
                ));
                continue;
            }
        };

        let check = RowCountCheck {
            table: result.table.clone(),
            target: table.target_qualified(),
            source_rows,
            target_rows,
        };
        if !check.matches() {
            warn!(
                "{}: row count mismatch: source={}, target={}",
                check.table, source_rows, target_rows
            );
            outcome.errors.push(RecordedError::new(
                ErrorScope::Table,
                check.table.to_string(),
                ErrorKind::Validation,
                format!("row count mismatch: source={}, target={}", source_rows, target_rows),
            ));
        }
        outcome.checks.push(check);
    }

    info!(
        "Validated {} tables, {} mismatched",
        outcome.checks.len(),
        outcome.mismatches().count()
    );
    outcome
}

async fn count_both(source: &dyn SourcePool, target: &dyn TargetPool, table: &TablePlan) -> Result<(i64, i64)> {
    let source_rows = source.row_count(&table.source).await?;
    let target_rows = target.row_count(&table.target_schema, &table.target_name).await?;
    Ok((source_rows, target_rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_check(name: &str, source_rows: i64, target_rows: i64) -> RowCountCheck {
        RowCountCheck {
            table: QualifiedName::new("dbo", name),
            target: QualifiedName::new("public", name),
            source_rows,
            target_rows,
        }
    }

    #[test]
    fn test_mismatches_only_lists_unequal_counts() {
        let outcome = ValidationOutcome {
            checks: vec![
                make_test_check("Customers", 3, 3),
                make_test_check("Orders", 5, 4),
                make_test_check("Empty", 0, 0),
            ],
            errors: Vec::new(),
        };
        let names: Vec<&str> = outcome.mismatches().map(|c| c.table.name.as_str()).collect();
        assert_eq!(names, vec!["Orders"]);
    }
}
