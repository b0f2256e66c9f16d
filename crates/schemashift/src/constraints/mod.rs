//! Post-load constraints and indexes.
//!
//! Applied in four passes: primary keys, unique constraints, indexes, then
//! foreign keys. Indexes run with bounded concurrency; everything else runs
//! in data order, one statement at a time.

use crate::error::MigrateError;
use crate::plan::{MigrationPlan, TablePlan};
use crate::report::{ErrorScope, RecordedError};
use crate::source::QualifiedName;
use crate::target::{truncate_identifier, ApplyStatus, TargetConstraint, TargetPool};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintStatus {
    Created,
    AlreadyPresent,
    Failed,
    Skipped,
}

/// Outcome for one constraint or index.
#[derive(Debug, Clone, Serialize)]
pub struct ConstraintOutcome {
    /// Source table.
    pub table: QualifiedName,
    pub constraint: String,
    pub kind: String,
    pub status: ConstraintStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConstraintReport {
    pub outcomes: Vec<ConstraintOutcome>,
    pub errors: Vec<RecordedError>,
}

impl ConstraintReport {
    pub fn count(&self, status: ConstraintStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    fn push(&mut self, plan: &TablePlan, constraint: &TargetConstraint, status: ConstraintStatus, message: Option<String>) {
        if let Some(msg) = &message {
            if matches!(status, ConstraintStatus::Failed | ConstraintStatus::Skipped) {
                let err = MigrateError::constraint(plan.name().to_string(), constraint.name(), msg.clone());
                warn!("{}", err);
                self.errors.push(RecordedError::from_error(
                    ErrorScope::Constraint,
                    format!("{}.{}", plan.name(), constraint.name()),
                    &err,
                ));
            }
        }
        self.outcomes.push(ConstraintOutcome {
            table: plan.name().clone(),
            constraint: constraint.name().to_string(),
            kind: constraint.kind().to_string(),
            status,
            message,
        });
    }
}

/// Applies constraints and indexes after the data load.
pub struct ConstraintApplier {
    target: Arc<dyn TargetPool>,
    workers: usize,
}

impl ConstraintApplier {
    pub fn new(target: Arc<dyn TargetPool>, workers: usize) -> Self {
        Self {
            target,
            workers: workers.max(1),
        }
    }

    /// Apply constraints for the tables in `tables` (source names), walking
    /// the plan in data order. Foreign keys whose parent is not in `tables`
    /// are skipped and recorded.
    pub async fn apply_constraints(
        &self,
        plan: &MigrationPlan,
        tables: &BTreeSet<QualifiedName>,
        cancel: &CancellationToken,
    ) -> ConstraintReport {
        let mut report = ConstraintReport::default();
        let ordered: Vec<&TablePlan> = plan
            .resolution
            .data_order
            .iter()
            .filter(|name| tables.contains(*name))
            .filter_map(|name| plan.table(name))
            .collect();

        // Primary keys
        for table in &ordered {
            if cancel.is_cancelled() {
                return report;
            }
            if let Some(pk) = primary_key(table) {
                self.apply_one(table, &pk, &mut report).await;
            }
        }

        // Unique constraints
        for table in &ordered {
            if cancel.is_cancelled() {
                return report;
            }
            for uq in unique_constraints(table) {
                self.apply_one(table, &uq, &mut report).await;
            }
        }

        // Indexes
        if cancel.is_cancelled() {
            return report;
        }
        self.apply_indexes(&ordered, &mut report).await;

        // Foreign keys
        for table in &ordered {
            for fk in &table.source.foreign_keys {
                if cancel.is_cancelled() {
                    return report;
                }
                match foreign_key(plan, tables, table, fk) {
                    Ok(constraint) => self.apply_one(table, &constraint, &mut report).await,
                    Err((constraint, reason)) => {
                        report.push(table, &constraint, ConstraintStatus::Skipped, Some(reason));
                    }
                }
            }
        }

        info!(
            "Constraints: {} created, {} already present, {} failed, {} skipped",
            report.count(ConstraintStatus::Created),
            report.count(ConstraintStatus::AlreadyPresent),
            report.count(ConstraintStatus::Failed),
            report.count(ConstraintStatus::Skipped)
        );
        report
    }

    async fn apply_one(&self, table: &TablePlan, constraint: &TargetConstraint, report: &mut ConstraintReport) {
        debug!("Applying {} {} on {}", constraint.kind(), constraint.name(), table.name());
        let result = self
            .target
            .apply_constraint(&table.target_schema, &table.target_name, constraint)
            .await;
        let (status, message) = outcome(result);
        report.push(table, constraint, status, message);
    }

    async fn apply_indexes(&self, tables: &[&TablePlan], report: &mut ConstraintReport) {
        info!("Creating indexes with up to {} concurrent tasks", self.workers);
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::new();

        for table in tables {
            for index in indexes(table) {
                let target = self.target.clone();
                let semaphore = semaphore.clone();
                let schema = table.target_schema.clone();
                let name = table.target_name.clone();
                let constraint = index.clone();
                let handle = tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    target.apply_constraint(&schema, &name, &constraint).await
                });
                handles.push((*table, index, handle));
            }
        }

        for (table, index, handle) in handles {
            let result = match handle.await {
                Ok(r) => r,
                Err(e) => Err(MigrateError::constraint(
                    table.name().to_string(),
                    index.name(),
                    format!("index task panicked: {}", e),
                )),
            };
            let (status, message) = outcome(result);
            report.push(table, &index, status, message);
        }
    }
}

fn outcome(result: crate::error::Result<ApplyStatus>) -> (ConstraintStatus, Option<String>) {
    match result {
        Ok(ApplyStatus::Created) => (ConstraintStatus::Created, None),
        Ok(ApplyStatus::AlreadyPresent) => (ConstraintStatus::AlreadyPresent, None),
        Err(e) => (ConstraintStatus::Failed, Some(e.to_string())),
    }
}

fn target_columns(table: &TablePlan, columns: &[String]) -> Vec<String> {
    columns
        .iter()
        .map(|c| table.target_column(c).unwrap_or(c).to_string())
        .collect()
}

pub fn primary_key(table: &TablePlan) -> Option<TargetConstraint> {
    let pk = table.source.primary_key.as_ref()?;
    if pk.columns.is_empty() {
        return None;
    }
    Some(TargetConstraint::PrimaryKey {
        name: truncate_identifier(&pk.name),
        columns: table.primary_key.clone(),
    })
}

pub fn unique_constraints(table: &TablePlan) -> Vec<TargetConstraint> {
    table
        .source
        .unique_constraints
        .iter()
        .map(|uq| TargetConstraint::Unique {
            name: truncate_identifier(&uq.name),
            columns: target_columns(table, &uq.columns),
        })
        .collect()
}

/// Index names are only unique per table on the source, so they are
/// prefixed with the target table name.
pub fn indexes(table: &TablePlan) -> Vec<TargetConstraint> {
    table
        .source
        .indexes
        .iter()
        .map(|ix| TargetConstraint::Index {
            name: truncate_identifier(&format!("{}_{}", table.target_name, ix.name)),
            columns: target_columns(table, &ix.columns),
            unique: ix.is_unique,
            include: target_columns(table, &ix.include_cols),
        })
        .collect()
}

fn foreign_key(
    plan: &MigrationPlan,
    tables: &BTreeSet<QualifiedName>,
    child: &TablePlan,
    fk: &crate::source::ForeignKey,
) -> std::result::Result<TargetConstraint, (TargetConstraint, String)> {
    let parent = plan
        .tables
        .iter()
        .find(|t| t.name().eq_ignore_case(&fk.ref_table));

    let (ref_schema, ref_table, ref_columns) = match parent {
        Some(p) => (
            p.target_schema.clone(),
            p.target_name.clone(),
            target_columns(p, &fk.ref_columns),
        ),
        None => (
            fk.ref_table.schema.clone(),
            fk.ref_table.name.clone(),
            fk.ref_columns.clone(),
        ),
    };

    let constraint = TargetConstraint::ForeignKey {
        name: truncate_identifier(&fk.name),
        columns: target_columns(child, &fk.columns),
        ref_schema,
        ref_table,
        ref_columns,
        on_delete: fk.on_delete.clone(),
        on_update: fk.on_update.clone(),
    };

    match parent {
        None => Err((
            constraint,
            format!(
                "referenced table {} is not part of this migration",
                fk.ref_table
            ),
        )),
        Some(p) if !tables.contains(p.name()) => Err((
            constraint,
            format!(
                "referenced table {} was not created on the target",
                p.name()
            ),
        )),
        Some(_) => Ok(constraint),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::IdentifierTranslator;
    use crate::plan::build_plan;
    use crate::schema_def::SchemaDefinitions;
    use crate::source::{Column, ForeignKey, Index, KeyConstraint, SchemaMetadata, Table};
    use std::collections::BTreeMap;

    fn make_test_column(name: &str) -> Column {
        Column {
            name: name.to_string(),
            data_type: "int".to_string(),
            max_length: 4,
            precision: 10,
            scale: 0,
            is_nullable: false,
            default: None,
            is_identity: false,
            ordinal_pos: 1,
        }
    }

    fn make_test_plan() -> MigrationPlan {
        let mut customers = Table::new(QualifiedName::new("dbo", "Kunden"));
        customers.columns = vec![make_test_column("Id"), make_test_column("Nummer")];
        customers.primary_key = Some(KeyConstraint {
            name: "PK_Kunden".into(),
            columns: vec!["Id".into()],
        });
        customers.indexes = vec![Index {
            name: "IX_Nummer".into(),
            columns: vec!["Nummer".into()],
            is_unique: true,
            include_cols: vec![],
        }];

        let mut orders = Table::new(QualifiedName::new("dbo", "Orders"));
        orders.columns = vec![make_test_column("Id"), make_test_column("KundeId")];
        orders.foreign_keys = vec![
            ForeignKey {
                name: "FK_Orders_Kunden".into(),
                columns: vec!["KundeId".into()],
                ref_table: QualifiedName::new("dbo", "Kunden"),
                ref_columns: vec!["Id".into()],
                on_delete: "CASCADE".into(),
                on_update: "NO_ACTION".into(),
            },
            ForeignKey {
                name: "FK_Orders_Archive".into(),
                columns: vec!["Id".into()],
                ref_table: QualifiedName::new("archive", "Orders"),
                ref_columns: vec!["Id".into()],
                on_delete: "NO_ACTION".into(),
                on_update: "NO_ACTION".into(),
            },
        ];

        let mut meta = SchemaMetadata::default();
        meta.insert(customers);
        meta.insert(orders);
        let translator = IdentifierTranslator::new([("Kunden", "customers"), ("KundeId", "customer_id")]);
        build_plan(&meta, &translator, &SchemaDefinitions::default(), &BTreeMap::new())
    }

    #[test]
    fn test_index_names_are_table_prefixed() {
        let plan = make_test_plan();
        let customers = plan.table(&QualifiedName::new("dbo", "Kunden")).unwrap();
        let ix = indexes(customers);
        assert_eq!(ix[0].name(), "customers_IX_Nummer");
        assert_eq!(primary_key(customers).unwrap().name(), "PK_Kunden");
    }

    #[test]
    fn test_foreign_key_uses_target_names() {
        let plan = make_test_plan();
        let scope: BTreeSet<QualifiedName> = plan.tables.iter().map(|t| t.name().clone()).collect();
        let orders = plan.table(&QualifiedName::new("dbo", "Orders")).unwrap();

        let fk = foreign_key(&plan, &scope, orders, &orders.source.foreign_keys[0])
            .ok()
            .unwrap();
        match fk {
            TargetConstraint::ForeignKey {
                columns,
                ref_schema,
                ref_table,
                ref_columns,
                ..
            } => {
                assert_eq!(columns, vec!["customer_id"]);
                assert_eq!(ref_schema, "public");
                assert_eq!(ref_table, "customers");
                assert_eq!(ref_columns, vec!["Id"]);
            }
            other => panic!("unexpected constraint {:?}", other),
        }
    }

    #[test]
    fn test_foreign_key_outside_scope_is_skipped() {
        let plan = make_test_plan();
        let orders = plan.table(&QualifiedName::new("dbo", "Orders")).unwrap();

        let all: BTreeSet<QualifiedName> = plan.tables.iter().map(|t| t.name().clone()).collect();
        assert!(foreign_key(&plan, &all, orders, &orders.source.foreign_keys[1]).is_err());

        let only_orders = BTreeSet::from([QualifiedName::new("dbo", "Orders")]);
        assert!(foreign_key(&plan, &only_orders, orders, &orders.source.foreign_keys[0]).is_err());
    }
}
