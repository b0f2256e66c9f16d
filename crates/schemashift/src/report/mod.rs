//! Error collection and the run report.

use crate::columns::AddedColumn;
use crate::error::{MigrateError, Result};
use crate::resolver::CycleWarning;
use crate::views::TranslationResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What a recorded error is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorScope {
    Schema,
    Table,
    Column,
    Constraint,
    View,
}

/// Taxonomy class of a recorded error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Introspection,
    SchemaCreation,
    DataCopy,
    Row,
    Column,
    Constraint,
    ViewTranslation,
    Validation,
    Cancelled,
    Other,
}

impl From<&MigrateError> for ErrorKind {
    fn from(err: &MigrateError) -> Self {
        match err {
            MigrateError::Introspection { .. } => ErrorKind::Introspection,
            MigrateError::SchemaCreation { .. } => ErrorKind::SchemaCreation,
            MigrateError::DataCopy { .. } => ErrorKind::DataCopy,
            MigrateError::Constraint { .. } => ErrorKind::Constraint,
            MigrateError::ViewTranslation { .. } => ErrorKind::ViewTranslation,
            MigrateError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Other,
        }
    }
}

/// One non-fatal failure, attached to the object it concerns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedError {
    pub scope: ErrorScope,
    /// Qualified name of the table, view or constraint.
    pub identifier: String,
    pub message: String,
    pub kind: ErrorKind,
    pub timestamp: DateTime<Utc>,
}

impl RecordedError {
    pub fn new(
        scope: ErrorScope,
        identifier: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            scope,
            identifier: identifier.into(),
            message: message.into(),
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn from_error(scope: ErrorScope, identifier: impl Into<String>, err: &MigrateError) -> Self {
        Self::new(scope, identifier, ErrorKind::from(err), err.to_string())
    }
}

/// Final state of one table's copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

/// Per-table line of the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableReport {
    /// Source `schema.table`.
    pub table: String,
    /// Target `schema.table`.
    pub target: String,
    pub strategy: String,
    pub rows_copied: u64,
    pub rows_skipped: u64,
    pub status: TableStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Cancelled,
    Failed,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    /// Unique run identifier.
    pub run_id: String,

    /// SHA256 of the configuration, passwords excluded.
    pub config_hash: String,

    pub status: RunStatus,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,

    pub tables_total: usize,
    pub tables_success: usize,
    pub tables_failed: usize,
    pub rows_transferred: u64,
    pub rows_per_second: i64,
    pub failed_tables: Vec<String>,

    pub tables: Vec<TableReport>,
    pub views: Vec<TranslationResult>,
    pub added_columns: Vec<AddedColumn>,
    pub cycles: Vec<CycleWarning>,
    pub errors: Vec<RecordedError>,
}

impl MigrationReport {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the report atomically: temp file, then rename.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_json_atomic(path.as_ref(), &self.to_json()?)
    }

    pub fn errors_for(&self, identifier: &str) -> impl Iterator<Item = &RecordedError> {
        let identifier = identifier.to_string();
        self.errors
            .iter()
            .filter(move |e| e.identifier.eq_ignore_ascii_case(&identifier))
    }

    pub fn table(&self, table: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table.eq_ignore_ascii_case(table))
    }
}

/// Pick the run status from the collected outcomes.
pub fn final_status(cancelled: bool, errors: &[RecordedError]) -> RunStatus {
    if cancelled {
        RunStatus::Cancelled
    } else if errors.is_empty() {
        RunStatus::Completed
    } else {
        RunStatus::CompletedWithErrors
    }
}

pub(crate) fn write_json_atomic(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}
