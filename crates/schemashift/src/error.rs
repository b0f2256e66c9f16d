//! Error types for the migration library.

use thiserror::Error;

/// Main error type for migration operations.
///
/// The first group of variants is the run's error taxonomy. Only
/// [`MigrateError::Connectivity`] raised while opening a run is fatal; every
/// other variant is recorded against a table, view or constraint and the
/// pipeline moves on.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, unreadable input files)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source or target unreachable
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Catalog queries returned data we could not interpret
    #[error("Introspection failed for schema {schema}: {message}")]
    Introspection { schema: String, message: String },

    /// DDL failure on one table
    #[error("Schema creation failed for table {table}: {message}")]
    SchemaCreation { table: String, message: String },

    /// Row or batch failure while copying one table
    #[error("Data copy failed for table {table}: {message}")]
    DataCopy { table: String, message: String },

    /// A single constraint or index could not be applied
    #[error("Constraint {constraint} failed on table {table}: {message}")]
    Constraint {
        table: String,
        constraint: String,
        message: String,
    },

    /// A view could not be translated or created
    #[error("View translation failed for {view}: {message}")]
    ViewTranslation { view: String, message: String },

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] tiberius::error::Error),

    /// Target database connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, stop request)
    #[error("Migration cancelled")]
    Cancelled,

    /// The background run task panicked or was aborted
    #[error("Migration task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a SchemaCreation error
    pub fn schema_creation(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::SchemaCreation {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a DataCopy error
    pub fn data_copy(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::DataCopy {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Constraint error
    pub fn constraint(
        table: impl Into<String>,
        constraint: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        MigrateError::Constraint {
            table: table.into(),
            constraint: constraint.into(),
            message: message.into(),
        }
    }

    /// True when the failure came from the transport rather than the data.
    ///
    /// The copier retries a batch once for these; data errors fall back to
    /// row-by-row writes instead.
    pub fn is_connection_error(&self) -> bool {
        match self {
            MigrateError::Connectivity(_) | MigrateError::Pool { .. } | MigrateError::Io(_) => {
                true
            }
            MigrateError::Source(e) => matches!(e, tiberius::error::Error::Io { .. }),
            MigrateError::Target(e) => {
                e.is_closed()
                    || std::error::Error::source(e)
                        .map(|s| s.is::<std::io::Error>())
                        .unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Whether this error aborts the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MigrateError::Connectivity(_) | MigrateError::Config(_) | MigrateError::Cancelled
        )
    }

    /// Process exit status for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => 2,
            MigrateError::Connectivity(_)
            | MigrateError::Pool { .. }
            | MigrateError::Source(_)
            | MigrateError::Target(_) => 3,
            MigrateError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
