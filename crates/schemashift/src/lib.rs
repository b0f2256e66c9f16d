//! # schemashift
//!
//! SQL Server to PostgreSQL schema and data migration library.
//!
//! A run reads the source catalog, orders tables so foreign-key parents come
//! first, creates schemas and tables on the target, copies rows in batches,
//! compares row counts, adds declared columns, applies keys and indexes, and
//! finally translates views. Failures on one table, constraint or view are
//! recorded in the run report and the rest of the migration carries on.
//!
//! ## Example
//!
//! ```rust,no_run
//! use schemashift::{Config, MigrationOptions, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let options = MigrationOptions::from_config(&config.migration)?;
//!     let orchestrator = Orchestrator::new(config).await?;
//!
//!     let handle = orchestrator.start_migration(options);
//!     let report = handle.wait().await?;
//!     println!("Migrated {} rows", report.rows_transferred);
//!     Ok(())
//! }
//! ```

pub mod columns;
pub mod config;
pub mod constraints;
pub mod copier;
pub mod error;
pub mod identifiers;
pub mod orchestrator;
pub mod plan;
pub mod progress;
pub mod report;
pub mod resolver;
pub mod schema;
pub mod schema_def;
pub mod source;
pub mod target;
pub mod typemap;
pub mod validate;
pub mod views;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, SourceConfig, TargetConfig};
pub use error::{MigrateError, Result};
pub use identifiers::{IdentifierTranslator, TableFilter};
pub use orchestrator::{MigrationOptions, Orchestrator, RunHandle};
pub use plan::{build_plan, CopyStrategy, MigrationPlan, TablePlan};
pub use progress::{Phase, ProgressEvent, ProgressReporter, ProgressSnapshot};
pub use report::{MigrationReport, RecordedError, RunStatus};
pub use resolver::{resolve, Resolution};
pub use source::{MssqlPool, QualifiedName, SchemaMetadata, SourcePool, Table};
pub use target::{PgPool, SqlValue, TargetPool};
pub use views::{TranslationResult, ViewTranslator};
