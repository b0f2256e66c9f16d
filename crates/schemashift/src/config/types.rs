//! Configuration type definitions with auto-tuning based on system resources.

use crate::schema_def::NewColumn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        let total_memory_gb = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len().max(1);

        Self {
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration (SQL Server).
    pub source: SourceConfig,

    /// Target database configuration (PostgreSQL).
    pub target: TargetConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }
}

/// Source database (SQL Server) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Encrypt connection (default: true).
    #[serde(default = "default_true")]
    pub encrypt: bool,

    /// Trust server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .finish()
    }
}

/// Target database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// SSL mode: disable, require, verify-ca or verify-full (default: require).
    #[serde(default = "default_require")]
    pub ssl_mode: String,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Migration behavior configuration.
///
/// Pool and worker sizes use `Option<T>` to distinguish "not set" (auto-tuned)
/// from "explicitly set".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Drop existing target tables (cascading) before creating them.
    #[serde(default)]
    pub drop_existing: bool,

    /// Rows read and written per batch (default: 1000).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Source schemas to migrate (default: [dbo]).
    #[serde(default = "default_schemas")]
    pub schemas: Vec<String>,

    /// Number of concurrent table workers. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Maximum SQL Server connections. Auto-tuned based on workers if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_source_connections: Option<usize>,

    /// Maximum PostgreSQL connections. Auto-tuned based on workers if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_target_connections: Option<usize>,

    /// Emit a progress event every N copied rows (default: 1000).
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,

    /// Backoff before retrying a batch after a connection error (default: 500ms).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// File listing `schema.Table` entries to migrate. All tables when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables_file: Option<PathBuf>,

    /// JSON dictionary of identifier renames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translations_file: Option<PathBuf>,

    /// Declarative schema-definition artifact (read and appended to).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_definition_file: Option<PathBuf>,

    /// Where to write the JSON run report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_file: Option<PathBuf>,

    /// Where to write failed view translations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_errors_file: Option<PathBuf>,

    /// Inline declared columns, keyed by `schema.Table` or `Table`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub new_columns: BTreeMap<String, Vec<NewColumn>>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            drop_existing: false,
            batch_size: default_batch_size(),
            schemas: default_schemas(),
            workers: None,
            max_source_connections: None,
            max_target_connections: None,
            progress_interval: default_progress_interval(),
            retry_backoff_ms: default_retry_backoff_ms(),
            tables_file: None,
            translations_file: None,
            schema_definition_file: None,
            report_file: None,
            view_errors_file: None,
            new_columns: BTreeMap::new(),
        }
    }
}

impl MigrationConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let cores = resources.cpu_cores;

        // Workers: cores - 2, at least 2, at most 16
        let workers = *self
            .workers
            .get_or_insert_with(|| cores.saturating_sub(2).clamp(2, 16));

        // Each worker holds one connection per side, plus one for catalog queries
        self.max_source_connections
            .get_or_insert_with(|| (workers + 1).clamp(2, 64));
        self.max_target_connections
            .get_or_insert_with(|| (workers + 1).clamp(2, 64));

        info!(
            "Auto-tuned config: workers={}, source_conns={}, target_conns={}, batch_size={}",
            self.get_workers(),
            self.get_max_source_connections(),
            self.get_max_target_connections(),
            self.batch_size,
        );

        self
    }

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(4)
    }

    pub fn get_max_source_connections(&self) -> usize {
        self.max_source_connections
            .unwrap_or_else(|| self.get_workers() + 1)
    }

    pub fn get_max_target_connections(&self) -> usize {
        self.max_target_connections
            .unwrap_or_else(|| self.get_workers() + 1)
    }
}

// Default value functions for serde
fn default_mssql_port() -> u16 {
    1433
}

fn default_pg_port() -> u16 {
    5432
}

fn default_require() -> String {
    "require".to_string()
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    1000
}

fn default_schemas() -> Vec<String> {
    vec!["dbo".to_string()]
}

fn default_progress_interval() -> u64 {
    1000
}

fn default_retry_backoff_ms() -> u64 {
    500
}
