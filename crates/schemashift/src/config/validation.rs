//! Configuration validation.

use super::Config;
use crate::error::{MigrateError, Result};
use crate::target::SslMode;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(MigrateError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(MigrateError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(MigrateError::Config("source.user is required".into()));
    }

    // Target validation
    if config.target.host.is_empty() {
        return Err(MigrateError::Config("target.host is required".into()));
    }
    if config.target.database.is_empty() {
        return Err(MigrateError::Config("target.database is required".into()));
    }
    if config.target.user.is_empty() {
        return Err(MigrateError::Config("target.user is required".into()));
    }
    SslMode::parse(&config.target.ssl_mode)?;

    // Migration validation
    if config.migration.batch_size == 0 {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if config.migration.schemas.is_empty() {
        return Err(MigrateError::Config(
            "migration.schemas must list at least one schema".into(),
        ));
    }
    if let Some(empty) = config.migration.schemas.iter().find(|s| s.trim().is_empty()) {
        return Err(MigrateError::Config(format!(
            "migration.schemas contains an empty entry: {:?}",
            empty
        )));
    }
    if let Some(0) = config.migration.workers {
        return Err(MigrateError::Config(
            "migration.workers must be at least 1".into(),
        ));
    }
    if let Some(0) = config.migration.max_source_connections {
        return Err(MigrateError::Config(
            "migration.max_source_connections must be at least 1".into(),
        ));
    }
    if let Some(0) = config.migration.max_target_connections {
        return Err(MigrateError::Config(
            "migration.max_target_connections must be at least 1".into(),
        ));
    }
    if config.migration.progress_interval == 0 {
        return Err(MigrateError::Config(
            "migration.progress_interval must be at least 1".into(),
        ));
    }

    for (table, columns) in &config.migration.new_columns {
        for column in columns {
            if column.name.trim().is_empty() || column.sql_type.trim().is_empty() {
                return Err(MigrateError::Config(format!(
                    "migration.new_columns.{}: every column needs a name and a type",
                    table
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MigrationConfig, SourceConfig, TargetConfig};
    use crate::schema_def::NewColumn;

    fn valid_config() -> Config {
        Config {
            source: SourceConfig {
                host: "localhost".to_string(),
                port: 1433,
                database: "source_db".to_string(),
                user: "sa".to_string(),
                password: "password".to_string(),
                encrypt: false,
                trust_server_cert: true,
            },
            target: TargetConfig {
                host: "localhost".to_string(),
                port: 5432,
                database: "target_db".to_string(),
                user: "postgres".to_string(),
                password: "password".to_string(),
                ssl_mode: "disable".to_string(),
            },
            migration: MigrationConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_source_host() {
        let mut config = valid_config();
        config.source.host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_missing_target_database() {
        let mut config = valid_config();
        config.target.database = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_invalid_ssl_mode() {
        let mut config = valid_config();
        config.target.ssl_mode = "sometimes".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_batch_size() {
        let mut config = valid_config();
        config.migration.batch_size = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_empty_schema_list() {
        let mut config = valid_config();
        config.migration.schemas.clear();
        assert!(validate(&config).is_err());

        config.migration.schemas = vec!["dbo".into(), " ".into()];
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_workers() {
        let mut config = valid_config();
        config.migration.workers = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_new_column_without_type() {
        let mut config = valid_config();
        config.migration.new_columns.insert(
            "dbo.Customers".into(),
            vec![NewColumn {
                name: "tier".into(),
                sql_type: "".into(),
                nullable: true,
                default: None,
                description: None,
            }],
        );
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_source_config_debug_redacts_password() {
        let mut config = valid_config();
        config.source.password = "super_secret_password_123".to_string();
        let debug_output = format!("{:?}", config.source);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_password_123"));
    }

    #[test]
    fn test_target_config_debug_redacts_password() {
        let mut config = valid_config();
        config.target.password = "super_secret_password_456".to_string();
        let debug_output = format!("{:?}", config.target);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_password_456"));
    }
}
