//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// SHA256 of the configuration with credentials blanked, recorded in run reports.
    pub fn hash(&self) -> String {
        let mut redacted = self.clone();
        redacted.source.password.clear();
        redacted.target.password.clear();

        let yaml = serde_yaml::to_string(&redacted).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
source:
  host: mssql.internal
  database: Sales
  user: sa
  password: secret
target:
  host: pg.internal
  database: sales
  user: postgres
  password: secret
  ssl_mode: disable
migration:
  batch_size: 500
  schemas: [dbo, hr]
  new_columns:
    dbo.Customers:
      - name: loyalty_tier
        type: varchar(20)
        nullable: true
"#;

    #[test]
    fn test_from_yaml_applies_defaults() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.source.port, 1433);
        assert_eq!(config.target.port, 5432);
        assert!(config.source.encrypt);
        assert_eq!(config.migration.batch_size, 500);
        assert_eq!(config.migration.schemas, vec!["dbo", "hr"]);
        assert_eq!(config.migration.progress_interval, 1000);
        assert!(!config.migration.drop_existing);
        assert_eq!(config.migration.new_columns["dbo.Customers"][0].name, "loyalty_tier");
    }

    #[test]
    fn test_missing_migration_section_uses_defaults() {
        let yaml = r#"
source: { host: a, database: d, user: u }
target: { host: b, database: d, user: u }
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.migration.batch_size, 1000);
        assert_eq!(config.migration.schemas, vec!["dbo"]);
        assert_eq!(config.target.ssl_mode, "require");
    }

    #[test]
    fn test_hash_ignores_passwords() {
        let a = Config::from_yaml(YAML).unwrap();
        let mut b = a.clone();
        b.source.password = "rotated".into();
        assert_eq!(a.hash(), b.hash());

        b.migration.batch_size = 2000;
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 64);
    }

    #[test]
    fn test_auto_tuning_keeps_explicit_values() {
        let mut config = Config::from_yaml(YAML).unwrap();
        config.migration.workers = Some(3);
        let resources = SystemResources {
            total_memory_gb: 16.0,
            cpu_cores: 12,
        };
        let tuned = config.migration.with_auto_tuning(&resources);
        assert_eq!(tuned.get_workers(), 3);
        assert_eq!(tuned.get_max_source_connections(), 4);
        assert_eq!(tuned.get_max_target_connections(), 4);
    }
}
