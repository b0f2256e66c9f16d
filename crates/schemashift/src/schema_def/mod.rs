//! Declarative schema-definition artifact.
//!
//! A JSON object keyed by table name:
//!
//! ```json
//! {
//!   "dbo.Customers": {
//!     "new_columns": [{"name": "loyalty_tier", "type": "varchar(20)", "nullable": true}],
//!     "transformations": [],
//!     "skip_migration": false,
//!     "custom_query": null
//!   }
//! }
//! ```
//!
//! Unknown fields are carried through untouched so appending never loses data
//! written by other tools.

use crate::error::{MigrateError, Result};
use crate::report::write_json_atomic;
use crate::source::QualifiedName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// A column declared for addition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewColumn {
    pub name: String,

    /// PostgreSQL type, used verbatim in `ALTER TABLE ... ADD COLUMN`.
    #[serde(rename = "type")]
    pub sql_type: String,

    #[serde(default = "default_nullable")]
    pub nullable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_nullable() -> bool {
    true
}

/// Kind of a declared column transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformationKind {
    LookupExtraction,
    Computed,
    Split,
    Combine,
    Rename,
}

/// A declared transformation. Only `rename` changes the generated plan;
/// the others are preserved in the artifact and reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformation {
    #[serde(rename = "type")]
    pub kind: TransformationKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_column: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_column: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_table: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

/// Everything declared for one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableDefinition {
    #[serde(default)]
    pub new_columns: Vec<NewColumn>,

    #[serde(default)]
    pub transformations: Vec<Transformation>,

    #[serde(default)]
    pub skip_migration: bool,

    #[serde(default)]
    pub custom_query: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The whole artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaDefinitions {
    tables: BTreeMap<String, TableDefinition>,
}

impl SchemaDefinitions {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content).map_err(|e| {
            MigrateError::Config(format!("invalid schema definition file {}: {}", path.display(), e))
        })
    }

    /// Load the artifact if it exists; a missing file yields an empty set.
    pub fn load_optional<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("Schema definition file {} not found, continuing without it", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_json_atomic(path.as_ref(), &self.to_json()?)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Find the definition for a table, by `schema.Table` or by bare table
    /// name, case-insensitively. The qualified key wins.
    pub fn lookup(&self, table: &QualifiedName) -> Option<&TableDefinition> {
        let qualified = table.to_string();
        self.find_key(&qualified)
            .or_else(|| self.find_key(&table.name))
            .and_then(|key| self.tables.get(key))
    }

    pub fn insert(&mut self, key: impl Into<String>, definition: TableDefinition) {
        self.tables.insert(key.into(), definition);
    }

    fn find_key(&self, wanted: &str) -> Option<&String> {
        self.tables.keys().find(|k| k.eq_ignore_ascii_case(wanted))
    }

    /// Record columns added to `table`. Columns already listed (by name,
    /// case-insensitively) are left alone. Returns how many were appended.
    pub fn record_added(&mut self, table: &QualifiedName, columns: &[NewColumn]) -> usize {
        let qualified = table.to_string();
        let key = self
            .find_key(&qualified)
            .or_else(|| self.find_key(&table.name))
            .cloned()
            .unwrap_or(qualified);
        let entry = self.tables.entry(key).or_default();

        let mut appended = 0;
        for column in columns {
            let known = entry
                .new_columns
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(&column.name));
            if !known {
                entry.new_columns.push(column.clone());
                appended += 1;
            }
        }
        appended
    }
}

/// Append added columns to the artifact at `path`.
///
/// A missing file is not an error: the update is skipped with a warning.
pub fn append_added_columns(
    path: &Path,
    added: &BTreeMap<QualifiedName, Vec<NewColumn>>,
) -> Result<usize> {
    if added.is_empty() {
        return Ok(0);
    }
    if !path.exists() {
        warn!(
            "Schema definition file {} not found; added columns were not recorded",
            path.display()
        );
        return Ok(0);
    }

    let mut definitions = SchemaDefinitions::load(path)?;
    let appended: usize = added
        .iter()
        .map(|(table, columns)| definitions.record_added(table, columns))
        .sum();
    if appended > 0 {
        definitions.save(path)?;
    }
    debug!("Recorded {} added columns in {}", appended, path.display());
    Ok(appended)
}
