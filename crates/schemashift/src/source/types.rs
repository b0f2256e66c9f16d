//! Schema and metadata types.

use crate::target::SqlValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A `(schema, table)` pair. Ordering is by schema then name, which is the
/// tie-break order used everywhere a deterministic sequence is needed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QualifiedName {
    pub schema: String,
    pub name: String,
}

impl QualifiedName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse `schema.Table`. Returns None unless there is exactly one dot
    /// with text on both sides.
    pub fn parse(text: &str) -> Option<Self> {
        let (schema, name) = text.trim().split_once('.')?;
        let (schema, name) = (schema.trim(), name.trim());
        if schema.is_empty() || name.is_empty() || name.contains('.') {
            return None;
        }
        Some(Self::new(schema, name))
    }

    /// Case-insensitive comparison, matching SQL Server's default collation.
    pub fn eq_ignore_case(&self, other: &QualifiedName) -> bool {
        self.schema.eq_ignore_ascii_case(&other.schema) && self.name.eq_ignore_ascii_case(&other.name)
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Snapshot of the source catalog for the requested schemas.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaMetadata {
    /// Tables keyed by qualified name.
    pub tables: BTreeMap<QualifiedName, Table>,

    /// View definitions in name order.
    pub views: Vec<ViewDefinition>,

    /// Schemas whose catalog could not be read.
    pub failed_schemas: Vec<SchemaFailure>,
}

impl SchemaMetadata {
    pub fn table(&self, name: &QualifiedName) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn insert(&mut self, table: Table) {
        self.tables.insert(table.name.clone(), table);
    }

    /// Keep only tables accepted by the predicate. Views are untouched.
    pub fn retain_tables<F>(&mut self, mut keep: F)
    where
        F: FnMut(&QualifiedName) -> bool,
    {
        self.tables.retain(|name, _| keep(name));
    }
}

/// A schema whose introspection failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaFailure {
    pub schema: String,
    pub message: String,
}

/// Table metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    /// Qualified source name.
    pub name: QualifiedName,

    /// Column definitions in ordinal order.
    pub columns: Vec<Column>,

    /// Primary key, if declared.
    pub primary_key: Option<KeyConstraint>,

    /// Unique constraints (not unique indexes).
    #[serde(default)]
    pub unique_constraints: Vec<KeyConstraint>,

    /// Foreign keys declared on this table.
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,

    /// Non-primary-key indexes.
    #[serde(default)]
    pub indexes: Vec<Index>,

    /// Approximate row count.
    #[serde(default)]
    pub row_count: i64,
}

impl Table {
    pub fn new(name: QualifiedName) -> Self {
        Self {
            name,
            columns: Vec::new(),
            primary_key: None,
            unique_constraints: Vec::new(),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
            row_count: 0,
        }
    }

    /// Check if the table has a primary key.
    pub fn has_pk(&self) -> bool {
        self.primary_key
            .as_ref()
            .map(|pk| !pk.columns.is_empty())
            .unwrap_or(false)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Key columns that give a unique, stable order for offset paging: the
    /// primary key, else the first unique constraint.
    pub fn paging_key(&self) -> Option<Vec<&str>> {
        if let Some(pk) = self.primary_key.as_ref().filter(|pk| !pk.columns.is_empty()) {
            return Some(pk.columns.iter().map(String::as_str).collect());
        }
        self.unique_constraints
            .iter()
            .find(|uq| !uq.columns.is_empty())
            .map(|uq| uq.columns.iter().map(String::as_str).collect())
    }

    /// Columns that may appear in a source ORDER BY.
    pub fn orderable_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.is_orderable())
            .map(|c| c.name.as_str())
            .collect()
    }

    /// How rows of this table are read. Offset paging is only repeatable
    /// over a unique key; anything else is read in one pass.
    pub fn read_mode(&self, custom_query: Option<&str>) -> ReadMode {
        match (custom_query, self.paging_key()) {
            (None, Some(key)) => ReadMode::Keyed(key.into_iter().map(String::from).collect()),
            _ => ReadMode::SinglePass,
        }
    }
}

/// Row read strategy for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadMode {
    /// Offset pages ordered by these unique key columns.
    Keyed(Vec<String>),
    /// One streamed query, cut into batches as rows arrive.
    SinglePass,
}

/// Column metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,

    /// Data type (e.g., "int", "varchar", "datetime2").
    pub data_type: String,

    /// Max length for string/binary types, -1 for MAX.
    pub max_length: i32,

    /// Precision for numeric types.
    pub precision: i32,

    /// Scale for numeric types.
    pub scale: i32,

    /// Whether the column is nullable.
    pub is_nullable: bool,

    /// Default expression as stored in the source catalog, e.g. `((0))`.
    #[serde(default)]
    pub default: Option<String>,

    /// Whether this is an identity column.
    pub is_identity: bool,

    /// Ordinal position in the table.
    pub ordinal_pos: i32,
}

impl Column {
    /// LOB and XML columns cannot appear in ORDER BY on the source.
    pub fn is_orderable(&self) -> bool {
        let dt = self.data_type.to_lowercase();
        let lob = matches!(dt.as_str(), "text" | "ntext" | "image" | "xml" | "geography" | "geometry" | "hierarchyid" | "sql_variant");
        let max = self.max_length == -1 && matches!(dt.as_str(), "varchar" | "nvarchar" | "varbinary");
        !lob && !max
    }
}

/// Primary key or unique constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyConstraint {
    pub name: String,
    pub columns: Vec<String>,
}

/// Index metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    /// Index name.
    pub name: String,

    /// Key columns in order.
    pub columns: Vec<String>,

    /// Whether the index is unique.
    pub is_unique: bool,

    /// Included (non-key) columns.
    #[serde(default)]
    pub include_cols: Vec<String>,
}

/// Foreign key metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Constraint name.
    pub name: String,

    /// Columns in the referencing table.
    pub columns: Vec<String>,

    /// Referenced table.
    pub ref_table: QualifiedName,

    /// Referenced columns.
    pub ref_columns: Vec<String>,

    /// ON DELETE action as reported by the source (e.g. "NO_ACTION").
    pub on_delete: String,

    /// ON UPDATE action.
    pub on_update: String,
}

/// Source view definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub name: QualifiedName,
    /// Full `CREATE VIEW` text from the source catalog.
    pub definition: String,
}

/// One page of source rows.
#[derive(Debug, Default)]
pub struct Batch {
    /// Rows converted successfully, in scan order.
    pub rows: Vec<Vec<SqlValue>>,

    /// Rows that could not be converted.
    pub rejected: Vec<RejectedRow>,

    /// Number of source rows read, converted or not. Drives paging.
    pub fetched: usize,
}

/// A source row whose values could not be converted.
#[derive(Debug, Clone)]
pub struct RejectedRow {
    /// Zero-based position in the table scan.
    pub position: i64,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_column(name: &str, data_type: &str, max_length: i32) -> Column {
        Column {
            name: name.to_string(),
            data_type: data_type.to_string(),
            max_length,
            precision: 0,
            scale: 0,
            is_nullable: true,
            default: None,
            is_identity: false,
            ordinal_pos: 1,
        }
    }

    #[test]
    fn test_parse_qualified_name() {
        assert_eq!(
            QualifiedName::parse(" dbo.Customers "),
            Some(QualifiedName::new("dbo", "Customers"))
        );
        assert_eq!(QualifiedName::parse("Customers"), None);
        assert_eq!(QualifiedName::parse("a.b.c"), None);
        assert_eq!(QualifiedName::parse(".x"), None);
    }

    #[test]
    fn test_qualified_name_ordering() {
        let mut names = vec![
            QualifiedName::new("sales", "A"),
            QualifiedName::new("dbo", "Orders"),
            QualifiedName::new("dbo", "Customers"),
        ];
        names.sort();
        let rendered: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        assert_eq!(rendered, vec!["dbo.Customers", "dbo.Orders", "sales.A"]);
    }

    #[test]
    fn test_read_mode_prefers_primary_key() {
        let mut table = Table::new(QualifiedName::new("dbo", "Notes"));
        table.columns = vec![
            make_test_column("id", "int", 4),
            make_test_column("body", "nvarchar", -1),
            make_test_column("title", "nvarchar", 200),
        ];
        assert_eq!(table.orderable_columns(), vec!["id", "title"]);
        assert_eq!(table.paging_key(), None);
        assert_eq!(table.read_mode(None), ReadMode::SinglePass);

        table.unique_constraints.push(KeyConstraint {
            name: "UQ_Notes_Title".into(),
            columns: vec!["title".into()],
        });
        assert_eq!(table.read_mode(None), ReadMode::Keyed(vec!["title".into()]));

        table.primary_key = Some(KeyConstraint {
            name: "PK_Notes".into(),
            columns: vec!["id".into()],
        });
        assert_eq!(table.read_mode(None), ReadMode::Keyed(vec!["id".into()]));
        assert!(table.has_pk());
    }

    #[test]
    fn test_custom_query_reads_in_one_pass() {
        let mut table = Table::new(QualifiedName::new("dbo", "Notes"));
        table.columns = vec![make_test_column("id", "int", 4)];
        table.primary_key = Some(KeyConstraint {
            name: "PK_Notes".into(),
            columns: vec!["id".into()],
        });
        assert_eq!(
            table.read_mode(Some("SELECT id FROM dbo.Notes WHERE id > 10")),
            ReadMode::SinglePass
        );
    }
}
