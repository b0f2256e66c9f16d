//! Migration plan: ordered tables with their translated DDL.

use crate::error::Result;
use crate::identifiers::{resolve_collisions, IdentifierTranslator};
use crate::resolver::{resolve, Resolution};
use crate::schema_def::{NewColumn, SchemaDefinitions, TransformationKind};
use crate::source::{QualifiedName, SchemaMetadata, Table};
use crate::target::{qualify_table, quote_ident, truncate_identifier, MAX_IDENTIFIER_LEN};
use crate::typemap::{map_column, map_default};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Source schema that lands in the target's default schema.
pub const SOURCE_DEFAULT_SCHEMA: &str = "dbo";

/// Target default schema.
pub const TARGET_DEFAULT_SCHEMA: &str = "public";

/// How rows are written into a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "strategy", content = "reason", rename_all = "snake_case")]
pub enum CopyStrategy {
    /// Fresh table, plain batched inserts.
    Bulk,
    /// Existing table with a primary key; conflicting rows are ignored.
    InsertIgnore,
    /// No rows are copied.
    Skip(String),
}

impl CopyStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyStrategy::Bulk => "bulk",
            CopyStrategy::InsertIgnore => "insert_ignore",
            CopyStrategy::Skip(_) => "skip",
        }
    }
}

/// One column of a planned table.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnPlan {
    pub source_name: String,
    pub target_name: String,
    pub target_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub identity: bool,
}

/// A planned table.
#[derive(Debug, Clone, Serialize)]
pub struct TablePlan {
    /// Source metadata snapshot.
    pub source: Table,
    pub target_schema: String,
    pub target_name: String,
    /// Columns in source ordinal order.
    pub columns: Vec<ColumnPlan>,
    /// Primary key columns, target names.
    pub primary_key: Vec<String>,
    /// `CREATE TABLE IF NOT EXISTS` statement.
    pub ddl: String,
    pub skip_migration: bool,
    pub custom_query: Option<String>,
    /// Declared columns to add after the load.
    pub new_columns: Vec<NewColumn>,
    pub row_estimate: i64,
}

impl TablePlan {
    pub fn name(&self) -> &QualifiedName {
        &self.source.name
    }

    pub fn target_qualified(&self) -> QualifiedName {
        QualifiedName::new(&self.target_schema, &self.target_name)
    }

    /// Target name for a source column, matched case-insensitively.
    pub fn target_column(&self, source_column: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.source_name.eq_ignore_ascii_case(source_column))
            .map(|c| c.target_name.as_str())
    }

    pub fn rename_map(&self) -> BTreeMap<String, String> {
        self.columns
            .iter()
            .map(|c| (c.source_name.clone(), c.target_name.clone()))
            .collect()
    }

    pub fn target_columns(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.target_name.clone()).collect()
    }

    pub fn identity_columns(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| c.identity)
            .map(|c| c.target_name.as_str())
    }
}

/// A warning raised while planning, e.g. a lossy type mapping.
#[derive(Debug, Clone, Serialize)]
pub struct PlanWarning {
    pub table: QualifiedName,
    pub column: Option<String>,
    pub message: String,
}

/// Full plan for one run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationPlan {
    /// Tables in creation order.
    pub tables: Vec<TablePlan>,
    pub resolution: Resolution,
    pub warnings: Vec<PlanWarning>,
}

impl MigrationPlan {
    pub fn table(&self, name: &QualifiedName) -> Option<&TablePlan> {
        self.tables.iter().find(|t| &t.source.name == name)
    }

    /// Distinct target schemas, sorted.
    pub fn target_schemas(&self) -> Vec<String> {
        let mut schemas: Vec<String> = self.tables.iter().map(|t| t.target_schema.clone()).collect();
        schemas.sort();
        schemas.dedup();
        schemas
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Map a source schema to its target schema.
pub fn target_schema_name(source_schema: &str, translator: &IdentifierTranslator) -> String {
    if source_schema.eq_ignore_ascii_case(SOURCE_DEFAULT_SCHEMA) {
        TARGET_DEFAULT_SCHEMA.to_string()
    } else {
        truncate_identifier(&translator.translate(source_schema))
    }
}

/// Build the plan for every table in `metadata`.
///
/// `inline_columns` holds `new_columns` declared in the config file, keyed
/// like the schema-definition artifact.
pub fn build_plan(
    metadata: &SchemaMetadata,
    translator: &IdentifierTranslator,
    definitions: &SchemaDefinitions,
    inline_columns: &BTreeMap<String, Vec<NewColumn>>,
) -> MigrationPlan {
    let resolution = resolve(metadata.tables.values());
    let mut warnings = Vec::new();
    let mut tables = Vec::with_capacity(resolution.creation_order.len());

    for name in &resolution.creation_order {
        let Some(table) = metadata.table(name) else {
            continue;
        };
        tables.push(plan_table(table, translator, definitions, inline_columns, &mut warnings));
    }

    for w in &warnings {
        match &w.column {
            Some(col) => warn!("{}.{}: {}", w.table, col, w.message),
            None => warn!("{}: {}", w.table, w.message),
        }
    }

    MigrationPlan {
        tables,
        resolution,
        warnings,
    }
}

fn plan_table(
    table: &Table,
    translator: &IdentifierTranslator,
    definitions: &SchemaDefinitions,
    inline_columns: &BTreeMap<String, Vec<NewColumn>>,
    warnings: &mut Vec<PlanWarning>,
) -> TablePlan {
    let definition = definitions.lookup(&table.name);
    let mut warn_col = |column: Option<&str>, message: String| {
        warnings.push(PlanWarning {
            table: table.name.clone(),
            column: column.map(str::to_string),
            message,
        })
    };

    // Declared renames win over the dictionary
    let mut renames: BTreeMap<String, String> = BTreeMap::new();
    if let Some(def) = definition {
        for t in &def.transformations {
            match (t.kind, &t.source_column, &t.target_column) {
                (TransformationKind::Rename, Some(src), Some(dst)) => {
                    renames.insert(src.to_lowercase(), dst.clone());
                }
                (kind, _, _) => warn_col(
                    t.source_column.as_deref(),
                    format!("{:?} transformation is recorded but not applied", kind),
                ),
            }
        }
    }

    let base_names: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            renames
                .get(&c.name.to_lowercase())
                .cloned()
                .unwrap_or_else(|| translator.translate(&c.name))
        })
        .collect();
    let final_names = resolve_collisions(&base_names);

    let mut columns = Vec::with_capacity(table.columns.len());
    for (col, (base, target_name)) in table.columns.iter().zip(base_names.iter().zip(final_names)) {
        if base.len() > MAX_IDENTIFIER_LEN && truncate_identifier(base) == target_name {
            warn_col(
                Some(&col.name),
                format!("name '{}' is longer than {} bytes, truncated to '{}'", base, MAX_IDENTIFIER_LEN, target_name),
            );
        } else if base != &target_name {
            warn_col(
                Some(&col.name),
                format!("translated name '{}' collides, using '{}'", base, target_name),
            );
        }

        let spec = map_column(col);
        if let Some(w) = &spec.warning {
            warn_col(Some(&col.name), w.clone());
        }

        let default = match (&col.default, col.is_identity) {
            (Some(src), false) => {
                let translated = map_default(src, &spec.sql_type);
                if let Some(w) = translated.warning {
                    warn_col(Some(&col.name), w);
                }
                translated.expression
            }
            _ => None,
        };

        columns.push(ColumnPlan {
            source_name: col.name.clone(),
            target_name,
            target_type: spec.sql_type,
            nullable: col.is_nullable,
            default,
            identity: col.is_identity,
        });
    }

    let target_schema = target_schema_name(&table.name.schema, translator);
    let translated = translator.translate(&table.name.name);
    let target_name = truncate_identifier(&translated);
    if target_name != translated {
        warn_col(
            None,
            format!("table name '{}' is longer than {} bytes, truncated to '{}'", translated, MAX_IDENTIFIER_LEN, target_name),
        );
    }

    let primary_key = table
        .primary_key
        .iter()
        .flat_map(|pk| pk.columns.iter())
        .map(|c| lookup_target(&columns, c))
        .collect();

    let ddl = create_table_sql(&target_schema, &target_name, &columns);
    debug!("Planned {} -> {}.{}", table.name, target_schema, target_name);

    let mut new_columns: Vec<NewColumn> = definition
        .map(|d| d.new_columns.clone())
        .unwrap_or_default();
    if let Some(inline) = lookup_inline(inline_columns, &table.name) {
        for col in inline {
            if !new_columns.iter().any(|c| c.name.eq_ignore_ascii_case(&col.name)) {
                new_columns.push(col.clone());
            }
        }
    }

    TablePlan {
        source: table.clone(),
        target_schema,
        target_name,
        columns,
        primary_key,
        ddl,
        skip_migration: definition.map(|d| d.skip_migration).unwrap_or(false),
        custom_query: definition.and_then(|d| d.custom_query.clone()),
        new_columns,
        row_estimate: table.row_count,
    }
}

fn lookup_target(columns: &[ColumnPlan], source: &str) -> String {
    columns
        .iter()
        .find(|c| c.source_name.eq_ignore_ascii_case(source))
        .map(|c| c.target_name.clone())
        .unwrap_or_else(|| source.to_string())
}

fn lookup_inline<'a>(
    inline: &'a BTreeMap<String, Vec<NewColumn>>,
    table: &QualifiedName,
) -> Option<&'a Vec<NewColumn>> {
    let qualified = table.to_string();
    inline
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(&qualified))
        .or_else(|| inline.iter().find(|(k, _)| k.eq_ignore_ascii_case(&table.name)))
        .map(|(_, v)| v)
}

/// Render `CREATE TABLE IF NOT EXISTS` with columns in order. Constraints are
/// added later, after the data load.
pub fn create_table_sql(schema: &str, table: &str, columns: &[ColumnPlan]) -> String {
    let defs: Vec<String> = columns
        .iter()
        .map(|c| {
            let mut def = format!("{} {}", quote_ident(&c.target_name), c.target_type);
            if !c.nullable {
                def.push_str(" NOT NULL");
            }
            if let Some(d) = &c.default {
                def.push_str(" DEFAULT ");
                def.push_str(d);
            }
            def
        })
        .collect();

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        qualify_table(schema, table),
        defs.join(",\n    ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema_def::TableDefinition;
    use crate::source::{Column, KeyConstraint};

    fn make_test_column(name: &str, data_type: &str, ordinal: i32) -> Column {
        Column {
            name: name.to_string(),
            data_type: data_type.to_string(),
            max_length: 100,
            precision: 0,
            scale: 0,
            is_nullable: ordinal != 1,
            default: None,
            is_identity: ordinal == 1,
            ordinal_pos: ordinal,
        }
    }

    fn make_test_metadata() -> SchemaMetadata {
        let mut customers = Table::new(QualifiedName::new("dbo", "Kunden"));
        customers.columns = vec![
            make_test_column("Id", "int", 1),
            make_test_column("Name", "nvarchar", 2),
            make_test_column("NAME", "nvarchar", 3),
            make_test_column("Aktiv", "bit", 4),
        ];
        customers.columns[3].default = Some("((1))".into());
        customers.primary_key = Some(KeyConstraint {
            name: "PK_Kunden".into(),
            columns: vec!["Id".into()],
        });

        let mut meta = SchemaMetadata::default();
        meta.insert(customers);
        meta
    }

    #[test]
    fn test_build_plan_translates_names() {
        let translator = IdentifierTranslator::new([("Kunden", "customers"), ("Aktiv", "active")]);
        let plan = build_plan(
            &make_test_metadata(),
            &translator,
            &SchemaDefinitions::default(),
            &BTreeMap::new(),
        );

        let t = &plan.tables[0];
        assert_eq!(t.target_schema, "public");
        assert_eq!(t.target_name, "customers");
        assert_eq!(t.target_columns(), vec!["Id", "Name", "NAME2", "active"]);
        assert_eq!(t.primary_key, vec!["Id"]);
        assert_eq!(t.target_column("aktiv"), Some("active"));
        assert!(plan.warnings.iter().any(|w| w.message.contains("NAME2")));
    }

    #[test]
    fn test_ddl_shape() {
        let plan = build_plan(
            &make_test_metadata(),
            &IdentifierTranslator::identity(),
            &SchemaDefinitions::default(),
            &BTreeMap::new(),
        );
        let ddl = &plan.tables[0].ddl;
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS \"public\".\"Kunden\""));
        assert!(ddl.contains("\"Id\" integer GENERATED BY DEFAULT AS IDENTITY NOT NULL"));
        assert!(ddl.contains("\"Aktiv\" boolean DEFAULT TRUE"));
        assert!(!ddl.contains("PRIMARY KEY"));
    }

    #[test]
    fn test_definitions_apply() {
        let mut defs = SchemaDefinitions::default();
        defs.insert(
            "dbo.Kunden",
            serde_json::from_str::<TableDefinition>(
                r#"{
                    "skip_migration": true,
                    "custom_query": "SELECT 1",
                    "new_columns": [{"name": "tier", "type": "text"}],
                    "transformations": [
                        {"type": "rename", "source_column": "Name", "target_column": "full_name"},
                        {"type": "computed", "target_column": "x", "expression": "a + b"}
                    ]
                }"#,
            )
            .unwrap(),
        );
        let mut inline = BTreeMap::new();
        inline.insert(
            "Kunden".to_string(),
            vec![NewColumn {
                name: "TIER".into(),
                sql_type: "text".into(),
                nullable: true,
                default: None,
                description: None,
            }, NewColumn {
                name: "score".into(),
                sql_type: "integer".into(),
                nullable: true,
                default: None,
                description: None,
            }],
        );

        let plan = build_plan(&make_test_metadata(), &IdentifierTranslator::identity(), &defs, &inline);
        let t = &plan.tables[0];
        assert!(t.skip_migration);
        assert_eq!(t.custom_query.as_deref(), Some("SELECT 1"));
        assert_eq!(t.target_column("Name"), Some("full_name"));
        let added: Vec<&str> = t.new_columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(added, vec!["tier", "score"]);
        assert!(plan.warnings.iter().any(|w| w.message.contains("Computed")));
    }

    #[test]
    fn test_long_names_truncated_and_kept_distinct() {
        let long_table = "Auftragspositionen".repeat(4);
        let mut table = Table::new(QualifiedName::new("dbo", long_table.as_str()));
        table.columns = vec![
            make_test_column(&format!("{}X", "A".repeat(63)), "int", 1),
            make_test_column(&format!("{}Y", "A".repeat(63)), "int", 2),
        ];
        let mut meta = SchemaMetadata::default();
        meta.insert(table);

        let plan = build_plan(
            &meta,
            &IdentifierTranslator::identity(),
            &SchemaDefinitions::default(),
            &BTreeMap::new(),
        );
        let t = &plan.tables[0];
        assert_eq!(t.target_name, long_table[..63]);
        let columns = t.target_columns();
        assert_eq!(columns, vec!["A".repeat(63), format!("{}2", "A".repeat(62))]);
        assert!(columns.iter().all(|c| c.len() <= MAX_IDENTIFIER_LEN));
        assert!(plan.warnings.iter().any(|w| w.column.is_none() && w.message.contains("truncated")));
        assert!(plan.warnings.iter().any(|w| w.message.contains("collides")));
    }

    #[test]
    fn test_non_default_schema_keeps_name() {
        let translator = IdentifierTranslator::new([("Vertrieb", "sales")]);
        assert_eq!(target_schema_name("DBO", &translator), "public");
        assert_eq!(target_schema_name("Vertrieb", &translator), "sales");
        assert_eq!(target_schema_name("hr", &translator), "hr");
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(CopyStrategy::Bulk.as_str(), "bulk");
        assert_eq!(CopyStrategy::Skip("x".into()).as_str(), "skip");
    }
}
