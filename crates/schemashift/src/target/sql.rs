//! Value literals and statement rendering for PostgreSQL.

use serde::{Deserialize, Serialize};

/// PostgreSQL's identifier length limit in bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// SQL value enum for type-safe row handling.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null(SqlNullType),
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    Decimal(rust_decimal::Decimal),
    DateTime(chrono::NaiveDateTime),
    DateTimeOffset(chrono::DateTime<chrono::FixedOffset>),
    Date(chrono::NaiveDate),
    Time(chrono::NaiveTime),
}

/// Type hint for NULL values so the literal carries the right cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlNullType {
    Bool,
    I16,
    I32,
    I64,
    F32,
    F64,
    String,
    Bytes,
    Uuid,
    Decimal,
    DateTime,
    DateTimeOffset,
    Date,
    Time,
}

/// How a batch insert treats rows that collide with existing keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Plain INSERT; a duplicate key fails the statement.
    Error,
    /// INSERT ... ON CONFLICT DO NOTHING.
    DoNothing,
}

/// Destination of a batch write.
#[derive(Debug, Clone)]
pub struct WriteTarget {
    pub schema: String,
    pub table: String,
    pub columns: Vec<String>,
    pub conflict: ConflictPolicy,
}

/// A constraint or index to apply after the data load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetConstraint {
    PrimaryKey {
        name: String,
        columns: Vec<String>,
    },
    Unique {
        name: String,
        columns: Vec<String>,
    },
    Index {
        name: String,
        columns: Vec<String>,
        unique: bool,
        include: Vec<String>,
    },
    ForeignKey {
        name: String,
        columns: Vec<String>,
        ref_schema: String,
        ref_table: String,
        ref_columns: Vec<String>,
        on_delete: String,
        on_update: String,
    },
}

impl TargetConstraint {
    pub fn name(&self) -> &str {
        match self {
            TargetConstraint::PrimaryKey { name, .. }
            | TargetConstraint::Unique { name, .. }
            | TargetConstraint::Index { name, .. }
            | TargetConstraint::ForeignKey { name, .. } => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TargetConstraint::PrimaryKey { .. } => "primary_key",
            TargetConstraint::Unique { .. } => "unique",
            TargetConstraint::Index { .. } => "index",
            TargetConstraint::ForeignKey { .. } => "foreign_key",
        }
    }

    /// Render the DDL that creates this constraint on `schema.table`.
    pub fn to_sql(&self, schema: &str, table: &str) -> String {
        let target = qualify_table(schema, table);
        match self {
            TargetConstraint::PrimaryKey { name, columns } => format!(
                "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
                target,
                quote_ident(name),
                quote_list(columns)
            ),
            TargetConstraint::Unique { name, columns } => format!(
                "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
                target,
                quote_ident(name),
                quote_list(columns)
            ),
            TargetConstraint::Index {
                name,
                columns,
                unique,
                include,
            } => {
                let mut sql = format!(
                    "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                    if *unique { "UNIQUE " } else { "" },
                    quote_ident(name),
                    target,
                    quote_list(columns)
                );
                if !include.is_empty() {
                    sql.push_str(&format!(" INCLUDE ({})", quote_list(include)));
                }
                sql
            }
            TargetConstraint::ForeignKey {
                name,
                columns,
                ref_schema,
                ref_table,
                ref_columns,
                on_delete,
                on_update,
            } => format!(
                "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {} ON UPDATE {}",
                target,
                quote_ident(name),
                quote_list(columns),
                qualify_table(ref_schema, ref_table),
                quote_list(ref_columns),
                map_referential_action(on_delete),
                map_referential_action(on_update)
            ),
        }
    }
}

/// Quote a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Fully qualify a table name.
pub fn qualify_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

fn quote_list(names: &[String]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Cut an identifier to PostgreSQL's limit without splitting a character.
pub fn truncate_identifier(name: &str) -> String {
    truncate_to(name, MAX_IDENTIFIER_LEN)
}

/// Cut `name` to at most `max` bytes on a character boundary.
pub fn truncate_to(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// Map SQL Server referential action to PostgreSQL.
pub fn map_referential_action(action: &str) -> &'static str {
    match action.to_uppercase().replace(' ', "_").as_str() {
        "CASCADE" => "CASCADE",
        "SET_NULL" => "SET NULL",
        "SET_DEFAULT" => "SET DEFAULT",
        _ => "NO ACTION",
    }
}

/// Escape a string for SQL literal use.
pub fn escape_sql_string(s: &str) -> String {
    s.replace('\'', "''")
}

/// Convert SqlValue to SQL literal string.
pub fn sql_value_to_literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null(_) => "NULL".to_string(),
        SqlValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        SqlValue::I16(n) => n.to_string(),
        SqlValue::I32(n) => n.to_string(),
        SqlValue::I64(n) => n.to_string(),
        SqlValue::F32(n) => float_literal(f64::from(*n), "real"),
        SqlValue::F64(n) => float_literal(*n, "double precision"),
        SqlValue::String(s) => format!("'{}'", escape_sql_string(s)),
        SqlValue::Bytes(b) => format!("'\\x{}'::bytea", hex::encode(b)),
        SqlValue::Uuid(u) => format!("'{}'::uuid", u),
        SqlValue::Decimal(d) => format!("{}::numeric", d),
        SqlValue::DateTime(dt) => format!("'{}'::timestamp", dt.format("%Y-%m-%d %H:%M:%S%.6f")),
        SqlValue::DateTimeOffset(dt) => format!("'{}'::timestamptz", dt.to_rfc3339()),
        SqlValue::Date(d) => format!("'{}'::date", d),
        SqlValue::Time(t) => format!("'{}'::time", t),
    }
}

fn float_literal(n: f64, cast: &str) -> String {
    if n.is_nan() {
        format!("'NaN'::{}", cast)
    } else if n.is_infinite() {
        let sign = if n > 0.0 { "" } else { "-" };
        format!("'{}Infinity'::{}", sign, cast)
    } else {
        format!("{}::{}", n, cast)
    }
}

/// Build a multi-row INSERT with literal values.
pub fn build_insert_sql_literals(target: &WriteTarget, rows: &[Vec<SqlValue>]) -> String {
    let value_rows: Vec<String> = rows
        .iter()
        .map(|row| {
            let values: Vec<String> = row.iter().map(sql_value_to_literal).collect();
            format!("({})", values.join(", "))
        })
        .collect();

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        qualify_table(&target.schema, &target.table),
        quote_list(&target.columns),
        value_rows.join(", ")
    );
    if target.conflict == ConflictPolicy::DoNothing {
        sql.push_str(" ON CONFLICT DO NOTHING");
    }
    sql
}

/// Advance an identity column past the copied values.
///
/// `setval(seq, 1, false)` on an empty table makes the next value 1.
pub fn reset_identity_sql(schema: &str, table: &str, column: &str) -> String {
    let qualified = qualify_table(schema, table);
    let col = quote_ident(column);
    format!(
        "SELECT setval(pg_get_serial_sequence('{}', '{}'), COALESCE(MAX({}), 1), MAX({}) IS NOT NULL) FROM {}",
        escape_sql_string(&qualified),
        escape_sql_string(column),
        col,
        col,
        qualified
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn make_test_target(conflict: ConflictPolicy) -> WriteTarget {
        WriteTarget {
            schema: "public".into(),
            table: "customers".into(),
            columns: vec!["id".into(), "name".into()],
            conflict,
        }
    }

    #[test]
    fn test_literals() {
        assert_eq!(sql_value_to_literal(&SqlValue::Null(SqlNullType::I32)), "NULL");
        assert_eq!(sql_value_to_literal(&SqlValue::String("O'Brien".into())), "'O''Brien'");
        assert_eq!(sql_value_to_literal(&SqlValue::Bytes(vec![0xde, 0xad])), "'\\xdead'::bytea");
        assert_eq!(sql_value_to_literal(&SqlValue::Bool(true)), "TRUE");
        assert_eq!(sql_value_to_literal(&SqlValue::F64(f64::NAN)), "'NaN'::double precision");
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(sql_value_to_literal(&SqlValue::Date(date)), "'2024-02-29'::date");
    }

    #[test]
    fn test_insert_sql() {
        let rows = vec![
            vec![SqlValue::I32(1), SqlValue::String("Ada".into())],
            vec![SqlValue::I32(2), SqlValue::Null(SqlNullType::String)],
        ];
        assert_eq!(
            build_insert_sql_literals(&make_test_target(ConflictPolicy::Error), &rows),
            "INSERT INTO \"public\".\"customers\" (\"id\", \"name\") VALUES (1, 'Ada'), (2, NULL)"
        );
        assert!(build_insert_sql_literals(&make_test_target(ConflictPolicy::DoNothing), &rows)
            .ends_with("ON CONFLICT DO NOTHING"));
    }

    #[test]
    fn test_constraint_sql() {
        let fk = TargetConstraint::ForeignKey {
            name: "fk_orders_customer".into(),
            columns: vec!["customer_id".into()],
            ref_schema: "public".into(),
            ref_table: "customers".into(),
            ref_columns: vec!["id".into()],
            on_delete: "CASCADE".into(),
            on_update: "NO_ACTION".into(),
        };
        assert_eq!(
            fk.to_sql("public", "orders"),
            "ALTER TABLE \"public\".\"orders\" ADD CONSTRAINT \"fk_orders_customer\" FOREIGN KEY (\"customer_id\") \
             REFERENCES \"public\".\"customers\" (\"id\") ON DELETE CASCADE ON UPDATE NO ACTION"
        );

        let idx = TargetConstraint::Index {
            name: "orders_ix_date".into(),
            columns: vec!["order_date".into()],
            unique: false,
            include: vec!["total".into()],
        };
        assert_eq!(
            idx.to_sql("public", "orders"),
            "CREATE INDEX IF NOT EXISTS \"orders_ix_date\" ON \"public\".\"orders\" (\"order_date\") INCLUDE (\"total\")"
        );
    }

    #[test]
    fn test_truncate_identifier_respects_char_boundaries() {
        let long = "é".repeat(40);
        let cut = truncate_identifier(&long);
        assert!(cut.len() <= MAX_IDENTIFIER_LEN);
        assert_eq!(cut.chars().count(), 31);
        assert_eq!(truncate_identifier("short"), "short");
    }

    #[test]
    fn test_reset_identity_sql() {
        assert_eq!(
            reset_identity_sql("public", "orders", "id"),
            "SELECT setval(pg_get_serial_sequence('\"public\".\"orders\"', 'id'), COALESCE(MAX(\"id\"), 1), MAX(\"id\") IS NOT NULL) FROM \"public\".\"orders\""
        );
    }

    #[test]
    fn test_referential_actions() {
        assert_eq!(map_referential_action("SET_NULL"), "SET NULL");
        assert_eq!(map_referential_action("set default"), "SET DEFAULT");
        assert_eq!(map_referential_action("NO_ACTION"), "NO ACTION");
    }
}
