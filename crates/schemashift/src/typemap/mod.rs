//! Type mapping between SQL Server and PostgreSQL.

use crate::source::Column;
use serde::Serialize;

/// Largest length PostgreSQL accepts for `varchar(n)` / `char(n)`.
const PG_MAX_CHAR_LENGTH: i32 = 10_485_760;

/// Every SQL Server type with an explicit mapping.
pub const SUPPORTED_TYPES: &[&str] = &[
    "bit",
    "tinyint",
    "smallint",
    "int",
    "bigint",
    "decimal",
    "numeric",
    "money",
    "smallmoney",
    "float",
    "real",
    "char",
    "nchar",
    "varchar",
    "nvarchar",
    "text",
    "ntext",
    "sysname",
    "xml",
    "binary",
    "varbinary",
    "image",
    "timestamp",
    "rowversion",
    "date",
    "time",
    "datetime",
    "datetime2",
    "smalldatetime",
    "datetimeoffset",
    "uniqueidentifier",
];

/// The PostgreSQL type chosen for a source column type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetTypeSpec {
    /// Type as written in DDL, e.g. `varchar(50)`.
    pub sql_type: String,

    /// True when the source type was not recognized and `text` was used.
    pub is_fallback: bool,

    /// Why the mapping is lossy or a fallback.
    pub warning: Option<String>,
}

impl TargetTypeSpec {
    fn exact(sql_type: impl Into<String>) -> Self {
        Self {
            sql_type: sql_type.into(),
            is_fallback: false,
            warning: None,
        }
    }
}

/// Map a SQL Server data type to PostgreSQL.
pub fn map_type(source_type: &str, max_length: i32, precision: i32, scale: i32) -> TargetTypeSpec {
    let sql_type = match source_type.trim().to_lowercase().as_str() {
        // Boolean
        "bit" => "boolean".to_string(),

        // Integer types
        "tinyint" | "smallint" => "smallint".to_string(),
        "int" => "integer".to_string(),
        "bigint" => "bigint".to_string(),

        // Decimal/numeric
        "decimal" | "numeric" => {
            if precision > 0 {
                format!("numeric({},{})", precision, scale)
            } else {
                "numeric".to_string()
            }
        }
        "money" => "numeric(19,4)".to_string(),
        "smallmoney" => "numeric(10,4)".to_string(),

        // Floating point
        "float" => "double precision".to_string(),
        "real" => "real".to_string(),

        // String types
        "char" | "nchar" => {
            if max_length > 0 && max_length <= PG_MAX_CHAR_LENGTH {
                format!("char({})", max_length)
            } else {
                "text".to_string()
            }
        }
        "varchar" | "nvarchar" => {
            if max_length > 0 && max_length <= PG_MAX_CHAR_LENGTH {
                format!("varchar({})", max_length)
            } else {
                "text".to_string()
            }
        }
        "text" | "ntext" | "sysname" | "xml" => "text".to_string(),

        // Binary types; rowversion has no PostgreSQL counterpart, keep the bytes
        "binary" | "varbinary" | "image" | "timestamp" | "rowversion" => "bytea".to_string(),

        // Date/time types
        "date" => "date".to_string(),
        "time" => "time".to_string(),
        "datetime" | "datetime2" | "smalldatetime" => "timestamp".to_string(),
        "datetimeoffset" => "timestamptz".to_string(),

        // GUID
        "uniqueidentifier" => "uuid".to_string(),

        other => {
            return TargetTypeSpec {
                sql_type: "text".to_string(),
                is_fallback: true,
                warning: Some(format!(
                    "unrecognized source type '{}', mapped to text",
                    other
                )),
            }
        }
    };

    TargetTypeSpec::exact(sql_type)
}

/// Map a column, folding identity semantics into the type.
///
/// Identity columns become `GENERATED BY DEFAULT AS IDENTITY` so copied
/// values are accepted as-is; the sequence is advanced after the load.
pub fn map_column(column: &Column) -> TargetTypeSpec {
    let mut spec = map_type(&column.data_type, column.max_length, column.precision, column.scale);
    if !column.is_identity {
        return spec;
    }

    let base = match spec.sql_type.as_str() {
        "smallint" | "integer" | "bigint" => spec.sql_type.clone(),
        other => {
            spec.warning = Some(format!(
                "identity column of type {} widened to bigint",
                other
            ));
            "bigint".to_string()
        }
    };
    spec.sql_type = format!("{} GENERATED BY DEFAULT AS IDENTITY", base);
    spec
}

/// Result of translating a column default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultTranslation {
    pub expression: Option<String>,
    pub warning: Option<String>,
}

impl DefaultTranslation {
    fn some(expression: impl Into<String>) -> Self {
        Self {
            expression: Some(expression.into()),
            warning: None,
        }
    }

    fn dropped(source: &str) -> Self {
        Self {
            expression: None,
            warning: Some(format!("default {} has no PostgreSQL equivalent, dropped", source)),
        }
    }
}

/// Translate a SQL Server default expression for a column of `target_type`.
pub fn map_default(source_default: &str, target_type: &str) -> DefaultTranslation {
    let inner = strip_parens(source_default.trim());
    if inner.is_empty() {
        return DefaultTranslation::dropped(source_default);
    }
    let lower = inner.to_lowercase();
    let target = target_type.to_lowercase();

    // String literal, including N'...'
    let literal = inner
        .strip_prefix('N')
        .or_else(|| inner.strip_prefix('n'))
        .filter(|rest| rest.starts_with('\''))
        .unwrap_or(inner);
    if literal.len() >= 2 && literal.starts_with('\'') && literal.ends_with('\'') {
        return DefaultTranslation::some(literal);
    }

    if is_numeric_literal(inner) {
        if target == "boolean" {
            return match inner {
                "0" => DefaultTranslation::some("FALSE"),
                "1" => DefaultTranslation::some("TRUE"),
                _ => DefaultTranslation::dropped(source_default),
            };
        }
        return DefaultTranslation::some(inner);
    }

    match lower.as_str() {
        "getdate()" | "sysdatetime()" | "current_timestamp" => DefaultTranslation::some("NOW()"),
        "getutcdate()" | "sysutcdatetime()" => {
            DefaultTranslation::some("(NOW() AT TIME ZONE 'utc')")
        }
        "newid()" | "newsequentialid()" => DefaultTranslation::some("gen_random_uuid()"),
        "null" => DefaultTranslation::some("NULL"),
        _ => DefaultTranslation::dropped(source_default),
    }
}

/// Remove balanced outer parentheses: `((0))` becomes `0`.
fn strip_parens(mut expr: &str) -> &str {
    loop {
        let trimmed = expr.trim();
        if !(trimmed.starts_with('(') && trimmed.ends_with(')')) || !outer_parens_match(trimmed) {
            return trimmed;
        }
        expr = &trimmed[1..trimmed.len() - 1];
    }
}

/// True when the first `(` closes at the last character.
fn outer_parens_match(expr: &str) -> bool {
    let mut depth = 0i32;
    for (i, c) in expr.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return i == expr.len() - 1;
                }
            }
            _ => {}
        }
    }
    false
}

fn is_numeric_literal(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    !digits.is_empty()
        && digits.chars().all(|c| c.is_ascii_digit() || c == '.')
        && digits.chars().filter(|c| *c == '.').count() <= 1
        && digits.chars().any(|c| c.is_ascii_digit())
}
