//! T-SQL view translation and view creation on the target.
//!
//! Translation is a best-effort rewrite driven by a table of regex rules.
//! String literals are lifted out before any rule runs and put back at the
//! end, so rules never see (or damage) literal text. Constructs with no
//! PostgreSQL equivalent are reported instead of being guessed at.

use crate::error::{MigrateError, Result};
use crate::identifiers::IdentifierTranslator;
use crate::plan::{target_schema_name, TablePlan};
use crate::report::{write_json_atomic, ErrorKind, ErrorScope, RecordedError};
use crate::source::{QualifiedName, ViewDefinition};
use crate::target::{truncate_identifier, TargetPool};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of translating (and possibly creating) one view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationResult {
    /// Source `schema.view`.
    pub view: String,
    pub original_sql: String,
    /// Translated query, `None` when translation was refused.
    pub target_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TranslationResult {
    pub fn is_success(&self) -> bool {
        self.target_sql.is_some() && self.error.is_none()
    }
}

/// A regex rewrite applied to the literal-free query text.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    pub name: String,
    pub pattern: Regex,
    /// Replacement in `regex` syntax (`$1`, `${name}`).
    pub replacement: String,
}

impl RewriteRule {
    pub fn new(name: impl Into<String>, pattern: &str, replacement: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let pattern = Regex::new(pattern)
            .map_err(|e| MigrateError::Config(format!("invalid rewrite rule '{}': {}", name, e)))?;
        Ok(Self {
            name,
            pattern,
            replacement: replacement.into(),
        })
    }

    fn apply(&self, sql: &str) -> String {
        self.pattern
            .replace_all(sql, self.replacement.as_str())
            .into_owned()
    }
}

fn rule(name: &str, pattern: &str, replacement: &str) -> RewriteRule {
    RewriteRule {
        name: name.to_string(),
        pattern: Regex::new(pattern).unwrap(),
        replacement: replacement.to_string(),
    }
}

/// Built-in rewrites, in application order.
static BUILTIN_RULES: LazyLock<Vec<RewriteRule>> = LazyLock::new(|| {
    vec![
        rule(
            "table_hints",
            r"(?i)\s*\bWITH\s*\(\s*(?:NOLOCK|READUNCOMMITTED|READCOMMITTED|READPAST|ROWLOCK|PAGLOCK|TABLOCK|TABLOCKX|HOLDLOCK|UPDLOCK|XLOCK|NOWAIT|SERIALIZABLE|REPEATABLEREAD)\b[^)]*\)",
            "",
        ),
        rule("bare_nolock", r"(?i)\s*\(\s*NOLOCK\s*\)", ""),
        rule("schemabinding", r"(?i)\bWITH\s+SCHEMABINDING\b\s*", ""),
        rule("query_options", r"(?is)\s*\bOPTION\s*\([^)]*\)\s*$", ""),
        rule("brackets", r"\[([^\]]+)\]", "\"$1\""),
        rule("getdate", r"(?i)\b(?:GETDATE|SYSDATETIME)\s*\(\s*\)", "NOW()"),
        rule(
            "getutcdate",
            r"(?i)\b(?:GETUTCDATE|SYSUTCDATETIME)\s*\(\s*\)",
            "(NOW() AT TIME ZONE 'utc')",
        ),
        rule("isnull", r"(?i)\bISNULL\s*\(", "COALESCE("),
        rule("len", r"(?i)\bLEN\s*\(", "LENGTH("),
        rule("newid", r"(?i)\bNEWID\s*\(\s*\)", "gen_random_uuid()"),
        rule(
            "charindex",
            r"(?i)\bCHARINDEX\s*\(\s*([^,()]+?)\s*,\s*([^,()]+?)\s*\)",
            "STRPOS($2, $1)",
        ),
        rule("unicode_prefix", r"\bN(\x01\d+\x01)", "$1"),
        rule("concat_after_literal", r"(\x01\d+\x01)\s*\+\s*", "$1 || "),
        rule("concat_before_literal", r"\s*\+\s*(\x01\d+\x01)", " || $1"),
        rule("default_schema", r#"(?i)(?:"dbo"|\bdbo)\."#, "public."),
    ]
});

/// Constructs refused outright, checked against the literal-free text.
static UNSUPPORTED: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("CROSS/OUTER APPLY", r"(?i)\b(?:CROSS|OUTER)\s+APPLY\b"),
        ("PIVOT/UNPIVOT", r"(?i)\b(?:UN)?PIVOT\b"),
        ("FOR XML", r"(?i)\bFOR\s+XML\b"),
        ("FOR JSON", r"(?i)\bFOR\s+JSON\b"),
        ("TOP ... PERCENT", r"(?i)\bTOP\s*(?:\(\s*\d+\s*\)|\d+)\s*PERCENT\b"),
        ("TOP ... WITH TIES", r"(?i)\bWITH\s+TIES\b"),
        ("OPENQUERY/OPENROWSET", r"(?i)\bOPEN(?:QUERY|ROWSET|DATASOURCE)\b"),
        ("T-SQL variables", r"@@?\w+"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).unwrap()))
    .collect()
});

static HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*CREATE\s+(?:OR\s+ALTER\s+)?VIEW\s+.+?\bAS\b\s*").unwrap()
});
static GO_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*GO\s*;?\s*$").unwrap());
static TOP_ANY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bTOP\b").unwrap());
static DELIMITED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\[[^\]]*\]|"[^"]*""#).unwrap());
static LEADING_TOP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^(\s*SELECT\s+(?:(?:DISTINCT|ALL)\s+)?)TOP\s*(?:\(\s*(\d+)\s*\)|(\d+))\s*")
        .unwrap()
});
static IDENT_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""([^"]+)"|\b([A-Za-z_][A-Za-z0-9_]*)\b"#).unwrap()
});
/// Text ending where a table name starts.
static TABLE_POSITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:FROM|JOIN)\s+(?:(?:"[^"]+"|[A-Za-z_][A-Za-z0-9_]*)\.)?$"#).unwrap()
});
/// Text ending where a table alias starts.
static ALIAS_POSITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b(?:FROM|JOIN)\s+(?:(?:"[^"]+"|[A-Za-z_][A-Za-z0-9_]*)\.)?(?:"[^"]+"|[A-Za-z_][A-Za-z0-9_]*)\s+(?:AS\s+)?$"#,
    )
    .unwrap()
});
static AFTER_AS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bAS\s+$").unwrap());
static FROM_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(FROM|JOIN)(\s+)(?:([A-Za-z_][A-Za-z0-9_]*)\.)?([A-Za-z_][A-Za-z0-9_]*)\b")
        .unwrap()
});
static CHARINDEX_LEFT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bCHARINDEX\b").unwrap());
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\x01(\d+)\x01").unwrap());

/// Words that can follow FROM/JOIN without being a table name.
const NOT_TABLES: &[&str] = &["select", "lateral", "only", "unnest", "values"];

/// Keywords never treated as column references, even when a column has that name.
const KEYWORDS: &[&str] = &[
    "all", "and", "any", "as", "asc", "between", "by", "case", "cross", "desc", "distinct",
    "else", "end", "exists", "from", "full", "group", "having", "in", "inner", "is", "join",
    "left", "like", "not", "null", "on", "or", "order", "outer", "over", "partition", "right",
    "select", "some", "then", "union", "when", "where", "with",
];

/// Rewrites SQL Server view definitions into PostgreSQL queries.
#[derive(Debug, Clone)]
pub struct ViewTranslator {
    identifiers: IdentifierTranslator,
    extra_rules: Vec<RewriteRule>,
    /// Lowercased source column name to the name it was created with.
    columns: HashMap<String, String>,
    /// Lowercased source table name to its target name.
    tables: HashMap<String, String>,
}

impl Default for ViewTranslator {
    fn default() -> Self {
        Self::new(IdentifierTranslator::identity())
    }
}

impl ViewTranslator {
    pub fn new(identifiers: IdentifierTranslator) -> Self {
        Self {
            identifiers,
            extra_rules: Vec::new(),
            columns: HashMap::new(),
            tables: HashMap::new(),
        }
    }

    /// Resolve references through the planned tables, so column and table
    /// names match what was created. When two tables map the same source
    /// column differently, the first table in plan order wins.
    pub fn with_tables<'p, I>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = &'p TablePlan>,
    {
        for table in tables {
            self.tables
                .entry(table.source.name.name.to_lowercase())
                .or_insert_with(|| table.target_name.clone());
            for column in &table.columns {
                self.columns
                    .entry(column.source_name.to_lowercase())
                    .or_insert_with(|| column.target_name.clone());
            }
        }
        self
    }

    /// Append a rule that runs after the built-in rewrites.
    pub fn add_rule(&mut self, rule: RewriteRule) {
        debug!("Added view rewrite rule '{}'", rule.name);
        self.extra_rules.push(rule);
    }

    /// Target schema and name for a source view.
    pub fn target_name(&self, view: &QualifiedName) -> (String, String) {
        (
            target_schema_name(&view.schema, &self.identifiers),
            truncate_identifier(&self.identifiers.translate(&view.name)),
        )
    }

    fn table_target(&self, name: &str) -> String {
        self.tables
            .get(&name.to_lowercase())
            .cloned()
            .unwrap_or_else(|| truncate_identifier(&self.identifiers.translate(name)))
    }

    /// Target name for a table qualifier, if it names something we know.
    fn known_table(&self, name: &str) -> Option<String> {
        if let Some(target) = self.tables.get(&name.to_lowercase()) {
            return Some(target.clone());
        }
        let translated = self.identifiers.translate(name);
        (translated != name).then(|| truncate_identifier(&translated))
    }

    /// Target name for a column reference, if it names something we know.
    fn column_target(&self, name: &str) -> Option<String> {
        if let Some(target) = self.columns.get(&name.to_lowercase()) {
            return Some(target.clone());
        }
        let translated = self.identifiers.translate(name);
        (translated != name).then(|| truncate_identifier(&translated))
    }

    pub fn translate(&self, view: &ViewDefinition) -> TranslationResult {
        self.translate_sql(&view.name.to_string(), &view.definition)
    }

    pub fn translate_sql(&self, view: &str, sql: &str) -> TranslationResult {
        let (target_sql, error) = match self.rewrite(sql) {
            Ok(translated) => (Some(translated), None),
            Err(reason) => (None, Some(reason)),
        };
        TranslationResult {
            view: view.to_string(),
            original_sql: sql.to_string(),
            target_sql,
            error,
        }
    }

    fn rewrite(&self, sql: &str) -> std::result::Result<String, String> {
        let (protected, literals) = protect_literals(sql);

        let body = HEADER.replace(&protected, "");
        let body = GO_LINE.replace_all(&body, "");
        let mut body = body.trim().trim_end_matches(';').trim_end().to_string();
        if body.is_empty() {
            return Err("view definition has no query body".to_string());
        }

        // Keywords inside [..] or ".." are names, not syntax
        let masked = DELIMITED.replace_all(&body, "\"_\"");
        for (name, pattern) in UNSUPPORTED.iter() {
            if pattern.is_match(&masked) {
                return Err(format!("unsupported construct: {}", name));
            }
        }

        let limit = match TOP_ANY.find_iter(&masked).count() {
            0 => None,
            1 => {
                let caps = LEADING_TOP
                    .captures(&body)
                    .ok_or_else(|| "unsupported construct: TOP outside the outer SELECT".to_string())?;
                let count = caps
                    .get(2)
                    .or_else(|| caps.get(3))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                body = LEADING_TOP.replace(&body, "$1").into_owned();
                Some(count)
            }
            _ => return Err("unsupported construct: more than one TOP".to_string()),
        };

        for rule in BUILTIN_RULES.iter().chain(self.extra_rules.iter()) {
            body = rule.apply(&body);
        }

        if CHARINDEX_LEFT.is_match(&body) {
            return Err("unsupported construct: CHARINDEX with nested or extra arguments".to_string());
        }

        body = self.map_identifiers(&body);
        body = self.quote_table_names(&body);

        let mut translated = restore_literals(body.trim_end(), &literals);
        if let Some(count) = limit {
            translated.push_str("\nLIMIT ");
            translated.push_str(&count);
        }
        Ok(translated)
    }

    /// Rename quoted identifiers and bare column references, quoting the
    /// result so PostgreSQL keeps its case. Bare table names are left for
    /// [`Self::quote_table_names`].
    fn map_identifiers(&self, body: &str) -> String {
        IDENT_TOKEN
            .replace_all(body, |caps: &Captures| {
                let whole = &caps[0];
                let Some(m) = caps.get(0) else {
                    return whole.to_string();
                };
                let before = tail(&body[..m.start()], CONTEXT_BYTES);
                let after = &body[m.end()..];
                let is_qualifier = after.starts_with('.');
                let at_table = TABLE_POSITION.is_match(before);

                if let Some(quoted) = caps.get(1).map(|q| q.as_str()) {
                    let target = if at_table && is_qualifier {
                        target_schema_name(quoted, &self.identifiers)
                    } else if at_table || is_qualifier {
                        self.table_target(quoted)
                    } else {
                        self.columns
                            .get(&quoted.to_lowercase())
                            .cloned()
                            .unwrap_or_else(|| truncate_identifier(&self.identifiers.translate(quoted)))
                    };
                    return format!("\"{}\"", target);
                }

                let word = caps.get(2).map(|w| w.as_str()).unwrap_or(whole);
                if is_qualifier && !at_table {
                    // table-qualified column reference
                    return match self.known_table(word) {
                        Some(target) => format!("\"{}\"", target),
                        None => whole.to_string(),
                    };
                }
                let is_call = after.trim_start().starts_with('(');
                let is_cast_type = AFTER_AS.is_match(before) && after.trim_start().starts_with(')');
                if is_call
                    || is_qualifier
                    || is_cast_type
                    || KEYWORDS.iter().any(|k| word.eq_ignore_ascii_case(k))
                    || at_table
                    || ALIAS_POSITION.is_match(before)
                {
                    return whole.to_string();
                }
                match self.column_target(word) {
                    Some(target) => format!("\"{}\"", target),
                    None => whole.to_string(),
                }
            })
            .into_owned()
    }

    /// Quote bare table names after FROM/JOIN so they keep the case the
    /// tables were created with.
    fn quote_table_names(&self, body: &str) -> String {
        FROM_TABLE
            .replace_all(body, |caps: &Captures| {
                let whole = &caps[0];
                let name = &caps[4];
                let end = caps.get(0).map(|m| m.end()).unwrap_or(body.len());
                let rest = body[end..].trim_start();
                // function call, or the schema part of an already-quoted name
                if rest.starts_with('(') || body[end..].starts_with('.') {
                    return whole.to_string();
                }
                if caps.get(3).is_none() && NOT_TABLES.iter().any(|w| name.eq_ignore_ascii_case(w)) {
                    return whole.to_string();
                }

                let schema = match caps.get(3).map(|m| m.as_str()) {
                    None => String::new(),
                    Some(s) if s.eq_ignore_ascii_case("public") => "public.".to_string(),
                    Some(s) => format!("\"{}\".", target_schema_name(s, &self.identifiers)),
                };
                format!("{}{}{}\"{}\"", &caps[1], &caps[2], schema, self.table_target(name))
            })
            .into_owned()
    }
}

/// Bytes of preceding text inspected when classifying an identifier.
const CONTEXT_BYTES: usize = 256;

/// The last `max` bytes of `s`, widened to a character boundary.
fn tail(s: &str, max: usize) -> &str {
    let mut start = s.len().saturating_sub(max);
    while !s.is_char_boundary(start) {
        start -= 1;
    }
    &s[start..]
}

/// Replace string literals with `\x01<n>\x01` placeholders and drop comments.
/// Bracketed and double-quoted identifiers are copied through untouched.
fn protect_literals(sql: &str) -> (String, Vec<String>) {
    let mut out = String::with_capacity(sql.len());
    let mut literals = Vec::new();
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                let mut literal = String::from('\'');
                while let Some(ch) = chars.next() {
                    literal.push(ch);
                    if ch == '\'' {
                        if chars.peek() == Some(&'\'') {
                            literal.push('\'');
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
                out.push('\u{1}');
                out.push_str(&literals.len().to_string());
                out.push('\u{1}');
                literals.push(literal);
            }
            '[' | '"' => {
                let close = if c == '[' { ']' } else { '"' };
                out.push(c);
                for ch in chars.by_ref() {
                    out.push(ch);
                    if ch == close {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                for ch in chars.by_ref() {
                    if ch == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for ch in chars.by_ref() {
                    if prev == '*' && ch == '/' {
                        break;
                    }
                    prev = ch;
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }

    (out, literals)
}

fn restore_literals(sql: &str, literals: &[String]) -> String {
    PLACEHOLDER
        .replace_all(sql, |caps: &Captures| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|i| literals.get(i))
                .cloned()
                .unwrap_or_default()
        })
        .into_owned()
}

/// Views created on the target, plus everything that went wrong.
#[derive(Debug, Clone, Default)]
pub struct ViewOutcome {
    pub results: Vec<TranslationResult>,
    pub created: usize,
    pub errors: Vec<RecordedError>,
}

/// Translate every view and create the successful ones.
///
/// Views may reference each other, so creation is retried in passes until a
/// pass creates nothing new. A view still failing after that keeps the last
/// database error.
pub async fn create_views(
    target: &dyn TargetPool,
    translator: &ViewTranslator,
    views: &[ViewDefinition],
    cancel: &CancellationToken,
) -> ViewOutcome {
    let mut outcome = ViewOutcome {
        results: views.iter().map(|v| translator.translate(v)).collect(),
        ..Default::default()
    };

    for result in outcome.results.iter().filter(|r| r.target_sql.is_none()) {
        warn!("View {} not translated: {}", result.view, result.error.as_deref().unwrap_or(""));
    }

    let mut pending: Vec<usize> = outcome
        .results
        .iter()
        .enumerate()
        .filter(|(_, r)| r.target_sql.is_some())
        .map(|(i, _)| i)
        .collect();
    let mut last_error: Vec<Option<String>> = vec![None; views.len()];

    for pass in 1..=views.len() {
        if pending.is_empty() || cancel.is_cancelled() {
            break;
        }
        debug!("View creation pass {} with {} pending", pass, pending.len());

        let mut still_pending = Vec::new();
        for &i in &pending {
            let (schema, name) = translator.target_name(&views[i].name);
            let sql = outcome.results[i].target_sql.as_deref().unwrap_or_default();
            match target.create_view(&schema, &name, sql).await {
                Ok(()) => {
                    info!("Created view {}.{}", schema, name);
                    outcome.created += 1;
                }
                Err(e) => {
                    last_error[i] = Some(e.to_string());
                    still_pending.push(i);
                }
            }
        }

        let progressed = still_pending.len() < pending.len();
        pending = still_pending;
        if !progressed {
            break;
        }
    }

    for i in pending {
        outcome.results[i].error = Some(
            last_error[i]
                .take()
                .unwrap_or_else(|| "view creation was cancelled".to_string()),
        );
    }

    for result in &outcome.results {
        if let Some(message) = &result.error {
            warn!("View {} failed: {}", result.view, message);
            outcome.errors.push(RecordedError::new(
                ErrorScope::View,
                result.view.clone(),
                ErrorKind::ViewTranslation,
                message.clone(),
            ));
        }
    }

    outcome
}

#[derive(Serialize)]
struct ViewErrorEntry<'a> {
    view: &'a str,
    original_sql: &'a str,
    translated_sql: Option<&'a str>,
    error: &'a str,
}

/// Write the failed views as a JSON array for manual follow-up.
pub fn write_view_errors(path: &Path, results: &[TranslationResult]) -> Result<usize> {
    let entries: Vec<ViewErrorEntry<'_>> = results
        .iter()
        .filter_map(|r| {
            r.error.as_deref().map(|error| ViewErrorEntry {
                view: &r.view,
                original_sql: &r.original_sql,
                translated_sql: r.target_sql.as_deref(),
                error,
            })
        })
        .collect();
    write_json_atomic(path, &serde_json::to_string_pretty(&entries)?)?;
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{build_plan, MigrationPlan};
    use crate::schema_def::SchemaDefinitions;
    use crate::source::{Column, SchemaMetadata, Table};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn make_test_translator() -> ViewTranslator {
        ViewTranslator::default()
    }

    /// Plan over `(schema, table, columns)` triples, all columns int.
    fn make_test_plan(identifiers: &IdentifierTranslator, tables: &[(&str, &str, &[&str])]) -> MigrationPlan {
        let mut meta = SchemaMetadata::default();
        for (schema, name, columns) in tables {
            let mut table = Table::new(QualifiedName::new(*schema, *name));
            for (i, column) in columns.iter().enumerate() {
                table.columns.push(Column {
                    name: column.to_string(),
                    data_type: "int".to_string(),
                    max_length: 4,
                    precision: 10,
                    scale: 0,
                    is_nullable: true,
                    default: None,
                    is_identity: false,
                    ordinal_pos: i as i32 + 1,
                });
            }
            meta.insert(table);
        }
        build_plan(&meta, identifiers, &SchemaDefinitions::default(), &BTreeMap::new())
    }

    fn translated(sql: &str) -> String {
        let result = make_test_translator().translate_sql("dbo.v", sql);
        assert!(result.error.is_none(), "unexpected error: {:?}", result.error);
        result.target_sql.unwrap()
    }

    fn refused(sql: &str) -> String {
        let result = make_test_translator().translate_sql("dbo.v", sql);
        assert!(result.target_sql.is_none());
        result.error.unwrap()
    }

    #[test]
    fn test_top_becomes_limit() {
        let sql = translated("SELECT TOP 10 [Name] FROM [dbo].[Customers]");
        assert!(sql.contains("LIMIT 10"));
        assert!(!sql.to_uppercase().contains("TOP"));
        assert_eq!(sql, "SELECT \"Name\" FROM public.\"Customers\"\nLIMIT 10");
    }

    #[test]
    fn test_top_in_parentheses_with_order_by() {
        let sql = translated("SELECT DISTINCT TOP (5) Id FROM dbo.Orders ORDER BY Id DESC");
        assert_eq!(sql, "SELECT DISTINCT Id FROM public.\"Orders\" ORDER BY Id DESC\nLIMIT 5");
    }

    #[test]
    fn test_create_view_header_and_go_removed() {
        let sql = translated(
            "CREATE VIEW [dbo].[ActiveCustomers] WITH SCHEMABINDING AS\n\
             SELECT [Id], [Name] FROM [dbo].[Customers] WITH (NOLOCK) WHERE [Active] = 1;\nGO\n",
        );
        assert_eq!(
            sql,
            "SELECT \"Id\", \"Name\" FROM public.\"Customers\" WHERE \"Active\" = 1"
        );
    }

    #[test]
    fn test_functions_rewritten() {
        let sql = translated("SELECT ISNULL(a, 0), LEN(b), GETDATE(), NEWID() FROM t");
        assert_eq!(
            sql,
            "SELECT COALESCE(a, 0), LENGTH(b), NOW(), gen_random_uuid() FROM \"t\""
        );
        let utc = translated("SELECT GETUTCDATE() AS ts");
        assert_eq!(utc, "SELECT (NOW() AT TIME ZONE 'utc') AS ts");
    }

    #[test]
    fn test_charindex_swaps_arguments() {
        let sql = translated("SELECT CHARINDEX(',', [Name]) AS pos FROM [dbo].[People]");
        assert_eq!(sql, "SELECT STRPOS(\"Name\", ',') AS pos FROM public.\"People\"");
        let err = refused("SELECT CHARINDEX('a', Name, 5) FROM t");
        assert!(err.contains("CHARINDEX"));
    }

    #[test]
    fn test_string_concatenation() {
        let sql = translated("SELECT [First] + N' ' + [Last] AS FullName FROM dbo.People");
        assert_eq!(
            sql,
            "SELECT \"First\" || ' ' || \"Last\" AS FullName FROM public.\"People\""
        );
        // numeric addition is left alone
        assert_eq!(translated("SELECT a + 1 FROM t"), "SELECT a + 1 FROM \"t\"");
    }

    #[test]
    fn test_literals_are_not_rewritten() {
        let sql = translated("SELECT Name FROM t WHERE Code LIKE '[A-Z]%' AND Note <> 'dbo.x TOP 1'");
        assert_eq!(
            sql,
            "SELECT Name FROM \"t\" WHERE Code LIKE '[A-Z]%' AND Note <> 'dbo.x TOP 1'"
        );
    }

    #[test]
    fn test_comments_removed() {
        let sql = translated("SELECT a -- trailing [note]\nFROM t /* block */");
        assert_eq!(sql, "SELECT a \nFROM \"t\"");
    }

    #[test]
    fn test_unsupported_constructs_refused() {
        assert!(refused("SELECT * FROM a CROSS APPLY fn(a.id)").contains("APPLY"));
        assert!(refused("SELECT * FROM s PIVOT (SUM(x) FOR y IN ([1])) p").contains("PIVOT"));
        assert!(refused("SELECT a FROM t FOR XML PATH('')").contains("FOR XML"));
        assert!(refused("SELECT TOP 10 PERCENT a FROM t").contains("PERCENT"));
        assert!(refused("SELECT TOP 3 WITH TIES a FROM t ORDER BY a").contains("TIES"));
        assert!(refused("SELECT a FROM t WHERE b = @p").contains("variables"));
        assert!(refused("SELECT TOP 1 a FROM (SELECT TOP 5 a FROM t) x").contains("more than one TOP"));
        assert!(refused("SELECT a FROM (SELECT TOP 5 a FROM t) x").contains("outer SELECT"));
    }

    #[test]
    fn test_identifier_dictionary_applied() {
        let translator = ViewTranslator::new(IdentifierTranslator::new([
            ("Kunden", "customers"),
            ("Name", "name"),
        ]));
        let result = translator.translate_sql("dbo.v", "SELECT [Name] FROM dbo.Kunden");
        assert_eq!(
            result.target_sql.as_deref(),
            Some("SELECT \"name\" FROM public.\"customers\"")
        );
        let (schema, name) = translator.target_name(&QualifiedName::new("dbo", "Kunden"));
        assert_eq!((schema.as_str(), name.as_str()), ("public", "customers"));
    }

    #[test]
    fn test_other_schema_quoted() {
        let sql = translated("SELECT o.Id FROM Sales.Orders o JOIN dbo.Customers c ON c.Id = o.CustomerId");
        assert_eq!(
            sql,
            "SELECT o.Id FROM \"Sales\".\"Orders\" o JOIN public.\"Customers\" c ON c.Id = o.CustomerId"
        );
    }

    #[test]
    fn test_other_schema_columns_resolved_through_plan() {
        let identifiers = IdentifierTranslator::identity();
        let plan = make_test_plan(
            &identifiers,
            &[("Sales", "Orders", &["Id", "CustomerId"]), ("dbo", "Customers", &["Id", "Name"])],
        );
        let translator = ViewTranslator::new(identifiers).with_tables(&plan.tables);
        let result = translator.translate_sql(
            "dbo.v",
            "SELECT o.Id FROM Sales.Orders o JOIN dbo.Customers c ON c.Id = o.CustomerId",
        );
        assert_eq!(
            result.target_sql.as_deref(),
            Some("SELECT o.\"Id\" FROM \"Sales\".\"Orders\" o JOIN public.\"Customers\" c ON c.\"Id\" = o.\"CustomerId\"")
        );
    }

    #[test]
    fn test_renamed_columns_match_created_names() {
        let identifiers = IdentifierTranslator::new([
            ("Kunden", "customers"),
            ("Kunde_Nummer", "customer_number"),
        ]);
        let sql = "SELECT [Kunde_Nummer], Kunde_Nummer, k.CustomerId FROM dbo.Kunden k";

        // Dictionary alone: renamed names are quoted, unknown ones untouched
        let result = ViewTranslator::new(identifiers.clone()).translate_sql("dbo.v", sql);
        assert_eq!(
            result.target_sql.as_deref(),
            Some("SELECT \"customer_number\", \"customer_number\", k.CustomerId FROM public.\"customers\" k")
        );

        // With the plan, mixed-case columns keep the case they were created with
        let plan = make_test_plan(&identifiers, &[("dbo", "Kunden", &["Kunde_Nummer", "CustomerId"])]);
        let result = ViewTranslator::new(identifiers)
            .with_tables(&plan.tables)
            .translate_sql("dbo.v", sql);
        assert_eq!(
            result.target_sql.as_deref(),
            Some("SELECT \"customer_number\", \"customer_number\", k.\"CustomerId\" FROM public.\"customers\" k")
        );
    }

    #[test]
    fn test_first_planned_table_wins_for_shared_column() {
        let identifiers = IdentifierTranslator::identity();
        let plan = make_test_plan(&identifiers, &[("dbo", "A", &["Code"]), ("dbo", "B", &["CODE"])]);
        let translator = ViewTranslator::new(identifiers).with_tables(&plan.tables);
        let result = translator.translate_sql("dbo.v", "SELECT code FROM dbo.B");
        assert_eq!(result.target_sql.as_deref(), Some("SELECT \"Code\" FROM public.\"B\""));
    }

    #[test]
    fn test_keywords_inside_delimited_names_not_refused() {
        assert_eq!(translated("SELECT [Top], Name FROM t"), "SELECT \"Top\", Name FROM \"t\"");
        assert_eq!(
            translated("SELECT TOP 5 [Top] FROM t"),
            "SELECT \"Top\" FROM \"t\"\nLIMIT 5"
        );
        assert_eq!(
            translated("SELECT [Pivot], \"For Xml\" FROM t"),
            "SELECT \"Pivot\", \"For Xml\" FROM \"t\""
        );
        // the real construct is still refused
        assert!(refused("SELECT [Pivot] FROM s PIVOT (SUM(x) FOR y IN ([1])) p").contains("PIVOT"));
    }

    #[test]
    fn test_extra_rule_runs_after_builtins() {
        let mut translator = make_test_translator();
        translator.add_rule(RewriteRule::new("datediff_day", r"(?i)\bDATEDIFF\s*\(\s*day\s*,", "date_diff_days(").unwrap());
        let result = translator.translate_sql("dbo.v", "SELECT DATEDIFF(day, a, b) FROM t");
        assert_eq!(
            result.target_sql.as_deref(),
            Some("SELECT date_diff_days( a, b) FROM \"t\"")
        );
        assert!(RewriteRule::new("bad", "(", "").is_err());
    }

    #[test]
    fn test_write_view_errors_only_failed() {
        let translator = make_test_translator();
        let results = vec![
            translator.translate_sql("dbo.ok", "SELECT 1 AS one"),
            translator.translate_sql("dbo.bad", "SELECT * FROM a CROSS APPLY b"),
        ];
        let dir = tempdir().unwrap();
        let path = dir.path().join("view_errors.json");
        assert_eq!(write_view_errors(&path, &results).unwrap(), 1);

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["view"], "dbo.bad");
        assert!(json[0]["translated_sql"].is_null());
        assert!(json[0]["error"].as_str().unwrap().contains("APPLY"));
    }
}
