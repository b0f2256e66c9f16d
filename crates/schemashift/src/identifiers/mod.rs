//! Identifier renaming, collision handling and the table filter.

use crate::error::{MigrateError, Result};
use crate::source::QualifiedName;
use crate::target::{truncate_identifier, truncate_to, MAX_IDENTIFIER_LEN};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use tracing::{debug, warn};

/// Case-insensitive dictionary of identifier renames.
#[derive(Debug, Clone, Default)]
pub struct IdentifierTranslator {
    entries: HashMap<String, String>,
}

impl IdentifierTranslator {
    /// A translator that leaves every identifier unchanged.
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_lowercase(), v.into()))
                .collect(),
        }
    }

    /// Load a `{ "source": "target" }` JSON object.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrateError::Config(format!("cannot read translations file {}: {}", path.display(), e))
        })?;
        let translator = Self::from_json(&content)?;
        debug!("Loaded {} identifier translations from {}", translator.len(), path.display());
        Ok(translator)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let entries: HashMap<String, String> = serde_json::from_str(json)
            .map_err(|e| MigrateError::Config(format!("invalid translations JSON: {}", e)))?;
        Ok(Self::new(entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact (case-insensitive) lookup.
    pub fn lookup(&self, identifier: &str) -> Option<&str> {
        self.entries
            .get(&identifier.to_lowercase())
            .map(String::as_str)
    }

    /// Translate the whole identifier if it is in the dictionary, otherwise
    /// translate each `_`-separated part independently.
    pub fn translate(&self, identifier: &str) -> String {
        if let Some(target) = self.lookup(identifier) {
            return target.to_string();
        }
        if !identifier.contains('_') {
            return identifier.to_string();
        }
        identifier
            .split('_')
            .map(|part| self.lookup(part).unwrap_or(part))
            .collect::<Vec<_>>()
            .join("_")
    }
}

/// Make names unique within one table, case-insensitively, by appending
/// 2, 3, ... in declaration order. The first occurrence keeps its name.
///
/// Names are compared after truncation to PostgreSQL's identifier limit, and
/// the stem is shortened so a suffixed name still fits.
pub fn resolve_collisions<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    let mut taken: HashSet<String> = HashSet::with_capacity(names.len());
    let mut resolved = Vec::with_capacity(names.len());

    for name in names {
        let name = truncate_identifier(name.as_ref());
        let mut candidate = name.clone();
        let mut suffix = 2;
        while taken.contains(&candidate.to_lowercase()) {
            let tag = suffix.to_string();
            candidate = format!("{}{}", truncate_to(&name, MAX_IDENTIFIER_LEN - tag.len()), tag);
            suffix += 1;
        }
        taken.insert(candidate.to_lowercase());
        resolved.push(candidate);
    }

    resolved
}

/// Tables selected for migration, matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    entries: BTreeSet<(String, String)>,
}

impl TableFilter {
    /// Load a file with one `schema.Table` per line.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrateError::Config(format!("cannot read tables file {}: {}", path.display(), e))
        })?;
        Ok(Self::parse(&content))
    }

    /// Blank lines and `#` comments are ignored; malformed lines are logged and skipped.
    pub fn parse(content: &str) -> Self {
        let mut entries = BTreeSet::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match QualifiedName::parse(line) {
                Some(name) => {
                    entries.insert((name.schema.to_lowercase(), name.name.to_lowercase()));
                }
                None => warn!(
                    "Ignoring tables file line {}: expected schema.Table, got '{}'",
                    lineno + 1,
                    line
                ),
            }
        }
        Self { entries }
    }

    pub fn from_names<'a, I>(names: I) -> Self
    where
        I: IntoIterator<Item = &'a QualifiedName>,
    {
        Self {
            entries: names
                .into_iter()
                .map(|n| (n.schema.to_lowercase(), n.name.to_lowercase()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &QualifiedName) -> bool {
        self.entries
            .contains(&(name.schema.to_lowercase(), name.name.to_lowercase()))
    }

    /// Entries that matched none of `names`, rendered as `schema.table`.
    pub fn unmatched<'a, I>(&self, names: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a QualifiedName>,
    {
        let seen: BTreeSet<(String, String)> = names
            .into_iter()
            .map(|n| (n.schema.to_lowercase(), n.name.to_lowercase()))
            .collect();
        self.entries
            .difference(&seen)
            .map(|(s, t)| format!("{}.{}", s, t))
            .collect()
    }
}
