//! Foreign-key dependency ordering.
//!
//! Tables are ordered with Kahn's algorithm over "child depends on parent"
//! edges. The ready set is a `BTreeSet`, so ties always resolve to the lowest
//! qualified name and the same input yields the same order. When the sort
//! stalls on a cycle, one edge is deferred: its foreign key is still applied
//! after the data load, but it no longer constrains ordering.

use crate::source::{QualifiedName, Table};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::{debug, warn};

/// A dependency edge dropped from ordering to break a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeferredEdge {
    pub child: QualifiedName,
    pub parent: QualifiedName,
    /// Foreign keys on `child` that reference `parent`.
    pub foreign_keys: Vec<String>,
}

/// A cycle found while ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleWarning {
    /// Tables on the cycle, starting at the table whose edge was deferred.
    pub tables: Vec<QualifiedName>,
    pub broken_edge: DeferredEdge,
    pub message: String,
}

/// Output of [`resolve`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct Resolution {
    /// Parents before children.
    pub creation_order: Vec<QualifiedName>,

    /// Order in which data is loaded. Same as `creation_order`.
    pub data_order: Vec<QualifiedName>,

    /// Edges removed to break cycles.
    pub deferred_edges: Vec<DeferredEdge>,

    pub cycles: Vec<CycleWarning>,

    /// Tables with a foreign key to themselves.
    pub self_referencing: BTreeSet<QualifiedName>,

    /// In-scope parents each table waits for, excluding self references and
    /// deferred edges. Every table in scope has an entry.
    pub dependencies: BTreeMap<QualifiedName, BTreeSet<QualifiedName>>,
}

impl Resolution {
    /// Position of a table in the data order.
    pub fn position(&self, table: &QualifiedName) -> Option<usize> {
        self.data_order.iter().position(|t| t == table)
    }

    pub fn is_deferred(&self, child: &QualifiedName, parent: &QualifiedName) -> bool {
        self.deferred_edges
            .iter()
            .any(|e| &e.child == child && &e.parent == parent)
    }
}

/// Order tables so every foreign-key parent precedes its children.
///
/// References to tables outside the given set are ignored for ordering.
pub fn resolve<'a, I>(tables: I) -> Resolution
where
    I: IntoIterator<Item = &'a Table>,
{
    let tables: Vec<&Table> = tables.into_iter().collect();

    // Source catalogs compare names case-insensitively
    let by_lower: HashMap<(String, String), &QualifiedName> = tables
        .iter()
        .map(|t| {
            (
                (t.name.schema.to_lowercase(), t.name.name.to_lowercase()),
                &t.name,
            )
        })
        .collect();

    let mut parents: BTreeMap<QualifiedName, BTreeSet<QualifiedName>> = BTreeMap::new();
    let mut fk_names: BTreeMap<(QualifiedName, QualifiedName), Vec<String>> = BTreeMap::new();
    let mut self_referencing = BTreeSet::new();

    for table in &tables {
        parents.entry(table.name.clone()).or_default();
        for fk in &table.foreign_keys {
            let key = (
                fk.ref_table.schema.to_lowercase(),
                fk.ref_table.name.to_lowercase(),
            );
            let Some(parent) = by_lower.get(&key) else {
                debug!(
                    "{}: foreign key {} references {} outside the migration scope",
                    table.name, fk.name, fk.ref_table
                );
                continue;
            };
            if *parent == &table.name {
                self_referencing.insert(table.name.clone());
                continue;
            }
            parents
                .entry(table.name.clone())
                .or_default()
                .insert((*parent).clone());
            fk_names
                .entry((table.name.clone(), (*parent).clone()))
                .or_default()
                .push(fk.name.clone());
        }
    }

    let mut children: BTreeMap<&QualifiedName, BTreeSet<&QualifiedName>> = BTreeMap::new();
    for (child, ps) in &parents {
        for parent in ps {
            children.entry(parent).or_default().insert(child);
        }
    }

    let mut remaining_parents: BTreeMap<QualifiedName, BTreeSet<QualifiedName>> = parents.clone();
    let mut ready: BTreeSet<QualifiedName> = remaining_parents
        .iter()
        .filter(|(_, ps)| ps.is_empty())
        .map(|(t, _)| t.clone())
        .collect();
    let mut done: BTreeSet<QualifiedName> = BTreeSet::new();
    let mut order = Vec::with_capacity(parents.len());
    let mut deferred_edges = Vec::new();
    let mut cycles = Vec::new();

    while order.len() < parents.len() {
        if let Some(next) = ready.pop_first() {
            if let Some(kids) = children.get(&next) {
                for kid in kids {
                    if let Some(ps) = remaining_parents.get_mut(*kid) {
                        if ps.remove(&next) && ps.is_empty() && !done.contains(*kid) {
                            ready.insert((*kid).clone());
                        }
                    }
                }
            }
            done.insert(next.clone());
            order.push(next);
            continue;
        }

        // Stalled: every remaining table waits on another one
        let Some((child, parent, path)) = find_cycle_edge(&remaining_parents, &done) else {
            break;
        };

        let edge = DeferredEdge {
            child: child.clone(),
            parent: parent.clone(),
            foreign_keys: fk_names
                .get(&(child.clone(), parent.clone()))
                .cloned()
                .unwrap_or_default(),
        };
        let rendered: Vec<String> = path
            .iter()
            .chain(std::iter::once(&child))
            .map(ToString::to_string)
            .collect();
        let message = format!(
            "foreign key cycle {}; deferring dependency of {} on {}",
            rendered.join(" -> "),
            child,
            parent
        );
        warn!("{}", message);

        if let Some(ps) = remaining_parents.get_mut(&child) {
            ps.remove(&parent);
            if ps.is_empty() {
                ready.insert(child.clone());
            }
        }
        cycles.push(CycleWarning {
            tables: path,
            broken_edge: edge.clone(),
            message,
        });
        deferred_edges.push(edge);
    }

    let mut dependencies = parents;
    for edge in &deferred_edges {
        if let Some(ps) = dependencies.get_mut(&edge.child) {
            ps.remove(&edge.parent);
        }
    }

    Resolution {
        data_order: order.clone(),
        creation_order: order,
        deferred_edges,
        cycles,
        self_referencing,
        dependencies,
    }
}

/// Pick the edge to defer: the lowest unfinished table on a cycle, and its
/// lowest parent that leads back to it. Returns `(child, parent, cycle)`
/// where `cycle` starts at `child`.
fn find_cycle_edge(
    remaining: &BTreeMap<QualifiedName, BTreeSet<QualifiedName>>,
    done: &BTreeSet<QualifiedName>,
) -> Option<(QualifiedName, QualifiedName, Vec<QualifiedName>)> {
    for (node, ps) in remaining {
        if done.contains(node) {
            continue;
        }
        for parent in ps {
            if let Some(path) = path_between(remaining, done, parent, node) {
                // path runs parent -> ... -> node
                let mut cycle = Vec::with_capacity(path.len());
                cycle.push(node.clone());
                cycle.extend(path.into_iter().take_while(|t| t != node));
                return Some((node.clone(), parent.clone(), cycle));
            }
        }
    }
    None
}

/// Breadth-first search along "depends on" edges among unfinished tables.
fn path_between(
    remaining: &BTreeMap<QualifiedName, BTreeSet<QualifiedName>>,
    done: &BTreeSet<QualifiedName>,
    from: &QualifiedName,
    to: &QualifiedName,
) -> Option<Vec<QualifiedName>> {
    let mut previous: BTreeMap<&QualifiedName, &QualifiedName> = BTreeMap::new();
    let mut queue = VecDeque::from([from]);
    let mut seen = BTreeSet::from([from]);

    while let Some(current) = queue.pop_front() {
        if current == to {
            let mut path = vec![current.clone()];
            let mut cursor = current;
            while let Some(&prev) = previous.get(cursor) {
                path.push(prev.clone());
                cursor = prev;
            }
            path.reverse();
            return Some(path);
        }
        let Some(next) = remaining.get(current) else {
            continue;
        };
        for parent in next {
            if !done.contains(parent) && seen.insert(parent) {
                previous.insert(parent, current);
                queue.push_back(parent);
            }
        }
    }
    None
}
