//! Per-instance value cache and the declared invalidation graph.
//!
//! Every container instance owns one [`Store`]: the last observed value per
//! feature plus the resolved limits validators. A cached value has always
//! round-tripped through the feature's transform and validator; an
//! invalidated entry is absent, never stale.
//!
//! Invalidation edges are declared per feature and come in two kinds:
//! [`Discard::Cache`] drops a sibling's cached value, [`Discard::Limits`]
//! drops only its resolved validator. The graph is validated once per schema
//! at build time — unknown targets and cyclic cache edges are configuration
//! errors, not runtime loops.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use crate::error::{InstrError, Result};
use crate::limits::Limits;
use crate::value::Value;

/// One declared invalidation edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discard {
    /// Drop the named feature's cached value (and follow its own edges).
    Cache(String),
    /// Drop the named feature's resolved limits validator only.
    Limits(String),
}

impl Discard {
    pub fn cache(name: impl Into<String>) -> Self {
        Discard::Cache(name.into())
    }

    pub fn limits(name: impl Into<String>) -> Self {
        Discard::Limits(name.into())
    }

    fn target(&self) -> &str {
        match self {
            Discard::Cache(name) | Discard::Limits(name) => name,
        }
    }
}

/// Value + resolved-limits store scoped to one container instance.
#[derive(Debug, Default)]
pub(crate) struct Store {
    values: RwLock<HashMap<String, Value>>,
    limits: RwLock<HashMap<String, Limits>>,
}

impl Store {
    pub fn value(&self, name: &str) -> Option<Value> {
        self.values.read().get(name).cloned()
    }

    pub fn put_value(&self, name: &str, value: Value) {
        self.values.write().insert(name.to_string(), value);
    }

    pub fn drop_value(&self, name: &str) {
        self.values.write().remove(name);
    }

    pub fn limits(&self, name: &str) -> Option<Limits> {
        self.limits.read().get(name).cloned()
    }

    pub fn put_limits(&self, name: &str, limits: Limits) {
        self.limits.write().insert(name.to_string(), limits);
    }

    pub fn drop_limits(&self, name: &str) {
        self.limits.write().remove(name);
    }

    pub fn clear(&self) {
        self.values.write().clear();
        self.limits.write().clear();
    }
}

/// Directed invalidation edges for one container schema.
#[derive(Debug, Default, Clone)]
pub(crate) struct DiscardGraph {
    edges: HashMap<String, Vec<Discard>>,
}

impl DiscardGraph {
    pub fn insert(&mut self, feature: impl Into<String>, edges: Vec<Discard>) {
        if !edges.is_empty() {
            self.edges.insert(feature.into(), edges);
        }
    }

    /// Build-time validation: every edge must point at a declared feature and
    /// the cache-edge relation must be acyclic.
    pub fn validate(&self, known: &HashSet<String>) -> Result<()> {
        for (source, edges) in &self.edges {
            for edge in edges {
                if !known.contains(edge.target()) {
                    return Err(InstrError::config(format!(
                        "discard edge from '{}' targets unknown feature '{}'",
                        source,
                        edge.target()
                    )));
                }
            }
        }
        for start in self.edges.keys() {
            let mut path = Vec::new();
            self.walk_for_cycle(start, &mut path)?;
        }
        Ok(())
    }

    fn walk_for_cycle<'a>(&'a self, node: &'a str, path: &mut Vec<&'a str>) -> Result<()> {
        if path.contains(&node) {
            return Err(InstrError::config(format!(
                "cyclic discard edges: {} -> {}",
                path.join(" -> "),
                node
            )));
        }
        path.push(node);
        if let Some(edges) = self.edges.get(node) {
            for edge in edges {
                if let Discard::Cache(target) = edge {
                    self.walk_for_cycle(target, path)?;
                }
            }
        }
        path.pop();
        Ok(())
    }

    /// Apply the edges declared on `source` after a successful set: cache
    /// targets are dropped and cascade through their own declared edges,
    /// limits targets lose only their resolved validator. The visited set
    /// keeps a misdeclared graph from looping.
    pub fn invalidate_from(&self, source: &str, store: &Store) {
        let mut visited = HashSet::new();
        visited.insert(source.to_string());
        self.apply(source, store, &mut visited);
    }

    fn apply(&self, source: &str, store: &Store, visited: &mut HashSet<String>) {
        let Some(edges) = self.edges.get(source) else {
            return;
        };
        for edge in edges {
            match edge {
                Discard::Cache(target) => {
                    store.drop_value(target);
                    if visited.insert(target.clone()) {
                        self.apply(target, store, visited);
                    }
                }
                Discard::Limits(target) => store.drop_limits(target),
            }
        }
    }
}
