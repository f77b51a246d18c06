//! Field dependency graph
//!
//! Field names are interned to dense ids in first-seen order. The id doubles
//! as the tie-breaker of the topological sort, so the order only depends on
//! the sequence of calls that built the graph.

use crate::error::{GraphError, Result};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, VecDeque};
use std::fmt;

/// Directed "reads" relation between the fields of one form
///
/// Mutations take `&mut self` and queries `&self`, so concurrent readers can
/// share a graph while a writer needs exclusive access.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    ids: HashMap<String, usize>,
    names: Vec<String>,
    /// field -> fields it reads
    dependencies: Vec<BTreeSet<usize>>,
    /// field -> fields that read it
    dependents: Vec<BTreeSet<usize>>,
    edges: usize,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a field that may have no edges yet
    pub fn add_field(&mut self, name: &str) -> Result<()> {
        check_name(name)?;
        self.intern(name);
        Ok(())
    }

    /// Record that `dependent` reads `depends_on`
    ///
    /// Rejected without any change when the edge would close a cycle.
    pub fn add_dependency(&mut self, dependent: &str, depends_on: &str) -> Result<()> {
        check_name(dependent)?;
        check_name(depends_on)?;
        if dependent == depends_on {
            return Err(GraphError::SelfDependency(dependent.to_string()));
        }
        if let Some(path) = self.cycle_path(dependent, depends_on) {
            tracing::debug!(dependent, depends_on, "rejected circular dependency");
            return Err(GraphError::CircularDependency { path });
        }

        let from = self.intern(dependent);
        let to = self.intern(depends_on);
        if self.dependencies[from].insert(to) {
            self.dependents[to].insert(from);
            self.edges += 1;
        }
        Ok(())
    }

    /// Remove an edge; absent edges are ignored
    pub fn remove_dependency(&mut self, dependent: &str, depends_on: &str) {
        let (Some(from), Some(to)) = (self.id(dependent), self.id(depends_on)) else {
            return;
        };
        if self.dependencies[from].remove(&to) {
            self.dependents[to].remove(&from);
            self.edges -= 1;
        }
    }

    /// Fields that directly read `field`
    pub fn dependents(&self, field: &str) -> Vec<String> {
        self.id(field)
            .map(|id| self.resolve(&self.dependents[id]))
            .unwrap_or_default()
    }

    /// Fields that `field` directly reads
    pub fn dependencies(&self, field: &str) -> Vec<String> {
        self.id(field)
            .map(|id| self.resolve(&self.dependencies[id]))
            .unwrap_or_default()
    }

    /// Every known field, each after all the fields it reads
    ///
    /// Among fields that are ready at the same time the one registered first
    /// wins.
    pub fn topological_order(&self) -> Vec<String> {
        self.order_ids()
            .into_iter()
            .map(|id| self.names[id].clone())
            .collect()
    }

    /// Whether adding `dependent -> depends_on` would close a cycle
    pub fn would_create_circular_dependency(&self, dependent: &str, depends_on: &str) -> bool {
        if dependent.trim().is_empty() || depends_on.trim().is_empty() {
            return false;
        }
        self.cycle_path(dependent, depends_on).is_some()
    }

    /// Fields transitively reading `changed`, in topological order
    ///
    /// `changed` itself is not included. Unknown fields have nothing to
    /// recalculate.
    pub fn fields_to_recalculate(&self, changed: &str) -> Vec<String> {
        let Some(start) = self.id(changed) else {
            return Vec::new();
        };

        let mut affected = vec![false; self.names.len()];
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            for &next in &self.dependents[node] {
                if !affected[next] {
                    affected[next] = true;
                    queue.push_back(next);
                }
            }
        }

        self.order_ids()
            .into_iter()
            .filter(|&id| affected[id])
            .map(|id| self.names[id].clone())
            .collect()
    }

    pub fn stats(&self) -> GraphStats {
        let order = self.order_ids();

        let mut depth = vec![0usize; self.names.len()];
        for &id in &order {
            depth[id] = self.dependencies[id]
                .iter()
                .map(|&dep| depth[dep] + 1)
                .max()
                .unwrap_or(0);
        }

        let ids = 0..self.names.len();
        GraphStats {
            field_count: self.names.len(),
            edge_count: self.edges,
            max_depth: depth.iter().copied().max().unwrap_or(0),
            root_fields: ids
                .clone()
                .filter(|&id| self.dependencies[id].is_empty())
                .map(|id| self.names[id].clone())
                .collect(),
            leaf_fields: ids
                .filter(|&id| self.dependents[id].is_empty())
                .map(|id| self.names[id].clone())
                .collect(),
            has_cycles: order.len() != self.names.len(),
        }
    }

    /// Drop every field and edge
    pub fn clear(&mut self) {
        self.ids.clear();
        self.names.clear();
        self.dependencies.clear();
        self.dependents.clear();
        self.edges = 0;
    }

    pub fn contains(&self, field: &str) -> bool {
        self.ids.contains_key(field)
    }

    /// Known fields in registration order
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edges
    }

    fn id(&self, name: &str) -> Option<usize> {
        self.ids.get(name).copied()
    }

    fn intern(&mut self, name: &str) -> usize {
        if let Some(id) = self.id(name) {
            return id;
        }
        let id = self.names.len();
        self.ids.insert(name.to_string(), id);
        self.names.push(name.to_string());
        self.dependencies.push(BTreeSet::new());
        self.dependents.push(BTreeSet::new());
        id
    }

    fn resolve(&self, ids: &BTreeSet<usize>) -> Vec<String> {
        ids.iter().map(|&id| self.names[id].clone()).collect()
    }

    /// Kahn's algorithm with a min-heap of ready ids
    fn order_ids(&self) -> Vec<usize> {
        let mut pending: Vec<usize> = self.dependencies.iter().map(BTreeSet::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = pending
            .iter()
            .enumerate()
            .filter(|(_, &count)| count == 0)
            .map(|(id, _)| Reverse(id))
            .collect();

        let mut order = Vec::with_capacity(self.names.len());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            for &next in &self.dependents[id] {
                pending[next] -= 1;
                if pending[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }
        order
    }

    /// The cycle `dependent -> depends_on -> ... -> dependent`, if any
    ///
    /// Breadth-first from `depends_on` along dependency edges, so only the
    /// part of the graph reachable from the start field is visited.
    fn cycle_path(&self, dependent: &str, depends_on: &str) -> Option<Vec<String>> {
        if dependent == depends_on {
            return Some(vec![dependent.to_string(), dependent.to_string()]);
        }
        let start = self.id(depends_on)?;
        let target = self.id(dependent)?;

        let mut parent = HashMap::from([(start, start)]);
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            if node == target {
                let mut chain = vec![target];
                let mut current = target;
                while current != start {
                    match parent.get(&current) {
                        Some(&previous) => {
                            current = previous;
                            chain.push(previous);
                        }
                        None => break,
                    }
                }
                chain.reverse();

                let mut path = vec![dependent.to_string()];
                path.extend(chain.into_iter().map(|id| self.names[id].clone()));
                return Some(path);
            }
            for &next in &self.dependencies[node] {
                if let std::collections::hash_map::Entry::Vacant(slot) = parent.entry(next) {
                    slot.insert(node);
                    queue.push_back(next);
                }
            }
        }
        None
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        Err(GraphError::EmptyFieldName)
    } else {
        Ok(())
    }
}

/// Read-only snapshot of a graph's shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub field_count: usize,
    pub edge_count: usize,
    /// Longest chain of edges
    pub max_depth: usize,
    /// Fields that read nothing
    pub root_fields: Vec<String>,
    /// Fields nothing reads
    pub leaf_fields: Vec<String>,
    pub has_cycles: bool,
}

impl fmt::Display for GraphStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Dependency Graph:")?;
        writeln!(f, "  Fields: {}", self.field_count)?;
        writeln!(f, "  Edges: {}", self.edge_count)?;
        writeln!(f, "  Max depth: {}", self.max_depth)?;
        writeln!(f, "  Roots: {}", self.root_fields.join(", "))?;
        writeln!(f, "  Leaves: {}", self.leaf_fields.join(", "))?;
        write!(f, "  Cycles: {}", if self.has_cycles { "yes" } else { "no" })
    }
}
