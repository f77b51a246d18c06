//! Dependency graph between the fields of a form
//!
//! An edge `total -> price` means the formula of `total` reads `price`, so
//! `total` must be recomputed whenever `price` changes. The graph is acyclic
//! at all times: [`DependencyGraph::add_dependency`] checks reachability
//! before inserting and rejects edges that would close a cycle.

pub mod error;
pub mod graph;

pub use error::{GraphError, Result};
pub use graph::{DependencyGraph, GraphStats};
