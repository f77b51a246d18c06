//! Incremental recalculation
//!
//! Given a form's [`DependencyGraph`](formcalc_graph::DependencyGraph), its
//! formulas and current data, the [`RecalculationEngine`] recomputes either
//! the fields affected by one change or every formula field, evaluating in
//! dependency order and containing failures per field.

pub mod metrics;
pub mod recalc;

pub use metrics::{FieldMetrics, InMemoryMetrics, MetricsCollector, PassKind, RecalculationMetrics};
pub use recalc::{
    FieldFailure, FormulaSource, RecalcError, RecalcOptions, RecalcOutcome, RecalculationEngine,
    Result,
};
