//! Change-driven and full recalculation passes
//!
//! A pass works on a private copy of the form data. Fields are evaluated
//! strictly in dependency order and every result is written back before the
//! next field is evaluated, so downstream formulas see upstream results of
//! the same pass. A failing formula keeps the field's previous value and is
//! reported in the outcome; it never stops the pass.

use crate::metrics::{InMemoryMetrics, MetricsCollector, PassKind, RecalculationMetrics};
use chrono::NaiveDateTime;
use formcalc_data::{DataOrchestrator, ExternalSources, SourceTrace};
use formcalc_expr::{ErrorKind, EvaluationContext, ExpressionEngine};
use formcalc_graph::DependencyGraph;
use formcalc_types::{FormData, Value};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecalcError {
    #[error("Field name cannot be empty")]
    EmptyFieldName,

    #[error("Recalculation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, RecalcError>;

/// Where a pass finds each field's formula
pub trait FormulaSource: Send + Sync {
    /// Formula of a computed field, `None` for input fields
    fn formula(&self, field: &str) -> Option<&str>;

    /// External data the formulas may read under the `external` root
    fn external_sources(&self) -> Option<&ExternalSources> {
        None
    }
}

impl FormulaSource for BTreeMap<String, String> {
    fn formula(&self, field: &str) -> Option<&str> {
        self.get(field).map(String::as_str)
    }
}

/// Per-pass inputs besides the form data
#[derive(Debug, Clone, Default)]
pub struct RecalcOptions {
    /// Session variables visible to every formula
    pub variables: BTreeMap<String, Value>,
    /// Timestamp for `NOW()` and `TODAY()`
    pub now: Option<NaiveDateTime>,
    /// Budget per formula, the engine default when absent
    pub time_budget: Option<Duration>,
    pub cancel: CancellationToken,
}

impl RecalcOptions {
    pub fn with_now(mut self, now: NaiveDateTime) -> Self {
        self.now = Some(now);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A field whose formula failed during a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldFailure {
    pub field: String,
    pub message: String,
    pub kind: Option<ErrorKind>,
}

fn duration_ms<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

/// Result of one pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecalcOutcome {
    pub form_data: FormData,
    /// Fields that received a new value, in evaluation order
    pub recalculated: Vec<String>,
    pub failures: Vec<FieldFailure>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub external_trace: BTreeMap<String, SourceTrace>,
    #[serde(rename = "elapsed_ms", serialize_with = "duration_ms")]
    pub elapsed: Duration,
}

impl RecalcOutcome {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drives the expression engine over a dependency graph
///
/// Holds no per-form state: every call is a pass over the given graph and
/// data. The metrics collector is the only state that outlives a call.
pub struct RecalculationEngine {
    expressions: Arc<ExpressionEngine>,
    orchestrator: Option<Arc<DataOrchestrator>>,
    metrics: Arc<dyn MetricsCollector>,
}

impl RecalculationEngine {
    pub fn new(expressions: Arc<ExpressionEngine>) -> Self {
        Self {
            expressions,
            orchestrator: None,
            metrics: Arc::new(InMemoryMetrics::new()),
        }
    }

    /// Resolve declared external sources before each pass
    pub fn with_orchestrator(mut self, orchestrator: Arc<DataOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn expressions(&self) -> &Arc<ExpressionEngine> {
        &self.expressions
    }

    /// Apply one change and recompute everything downstream of it
    ///
    /// Fields outside the affected set are returned exactly as given.
    pub async fn recalculate(
        &self,
        form: &dyn FormulaSource,
        graph: &DependencyGraph,
        form_data: &FormData,
        changed_field: &str,
        new_value: Value,
        options: &RecalcOptions,
    ) -> Result<RecalcOutcome> {
        if changed_field.trim().is_empty() {
            return Err(RecalcError::EmptyFieldName);
        }
        let mut working = form_data.clone();
        working.insert(changed_field.to_string(), new_value);

        let order = graph.fields_to_recalculate(changed_field);
        tracing::debug!(
            changed = changed_field,
            affected = order.len(),
            "starting incremental recalculation"
        );
        self.run(form, order, working, options, PassKind::Incremental)
            .await
    }

    /// Recompute every formula field in topological order
    pub async fn recalculate_all(
        &self,
        form: &dyn FormulaSource,
        graph: &DependencyGraph,
        form_data: &FormData,
        options: &RecalcOptions,
    ) -> Result<RecalcOutcome> {
        let order = graph.topological_order();
        self.run(form, order, form_data.clone(), options, PassKind::Full)
            .await
    }

    pub fn metrics(&self) -> RecalculationMetrics {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    async fn run(
        &self,
        form: &dyn FormulaSource,
        order: Vec<String>,
        working: FormData,
        options: &RecalcOptions,
        kind: PassKind,
    ) -> Result<RecalcOutcome> {
        let started = Instant::now();
        let cancel = &options.cancel;
        if cancel.is_cancelled() {
            return Err(RecalcError::Cancelled);
        }

        let (external, external_trace) = match (&self.orchestrator, form.external_sources()) {
            (Some(orchestrator), Some(sources)) if !sources.is_empty() => {
                let resolved = orchestrator
                    .resolve_sources(sources, &working, cancel)
                    .await;
                (resolved.data, resolved.trace)
            }
            _ => Default::default(),
        };
        if cancel.is_cancelled() {
            return Err(RecalcError::Cancelled);
        }

        let mut ctx = EvaluationContext {
            variables: options.variables.clone(),
            form_data: working,
            external,
            now: options.now,
            time_budget: options.time_budget,
            cancel: Some(cancel.clone()),
            debug: false,
        };

        let mut recalculated = Vec::new();
        let mut failures = Vec::new();

        for field in order {
            let Some(formula) = form.formula(&field) else {
                continue;
            };
            if cancel.is_cancelled() {
                return Err(RecalcError::Cancelled);
            }

            let result = self.expressions.evaluate(formula, &ctx);
            self.metrics
                .record_field(&field, result.execution_time, result.success);

            if result.success {
                tracing::debug!(field = %field, value = %result.value, "recalculated field");
                ctx.form_data.insert(field.clone(), result.value);
                recalculated.push(field);
                continue;
            }
            if result.error_kind == Some(ErrorKind::Cancelled) {
                return Err(RecalcError::Cancelled);
            }

            let message = result.error.unwrap_or_default();
            tracing::warn!(field = %field, error = %message, "formula failed, keeping previous value");
            failures.push(FieldFailure {
                field,
                message,
                kind: result.error_kind,
            });
        }

        let elapsed = started.elapsed();
        self.metrics.record_pass(kind, recalculated.len(), elapsed);
        tracing::info!(
            pass = ?kind,
            recalculated = recalculated.len(),
            failed = failures.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "recalculation pass finished"
        );

        Ok(RecalcOutcome {
            form_data: ctx.form_data,
            recalculated,
            failures,
            external_trace,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formulas(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_empty_field_rejected() {
        let engine = RecalculationEngine::new(Arc::new(ExpressionEngine::default()));
        let err = engine
            .recalculate(
                &formulas(&[]),
                &DependencyGraph::new(),
                &FormData::new(),
                " ",
                Value::Null,
                &RecalcOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, RecalcError::EmptyFieldName);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let engine = RecalculationEngine::new(Arc::new(ExpressionEngine::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let options = RecalcOptions::default().with_cancellation(cancel);

        let mut graph = DependencyGraph::new();
        graph.add_dependency("b", "a").unwrap();
        let err = engine
            .recalculate_all(&formulas(&[("b", "a + 1")]), &graph, &FormData::new(), &options)
            .await
            .unwrap_err();
        assert_eq!(err, RecalcError::Cancelled);
        assert_eq!(engine.metrics().total_recalculations, 0);
    }

    #[tokio::test]
    async fn test_input_fields_are_skipped() {
        let engine = RecalculationEngine::new(Arc::new(ExpressionEngine::default()));
        let mut graph = DependencyGraph::new();
        graph.add_dependency("double", "n").unwrap();
        let mut data = FormData::new();
        data.insert("n".into(), Value::from(4));

        let outcome = engine
            .recalculate_all(
                &formulas(&[("double", "n * 2")]),
                &graph,
                &data,
                &RecalcOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.recalculated, vec!["double"]);
        assert_eq!(outcome.form_data["double"], Value::from(8));
        assert!(outcome.is_clean());
    }
}
