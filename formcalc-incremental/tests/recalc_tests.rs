//! Integration tests for recalculation passes

use formcalc_data::{
    DataOrchestrator, ExternalSourceConfig, ExternalSources, OrchestratorConfig, StaticBackend,
    TraceStatus,
};
use formcalc_expr::{ErrorKind, ExpressionEngine};
use formcalc_graph::DependencyGraph;
use formcalc_incremental::{
    FormulaSource, MetricsCollector, PassKind, RecalcOptions, RecalculationEngine,
    RecalculationMetrics,
};
use formcalc_types::{Decimal, FormData, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn dec(s: &str) -> Value {
    Value::Number(Decimal::from_str(s).unwrap())
}

struct Form {
    formulas: BTreeMap<String, String>,
    sources: ExternalSources,
}

impl Form {
    fn new(formulas: &[(&str, &str)]) -> Self {
        Self {
            formulas: formulas
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            sources: ExternalSources::new(),
        }
    }

    /// Graph built from the references of each formula
    fn graph(&self, engine: &ExpressionEngine) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for (field, formula) in &self.formulas {
            graph.add_field(field).unwrap();
            for reference in engine.references(formula).unwrap() {
                if reference != "external" {
                    graph.add_dependency(field, &reference).unwrap();
                }
            }
        }
        graph
    }
}

impl FormulaSource for Form {
    fn formula(&self, field: &str) -> Option<&str> {
        self.formulas.get(field).map(String::as_str)
    }

    fn external_sources(&self) -> Option<&ExternalSources> {
        Some(&self.sources)
    }
}

fn order_form() -> Form {
    Form::new(&[
        ("total", "qty * price"),
        ("tax", "ROUND(total * 0.2, 2)"),
        ("grand_total", "total + tax"),
        ("label", "UPPER(name)"),
    ])
}

fn order_data() -> FormData {
    FormData::from([
        ("qty".to_string(), Value::from(3)),
        ("price".to_string(), dec("9.99")),
        ("name".to_string(), Value::from("widget")),
        ("total".to_string(), dec("29.97")),
        ("tax".to_string(), dec("5.99")),
        ("grand_total".to_string(), dec("35.96")),
        ("label".to_string(), Value::from("stale")),
        ("notes".to_string(), Value::from("keep me")),
    ])
}

#[tokio::test]
async fn test_change_updates_only_downstream_fields() {
    let expressions = Arc::new(ExpressionEngine::default());
    let form = order_form();
    let graph = form.graph(&expressions);
    let engine = RecalculationEngine::new(expressions);
    let before = order_data();

    let outcome = engine
        .recalculate(&form, &graph, &before, "qty", Value::from(5), &RecalcOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.recalculated, vec!["total", "tax", "grand_total"]);
    assert_eq!(outcome.form_data["qty"], Value::from(5));
    assert_eq!(outcome.form_data["total"], dec("49.95"));
    assert_eq!(outcome.form_data["tax"], dec("9.99"));
    assert_eq!(outcome.form_data["grand_total"], dec("59.94"));

    for untouched in ["price", "name", "label", "notes"] {
        assert_eq!(outcome.form_data[untouched], before[untouched], "{}", untouched);
    }
    // The caller's copy is not modified
    assert_eq!(before["qty"], Value::from(3));
}

#[tokio::test]
async fn test_failure_is_contained() {
    let expressions = Arc::new(ExpressionEngine::default());
    let form = Form::new(&[
        ("ratio", "total / divisor"),
        ("double_ratio", "ratio * 2"),
        ("total", "qty * price"),
    ]);
    let graph = form.graph(&expressions);
    let engine = RecalculationEngine::new(expressions);

    let mut data = order_data();
    data.insert("divisor".into(), Value::from(0));
    data.insert("ratio".into(), Value::from(1));

    let outcome = engine
        .recalculate_all(&form, &graph, &data, &RecalcOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.form_data["total"], dec("29.97"));
    assert_eq!(outcome.form_data["ratio"], Value::from(1));
    assert_eq!(outcome.form_data["double_ratio"], Value::from(2));
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].field, "ratio");
    assert_eq!(outcome.failures[0].kind, Some(ErrorKind::DivisionByZero));
    assert_eq!(engine.metrics().failed_evaluations, 1);

    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["failures"][0]["kind"], "division_by_zero");
    assert!(json["elapsed_ms"].is_number());
}

#[tokio::test]
async fn test_missing_input_fails_closed() {
    let expressions = Arc::new(ExpressionEngine::default());
    let form = Form::new(&[("total", "qty * price")]);
    let graph = form.graph(&expressions);
    let engine = RecalculationEngine::new(expressions);

    let data = FormData::from([("qty".to_string(), Value::from(2))]);
    let outcome = engine
        .recalculate_all(&form, &graph, &data, &RecalcOptions::default())
        .await
        .unwrap();

    assert!(!outcome.form_data.contains_key("total"));
    assert_eq!(outcome.failures[0].kind, Some(ErrorKind::UnresolvedVariable));
}

#[tokio::test]
async fn test_full_recalculation_is_idempotent() {
    let expressions = Arc::new(ExpressionEngine::default());
    let form = order_form();
    let graph = form.graph(&expressions);
    let engine = RecalculationEngine::new(expressions);

    let options = RecalcOptions::default();
    let first = engine
        .recalculate_all(&form, &graph, &order_data(), &options)
        .await
        .unwrap();
    let second = engine
        .recalculate_all(&form, &graph, &first.form_data, &options)
        .await
        .unwrap();

    assert_eq!(first.form_data, second.form_data);
    assert_eq!(first.form_data["label"], Value::from("WIDGET"));
    assert_eq!(engine.metrics().full_recalculations, 2);
}

#[tokio::test]
async fn test_timeouts_leave_fields_untouched() {
    let expressions = Arc::new(ExpressionEngine::default());
    let form = order_form();
    let graph = form.graph(&expressions);
    let engine = RecalculationEngine::new(expressions);

    let options = RecalcOptions {
        time_budget: Some(Duration::ZERO),
        ..RecalcOptions::default()
    };
    let before = order_data();
    let outcome = engine
        .recalculate(&form, &graph, &before, "price", dec("1"), &options)
        .await
        .unwrap();

    assert!(outcome.recalculated.is_empty());
    assert!(outcome
        .failures
        .iter()
        .all(|f| f.kind == Some(ErrorKind::Timeout)));
    assert_eq!(outcome.form_data["total"], before["total"]);
}

#[tokio::test]
async fn test_external_values_visible_to_formulas() {
    let backend = Arc::new(
        StaticBackend::new()
            .with_response(
                "fx",
                Value::Object(BTreeMap::from([("usd".to_string(), dec("1.10"))])),
            )
            .with_failure("discounts", "service down"),
    );
    let orchestrator = Arc::new(DataOrchestrator::new(backend, OrchestratorConfig::default()));

    let mut form = Form::new(&[
        ("total_usd", "ROUND(total * external.rates.usd, 2)"),
        ("discounted", "total - external.discount"),
        ("total", "qty * price"),
    ]);
    form.sources
        .insert("rates".into(), ExternalSourceConfig::new("fx"));
    form.sources
        .insert("discount".into(), ExternalSourceConfig::new("discounts"));

    let expressions = Arc::new(ExpressionEngine::default());
    let graph = form.graph(&expressions);
    let engine = RecalculationEngine::new(expressions).with_orchestrator(orchestrator);

    let outcome = engine
        .recalculate_all(&form, &graph, &order_data(), &RecalcOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.form_data["total_usd"], dec("32.97"));
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].field, "discounted");
    assert_eq!(outcome.external_trace["rates"].status, TraceStatus::Miss);
    assert_eq!(outcome.external_trace["discount"].status, TraceStatus::Failed);
}

#[derive(Default)]
struct RecordingCollector {
    fields: Mutex<Vec<(String, bool)>>,
    passes: Mutex<Vec<(PassKind, usize)>>,
}

impl MetricsCollector for RecordingCollector {
    fn record_field(&self, field: &str, _elapsed: Duration, success: bool) {
        self.fields.lock().unwrap().push((field.to_string(), success));
    }

    fn record_pass(&self, kind: PassKind, fields: usize, _elapsed: Duration) {
        self.passes.lock().unwrap().push((kind, fields));
    }

    fn snapshot(&self) -> RecalculationMetrics {
        RecalculationMetrics {
            total_recalculations: self.passes.lock().unwrap().len() as u64,
            ..RecalculationMetrics::default()
        }
    }

    fn reset(&self) {
        self.fields.lock().unwrap().clear();
        self.passes.lock().unwrap().clear();
    }
}

#[tokio::test]
async fn test_collector_substitution() {
    let expressions = Arc::new(ExpressionEngine::default());
    let form = order_form();
    let graph = form.graph(&expressions);
    let collector = Arc::new(RecordingCollector::default());
    let engine = RecalculationEngine::new(expressions).with_metrics(collector.clone());

    engine
        .recalculate(&form, &graph, &order_data(), "name", Value::from("gear"), &RecalcOptions::default())
        .await
        .unwrap();

    assert_eq!(
        *collector.fields.lock().unwrap(),
        vec![("label".to_string(), true)]
    );
    assert_eq!(
        *collector.passes.lock().unwrap(),
        vec![(PassKind::Incremental, 1)]
    );
    assert_eq!(engine.metrics().total_recalculations, 1);
}
