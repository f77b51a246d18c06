//! Integration tests for the form runtime

use formcalc_core::{
    EngineConfig, FieldDefinition, FieldType, FormKey, FormRuntime, FormSchema, RecalcOptions,
    RuntimeError,
};
use formcalc_data::{StaticBackend, TraceStatus};
use formcalc_expr::EvaluationContext;
use formcalc_incremental::RecalcError;
use formcalc_types::{Decimal, FormData, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn dec(s: &str) -> Value {
    Value::Number(Decimal::from_str(s).unwrap())
}

const QUOTE_SCHEMA: &str = r#"
form_id: quote
version: 1
fields:
  - name: qty
    type: number
    default_value: 1
  - name: price
    type: number
  - name: subtotal
    type: calculated
    formula: "qty * price"
  - name: converted
    type: calculated
    formula: "ROUND(subtotal * external.fx.rate, 2)"
  - name: label
    type: calculated
    formula: "CONCAT(UPPER(customer), ' x', qty)"
  - name: customer
    type: text
external_data_sources:
  fx:
    method_id: rates.lookup
    parameters:
      currency: "@{currency}"
      _debug: true
    ttl_secs: 60
"#;

fn runtime(backend: Arc<StaticBackend>) -> FormRuntime {
    let runtime = FormRuntime::new(EngineConfig::default()).with_backend(backend);
    runtime
        .publish(&FormSchema::from_yaml_str(QUOTE_SCHEMA).unwrap())
        .unwrap();
    runtime
}

fn fx_backend() -> Arc<StaticBackend> {
    Arc::new(StaticBackend::new().with_response(
        "rates.lookup",
        Value::Object(BTreeMap::from([("rate".to_string(), dec("0.5"))])),
    ))
}

fn initial_data() -> FormData {
    FormData::from([
        ("qty".to_string(), Value::from(4)),
        ("price".to_string(), dec("2.50")),
        ("customer".to_string(), Value::from("acme")),
        ("currency".to_string(), Value::from("EUR")),
    ])
}

#[tokio::test(start_paused = true)]
async fn test_load_then_change() {
    let backend = fx_backend();
    let runtime = runtime(backend.clone());
    let key = FormKey::new("quote", 1);

    let loaded = runtime
        .recalculate_all(&key, &initial_data(), &RecalcOptions::default())
        .await
        .unwrap();
    assert!(loaded.is_clean(), "{:?}", loaded.failures);
    assert_eq!(loaded.form_data["subtotal"], dec("10.00"));
    assert_eq!(loaded.form_data["converted"], dec("5.00"));
    assert_eq!(loaded.form_data["label"], Value::from("ACME x4"));
    assert_eq!(loaded.external_trace["fx"].status, TraceStatus::Miss);

    let changed = runtime
        .recalculate(
            &key,
            &loaded.form_data,
            "price",
            dec("3"),
            &RecalcOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(changed.recalculated, vec!["subtotal", "converted"]);
    assert_eq!(changed.form_data["converted"], dec("6.00"));
    assert_eq!(changed.form_data["label"], loaded.form_data["label"]);
    assert_eq!(changed.external_trace["fx"].status, TraceStatus::Hit);
    assert_eq!(backend.calls("rates.lookup"), 1);

    let metrics = runtime.metrics();
    assert_eq!(metrics.full_recalculations, 1);
    assert_eq!(metrics.incremental_recalculations, 1);
    assert_eq!(runtime.external_cache_stats().unwrap().entries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_external_outage_is_contained() {
    let backend = Arc::new(StaticBackend::new().with_failure("rates.lookup", "503"));
    let runtime = runtime(backend);

    let outcome = runtime
        .recalculate_all(&FormKey::new("quote", 1), &initial_data(), &RecalcOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.form_data["subtotal"], dec("10.00"));
    assert!(!outcome.form_data.contains_key("converted"));
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].field, "converted");
    assert_eq!(outcome.external_trace["fx"].status, TraceStatus::Failed);
}

#[tokio::test]
async fn test_cancelled_pass_leaves_data_untouched() {
    let runtime = runtime(fx_backend());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let data = initial_data();

    let err = runtime
        .recalculate(
            &FormKey::new("quote", 1),
            &data,
            "qty",
            Value::from(9),
            &RecalcOptions::default().with_cancellation(cancel),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Recalc(RecalcError::Cancelled)));
    assert_eq!(data, initial_data());
}

#[tokio::test]
async fn test_unknown_form() {
    let runtime = FormRuntime::default();
    let err = runtime
        .recalculate_all(&FormKey::new("nope", 1), &FormData::new(), &RecalcOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownForm(_)));
}

#[test]
fn test_invalid_schema_rejected_with_all_diagnostics() {
    let runtime = FormRuntime::default();
    let schema = FormSchema::new("bad", 1)
        .with_field(FieldDefinition::calculated("a", "b +"))
        .with_field(FieldDefinition::calculated("b", "SYSTEM('ls')"))
        .with_field(FieldDefinition::new("c", FieldType::Calculated));

    let err = runtime.publish(&schema).unwrap_err();
    insta::assert_snapshot!(err.to_string().lines().next().unwrap(), @"Form 'bad' has 3 problem(s):");
    assert!(runtime.registry().is_empty());
}

#[test]
fn test_config_limits_apply_to_evaluation() {
    let config = EngineConfig::from_yaml_str("evaluation:\n  max_expression_length: 8\n").unwrap();
    let runtime = FormRuntime::new(config);

    assert!(runtime.evaluate("1 + 2", &EvaluationContext::new()).success);
    let result = runtime.evaluate("1 + 2 + 3 + 4", &EvaluationContext::new());
    assert!(!result.success);
    assert!(!runtime.validate("1 + 2 + 3 + 4").is_valid);
}
