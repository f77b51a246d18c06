//! The runtime facade: one object wiring configuration, the expression
//! engine, external data, recalculation and the form registry.

use crate::config::EngineConfig;
use crate::registry::{FormKey, FormRegistry};
use crate::schema::{CompiledForm, FormSchema, SchemaError};
use formcalc_data::{CacheStats, DataBackend, DataOrchestrator};
use formcalc_expr::{
    ConditionalAction, EvaluationContext, EvaluationResult, ExpressionEngine, ParseCacheStats,
    ValidationResult,
};
use formcalc_incremental::{
    InMemoryMetrics, MetricsCollector, RecalcError, RecalcOptions, RecalcOutcome,
    RecalculationEngine, RecalculationMetrics,
};
use formcalc_types::{FormData, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("Form {0} is already published")]
    AlreadyPublished(FormKey),

    #[error("Unknown form {0}")]
    UnknownForm(FormKey),

    #[error(transparent)]
    Recalc(#[from] RecalcError),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Presentation state of one field after its conditions are applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldState {
    pub visible: bool,
    pub enabled: bool,
    pub required: bool,
}

pub struct FormRuntime {
    config: EngineConfig,
    expressions: Arc<ExpressionEngine>,
    orchestrator: Option<Arc<DataOrchestrator>>,
    metrics: Arc<dyn MetricsCollector>,
    recalc: RecalculationEngine,
    registry: FormRegistry,
}

impl FormRuntime {
    pub fn new(config: EngineConfig) -> Self {
        let expressions = Arc::new(ExpressionEngine::new(config.engine_limits()));
        let metrics: Arc<dyn MetricsCollector> = Arc::new(InMemoryMetrics::new());
        let recalc = RecalculationEngine::new(expressions.clone()).with_metrics(metrics.clone());
        Self {
            config,
            expressions,
            orchestrator: None,
            metrics,
            recalc,
            registry: FormRegistry::new(),
        }
    }

    /// Resolve external data sources through `backend`
    pub fn with_backend(mut self, backend: Arc<dyn DataBackend>) -> Self {
        self.orchestrator = Some(Arc::new(DataOrchestrator::new(
            backend,
            self.config.orchestrator_config(),
        )));
        self.rebuild();
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self.rebuild();
        self
    }

    fn rebuild(&mut self) {
        let mut recalc =
            RecalculationEngine::new(self.expressions.clone()).with_metrics(self.metrics.clone());
        if let Some(orchestrator) = &self.orchestrator {
            recalc = recalc.with_orchestrator(orchestrator.clone());
        }
        self.recalc = recalc;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn expressions(&self) -> &Arc<ExpressionEngine> {
        &self.expressions
    }

    pub fn orchestrator(&self) -> Option<&Arc<DataOrchestrator>> {
        self.orchestrator.as_ref()
    }

    pub fn registry(&self) -> &FormRegistry {
        &self.registry
    }

    /// Compile a schema and make it available under its key
    pub fn publish(&self, schema: &FormSchema) -> Result<Arc<CompiledForm>> {
        let compiled = schema.compile(&self.expressions)?;
        for warning in compiled.warnings() {
            tracing::warn!(form = %compiled.key(), "{}", warning);
        }
        let form = self
            .registry
            .insert(compiled)
            .map_err(|existing| RuntimeError::AlreadyPublished(existing.key().clone()))?;
        tracing::info!(form = %form.key(), fields = form.fields().len(), "published form");
        Ok(form)
    }

    pub fn form(&self, key: &FormKey) -> Result<Arc<CompiledForm>> {
        self.registry
            .get(key)
            .ok_or_else(|| RuntimeError::UnknownForm(key.clone()))
    }

    /// "On change": apply one field change and recompute what depends on it
    pub async fn recalculate(
        &self,
        key: &FormKey,
        form_data: &FormData,
        changed_field: &str,
        new_value: Value,
        options: &RecalcOptions,
    ) -> Result<RecalcOutcome> {
        let form = self.form(key)?;
        let outcome = self
            .recalc
            .recalculate(
                form.as_ref(),
                form.graph(),
                form_data,
                changed_field,
                new_value,
                options,
            )
            .await?;
        Ok(outcome)
    }

    /// "On load": recompute every formula field
    pub async fn recalculate_all(
        &self,
        key: &FormKey,
        form_data: &FormData,
        options: &RecalcOptions,
    ) -> Result<RecalcOutcome> {
        let form = self.form(key)?;
        let outcome = self
            .recalc
            .recalculate_all(form.as_ref(), form.graph(), form_data, options)
            .await?;
        Ok(outcome)
    }

    /// Visibility, enablement and required state of every field
    ///
    /// Conditions run in priority order, later ones overriding earlier ones.
    /// `Show`, `Enable` and `Require` set their flag to the condition's
    /// outcome; `Hide` and `Disable` only act when their condition holds. A
    /// condition that fails to evaluate counts as false. External data is not
    /// resolved here, so conditions reading it evaluate to false.
    pub fn field_states(
        &self,
        key: &FormKey,
        form_data: &FormData,
        options: &RecalcOptions,
    ) -> Result<BTreeMap<String, FieldState>> {
        let form = self.form(key)?;
        let ctx = EvaluationContext {
            variables: options.variables.clone(),
            form_data: form_data.clone(),
            external: BTreeMap::new(),
            now: options.now,
            time_budget: options.time_budget,
            cancel: Some(options.cancel.clone()),
            debug: false,
        };

        let mut states = BTreeMap::new();
        for field in form.fields() {
            let mut state = FieldState {
                visible: true,
                enabled: true,
                required: field.required,
            };

            let mut conditions: Vec<_> = field.conditions.iter().filter(|c| c.enabled).collect();
            conditions.sort_by_key(|c| c.priority);

            for condition in conditions {
                let holds = self.expressions.evaluate_conditional(condition, &ctx);
                match condition.action {
                    ConditionalAction::Show => state.visible = holds,
                    ConditionalAction::Hide if holds => state.visible = false,
                    ConditionalAction::Enable => state.enabled = holds,
                    ConditionalAction::Disable if holds => state.enabled = false,
                    ConditionalAction::Hide | ConditionalAction::Disable => {}
                    ConditionalAction::Require => state.required = holds,
                }
            }
            states.insert(field.name.clone(), state);
        }
        Ok(states)
    }

    /// Ad-hoc evaluation outside any form
    pub fn evaluate(&self, expression: &str, ctx: &EvaluationContext) -> EvaluationResult {
        self.expressions.evaluate(expression, ctx)
    }

    pub fn validate(&self, expression: &str) -> ValidationResult {
        self.expressions.validate_expression(expression)
    }

    pub fn metrics(&self) -> RecalculationMetrics {
        self.recalc.metrics()
    }

    pub fn reset_metrics(&self) {
        self.recalc.reset_metrics();
    }

    pub fn parse_cache_stats(&self) -> ParseCacheStats {
        self.expressions.cache_stats()
    }

    pub fn external_cache_stats(&self) -> Option<CacheStats> {
        self.orchestrator.as_ref().map(|o| o.cache_stats())
    }
}

impl Default for FormRuntime {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDefinition, FieldType};
    use formcalc_expr::ConditionalLogic;

    fn gated_schema() -> FormSchema {
        let mut late = ConditionalLogic::new("qty > 100", ConditionalAction::Hide);
        late.priority = 10;
        let mut off = ConditionalLogic::new("true", ConditionalAction::Hide);
        off.enabled = false;

        FormSchema::new("gated", 1)
            .with_field(FieldDefinition::new("qty", FieldType::Number))
            .with_field(
                FieldDefinition::new("discount", FieldType::Number)
                    .with_condition(late)
                    .with_condition(ConditionalLogic::new("qty >= 10", ConditionalAction::Show))
                    .with_condition(off),
            )
            .with_field(
                FieldDefinition::new("reason", FieldType::Text)
                    .required()
                    .with_condition(ConditionalLogic::new("qty > 5", ConditionalAction::Require))
                    .with_condition(ConditionalLogic::new("missing > 1", ConditionalAction::Enable)),
            )
    }

    fn states(runtime: &FormRuntime, qty: i64) -> BTreeMap<String, FieldState> {
        let data = FormData::from([("qty".to_string(), Value::from(qty))]);
        runtime
            .field_states(&FormKey::new("gated", 1), &data, &RecalcOptions::default())
            .unwrap()
    }

    #[test]
    fn test_field_states_follow_priority() {
        let runtime = FormRuntime::default();
        runtime.publish(&gated_schema()).unwrap();

        assert!(!states(&runtime, 3)["discount"].visible);
        assert!(states(&runtime, 50)["discount"].visible);
        // The later Hide overrides the Show
        assert!(!states(&runtime, 500)["discount"].visible);
    }

    #[test]
    fn test_field_states_fail_closed() {
        let runtime = FormRuntime::default();
        runtime.publish(&gated_schema()).unwrap();

        let reason = states(&runtime, 1)["reason"];
        assert!(!reason.required);
        assert!(!reason.enabled, "unresolvable condition must not enable");
        assert!(states(&runtime, 9)["reason"].required);
        assert_eq!(
            states(&runtime, 1)["qty"],
            FieldState {
                visible: true,
                enabled: true,
                required: false
            }
        );
    }

    #[test]
    fn test_publish_twice_rejected() {
        let runtime = FormRuntime::default();
        runtime.publish(&gated_schema()).unwrap();
        let err = runtime.publish(&gated_schema()).unwrap_err();
        assert_eq!(err.to_string(), "Form gated@v1 is already published");

        let err = runtime.form(&FormKey::new("gated", 2)).unwrap_err();
        assert_eq!(err.to_string(), "Unknown form gated@v2");
    }
}
