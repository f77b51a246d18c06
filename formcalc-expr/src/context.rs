//! Evaluation inputs and outputs

use crate::error::{ErrorKind, ExprError};
use chrono::NaiveDateTime;
use formcalc_types::{FormData, Value, ValueType};
use serde::{Serialize, Serializer};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Root name under which resolved external data is visible to formulas
pub const EXTERNAL_ROOT: &str = "external";

/// Variables visible to one evaluation call
///
/// Root names resolve against `variables` first, then `form_data`, then the
/// `external` root. The context is only read during evaluation.
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    /// Session or caller supplied values
    pub variables: BTreeMap<String, Value>,
    /// Current field values of the form
    pub form_data: FormData,
    /// Values resolved by the data orchestrator
    pub external: BTreeMap<String, Value>,
    /// Timestamp returned by `NOW()` and `TODAY()`
    pub now: Option<NaiveDateTime>,
    /// Overrides the engine's default time budget
    pub time_budget: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    /// Attach step counts and cache information to results
    pub debug: bool,
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_form_data(form_data: FormData) -> Self {
        Self {
            form_data,
            ..Self::default()
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.form_data.insert(name.into(), value.into());
        self
    }

    pub fn with_external(mut self, external: BTreeMap<String, Value>) -> Self {
        self.external = external;
        self
    }

    pub fn with_now(mut self, now: NaiveDateTime) -> Self {
        self.now = Some(now);
        self
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Resolve a root variable name
    pub fn lookup(&self, name: &str) -> Option<Cow<'_, Value>> {
        if let Some(value) = self.variables.get(name).or_else(|| self.form_data.get(name)) {
            return Some(Cow::Borrowed(value));
        }
        if name == EXTERNAL_ROOT {
            return Some(Cow::Owned(Value::Object(self.external.clone())));
        }
        None
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }
}

fn duration_ms<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

/// Outcome of evaluating one expression
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationResult {
    pub value: Value,
    pub value_type: ValueType,
    pub success: bool,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    #[serde(rename = "execution_time_ms", serialize_with = "duration_ms")]
    pub execution_time: Duration,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl EvaluationResult {
    pub fn success(value: Value, execution_time: Duration) -> Self {
        Self {
            value_type: value.value_type(),
            value,
            success: true,
            error: None,
            error_kind: None,
            execution_time,
            metadata: BTreeMap::new(),
        }
    }

    pub fn failure(error: &ExprError, execution_time: Duration) -> Self {
        Self {
            value: Value::Null,
            value_type: ValueType::Null,
            success: false,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            execution_time,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    /// The value as a boolean, or `None` if failed or not boolean
    pub fn as_bool(&self) -> Option<bool> {
        if self.success {
            self.value.as_bool()
        } else {
            None
        }
    }
}
