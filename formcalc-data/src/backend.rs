//! Pluggable fetch backends

use crate::error::{FetchError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use formcalc_types::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Parameters sent to a backend method
pub type Parameters = BTreeMap<String, Value>;

/// Method invocation interface of an API integration layer
///
/// The orchestrator owns caching, timeouts and cancellation; implementations
/// only perform the call.
#[async_trait]
pub trait DataBackend: Send + Sync {
    async fn invoke(&self, method_id: &str, parameters: &Parameters) -> Result<Value>;
}

#[derive(Debug, Clone)]
enum Response {
    Value(Value),
    Failure(String),
}

/// In-memory backend answering from fixtures
///
/// Counts calls per method so callers can observe cache behaviour.
#[derive(Debug, Default)]
pub struct StaticBackend {
    responses: DashMap<String, Response>,
    calls: DashMap<String, usize>,
    delay: Option<Duration>,
}

impl StaticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend answering each method id with the fixture value
    pub fn from_fixtures(fixtures: BTreeMap<String, Value>) -> Self {
        let backend = Self::new();
        for (method_id, value) in fixtures {
            backend.set_response(method_id, value);
        }
        backend
    }

    pub fn with_response(self, method_id: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_response(method_id, value);
        self
    }

    pub fn with_failure(self, method_id: impl Into<String>, message: impl Into<String>) -> Self {
        self.responses
            .insert(method_id.into(), Response::Failure(message.into()));
        self
    }

    /// Sleep this long before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_response(&self, method_id: impl Into<String>, value: impl Into<Value>) {
        self.responses
            .insert(method_id.into(), Response::Value(value.into()));
    }

    /// Number of invocations of a method so far
    pub fn calls(&self, method_id: &str) -> usize {
        self.calls.get(method_id).map(|count| *count).unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.iter().map(|entry| *entry.value()).sum()
    }
}

#[async_trait]
impl DataBackend for StaticBackend {
    async fn invoke(&self, method_id: &str, _parameters: &Parameters) -> Result<Value> {
        *self.calls.entry(method_id.to_string()).or_insert(0) += 1;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let response = self
            .responses
            .get(method_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| FetchError::UnknownMethod(method_id.to_string()))?;

        match response {
            Response::Value(value) => Ok(value),
            Response::Failure(message) => Err(FetchError::backend(method_id, message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_backend() {
        let backend = StaticBackend::new()
            .with_response("rates", 3)
            .with_failure("broken", "upstream returned 500");

        assert_eq!(
            backend.invoke("rates", &Parameters::new()).await,
            Ok(Value::from(3))
        );
        assert!(matches!(
            backend.invoke("broken", &Parameters::new()).await,
            Err(FetchError::Backend { .. })
        ));
        assert_eq!(
            backend.invoke("missing", &Parameters::new()).await,
            Err(FetchError::UnknownMethod("missing".into()))
        );
        assert_eq!(backend.calls("rates"), 1);
        assert_eq!(backend.total_calls(), 3);
    }
}
