//! Batch and single-value resolution of external data

use crate::backend::{DataBackend, Parameters};
use crate::cache::{CacheStats, CachedValue, Expiry, TtlCache};
use crate::error::{FetchError, Result};
use crate::fingerprint::CacheKey;
use crate::source::{
    resolve_parameters, sources_from_context, ExternalSourceConfig, ExternalSources,
    ResolutionPlan,
};
use dashmap::DashMap;
use formcalc_types::{FormData, Value};
use futures::future::join_all;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// TTL for sources that do not set their own
    pub default_ttl: Duration,
    /// Upper bound on a single backend call
    pub fetch_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Hit,
    Miss,
    Failed,
}

fn duration_ms<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

/// Provenance of one resolved (or unresolved) source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceTrace {
    pub status: TraceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    /// Backend latency on a miss, lookup time on a hit
    #[serde(rename = "latency_ms", serialize_with = "duration_ms")]
    pub latency: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SourceTrace {
    fn failed(error: &FetchError, cache_key: Option<&CacheKey>, latency: Duration) -> Self {
        Self {
            status: TraceStatus::Failed,
            cache_key: cache_key.map(|k| k.to_string()),
            latency,
            message: Some(error.to_string()),
        }
    }
}

/// A value returned by [`DataOrchestrator::fetch`]
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub value: Value,
    pub trace: SourceTrace,
}

/// Outcome of a batch resolution; partial success is normal
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExternalData {
    pub data: BTreeMap<String, Value>,
    pub trace: BTreeMap<String, SourceTrace>,
}

impl ExternalData {
    /// Names of sources that could not be resolved
    pub fn failed(&self) -> Vec<&str> {
        self.trace
            .iter()
            .filter(|(_, t)| t.status == TraceStatus::Failed)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failed().is_empty()
    }
}

/// Resolves named external values through a backend and a shared cache
///
/// One orchestrator is meant to be shared (behind an `Arc`) by every form of
/// a process. Concurrent fetches of the same fingerprint are serialized by a
/// per-key lock so the backend is called once; unrelated keys never wait on
/// each other.
pub struct DataOrchestrator {
    backend: Arc<dyn DataBackend>,
    cache: TtlCache,
    in_flight: DashMap<CacheKey, Arc<Mutex<()>>>,
    config: OrchestratorConfig,
}

impl DataOrchestrator {
    pub fn new(backend: Arc<dyn DataBackend>, config: OrchestratorConfig) -> Self {
        Self {
            backend,
            cache: TtlCache::new(),
            in_flight: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Fetch or return the cached value of one request with default settings
    pub async fn get_value(&self, method_id: &str, parameters: &Parameters) -> Result<Value> {
        self.fetch(method_id, parameters, Expiry::default(), &CancellationToken::new())
            .await
            .map(|fetched| fetched.value)
    }

    /// Fetch one request, honouring an expiry override and a cancellation token
    ///
    /// `_`-prefixed and null parameters are not part of the request.
    pub async fn fetch(
        &self,
        method_id: &str,
        parameters: &Parameters,
        expiry: Expiry,
        cancel: &CancellationToken,
    ) -> Result<Fetched> {
        if method_id.trim().is_empty() {
            return Err(FetchError::EmptyMethodId);
        }
        let parameters: Parameters = parameters
            .iter()
            .filter(|(name, value)| !name.starts_with('_') && !value.is_null())
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let key = CacheKey::for_request(method_id, &parameters);
        let started = Instant::now();

        if let Some(hit) = self.cache.get(&key) {
            return Ok(cache_hit(&key, hit, started));
        }

        let in_flight = InFlight::register(&self.in_flight, &key);
        self.fetch_locked(
            in_flight.lock(),
            method_id,
            &parameters,
            &key,
            expiry,
            cancel,
            started,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_locked(
        &self,
        lock: &Mutex<()>,
        method_id: &str,
        parameters: &Parameters,
        key: &CacheKey,
        expiry: Expiry,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<Fetched> {
        let _guard = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            guard = lock.lock() => guard,
        };

        // Another caller may have filled the entry while we waited
        if let Some(hit) = self.cache.peek(key) {
            return Ok(cache_hit(key, hit, started));
        }

        let call_started = Instant::now();
        let timeout = self.config.fetch_timeout;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = tokio::time::timeout(timeout, self.backend.invoke(method_id, parameters)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Timeout {
                        method_id: method_id.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                }
            }
        };
        let latency = call_started.elapsed();

        let value = match outcome {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(method_id, key = %key, error = %err, "external data fetch failed");
                return Err(err);
            }
        };

        let provenance = format!(
            "{} fetched at {} in {}ms",
            method_id,
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            latency.as_millis()
        );
        let expiry = Expiry {
            ttl: expiry.ttl.or(Some(self.config.default_ttl)),
            ..expiry
        };
        self.cache
            .insert_with(key.clone(), value.clone(), expiry, provenance);
        tracing::debug!(method_id, key = %key, latency_ms = latency.as_millis() as u64, "fetched external data");

        Ok(Fetched {
            value,
            trace: SourceTrace {
                status: TraceStatus::Miss,
                cache_key: Some(key.to_string()),
                latency,
                message: None,
            },
        })
    }

    /// Resolve the sources named under `externalDataSources` in a context map
    pub async fn get_external_data(
        &self,
        context: &FormData,
        cancel: &CancellationToken,
    ) -> ExternalData {
        let (sources, invalid) = sources_from_context(context);
        let mut result = self.resolve_sources(&sources, context, cancel).await;
        for (name, error) in invalid {
            result
                .trace
                .insert(name, SourceTrace::failed(&error, None, Duration::ZERO));
        }
        result
    }

    /// Resolve a set of named sources
    ///
    /// Sources are fetched in waves: every source whose referenced sources
    /// are settled is fetched concurrently with the others of its wave. A
    /// failed source only fails the sources that reference it.
    pub async fn resolve_sources(
        &self,
        sources: &ExternalSources,
        form_data: &FormData,
        cancel: &CancellationToken,
    ) -> ExternalData {
        let plan = ResolutionPlan::build(sources);
        let mut result = ExternalData::default();

        for (name, error) in &plan.rejected {
            tracing::warn!(source = %name, error = %error, "external source rejected");
            result
                .trace
                .insert(name.clone(), SourceTrace::failed(error, None, Duration::ZERO));
        }

        let mut pending: Vec<&String> = plan
            .order
            .iter()
            .filter(|name| !plan.rejected.contains_key(*name))
            .collect();

        while !pending.is_empty() {
            let settled = |dep: &String| result.trace.contains_key(dep);
            let (ready, waiting): (Vec<&String>, Vec<&String>) =
                pending.into_iter().partition(|name| {
                    plan.dependencies
                        .get(*name)
                        .map_or(true, |deps| deps.iter().all(settled))
                });

            if ready.is_empty() {
                // Unreachable for an acyclic plan; fail the rest rather than spin
                for name in waiting {
                    let error = FetchError::InvalidSource {
                        name: name.clone(),
                        message: "unresolvable references".to_string(),
                    };
                    result
                        .trace
                        .insert(name.clone(), SourceTrace::failed(&error, None, Duration::ZERO));
                }
                break;
            }

            let wave = ready.iter().map(|name| {
                let config = &sources[*name];
                self.resolve_one(name, config, &plan, &result, form_data, cancel)
            });
            let outcomes = join_all(wave).await;

            for (name, outcome) in ready.into_iter().zip(outcomes) {
                match outcome {
                    Ok(fetched) => {
                        result.data.insert(name.clone(), fetched.value);
                        result.trace.insert(name.clone(), fetched.trace);
                    }
                    Err((error, key)) => {
                        tracing::warn!(source = %name, error = %error, "external source failed");
                        result.trace.insert(
                            name.clone(),
                            SourceTrace::failed(&error, key.as_ref(), Duration::ZERO),
                        );
                    }
                }
            }
            pending = waiting;
        }

        tracing::debug!(
            resolved = result.data.len(),
            failed = result.trace.len() - result.data.len(),
            "resolved external sources"
        );
        result
    }

    async fn resolve_one(
        &self,
        name: &str,
        config: &ExternalSourceConfig,
        plan: &ResolutionPlan,
        settled: &ExternalData,
        form_data: &FormData,
        cancel: &CancellationToken,
    ) -> std::result::Result<Fetched, (FetchError, Option<CacheKey>)> {
        if let Some(deps) = plan.dependencies.get(name) {
            if let Some(dep) = deps.iter().find(|dep| !settled.data.contains_key(*dep)) {
                return Err((
                    FetchError::DependencyFailed {
                        name: name.to_string(),
                        dependency: dep.clone(),
                    },
                    None,
                ));
            }
        }

        let parameters = resolve_parameters(&config.parameters, &settled.data, form_data);
        let key = CacheKey::for_request(&config.method_id, &parameters);
        self.fetch(&config.method_id, &parameters, config.expiry(), cancel)
            .await
            .map_err(|err| (err, Some(key)))
    }

    /// Invalidate every cached entry whose key starts with `prefix`
    pub fn clear_cache(&self, prefix: &str) -> usize {
        let removed = self.cache.invalidate_prefix(prefix);
        tracing::info!(prefix, removed, "cleared external data cache");
        removed
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

fn cache_hit(key: &CacheKey, hit: CachedValue, started: Instant) -> Fetched {
    tracing::debug!(key = %key, age_ms = hit.age.as_millis() as u64, "external data cache hit");
    Fetched {
        value: hit.value,
        trace: SourceTrace {
            status: TraceStatus::Hit,
            cache_key: Some(key.to_string()),
            latency: started.elapsed(),
            message: Some(hit.provenance),
        },
    }
}

/// Per-key fetch lock, dropped from the in-flight map with its last holder
///
/// Cleanup runs on drop so a fetch future abandoned mid-flight does not leave
/// its lock behind.
struct InFlight<'a> {
    map: &'a DashMap<CacheKey, Arc<Mutex<()>>>,
    key: &'a CacheKey,
    lock: Arc<Mutex<()>>,
}

impl<'a> InFlight<'a> {
    fn register(map: &'a DashMap<CacheKey, Arc<Mutex<()>>>, key: &'a CacheKey) -> Self {
        let lock = map.entry(key.clone()).or_default().clone();
        Self { map, key, lock }
    }

    fn lock(&self) -> &Mutex<()> {
        &self.lock
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        // The map and this guard are the only holders
        self.map.remove_if(self.key, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StaticBackend;

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_fetch_releases_its_lock() {
        let backend = StaticBackend::new()
            .with_response("slow", 1)
            .with_delay(Duration::from_secs(5));
        let orchestrator = DataOrchestrator::new(Arc::new(backend), OrchestratorConfig::default());
        let params = Parameters::new();

        let abandoned = tokio::time::timeout(
            Duration::from_secs(1),
            orchestrator.get_value("slow", &params),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(orchestrator.in_flight.is_empty());

        assert_eq!(orchestrator.get_value("slow", &params).await, Ok(Value::from(1)));
        assert!(orchestrator.in_flight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_share_the_lock() {
        let backend = Arc::new(
            StaticBackend::new()
                .with_response("slow", 1)
                .with_delay(Duration::from_secs(2)),
        );
        let orchestrator = DataOrchestrator::new(backend.clone(), OrchestratorConfig::default());
        let params = Parameters::new();

        let (a, b) = tokio::join!(
            orchestrator.get_value("slow", &params),
            orchestrator.get_value("slow", &params)
        );
        assert_eq!((a, b), (Ok(Value::from(1)), Ok(Value::from(1))));
        assert!(orchestrator.in_flight.is_empty());
        assert_eq!(backend.calls("slow"), 1);
        assert_eq!(orchestrator.cache_stats().misses, 2);
        assert_eq!(orchestrator.cache_stats().hits, 0);
    }
}
