//! External data source configuration and resolution planning

use crate::backend::Parameters;
use crate::cache::Expiry;
use crate::error::FetchError;
use formcalc_graph::{DependencyGraph, GraphError};
use formcalc_types::{FormData, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Context key under which callers may pass source hints
pub const SOURCES_CONTEXT_KEY: &str = "externalDataSources";

/// A parameter value that is exactly `@{root.path}`
static REFERENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^@\{([^}]+)\}$").expect("valid reference regex"));

/// One named external value a form needs
///
/// The TTL may be written as `ttl_secs`, `ttlSeconds`, `cacheTtlSeconds` or
/// `ttlMinutes`, checked in that order. `_ttlSeconds` and `_slidingSeconds`
/// parameters act as fallbacks for the matching settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "SourceConfigRepr")]
pub struct ExternalSourceConfig {
    pub method_id: String,

    pub parameters: BTreeMap<String, Value>,

    /// Overrides the orchestrator's default TTL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,

    /// Evicts the cached value after this long without a lookup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sliding_secs: Option<u64>,
}

#[derive(Deserialize)]
struct SourceConfigRepr {
    #[serde(alias = "methodId")]
    method_id: String,
    #[serde(default)]
    parameters: BTreeMap<String, Value>,
    #[serde(default, alias = "ttlSeconds")]
    ttl_secs: Option<u64>,
    #[serde(default, rename = "cacheTtlSeconds", alias = "cache_ttl_secs")]
    cache_ttl_secs: Option<u64>,
    #[serde(default, rename = "ttlMinutes", alias = "ttl_minutes")]
    ttl_minutes: Option<u64>,
    #[serde(default, alias = "slidingSeconds")]
    sliding_secs: Option<u64>,
}

impl From<SourceConfigRepr> for ExternalSourceConfig {
    fn from(repr: SourceConfigRepr) -> Self {
        let ttl_secs = repr
            .ttl_secs
            .or(repr.cache_ttl_secs)
            .or(repr.ttl_minutes.map(|minutes| minutes.saturating_mul(60)))
            .or_else(|| positive_secs(&repr.parameters, "_ttlSeconds"));
        let sliding_secs = repr
            .sliding_secs
            .or_else(|| positive_secs(&repr.parameters, "_slidingSeconds"));
        Self {
            method_id: repr.method_id,
            parameters: repr.parameters,
            ttl_secs,
            sliding_secs,
        }
    }
}

fn positive_secs(parameters: &BTreeMap<String, Value>, name: &str) -> Option<u64> {
    parameters
        .get(name)
        .and_then(Value::as_decimal)
        .and_then(|secs| u64::try_from(secs).ok())
        .filter(|secs| *secs > 0)
}

impl ExternalSourceConfig {
    pub fn new(method_id: impl Into<String>) -> Self {
        Self {
            method_id: method_id.into(),
            parameters: BTreeMap::new(),
            ttl_secs: None,
            sliding_secs: None,
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = Some(ttl.as_secs());
        self
    }

    pub fn with_sliding(mut self, window: Duration) -> Self {
        self.sliding_secs = Some(window.as_secs());
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }

    /// Cache lifetime of values fetched for this source
    pub fn expiry(&self) -> Expiry {
        Expiry {
            ttl: self.ttl(),
            sliding: self.sliding_secs.map(Duration::from_secs),
        }
    }

    /// Root names referenced by `@{...}` parameters
    pub fn references(&self) -> BTreeSet<String> {
        self.parameters
            .values()
            .filter_map(reference_path)
            .filter_map(|path| path.split('.').next().map(str::to_string))
            .collect()
    }
}

pub type ExternalSources = BTreeMap<String, ExternalSourceConfig>;

/// Read source hints from a context map
///
/// An absent key means no sources. Entries that do not describe a source are
/// reported individually so the remaining sources still resolve.
pub fn sources_from_context(
    context: &FormData,
) -> (ExternalSources, BTreeMap<String, FetchError>) {
    let mut sources = ExternalSources::new();
    let mut invalid = BTreeMap::new();

    let Some(Value::Object(hints)) = context.get(SOURCES_CONTEXT_KEY) else {
        if context.contains_key(SOURCES_CONTEXT_KEY) {
            tracing::warn!("{} must be an object of sources", SOURCES_CONTEXT_KEY);
        }
        return (sources, invalid);
    };

    for (name, hint) in hints {
        let json: serde_json::Value = hint.clone().into();
        match serde_json::from_value::<ExternalSourceConfig>(json) {
            Ok(config) => {
                sources.insert(name.clone(), config);
            }
            Err(err) => {
                invalid.insert(
                    name.clone(),
                    FetchError::InvalidSource {
                        name: name.clone(),
                        message: err.to_string(),
                    },
                );
            }
        }
    }
    (sources, invalid)
}

fn reference_path(value: &Value) -> Option<&str> {
    let Value::String(text) = value else {
        return None;
    };
    REFERENCE_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
}

/// Resolution order for a set of sources
#[derive(Debug, Clone, Default)]
pub struct ResolutionPlan {
    /// Sources in an order where referenced sources come first
    pub order: Vec<String>,
    /// Sources referenced by each source
    pub dependencies: BTreeMap<String, Vec<String>>,
    /// Sources that cannot be resolved at all
    pub rejected: BTreeMap<String, FetchError>,
}

impl ResolutionPlan {
    /// Order sources by their `@{source...}` references
    ///
    /// A reference cycle rejects every source on it.
    pub fn build(sources: &ExternalSources) -> Self {
        let mut graph = DependencyGraph::new();
        let mut plan = ResolutionPlan::default();

        for (name, config) in sources {
            if let Err(err) = graph.add_field(name) {
                plan.reject(name, err.to_string());
                continue;
            }
            if config.method_id.trim().is_empty() {
                plan.reject(name, FetchError::EmptyMethodId.to_string());
            }
        }

        for (name, config) in sources {
            for target in config.references() {
                if !sources.contains_key(&target) || &target == name {
                    continue;
                }
                match graph.add_dependency(name, &target) {
                    Ok(()) => plan
                        .dependencies
                        .entry(name.clone())
                        .or_default()
                        .push(target),
                    Err(GraphError::CircularDependency { path }) => {
                        let message = format!("reference cycle {}", path.join(" -> "));
                        for member in &path {
                            plan.reject(member, message.clone());
                        }
                    }
                    Err(err) => plan.reject(name, err.to_string()),
                }
            }
        }

        plan.order = graph.topological_order();
        plan
    }

    fn reject(&mut self, name: &str, message: String) {
        self.rejected
            .entry(name.to_string())
            .or_insert_with(|| FetchError::InvalidSource {
                name: name.to_string(),
                message,
            });
    }
}

/// Substitute `@{...}` references and drop parameters not meant for the
/// backend
///
/// References resolve against already resolved sources first, then the form
/// data. A path that leads nowhere becomes null and is therefore dropped, as
/// are `_`-prefixed parameters.
pub fn resolve_parameters(
    parameters: &BTreeMap<String, Value>,
    resolved: &BTreeMap<String, Value>,
    form_data: &FormData,
) -> Parameters {
    parameters
        .iter()
        .filter(|(name, _)| !name.starts_with('_'))
        .map(|(name, value)| {
            let value = match reference_path(value) {
                Some(path) => lookup_path(path, resolved, form_data),
                None => value.clone(),
            };
            (name.clone(), value)
        })
        .filter(|(_, value)| !value.is_null())
        .collect()
}

fn lookup_path(path: &str, resolved: &BTreeMap<String, Value>, form_data: &FormData) -> Value {
    let mut segments = path.split('.');
    let Some(root) = segments.next() else {
        return Value::Null;
    };
    let mut current = match resolved.get(root).or_else(|| form_data.get(root)) {
        Some(value) => value,
        None => return Value::Null,
    };
    for segment in segments {
        current = match current.get(segment) {
            Some(next) => next,
            None => return Value::Null,
        };
    }
    current.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_references() {
        let config = ExternalSourceConfig::new("quote")
            .with_parameter("customer", "@{customer.id}")
            .with_parameter("currency", "@{ rates }")
            .with_parameter("note", "price @{x}")
            .with_parameter("count", 3);
        assert_eq!(
            config.references().into_iter().collect::<Vec<_>>(),
            vec!["customer".to_string(), "rates".to_string()]
        );
    }

    #[test]
    fn test_plan_orders_by_reference() {
        let mut sources = ExternalSources::new();
        sources.insert(
            "a_quote".into(),
            ExternalSourceConfig::new("quote").with_parameter("rate", "@{rates.usd}"),
        );
        sources.insert("rates".into(), ExternalSourceConfig::new("rates"));

        let plan = ResolutionPlan::build(&sources);
        assert_eq!(plan.order, vec!["rates", "a_quote"]);
        assert_eq!(plan.dependencies["a_quote"], vec!["rates"]);
        assert!(plan.rejected.is_empty());
    }

    #[test]
    fn test_plan_rejects_cycles() {
        let mut sources = ExternalSources::new();
        sources.insert("a".into(), ExternalSourceConfig::new("m").with_parameter("p", "@{b}"));
        sources.insert("b".into(), ExternalSourceConfig::new("m").with_parameter("p", "@{a}"));
        sources.insert("c".into(), ExternalSourceConfig::new("m"));
        sources.insert("d".into(), ExternalSourceConfig::new(" "));

        let plan = ResolutionPlan::build(&sources);
        assert!(plan.rejected.contains_key("a"));
        assert!(plan.rejected.contains_key("b"));
        assert!(!plan.rejected.contains_key("c"));
        assert!(plan.rejected.contains_key("d"));
    }

    #[test]
    fn test_resolve_parameters() {
        let mut resolved = BTreeMap::new();
        resolved.insert(
            "rates".to_string(),
            Value::Object(BTreeMap::from([("usd".to_string(), Value::from(2))])),
        );
        let mut form = FormData::new();
        form.insert("customer_id".into(), Value::from("C-7"));

        let parameters = BTreeMap::from([
            ("rate".to_string(), Value::from("@{rates.usd}")),
            ("customer".to_string(), Value::from("@{customer_id}")),
            ("missing".to_string(), Value::from("@{rates.eur}")),
            ("_ttl".to_string(), Value::from(60)),
            ("empty".to_string(), Value::Null),
            ("plain".to_string(), Value::from("x")),
        ]);

        let sent = resolve_parameters(&parameters, &resolved, &form);
        assert_eq!(
            sent.keys().cloned().collect::<Vec<_>>(),
            vec!["customer", "plain", "rate"]
        );
        assert_eq!(sent["rate"], Value::from(2));
        assert_eq!(sent["customer"], Value::from("C-7"));
    }

    #[test]
    fn test_sources_from_context() {
        let hints: Value = serde_json::from_str::<serde_json::Value>(
            r#"{
                "rates": {"methodId": "fx", "parameters": {"base": "EUR"}, "ttlSeconds": 30},
                "broken": 5
            }"#,
        )
        .unwrap()
        .try_into()
        .unwrap();
        let mut context = FormData::new();
        context.insert(SOURCES_CONTEXT_KEY.to_string(), hints);

        let (sources, invalid) = sources_from_context(&context);
        assert_eq!(sources["rates"].method_id, "fx");
        assert_eq!(sources["rates"].ttl(), Some(Duration::from_secs(30)));
        assert!(invalid.contains_key("broken"));

        let (sources, invalid) = sources_from_context(&FormData::new());
        assert!(sources.is_empty() && invalid.is_empty());
    }

    fn config(json: &str) -> ExternalSourceConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_ttl_spellings() {
        assert_eq!(config(r#"{"method_id": "m", "ttl_secs": 5}"#).ttl_secs, Some(5));
        assert_eq!(config(r#"{"methodId": "m", "ttlSeconds": 6}"#).ttl_secs, Some(6));
        assert_eq!(config(r#"{"methodId": "m", "cacheTtlSeconds": 7}"#).ttl_secs, Some(7));
        assert_eq!(config(r#"{"methodId": "m", "ttlMinutes": 2}"#).ttl_secs, Some(120));
        assert_eq!(config(r#"{"methodId": "m"}"#).ttl_secs, None);

        // ttlSeconds wins over the other spellings
        let both = config(r#"{"methodId": "m", "ttlSeconds": 9, "ttlMinutes": 1}"#);
        assert_eq!(both.ttl_secs, Some(9));
    }

    #[test]
    fn test_expiry_from_settings_and_parameters() {
        let source = config(r#"{"methodId": "m", "ttlMinutes": 1, "slidingSeconds": 20}"#);
        assert_eq!(
            source.expiry(),
            Expiry {
                ttl: Some(Duration::from_secs(60)),
                sliding: Some(Duration::from_secs(20)),
            }
        );

        let hinted = config(
            r#"{"methodId": "m", "parameters": {"_ttlSeconds": 45, "_slidingSeconds": 0}}"#,
        );
        assert_eq!(hinted.ttl(), Some(Duration::from_secs(45)));
        assert_eq!(hinted.sliding_secs, None);

        let yaml: ExternalSourceConfig =
            serde_yaml::from_str("method_id: m\ncacheTtlSeconds: 30\n").unwrap();
        assert_eq!(yaml.ttl_secs, Some(30));
    }
}
