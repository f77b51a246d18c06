//! External data orchestration
//!
//! Formulas may read values that live outside the form: exchange rates,
//! customer records, quotes. A [`DataOrchestrator`] resolves named
//! [`ExternalSourceConfig`]s through a pluggable [`DataBackend`], caching each
//! response under a fingerprint of its request for a configurable TTL.
//!
//! Failures are per source. A batch always completes and reports what it
//! could not resolve in its trace.

pub mod backend;
pub mod cache;
pub mod error;
pub mod fingerprint;
pub mod orchestrator;
pub mod source;

pub use backend::{DataBackend, Parameters, StaticBackend};
pub use cache::{CacheStats, CachedValue, Expiry, TtlCache};
pub use error::{FetchError, Result};
pub use fingerprint::{CacheKey, KEY_PREFIX};
pub use orchestrator::{
    DataOrchestrator, ExternalData, Fetched, OrchestratorConfig, SourceTrace, TraceStatus,
};
pub use source::{
    resolve_parameters, sources_from_context, ExternalSourceConfig, ExternalSources,
    ResolutionPlan, SOURCES_CONTEXT_KEY,
};
