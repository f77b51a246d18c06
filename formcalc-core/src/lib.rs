//! # formcalc-core
//!
//! Configuration, typed form schemas and the [`FormRuntime`] that ties the
//! expression engine, the dependency graph, external data and incremental
//! recalculation together.

pub mod config;
pub mod registry;
pub mod runtime;
pub mod schema;

pub use config::{ConfigError, EngineConfig, EvaluationConfig, ExternalDataConfig};
pub use registry::{FormKey, FormRegistry};
pub use runtime::{FieldState, FormRuntime, RuntimeError};
pub use schema::{
    CompiledForm, FieldDefinition, FieldType, FormSchema, Location, SchemaDiagnostic, SchemaError,
};

pub use formcalc_incremental::{RecalcOptions, RecalcOutcome};
