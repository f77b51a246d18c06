//! CLI command implementations.

pub mod check;
pub mod eval;
pub mod functions;
pub mod recalc;
pub mod validate;

pub use check::check_schema;
pub use eval::{eval_expression, EvalOptions};
pub use functions::list_functions;
pub use recalc::{recalc_form, RecalcArgs};
pub use validate::validate_expression;

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDateTime;
use formcalc_core::EngineConfig;
use formcalc_types::{parse_datetime, FormData, Value};
use std::path::Path;

const DEFAULT_CONFIG: &str = "formcalc.yml";

/// Load the explicit config file, or `formcalc.yml` when it exists
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let path = match path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG).exists() => Path::new(DEFAULT_CONFIG),
        None => return Ok(EngineConfig::default()),
    };
    EngineConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

/// Parse a JSON value into the engine's value model
pub(crate) fn parse_json_value(text: &str) -> Result<Value> {
    let json: serde_json::Value =
        serde_json::from_str(text).with_context(|| format!("Invalid JSON: {}", text))?;
    Value::try_from(json).map_err(|e| anyhow!("Unsupported value {}: {}", text, e))
}

/// Read a JSON object of field values
pub(crate) fn read_form_data(path: &Path) -> Result<FormData> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    match parse_json_value(&contents)
        .with_context(|| format!("Failed to parse {}", path.display()))?
    {
        Value::Object(map) => Ok(map),
        other => bail!(
            "{} must contain a JSON object, found {}",
            path.display(),
            other.value_type()
        ),
    }
}

pub(crate) fn parse_now(now: Option<&str>) -> Result<Option<NaiveDateTime>> {
    now.map(|text| {
        parse_datetime(text).ok_or_else(|| anyhow!("Invalid --now timestamp: {}", text))
    })
    .transpose()
}
