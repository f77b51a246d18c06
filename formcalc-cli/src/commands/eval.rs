//! Evaluate a single expression against optional data and variables.

use super::{parse_json_value, parse_now, read_form_data};
use anyhow::{anyhow, bail, Result};
use formcalc_core::EngineConfig;
use formcalc_expr::{EvaluationContext, ExpressionEngine};
use std::path::PathBuf;

pub struct EvalOptions {
    pub data: Option<PathBuf>,
    pub vars: Vec<String>,
    pub now: Option<String>,
    pub json: bool,
}

pub fn eval_expression(config: &EngineConfig, expression: &str, opts: EvalOptions) -> Result<()> {
    let engine = ExpressionEngine::new(config.engine_limits());

    let mut ctx = match &opts.data {
        Some(path) => EvaluationContext::from_form_data(read_form_data(path)?),
        None => EvaluationContext::new(),
    };
    for var in &opts.vars {
        let (name, value) = var
            .split_once('=')
            .ok_or_else(|| anyhow!("Expected NAME=JSON, got '{}'", var))?;
        ctx.variables
            .insert(name.trim().to_string(), parse_json_value(value)?);
    }
    ctx.now = parse_now(opts.now.as_deref())?;
    ctx.debug = opts.json;

    let result = engine.evaluate(expression, &ctx);

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if result.success {
        println!("{}", result.value);
    }

    if !result.success {
        bail!(
            "Evaluation failed: {}",
            result.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    Ok(())
}
