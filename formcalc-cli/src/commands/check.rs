//! Compile a form schema and report its dependency graph.

use anyhow::{bail, Context, Result};
use formcalc_core::{EngineConfig, FormSchema, SchemaDiagnostic, SchemaError};
use formcalc_expr::ExpressionEngine;
use formcalc_graph::GraphStats;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct CheckSummary<'a> {
    form: String,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<GraphStats>,
    evaluation_order: Vec<String>,
    errors: &'a [SchemaDiagnostic],
    warnings: &'a [SchemaDiagnostic],
}

pub fn check_schema(config: &EngineConfig, path: &Path, json: bool) -> Result<()> {
    let schema = FormSchema::from_file(path)
        .with_context(|| format!("Failed to load schema {}", path.display()))?;
    let engine = ExpressionEngine::new(config.engine_limits());

    let (compiled, errors) = match schema.compile(&engine) {
        Ok(form) => (Some(form), Vec::new()),
        Err(SchemaError::Invalid { diagnostics, .. }) => (None, diagnostics),
        Err(err) => return Err(err.into()),
    };

    let summary = CheckSummary {
        form: schema.key().to_string(),
        valid: compiled.is_some(),
        stats: compiled.as_ref().map(|f| f.graph().stats()),
        evaluation_order: compiled
            .as_ref()
            .map(|f| f.evaluation_order())
            .unwrap_or_default(),
        errors: &errors,
        warnings: compiled.as_ref().map(|f| f.warnings()).unwrap_or_default(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "{}: {}",
            summary.form,
            if summary.valid { "ok" } else { "invalid" }
        );
        if let Some(stats) = &summary.stats {
            println!("{}", stats);
        }
        if !summary.evaluation_order.is_empty() {
            println!("Evaluation order: {}", summary.evaluation_order.join(" -> "));
        }
        for diag in summary.errors {
            println!("- error {}", diag);
        }
        for diag in summary.warnings {
            println!("- warning {}", diag);
        }
    }

    if !summary.valid {
        bail!("Schema has {} error(s)", errors.len());
    }
    Ok(())
}
