//! Static validation of a single expression.

use anyhow::{bail, Result};
use formcalc_core::EngineConfig;
use formcalc_expr::{parse, ErrorContext, ExpressionEngine, ParseLimits};

pub fn validate_expression(config: &EngineConfig, expression: &str, json: bool) -> Result<()> {
    let engine = ExpressionEngine::new(config.engine_limits());
    let report = engine.validate_expression(expression);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        if report.is_valid {
            println!(
                "Valid expression (complexity {}, {})",
                report.complexity,
                if report.deterministic {
                    "deterministic"
                } else {
                    "depends on the evaluation time"
                }
            );
            if !report.variables.is_empty() {
                println!("Variables: {}", report.variables.join(", "));
            }
            if !report.functions.is_empty() {
                println!("Functions: {}", report.functions.join(", "));
            }
        }
        for issue in &report.security_issues {
            println!("security: {}", issue.message);
        }
        for error in &report.errors {
            println!("error: {}", error.message);
        }
        for warning in &report.warnings {
            println!("warning: {}", warning.message);
        }

        // Point at the offending text for syntax errors
        let limits = ParseLimits {
            max_depth: config.evaluation.max_depth,
            max_nodes: config.evaluation.max_nodes,
        };
        if let Err(err) = parse(expression, limits) {
            if err.span().is_some() {
                print!("\n{}", ErrorContext::new(expression, &err));
            }
        }
    }

    if !report.is_valid {
        bail!("Expression is invalid");
    }
    Ok(())
}
