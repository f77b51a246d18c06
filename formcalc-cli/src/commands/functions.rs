//! List the function registry and the operator table.

use anyhow::Result;
use formcalc_core::EngineConfig;
use formcalc_expr::{ExpressionEngine, FunctionSignature, OperatorInfo, ParamKind};
use serde::Serialize;

#[derive(Serialize)]
struct Catalog {
    functions: Vec<FunctionSignature>,
    operators: Vec<OperatorInfo>,
}

fn render_params(sig: &FunctionSignature) -> String {
    sig.params
        .iter()
        .map(|p| match p.kind {
            ParamKind::Required => format!("{}: {}", p.name, p.ty),
            ParamKind::Optional => format!("{}?: {}", p.name, p.ty),
            ParamKind::Rest => format!("...{}: {}", p.name, p.ty),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn list_functions(config: &EngineConfig, json: bool) -> Result<()> {
    let engine = ExpressionEngine::new(config.engine_limits());
    let catalog = Catalog {
        functions: engine.available_functions(),
        operators: engine.supported_operators(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&catalog)?);
        return Ok(());
    }

    println!("Functions:");
    for sig in &catalog.functions {
        println!(
            "  {}({}) -> {}  {}",
            sig.name,
            render_params(sig),
            sig.returns,
            sig.description
        );
    }
    println!("\nOperators:");
    for op in &catalog.operators {
        println!(
            "  {:<3} {}{}",
            op.symbol,
            op.description,
            if op.unary { " (unary)" } else { "" }
        );
    }
    Ok(())
}
