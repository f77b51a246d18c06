//! # formcalc CLI
//!
//! Design-time tooling for formulas and form schemas.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "formcalc")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file [default: formcalc.yml when present]
    #[arg(long, env = "FORMCALC_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a single expression
    Eval {
        /// Expression text
        expression: String,

        /// JSON object with field values
        #[arg(long)]
        data: Option<PathBuf>,

        /// Session variable as name=<json>, repeatable
        #[arg(long = "var", value_name = "NAME=JSON")]
        vars: Vec<String>,

        /// Evaluation timestamp for NOW() and TODAY()
        #[arg(long)]
        now: Option<String>,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Statically check an expression; exits non-zero when invalid
    Validate {
        /// Expression text
        expression: String,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Compile a form schema and report its dependency graph
    Check {
        /// Schema file (YAML, or JSON by extension)
        schema: PathBuf,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Recalculate a data file against a form schema
    Recalc {
        /// Schema file (YAML, or JSON by extension)
        schema: PathBuf,

        /// JSON object with field values
        #[arg(long)]
        data: PathBuf,

        /// Field that changed; all formulas are recomputed when absent
        #[arg(long, requires = "value")]
        changed: Option<String>,

        /// New value of the changed field, as JSON
        #[arg(long, requires = "changed")]
        value: Option<String>,

        /// JSON object mapping method ids to canned external responses
        #[arg(long)]
        fixtures: Option<PathBuf>,

        /// Evaluation timestamp for NOW() and TODAY()
        #[arg(long)]
        now: Option<String>,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// List available functions and operators
    Functions {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(if cli.verbose {
                tracing::Level::DEBUG.into()
            } else {
                tracing::Level::WARN.into()
            }),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Eval {
            expression,
            data,
            vars,
            now,
            json,
        } => {
            let opts = commands::EvalOptions {
                data,
                vars,
                now,
                json,
            };
            commands::eval_expression(&config, &expression, opts)
        }
        Commands::Validate { expression, json } => {
            commands::validate_expression(&config, &expression, json)
        }
        Commands::Check { schema, json } => commands::check_schema(&config, &schema, json),
        Commands::Recalc {
            schema,
            data,
            changed,
            value,
            fixtures,
            now,
            json,
        } => {
            let opts = commands::RecalcArgs {
                data,
                change: changed.zip(value),
                fixtures,
                now,
                json,
            };
            commands::recalc_form(config, &schema, opts).await
        }
        Commands::Functions { json } => commands::list_functions(&config, json),
    }
}
