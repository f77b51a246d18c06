//! Recalculate a data file against a form schema.

use super::{parse_json_value, parse_now, read_form_data};
use anyhow::{bail, Context, Result};
use formcalc_core::{EngineConfig, FormRuntime, FormSchema, RecalcOptions};
use formcalc_data::StaticBackend;
use formcalc_types::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct RecalcArgs {
    pub data: PathBuf,
    /// Changed field and its new value as JSON
    pub change: Option<(String, String)>,
    pub fixtures: Option<PathBuf>,
    pub now: Option<String>,
    pub json: bool,
}

pub async fn recalc_form(config: EngineConfig, schema_path: &Path, args: RecalcArgs) -> Result<()> {
    let schema = FormSchema::from_file(schema_path)
        .with_context(|| format!("Failed to load schema {}", schema_path.display()))?;

    let mut runtime = FormRuntime::new(config);
    if let Some(path) = &args.fixtures {
        let fixtures = read_form_data(path).context("Failed to load fixtures")?;
        runtime = runtime.with_backend(Arc::new(StaticBackend::from_fixtures(fixtures)));
    }
    let form = runtime.publish(&schema)?;

    let mut form_data = form.defaults();
    form_data.extend(read_form_data(&args.data)?);

    let options = RecalcOptions {
        now: parse_now(args.now.as_deref())?,
        ..RecalcOptions::default()
    };

    let outcome = match &args.change {
        Some((field, value)) => {
            let value: Value = parse_json_value(value)?;
            runtime
                .recalculate(form.key(), &form_data, field, value, &options)
                .await?
        }
        None => runtime.recalculate_all(form.key(), &form_data, &options).await?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        for field in &outcome.recalculated {
            println!("{} = {}", field, outcome.form_data[field]);
        }
        for failure in &outcome.failures {
            println!("! {}: {}", failure.field, failure.message);
        }
        for (name, trace) in &outcome.external_trace {
            println!(
                "external {}: {:?}{}",
                name,
                trace.status,
                trace
                    .message
                    .as_deref()
                    .map(|m| format!(" ({})", m))
                    .unwrap_or_default()
            );
        }
    }

    if !outcome.is_clean() {
        bail!("{} formula(s) failed", outcome.failures.len());
    }
    Ok(())
}
