//! Typed form schemas and their compilation
//!
//! A [`FormSchema`] is plain configuration, deserialized once from YAML or
//! JSON. Compiling it checks every formula and condition with the expression
//! engine, extracts the references of each formula and builds the dependency
//! graph. Compilation fails loudly: a schema with a single bad expression is
//! rejected with every problem found, never partially accepted.

use crate::registry::FormKey;
use formcalc_data::{ExternalSources, ResolutionPlan};
use formcalc_expr::{ConditionalLogic, ExpressionEngine, ValidationResult, EXTERNAL_ROOT};
use formcalc_graph::{DependencyGraph, GraphError};
use formcalc_incremental::FormulaSource;
use formcalc_types::{FormData, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Failed to read schema file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Form '{form_id}' has {} problem(s):\n{}", .diagnostics.len(), render(.diagnostics))]
    Invalid {
        form_id: String,
        diagnostics: Vec<SchemaDiagnostic>,
    },
}

fn render(diagnostics: &[SchemaDiagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| format!("  {}", d))
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Result<T> = std::result::Result<T, SchemaError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    Text,
    Number,
    Boolean,
    Date,
    Select,
    /// Read-only field whose value comes from its formula
    Calculated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,

    #[serde(default, alias = "type")]
    pub field_type: FieldType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ConditionalLogic>,

    #[serde(default)]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            label: None,
            formula: None,
            conditions: Vec::new(),
            required: false,
            default_value: None,
        }
    }

    pub fn calculated(name: impl Into<String>, formula: impl Into<String>) -> Self {
        Self {
            formula: Some(formula.into()),
            ..Self::new(name, FieldType::Calculated)
        }
    }

    pub fn with_condition(mut self, condition: ConditionalLogic) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormSchema {
    #[serde(alias = "formId")]
    pub form_id: String,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub fields: Vec<FieldDefinition>,

    #[serde(default, alias = "externalDataSources")]
    pub external_data_sources: ExternalSources,
}

/// Where in a schema a diagnostic points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "index")]
pub enum Location {
    Form,
    Field,
    Formula,
    Condition(usize),
    ExternalSource,
}

/// One problem (or warning) found while compiling a schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaDiagnostic {
    /// Field or source name, empty for form-level findings
    pub subject: String,
    pub location: Location,
    pub message: String,
}

impl SchemaDiagnostic {
    fn new(subject: &str, location: Location, message: impl Into<String>) -> Self {
        Self {
            subject: subject.to_string(),
            location,
            message: message.into(),
        }
    }
}

impl fmt::Display for SchemaDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location {
            Location::Form => write!(f, "{}", self.message),
            Location::Field => write!(f, "field '{}': {}", self.subject, self.message),
            Location::Formula => write!(f, "field '{}' formula: {}", self.subject, self.message),
            Location::Condition(i) => {
                write!(f, "field '{}' condition {}: {}", self.subject, i, self.message)
            }
            Location::ExternalSource => {
                write!(f, "external source '{}': {}", self.subject, self.message)
            }
        }
    }
}

impl FormSchema {
    pub fn new(form_id: impl Into<String>, version: u32) -> Self {
        Self {
            form_id: form_id.into(),
            version,
            fields: Vec::new(),
            external_data_sources: ExternalSources::new(),
        }
    }

    pub fn with_field(mut self, field: FieldDefinition) -> Self {
        self.fields.push(field);
        self
    }

    /// Load a schema, as JSON when the extension says so and YAML otherwise
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(serde_yaml::from_str(&contents)?)
        }
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn key(&self) -> FormKey {
        FormKey::new(&self.form_id, self.version)
    }

    /// Check every expression and build the dependency graph
    pub fn compile(&self, engine: &ExpressionEngine) -> Result<CompiledForm> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.form_id.trim().is_empty() {
            errors.push(SchemaDiagnostic::new("", Location::Form, "Form id cannot be empty"));
        }

        let mut names = BTreeSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                errors.push(SchemaDiagnostic::new(
                    &field.name,
                    Location::Field,
                    "Field name cannot be empty",
                ));
            } else if field.name == EXTERNAL_ROOT {
                errors.push(SchemaDiagnostic::new(
                    &field.name,
                    Location::Field,
                    format!("'{}' is reserved for external data", EXTERNAL_ROOT),
                ));
            } else if !names.insert(field.name.as_str()) {
                errors.push(SchemaDiagnostic::new(
                    &field.name,
                    Location::Field,
                    "Duplicate field name",
                ));
            }
            if field.field_type == FieldType::Calculated && field.formula.is_none() {
                errors.push(SchemaDiagnostic::new(
                    &field.name,
                    Location::Field,
                    "Calculated field has no formula",
                ));
            }
        }

        let mut formulas = BTreeMap::new();
        let mut references: Vec<(&str, Vec<String>)> = Vec::new();
        for field in &self.fields {
            if let Some(formula) = &field.formula {
                let report = engine.validate_expression(formula);
                let refs = self.check_expression(
                    &field.name,
                    Location::Formula,
                    &report,
                    &names,
                    &mut errors,
                    &mut warnings,
                );
                formulas.insert(field.name.clone(), formula.clone());
                references.push((field.name.as_str(), refs));
            }
            for (i, condition) in field.conditions.iter().enumerate() {
                let report = engine.validate_expression(&condition.expression);
                self.check_expression(
                    &field.name,
                    Location::Condition(i),
                    &report,
                    &names,
                    &mut errors,
                    &mut warnings,
                );
            }
        }

        let plan = ResolutionPlan::build(&self.external_data_sources);
        for (name, error) in &plan.rejected {
            errors.push(SchemaDiagnostic::new(
                name,
                Location::ExternalSource,
                error.to_string(),
            ));
        }

        // Declaration order decides ties in the evaluation order
        let mut graph = DependencyGraph::new();
        for field in &self.fields {
            if !field.name.trim().is_empty() {
                // Empty names were reported above
                let _ = graph.add_field(&field.name);
            }
        }
        for (field, refs) in references {
            for target in refs {
                match graph.add_dependency(field, &target) {
                    Ok(()) => {}
                    Err(GraphError::CircularDependency { path }) => {
                        errors.push(SchemaDiagnostic::new(
                            field,
                            Location::Formula,
                            format!("Circular dependency: {}", path.join(" -> ")),
                        ));
                    }
                    Err(err) => {
                        errors.push(SchemaDiagnostic::new(field, Location::Formula, err.to_string()));
                    }
                }
            }
        }

        if !errors.is_empty() {
            tracing::warn!(
                form_id = %self.form_id,
                problems = errors.len(),
                "form schema rejected"
            );
            return Err(SchemaError::Invalid {
                form_id: self.form_id.clone(),
                diagnostics: errors,
            });
        }

        tracing::debug!(
            form_id = %self.form_id,
            version = self.version,
            fields = self.fields.len(),
            formulas = formulas.len(),
            warnings = warnings.len(),
            "compiled form schema"
        );

        Ok(CompiledForm {
            key: self.key(),
            fields: self.fields.clone(),
            formulas,
            graph,
            external_sources: self.external_data_sources.clone(),
            warnings,
        })
    }

    /// Fold one validation report into the diagnostics; returns the field
    /// names the expression depends on
    fn check_expression(
        &self,
        subject: &str,
        location: Location,
        report: &ValidationResult,
        fields: &BTreeSet<&str>,
        errors: &mut Vec<SchemaDiagnostic>,
        warnings: &mut Vec<SchemaDiagnostic>,
    ) -> Vec<String> {
        for issue in &report.security_issues {
            errors.push(SchemaDiagnostic::new(
                subject,
                location,
                format!("Security violation: {}", issue.message),
            ));
        }
        for error in &report.errors {
            errors.push(SchemaDiagnostic::new(subject, location, error.message.clone()));
        }
        for warning in &report.warnings {
            warnings.push(SchemaDiagnostic::new(subject, location, warning.message.clone()));
        }

        let mut depends_on = Vec::new();
        for variable in &report.variables {
            if fields.contains(variable.as_str()) {
                depends_on.push(variable.clone());
            } else if variable == EXTERNAL_ROOT {
                if self.external_data_sources.is_empty() {
                    warnings.push(SchemaDiagnostic::new(
                        subject,
                        location,
                        "Reads external data but the form declares no external sources",
                    ));
                }
            } else {
                warnings.push(SchemaDiagnostic::new(
                    subject,
                    location,
                    format!("'{}' is not a field of this form; it must be supplied as a variable", variable),
                ));
            }
        }
        depends_on
    }
}

/// An immutable, checked form ready for evaluation
#[derive(Debug, Clone)]
pub struct CompiledForm {
    key: FormKey,
    fields: Vec<FieldDefinition>,
    formulas: BTreeMap<String, String>,
    graph: DependencyGraph,
    external_sources: ExternalSources,
    warnings: Vec<SchemaDiagnostic>,
}

impl CompiledForm {
    pub fn key(&self) -> &FormKey {
        &self.key
    }

    pub fn fields(&self) -> &[FieldDefinition] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn warnings(&self) -> &[SchemaDiagnostic] {
        &self.warnings
    }

    /// Formula fields in evaluation order
    pub fn evaluation_order(&self) -> Vec<String> {
        self.graph
            .topological_order()
            .into_iter()
            .filter(|name| self.formulas.contains_key(name))
            .collect()
    }

    /// Declared default values, as initial form data
    pub fn defaults(&self) -> FormData {
        self.fields
            .iter()
            .filter_map(|f| f.default_value.clone().map(|v| (f.name.clone(), v)))
            .collect()
    }
}

impl FormulaSource for CompiledForm {
    fn formula(&self, field: &str) -> Option<&str> {
        self.formulas.get(field).map(String::as_str)
    }

    fn external_sources(&self) -> Option<&ExternalSources> {
        Some(&self.external_sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formcalc_expr::ConditionalAction;

    fn order_schema() -> FormSchema {
        FormSchema::new("order", 1)
            .with_field(FieldDefinition::new("qty", FieldType::Number).with_default(1))
            .with_field(FieldDefinition::new("price", FieldType::Number))
            .with_field(FieldDefinition::calculated("tax", "ROUND(total * rate, 2)"))
            .with_field(FieldDefinition::calculated("total", "qty * price"))
    }

    #[test]
    fn test_compile_builds_graph() {
        let engine = ExpressionEngine::default();
        let form = order_schema().compile(&engine).unwrap();

        assert_eq!(form.evaluation_order(), vec!["total", "tax"]);
        assert_eq!(form.graph().dependencies("total"), vec!["qty", "price"]);
        assert_eq!(form.formula("tax"), Some("ROUND(total * rate, 2)"));
        assert_eq!(form.formula("qty"), None);
        assert_eq!(form.defaults()["qty"], Value::from(1));

        // `rate` is not a field, so it is assumed to be a session variable
        assert_eq!(form.warnings().len(), 1);
        assert!(form.warnings()[0].message.contains("'rate' is not a field"));
    }

    #[test]
    fn test_compile_reports_every_problem() {
        let engine = ExpressionEngine::default();
        let schema = order_schema()
            .with_field(FieldDefinition::calculated("broken", "qty * )"))
            .with_field(FieldDefinition::calculated("sneaky", "eval('1')"))
            .with_field(FieldDefinition::new("qty", FieldType::Number))
            .with_field(
                FieldDefinition::new("notes", FieldType::Text)
                    .with_condition(ConditionalLogic::new("qty >", ConditionalAction::Show)),
            );

        let err = schema.compile(&engine).unwrap_err();
        let SchemaError::Invalid { diagnostics, .. } = &err else {
            panic!("expected invalid schema, got {err}");
        };
        let subjects: Vec<_> = diagnostics.iter().map(|d| d.subject.as_str()).collect();
        assert!(subjects.contains(&"broken"));
        assert!(subjects.contains(&"sneaky"));
        assert!(subjects.contains(&"qty"));
        assert!(diagnostics
            .iter()
            .any(|d| d.location == Location::Condition(0) && d.subject == "notes"));
        assert!(err.to_string().starts_with("Form 'order' has"));
    }

    #[test]
    fn test_compile_rejects_cycles() {
        let engine = ExpressionEngine::default();
        let schema = FormSchema::new("loop", 1)
            .with_field(FieldDefinition::calculated("a", "b + 1"))
            .with_field(FieldDefinition::calculated("b", "a + 1"));

        let err = schema.compile(&engine).unwrap_err();
        assert!(err.to_string().contains("Circular dependency"));
    }

    #[test]
    fn test_calculated_field_needs_formula() {
        let engine = ExpressionEngine::default();
        let schema = FormSchema::new("f", 1).with_field(FieldDefinition::new("x", FieldType::Calculated));
        let err = schema.compile(&engine).unwrap_err();
        assert!(err.to_string().contains("field 'x': Calculated field has no formula"));
    }

    #[test]
    fn test_yaml_schema() {
        let schema = FormSchema::from_yaml_str(
            r#"
form_id: quote
version: 3
fields:
  - name: qty
    type: number
    default_value: 2
  - name: total
    field_type: calculated
    formula: "qty * external.rates.unit"
    conditions:
      - expression: "qty > 0"
        action: show
externalDataSources:
  rates:
    methodId: pricing.rates
    ttlSeconds: 60
"#,
        )
        .unwrap();
        assert_eq!(schema.key(), FormKey::new("quote", 3));
        assert_eq!(schema.fields[0].field_type, FieldType::Number);
        assert_eq!(schema.external_data_sources["rates"].ttl_secs, Some(60));

        let form = schema.compile(&ExpressionEngine::default()).unwrap();
        assert!(form.warnings().is_empty());
        assert_eq!(form.graph().dependencies("total"), vec!["qty"]);
    }

    #[test]
    fn test_external_reference_without_sources_warns() {
        let engine = ExpressionEngine::default();
        let form = FormSchema::new("f", 1)
            .with_field(FieldDefinition::calculated("x", "external.rate * 2"))
            .compile(&engine)
            .unwrap();
        assert!(form.warnings()[0].message.contains("no external sources"));
    }
}
