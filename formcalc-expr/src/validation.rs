//! Design-time validation reports

use crate::error::{ExprError, Span};
use crate::security::SecurityIssue;
use serde::Serialize;

/// One validation finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<Span>,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>, span: Option<Span>) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

impl From<&ExprError> for Diagnostic {
    fn from(error: &ExprError) -> Self {
        Diagnostic::new(error.to_string(), error.span())
    }
}

/// Result of statically checking an expression without running it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    pub security_issues: Vec<SecurityIssue>,
    /// Root variables the expression reads
    pub variables: Vec<String>,
    /// Functions the expression calls
    pub functions: Vec<String>,
    pub complexity: u32,
    /// False when the result depends on the evaluation timestamp
    pub deterministic: bool,
}

impl ValidationResult {
    pub(crate) fn finish(mut self) -> Self {
        self.is_valid = self.errors.is_empty() && self.security_issues.is_empty();
        self
    }

    /// All errors and security issues as one message per line
    pub fn summary(&self) -> String {
        self.security_issues
            .iter()
            .map(|issue| format!("security: {}", issue.message))
            .chain(self.errors.iter().map(|d| format!("error: {}", d.message)))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
