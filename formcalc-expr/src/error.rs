use serde::Serialize;
use std::fmt;

pub use formcalc_types::Span;

/// Errors that can occur while parsing, checking or evaluating a formula
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("Syntax error at position {}: {message}", .span.start)]
    LexerError { span: Span, message: String },

    #[error("Syntax error at position {}: {message}", .span.start)]
    ParserError { span: Span, message: String },

    #[error("Security violation: {message}")]
    SecurityViolation { span: Span, message: String },

    #[error("Unresolved variable '{name}'")]
    UnboundVariable { span: Span, name: String },

    #[error("Type error: {message}")]
    TypeError { span: Span, message: String },

    #[error("Division by zero")]
    DivisionByZero { span: Span },

    #[error("Unknown function '{name}'")]
    UnknownFunction { span: Span, name: String },

    #[error("{function} expects {expected} argument(s), got {got}")]
    ArityMismatch {
        span: Span,
        function: String,
        expected: String,
        got: usize,
    },

    #[error("{function}: {message}")]
    FunctionError {
        span: Span,
        function: String,
        message: String,
    },

    #[error("Limit exceeded: {message}")]
    LimitExceeded { span: Span, message: String },

    #[error("Evaluation exceeded its time budget of {budget_ms}ms")]
    Timeout { budget_ms: u64 },

    #[error("Evaluation was cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ExprError>;

/// Coarse classification carried on failed evaluation results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Syntax,
    Security,
    UnresolvedVariable,
    Type,
    DivisionByZero,
    Function,
    Limit,
    Timeout,
    Cancelled,
}

impl ExprError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExprError::LexerError { .. } | ExprError::ParserError { .. } => ErrorKind::Syntax,
            ExprError::SecurityViolation { .. } => ErrorKind::Security,
            ExprError::UnboundVariable { .. } => ErrorKind::UnresolvedVariable,
            ExprError::TypeError { .. } => ErrorKind::Type,
            ExprError::DivisionByZero { .. } => ErrorKind::DivisionByZero,
            ExprError::UnknownFunction { .. }
            | ExprError::ArityMismatch { .. }
            | ExprError::FunctionError { .. } => ErrorKind::Function,
            ExprError::LimitExceeded { .. } => ErrorKind::Limit,
            ExprError::Timeout { .. } => ErrorKind::Timeout,
            ExprError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Source location, when the error points at specific text
    pub fn span(&self) -> Option<Span> {
        match self {
            ExprError::LexerError { span, .. }
            | ExprError::ParserError { span, .. }
            | ExprError::SecurityViolation { span, .. }
            | ExprError::UnboundVariable { span, .. }
            | ExprError::TypeError { span, .. }
            | ExprError::DivisionByZero { span }
            | ExprError::UnknownFunction { span, .. }
            | ExprError::ArityMismatch { span, .. }
            | ExprError::FunctionError { span, .. }
            | ExprError::LimitExceeded { span, .. } => Some(*span),
            ExprError::Timeout { .. } | ExprError::Cancelled => None,
        }
    }

    pub(crate) fn type_error(span: Span, message: impl Into<String>) -> Self {
        ExprError::TypeError {
            span,
            message: message.into(),
        }
    }
}

/// Display context for better error messages
pub struct ErrorContext<'a> {
    pub source: &'a str,
    pub error: &'a ExprError,
}

impl<'a> ErrorContext<'a> {
    pub fn new(source: &'a str, error: &'a ExprError) -> Self {
        Self { source, error }
    }

    /// Get the source line containing the error
    pub fn source_line(&self) -> Option<&'a str> {
        let start = self.start()?;

        let line_start = self.source[..start]
            .rfind('\n')
            .map(|pos| pos + 1)
            .unwrap_or(0);
        let line_end = self.source[start..]
            .find('\n')
            .map(|pos| start + pos)
            .unwrap_or(self.source.len());

        Some(&self.source[line_start..line_end])
    }

    /// Get line and column numbers (1-indexed)
    pub fn line_col(&self) -> Option<(usize, usize)> {
        let start = self.start()?;

        let line = self.source[..start].matches('\n').count() + 1;
        let line_start = self.source[..start]
            .rfind('\n')
            .map(|pos| pos + 1)
            .unwrap_or(0);

        Some((line, start - line_start + 1))
    }

    fn start(&self) -> Option<usize> {
        let start = self.error.span()?.start;
        (start <= self.source.len() && self.source.is_char_boundary(start)).then_some(start)
    }
}

impl<'a> fmt::Display for ErrorContext<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (Some((line, col)), Some(source_line), Some(span)) =
            (self.line_col(), self.source_line(), self.error.span())
        else {
            return writeln!(f, "{}", self.error);
        };

        writeln!(f, "Error at line {}, column {}:", line, col)?;
        writeln!(f, "  {}", self.error)?;
        writeln!(f)?;
        writeln!(f, "  {}", source_line)?;
        let col_start = col - 1;
        let width = span.len().min(source_line.len().saturating_sub(col_start)).max(1);
        writeln!(f, "  {}{}", " ".repeat(col_start), "^".repeat(width))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_context_points_at_span() {
        let source = "qty * )";
        let error = ExprError::ParserError {
            span: Span::new(6, 7),
            message: "Unexpected ')'".to_string(),
        };
        let rendered = ErrorContext::new(source, &error).to_string();
        insta::assert_snapshot!(rendered, @r"
        Error at line 1, column 7:
          Syntax error at position 6: Unexpected ')'

          qty * )
                ^
        ");
    }

    #[test]
    fn test_error_context_without_span() {
        let error = ExprError::Timeout { budget_ms: 5 };
        let rendered = ErrorContext::new("a + b", &error).to_string();
        assert_eq!(rendered, "Evaluation exceeded its time budget of 5ms\n");
    }

    #[test]
    fn test_error_kinds() {
        let error = ExprError::UnboundVariable {
            span: Span::new(0, 3),
            name: "foo".to_string(),
        };
        assert_eq!(error.kind(), ErrorKind::UnresolvedVariable);
        assert_eq!(error.to_string(), "Unresolved variable 'foo'");
        assert_eq!(ExprError::Cancelled.span(), None);
    }
}
