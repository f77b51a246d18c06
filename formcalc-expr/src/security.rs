//! Sandbox policy for formula text
//!
//! Formulas can only read context values and call registered functions, so
//! the policy rejects anything that looks like an attempt to reach outside
//! that: host-facing function names, prototype-style member access, template
//! or script injection markers, and oversized input.

use crate::error::Span;
use crate::functions::FunctionRegistry;
use crate::lexer::{SpannedToken, Token};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Call names that are never callable, even if a registry were to add them
pub const DENIED_FUNCTIONS: &[&str] = &[
    "ACTIVATOR", "ASSEMBLY", "CONSTRUCTOR", "DELETE", "DIRECTORY", "DYNAMIC", "ENVIRONMENT",
    "EVAL", "EXEC", "EXECUTE", "FETCH", "FILE", "FOR", "FOREACH", "FUNCTION", "GETTYPE", "GOTO",
    "HTTP", "IMPORT", "INVOKE", "LAMBDA", "LOAD", "LOOP", "MARSHAL", "NETWORK", "NEW", "OPEN",
    "PROCESS", "READ", "REFLECTION", "REGISTRY", "REQUIRE", "SHELL", "SLEEP", "SOCKET", "SPAWN",
    "SYSTEM", "TASK", "THREAD", "TYPEOF", "UNSAFE", "URL", "WHILE", "WRITE",
];

const DENIED_MEMBERS: &[&str] = &["constructor", "prototype"];

static INJECTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\$\{|\{\{|<%|%>|<\s*script|javascript\s*:|vbscript\s*:|data\s*:\s*text/html)")
        .expect("valid injection regex")
});

/// A construct rejected by the policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityIssue {
    pub span: Span,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    /// Maximum accepted source length in characters
    pub max_length: usize,
}

impl SecurityPolicy {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    /// Checks that need only the raw text
    pub fn scan_text(&self, source: &str) -> Vec<SecurityIssue> {
        let mut issues = Vec::new();

        let length = source.chars().count();
        if length > self.max_length {
            issues.push(SecurityIssue {
                span: Span::new(0, source.len()),
                message: format!(
                    "Expression is {} characters long, the limit is {}",
                    length, self.max_length
                ),
            });
        }

        for found in INJECTION_RE.find_iter(source) {
            issues.push(SecurityIssue {
                span: Span::new(found.start(), found.end()),
                message: format!("Injection marker '{}' is not allowed", found.as_str()),
            });
        }

        issues
    }

    /// Checks over the token stream: call names and member names
    pub fn scan_tokens(
        &self,
        tokens: &[SpannedToken],
        registry: &FunctionRegistry,
    ) -> Vec<SecurityIssue> {
        let mut issues = Vec::new();

        for (i, spanned) in tokens.iter().enumerate() {
            let next = tokens.get(i + 1).map(|t| &t.token);
            let prev = i.checked_sub(1).and_then(|p| tokens.get(p)).map(|t| &t.token);

            let member = match &spanned.token {
                Token::Identifier(name) => {
                    if next == Some(&Token::LParen) {
                        let upper = name.to_ascii_uppercase();
                        if DENIED_FUNCTIONS.contains(&upper.as_str()) {
                            issues.push(SecurityIssue {
                                span: spanned.span,
                                message: format!(
                                    "Function '{}' is not permitted in formulas",
                                    name
                                ),
                            });
                        } else if !registry.contains(&upper) {
                            issues.push(SecurityIssue {
                                span: spanned.span,
                                message: format!("Function '{}' is not on the allow-list", name),
                            });
                        }
                    }
                    (prev == Some(&Token::Dot)).then_some(name)
                }
                // `x['name']` reads the same member as `x.name`
                Token::Str(key) => {
                    let indexed =
                        prev == Some(&Token::LBracket) && next == Some(&Token::RBracket);
                    indexed.then_some(key)
                }
                _ => None,
            };

            if let Some(name) = member.filter(|name| is_denied_member(name)) {
                issues.push(SecurityIssue {
                    span: spanned.span,
                    message: format!("Member '{}' cannot be accessed", name),
                });
            }
        }

        issues
    }
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::new(4096)
    }
}

fn is_denied_member(name: &str) -> bool {
    name.starts_with("__") || DENIED_MEMBERS.contains(&name)
}
