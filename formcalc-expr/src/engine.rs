//! Expression engine facade
//!
//! Ties together the security policy, the parser, the static call checker,
//! the parse cache and the interpreter. Every failure on the evaluation path
//! is folded into a failed [`EvaluationResult`]; nothing is raised to the
//! caller.

use crate::ast::{supported_operators, Analysis, BinOp, Expr, OperatorInfo};
use crate::conditional::ConditionalLogic;
use crate::context::{EvaluationContext, EvaluationResult};
use crate::error::{ExprError, Result};
use crate::functions::{FunctionRegistry, FunctionSignature};
use crate::interpreter::Interpreter;
use crate::lexer::tokenize;
use crate::parser::{ParseLimits, Parser};
use crate::security::{SecurityIssue, SecurityPolicy};
use crate::validation::{Diagnostic, ValidationResult};
use formcalc_types::Value;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tunable limits of the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineLimits {
    /// Default wall-clock budget per evaluation
    pub time_budget: Duration,
    pub max_expression_length: usize,
    pub max_depth: usize,
    /// Maximum syntax tree nodes, the complexity limit
    pub max_nodes: usize,
    pub max_steps: u64,
    pub parse_cache_capacity: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            time_budget: Duration::from_secs(5),
            max_expression_length: 4096,
            max_depth: 64,
            max_nodes: 1000,
            max_steps: 100_000,
            parse_cache_capacity: 512,
        }
    }
}

/// Engine-owned compiled form of one expression text
#[derive(Debug)]
struct ParsedExpression {
    ast: Expr,
    analysis: Analysis,
}

/// Parse cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParseCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub capacity: usize,
}

impl ParseCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Parses, validates and evaluates formulas
pub struct ExpressionEngine {
    limits: EngineLimits,
    registry: FunctionRegistry,
    policy: SecurityPolicy,
    cache: Mutex<LruCache<String, Arc<ParsedExpression>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl ExpressionEngine {
    pub fn new(limits: EngineLimits) -> Self {
        let capacity = NonZeroUsize::new(limits.parse_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            policy: SecurityPolicy::new(limits.max_expression_length),
            registry: FunctionRegistry::builtin(),
            cache: Mutex::new(LruCache::new(capacity)),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            limits,
        }
    }

    pub fn limits(&self) -> &EngineLimits {
        &self.limits
    }

    fn parse_limits(&self) -> ParseLimits {
        ParseLimits {
            max_depth: self.limits.max_depth,
            max_nodes: self.limits.max_nodes,
        }
    }

    /// Parse through the cache
    fn parse(&self, source: &str) -> Result<(Arc<ParsedExpression>, bool)> {
        if let Some(parsed) = self.cache.lock().get(source) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok((Arc::clone(parsed), true));
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let parsed = Arc::new(self.compile(source)?);
        tracing::debug!(
            expression = source,
            nodes = parsed.analysis.node_count,
            "compiled expression"
        );
        self.cache
            .lock()
            .put(source.to_string(), Arc::clone(&parsed));
        Ok((parsed, false))
    }

    /// Security policy, parse and static call checks, first error wins
    fn compile(&self, source: &str) -> Result<ParsedExpression> {
        if let Some(issue) = self.policy.scan_text(source).into_iter().next() {
            return Err(security_error(issue));
        }
        let tokens = tokenize(source)?;
        if let Some(issue) = self
            .policy
            .scan_tokens(&tokens, &self.registry)
            .into_iter()
            .next()
        {
            return Err(security_error(issue));
        }
        let ast = Parser::new(&tokens, self.parse_limits()).parse()?;
        if let Some(error) = self.check_calls(&ast).into_iter().next() {
            return Err(error);
        }
        let analysis = Analysis::of(&ast);
        Ok(ParsedExpression { ast, analysis })
    }

    fn check_calls(&self, ast: &Expr) -> Vec<ExprError> {
        let mut errors = Vec::new();
        ast.walk(&mut |node| {
            let Expr::Call {
                function,
                args,
                span,
            } = node
            else {
                return;
            };
            match self.registry.get(function) {
                None => errors.push(ExprError::UnknownFunction {
                    span: *span,
                    name: function.clone(),
                }),
                Some(def) if !def.signature.accepts(args.len()) => {
                    errors.push(ExprError::ArityMismatch {
                        span: *span,
                        function: def.signature.name.to_string(),
                        expected: def.signature.arity(),
                        got: args.len(),
                    })
                }
                Some(_) => {}
            }
        });
        errors
    }

    /// Evaluate an expression against a context
    ///
    /// The budget is `ctx.time_budget` or the engine default.
    pub fn evaluate(&self, source: &str, ctx: &EvaluationContext) -> EvaluationResult {
        let started = Instant::now();
        let budget = ctx.time_budget.unwrap_or(self.limits.time_budget);

        let (parsed, cache_hit) = match self.parse(source) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::debug!(expression = source, error = %err, "expression rejected");
                return EvaluationResult::failure(&err, started.elapsed());
            }
        };

        let mut interpreter =
            Interpreter::new(ctx, &self.registry, budget, self.limits.max_steps);
        let outcome = interpreter.eval(&parsed.ast);
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(value) => EvaluationResult::success(value, elapsed),
            Err(err) => {
                tracing::debug!(expression = source, error = %err, "evaluation failed");
                EvaluationResult::failure(&err, elapsed)
            }
        };

        if ctx.debug {
            result
                .with_metadata("steps", interpreter.steps())
                .with_metadata("cache", if cache_hit { "hit" } else { "miss" })
                .with_metadata("nodes", parsed.analysis.node_count)
        } else {
            result
        }
    }

    /// Evaluate a condition, failing closed
    ///
    /// Disabled conditions, failed evaluations and non-boolean results all
    /// yield `false`.
    pub fn evaluate_conditional(&self, logic: &ConditionalLogic, ctx: &EvaluationContext) -> bool {
        if !logic.enabled {
            return false;
        }
        let result = self.evaluate(&logic.expression, ctx);
        match (&result.value, result.success) {
            (Value::Bool(b), true) => *b,
            (value, true) => {
                tracing::warn!(
                    expression = %logic.expression,
                    value_type = %value.value_type(),
                    "condition did not produce a boolean, treating as false"
                );
                false
            }
            (_, false) => {
                tracing::warn!(
                    expression = %logic.expression,
                    error = result.error.as_deref().unwrap_or_default(),
                    "condition failed, treating as false"
                );
                false
            }
        }
    }

    /// Static check without evaluation
    pub fn validate_expression(&self, source: &str) -> ValidationResult {
        self.validate(source, None)
    }

    /// Static check that also rejects variables outside `known`
    pub fn validate_with_variables(
        &self,
        source: &str,
        known: &BTreeSet<String>,
    ) -> ValidationResult {
        self.validate(source, Some(known))
    }

    fn validate(&self, source: &str, known: Option<&BTreeSet<String>>) -> ValidationResult {
        let mut report = ValidationResult {
            deterministic: true,
            ..ValidationResult::default()
        };

        if source.trim().is_empty() {
            report
                .errors
                .push(Diagnostic::new("Expression cannot be empty", None));
            return report.finish();
        }

        report.security_issues = self.policy.scan_text(source);
        let tokens = match tokenize(source) {
            Ok(tokens) => tokens,
            Err(err) => {
                report.errors.push(Diagnostic::from(&err));
                return report.finish();
            }
        };
        report
            .security_issues
            .extend(self.policy.scan_tokens(&tokens, &self.registry));

        let ast = match Parser::new(&tokens, self.parse_limits()).parse() {
            Ok(ast) => ast,
            Err(err) => {
                report.errors.push(Diagnostic::from(&err));
                return report.finish();
            }
        };

        for error in self.check_calls(&ast) {
            // Unknown calls are already reported by the allow-list
            if !matches!(error, ExprError::UnknownFunction { .. }) {
                report.errors.push(Diagnostic::from(&error));
            }
        }

        let analysis = Analysis::of(&ast);
        if let Some(known) = known {
            for name in analysis.variables.iter().filter(|v| !known.contains(*v)) {
                report
                    .errors
                    .push(Diagnostic::new(format!("Unknown variable '{}'", name), None));
            }
        }

        self.warnings(&ast, &analysis, source, &mut report);

        report.variables = analysis.variables.iter().cloned().collect();
        report.functions = analysis.functions.iter().cloned().collect();
        report.complexity = analysis.complexity(source.len());
        report.finish()
    }

    fn warnings(
        &self,
        ast: &Expr,
        analysis: &Analysis,
        source: &str,
        report: &mut ValidationResult,
    ) {
        for name in &analysis.functions {
            let deterministic = self
                .registry
                .get(name)
                .map_or(true, |def| def.signature.deterministic);
            if !deterministic {
                report.deterministic = false;
                report.warnings.push(Diagnostic::new(
                    format!("{}() depends on the evaluation timestamp", name),
                    None,
                ));
            }
        }

        ast.walk(&mut |node| {
            let divisor = match node {
                Expr::Binary {
                    op: BinOp::Div | BinOp::Mod,
                    rhs,
                    ..
                } => Some(rhs.as_ref()),
                Expr::Call { function, args, .. } if function == "DIVIDE" => args.get(1),
                _ => None,
            };
            if let Some(Expr::Literal {
                value: Value::Number(n),
                span,
            }) = divisor
            {
                if n.is_zero() {
                    report
                        .warnings
                        .push(Diagnostic::new("Division by a literal zero", Some(*span)));
                }
            }
        });

        if analysis.depth * 4 > self.limits.max_depth * 3 {
            report.warnings.push(Diagnostic::new(
                format!(
                    "Expression nesting depth {} is close to the limit of {}",
                    analysis.depth, self.limits.max_depth
                ),
                None,
            ));
        }

        let complexity = analysis.complexity(source.len());
        if complexity >= 50 {
            report.warnings.push(Diagnostic::new(
                format!("Expression complexity score is {}", complexity),
                None,
            ));
        }
    }

    /// Cheap pre-filter: policy checks over the raw text and tokens only
    pub fn is_safe_expression(&self, source: &str) -> bool {
        if source.trim().is_empty() || !self.policy.scan_text(source).is_empty() {
            return false;
        }
        match tokenize(source) {
            Ok(tokens) => self.policy.scan_tokens(&tokens, &self.registry).is_empty(),
            Err(_) => false,
        }
    }

    /// Root variable names an expression reads
    pub fn references(&self, source: &str) -> Result<BTreeSet<String>> {
        Ok(self.parse(source)?.0.analysis.variables.clone())
    }

    /// Static facts about an expression
    pub fn analyze(&self, source: &str) -> Result<Analysis> {
        Ok(self.parse(source)?.0.analysis.clone())
    }

    pub fn available_functions(&self) -> Vec<FunctionSignature> {
        self.registry.signatures()
    }

    pub fn supported_operators(&self) -> Vec<OperatorInfo> {
        supported_operators()
    }

    pub fn cache_stats(&self) -> ParseCacheStats {
        let cache = self.cache.lock();
        ParseCacheStats {
            hits: self.cache_hits.load(Ordering::Relaxed),
            misses: self.cache_misses.load(Ordering::Relaxed),
            entries: cache.len(),
            capacity: cache.cap().get(),
        }
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
    }
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        Self::new(EngineLimits::default())
    }
}

fn security_error(issue: SecurityIssue) -> ExprError {
    ExprError::SecurityViolation {
        span: issue.span,
        message: issue.message,
    }
}
