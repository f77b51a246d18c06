//! Sandboxed formula language
//!
//! Formulas are parsed into an [`Expr`] tree after passing the
//! [`SecurityPolicy`], then evaluated over exact decimals by a tree-walking
//! interpreter with a step limit, a wall-clock budget and cooperative
//! cancellation. Only functions in the [`FunctionRegistry`] are callable.
//!
//! # Example
//!
//! ```
//! use formcalc_expr::{EvaluationContext, ExpressionEngine};
//!
//! let engine = ExpressionEngine::default();
//! let ctx = EvaluationContext::new().with_field("qty", 3);
//! let result = engine.evaluate("qty * 2", &ctx);
//! assert!(result.success);
//! ```

pub mod ast;
pub mod conditional;
pub mod context;
pub mod engine;
pub mod error;
pub mod functions;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod security;
pub mod validation;

pub use ast::{supported_operators, Analysis, BinOp, Expr, OperatorCategory, OperatorInfo, UnOp};
pub use conditional::{ConditionalAction, ConditionalLogic};
pub use context::{EvaluationContext, EvaluationResult, EXTERNAL_ROOT};
pub use engine::{EngineLimits, ExpressionEngine, ParseCacheStats};
pub use error::{ErrorContext, ErrorKind, ExprError, Result, Span};
pub use functions::{FunctionCategory, FunctionRegistry, FunctionSignature, Param, ParamKind};
pub use parser::{parse, ParseLimits};
pub use security::{SecurityIssue, SecurityPolicy};
pub use validation::{Diagnostic, ValidationResult};
