//! Restricted syntax tree for formulas
//!
//! The tree has no statements, bindings or loops: every node is a pure
//! expression over literals, variable paths, operators and registered
//! function calls.

use crate::error::Span;
use formcalc_types::Value;
use serde::Serialize;
use std::collections::BTreeSet;

/// Operator precedence table (higher number = tighter binding)
/// Precedence levels from lowest to highest:
/// 1. || (logical OR)
/// 2. && (logical AND)
/// 3. ==, != (equality)
/// 4. <, <=, >, >= (comparison)
/// 5. +, - (additive, string concat)
/// 6. *, /, % (multiplicative)
pub const PRECEDENCE: &[(&[BinOp], u8)] = &[
    (&[BinOp::Or], 1),
    (&[BinOp::And], 2),
    (&[BinOp::Eq, BinOp::Ne], 3),
    (&[BinOp::Lt, BinOp::Le, BinOp::Gt, BinOp::Ge], 4),
    (&[BinOp::Add, BinOp::Sub], 5),
    (&[BinOp::Mul, BinOp::Div, BinOp::Mod], 6),
];

/// Binding power of prefix operators, above every binary level
pub const UNARY_PRECEDENCE: u8 = 7;

/// Binary operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub const ALL: [BinOp; 13] = [
        BinOp::Add,
        BinOp::Sub,
        BinOp::Mul,
        BinOp::Div,
        BinOp::Mod,
        BinOp::Eq,
        BinOp::Ne,
        BinOp::Lt,
        BinOp::Le,
        BinOp::Gt,
        BinOp::Ge,
        BinOp::And,
        BinOp::Or,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }

    pub fn precedence(self) -> u8 {
        PRECEDENCE
            .iter()
            .find(|(ops, _)| ops.contains(&self))
            .map(|(_, prec)| *prec)
            .unwrap_or(0)
    }

    pub fn category(self) -> OperatorCategory {
        match self {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                OperatorCategory::Arithmetic
            }
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                OperatorCategory::Comparison
            }
            BinOp::And | BinOp::Or => OperatorCategory::Logical,
        }
    }

    fn description(self) -> &'static str {
        match self {
            BinOp::Add => "Addition, or concatenation of two strings",
            BinOp::Sub => "Subtraction",
            BinOp::Mul => "Multiplication",
            BinOp::Div => "Decimal division",
            BinOp::Mod => "Remainder",
            BinOp::Eq => "Equal to",
            BinOp::Ne => "Not equal to",
            BinOp::Lt => "Less than",
            BinOp::Le => "Less than or equal to",
            BinOp::Gt => "Greater than",
            BinOp::Ge => "Greater than or equal to",
            BinOp::And => "Logical AND (short-circuit, boolean operands)",
            BinOp::Or => "Logical OR (short-circuit, boolean operands)",
        }
    }
}

/// Unary operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Neg,
    Not,
}

impl UnOp {
    pub const ALL: [UnOp; 2] = [UnOp::Neg, UnOp::Not];

    pub fn symbol(self) -> &'static str {
        match self {
            UnOp::Neg => "-",
            UnOp::Not => "!",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorCategory {
    Arithmetic,
    Comparison,
    Logical,
}

/// Introspection entry for one operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperatorInfo {
    pub symbol: &'static str,
    pub category: OperatorCategory,
    pub unary: bool,
    pub precedence: u8,
    pub description: &'static str,
}

/// Every operator the parser accepts, derived from the operator enums
pub fn supported_operators() -> Vec<OperatorInfo> {
    let mut ops: Vec<OperatorInfo> = BinOp::ALL
        .iter()
        .map(|op| OperatorInfo {
            symbol: op.symbol(),
            category: op.category(),
            unary: false,
            precedence: op.precedence(),
            description: op.description(),
        })
        .collect();

    ops.extend(UnOp::ALL.iter().map(|op| OperatorInfo {
        symbol: op.symbol(),
        category: match op {
            UnOp::Neg => OperatorCategory::Arithmetic,
            UnOp::Not => OperatorCategory::Logical,
        },
        unary: true,
        precedence: UNARY_PRECEDENCE,
        description: match op {
            UnOp::Neg => "Numeric negation",
            UnOp::Not => "Logical NOT (boolean operand)",
        },
    }));

    ops
}

/// Formula expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal {
        value: Value,
        span: Span,
    },
    /// Root variable reference, resolved against the evaluation context
    Variable {
        name: String,
        span: Span,
    },
    /// `object.field`
    Member {
        object: Box<Expr>,
        field: String,
        span: Span,
    },
    /// `object[index]`
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        span: Span,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
        span: Span,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        span: Span,
    },
    /// Call to a registered function; the name is stored upper-cased
    Call {
        function: String,
        args: Vec<Expr>,
        span: Span,
    },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Literal { span, .. }
            | Expr::Variable { span, .. }
            | Expr::Member { span, .. }
            | Expr::Index { span, .. }
            | Expr::Unary { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Call { span, .. } => *span,
        }
    }

    /// Direct children in evaluation order
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Literal { .. } | Expr::Variable { .. } => Vec::new(),
            Expr::Member { object, .. } => vec![object],
            Expr::Index { object, index, .. } => vec![object, index],
            Expr::Unary { operand, .. } => vec![operand],
            Expr::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Expr::Call { args, .. } => args.iter().collect(),
        }
    }

    /// Pre-order traversal
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Expr)) {
        let mut stack = vec![self];
        while let Some(expr) = stack.pop() {
            visit(expr);
            stack.extend(expr.children().into_iter().rev());
        }
    }
}

/// Facts gathered from a parsed formula without evaluating it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Analysis {
    /// Root variable names, in sorted order
    pub variables: BTreeSet<String>,
    /// Upper-cased function names
    pub functions: BTreeSet<String>,
    pub node_count: usize,
    pub depth: usize,
}

impl Analysis {
    pub fn of(expr: &Expr) -> Self {
        let mut analysis = Analysis::default();
        expr.walk(&mut |node| {
            analysis.node_count += 1;
            match node {
                Expr::Variable { name, .. } => {
                    analysis.variables.insert(name.clone());
                }
                Expr::Call { function, .. } => {
                    analysis.functions.insert(function.clone());
                }
                _ => {}
            }
        });
        analysis.depth = depth(expr);
        analysis
    }

    /// Score in 0..=100 weighing size, calls, references and nesting
    pub fn complexity(&self, source_len: usize) -> u32 {
        let length = (source_len / 10).min(20) as u32;
        let score = length
            + 5 * self.functions.len() as u32
            + 2 * self.variables.len() as u32
            + 3 * self.depth as u32;
        score.min(100)
    }
}

fn depth(expr: &Expr) -> usize {
    let mut max = 0;
    let mut stack = vec![(expr, 1usize)];
    while let Some((node, level)) = stack.pop() {
        max = max.max(level);
        for child in node.children() {
            stack.push((child, level + 1));
        }
    }
    max
}
