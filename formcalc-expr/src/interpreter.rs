//! Tree-walking evaluator with a step budget, a wall-clock budget and
//! cooperative cancellation.

use crate::ast::{BinOp, Expr, UnOp};
use crate::context::EvaluationContext;
use crate::error::{ExprError, Result, Span};
use crate::functions::{
    checked_add, checked_div, checked_mul, checked_rem, checked_sub, CallContext, CallError,
    Evaluation, FunctionRegistry,
};
use formcalc_types::Value;
use rust_decimal::prelude::ToPrimitive;
use std::time::{Duration, Instant};

pub struct Interpreter<'a> {
    ctx: &'a EvaluationContext,
    registry: &'a FunctionRegistry,
    call_ctx: CallContext,
    started: Instant,
    budget: Duration,
    max_steps: u64,
    steps: u64,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        ctx: &'a EvaluationContext,
        registry: &'a FunctionRegistry,
        budget: Duration,
        max_steps: u64,
    ) -> Self {
        Self {
            ctx,
            registry,
            call_ctx: CallContext { now: ctx.now },
            started: Instant::now(),
            budget,
            max_steps,
            steps: 0,
        }
    }

    /// Steps executed so far
    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn tick(&mut self, span: Span) -> Result<()> {
        self.steps += 1;
        if self.steps > self.max_steps {
            return Err(ExprError::LimitExceeded {
                span,
                message: format!("Evaluation exceeded {} steps", self.max_steps),
            });
        }
        if self.ctx.is_cancelled() {
            return Err(ExprError::Cancelled);
        }
        if self.started.elapsed() >= self.budget {
            return Err(ExprError::Timeout {
                budget_ms: self.budget.as_millis() as u64,
            });
        }
        Ok(())
    }

    pub fn eval(&mut self, expr: &Expr) -> Result<Value> {
        self.tick(expr.span())?;

        match expr {
            Expr::Literal { value, .. } => Ok(value.clone()),

            Expr::Variable { name, span } => self
                .ctx
                .lookup(name)
                .map(|v| v.into_owned())
                .ok_or_else(|| ExprError::UnboundVariable {
                    span: *span,
                    name: name.clone(),
                }),

            Expr::Member {
                object,
                field,
                span,
            } => {
                let target = self.eval(object)?;
                match target {
                    Value::Object(mut map) => {
                        map.remove(field).ok_or_else(|| ExprError::UnboundVariable {
                            span: *span,
                            name: path_name(expr),
                        })
                    }
                    other => Err(ExprError::type_error(
                        *span,
                        format!(
                            "cannot read member '{}' of {} value '{}'",
                            field,
                            other.value_type(),
                            path_name(object)
                        ),
                    )),
                }
            }

            Expr::Index {
                object,
                index,
                span,
            } => {
                let target = self.eval(object)?;
                let key = self.eval(index)?;
                self.index(target, key, expr, *span)
            }

            Expr::Unary { op, operand, span } => {
                let value = self.eval(operand)?;
                match (op, value) {
                    (UnOp::Neg, Value::Number(n)) => Ok(Value::Number(-n)),
                    (UnOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                    (op, other) => Err(ExprError::type_error(
                        *span,
                        format!(
                            "operator '{}' cannot be applied to {}",
                            op.symbol(),
                            other.value_type()
                        ),
                    )),
                }
            }

            Expr::Binary { op, lhs, rhs, span } => match op {
                BinOp::And | BinOp::Or => self.eval_logical(*op, lhs, rhs),
                _ => {
                    let left = self.eval(lhs)?;
                    let right = self.eval(rhs)?;
                    eval_binop(*op, left, right, *span)
                }
            },

            Expr::Call {
                function,
                args,
                span,
            } => self.eval_call(function, args, *span),
        }
    }

    fn index(&self, target: Value, key: Value, expr: &Expr, span: Span) -> Result<Value> {
        match (target, key) {
            (Value::Array(mut items), Value::Number(n)) => {
                let position = n
                    .fract()
                    .is_zero()
                    .then(|| n.to_usize())
                    .flatten()
                    .ok_or_else(|| {
                        ExprError::type_error(span, format!("index {} is not a valid position", n))
                    })?;
                if position < items.len() {
                    Ok(items.swap_remove(position))
                } else {
                    Err(ExprError::UnboundVariable {
                        span,
                        name: path_name(expr),
                    })
                }
            }
            (Value::Object(mut map), Value::String(key)) => {
                map.remove(&key).ok_or_else(|| ExprError::UnboundVariable {
                    span,
                    name: path_name(expr),
                })
            }
            (target, key) => Err(ExprError::type_error(
                span,
                format!(
                    "cannot index {} with {}",
                    target.value_type(),
                    key.value_type()
                ),
            )),
        }
    }

    fn eval_logical(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<Value> {
        let left = self.eval_bool(lhs, op.symbol())?;
        let short_circuit = match op {
            BinOp::And => !left,
            _ => left,
        };
        if short_circuit {
            return Ok(Value::Bool(left));
        }
        Ok(Value::Bool(self.eval_bool(rhs, op.symbol())?))
    }

    fn eval_bool(&mut self, expr: &Expr, context: &str) -> Result<bool> {
        match self.eval(expr)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExprError::type_error(
                expr.span(),
                format!("'{}' expects boolean operands, found {}", context, other.value_type()),
            )),
        }
    }

    fn eval_call(&mut self, name: &str, args: &[Expr], span: Span) -> Result<Value> {
        let registry = self.registry;
        let def = registry.get(name).ok_or_else(|| ExprError::UnknownFunction {
            span,
            name: name.to_string(),
        })?;

        if !def.signature.accepts(args.len()) {
            return Err(ExprError::ArityMismatch {
                span,
                function: def.signature.name.to_string(),
                expected: def.signature.arity(),
                got: args.len(),
            });
        }

        match def.evaluation {
            Evaluation::Lazy => self.eval_if(args),
            Evaluation::Eager(native) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                native(&self.call_ctx, &values)
                    .map_err(|err| call_error(def.signature.name, err, span))
            }
        }
    }

    fn eval_if(&mut self, args: &[Expr]) -> Result<Value> {
        if self.eval_bool(&args[0], "IF")? {
            self.eval(&args[1])
        } else if let Some(otherwise) = args.get(2) {
            self.eval(otherwise)
        } else {
            Ok(Value::Null)
        }
    }
}

fn call_error(function: &str, err: CallError, span: Span) -> ExprError {
    match err {
        CallError::DivisionByZero => ExprError::DivisionByZero { span },
        CallError::Overflow => ExprError::LimitExceeded {
            span,
            message: format!("numeric overflow in {}", function),
        },
        CallError::Type(message) => {
            ExprError::type_error(span, format!("{}: {}", function, message))
        }
        CallError::Invalid(message) => ExprError::FunctionError {
            span,
            function: function.to_string(),
            message,
        },
    }
}

fn eval_binop(op: BinOp, lhs: Value, rhs: Value, span: Span) -> Result<Value> {
    match op {
        BinOp::Eq => return Ok(Value::Bool(lhs.loose_eq(&rhs))),
        BinOp::Ne => return Ok(Value::Bool(!lhs.loose_eq(&rhs))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = lhs.compare(&rhs).ok_or_else(|| {
                ExprError::type_error(
                    span,
                    format!(
                        "cannot compare {} with {} using '{}'",
                        lhs.value_type(),
                        rhs.value_type(),
                        op.symbol()
                    ),
                )
            })?;
            let result = match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            return Ok(Value::Bool(result));
        }
        _ => {}
    }

    match (op, lhs, rhs) {
        (BinOp::Add, Value::String(a), Value::String(b)) => Ok(Value::String(a + &b)),
        (op, Value::Number(a), Value::Number(b)) => {
            let result = match op {
                BinOp::Add => checked_add(a, b),
                BinOp::Sub => checked_sub(a, b),
                BinOp::Mul => checked_mul(a, b),
                BinOp::Div => checked_div(a, b),
                _ => checked_rem(a, b),
            };
            result
                .map(Value::Number)
                .map_err(|err| call_error(op.symbol(), err, span))
        }
        (op, lhs, rhs) => Err(ExprError::type_error(
            span,
            format!(
                "operator '{}' cannot be applied to {} and {}",
                op.symbol(),
                lhs.value_type(),
                rhs.value_type()
            ),
        )),
    }
}

/// Dotted rendering of a variable path, used in unresolved-variable messages
fn path_name(expr: &Expr) -> String {
    match expr {
        Expr::Variable { name, .. } => name.clone(),
        Expr::Member { object, field, .. } => format!("{}.{}", path_name(object), field),
        Expr::Index { object, index, .. } => {
            let key = match index.as_ref() {
                Expr::Literal {
                    value: Value::String(s),
                    ..
                } => format!("'{}'", s),
                Expr::Literal { value, .. } => value.to_string(),
                _ => "..".to_string(),
            };
            format!("{}[{}]", path_name(object), key)
        }
        _ => "(expression)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse, ParseLimits};
    use formcalc_types::Decimal;

    fn run(source: &str, ctx: &EvaluationContext) -> Result<Value> {
        let expr = parse(source, ParseLimits::default()).unwrap();
        let registry = FunctionRegistry::builtin();
        Interpreter::new(ctx, &registry, Duration::from_secs(5), 10_000).eval(&expr)
    }

    fn dec(text: &str) -> Value {
        Value::Number(text.parse::<Decimal>().unwrap())
    }

    fn order_ctx() -> EvaluationContext {
        let order: Value = serde_json::from_str(
            r#"{"customer": {"name": "Ada", "tier": "gold"},
                "items": [{"price": 9.99, "qty": 3}, {"price": 0.01, "qty": 1}]}"#,
        )
        .unwrap();
        let mut ctx = EvaluationContext::new().with_field("qty", 3).with_field("price", dec("9.99"));
        ctx.form_data.insert("order".to_string(), order);
        ctx
    }

    #[test]
    fn test_decimal_arithmetic() {
        let ctx = order_ctx();
        assert_eq!(run("qty * price", &ctx).unwrap(), dec("29.97"));
        assert_eq!(run("0.1 + 0.2 == 0.3", &ctx).unwrap(), Value::Bool(true));
        assert_eq!(run("10 % 4", &ctx).unwrap(), dec("2"));
        assert_eq!(run("-price", &ctx).unwrap(), dec("-9.99"));
    }

    #[test]
    fn test_paths() {
        let ctx = order_ctx();
        assert_eq!(run("order.customer.name", &ctx).unwrap(), Value::from("Ada"));
        assert_eq!(run("order.items[1].price", &ctx).unwrap(), dec("0.01"));
        assert_eq!(run("order['customer']['tier']", &ctx).unwrap(), Value::from("gold"));
        assert_eq!(
            run("order.items[0].price * order.items[0].qty", &ctx).unwrap(),
            dec("29.97")
        );
    }

    #[test]
    fn test_missing_paths_fail_closed() {
        let ctx = order_ctx();
        let err = run("order.customer.email", &ctx).unwrap_err();
        assert_eq!(
            err,
            ExprError::UnboundVariable {
                span: Span::new(0, 20),
                name: "order.customer.email".to_string()
            }
        );

        let err = run("order.items[5].price", &ctx).unwrap_err();
        assert!(matches!(err, ExprError::UnboundVariable { name, .. } if name == "order.items[5]"));

        let err = run("unknownVar + 1", &ctx).unwrap_err();
        assert_eq!(err.to_string(), "Unresolved variable 'unknownVar'");
    }

    #[test]
    fn test_type_errors() {
        let ctx = order_ctx();
        assert!(matches!(run("'a' * 2", &ctx), Err(ExprError::TypeError { .. })));
        assert!(matches!(run("qty && true", &ctx), Err(ExprError::TypeError { .. })));
        assert!(matches!(run("qty < 'x'", &ctx), Err(ExprError::TypeError { .. })));
        assert!(matches!(run("!qty", &ctx), Err(ExprError::TypeError { .. })));
        assert_eq!(run("'a' + 'b'", &ctx).unwrap(), Value::from("ab"));
    }

    #[test]
    fn test_division_by_zero() {
        let ctx = order_ctx();
        assert!(matches!(run("qty / 0", &ctx), Err(ExprError::DivisionByZero { .. })));
        assert!(matches!(run("qty % 0", &ctx), Err(ExprError::DivisionByZero { .. })));
        assert!(matches!(
            run("DIVIDE(qty, 0)", &ctx),
            Err(ExprError::DivisionByZero { .. })
        ));
    }

    #[test]
    fn test_short_circuit_and_lazy_if() {
        let ctx = order_ctx();
        // The right-hand sides would fail if evaluated
        assert_eq!(run("false && missing", &ctx).unwrap(), Value::Bool(false));
        assert_eq!(run("true || missing", &ctx).unwrap(), Value::Bool(true));
        assert_eq!(run("IF(qty > 2, 'bulk', missing)", &ctx).unwrap(), Value::from("bulk"));
        assert_eq!(run("IF(qty > 5, 'bulk')", &ctx).unwrap(), Value::Null);
        assert!(matches!(run("IF(qty, 1, 2)", &ctx), Err(ExprError::TypeError { .. })));
    }

    #[test]
    fn test_arity_checked_at_call() {
        let ctx = order_ctx();
        let err = run("ROUND(1, 2, 3)", &ctx).unwrap_err();
        assert_eq!(err.to_string(), "ROUND expects 1 to 2 argument(s), got 3");
    }

    #[test]
    fn test_step_limit() {
        let ctx = order_ctx();
        let expr = parse("1 + 1 + 1 + 1", ParseLimits::default()).unwrap();
        let registry = FunctionRegistry::builtin();
        let mut interpreter = Interpreter::new(&ctx, &registry, Duration::from_secs(5), 3);
        assert!(matches!(
            interpreter.eval(&expr),
            Err(ExprError::LimitExceeded { .. })
        ));
    }

    #[test]
    fn test_zero_budget_times_out() {
        let ctx = order_ctx();
        let expr = parse("qty * price", ParseLimits::default()).unwrap();
        let registry = FunctionRegistry::builtin();
        let mut interpreter = Interpreter::new(&ctx, &registry, Duration::ZERO, 100);
        assert_eq!(
            interpreter.eval(&expr),
            Err(ExprError::Timeout { budget_ms: 0 })
        );
    }

    #[test]
    fn test_cancellation() {
        let cancel = tokio_util::sync::CancellationToken::new();
        cancel.cancel();
        let ctx = order_ctx().with_cancellation(cancel);
        assert_eq!(run("qty", &ctx), Err(ExprError::Cancelled));
    }
}
