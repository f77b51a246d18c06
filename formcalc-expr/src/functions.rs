//! Built-in function registry
//!
//! The registry is the single list of callable functions. The parser does not
//! know about it; the checker uses it for name and arity validation, the
//! interpreter dispatches through it, and introspection reads signatures from
//! it, so the three can never disagree.

use chrono::format::{Item, StrftimeItems};
use chrono::{Datelike, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use formcalc_types::{Value, ValueType};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Failure raised by a native function, mapped to `ExprError` by the caller
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    DivisionByZero,
    Overflow,
    Type(String),
    Invalid(String),
}

/// Ambient inputs a function may read
#[derive(Debug, Clone, Copy, Default)]
pub struct CallContext {
    /// Evaluation timestamp supplied by the caller
    pub now: Option<NaiveDateTime>,
}

pub type NativeFn = fn(&CallContext, &[Value]) -> Result<Value, CallError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionCategory {
    Logical,
    Text,
    Math,
    Date,
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Required,
    Optional,
    /// Repeats zero or more times after the preceding parameters
    Rest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Param {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub ty: ValueType,
    pub kind: ParamKind,
}

const fn req(name: &'static str, ty: ValueType) -> Param {
    Param {
        name,
        ty,
        kind: ParamKind::Required,
    }
}

const fn opt(name: &'static str, ty: ValueType) -> Param {
    Param {
        name,
        ty,
        kind: ParamKind::Optional,
    }
}

const fn rest(name: &'static str, ty: ValueType) -> Param {
    Param {
        name,
        ty,
        kind: ParamKind::Rest,
    }
}

/// Public description of a function
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionSignature {
    pub name: &'static str,
    pub category: FunctionCategory,
    pub params: &'static [Param],
    pub returns: ValueType,
    pub description: &'static str,
    /// False when the result depends on the evaluation timestamp
    pub deterministic: bool,
}

impl FunctionSignature {
    pub fn min_args(&self) -> usize {
        self.params
            .iter()
            .filter(|p| p.kind == ParamKind::Required)
            .count()
    }

    /// `None` for variadic functions
    pub fn max_args(&self) -> Option<usize> {
        if self.params.iter().any(|p| p.kind == ParamKind::Rest) {
            None
        } else {
            Some(self.params.len())
        }
    }

    pub fn accepts(&self, count: usize) -> bool {
        count >= self.min_args() && self.max_args().map_or(true, |max| count <= max)
    }

    /// Human readable arity, e.g. "1 to 3" or "at least 1"
    pub fn arity(&self) -> String {
        let min = self.min_args();
        match self.max_args() {
            Some(max) if max == min => min.to_string(),
            Some(max) => format!("{} to {}", min, max),
            None => format!("at least {}", min),
        }
    }

    /// Call form such as `ROUND(value, digits?)`
    pub fn usage(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| match p.kind {
                ParamKind::Required => p.name.to_string(),
                ParamKind::Optional => format!("{}?", p.name),
                ParamKind::Rest => format!("{}...", p.name),
            })
            .collect();
        format!("{}({})", self.name, params.join(", "))
    }
}

/// How a call is evaluated
#[derive(Clone, Copy)]
pub enum Evaluation {
    /// Arguments are evaluated first, then passed to the native function
    Eager(NativeFn),
    /// Arguments are evaluated selectively by the interpreter (`IF`)
    Lazy,
}

#[derive(Clone)]
pub struct FunctionDef {
    pub signature: FunctionSignature,
    pub evaluation: Evaluation,
}

/// Registry of callable functions keyed by upper-case name
#[derive(Clone)]
pub struct FunctionRegistry {
    functions: BTreeMap<&'static str, FunctionDef>,
}

impl FunctionRegistry {
    /// Registry holding every built-in function
    pub fn builtin() -> Self {
        let mut registry = FunctionRegistry {
            functions: BTreeMap::new(),
        };
        for (signature, evaluation) in builtins() {
            registry.functions.insert(
                signature.name,
                FunctionDef {
                    signature,
                    evaluation,
                },
            );
        }
        registry
    }

    pub fn get(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.get(name.to_ascii_uppercase().as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Signatures sorted by name
    pub fn signatures(&self) -> Vec<FunctionSignature> {
        self.functions
            .values()
            .map(|def| def.signature.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn sig(
    name: &'static str,
    category: FunctionCategory,
    params: &'static [Param],
    returns: ValueType,
    description: &'static str,
) -> FunctionSignature {
    FunctionSignature {
        name,
        category,
        params,
        returns,
        description,
        deterministic: true,
    }
}

// Parameter lists shared by the table below

const NO_PARAMS: &[Param] = &[];
const IF_PARAMS: &[Param] = &[
    req("condition", ValueType::Boolean),
    req("then", ValueType::Any),
    opt("else", ValueType::Any),
];
const BOOLEAN: &[Param] = &[req("value", ValueType::Boolean)];
const BOOLEANS: &[Param] = &[
    req("value", ValueType::Boolean),
    rest("values", ValueType::Boolean),
];
const ANY_PAIR: &[Param] = &[req("left", ValueType::Any), req("right", ValueType::Any)];
const ANY_VALUE: &[Param] = &[req("value", ValueType::Any)];
const ANY_VALUES: &[Param] = &[req("value", ValueType::Any), rest("values", ValueType::Any)];
const ANY_REST: &[Param] = &[rest("values", ValueType::Any)];
const CONTAINS_PARAMS: &[Param] = &[
    req("haystack", ValueType::Any),
    req("needle", ValueType::Any),
];
const TEXT: &[Param] = &[req("text", ValueType::String)];
const SUBSTRING_PARAMS: &[Param] = &[
    req("text", ValueType::String),
    req("start", ValueType::Number),
    opt("length", ValueType::Number),
];
const NUMBER: &[Param] = &[req("value", ValueType::Number)];
const NUMBER_PAIR: &[Param] = &[
    req("left", ValueType::Number),
    req("right", ValueType::Number),
];
const ROUND_PARAMS: &[Param] = &[
    req("value", ValueType::Number),
    opt("digits", ValueType::Number),
];
const DATE_PARAMS: &[Param] = &[
    req("year_or_text", ValueType::Any),
    opt("month", ValueType::Number),
    opt("day", ValueType::Number),
];
const DATE_ADD_PARAMS: &[Param] = &[
    req("date", ValueType::DateTime),
    req("amount", ValueType::Number),
    req("unit", ValueType::String),
];
const DATE_DIFF_PARAMS: &[Param] = &[
    req("start", ValueType::DateTime),
    req("end", ValueType::DateTime),
    opt("unit", ValueType::String),
];
const FORMAT_DATE_PARAMS: &[Param] = &[
    req("date", ValueType::DateTime),
    req("format", ValueType::String),
];

fn builtins() -> Vec<(FunctionSignature, Evaluation)> {
    use Evaluation::{Eager, Lazy};
    use FunctionCategory::*;
    use ValueType as T;

    let mut now = sig("NOW", Date, NO_PARAMS, T::DateTime, "Evaluation timestamp");
    now.deterministic = false;
    let mut today = sig(
        "TODAY",
        Date,
        NO_PARAMS,
        T::DateTime,
        "Evaluation date at midnight",
    );
    today.deterministic = false;

    vec![
        // Logical
        (
            sig(
                "IF",
                Logical,
                IF_PARAMS,
                T::Any,
                "Evaluates only the branch selected by the condition",
            ),
            Lazy,
        ),
        (
            sig("AND", Logical, BOOLEANS, T::Boolean, "True when every argument is true"),
            Eager(fn_and),
        ),
        (
            sig("OR", Logical, BOOLEANS, T::Boolean, "True when any argument is true"),
            Eager(fn_or),
        ),
        (
            sig("NOT", Logical, BOOLEAN, T::Boolean, "Logical negation"),
            Eager(fn_not),
        ),
        (
            sig("EQUALS", Logical, ANY_PAIR, T::Boolean, "Same as left == right"),
            Eager(fn_equals),
        ),
        (
            sig("GREATER_THAN", Logical, ANY_PAIR, T::Boolean, "Same as left > right"),
            Eager(fn_greater_than),
        ),
        (
            sig("LESS_THAN", Logical, ANY_PAIR, T::Boolean, "Same as left < right"),
            Eager(fn_less_than),
        ),
        // Text
        (
            sig(
                "CONTAINS",
                Text,
                CONTAINS_PARAMS,
                T::Boolean,
                "Substring test on text, membership test on arrays",
            ),
            Eager(fn_contains),
        ),
        (
            sig(
                "LENGTH",
                Text,
                ANY_VALUE,
                T::Number,
                "Character count of text or element count of an array",
            ),
            Eager(fn_length),
        ),
        (
            sig("UPPER", Text, TEXT, T::String, "Upper-case text"),
            Eager(fn_upper),
        ),
        (
            sig("LOWER", Text, TEXT, T::String, "Lower-case text"),
            Eager(fn_lower),
        ),
        (
            sig("TRIM", Text, TEXT, T::String, "Strip leading and trailing whitespace"),
            Eager(fn_trim),
        ),
        (
            sig(
                "SUBSTRING",
                Text,
                SUBSTRING_PARAMS,
                T::String,
                "Characters from a zero-based start position",
            ),
            Eager(fn_substring),
        ),
        (
            sig("CONCAT", Text, ANY_REST, T::String, "Joins the text form of every argument"),
            Eager(fn_concat),
        ),
        // Math
        (
            sig("ADD", Math, NUMBER_PAIR, T::Number, "Decimal addition"),
            Eager(fn_add),
        ),
        (
            sig("SUBTRACT", Math, NUMBER_PAIR, T::Number, "Decimal subtraction"),
            Eager(fn_subtract),
        ),
        (
            sig("MULTIPLY", Math, NUMBER_PAIR, T::Number, "Decimal multiplication"),
            Eager(fn_multiply),
        ),
        (
            sig("DIVIDE", Math, NUMBER_PAIR, T::Number, "Decimal division"),
            Eager(fn_divide),
        ),
        (
            sig(
                "ROUND",
                Math,
                ROUND_PARAMS,
                T::Number,
                "Round half away from zero to the given decimal places",
            ),
            Eager(fn_round),
        ),
        (
            sig("ABS", Math, NUMBER, T::Number, "Absolute value"),
            Eager(fn_abs),
        ),
        (
            sig("FLOOR", Math, NUMBER, T::Number, "Largest integer not above the value"),
            Eager(fn_floor),
        ),
        (
            sig("CEILING", Math, NUMBER, T::Number, "Smallest integer not below the value"),
            Eager(fn_ceiling),
        ),
        (
            sig(
                "MIN",
                Math,
                ANY_VALUES,
                T::Number,
                "Smallest number; array arguments are flattened",
            ),
            Eager(fn_min),
        ),
        (
            sig(
                "MAX",
                Math,
                ANY_VALUES,
                T::Number,
                "Largest number; array arguments are flattened",
            ),
            Eager(fn_max),
        ),
        (
            sig(
                "SUM",
                Math,
                ANY_REST,
                T::Number,
                "Total of all numbers; array arguments are flattened",
            ),
            Eager(fn_sum),
        ),
        // Date
        (now, Eager(fn_now)),
        (today, Eager(fn_today)),
        (
            sig(
                "DATE",
                Date,
                DATE_PARAMS,
                T::DateTime,
                "Builds a date from text or from year, month and day",
            ),
            Eager(fn_date),
        ),
        (
            sig(
                "DATE_ADD",
                Date,
                DATE_ADD_PARAMS,
                T::DateTime,
                "Shifts a date by days, months, years, hours, minutes or seconds",
            ),
            Eager(fn_date_add),
        ),
        (
            sig(
                "DATE_DIFF",
                Date,
                DATE_DIFF_PARAMS,
                T::Number,
                "Whole units from start to end (default days)",
            ),
            Eager(fn_date_diff),
        ),
        (
            sig(
                "FORMAT_DATE",
                Date,
                FORMAT_DATE_PARAMS,
                T::String,
                "Formats a date with strftime specifiers",
            ),
            Eager(fn_format_date),
        ),
        // Null handling
        (
            sig("IS_NULL", Null, ANY_VALUE, T::Boolean, "True for null"),
            Eager(fn_is_null),
        ),
        (
            sig(
                "IS_EMPTY",
                Null,
                ANY_VALUE,
                T::Boolean,
                "True for null, blank text or an empty collection",
            ),
            Eager(fn_is_empty),
        ),
        (
            sig("COALESCE", Null, ANY_VALUES, T::Any, "First argument that is not null"),
            Eager(fn_coalesce),
        ),
    ]
}

// Argument helpers

fn type_error(position: usize, expected: ValueType, found: &Value) -> CallError {
    CallError::Type(format!(
        "argument {} must be {}, found {}",
        position + 1,
        expected,
        found.value_type()
    ))
}

fn number_arg(args: &[Value], position: usize) -> Result<Decimal, CallError> {
    let value = args.get(position).unwrap_or(&Value::Null);
    value
        .as_decimal()
        .ok_or_else(|| type_error(position, ValueType::Number, value))
}

fn bool_arg(args: &[Value], position: usize) -> Result<bool, CallError> {
    let value = args.get(position).unwrap_or(&Value::Null);
    value
        .as_bool()
        .ok_or_else(|| type_error(position, ValueType::Boolean, value))
}

fn text_arg(args: &[Value], position: usize) -> Result<String, CallError> {
    match args.get(position).unwrap_or(&Value::Null) {
        Value::String(s) => Ok(s.clone()),
        Value::Null => Ok(String::new()),
        other => Err(type_error(position, ValueType::String, other)),
    }
}

fn date_arg(args: &[Value], position: usize) -> Result<NaiveDateTime, CallError> {
    let value = args.get(position).unwrap_or(&Value::Null);
    value
        .as_datetime()
        .ok_or_else(|| type_error(position, ValueType::DateTime, value))
}

fn integer_arg(args: &[Value], position: usize) -> Result<i64, CallError> {
    let number = number_arg(args, position)?;
    if !number.fract().is_zero() {
        return Err(CallError::Invalid(format!(
            "argument {} must be a whole number, found {}",
            position + 1,
            number
        )));
    }
    number.to_i64().ok_or(CallError::Overflow)
}

/// Numbers from the arguments, flattening arrays one level
fn numbers(args: &[Value]) -> Result<Vec<Decimal>, CallError> {
    let mut out = Vec::new();
    for (position, arg) in args.iter().enumerate() {
        match arg {
            Value::Number(n) => out.push(*n),
            Value::Array(items) => {
                for item in items {
                    out.push(
                        item.as_decimal()
                            .ok_or_else(|| type_error(position, ValueType::Number, item))?,
                    );
                }
            }
            other => return Err(type_error(position, ValueType::Number, other)),
        }
    }
    Ok(out)
}

// Shared decimal arithmetic, also used by the binary operators

pub(crate) fn checked_add(a: Decimal, b: Decimal) -> Result<Decimal, CallError> {
    a.checked_add(b).ok_or(CallError::Overflow)
}

pub(crate) fn checked_sub(a: Decimal, b: Decimal) -> Result<Decimal, CallError> {
    a.checked_sub(b).ok_or(CallError::Overflow)
}

pub(crate) fn checked_mul(a: Decimal, b: Decimal) -> Result<Decimal, CallError> {
    a.checked_mul(b).ok_or(CallError::Overflow)
}

pub(crate) fn checked_div(a: Decimal, b: Decimal) -> Result<Decimal, CallError> {
    if b.is_zero() {
        return Err(CallError::DivisionByZero);
    }
    a.checked_div(b).ok_or(CallError::Overflow)
}

pub(crate) fn checked_rem(a: Decimal, b: Decimal) -> Result<Decimal, CallError> {
    if b.is_zero() {
        return Err(CallError::DivisionByZero);
    }
    a.checked_rem(b).ok_or(CallError::Overflow)
}

// Logical

fn fn_and(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    let mut result = true;
    for position in 0..args.len() {
        result &= bool_arg(args, position)?;
    }
    Ok(Value::Bool(result))
}

fn fn_or(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    let mut result = false;
    for position in 0..args.len() {
        result |= bool_arg(args, position)?;
    }
    Ok(Value::Bool(result))
}

fn fn_not(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    Ok(Value::Bool(!bool_arg(args, 0)?))
}

fn fn_equals(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    Ok(Value::Bool(args[0].loose_eq(&args[1])))
}

fn compare_args(args: &[Value]) -> Result<std::cmp::Ordering, CallError> {
    args[0].compare(&args[1]).ok_or_else(|| {
        CallError::Type(format!(
            "cannot compare {} with {}",
            args[0].value_type(),
            args[1].value_type()
        ))
    })
}

fn fn_greater_than(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    Ok(Value::Bool(compare_args(args)?.is_gt()))
}

fn fn_less_than(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    Ok(Value::Bool(compare_args(args)?.is_lt()))
}

// Text

fn fn_contains(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    match &args[0] {
        Value::Array(items) => Ok(Value::Bool(items.iter().any(|item| item.loose_eq(&args[1])))),
        Value::String(text) => Ok(Value::Bool(text.contains(&text_arg(args, 1)?))),
        Value::Null => Ok(Value::Bool(false)),
        other => Err(type_error(0, ValueType::String, other)),
    }
}

fn fn_length(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    let len = match &args[0] {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        Value::Null => 0,
        other => return Err(type_error(0, ValueType::String, other)),
    };
    Ok(Value::Number(Decimal::from(len)))
}

fn fn_upper(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    Ok(Value::String(text_arg(args, 0)?.to_uppercase()))
}

fn fn_lower(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    Ok(Value::String(text_arg(args, 0)?.to_lowercase()))
}

fn fn_trim(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    Ok(Value::String(text_arg(args, 0)?.trim().to_string()))
}

fn fn_substring(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    let text = text_arg(args, 0)?;
    let count = text.chars().count();
    let start = integer_arg(args, 1)?;
    let start = usize::try_from(start)
        .ok()
        .filter(|s| *s <= count)
        .ok_or_else(|| {
            CallError::Invalid(format!("start {} is outside text of length {}", start, count))
        })?;
    let length = if args.len() > 2 {
        let length = integer_arg(args, 2)?;
        usize::try_from(length)
            .map_err(|_| CallError::Invalid(format!("length {} is negative", length)))?
    } else {
        count - start
    };
    Ok(Value::String(text.chars().skip(start).take(length).collect()))
}

fn fn_concat(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    Ok(Value::String(args.iter().map(Value::to_text).collect()))
}

// Math

fn fn_add(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    Ok(Value::Number(checked_add(number_arg(args, 0)?, number_arg(args, 1)?)?))
}

fn fn_subtract(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    Ok(Value::Number(checked_sub(number_arg(args, 0)?, number_arg(args, 1)?)?))
}

fn fn_multiply(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    Ok(Value::Number(checked_mul(number_arg(args, 0)?, number_arg(args, 1)?)?))
}

fn fn_divide(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    Ok(Value::Number(checked_div(number_arg(args, 0)?, number_arg(args, 1)?)?))
}

fn fn_round(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    let value = number_arg(args, 0)?;
    let digits = if args.len() > 1 { integer_arg(args, 1)? } else { 0 };
    let digits = u32::try_from(digits)
        .ok()
        .filter(|d| *d <= 28)
        .ok_or_else(|| {
            CallError::Invalid(format!("digits must be between 0 and 28, found {}", digits))
        })?;
    Ok(Value::Number(
        value.round_dp_with_strategy(digits, RoundingStrategy::MidpointAwayFromZero),
    ))
}

fn fn_abs(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    Ok(Value::Number(number_arg(args, 0)?.abs()))
}

fn fn_floor(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    Ok(Value::Number(number_arg(args, 0)?.floor()))
}

fn fn_ceiling(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    Ok(Value::Number(number_arg(args, 0)?.ceil()))
}

fn fn_min(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    numbers(args)?
        .into_iter()
        .min()
        .map(Value::Number)
        .ok_or_else(|| CallError::Invalid("no numbers to compare".to_string()))
}

fn fn_max(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    numbers(args)?
        .into_iter()
        .max()
        .map(Value::Number)
        .ok_or_else(|| CallError::Invalid("no numbers to compare".to_string()))
}

fn fn_sum(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    let mut total = Decimal::ZERO;
    for n in numbers(args)? {
        total = checked_add(total, n)?;
    }
    Ok(Value::Number(total))
}

// Date

fn require_now(ctx: &CallContext) -> Result<NaiveDateTime, CallError> {
    ctx.now.ok_or_else(|| {
        CallError::Invalid("no evaluation timestamp was supplied in the context".to_string())
    })
}

fn fn_now(ctx: &CallContext, _: &[Value]) -> Result<Value, CallError> {
    Ok(Value::DateTime(require_now(ctx)?))
}

fn fn_today(ctx: &CallContext, _: &[Value]) -> Result<Value, CallError> {
    Ok(Value::DateTime(require_now(ctx)?.date().and_time(NaiveTime::MIN)))
}

fn fn_date(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    if args.len() == 1 {
        return date_arg(args, 0).map(Value::DateTime);
    }
    if args.len() != 3 {
        return Err(CallError::Invalid(
            "expects either text or year, month and day".to_string(),
        ));
    }
    let (year, month, day) = (integer_arg(args, 0)?, integer_arg(args, 1)?, integer_arg(args, 2)?);
    i32::try_from(year)
        .ok()
        .zip(u32::try_from(month).ok())
        .zip(u32::try_from(day).ok())
        .and_then(|((y, m), d)| NaiveDate::from_ymd_opt(y, m, d))
        .map(|date| Value::DateTime(date.and_time(NaiveTime::MIN)))
        .ok_or_else(|| {
            CallError::Invalid(format!("{}-{}-{} is not a valid date", year, month, day))
        })
}

fn add_months(date: NaiveDateTime, months: i64) -> Option<NaiveDateTime> {
    let count = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
    if months >= 0 {
        date.checked_add_months(count)
    } else {
        date.checked_sub_months(count)
    }
}

/// Accepts singular or plural unit names, case-insensitively
fn normalize_unit(unit: &str) -> String {
    let unit = unit.trim().to_ascii_lowercase();
    unit.strip_suffix('s').map(str::to_string).unwrap_or(unit)
}

fn fn_date_add(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    let date = date_arg(args, 0)?;
    let amount = integer_arg(args, 1)?;
    let unit = normalize_unit(&text_arg(args, 2)?);

    let shifted = match unit.as_str() {
        "day" => TimeDelta::try_days(amount).and_then(|d| date.checked_add_signed(d)),
        "hour" => TimeDelta::try_hours(amount).and_then(|d| date.checked_add_signed(d)),
        "minute" => TimeDelta::try_minutes(amount).and_then(|d| date.checked_add_signed(d)),
        "second" => TimeDelta::try_seconds(amount).and_then(|d| date.checked_add_signed(d)),
        "month" => add_months(date, amount),
        "year" => amount.checked_mul(12).and_then(|m| add_months(date, m)),
        _ => return Err(CallError::Invalid(format!("unknown unit '{}'", unit))),
    };
    shifted
        .map(Value::DateTime)
        .ok_or_else(|| CallError::Invalid("resulting date is out of range".to_string()))
}

fn whole_months(start: NaiveDateTime, end: NaiveDateTime) -> i64 {
    let mut months = (end.year() as i64 - start.year() as i64) * 12
        + (end.month() as i64 - start.month() as i64);
    let end_key = (end.day(), end.num_seconds_from_midnight());
    let start_key = (start.day(), start.num_seconds_from_midnight());
    if months > 0 && end_key < start_key {
        months -= 1;
    } else if months < 0 && end_key > start_key {
        months += 1;
    }
    months
}

fn fn_date_diff(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    let start = date_arg(args, 0)?;
    let end = date_arg(args, 1)?;
    let unit = if args.len() > 2 {
        normalize_unit(&text_arg(args, 2)?)
    } else {
        "day".to_string()
    };

    let delta = end.signed_duration_since(start);
    let diff = match unit.as_str() {
        "day" => delta.num_days(),
        "hour" => delta.num_hours(),
        "minute" => delta.num_minutes(),
        "second" => delta.num_seconds(),
        "month" => whole_months(start, end),
        "year" => whole_months(start, end) / 12,
        _ => return Err(CallError::Invalid(format!("unknown unit '{}'", unit))),
    };
    Ok(Value::Number(Decimal::from(diff)))
}

fn fn_format_date(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    let date = date_arg(args, 0)?;
    let format = text_arg(args, 1)?;

    let items: Vec<Item<'_>> = StrftimeItems::new(&format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(CallError::Invalid(format!("invalid date format '{}'", format)));
    }

    let mut out = String::new();
    write!(out, "{}", date.format_with_items(items.iter()))
        .map_err(|_| CallError::Invalid(format!("format '{}' does not apply to dates", format)))?;
    Ok(Value::String(out))
}

// Null handling

fn fn_is_null(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    Ok(Value::Bool(args[0].is_null()))
}

fn fn_is_empty(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    Ok(Value::Bool(args[0].is_empty()))
}

fn fn_coalesce(_: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    Ok(args
        .iter()
        .find(|value| !value.is_null())
        .cloned()
        .unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[Value]) -> Result<Value, CallError> {
        call_at(name, args, None)
    }

    fn call_at(name: &str, args: &[Value], now: Option<NaiveDateTime>) -> Result<Value, CallError> {
        let registry = FunctionRegistry::builtin();
        let def = registry.get(name).unwrap();
        assert!(def.signature.accepts(args.len()), "bad arity for {name}");
        match def.evaluation {
            Evaluation::Eager(f) => f(&CallContext { now }, args),
            Evaluation::Lazy => panic!("{name} is lazy"),
        }
    }

    fn dec(text: &str) -> Value {
        Value::Number(text.parse().unwrap())
    }

    fn date(text: &str) -> Value {
        Value::DateTime(formcalc_types::parse_datetime(text).unwrap())
    }

    #[test]
    fn test_registry_lookup_is_case_insensitive() {
        let registry = FunctionRegistry::builtin();
        assert!(registry.contains("round"));
        assert!(registry.contains("Date_Add"));
        assert!(!registry.contains("EVAL"));
        assert_eq!(registry.signatures().len(), registry.len());
    }

    #[test]
    fn test_arity() {
        let registry = FunctionRegistry::builtin();
        let round = &registry.get("ROUND").unwrap().signature;
        assert_eq!(round.arity(), "1 to 2");
        assert_eq!(round.usage(), "ROUND(value, digits?)");
        assert!(!round.accepts(3));

        let concat = &registry.get("CONCAT").unwrap().signature;
        assert_eq!(concat.arity(), "at least 0");
        assert!(concat.accepts(7));
    }

    #[test]
    fn test_signatures_describe_parameters() {
        let registry = FunctionRegistry::builtin();
        let sig = |name: &str| registry.get(name).unwrap().signature.clone();

        assert_eq!(sig("IF").usage(), "IF(condition, then, else?)");
        assert_eq!(sig("AND").arity(), "at least 1");
        assert_eq!(sig("DATE_ADD").arity(), "3");
        assert_eq!(sig("SUBSTRING").params[1].ty, ValueType::Number);
        assert!(sig("NOW").params.is_empty());
        assert!(!sig("TODAY").deterministic);
        assert!(registry.signatures().iter().all(|s| s.params.len() <= 3));
    }

    #[test]
    fn test_decimal_math() {
        assert_eq!(call("ADD", &[dec("0.1"), dec("0.2")]).unwrap(), dec("0.3"));
        assert_eq!(call("DIVIDE", &[dec("10"), dec("4")]).unwrap(), dec("2.5"));
        assert_eq!(
            call("DIVIDE", &[dec("1"), dec("0")]),
            Err(CallError::DivisionByZero)
        );
        assert_eq!(call("ROUND", &[dec("2.345"), dec("2")]).unwrap(), dec("2.35"));
        assert_eq!(call("ROUND", &[dec("-2.5")]).unwrap(), dec("-3"));
        assert_eq!(call("FLOOR", &[dec("-1.5")]).unwrap(), dec("-2"));
        assert_eq!(call("CEILING", &[dec("1.1")]).unwrap(), dec("2"));
    }

    #[test]
    fn test_aggregates_flatten_arrays() {
        let items = Value::Array(vec![dec("1.5"), dec("2.5")]);
        assert_eq!(call("SUM", &[items.clone(), dec("1")]).unwrap(), dec("5"));
        assert_eq!(call("MIN", &[items.clone(), dec("3")]).unwrap(), dec("1.5"));
        assert_eq!(call("MAX", &[items]).unwrap(), dec("2.5"));
        assert!(matches!(call("SUM", &[Value::from("x")]), Err(CallError::Type(_))));
    }

    #[test]
    fn test_text_functions() {
        assert_eq!(call("UPPER", &[Value::from("abc")]).unwrap(), Value::from("ABC"));
        assert_eq!(call("TRIM", &[Value::from("  a ")]).unwrap(), Value::from("a"));
        assert_eq!(
            call("SUBSTRING", &[Value::from("héllo"), dec("1"), dec("3")]).unwrap(),
            Value::from("éll")
        );
        assert_eq!(
            call("SUBSTRING", &[Value::from("abc"), dec("1")]).unwrap(),
            Value::from("bc")
        );
        assert!(call("SUBSTRING", &[Value::from("abc"), dec("9")]).is_err());
        assert_eq!(
            call("CONCAT", &[Value::from("Total: "), dec("29.97"), Value::Null]).unwrap(),
            Value::from("Total: 29.97")
        );
        assert_eq!(call("LENGTH", &[Value::from("héllo")]).unwrap(), dec("5"));
        assert_eq!(
            call("CONTAINS", &[Value::Array(vec![dec("1"), dec("2")]), dec("2")]).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_logical_functions_require_booleans() {
        assert_eq!(
            call("AND", &[Value::Bool(true), Value::Bool(false)]).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            call("OR", &[Value::Bool(false), Value::Bool(true)]).unwrap(),
            Value::Bool(true)
        );
        assert!(matches!(call("NOT", &[dec("1")]), Err(CallError::Type(_))));
        assert_eq!(
            call("GREATER_THAN", &[dec("10"), dec("9.99")]).unwrap(),
            Value::Bool(true)
        );
        assert!(call("LESS_THAN", &[dec("1"), Value::from("a")]).is_err());
    }

    #[test]
    fn test_date_functions() {
        assert_eq!(
            call("DATE_ADD", &[date("2024-01-31"), dec("1"), Value::from("months")]).unwrap(),
            date("2024-02-29")
        );
        assert_eq!(
            call("DATE_ADD", &[Value::from("2024-01-31"), dec("-1"), Value::from("Year")]).unwrap(),
            date("2023-01-31")
        );
        assert_eq!(
            call("DATE_ADD", &[date("2024-01-01"), dec("36"), Value::from("hours")]).unwrap(),
            date("2024-01-02T12:00:00")
        );
        assert_eq!(
            call("DATE_DIFF", &[date("2024-01-01"), date("2024-03-01")]).unwrap(),
            dec("60")
        );
        assert_eq!(
            call("DATE_DIFF", &[date("2024-01-31"), date("2024-02-29"), Value::from("months")])
                .unwrap(),
            dec("0")
        );
        assert_eq!(
            call("DATE", &[dec("2024"), dec("2"), dec("29")]).unwrap(),
            date("2024-02-29")
        );
        assert!(call("DATE", &[dec("2023"), dec("2"), dec("29")]).is_err());
        assert!(call(
            "DATE_ADD",
            &[date("2024-01-01"), dec("1"), Value::from("fortnight")]
        )
        .is_err());
    }

    #[test]
    fn test_format_date_rejects_bad_formats() {
        assert_eq!(
            call("FORMAT_DATE", &[date("2024-03-05"), Value::from("%d/%m/%Y")]).unwrap(),
            Value::from("05/03/2024")
        );
        assert!(call("FORMAT_DATE", &[date("2024-03-05"), Value::from("%Q")]).is_err());
        assert!(call("FORMAT_DATE", &[date("2024-03-05"), Value::from("%z")]).is_err());
    }

    #[test]
    fn test_now_requires_context_timestamp() {
        assert!(call("NOW", &[]).is_err());
        let now = formcalc_types::parse_datetime("2024-05-06T07:08:09").unwrap();
        assert_eq!(call_at("NOW", &[], Some(now)).unwrap(), Value::DateTime(now));
        assert_eq!(call_at("TODAY", &[], Some(now)).unwrap(), date("2024-05-06"));

        let registry = FunctionRegistry::builtin();
        assert!(!registry.get("NOW").unwrap().signature.deterministic);
        assert!(registry.get("ROUND").unwrap().signature.deterministic);
    }

    #[test]
    fn test_null_handling() {
        assert_eq!(
            call("COALESCE", &[Value::Null, dec("0"), dec("1")]).unwrap(),
            dec("0")
        );
        assert_eq!(call("COALESCE", &[Value::Null]).unwrap(), Value::Null);
        assert_eq!(call("IS_EMPTY", &[Value::from(" ")]).unwrap(), Value::Bool(true));
        assert_eq!(call("IS_NULL", &[dec("0")]).unwrap(), Value::Bool(false));
    }
}
