//! Shared types for formcalc
//!
//! This crate provides the value model shared by the expression engine,
//! the dependency graph, the data orchestrator and the recalculation engine:
//! decimal-backed values, their type tags, form data maps and source spans.

mod value;

pub use value::{parse_datetime, FormData, Value, ValueError, ValueType, DATETIME_FORMAT};

pub use rust_decimal::Decimal;

use serde::{Deserialize, Serialize};

/// Byte range into an expression's source text
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest span covering both `self` and `other`
    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl From<std::ops::Range<usize>> for Span {
    fn from(range: std::ops::Range<usize>) -> Self {
        Span::new(range.start, range.end)
    }
}
