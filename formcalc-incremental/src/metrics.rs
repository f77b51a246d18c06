//! Recalculation metrics
//!
//! The engine reports into a [`MetricsCollector`] rather than owning counters,
//! so callers can substitute their own collector (a deterministic one in
//! tests, an exporter in production).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Which kind of pass produced a measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    /// Change-driven pass over the affected fields
    Incremental,
    /// Full pass over every field
    Full,
}

/// Observer of recalculation activity
pub trait MetricsCollector: Send + Sync {
    /// One formula evaluation finished
    fn record_field(&self, field: &str, elapsed: Duration, success: bool);

    /// One pass finished
    fn record_pass(&self, kind: PassKind, fields: usize, elapsed: Duration);

    fn snapshot(&self) -> RecalculationMetrics;

    /// Operator action; never called by the engine itself
    fn reset(&self);
}

fn duration_ms<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

/// Per-field counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FieldMetrics {
    pub evaluations: u64,
    pub failures: u64,
    #[serde(rename = "total_time_ms", serialize_with = "duration_ms")]
    pub total_time: Duration,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecalculationMetrics {
    pub total_recalculations: u64,
    pub incremental_recalculations: u64,
    pub full_recalculations: u64,
    #[serde(rename = "total_time_ms", serialize_with = "duration_ms")]
    pub total_time: Duration,
    pub fields_recalculated: u64,
    pub failed_evaluations: u64,
    pub last_recalculation: Option<DateTime<Utc>>,
    pub fields: BTreeMap<String, FieldMetrics>,
}

impl RecalculationMetrics {
    pub fn average_time(&self) -> Duration {
        average(self.total_time, self.total_recalculations)
    }
}

fn average(total: Duration, count: u64) -> Duration {
    total
        .as_nanos()
        .checked_div(u128::from(count))
        .map_or(Duration::ZERO, |nanos| {
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        })
}

impl fmt::Display for RecalculationMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Recalculation Metrics:")?;
        writeln!(
            f,
            "  Passes: {} (incremental {}, full {})",
            self.total_recalculations, self.incremental_recalculations, self.full_recalculations
        )?;
        writeln!(
            f,
            "  Avg Time: {:.2}ms | Total Time: {:.2}ms",
            self.average_time().as_secs_f64() * 1000.0,
            self.total_time.as_secs_f64() * 1000.0
        )?;
        write!(
            f,
            "  Fields: {} recalculated, {} failed",
            self.fields_recalculated, self.failed_evaluations
        )?;
        if let Some(last) = self.last_recalculation {
            write!(f, "\n  Last: {}", last.to_rfc3339())?;
        }
        Ok(())
    }
}

/// Default collector keeping everything in process memory
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    incremental: AtomicU64,
    full: AtomicU64,
    total_time_ns: AtomicU64,
    fields_recalculated: AtomicU64,
    failed_evaluations: AtomicU64,
    last_recalculation: Mutex<Option<DateTime<Utc>>>,
    fields: Mutex<BTreeMap<String, FieldMetrics>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricsCollector for InMemoryMetrics {
    fn record_field(&self, field: &str, elapsed: Duration, success: bool) {
        if success {
            self.fields_recalculated.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_evaluations.fetch_add(1, Ordering::Relaxed);
        }

        let mut fields = self.fields.lock();
        let entry = fields.entry(field.to_string()).or_default();
        entry.evaluations += 1;
        entry.total_time += elapsed;
        if !success {
            entry.failures += 1;
        }
    }

    fn record_pass(&self, kind: PassKind, _fields: usize, elapsed: Duration) {
        match kind {
            PassKind::Incremental => self.incremental.fetch_add(1, Ordering::Relaxed),
            PassKind::Full => self.full.fetch_add(1, Ordering::Relaxed),
        };
        self.total_time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        *self.last_recalculation.lock() = Some(Utc::now());
    }

    fn snapshot(&self) -> RecalculationMetrics {
        let incremental = self.incremental.load(Ordering::Relaxed);
        let full = self.full.load(Ordering::Relaxed);
        RecalculationMetrics {
            total_recalculations: incremental + full,
            incremental_recalculations: incremental,
            full_recalculations: full,
            total_time: Duration::from_nanos(self.total_time_ns.load(Ordering::Relaxed)),
            fields_recalculated: self.fields_recalculated.load(Ordering::Relaxed),
            failed_evaluations: self.failed_evaluations.load(Ordering::Relaxed),
            last_recalculation: *self.last_recalculation.lock(),
            fields: self.fields.lock().clone(),
        }
    }

    fn reset(&self) {
        self.incremental.store(0, Ordering::Relaxed);
        self.full.store(0, Ordering::Relaxed);
        self.total_time_ns.store(0, Ordering::Relaxed);
        self.fields_recalculated.store(0, Ordering::Relaxed);
        self.failed_evaluations.store(0, Ordering::Relaxed);
        *self.last_recalculation.lock() = None;
        self.fields.lock().clear();
    }
}
