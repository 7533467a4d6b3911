//! Historical test metrics.
//!
//! Strategies ask a [`MetricsProvider`] how often a test passed and how long
//! it usually takes. Answers are only ever hints: a provider with no data
//! must still answer, and the engine never fails because metrics are
//! missing.
//!
//! | Provider | Description |
//! |----------|-------------|
//! | [`NoopMetrics`] | No history: every test always passes and takes no time |
//! | [`StaticMetrics`] | Fixed per-test values, for tests and embedding |
//! | [`HistoryMetrics`] | Reads a JSON history file written by earlier runs |

pub mod history;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::config::MetricsConfig;
use crate::test::Test;

pub use history::{HistoryMetrics, HistoryRecorder};

/// Source of historical success rates and durations.
pub trait MetricsProvider: Send + Sync {
    /// Fraction of runs since `since` that passed, in `[0, 1]`.
    fn success_rate(&self, test: &Test, since: DateTime<Utc>) -> f64;

    /// Duration at the given percentile (`0..=100`) of runs since `since`.
    fn execution_time(&self, test: &Test, percentile: f64, since: DateTime<Utc>) -> Duration;
}

/// Metrics used when no history is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsProvider for NoopMetrics {
    fn success_rate(&self, _test: &Test, _since: DateTime<Utc>) -> f64 {
        1.0
    }

    fn execution_time(&self, _test: &Test, _percentile: f64, _since: DateTime<Utc>) -> Duration {
        Duration::ZERO
    }
}

/// Metrics with fixed per-test values.
///
/// Tests without an explicit value report a success rate of `1.0` and a
/// duration of zero, which keeps every strategy at its neutral behavior.
#[derive(Debug, Clone)]
pub struct StaticMetrics {
    default_success_rate: f64,
    success_rates: HashMap<Test, f64>,
    execution_times: HashMap<Test, Duration>,
}

impl Default for StaticMetrics {
    fn default() -> Self {
        Self {
            default_success_rate: 1.0,
            success_rates: HashMap::new(),
            execution_times: HashMap::new(),
        }
    }
}

impl StaticMetrics {
    pub fn with_default_success_rate(mut self, rate: f64) -> Self {
        self.default_success_rate = rate;
        self
    }

    pub fn with_success_rate(mut self, test: Test, rate: f64) -> Self {
        self.success_rates.insert(test, rate);
        self
    }

    /// Sets the duration reported for every percentile of `test`.
    pub fn with_execution_time(mut self, test: Test, duration: Duration) -> Self {
        self.execution_times.insert(test, duration);
        self
    }
}

impl MetricsProvider for StaticMetrics {
    fn success_rate(&self, test: &Test, _since: DateTime<Utc>) -> f64 {
        self.success_rates
            .get(test)
            .copied()
            .unwrap_or(self.default_success_rate)
    }

    fn execution_time(&self, test: &Test, _percentile: f64, _since: DateTime<Utc>) -> Duration {
        self.execution_times
            .get(test)
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// Builds the metrics provider selected by the configuration.
pub fn from_config(config: &MetricsConfig) -> Result<Arc<dyn MetricsProvider>> {
    match config {
        MetricsConfig::None => Ok(Arc::new(NoopMetrics)),
        MetricsConfig::History(history) => {
            Ok(Arc::new(HistoryMetrics::load(&history.path)?))
        }
    }
}
