//! Grouping of pending tests into batches.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::pending::{PendingTests, Queued};
use crate::metrics::MetricsProvider;
use crate::test::{BatchId, Test, TestBatch};

/// Percentile used for a batch's expected duration.
const EXPECTED_PERCENTILE: f64 = 50.0;

/// Percentile used for a batch's maximum duration.
const MAX_PERCENTILE: f64 = 90.0;

/// Decides how many pending tests go into the next batch.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BatchingStrategy {
    /// One test per batch.
    #[default]
    Isolate,

    /// Up to `size` draws from the queue.
    ///
    /// When both `duration_secs` and `percentile` are set the batch also
    /// stops growing once the summed historical duration of its tests at
    /// that percentile reaches `duration_secs`. The first test is always
    /// included.
    FixedSize {
        size: usize,
        duration_secs: Option<f64>,
        percentile: Option<f64>,
    },
}

impl BatchingStrategy {
    /// Draws the tests of the next batch from `pending`.
    ///
    /// A test drawn twice in one call is put back instead of being batched
    /// twice, and so is a test in `busy` (already handed out in another
    /// batch). Busy entries do not count as draws. The result is empty when
    /// `pending` holds nothing but busy tests.
    pub fn next_batch(
        &self,
        pending: &mut PendingTests,
        busy: &HashSet<Test>,
        metrics: &dyn MetricsProvider,
        since: DateTime<Utc>,
    ) -> Vec<Test> {
        let mut batch: Vec<Test> = Vec::new();
        let mut deferred: Vec<Queued> = Vec::new();

        match self {
            BatchingStrategy::Isolate => {
                while let Some(queued) = pending.pop() {
                    if busy.contains(&queued.test) {
                        deferred.push(queued);
                        continue;
                    }
                    batch.push(queued.test);
                    break;
                }
            }
            BatchingStrategy::FixedSize {
                size,
                duration_secs,
                percentile,
            } => {
                let budget = match (duration_secs, percentile) {
                    (Some(secs), Some(percentile)) => {
                        Some((Duration::from_secs_f64(secs.max(0.0)), *percentile))
                    }
                    _ => None,
                };

                let mut expected = Duration::ZERO;
                let mut draws = 0;

                while draws < (*size).max(1) {
                    let Some(queued) = pending.pop() else {
                        break;
                    };
                    if busy.contains(&queued.test) {
                        deferred.push(queued);
                        continue;
                    }
                    draws += 1;

                    if batch.contains(&queued.test) {
                        deferred.push(queued);
                        continue;
                    }

                    if let Some((limit, percentile)) = budget {
                        expected += metrics.execution_time(&queued.test, percentile, since);
                        batch.push(queued.test);
                        if expected >= limit {
                            break;
                        }
                    } else {
                        batch.push(queued.test);
                    }
                }
            }
        }

        for queued in deferred {
            pending.push_back(queued);
        }
        batch
    }
}

/// Wraps drawn tests into a batch with its timing estimates.
pub fn build_batch(
    id: BatchId,
    tests: Vec<Test>,
    metrics: &dyn MetricsProvider,
    since: DateTime<Utc>,
) -> TestBatch {
    let expected_duration = tests
        .iter()
        .map(|t| metrics.execution_time(t, EXPECTED_PERCENTILE, since))
        .sum();
    let max_duration = tests
        .iter()
        .map(|t| metrics.execution_time(t, MAX_PERCENTILE, since))
        .sum();
    TestBatch {
        id,
        tests,
        expected_duration,
        max_duration,
    }
}
