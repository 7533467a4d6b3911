//! Preemptive duplication of historically flaky tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::metrics::MetricsProvider;
use crate::test::TestShard;

/// Decides how many extra copies of each test to queue up front.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FlakinessStrategy {
    /// No extra copies.
    #[default]
    Ignore,

    /// Adds copies until the chance that every run fails drops to
    /// `1 - min_success_rate`.
    ProbabilityBased { min_success_rate: f64 },
}

impl FlakinessStrategy {
    /// Returns `shard` with flaky copies added.
    pub fn process(
        &self,
        shard: TestShard,
        metrics: &dyn MetricsProvider,
        since: DateTime<Utc>,
    ) -> TestShard {
        let FlakinessStrategy::ProbabilityBased { min_success_rate } = self else {
            return shard;
        };

        let mut flaky_tests = shard.flaky_tests;
        for test in &shard.tests {
            let rate = metrics.success_rate(test, since);
            let copies = extra_copies(rate, *min_success_rate);
            if copies > 0 {
                debug!(%test, rate, copies, "Queueing flaky copies");
                flaky_tests.extend(std::iter::repeat_n(test.clone(), copies));
            }
        }
        TestShard {
            tests: shard.tests,
            flaky_tests,
        }
    }
}

/// Number of extra runs needed for a test passing with probability `rate` to
/// pass at least once with probability `min_success_rate`.
fn extra_copies(rate: f64, min_success_rate: f64) -> usize {
    if rate >= min_success_rate || rate <= 0.0 {
        // A test that never passes gains nothing from copies.
        return 0;
    }
    let fail = 1.0 - rate;
    let tolerated = 1.0 - min_success_rate;
    let mut err = fail;
    let mut copies = 0;
    while err > tolerated {
        err *= fail;
        copies += 1;
    }
    copies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::StaticMetrics;
    use crate::test::Test;

    #[test]
    fn test_extra_copies() {
        assert_eq!(extra_copies(0.5, 0.8), 2);
        assert_eq!(extra_copies(0.7, 0.8), 1);
        assert_eq!(extra_copies(0.9, 0.8), 0);
        assert_eq!(extra_copies(0.0, 0.8), 0);
    }

    #[test]
    fn test_probability_based_adds_copies() {
        let flaky = Test::new("p", "C", "flaky");
        let stable = Test::new("p", "C", "stable");
        let metrics = StaticMetrics::default().with_success_rate(flaky.clone(), 0.5);
        let strategy = FlakinessStrategy::ProbabilityBased {
            min_success_rate: 0.8,
        };

        let shard = strategy.process(
            TestShard::new(vec![flaky.clone(), stable.clone()]),
            &metrics,
            Utc::now(),
        );

        assert_eq!(shard.tests.len(), 2);
        assert_eq!(shard.flaky_count(&flaky), 2);
        assert_eq!(shard.flaky_count(&stable), 0);
    }

    #[test]
    fn test_ignore_keeps_shard() {
        let test = Test::new("p", "C", "m");
        let metrics = StaticMetrics::default().with_default_success_rate(0.1);
        let shard =
            FlakinessStrategy::Ignore.process(TestShard::new(vec![test]), &metrics, Utc::now());
        assert!(shard.flaky_tests.is_empty());
    }
}
