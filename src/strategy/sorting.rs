//! Ordering of pending tests.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::MetricsProvider;
use crate::test::Test;

/// Decides which pending test is drawn first.
///
/// Ties always fall back to insertion order, so `none` keeps the order the
/// tests were queued in.
///
/// ```toml
/// [strategies.sorting]
/// type = "success-rate"
/// descending = true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SortingStrategy {
    /// Insertion order.
    #[default]
    None,

    /// Historical success rate, highest first unless `descending = false`.
    SuccessRate {
        #[serde(default = "default_descending")]
        descending: bool,
    },

    /// Historical duration at `percentile`, longest first.
    ExecutionTime {
        #[serde(default = "default_percentile")]
        percentile: f64,
    },
}

fn default_descending() -> bool {
    true
}

fn default_percentile() -> f64 {
    90.0
}

impl SortingStrategy {
    /// Computes the priority of a test. Smaller ranks are drawn first.
    pub fn rank(&self, test: &Test, metrics: &dyn MetricsProvider, since: DateTime<Utc>) -> Rank {
        match self {
            SortingStrategy::None => Rank(0.0),
            SortingStrategy::SuccessRate { descending } => {
                let rate = metrics.success_rate(test, since);
                if *descending { Rank(-rate) } else { Rank(rate) }
            }
            SortingStrategy::ExecutionTime { percentile } => {
                let time = metrics.execution_time(test, *percentile, since);
                Rank(-time.as_secs_f64())
            }
        }
    }
}

/// Totally ordered priority value.
#[derive(Debug, Clone, Copy)]
pub struct Rank(pub f64);

impl PartialEq for Rank {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Rank {}

impl PartialOrd for Rank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rank {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::StaticMetrics;

    #[test]
    fn test_success_rate_descending_ranks_stable_tests_first() {
        let stable = Test::new("p", "C", "stable");
        let flaky = Test::new("p", "C", "flaky");
        let metrics = StaticMetrics::default()
            .with_success_rate(stable.clone(), 0.99)
            .with_success_rate(flaky.clone(), 0.4);
        let since = Utc::now();

        let strategy = SortingStrategy::SuccessRate { descending: true };
        assert!(strategy.rank(&stable, &metrics, since) < strategy.rank(&flaky, &metrics, since));

        let strategy = SortingStrategy::SuccessRate { descending: false };
        assert!(strategy.rank(&flaky, &metrics, since) < strategy.rank(&stable, &metrics, since));
    }

    #[test]
    fn test_execution_time_ranks_longest_first() {
        let slow = Test::new("p", "C", "slow");
        let fast = Test::new("p", "C", "fast");
        let metrics = StaticMetrics::default()
            .with_execution_time(slow.clone(), std::time::Duration::from_secs(30))
            .with_execution_time(fast.clone(), std::time::Duration::from_secs(1));
        let strategy = SortingStrategy::ExecutionTime { percentile: 90.0 };
        let since = Utc::now();

        assert!(strategy.rank(&slow, &metrics, since) < strategy.rank(&fast, &metrics, since));
    }

    #[test]
    fn test_none_ranks_everything_equal() {
        let metrics = StaticMetrics::default();
        let since = Utc::now();
        let a = SortingStrategy::None.rank(&Test::new("p", "C", "a"), &metrics, since);
        let b = SortingStrategy::None.rank(&Test::new("p", "C", "b"), &metrics, since);
        assert_eq!(a, b);
    }

    #[test]
    fn test_deserialize_sorting() {
        let strategy: SortingStrategy = toml::from_str("type = \"success-rate\"").unwrap();
        assert_eq!(strategy, SortingStrategy::SuccessRate { descending: true });
    }
}
