//! Retry decisions for failed tests.
//!
//! Two pieces of state back a [`RetryPolicy`]:
//!
//! - a per-(pool, test) failure counter, owned by the policy and therefore by
//!   the pool's queue;
//! - a [`RetryBudget`] shared by every pool of the run, decremented
//!   atomically and never below zero.
//!
//! A retry is granted when the test's failure count plus its number of
//! flaky copies stays within the per-test quota and the shared budget still
//! has a retry left.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ConfigError;
use crate::device::DevicePoolId;
use crate::test::{Test, TestResult, TestShard};

/// Configured retry strategy.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RetryStrategy {
    /// Failed tests are never retried.
    #[default]
    NoRetry,

    /// Retries within a per-test and a run-wide quota.
    FixedQuota {
        #[serde(default = "default_total_quota")]
        total_allowed_retry_quota: usize,

        #[serde(default = "default_per_test_quota")]
        retry_per_test_quota: usize,

        /// Tests matching any of these are never retried.
        #[serde(default)]
        no_retry: Vec<TestMatcherConfig>,
    },
}

fn default_total_quota() -> usize {
    200
}

fn default_per_test_quota() -> usize {
    3
}

impl RetryStrategy {
    /// Size of the run-wide retry budget.
    pub fn total_quota(&self) -> usize {
        match self {
            RetryStrategy::NoRetry => 0,
            RetryStrategy::FixedQuota {
                total_allowed_retry_quota,
                ..
            } => *total_allowed_retry_quota,
        }
    }
}

/// Optional patterns over a test's package, class and method.
///
/// Each pattern must match the whole field. Absent patterns match anything.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TestMatcherConfig {
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
}

/// A compiled [`TestMatcherConfig`].
#[derive(Debug, Clone)]
pub struct TestMatcher {
    package: Option<Regex>,
    class: Option<Regex>,
    method: Option<Regex>,
}

impl TestMatcher {
    pub fn compile(config: &TestMatcherConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            package: compile_field(config.package.as_deref())?,
            class: compile_field(config.class.as_deref())?,
            method: compile_field(config.method.as_deref())?,
        })
    }

    pub fn matches(&self, test: &Test) -> bool {
        field_matches(&self.package, &test.package)
            && field_matches(&self.class, &test.class)
            && field_matches(&self.method, &test.method)
    }
}

fn compile_field(pattern: Option<&str>) -> Result<Option<Regex>, ConfigError> {
    pattern
        .map(|p| {
            Regex::new(&format!("^(?:{})$", p)).map_err(|source| ConfigError::Pattern {
                pattern: p.to_string(),
                source,
            })
        })
        .transpose()
}

fn field_matches(regex: &Option<Regex>, value: &str) -> bool {
    regex.as_ref().is_none_or(|r| r.is_match(value))
}

/// Run-wide retry budget shared by all pools.
#[derive(Debug)]
pub struct RetryBudget {
    total: usize,
    remaining: AtomicUsize,
}

impl RetryBudget {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            remaining: AtomicUsize::new(total),
        }
    }

    /// Takes one retry from the budget. Returns `false` once it is spent.
    pub fn try_acquire(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Retries granted so far.
    pub fn issued(&self) -> usize {
        self.total - self.remaining()
    }
}

enum Rule {
    Never,
    FixedQuota {
        per_test: usize,
        excluded: Vec<TestMatcher>,
    },
}

/// Stateful retry decisions for one pool.
pub struct RetryPolicy {
    rule: Rule,
    budget: Arc<RetryBudget>,
    failures: HashMap<(DevicePoolId, Test), usize>,
}

impl RetryPolicy {
    pub fn new(strategy: &RetryStrategy, budget: Arc<RetryBudget>) -> Result<Self, ConfigError> {
        let rule = match strategy {
            RetryStrategy::NoRetry => Rule::Never,
            RetryStrategy::FixedQuota {
                retry_per_test_quota,
                no_retry,
                ..
            } => Rule::FixedQuota {
                per_test: *retry_per_test_quota,
                excluded: no_retry
                    .iter()
                    .map(TestMatcher::compile)
                    .collect::<Result<_, _>>()?,
            },
        };
        Ok(Self {
            rule,
            budget,
            failures: HashMap::new(),
        })
    }

    /// Returns the failed tests that should run again.
    pub fn process(
        &mut self,
        pool: &DevicePoolId,
        failed: &[TestResult],
        shard: &TestShard,
    ) -> Vec<Test> {
        let Rule::FixedQuota { per_test, excluded } = &self.rule else {
            return Vec::new();
        };

        let mut retries = Vec::new();
        for result in failed {
            let test = &result.test;
            if excluded.iter().any(|m| m.matches(test)) {
                debug!(%pool, %test, "Test excluded from retries");
                continue;
            }

            let failures = self
                .failures
                .entry((pool.clone(), test.clone()))
                .or_insert(0);
            *failures += 1;
            let count = *failures + shard.flaky_count(test);

            if count <= *per_test && self.budget.try_acquire() {
                retries.push(test.clone());
            } else {
                debug!(%pool, %test, count, "Retry denied");
            }
        }
        retries
    }

    /// Failures recorded for a test in a pool.
    pub fn failures(&self, pool: &DevicePoolId, test: &Test) -> usize {
        self.failures
            .get(&(pool.clone(), test.clone()))
            .copied()
            .unwrap_or(0)
    }
}
