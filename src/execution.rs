//! Test execution engine.
//!
//! The engine is a small set of actors, each a tokio task that owns its state
//! and is driven by a channel of messages:
//!
//! ```text
//!   DeviceProvider ── Connected / Disconnected ──► Scheduler
//!                                                    │ pooling strategy
//!                                   ┌────────────────┼────────────────┐
//!                                   ▼                ▼                ▼
//!                            PoolCoordinator   PoolCoordinator      ...
//!                              │        ▲
//!               add / remove   │        │ HasWork, Drained, DeviceLost
//!                              ▼        │
//!                     DeviceActor ... DeviceActor ──► Device (execute)
//!                              │        ▲
//!      request / report / return        │ batches
//!                              ▼        │
//!                              TestQueue (per pool)
//! ```
//!
//! # Execution Flow
//!
//! 1. **Pooling**: each connected device is mapped to a pool; the first
//!    device of a pool creates its coordinator and queue
//! 2. **Pulling**: every device actor prepares its device, then pulls batches
//!    from the queue until it is empty
//! 3. **Retrying**: failures go back into the queue while the retry quotas
//!    allow, and idle devices are woken up
//! 4. **Completion**: a pool completes once its queue has nothing pending and
//!    nothing outstanding; the run completes once every pool has
//!
//! # Key Components
//!
//! - [`Scheduler`]: main entry point, owns the provider subscription
//! - [`pool::PoolCoordinator`]: owns the device actors of one pool
//! - [`device_actor::DeviceActor`]: drives one device
//! - [`queue::TestQueue`]: the authoritative backlog of one pool
//! - [`RunResult`]: aggregated results of the entire run

pub mod device_actor;
pub mod pending;
pub mod pool;
pub mod queue;
pub mod scheduler;

use std::path::PathBuf;
use std::time::Duration;

use crate::config::ConfigError;
use crate::device::DevicePoolId;
use crate::provider::ProviderError;
use crate::test::{Test, TestResult};

pub use scheduler::Scheduler;

/// Errors that abort a run.
///
/// Test failures and device loss never end up here; they are recovered
/// inside the engine.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to create output directory {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No device connected within {0:?}")]
    NoDevices(Duration),

    #[error("Device provider failed: {0}")]
    Provider(#[from] ProviderError),
}

/// Final status of one test in one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalStatus {
    Passed,
    /// Passed after at least one failed attempt.
    Flaky,
    Failed,
    Ignored,
    NotRun,
}

/// Final state of one test in one pool.
#[derive(Debug, Clone)]
pub struct TestSummary {
    pub test: Test,
    pub status: FinalStatus,

    /// Executions, including failed attempts.
    pub attempts: usize,

    /// The result that decided the status, if the test ran.
    pub last: Option<TestResult>,
}

/// Outcome of one pool.
#[derive(Debug, Clone)]
pub struct PoolSummary {
    pub pool: DevicePoolId,
    pub tests: Vec<TestSummary>,
}

impl PoolSummary {
    fn count(&self, status: FinalStatus) -> usize {
        self.tests.iter().filter(|t| t.status == status).count()
    }

    /// Passed tests, flaky ones included.
    pub fn passed(&self) -> usize {
        self.count(FinalStatus::Passed) + self.count(FinalStatus::Flaky)
    }

    pub fn flaky(&self) -> usize {
        self.count(FinalStatus::Flaky)
    }

    pub fn failed(&self) -> usize {
        self.count(FinalStatus::Failed)
    }

    pub fn ignored(&self) -> usize {
        self.count(FinalStatus::Ignored)
    }

    pub fn not_run(&self) -> usize {
        self.count(FinalStatus::NotRun)
    }
}

/// Aggregated results of an entire run.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | All tests passed |
/// | 1 | Some tests failed or weren't run |
/// | 2 | All tests passed but some were flaky |
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    /// Per-pool outcomes, sorted by pool name.
    pub pools: Vec<PoolSummary>,

    /// Distinct tests summed over pools.
    pub total_tests: usize,

    /// Tests that passed, flaky ones included.
    pub passed: usize,

    pub failed: usize,

    pub ignored: usize,

    /// Tests that passed after failing at least once.
    pub flaky: usize,

    /// Tests that never got a result (no device, abandoned pool).
    pub not_run: usize,

    /// Retries granted from the shared budget.
    pub retries: usize,

    /// Wall-clock duration of the entire run.
    pub duration: Duration,
}

impl RunResult {
    pub fn from_pools(mut pools: Vec<PoolSummary>, retries: usize, duration: Duration) -> Self {
        pools.sort_by(|a, b| a.pool.cmp(&b.pool));
        let mut result = RunResult {
            retries,
            duration,
            ..Default::default()
        };
        for pool in &pools {
            result.total_tests += pool.tests.len();
            result.passed += pool.passed();
            result.failed += pool.failed();
            result.ignored += pool.ignored();
            result.flaky += pool.flaky();
            result.not_run += pool.not_run();
        }
        result.pools = pools;
        result
    }

    /// Returns `true` if no test failed and every test ran.
    ///
    /// # Example
    ///
    /// ```
    /// use fleet::execution::RunResult;
    /// use std::time::Duration;
    ///
    /// let result = RunResult {
    ///     total_tests: 100,
    ///     passed: 95,
    ///     ignored: 5,
    ///     flaky: 2,
    ///     duration: Duration::from_secs(60),
    ///     ..Default::default()
    /// };
    ///
    /// assert!(result.success());
    /// assert_eq!(result.exit_code(), 2);
    /// ```
    pub fn success(&self) -> bool {
        self.failed == 0 && self.not_run == 0
    }

    /// Returns an appropriate process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 || self.not_run > 0 {
            1
        } else if self.flaky > 0 {
            2
        } else {
            0
        }
    }

    pub fn pool(&self, pool: &DevicePoolId) -> Option<&PoolSummary> {
        self.pools.iter().find(|p| &p.pool == pool)
    }
}
