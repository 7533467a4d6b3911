//! fleet: distributes test suites across dynamic pools of devices.
//!
//! Devices come and go while a run is in progress. Each device is mapped to
//! a pool, every pool gets its own copy of the test list, and the devices of
//! a pool pull small batches from a shared queue until it is empty. Failed
//! tests are retried within per-test and global quotas, tests with a poor
//! history get extra preemptive runs, and a lost device's work goes back to
//! its pool.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Providers**: announce devices as they connect and disconnect
//! - **Devices**: prepare themselves and execute batches of tests
//! - **Strategies**: pooling, sharding, sorting, batching, flakiness, retry
//! - **Execution**: the scheduler, pool coordinators, device actors and queues
//! - **Metrics**: historical success rates and durations
//! - **Report**: progress and result reporting
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fleet::config::load_config;
//! use fleet::execution::Scheduler;
//! use fleet::provider::local::LocalProvider;
//! use fleet::report::ConsoleReporter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("fleet.toml"))?;
//!     let metrics = fleet::metrics::from_config(&config.metrics)?;
//!     let provider = LocalProvider::from_config(&config.provider);
//!     let reporter = Arc::new(ConsoleReporter::new(false, true));
//!
//!     let tests = fleet::test::load_tests(std::path::Path::new("tests.txt"))?;
//!     let result = Scheduler::new(config, provider, metrics, reporter)
//!         .execute(tests)
//!         .await?;
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod config;
pub mod device;
pub mod execution;
pub mod metrics;
pub mod output;
pub mod provider;
pub mod report;
pub mod strategy;
pub mod test;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use device::{Device, DeviceInfo, DevicePoolId};
pub use execution::{RunError, RunResult, Scheduler};
pub use metrics::MetricsProvider;
pub use provider::{DeviceEvent, DeviceProvider};
pub use report::Reporter;
pub use test::{Test, TestBatch, TestOutcome, TestResult};
