//! Run progress and result reporting.
//!
//! Reporters observe a run; they never influence it. Every callback has an
//! empty default so an implementation only picks the events it needs.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::device::{DeviceInfo, DevicePoolId};
use crate::execution::{FinalStatus, RunResult};
use crate::test::{TestBatch, TestOutcome, TestResult};

/// A reporter receives events during a run.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called when a pool is created, with the number of queued runs.
    async fn on_pool_started(&self, _pool: &DevicePoolId, _total: usize) {}

    /// Called when retries or retired flaky copies change a pool's total.
    async fn on_total_changed(&self, _pool: &DevicePoolId, _total: usize) {}

    async fn on_device_connected(&self, _pool: &DevicePoolId, _device: &DeviceInfo) {}

    /// Called when a device leaves its pool; `reason` is set when it was lost.
    async fn on_device_disconnected(
        &self,
        _pool: &DevicePoolId,
        _serial: &str,
        _reason: Option<&str>,
    ) {
    }

    async fn on_batch_started(&self, _pool: &DevicePoolId, _serial: &str, _batch: &TestBatch) {}

    /// Called once per executed test, including failed attempts that will be
    /// retried.
    async fn on_test_finished(&self, _pool: &DevicePoolId, _result: &TestResult) {}

    /// Called when all pools have completed.
    async fn on_run_complete(&self, _result: &RunResult) {}
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {}

/// A reporter that combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    /// Create a new multi-reporter.
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    /// Add a reporter to the multi-reporter.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_pool_started(&self, pool: &DevicePoolId, total: usize) {
        for reporter in &self.reporters {
            reporter.on_pool_started(pool, total).await;
        }
    }

    async fn on_total_changed(&self, pool: &DevicePoolId, total: usize) {
        for reporter in &self.reporters {
            reporter.on_total_changed(pool, total).await;
        }
    }

    async fn on_device_connected(&self, pool: &DevicePoolId, device: &DeviceInfo) {
        for reporter in &self.reporters {
            reporter.on_device_connected(pool, device).await;
        }
    }

    async fn on_device_disconnected(&self, pool: &DevicePoolId, serial: &str, reason: Option<&str>) {
        for reporter in &self.reporters {
            reporter.on_device_disconnected(pool, serial, reason).await;
        }
    }

    async fn on_batch_started(&self, pool: &DevicePoolId, serial: &str, batch: &TestBatch) {
        for reporter in &self.reporters {
            reporter.on_batch_started(pool, serial, batch).await;
        }
    }

    async fn on_test_finished(&self, pool: &DevicePoolId, result: &TestResult) {
        for reporter in &self.reporters {
            reporter.on_test_finished(pool, result).await;
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        for reporter in &self.reporters {
            reporter.on_run_complete(result).await;
        }
    }
}

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    progress: std::sync::Mutex<Option<indicatif::ProgressBar>>,
    totals: std::sync::Mutex<HashMap<DevicePoolId, usize>>,
    show_progress: bool,
    verbose: bool,
}

impl ConsoleReporter {
    /// Create a new console reporter.
    pub fn new(verbose: bool, show_progress: bool) -> Self {
        Self {
            progress: std::sync::Mutex::new(None),
            totals: std::sync::Mutex::new(HashMap::new()),
            show_progress,
            verbose,
        }
    }

    fn set_total(&self, pool: &DevicePoolId, total: usize) {
        let sum = match self.totals.lock() {
            Ok(mut totals) => {
                totals.insert(pool.clone(), total);
                totals.values().sum::<usize>()
            }
            Err(_) => return,
        };

        if !self.show_progress {
            return;
        }
        let Ok(mut progress) = self.progress.lock() else {
            return;
        };
        match progress.as_ref() {
            Some(pb) => pb.set_length(sum as u64),
            None => {
                let pb = indicatif::ProgressBar::new(sum as u64);
                if let Ok(style) = indicatif::ProgressStyle::default_bar().template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
                ) {
                    pb.set_style(style.progress_chars("#>-"));
                }
                *progress = Some(pb);
            }
        }
    }

    fn println(&self, line: String) {
        match self.progress.lock().ok().as_ref().and_then(|p| p.as_ref()) {
            Some(pb) => pb.println(line),
            None => println!("{}", line),
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_pool_started(&self, pool: &DevicePoolId, total: usize) {
        self.println(format!("Pool {} started with {} queued runs", pool, total));
        self.set_total(pool, total);
    }

    async fn on_total_changed(&self, pool: &DevicePoolId, total: usize) {
        self.set_total(pool, total);
    }

    async fn on_device_connected(&self, pool: &DevicePoolId, device: &DeviceInfo) {
        if self.verbose {
            self.println(format!("Device {} joined pool {}", device.serial, pool));
        }
    }

    async fn on_device_disconnected(&self, pool: &DevicePoolId, serial: &str, reason: Option<&str>) {
        if let Some(reason) = reason {
            self.println(format!(
                "{} device {} lost from pool {}: {}",
                console::style("WARN").yellow(),
                serial,
                pool,
                reason
            ));
        } else if self.verbose {
            self.println(format!("Device {} left pool {}", serial, pool));
        }
    }

    async fn on_batch_started(&self, pool: &DevicePoolId, serial: &str, batch: &TestBatch) {
        if self.verbose {
            self.println(format!(
                "Running batch {} ({} tests) on {} [{}]",
                batch.id,
                batch.len(),
                serial,
                pool
            ));
        }
    }

    async fn on_test_finished(&self, pool: &DevicePoolId, result: &TestResult) {
        if let Ok(progress) = self.progress.lock() {
            if let Some(pb) = progress.as_ref() {
                pb.inc(1);
            }
        }

        let status = match result.outcome {
            TestOutcome::Passed => console::style("PASS").green(),
            TestOutcome::Failed => console::style("FAIL").red(),
            TestOutcome::Ignored => console::style("SKIP").yellow(),
            TestOutcome::Incomplete => console::style("INC ").red().bold(),
        };

        if self.verbose || !result.outcome.is_finished() {
            self.println(format!(
                "{} {} on {} [{}]",
                status, result.test, result.device_serial, pool
            ));
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        if let Ok(mut progress) = self.progress.lock() {
            if let Some(pb) = progress.take() {
                pb.finish_and_clear();
            }
        }
        print_summary(result);
    }
}

/// Prints a summary of test results to the console.
///
/// Displays per-pool and overall counts with colored output, followed by
/// the tests that failed for good.
pub fn print_summary(result: &RunResult) {
    println!();
    println!("Test Results:");
    println!("  Total:   {}", result.total_tests);
    println!("  Passed:  {}", console::style(result.passed).green());
    println!("  Failed:  {}", console::style(result.failed).red());
    println!("  Ignored: {}", console::style(result.ignored).yellow());

    if result.not_run > 0 {
        println!("  Not Run: {}", console::style(result.not_run).red().bold());
    }

    if result.flaky > 0 {
        println!("  Flaky:   {}", console::style(result.flaky).yellow());
    }

    if result.retries > 0 {
        println!("  Retries: {}", result.retries);
    }

    println!("  Duration: {:?}", result.duration);

    if result.pools.len() > 1 {
        println!();
        println!("Pools:");
        for pool in &result.pools {
            println!(
                "  {}: {} passed, {} failed, {} ignored, {} not run",
                pool.pool,
                pool.passed(),
                pool.failed(),
                pool.ignored(),
                pool.not_run()
            );
        }
    }

    if result.success() {
        println!();
        println!("{}", console::style("All tests passed!").green().bold());
        return;
    }

    println!();
    if result.failed == 0 {
        println!(
            "{}",
            console::style("Some tests could not be executed.").red().bold()
        );
    } else {
        println!("{}", console::style("Some tests failed.").red().bold());
    }

    println!();
    println!("Failed tests:");
    for pool in &result.pools {
        for summary in &pool.tests {
            match summary.status {
                FinalStatus::Failed => {
                    println!("  - {} [{}]", summary.test, pool.pool);
                    if let Some(msg) = summary.last.as_ref().and_then(|r| r.message.as_ref()) {
                        println!("    {}", console::style(msg).dim());
                    }
                }
                FinalStatus::NotRun => {
                    println!(
                        "  - {} [{}] {}",
                        summary.test,
                        pool.pool,
                        console::style("(not run)").dim()
                    );
                }
                _ => {}
            }
        }
    }
}
