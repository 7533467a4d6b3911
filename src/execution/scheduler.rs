//! Run entry point: maps devices to pools and waits for every pool.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use super::device_actor::{DeviceSettings, ExecutionTimeouts};
use super::pool::{PoolEvent, PoolHandle};
use super::queue::{QueueSettings, TestQueue};
use super::{PoolSummary, RunError, RunResult};
use crate::config::Config;
use crate::device::{DevicePoolId, ExecutionContext};
use crate::metrics::MetricsProvider;
use crate::output::FileManager;
use crate::provider::{DeviceEvent, DeviceProvider};
use crate::report::Reporter;
use crate::strategy::{RetryBudget, RetryPolicy};
use crate::test::Test;

/// Fallback wake-up for the event loop when no deadline is armed.
const IDLE_TICK: Duration = Duration::from_secs(3600);

struct PoolState {
    handle: PoolHandle,
    live: usize,
    starved_since: Option<Instant>,
    summary: Option<PoolSummary>,
}

/// Runs a list of tests on the devices a provider announces.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use fleet::config::load_config;
/// use fleet::execution::Scheduler;
/// use fleet::metrics::NoopMetrics;
/// use fleet::provider::local::LocalProvider;
/// use fleet::report::ConsoleReporter;
/// use fleet::test::Test;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = load_config(std::path::Path::new("fleet.toml"))?;
///     let provider = LocalProvider::from_config(&config.provider);
///     let scheduler = Scheduler::new(
///         config,
///         provider,
///         Arc::new(NoopMetrics),
///         Arc::new(ConsoleReporter::new(false, true)),
///     );
///
///     let tests = vec![Test::new("com.example", "LoginTest", "works")];
///     let result = scheduler.execute(tests).await?;
///     std::process::exit(result.exit_code());
/// }
/// ```
pub struct Scheduler<P: DeviceProvider> {
    config: Config,
    provider: P,
    metrics: Arc<dyn MetricsProvider>,
    reporter: Arc<dyn Reporter>,
}

impl<P: DeviceProvider> Scheduler<P> {
    pub fn new(
        config: Config,
        provider: P,
        metrics: Arc<dyn MetricsProvider>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            config,
            provider,
            metrics,
            reporter,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Executes `tests` and returns once every pool has completed.
    ///
    /// Test failures, lost devices and abandoned pools are part of the
    /// result, not errors.
    ///
    /// # Arguments
    ///
    /// * `tests` - The test list. Repeated entries are dropped and ignored
    ///   tests are reported without running.
    ///
    /// # Errors
    ///
    /// - [`RunError::Config`] if the configuration fails validation
    /// - [`RunError::Output`] if the output directory cannot be created
    /// - [`RunError::Provider`] if the provider cannot start or stream devices
    /// - [`RunError::NoDevices`] if no device connects within
    ///   `no_devices_timeout_secs`
    pub async fn execute(&self, tests: Vec<Test>) -> Result<RunResult, RunError> {
        let started = Instant::now();
        self.config.validate()?;

        let output_dir = &self.config.fleet.output_dir;
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|source| RunError::Output {
                path: output_dir.clone(),
                source,
            })?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let since = self.config.fleet.history_since(Utc::now());
        let (skipped, runnable) = split_tests(tests);
        info!(
            %run_id,
            tests = runnable.len(),
            ignored = skipped.len(),
            output = %output_dir.display(),
            "Starting run"
        );

        if runnable.is_empty() {
            warn!("No tests to run");
            let result = RunResult {
                total_tests: skipped.len(),
                ignored: skipped.len(),
                duration: started.elapsed(),
                ..Default::default()
            };
            self.reporter.on_run_complete(&result).await;
            return Ok(result);
        }

        let strategies = &self.config.strategies;
        let shard = strategies.sharding.create_shard(runnable);
        let shard = strategies
            .flakiness
            .process(shard, self.metrics.as_ref(), since);
        let budget = Arc::new(RetryBudget::new(strategies.retry.total_quota()));

        let queue_settings = QueueSettings {
            sorting: strategies.sorting.clone(),
            batching: strategies.batching.clone(),
            metrics: self.metrics.clone(),
            since,
        };
        let device_settings = DeviceSettings {
            ctx: ExecutionContext {
                run_id,
                files: Arc::new(FileManager::new(output_dir.clone())),
            },
            timeouts: ExecutionTimeouts {
                batch: self.config.fleet.batch_timeout(),
                output: self.config.fleet.output_timeout(),
            },
            reporter: self.reporter.clone(),
        };

        self.provider.initialize().await?;
        let mut devices = self.provider.subscribe()?;
        info!(provider = self.provider.name(), "Waiting for devices");

        let no_devices = self.config.fleet.no_devices_timeout();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut pools: HashMap<DevicePoolId, PoolState> = HashMap::new();
        // Serial -> pool and generation of the device currently routed there.
        let mut device_pools: HashMap<String, (DevicePoolId, u64)> = HashMap::new();
        let mut next_generation: u64 = 0;
        let mut provider_open = true;

        loop {
            if !pools.is_empty() && pools.values().all(|p| p.summary.is_some()) {
                break;
            }

            let deadline = if pools.is_empty() {
                Some(started + no_devices)
            } else {
                pools
                    .values()
                    .filter(|p| p.summary.is_none())
                    .filter_map(|p| p.starved_since)
                    .min()
                    .map(|since| since + no_devices)
            };
            let timer = deadline.unwrap_or_else(|| Instant::now() + IDLE_TICK);

            tokio::select! {
                event = devices.recv(), if provider_open => match event {
                    Some(DeviceEvent::Connected(mut device)) if device_pools.contains_key(&device.info().serial) => {
                        let serial = device.info().serial.clone();
                        warn!(%serial, "Ignoring duplicate device");
                        if let Err(e) = device.release().await {
                            warn!(%serial, error = %e, "Failed to release device");
                        }
                    }
                    Some(DeviceEvent::Connected(device)) => {
                        let info = device.info().clone();
                        let pool_id = strategies.pooling.associate(&info);
                        let state = match pools.entry(pool_id.clone()) {
                            Entry::Occupied(entry) => entry.into_mut(),
                            Entry::Vacant(entry) => {
                                let queue = TestQueue::new(
                                    pool_id.clone(),
                                    shard.clone(),
                                    skipped.clone(),
                                    queue_settings.clone(),
                                    RetryPolicy::new(&strategies.retry, budget.clone())?,
                                );
                                info!(pool = %pool_id, runs = shard.len(), "Creating pool");
                                self.reporter.on_pool_started(&pool_id, shard.len()).await;
                                entry.insert(PoolState {
                                    handle: PoolHandle::spawn(
                                        queue,
                                        device_settings.clone(),
                                        events_tx.clone(),
                                    ),
                                    live: 0,
                                    starved_since: None,
                                    summary: None,
                                })
                            }
                        };
                        let generation = next_generation;
                        next_generation += 1;
                        state.handle.add_device(device, generation);
                        device_pools.insert(info.serial, (pool_id, generation));
                    }
                    // The serial is free again as soon as it disconnects.
                    Some(DeviceEvent::Disconnected(serial)) => match device_pools.remove(&serial) {
                        Some((pool_id, _)) => {
                            if let Some(state) = pools.get(&pool_id) {
                                state.handle.remove_device(&serial);
                            }
                        }
                        None => debug!(%serial, "Disconnect for unknown device"),
                    },
                    None => {
                        debug!("Device provider closed its event stream");
                        provider_open = false;
                    }
                },

                Some(event) = events.recv() => match event {
                    PoolEvent::DeviceAdded { pool, .. } => {
                        if let Some(state) = pools.get_mut(&pool) {
                            state.live += 1;
                            state.starved_since = None;
                        }
                    }
                    PoolEvent::DeviceRemoved { pool, serial, generation } => {
                        forget_device(&mut device_pools, &pool, &serial, generation);
                        if let Some(state) = pools.get_mut(&pool) {
                            state.live = state.live.saturating_sub(1);
                            if state.live == 0 && state.summary.is_none() {
                                info!(%pool, "Pool has no devices left");
                                state.starved_since = Some(Instant::now());
                            }
                        }
                    }
                    PoolEvent::DeviceRejected { pool, serial, generation } => {
                        forget_device(&mut device_pools, &pool, &serial, generation);
                    }
                    PoolEvent::Completed { pool, summary } => {
                        if let Some(state) = pools.get_mut(&pool) {
                            state.summary = Some(summary);
                            state.starved_since = None;
                        }
                    }
                },

                _ = sleep_until(timer), if deadline.is_some() => {
                    if pools.is_empty() {
                        warn!(timeout = ?no_devices, "No device connected");
                        self.shutdown(&pools).await;
                        return Err(RunError::NoDevices(no_devices));
                    }
                    let now = Instant::now();
                    for (pool, state) in pools.iter_mut() {
                        let expired = state
                            .starved_since
                            .is_some_and(|since| now >= since + no_devices);
                        if expired && state.summary.is_none() {
                            warn!(%pool, timeout = ?no_devices, "No device for pool, abandoning");
                            state.starved_since = None;
                            state.handle.abandon();
                        }
                    }
                }
            }
        }

        self.shutdown(&pools).await;

        let summaries: Vec<PoolSummary> = pools.into_values().filter_map(|p| p.summary).collect();
        let result = RunResult::from_pools(summaries, budget.issued(), started.elapsed());
        info!(
            passed = result.passed,
            failed = result.failed,
            flaky = result.flaky,
            not_run = result.not_run,
            retries = result.retries,
            duration = ?result.duration,
            "Run complete"
        );
        self.reporter.on_run_complete(&result).await;
        Ok(result)
    }

    async fn shutdown(&self, pools: &HashMap<DevicePoolId, PoolState>) {
        join_all(pools.values().map(|p| p.handle.terminate())).await;
        if let Err(e) = self.provider.terminate().await {
            warn!(provider = self.provider.name(), error = %e, "Failed to terminate provider");
        }
    }
}

/// Drops the routing entry of `serial` if it still points at that exact device.
fn forget_device(
    device_pools: &mut HashMap<String, (DevicePoolId, u64)>,
    pool: &DevicePoolId,
    serial: &str,
    generation: u64,
) {
    if device_pools
        .get(serial)
        .is_some_and(|(p, g)| p == pool && *g == generation)
    {
        device_pools.remove(serial);
    }
}

/// Splits ignored tests from runnable ones and drops repeated entries.
fn split_tests(tests: Vec<Test>) -> (Vec<Test>, Vec<Test>) {
    let mut seen = HashSet::new();
    let mut skipped = Vec::new();
    let mut runnable = Vec::new();
    for test in tests {
        if !seen.insert(test.clone()) {
            warn!(%test, "Ignoring repeated test");
            continue;
        }
        if test.is_ignored() {
            skipped.push(test);
        } else {
            runnable.push(test);
        }
    }
    (skipped, runnable)
}
