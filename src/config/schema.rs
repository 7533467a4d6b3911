//! Configuration schema definitions for fleet.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Strategy and provider selection use tagged enums
//! (`type = "..."`).
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── FleetConfig            - Output dir, timeouts, history window
//! ├── StrategiesConfig       - Policy layer selection
//! │   ├── pooling            - omni | operating-system | abi | model | manufacturer
//! │   ├── sharding           - parallel | count
//! │   ├── sorting            - none | success-rate | execution-time
//! │   ├── batching           - isolate | fixed-size
//! │   ├── flakiness          - ignore | probability-based
//! │   └── retry              - no-retry | fixed-quota
//! ├── MetricsConfig          - none | history
//! ├── ProviderConfig         - Tagged enum selecting where devices come from
//! │   ├── Local              - Process devices, locally or over ssh
//! │   └── Stub               - Scripted devices that pass everything
//! └── ReportConfig           - Console output settings
//! ```

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::device::DeviceInfo;
use crate::strategy::{
    BatchingStrategy, FlakinessStrategy, PoolingStrategy, RetryStrategy, ShardingStrategy,
    SortingStrategy, TestMatcher,
};

/// Root configuration structure for fleet.
///
/// # TOML Structure
///
/// ```toml
/// [fleet]
/// output_dir = "fleet-output"
/// batch_timeout_secs = 900
///
/// [strategies.pooling]
/// type = "operating-system"
///
/// [strategies.batching]
/// type = "fixed-size"
/// size = 5
///
/// [provider]
/// type = "local"
///
/// [[provider.devices]]
/// serial = "emulator-5554"
/// os_version = "29"
/// run_command = "./run-tests.sh"
/// ```
///
/// # Example
///
/// ```
/// use fleet::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [provider]
///     type = "stub"
///
///     [[provider.devices]]
///     serial = "stub-1"
/// "#).unwrap();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Core settings (output, timeouts).
    #[serde(default)]
    pub fleet: FleetConfig,

    /// Policy layer selection (optional, every strategy has a default).
    #[serde(default)]
    pub strategies: StrategiesConfig,

    /// Historical metrics source (optional, defaults to none).
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Where devices come from.
    pub provider: ProviderConfig,

    /// Console reporting (optional, has defaults).
    #[serde(default)]
    pub report: ReportConfig,
}

impl Config {
    /// Checks everything that can be checked before a device connects.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fleet.validate()?;
        self.strategies.validate()?;
        self.provider.validate()
    }
}

/// Core fleet settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `"fleet-output"` |
/// | `batch_timeout_secs` | 1800 (30 minutes) |
/// | `output_timeout_secs` | 300 (5 minutes) |
/// | `no_devices_timeout_secs` | 600 (10 minutes) |
/// | `history_window_days` | 30 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FleetConfig {
    /// Root of every per-device and per-test output file.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Lower bound for the time a single batch may take.
    ///
    /// The effective timeout is the larger of this and the batch's
    /// historical maximum duration.
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_secs: u64,

    /// How long a device may run a batch without producing any output.
    #[serde(default = "default_output_timeout")]
    pub output_timeout_secs: u64,

    /// How long to wait for the first device, and how long an unfinished
    /// pool may go without any device before it is abandoned.
    #[serde(default = "default_no_devices_timeout")]
    pub no_devices_timeout_secs: u64,

    /// Only history newer than this many days feeds the metrics.
    #[serde(default = "default_history_window")]
    pub history_window_days: u32,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            batch_timeout_secs: default_batch_timeout(),
            output_timeout_secs: default_output_timeout(),
            no_devices_timeout_secs: default_no_devices_timeout(),
            history_window_days: default_history_window(),
        }
    }
}

impl FleetConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }

    pub fn output_timeout(&self) -> Duration {
        Duration::from_secs(self.output_timeout_secs)
    }

    pub fn no_devices_timeout(&self) -> Duration {
        Duration::from_secs(self.no_devices_timeout_secs)
    }

    /// Start of the metrics history window.
    pub fn history_since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::days(i64::from(self.history_window_days))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("fleet.batch_timeout_secs", self.batch_timeout_secs),
            ("fleet.output_timeout_secs", self.output_timeout_secs),
            ("fleet.no_devices_timeout_secs", self.no_devices_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("fleet.output_dir", "must not be empty"));
        }
        Ok(())
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("fleet-output")
}

fn default_batch_timeout() -> u64 {
    1800
}

fn default_output_timeout() -> u64 {
    300
}

fn default_no_devices_timeout() -> u64 {
    600
}

fn default_history_window() -> u32 {
    30
}

/// Policy layer selection.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StrategiesConfig {
    #[serde(default)]
    pub pooling: PoolingStrategy,

    #[serde(default)]
    pub sharding: ShardingStrategy,

    #[serde(default)]
    pub sorting: SortingStrategy,

    #[serde(default)]
    pub batching: BatchingStrategy,

    #[serde(default)]
    pub flakiness: FlakinessStrategy,

    #[serde(default)]
    pub retry: RetryStrategy,
}

impl StrategiesConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if let SortingStrategy::ExecutionTime { percentile } = &self.sorting {
            check_percentile("strategies.sorting.percentile", *percentile)?;
        }

        if let BatchingStrategy::FixedSize {
            size,
            duration_secs,
            percentile,
        } = &self.batching
        {
            if *size == 0 {
                return Err(ConfigError::invalid(
                    "strategies.batching.size",
                    "must be at least 1",
                ));
            }
            match (duration_secs, percentile) {
                (Some(duration), Some(percentile)) => {
                    if *duration <= 0.0 {
                        return Err(ConfigError::invalid(
                            "strategies.batching.duration_secs",
                            "must be positive",
                        ));
                    }
                    check_percentile("strategies.batching.percentile", *percentile)?;
                }
                (None, None) => {}
                _ => {
                    return Err(ConfigError::invalid(
                        "strategies.batching",
                        "duration_secs and percentile must be set together",
                    ));
                }
            }
        }

        if let FlakinessStrategy::ProbabilityBased { min_success_rate } = &self.flakiness {
            if !(*min_success_rate > 0.0 && *min_success_rate < 1.0) {
                return Err(ConfigError::invalid(
                    "strategies.flakiness.min_success_rate",
                    "must be between 0 and 1 (exclusive)",
                ));
            }
        }

        if let ShardingStrategy::Count { count } = &self.sharding {
            if *count == 0 {
                return Err(ConfigError::invalid(
                    "strategies.sharding.count",
                    "must be at least 1",
                ));
            }
        }

        if let RetryStrategy::FixedQuota { no_retry, .. } = &self.retry {
            for matcher in no_retry {
                TestMatcher::compile(matcher)?;
            }
        }

        Ok(())
    }
}

fn check_percentile(field: &str, percentile: f64) -> Result<(), ConfigError> {
    if percentile > 0.0 && percentile <= 100.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, "must be in (0, 100]"))
    }
}

/// Historical metrics source.
///
/// ```toml
/// [metrics]
/// type = "history"
/// path = "fleet-history.json"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricsConfig {
    /// No history: every test is stable and instant.
    #[default]
    None,

    /// JSON history file, read before the run and appended after it.
    History(HistoryMetricsConfig),
}

/// Configuration for the JSON history file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HistoryMetricsConfig {
    pub path: PathBuf,
}

/// Device provider configuration.
///
/// The `type` field selects the provider:
///
/// - `"local"`: devices driven by shell commands, here or over ssh
/// - `"stub"`: scripted devices that pass every test (dry runs)
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    Local(LocalProviderConfig),
    Stub(StubProviderConfig),
}

impl ProviderConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let serials: Vec<&str> = match self {
            ProviderConfig::Local(local) => {
                for device in &local.devices {
                    device.validate()?;
                }
                local.devices.iter().map(|d| d.info.serial.as_str()).collect()
            }
            ProviderConfig::Stub(stub) => stub.devices.iter().map(|d| d.serial.as_str()).collect(),
        };

        let mut seen = HashSet::new();
        for serial in serials {
            if serial.trim().is_empty() {
                return Err(ConfigError::invalid("provider.devices.serial", "must not be empty"));
            }
            if !seen.insert(serial) {
                return Err(ConfigError::DuplicateSerial(serial.to_string()));
            }
        }
        Ok(())
    }
}

/// Configuration for the local provider.
///
/// # Example
///
/// ```toml
/// [provider]
/// type = "local"
///
/// [[provider.devices]]
/// serial = "pixel-7"
/// os_version = "34"
/// prepare_command = "adb -s pixel-7 install app.apk"
/// run_command = "./run-instrumentation.sh pixel-7"
///
/// [[provider.devices]]
/// serial = "sim-1"
/// os_version = "17.2"
/// run_command = "./run-xcuitest.sh"
///
/// [provider.devices.ssh]
/// host = "mac-builder-1"
/// user = "ci"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LocalProviderConfig {
    #[serde(default)]
    pub devices: Vec<ProcessDeviceConfig>,
}

/// One device driven by shell commands.
///
/// `run_command` is split into words and the canonical names of the batch's
/// tests are appended as extra arguments. The command reports outcomes on
/// stdout, one line per test:
///
/// ```text
/// STARTED com.example.LoginTest#works
/// PASSED com.example.LoginTest#works
/// FAILED com.example.LoginTest#fails: expected 1 but was 2
/// IGNORED com.example.LoginTest#skipped
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessDeviceConfig {
    /// Identity attributes (`serial`, `model`, `manufacturer`, `os_version`,
    /// `abi`).
    #[serde(flatten)]
    pub info: DeviceInfo,

    /// Run once before the first batch. A non-zero exit loses the device.
    #[serde(default)]
    pub prepare_command: Option<String>,

    /// Run once per batch.
    pub run_command: String,

    /// Working directory for both commands.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables for both commands.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Run the commands on another host.
    #[serde(default)]
    pub ssh: Option<SshConfig>,
}

impl ProcessDeviceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let field = format!("provider.devices[{}].run_command", self.info.serial);
        match shell_words::split(&self.run_command) {
            Ok(words) if !words.is_empty() => {}
            Ok(_) => return Err(ConfigError::invalid(&field, "must not be empty")),
            Err(e) => return Err(ConfigError::invalid(&field, &e.to_string())),
        }
        if let Some(prepare) = &self.prepare_command {
            if let Err(e) = shell_words::split(prepare) {
                let field = format!("provider.devices[{}].prepare_command", self.info.serial);
                return Err(ConfigError::invalid(&field, &e.to_string()));
            }
        }
        if let Some(ssh) = &self.ssh {
            if ssh.host.trim().is_empty() {
                let field = format!("provider.devices[{}].ssh.host", self.info.serial);
                return Err(ConfigError::invalid(&field, "must not be empty"));
            }
        }
        Ok(())
    }
}

/// SSH connection settings for a process device.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `user` | None (ssh default) |
/// | `port` | 22 |
/// | `key_path` | None (ssh default) |
/// | `disable_host_key_check` | false |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SshConfig {
    pub host: String,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Private key; `~` is expanded.
    #[serde(default)]
    pub key_path: Option<String>,

    /// Sets `StrictHostKeyChecking=no`. Only for disposable hosts.
    #[serde(default)]
    pub disable_host_key_check: bool,
}

fn default_ssh_port() -> u16 {
    22
}

/// Configuration for the stub provider.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StubProviderConfig {
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
}

/// Console reporting settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `verbose` | false |
/// | `progress` | true |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Print every test result, not only failures.
    #[serde(default)]
    pub verbose: bool,

    /// Show a progress bar.
    #[serde(default = "default_true")]
    pub progress: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            progress: true,
        }
    }
}

fn default_true() -> bool {
    true
}
