//! Device capability traits and shared device types.
//!
//! A [`Device`] is anything tests can be executed on: a phone attached over a
//! device bridge, a simulator on a remote host, a process on this machine or
//! a scripted stub. The execution engine only talks to devices through this
//! trait; how commands physically reach the device stays inside the
//! implementation.
//!
//! ```text
//!   DeviceActor                         Device
//!       │ prepare(ctx) ───────────────────►│  install, boot checks
//!       │                                  │
//!       │ execute(ctx, pool, batch, tx) ──►│
//!       │◄──── ExecutionEvent (tx) ────────│  output lines, test started
//!       │◄──── Vec<TestResult> ────────────│
//!       │                                  │
//!       │ release() ──────────────────────►│
//! ```
//!
//! # Built-in Devices
//!
//! | Device | Module | Description |
//! |--------|--------|-------------|
//! | Process | [`process`] | Runs a configured command locally or over `ssh` |
//! | Stub | [`stub`] | Scripted outcomes, for tests and dry runs |

pub mod process;
pub mod stub;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::output::FileManager;
use crate::test::{Test, TestBatch, TestResult};

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors raised by a device capability.
///
/// Every variant means the device itself failed, not a test. The device
/// actor treats all of them as device loss.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Preparing the device (installing artifacts, boot checks) failed.
    #[error("Failed to prepare device: {0}")]
    PrepareFailed(String),

    /// The execution command could not be started or its transport failed.
    #[error("Failed to execute batch: {0}")]
    ExecFailed(String),

    /// The device stopped responding in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The device went away.
    #[error("Device disconnected: {0}")]
    Disconnected(String),

    /// I/O error while talking to the device or writing its output.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Device-specific error not covered by other variants.
    #[error("Device error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Name of a device pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DevicePoolId(pub String);

impl DevicePoolId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DevicePoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity attributes of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub serial: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub abi: String,
}

impl DeviceInfo {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            model: String::new(),
            manufacturer: String::new(),
            os_version: String::new(),
            abi: String::new(),
        }
    }
}

/// Lifecycle state of a device actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Connected,
    Initializing,
    Ready,
    Waiting,
    Running,
    Terminated,
}

impl DeviceStatus {
    /// Returns `true` while the device holds or is about to hold work.
    pub fn is_busy(&self) -> bool {
        matches!(self, DeviceStatus::Initializing | DeviceStatus::Running)
    }
}

/// A line of device output.
#[derive(Debug, Clone)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Progress signal emitted by a device while it executes a batch.
///
/// Any event counts as a sign of life for the unresponsiveness timeout.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    Output(OutputLine),
    TestStarted(Test),
}

/// Sender half handed to [`Device::execute`].
pub type EventSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Everything a device may need from the run while preparing and executing.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Unique id of this run, useful for tagging remote artifacts.
    pub run_id: String,

    /// Sink for per-device and per-test output files.
    pub files: Arc<FileManager>,
}

/// A test execution device.
///
/// Implementations must tolerate repeated sequential `execute` calls from
/// the same actor. They are never called concurrently.
#[async_trait]
pub trait Device: Send {
    /// Identity attributes, stable for the device's lifetime.
    fn info(&self) -> &DeviceInfo;

    /// Whether the device is still fit to receive work.
    fn healthy(&self) -> bool {
        true
    }

    /// Prepares the device for the run.
    async fn prepare(&mut self, ctx: &ExecutionContext) -> DeviceResult<()>;

    /// Executes a batch and returns per-test results.
    ///
    /// Tests the device could not report on may be left out of the
    /// returned list; the caller treats them as incomplete. Returning an
    /// error means the device was lost.
    async fn execute(
        &mut self,
        ctx: &ExecutionContext,
        pool: &DevicePoolId,
        batch: &TestBatch,
        events: EventSender,
    ) -> DeviceResult<Vec<TestResult>>;

    /// Releases the device. Must be idempotent.
    async fn release(&mut self) -> DeviceResult<()> {
        Ok(())
    }
}
