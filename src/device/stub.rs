//! Scripted device for tests and dry runs.
//!
//! A [`StubDevice`] never touches real hardware. Each `execute` call pops the
//! next [`StubBehavior`] from its script and falls back to a default once
//! the script is exhausted. Every batch it receives is recorded in a shared
//! [`StubHistory`] so callers can inspect what ran where.
//!
//! ```
//! use fleet::device::stub::{StubBehavior, StubDevice};
//!
//! let device = StubDevice::new("stub-1")
//!     .with_os_version("29")
//!     .then(StubBehavior::Lose)
//!     .otherwise(StubBehavior::PassAll);
//! let history = device.history();
//! assert!(history.batches().is_empty());
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    Device, DeviceError, DeviceInfo, DevicePoolId, DeviceResult, EventSender, ExecutionContext,
    ExecutionEvent, OutputLine,
};
use crate::test::{Test, TestBatch, TestOutcome, TestResult};

/// What a stub does with one batch.
#[derive(Debug, Clone)]
pub enum StubBehavior {
    /// Every test passes.
    PassAll,
    /// Every test fails.
    FailAll,
    /// The listed tests fail, the rest pass.
    Fail(Vec<Test>),
    /// The listed tests are left out of the results, the rest pass.
    Drop(Vec<Test>),
    /// The device disappears mid-batch.
    Lose,
    /// The device never answers and never produces output.
    Hang,
}

/// Shared record of the batches a stub executed, in order.
#[derive(Debug, Clone, Default)]
pub struct StubHistory {
    batches: Arc<Mutex<Vec<Vec<Test>>>>,
    released: Arc<AtomicBool>,
}

impl StubHistory {
    pub fn batches(&self) -> Vec<Vec<Test>> {
        self.batches
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Every test received, flattened, with multiplicity.
    pub fn tests(&self) -> Vec<Test> {
        self.batches().into_iter().flatten().collect()
    }

    /// Whether the stub was released.
    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn record(&self, batch: &TestBatch) {
        if let Ok(mut guard) = self.batches.lock() {
            guard.push(batch.tests.clone());
        }
    }
}

/// A device with scripted outcomes.
pub struct StubDevice {
    info: DeviceInfo,
    script: VecDeque<StubBehavior>,
    default: StubBehavior,
    fail_prepare: bool,
    delay: Duration,
    history: StubHistory,
    released: bool,
}

impl StubDevice {
    pub fn new(serial: impl Into<String>) -> Self {
        Self::from_info(DeviceInfo::new(serial))
    }

    pub fn from_info(info: DeviceInfo) -> Self {
        Self {
            info,
            script: VecDeque::new(),
            default: StubBehavior::PassAll,
            fail_prepare: false,
            delay: Duration::ZERO,
            history: StubHistory::default(),
            released: false,
        }
    }

    pub fn with_os_version(mut self, version: impl Into<String>) -> Self {
        self.info.os_version = version.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.info.model = model.into();
        self
    }

    /// Queues a behavior for the next unscripted batch.
    pub fn then(mut self, behavior: StubBehavior) -> Self {
        self.script.push_back(behavior);
        self
    }

    /// Sets the behavior used once the script runs out.
    pub fn otherwise(mut self, behavior: StubBehavior) -> Self {
        self.default = behavior;
        self
    }

    /// Makes `prepare` fail.
    pub fn failing_prepare(mut self) -> Self {
        self.fail_prepare = true;
        self
    }

    /// Adds a pause before each batch completes.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn history(&self) -> StubHistory {
        self.history.clone()
    }
}

#[async_trait]
impl Device for StubDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn healthy(&self) -> bool {
        !self.released
    }

    async fn prepare(&mut self, _ctx: &ExecutionContext) -> DeviceResult<()> {
        if self.fail_prepare {
            return Err(DeviceError::PrepareFailed(format!(
                "stub {} refused to prepare",
                self.info.serial
            )));
        }
        Ok(())
    }

    async fn execute(
        &mut self,
        _ctx: &ExecutionContext,
        _pool: &DevicePoolId,
        batch: &TestBatch,
        events: EventSender,
    ) -> DeviceResult<Vec<TestResult>> {
        self.history.record(batch);
        let behavior = self
            .script
            .pop_front()
            .unwrap_or_else(|| self.default.clone());
        let serial = self.info.serial.clone();

        match behavior {
            StubBehavior::Hang => return std::future::pending().await,
            StubBehavior::Lose => {
                let _ = events.send(ExecutionEvent::Output(OutputLine::Stderr(
                    "device offline".to_string(),
                )));
                return Err(DeviceError::Disconnected(serial));
            }
            _ => {}
        }

        for test in &batch.tests {
            let _ = events.send(ExecutionEvent::TestStarted(test.clone()));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        Ok(batch
            .tests
            .iter()
            .filter_map(|test| {
                outcome_for(&behavior, test)
                    .map(|outcome| TestResult::new(test.clone(), outcome, serial.as_str()))
            })
            .collect())
    }

    async fn release(&mut self) -> DeviceResult<()> {
        self.released = true;
        self.history.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Outcome a behavior assigns to one test; `None` leaves it unreported.
fn outcome_for(behavior: &StubBehavior, test: &Test) -> Option<TestOutcome> {
    match behavior {
        StubBehavior::FailAll => Some(TestOutcome::Failed),
        StubBehavior::Fail(failing) if failing.contains(test) => Some(TestOutcome::Failed),
        StubBehavior::Drop(dropped) if dropped.contains(test) => None,
        _ => Some(TestOutcome::Passed),
    }
}
