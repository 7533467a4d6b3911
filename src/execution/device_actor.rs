//! One actor per connected device.
//!
//! The actor prepares its device, then pulls batches from the pool's queue
//! until the queue is empty and parks in `Waiting` until the coordinator
//! wakes it up. Any device failure, timeout or cancellation is device loss:
//! the in-flight batch goes back to the queue before the loss is reported.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::pool::PoolMessage;
use super::queue::QueueHandle;
use crate::device::{
    Device, DeviceError, DevicePoolId, DeviceStatus, ExecutionContext, ExecutionEvent,
};
use crate::report::Reporter;
use crate::test::{TestBatch, TestOutcome, TestResult};

/// Limits applied to every batch execution.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionTimeouts {
    /// Lower bound of the whole-batch limit; raised to the batch's
    /// historical maximum duration when that is larger.
    pub batch: Duration,

    /// Longest allowed silence between two execution events.
    pub output: Duration,
}

/// What every actor of a pool shares.
#[derive(Clone)]
pub struct DeviceSettings {
    pub ctx: ExecutionContext,
    pub timeouts: ExecutionTimeouts,
    pub reporter: Arc<dyn Reporter>,
}

pub enum DeviceMessage {
    /// New work may be pending. Only acted upon while `Waiting`.
    WakeUp,
    Status(oneshot::Sender<DeviceStatus>),
    /// Release the device and stop. Acknowledged once released.
    Terminate(oneshot::Sender<()>),
}

enum BatchEnd {
    Finished(Vec<TestResult>),
    Lost(DeviceError),
    Cancelled,
}

pub struct DeviceActor {
    pool: DevicePoolId,
    generation: u64,
    device: Box<dyn Device>,
    serial: String,
    status: DeviceStatus,
    released: bool,
    queue: QueueHandle,
    coordinator: mpsc::UnboundedSender<PoolMessage>,
    settings: DeviceSettings,
    cancel: CancellationToken,
}

impl DeviceActor {
    /// Spawns the actor. It initializes its device right away.
    ///
    /// `generation` tags every message the actor sends its coordinator, so
    /// a device that reconnects under the same serial is never confused
    /// with its predecessor.
    pub fn spawn(
        pool: DevicePoolId,
        generation: u64,
        device: Box<dyn Device>,
        queue: QueueHandle,
        coordinator: mpsc::UnboundedSender<PoolMessage>,
        settings: DeviceSettings,
    ) -> DeviceHandle {
        let serial = device.info().serial.clone();
        let cancel = CancellationToken::new();
        let (sender, inbox) = mpsc::unbounded_channel();

        let actor = DeviceActor {
            pool,
            generation,
            device,
            serial: serial.clone(),
            status: DeviceStatus::Connected,
            released: false,
            queue,
            coordinator,
            settings,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(actor.run(inbox));

        DeviceHandle {
            serial,
            sender,
            cancel,
            task,
        }
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<DeviceMessage>) {
        self.initialize().await;

        while let Some(message) = inbox.recv().await {
            match message {
                DeviceMessage::WakeUp => self.wake_up().await,
                DeviceMessage::Status(reply) => {
                    let _ = reply.send(self.status);
                }
                DeviceMessage::Terminate(ack) => {
                    self.release().await;
                    let _ = ack.send(());
                    return;
                }
            }
        }
        self.release().await;
    }

    async fn initialize(&mut self) {
        self.status = DeviceStatus::Initializing;
        debug!(pool = %self.pool, serial = %self.serial, "Preparing device");

        let prepared = tokio::select! {
            result = self.device.prepare(&self.settings.ctx) => result,
            _ = self.cancel.cancelled() => {
                self.status = DeviceStatus::Terminated;
                return;
            }
        };

        match prepared {
            Ok(()) => {
                info!(pool = %self.pool, serial = %self.serial, "Device ready");
                self.status = DeviceStatus::Ready;
                let _ = self
                    .coordinator
                    .send(PoolMessage::DeviceInitialized {
                        serial: self.serial.clone(),
                        generation: self.generation,
                    });
                self.pull_work().await;
            }
            Err(e) => self.lose(None, e).await,
        }
    }

    async fn wake_up(&mut self) {
        if self.status == DeviceStatus::Waiting {
            self.pull_work().await;
        } else {
            trace!(serial = %self.serial, status = ?self.status, "Ignoring wake-up");
        }
    }

    /// Requests and executes batches until the queue has nothing to hand out.
    async fn pull_work(&mut self) {
        loop {
            if self.cancel.is_cancelled() || self.status == DeviceStatus::Terminated {
                return;
            }
            if !self.device.healthy() {
                self.lose(None, DeviceError::Disconnected("device unhealthy".to_string()))
                    .await;
                return;
            }

            match self.queue.request_next_batch(&self.serial).await {
                Some(batch) => {
                    if !self.execute_batch(batch).await {
                        return;
                    }
                }
                None => {
                    debug!(pool = %self.pool, serial = %self.serial, "No work, waiting");
                    self.status = DeviceStatus::Waiting;
                    return;
                }
            }
        }
    }

    /// Runs one batch. Returns `false` when the device can take no more work.
    async fn execute_batch(&mut self, batch: TestBatch) -> bool {
        self.status = DeviceStatus::Running;
        self.settings
            .reporter
            .on_batch_started(&self.pool, &self.serial, &batch)
            .await;

        match self.run_device(&batch).await {
            BatchEnd::Finished(results) => {
                self.report(&batch, results).await;
                self.status = DeviceStatus::Ready;
                true
            }
            BatchEnd::Lost(e) => {
                self.lose(Some(batch), e).await;
                false
            }
            BatchEnd::Cancelled => {
                debug!(pool = %self.pool, serial = %self.serial, batch = %batch.id, "Execution cancelled");
                self.queue.return_batch(batch.id).await;
                self.status = DeviceStatus::Ready;
                false
            }
        }
    }

    async fn run_device(&mut self, batch: &TestBatch) -> BatchEnd {
        let (events, mut events_rx) = mpsc::unbounded_channel::<ExecutionEvent>();
        let timeouts = self.settings.timeouts;
        let batch_limit = timeouts.batch.max(batch.max_duration);
        let started = Instant::now();
        let batch_deadline = started + batch_limit;
        let mut output_deadline = started + timeouts.output;
        let mut events_open = true;

        let execution = self
            .device
            .execute(&self.settings.ctx, &self.pool, batch, events);
        tokio::pin!(execution);

        loop {
            tokio::select! {
                result = &mut execution => {
                    return match result {
                        Ok(results) => BatchEnd::Finished(results),
                        Err(e) => BatchEnd::Lost(e),
                    };
                }
                event = events_rx.recv(), if events_open => match event {
                    Some(ExecutionEvent::TestStarted(test)) => {
                        output_deadline = Instant::now() + timeouts.output;
                        trace!(serial = %self.serial, %test, "Test started");
                    }
                    Some(ExecutionEvent::Output(_)) => {
                        output_deadline = Instant::now() + timeouts.output;
                    }
                    None => events_open = false,
                },
                _ = sleep_until(output_deadline) => {
                    return BatchEnd::Lost(DeviceError::Timeout(format!(
                        "no output for {:?}",
                        timeouts.output
                    )));
                }
                _ = sleep_until(batch_deadline) => {
                    return BatchEnd::Lost(DeviceError::Timeout(format!(
                        "batch exceeded {:?}",
                        batch_limit
                    )));
                }
                _ = self.cancel.cancelled() => return BatchEnd::Cancelled,
            }
        }
    }

    /// Splits results into finished and failed and forwards them.
    ///
    /// Tests of the batch without a result are reported as incomplete.
    async fn report(&mut self, batch: &TestBatch, results: Vec<TestResult>) {
        let mut seen = HashSet::new();
        let mut finished = Vec::new();
        let mut failed = Vec::new();

        for result in results {
            if !batch.contains(&result.test) || !seen.insert(result.test.clone()) {
                warn!(
                    pool = %self.pool,
                    serial = %self.serial,
                    test = %result.test,
                    "Dropping unexpected result"
                );
                continue;
            }
            self.settings
                .reporter
                .on_test_finished(&self.pool, &result)
                .await;
            if result.outcome.is_finished() {
                finished.push(result);
            } else {
                failed.push(result);
            }
        }

        for test in &batch.tests {
            if seen.contains(test) {
                continue;
            }
            let result = TestResult::new(test.clone(), TestOutcome::Incomplete, self.serial.as_str())
                .with_message("no result reported");
            self.settings
                .reporter
                .on_test_finished(&self.pool, &result)
                .await;
            failed.push(result);
        }

        debug!(
            pool = %self.pool,
            serial = %self.serial,
            batch = %batch.id,
            finished = finished.len(),
            failed = failed.len(),
            "Batch complete"
        );
        self.queue
            .report_results(batch.id, &self.serial, finished, failed)
            .await;
    }

    /// Gives the batch back, releases the device and reports the loss.
    async fn lose(&mut self, batch: Option<TestBatch>, error: DeviceError) {
        warn!(pool = %self.pool, serial = %self.serial, error = %error, "Device lost");
        if let Some(batch) = batch {
            self.queue.return_batch(batch.id).await;
        }
        self.release().await;
        let _ = self.coordinator.send(PoolMessage::DeviceLost {
            serial: self.serial.clone(),
            generation: self.generation,
            reason: error.to_string(),
        });
    }

    async fn release(&mut self) {
        self.status = DeviceStatus::Terminated;
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.device.release().await {
            warn!(serial = %self.serial, error = %e, "Failed to release device");
        }
    }
}

/// Owner's end of a device actor.
pub struct DeviceHandle {
    serial: String,
    sender: mpsc::UnboundedSender<DeviceMessage>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DeviceHandle {
    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn wake_up(&self) {
        let _ = self.sender.send(DeviceMessage::WakeUp);
    }

    pub async fn status(&self) -> DeviceStatus {
        let (reply, rx) = oneshot::channel();
        if self.sender.send(DeviceMessage::Status(reply)).is_err() {
            return DeviceStatus::Terminated;
        }
        rx.await.unwrap_or(DeviceStatus::Terminated)
    }

    /// Cancels in-flight work and stops the actor.
    ///
    /// Resolves after any in-flight batch went back to the queue and the
    /// device was released.
    pub async fn terminate(self) {
        self.cancel.cancel();
        let (ack, rx) = oneshot::channel();
        if self.sender.send(DeviceMessage::Terminate(ack)).is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = self.task.await {
            warn!(serial = %self.serial, error = %e, "Device actor panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::stub::{StubBehavior, StubDevice};
    use crate::execution::queue::{QueueEvent, QueueSettings, TestQueue};
    use crate::metrics::NoopMetrics;
    use crate::output::FileManager;
    use crate::report::NullReporter;
    use crate::strategy::{BatchingStrategy, RetryBudget, RetryPolicy, RetryStrategy, SortingStrategy};
    use crate::test::{Test, TestShard};
    use chrono::Utc;
    use tempfile::TempDir;

    fn t(name: &str) -> Test {
        Test::new("com.example", "Suite", name)
    }

    struct Harness {
        queue: QueueHandle,
        queue_events: mpsc::UnboundedReceiver<QueueEvent>,
        coordinator: mpsc::UnboundedSender<PoolMessage>,
        messages: mpsc::UnboundedReceiver<PoolMessage>,
        settings: DeviceSettings,
        _dir: TempDir,
    }

    fn harness(tests: Vec<Test>, output_timeout: Duration) -> Harness {
        let dir = TempDir::new().unwrap();
        let budget = Arc::new(RetryBudget::new(0));
        let queue = TestQueue::new(
            DevicePoolId::new("omni"),
            TestShard::new(tests),
            Vec::new(),
            QueueSettings {
                sorting: SortingStrategy::None,
                batching: BatchingStrategy::Isolate,
                metrics: Arc::new(NoopMetrics),
                since: Utc::now(),
            },
            RetryPolicy::new(&RetryStrategy::NoRetry, budget).unwrap(),
        );
        let (notify, queue_events) = mpsc::unbounded_channel();
        let (queue, _task) = QueueHandle::spawn(queue, notify);
        let (coordinator, messages) = mpsc::unbounded_channel();
        let settings = DeviceSettings {
            ctx: ExecutionContext {
                run_id: "run".to_string(),
                files: Arc::new(FileManager::new(dir.path())),
            },
            timeouts: ExecutionTimeouts {
                batch: Duration::from_secs(60),
                output: output_timeout,
            },
            reporter: Arc::new(NullReporter),
        };
        Harness {
            queue,
            queue_events,
            coordinator,
            messages,
            settings,
            _dir: dir,
        }
    }

    impl Harness {
        fn spawn(&self, device: StubDevice) -> DeviceHandle {
            DeviceActor::spawn(
                DevicePoolId::new("omni"),
                0,
                Box::new(device),
                self.queue.clone(),
                self.coordinator.clone(),
                self.settings.clone(),
            )
        }

        async fn drained(&mut self) {
            while let Some(event) = self.queue_events.recv().await {
                if event == QueueEvent::Drained {
                    return;
                }
            }
            panic!("queue stopped before draining");
        }
    }

    #[tokio::test]
    async fn test_pulls_until_queue_is_empty() {
        let mut h = harness(vec![t("1"), t("2"), t("3")], Duration::from_secs(60));
        let device = StubDevice::new("s1");
        let history = device.history();
        let handle = h.spawn(device);

        h.drained().await;
        assert!(matches!(
            h.messages.recv().await,
            Some(PoolMessage::DeviceInitialized { serial, generation: 0 }) if serial == "s1"
        ));
        assert_eq!(history.tests(), vec![t("1"), t("2"), t("3")]);
        assert_eq!(handle.status().await, DeviceStatus::Waiting);
        assert_eq!(h.queue.summary().await.unwrap().passed(), 3);

        handle.terminate().await;
    }

    #[tokio::test]
    async fn test_failed_prepare_is_device_loss() {
        let mut h = harness(vec![t("1")], Duration::from_secs(60));
        let handle = h.spawn(StubDevice::new("s1").failing_prepare());

        match h.messages.recv().await {
            Some(PoolMessage::DeviceLost { serial, reason, .. }) => {
                assert_eq!(serial, "s1");
                assert!(reason.contains("prepare"));
            }
            _ => panic!("expected device loss"),
        }
        assert_eq!(handle.status().await, DeviceStatus::Terminated);
        assert!(!h.queue.is_empty().await);

        handle.terminate().await;
    }

    #[tokio::test]
    async fn test_lost_batch_returns_to_queue_before_loss_is_reported() {
        let mut h = harness(vec![t("1")], Duration::from_secs(60));
        let handle = h.spawn(StubDevice::new("s1").then(StubBehavior::Lose));

        let _initialized = h.messages.recv().await;
        assert!(matches!(
            h.messages.recv().await,
            Some(PoolMessage::DeviceLost { .. })
        ));
        assert!(!h.queue.is_empty().await);
        assert_eq!(h.queue.summary().await.unwrap().not_run(), 1);

        handle.terminate().await;
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let mut h = harness(vec![t("1")], Duration::from_millis(50));
        let handle = h.spawn(StubDevice::new("s1").then(StubBehavior::Hang));

        let _initialized = h.messages.recv().await;
        match h.messages.recv().await {
            Some(PoolMessage::DeviceLost { reason, .. }) => assert!(reason.contains("no output")),
            _ => panic!("expected device loss"),
        }
        assert!(!h.queue.is_empty().await);

        handle.terminate().await;
    }

    #[tokio::test]
    async fn test_terminate_returns_in_flight_batch() {
        let h = harness(vec![t("1")], Duration::from_secs(60));
        let device = StubDevice::new("s1").then(StubBehavior::Hang);
        let history = device.history();
        let handle = h.spawn(device);

        while history.batches().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.terminate().await;

        assert!(!h.queue.is_empty().await);
        let batch = h.queue.request_next_batch("s2").await.unwrap();
        assert_eq!(batch.tests, vec![t("1")]);
    }

    #[tokio::test]
    async fn test_missing_results_are_incomplete() {
        let mut h = harness(vec![t("1")], Duration::from_secs(60));
        let handle = h.spawn(StubDevice::new("s1").then(StubBehavior::Drop(vec![t("1")])));

        h.drained().await;
        let summary = h.queue.summary().await.unwrap();
        assert_eq!(summary.failed(), 1);
        assert_eq!(
            summary.tests[0].last.as_ref().map(|r| r.outcome),
            Some(TestOutcome::Incomplete)
        );

        handle.terminate().await;
    }

    #[tokio::test]
    async fn test_wake_up_resumes_waiting_device() {
        let mut h = harness(vec![t("1")], Duration::from_secs(60));
        let first = h.spawn(StubDevice::new("s1").then(StubBehavior::Hang));
        let second = StubDevice::new("s2");
        let second_history = second.history();
        let second = h.spawn(second);

        // s1 holds the only test, so s2 parks.
        while second.status().await != DeviceStatus::Waiting {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        first.terminate().await;
        second.wake_up();

        h.drained().await;
        assert_eq!(second_history.tests(), vec![t("1")]);
        second.terminate().await;
    }
}
