//! Pool coordinator: owns the device actors of one pool.

use std::collections::HashMap;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::PoolSummary;
use super::device_actor::{DeviceActor, DeviceHandle, DeviceSettings};
use super::queue::{QueueEvent, QueueHandle, TestQueue};
use crate::device::{Device, DevicePoolId};

/// Messages handled by a [`PoolCoordinator`].
pub enum PoolMessage {
    AddDevice {
        device: Box<dyn Device>,
        generation: u64,
    },
    RemoveDevice(String),
    /// Sent by an actor once its device is prepared.
    DeviceInitialized { serial: String, generation: u64 },
    /// Sent by an actor after it returned its batch and released its device.
    DeviceLost {
        serial: String,
        generation: u64,
        reason: String,
    },
    /// Stop all devices and complete with whatever ran so far.
    Abandon,
    Terminate(oneshot::Sender<()>),
}

/// Pool notifications for the scheduler.
///
/// `generation` is the number the scheduler gave the device when it
/// connected, so events about a device can be told apart from events about
/// an earlier device with the same serial.
#[derive(Debug)]
pub enum PoolEvent {
    DeviceAdded {
        pool: DevicePoolId,
        serial: String,
        generation: u64,
    },
    DeviceRemoved {
        pool: DevicePoolId,
        serial: String,
        generation: u64,
    },
    /// The device was released without joining the pool.
    DeviceRejected {
        pool: DevicePoolId,
        serial: String,
        generation: u64,
    },
    /// Sent exactly once per pool.
    Completed {
        pool: DevicePoolId,
        summary: PoolSummary,
    },
}

struct Member {
    handle: DeviceHandle,
    generation: u64,
    initializing: bool,
}

pub struct PoolCoordinator {
    pool: DevicePoolId,
    queue: QueueHandle,
    queue_task: JoinHandle<()>,
    members: HashMap<String, Member>,
    settings: DeviceSettings,
    sender: mpsc::UnboundedSender<PoolMessage>,
    events: mpsc::UnboundedSender<PoolEvent>,
    drained: bool,
    completed: bool,
}

impl PoolCoordinator {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<PoolMessage>,
        mut queue_events: mpsc::UnboundedReceiver<QueueEvent>,
    ) {
        loop {
            tokio::select! {
                Some(event) = queue_events.recv() => self.on_queue_event(event).await,
                message = inbox.recv() => match message {
                    Some(PoolMessage::Terminate(ack)) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        return;
                    }
                    Some(message) => self.handle(message).await,
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
            }
        }
    }

    async fn handle(&mut self, message: PoolMessage) {
        match message {
            PoolMessage::AddDevice { device, generation } => {
                self.add_device(device, generation).await
            }
            PoolMessage::RemoveDevice(serial) => self.remove_device(&serial, None, None).await,
            PoolMessage::DeviceInitialized { serial, generation } => {
                if let Some(member) = self.members.get_mut(&serial)
                    && member.generation == generation
                {
                    member.initializing = false;
                }
                self.check_completion().await;
            }
            PoolMessage::DeviceLost {
                serial,
                generation,
                reason,
            } => {
                self.remove_device(&serial, Some(generation), Some(reason))
                    .await
            }
            PoolMessage::Abandon => self.abandon().await,
            PoolMessage::Terminate(_) => {}
        }
    }

    async fn on_queue_event(&mut self, event: QueueEvent) {
        match event {
            QueueEvent::HasWork => {
                for member in self.members.values() {
                    member.handle.wake_up();
                }
            }
            QueueEvent::Drained => {
                self.drained = true;
                self.check_completion().await;
            }
            QueueEvent::TotalChanged(total) => {
                self.settings
                    .reporter
                    .on_total_changed(&self.pool, total)
                    .await;
            }
        }
    }

    async fn add_device(&mut self, mut device: Box<dyn Device>, generation: u64) {
        let info = device.info().clone();
        if self.completed || self.members.contains_key(&info.serial) {
            if self.completed {
                info!(pool = %self.pool, serial = %info.serial, "Pool already complete, releasing device");
            } else {
                warn!(pool = %self.pool, serial = %info.serial, "Device already in pool, releasing duplicate");
            }
            if let Err(e) = device.release().await {
                warn!(pool = %self.pool, serial = %info.serial, error = %e, "Failed to release device");
            }
            let _ = self.events.send(PoolEvent::DeviceRejected {
                pool: self.pool.clone(),
                serial: info.serial,
                generation,
            });
            return;
        }

        let handle = DeviceActor::spawn(
            self.pool.clone(),
            generation,
            device,
            self.queue.clone(),
            self.sender.clone(),
            self.settings.clone(),
        );
        self.members.insert(
            info.serial.clone(),
            Member {
                handle,
                generation,
                initializing: true,
            },
        );
        info!(pool = %self.pool, serial = %info.serial, devices = self.members.len(), "Device added");
        self.settings
            .reporter
            .on_device_connected(&self.pool, &info)
            .await;
        let _ = self.events.send(PoolEvent::DeviceAdded {
            pool: self.pool.clone(),
            serial: info.serial,
            generation,
        });
    }

    /// Terminates one actor. `reason` is set when the device was lost.
    ///
    /// With a `generation`, only that member is removed; a loss reported by
    /// an actor that was already replaced is ignored.
    async fn remove_device(
        &mut self,
        serial: &str,
        generation: Option<u64>,
        reason: Option<String>,
    ) {
        match self.members.get(serial) {
            Some(member) if generation.is_none_or(|g| g == member.generation) => {}
            _ => {
                debug!(pool = %self.pool, %serial, ?generation, "Device not in pool");
                return;
            }
        }
        let Some(member) = self.members.remove(serial) else {
            return;
        };
        let generation = member.generation;
        member.handle.terminate().await;
        info!(pool = %self.pool, %serial, devices = self.members.len(), "Device removed");

        self.settings
            .reporter
            .on_device_disconnected(&self.pool, serial, reason.as_deref())
            .await;
        let _ = self.events.send(PoolEvent::DeviceRemoved {
            pool: self.pool.clone(),
            serial: serial.to_string(),
            generation,
        });
        self.check_completion().await;
    }

    async fn check_completion(&mut self) {
        if self.completed || !self.drained {
            return;
        }
        if self.members.values().any(|m| m.initializing) {
            return;
        }
        self.complete().await;
    }

    async fn complete(&mut self) {
        self.completed = true;
        let summary = self.queue.summary().await.unwrap_or_else(|| PoolSummary {
            pool: self.pool.clone(),
            tests: Vec::new(),
        });
        info!(
            pool = %self.pool,
            passed = summary.passed(),
            failed = summary.failed(),
            not_run = summary.not_run(),
            "Pool complete"
        );
        let _ = self.events.send(PoolEvent::Completed {
            pool: self.pool.clone(),
            summary,
        });
    }

    async fn abandon(&mut self) {
        if self.completed {
            return;
        }
        warn!(pool = %self.pool, "Abandoning pool");
        self.stop_devices().await;
        self.complete().await;
    }

    async fn stop_devices(&mut self) {
        let members: Vec<Member> = self.members.drain().map(|(_, m)| m).collect();
        join_all(members.into_iter().map(|m| m.handle.terminate())).await;
    }

    async fn shutdown(&mut self) {
        self.stop_devices().await;
        self.queue.terminate();
        if let Err(e) = (&mut self.queue_task).await {
            warn!(pool = %self.pool, error = %e, "Queue task panicked");
        }
        debug!(pool = %self.pool, "Pool terminated");
    }
}

/// Scheduler's end of a pool coordinator.
#[derive(Clone)]
pub struct PoolHandle {
    pool: DevicePoolId,
    sender: mpsc::UnboundedSender<PoolMessage>,
}

impl PoolHandle {
    /// Starts the queue actor and the coordinator of one pool.
    pub fn spawn(
        queue: TestQueue,
        settings: DeviceSettings,
        events: mpsc::UnboundedSender<PoolEvent>,
    ) -> Self {
        let pool = queue.pool().clone();
        let (notify, queue_events) = mpsc::unbounded_channel();
        let (queue, queue_task) = QueueHandle::spawn(queue, notify);
        let (sender, inbox) = mpsc::unbounded_channel();

        let coordinator = PoolCoordinator {
            pool: pool.clone(),
            queue,
            queue_task,
            members: HashMap::new(),
            settings,
            sender: sender.clone(),
            events,
            drained: false,
            completed: false,
        };
        tokio::spawn(coordinator.run(inbox, queue_events));

        Self { pool, sender }
    }

    pub fn pool(&self) -> &DevicePoolId {
        &self.pool
    }

    /// Adds a device to the pool. `generation` must be unique per run.
    pub fn add_device(&self, device: Box<dyn Device>, generation: u64) {
        let _ = self
            .sender
            .send(PoolMessage::AddDevice { device, generation });
    }

    pub fn remove_device(&self, serial: &str) {
        let _ = self.sender.send(PoolMessage::RemoveDevice(serial.to_string()));
    }

    pub fn abandon(&self) {
        let _ = self.sender.send(PoolMessage::Abandon);
    }

    /// Stops every device and the queue, and waits for it.
    pub async fn terminate(&self) {
        let (ack, rx) = oneshot::channel();
        if self.sender.send(PoolMessage::Terminate(ack)).is_ok() {
            let _ = rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ExecutionContext;
    use crate::device::stub::{StubBehavior, StubDevice};
    use crate::execution::device_actor::ExecutionTimeouts;
    use crate::execution::queue::QueueSettings;
    use crate::metrics::NoopMetrics;
    use crate::output::FileManager;
    use crate::report::NullReporter;
    use crate::strategy::{
        BatchingStrategy, RetryBudget, RetryPolicy, RetryStrategy, SortingStrategy,
    };
    use crate::test::{Test, TestShard};
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn t(name: &str) -> Test {
        Test::new("com.example", "Suite", name)
    }

    fn spawn_pool(
        tests: Vec<Test>,
        retry: RetryStrategy,
        dir: &TempDir,
    ) -> (PoolHandle, mpsc::UnboundedReceiver<PoolEvent>) {
        let budget = Arc::new(RetryBudget::new(retry.total_quota()));
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
            RetryPolicy::new(&retry, budget).unwrap(),
        );
        let settings = DeviceSettings {
            ctx: ExecutionContext {
                run_id: "run".to_string(),
                files: Arc::new(FileManager::new(dir.path())),
            },
            timeouts: ExecutionTimeouts {
                batch: Duration::from_secs(60),
                output: Duration::from_secs(60),
            },
            reporter: Arc::new(NullReporter),
        };
        let (events_tx, events) = mpsc::unbounded_channel();
        (PoolHandle::spawn(queue, settings, events_tx), events)
    }

    async fn completed(events: &mut mpsc::UnboundedReceiver<PoolEvent>) -> PoolSummary {
        while let Some(event) = events.recv().await {
            if let PoolEvent::Completed { summary, .. } = event {
                return summary;
            }
        }
        panic!("pool stopped without completing");
    }

    #[tokio::test]
    async fn test_pool_completes_once_queue_drains() {
        let dir = TempDir::new().unwrap();
        let (pool, mut events) = spawn_pool(vec![t("1"), t("2")], RetryStrategy::NoRetry, &dir);

        pool.add_device(Box::new(StubDevice::new("s1")), 0);
        pool.add_device(Box::new(StubDevice::new("s2")), 1);

        let summary = completed(&mut events).await;
        assert_eq!(summary.passed(), 2);

        pool.terminate().await;
    }

    #[tokio::test]
    async fn test_lost_device_work_moves_to_survivor() {
        let dir = TempDir::new().unwrap();
        let (pool, mut events) = spawn_pool(vec![t("1")], RetryStrategy::NoRetry, &dir);

        let flaky = StubDevice::new("s1").then(StubBehavior::Lose);
        let flaky_history = flaky.history();
        pool.add_device(Box::new(flaky), 0);

        // Wait for s1 to take the batch and lose it before adding s2.
        let mut removed = false;
        while !removed {
            if let Some(PoolEvent::DeviceRemoved { serial, .. }) = events.recv().await {
                removed = serial == "s1";
            }
        }
        assert_eq!(flaky_history.tests(), vec![t("1")]);

        let survivor = StubDevice::new("s2");
        let history = survivor.history();
        pool.add_device(Box::new(survivor), 1);

        let summary = completed(&mut events).await;
        assert_eq!(summary.passed(), 1);
        assert_eq!(history.tests(), vec![t("1")]);

        pool.terminate().await;
    }

    #[tokio::test]
    async fn test_abandon_reports_not_run() {
        let dir = TempDir::new().unwrap();
        let (pool, mut events) = spawn_pool(vec![t("1"), t("2")], RetryStrategy::NoRetry, &dir);

        pool.add_device(Box::new(StubDevice::new("s1").otherwise(StubBehavior::Hang)), 0);
        pool.abandon();

        let summary = completed(&mut events).await;
        assert_eq!(summary.not_run(), 2);

        pool.terminate().await;
    }

    #[tokio::test]
    async fn test_duplicate_serial_is_ignored() {
        let dir = TempDir::new().unwrap();
        let (pool, mut events) = spawn_pool(vec![t("1")], RetryStrategy::NoRetry, &dir);

        pool.add_device(Box::new(StubDevice::new("s1").otherwise(StubBehavior::Hang)), 0);
        pool.add_device(Box::new(StubDevice::new("s1")), 1);
        pool.abandon();

        let mut added = 0;
        let mut rejected = Vec::new();
        loop {
            match events.recv().await {
                Some(PoolEvent::DeviceAdded { .. }) => added += 1,
                Some(PoolEvent::DeviceRejected { serial, .. }) => rejected.push(serial),
                Some(PoolEvent::Completed { .. }) | None => break,
                Some(PoolEvent::DeviceRemoved { .. }) => {}
            }
        }
        assert_eq!(added, 1);
        assert_eq!(rejected, vec!["s1".to_string()]);

        pool.terminate().await;
    }

    #[tokio::test]
    async fn test_late_device_is_released_and_rejected() {
        let dir = TempDir::new().unwrap();
        let (pool, mut events) = spawn_pool(vec![t("1")], RetryStrategy::NoRetry, &dir);

        pool.add_device(Box::new(StubDevice::new("s1")), 0);
        completed(&mut events).await;

        let late = StubDevice::new("s2");
        let late_history = late.history();
        pool.add_device(Box::new(late), 1);

        loop {
            match events.recv().await {
                Some(PoolEvent::DeviceRejected { serial, .. }) => {
                    assert_eq!(serial, "s2");
                    break;
                }
                Some(PoolEvent::DeviceAdded { serial, .. }) => {
                    panic!("device {} joined a completed pool", serial)
                }
                Some(_) => {}
                None => panic!("pool stopped"),
            }
        }
        assert!(late_history.released());
        assert!(late_history.batches().is_empty());

        pool.terminate().await;
    }

    #[tokio::test]
    async fn test_same_serial_can_rejoin_after_removal() {
        let dir = TempDir::new().unwrap();
        let (pool, mut events) = spawn_pool(vec![t("1")], RetryStrategy::NoRetry, &dir);

        let hung = StubDevice::new("d").otherwise(StubBehavior::Hang);
        let hung_history = hung.history();
        pool.add_device(Box::new(hung), 0);
        while hung_history.batches().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Removal and re-add are queued back to back.
        let replacement = StubDevice::new("d");
        let history = replacement.history();
        pool.remove_device("d");
        pool.add_device(Box::new(replacement), 1);

        let summary = completed(&mut events).await;
        assert_eq!(summary.passed(), 1);
        assert!(hung_history.released());
        assert_eq!(history.tests(), vec![t("1")]);

        pool.terminate().await;
    }
}
