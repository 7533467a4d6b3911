//! The per-pool test queue.
//!
//! [`TestQueue`] holds every piece of backlog state for one pool: the pending
//! tests, the batches handed out and not yet reported, the flaky copies still
//! expected, the retry policy and the per-test tallies. It is a plain struct
//! with synchronous methods; [`QueueHandle::spawn`] runs it as an actor so
//! that all mutations are serialized.
//!
//! The actor reads two channels. Results and returned batches travel on
//! their own channel which is always drained before the next batch request
//! is answered, so a retry is queued before any device can ask for work
//! that should include it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::pending::PendingTests;
use super::{FinalStatus, PoolSummary, TestSummary};
use crate::device::DevicePoolId;
use crate::metrics::MetricsProvider;
use crate::strategy::batching::build_batch;
use crate::strategy::{BatchingStrategy, RetryPolicy, SortingStrategy};
use crate::test::{BatchId, Test, TestBatch, TestOutcome, TestResult, TestShard};

/// Strategies and metrics a queue orders and groups with.
#[derive(Clone)]
pub struct QueueSettings {
    pub sorting: SortingStrategy,
    pub batching: BatchingStrategy,
    pub metrics: Arc<dyn MetricsProvider>,

    /// Start of the metrics history window.
    pub since: DateTime<Utc>,
}

struct Outstanding {
    device: String,
    batch: TestBatch,
}

#[derive(Debug, Default)]
struct Tally {
    passed: usize,
    failed: usize,
    ignored: usize,
    skipped: bool,
    last: Option<TestResult>,
}

/// What a report did to the queue.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReportOutcome {
    /// `false` when the batch was not outstanding and the report was dropped.
    pub accepted: bool,

    /// Tests put back into pending.
    pub requeued: usize,
}

/// Authoritative backlog of one pool.
pub struct TestQueue {
    pool: DevicePoolId,
    shard: TestShard,
    settings: QueueSettings,
    retry: RetryPolicy,
    pending: PendingTests,
    outstanding: HashMap<BatchId, Outstanding>,
    flaky_slots: HashMap<Test, usize>,
    tallies: HashMap<Test, Tally>,
    order: Vec<Test>,
    total: usize,
    next_batch: u64,
}

impl TestQueue {
    /// Creates a queue seeded with `shard.tests` and `shard.flaky_tests`.
    ///
    /// `skipped` tests are never queued; they only show up as ignored in the
    /// summary.
    pub fn new(
        pool: DevicePoolId,
        shard: TestShard,
        skipped: Vec<Test>,
        settings: QueueSettings,
        retry: RetryPolicy,
    ) -> Self {
        let mut queue = Self {
            pool,
            total: shard.len(),
            shard,
            settings,
            retry,
            pending: PendingTests::new(),
            outstanding: HashMap::new(),
            flaky_slots: HashMap::new(),
            tallies: HashMap::new(),
            order: Vec::new(),
            next_batch: 0,
        };

        let mut seen = HashSet::new();
        let seeded: Vec<Test> = queue
            .shard
            .tests
            .iter()
            .chain(queue.shard.flaky_tests.iter())
            .cloned()
            .collect();
        for test in seeded {
            if seen.insert(test.clone()) {
                queue.order.push(test.clone());
            }
            queue.enqueue(test);
        }
        for test in &queue.shard.flaky_tests {
            *queue.flaky_slots.entry(test.clone()).or_default() += 1;
        }
        for test in skipped {
            if seen.insert(test.clone()) {
                queue.order.push(test.clone());
            }
            queue.tallies.entry(test).or_default().skipped = true;
        }
        queue
    }

    pub fn pool(&self) -> &DevicePoolId {
        &self.pool
    }

    fn enqueue(&mut self, test: Test) {
        let rank = self
            .settings
            .sorting
            .rank(&test, self.settings.metrics.as_ref(), self.settings.since);
        self.pending.push(test, rank);
    }

    /// Hands the next batch to `device`.
    ///
    /// Returns `None` when nothing is pending, or when every pending entry is
    /// a copy of a test that is already out in another batch.
    pub fn request_next_batch(&mut self, device: &str) -> Option<TestBatch> {
        if self.pending.is_empty() {
            return None;
        }
        let busy: HashSet<Test> = self
            .outstanding
            .values()
            .flat_map(|o| o.batch.tests.iter().cloned())
            .collect();
        let tests = self.settings.batching.next_batch(
            &mut self.pending,
            &busy,
            self.settings.metrics.as_ref(),
            self.settings.since,
        );
        if tests.is_empty() {
            return None;
        }

        let id = BatchId(self.next_batch);
        self.next_batch += 1;
        let batch = build_batch(
            id,
            tests,
            self.settings.metrics.as_ref(),
            self.settings.since,
        );
        debug!(pool = %self.pool, %device, batch = %id, size = batch.len(), "Dispatching batch");
        self.outstanding.insert(
            id,
            Outstanding {
                device: device.to_string(),
                batch: batch.clone(),
            },
        );
        Some(batch)
    }

    /// Records the outcome of an outstanding batch.
    ///
    /// `finished` holds passed and ignored results, `failed` everything
    /// that may be retried. Tests of the batch named in neither list go back
    /// to pending without touching the retry quota.
    pub fn report_results(
        &mut self,
        batch: BatchId,
        device: &str,
        finished: Vec<TestResult>,
        failed: Vec<TestResult>,
    ) -> ReportOutcome {
        let Some(outstanding) = self.outstanding.remove(&batch) else {
            warn!(pool = %self.pool, %device, %batch, "Ignoring report for a batch that is not outstanding");
            return ReportOutcome::default();
        };
        if outstanding.device != device {
            warn!(
                pool = %self.pool,
                %batch,
                expected = %outstanding.device,
                actual = %device,
                "Batch reported by a different device"
            );
        }

        let mut reported: HashSet<Test> = HashSet::new();
        for result in finished {
            if self.admit(&outstanding.batch, &mut reported, &result.test) {
                self.finish(result);
            }
        }

        let failed: Vec<TestResult> = failed
            .into_iter()
            .filter(|r| self.admit(&outstanding.batch, &mut reported, &r.test))
            .collect();
        let retries = self.retry.process(&self.pool, &failed, &self.shard);

        let mut requeued = 0;
        for result in failed {
            let retry = retries.contains(&result.test);
            let test = result.test.clone();
            let tally = self.tallies.entry(test.clone()).or_default();
            tally.failed += 1;
            if tally.passed == 0 {
                tally.last = Some(result);
            }
            if retry {
                debug!(pool = %self.pool, %test, "Retrying failed test");
                self.enqueue(test);
                self.total += 1;
                requeued += 1;
            } else {
                info!(pool = %self.pool, %test, "Test failed without retry");
            }
        }

        for test in outstanding.batch.tests {
            if !reported.contains(&test) {
                debug!(pool = %self.pool, %test, "Test missing from report, requeueing");
                self.enqueue(test);
                requeued += 1;
            }
        }

        ReportOutcome {
            accepted: true,
            requeued,
        }
    }

    /// Whether a reported test belongs to the batch and was not seen yet.
    fn admit(&self, batch: &TestBatch, reported: &mut HashSet<Test>, test: &Test) -> bool {
        if !batch.contains(test) {
            warn!(pool = %self.pool, batch = %batch.id, %test, "Ignoring result for a test outside the batch");
            return false;
        }
        if !reported.insert(test.clone()) {
            warn!(pool = %self.pool, batch = %batch.id, %test, "Ignoring duplicate result");
            return false;
        }
        true
    }

    fn finish(&mut self, result: TestResult) {
        let test = result.test.clone();
        let tally = self.tallies.entry(test.clone()).or_default();
        match result.outcome {
            TestOutcome::Passed => {
                tally.passed += 1;
                tally.last = Some(result);
            }
            _ => {
                tally.ignored += 1;
                if tally.passed == 0 && tally.failed == 0 {
                    tally.last = Some(result);
                }
            }
        }

        if let Some(slots) = self.flaky_slots.get_mut(&test) {
            if *slots > 0 {
                *slots -= 1;
                if self.pending.remove_one(&test) {
                    self.total = self.total.saturating_sub(1);
                    debug!(pool = %self.pool, %test, "Retired a flaky copy");
                }
            }
        }
    }

    /// Puts an outstanding batch back into pending. Consumes no quota.
    ///
    /// Returns the number of tests requeued; `0` if the batch was not
    /// outstanding.
    pub fn return_batch(&mut self, batch: BatchId) -> usize {
        let Some(outstanding) = self.outstanding.remove(&batch) else {
            warn!(pool = %self.pool, %batch, "Ignoring return of a batch that is not outstanding");
            return 0;
        };
        debug!(
            pool = %self.pool,
            device = %outstanding.device,
            %batch,
            "Batch returned"
        );
        let count = outstanding.batch.len();
        for test in outstanding.batch.tests {
            self.enqueue(test);
        }
        count
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// True when nothing is pending and nothing is outstanding. Once drained
    /// a queue stays drained.
    pub fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.outstanding.is_empty()
    }

    /// Runs still expected, for progress reporting.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn pending(&self) -> &PendingTests {
        &self.pending
    }

    /// Tests currently handed out, with multiplicity.
    pub fn outstanding_tests(&self) -> Vec<Test> {
        self.outstanding
            .values()
            .flat_map(|o| o.batch.tests.iter().cloned())
            .collect()
    }

    /// Remaining flaky copies expected for `test`.
    pub fn flaky_slots(&self, test: &Test) -> usize {
        self.flaky_slots.get(test).copied().unwrap_or(0)
    }

    pub fn summary(&self) -> PoolSummary {
        let tests = self
            .order
            .iter()
            .map(|test| {
                let tally = self.tallies.get(test);
                let status = match tally {
                    None => FinalStatus::NotRun,
                    Some(t) if t.skipped => FinalStatus::Ignored,
                    Some(t) if t.passed > 0 && t.failed > 0 => FinalStatus::Flaky,
                    Some(t) if t.passed > 0 => FinalStatus::Passed,
                    Some(t) if t.failed > 0 => FinalStatus::Failed,
                    Some(t) if t.ignored > 0 => FinalStatus::Ignored,
                    Some(_) => FinalStatus::NotRun,
                };
                TestSummary {
                    test: test.clone(),
                    status,
                    attempts: tally.map(|t| t.passed + t.failed + t.ignored).unwrap_or(0),
                    last: tally.and_then(|t| t.last.clone()),
                }
            })
            .collect();
        PoolSummary {
            pool: self.pool.clone(),
            tests,
        }
    }
}

/// Notifications from a queue actor to its coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// Pending tests may be available; idle devices should ask again.
    HasWork,
    /// Nothing pending and nothing outstanding. Sent once.
    Drained,
    /// Runs still expected changed.
    TotalChanged(usize),
}

enum QueueRequest {
    RequestNext {
        device: String,
        reply: oneshot::Sender<Option<TestBatch>>,
    },
    IsEmpty(oneshot::Sender<bool>),
    Summary(oneshot::Sender<PoolSummary>),
    Terminate,
}

enum QueueUpdate {
    Results {
        batch: BatchId,
        device: String,
        finished: Vec<TestResult>,
        failed: Vec<TestResult>,
        ack: oneshot::Sender<()>,
    },
    Return {
        batch: BatchId,
        ack: oneshot::Sender<()>,
    },
}

/// Handle to a running queue actor.
#[derive(Clone)]
pub struct QueueHandle {
    requests: mpsc::UnboundedSender<QueueRequest>,
    updates: mpsc::UnboundedSender<QueueUpdate>,
}

impl QueueHandle {
    /// Runs `queue` as an actor task reporting to `notify`.
    pub fn spawn(
        queue: TestQueue,
        notify: mpsc::UnboundedSender<QueueEvent>,
    ) -> (Self, JoinHandle<()>) {
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_queue(queue, requests_rx, updates_rx, notify));
        (Self { requests, updates }, task)
    }

    /// Asks for the next batch. `None` when nothing is pending or the queue
    /// has stopped.
    pub async fn request_next_batch(&self, device: &str) -> Option<TestBatch> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(QueueRequest::RequestNext {
                device: device.to_string(),
                reply,
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Reports a batch's results and waits until the queue applied them.
    pub async fn report_results(
        &self,
        batch: BatchId,
        device: &str,
        finished: Vec<TestResult>,
        failed: Vec<TestResult>,
    ) {
        let (ack, rx) = oneshot::channel();
        let update = QueueUpdate::Results {
            batch,
            device: device.to_string(),
            finished,
            failed,
            ack,
        };
        if self.updates.send(update).is_ok() {
            let _ = rx.await;
        }
    }

    /// Returns a batch unexecuted and waits until it is back in pending.
    pub async fn return_batch(&self, batch: BatchId) {
        let (ack, rx) = oneshot::channel();
        if self.updates.send(QueueUpdate::Return { batch, ack }).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn is_empty(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.requests.send(QueueRequest::IsEmpty(reply)).is_err() {
            return true;
        }
        rx.await.unwrap_or(true)
    }

    pub async fn summary(&self) -> Option<PoolSummary> {
        let (reply, rx) = oneshot::channel();
        self.requests.send(QueueRequest::Summary(reply)).ok()?;
        rx.await.ok()
    }

    pub fn terminate(&self) {
        let _ = self.requests.send(QueueRequest::Terminate);
    }
}

async fn run_queue(
    mut queue: TestQueue,
    mut requests: mpsc::UnboundedReceiver<QueueRequest>,
    mut updates: mpsc::UnboundedReceiver<QueueUpdate>,
    notify: mpsc::UnboundedSender<QueueEvent>,
) {
    let mut drained = false;
    let mut last_total = queue.total();

    loop {
        if !drained && queue.is_drained() {
            drained = true;
            debug!(pool = %queue.pool, "Queue drained");
            let _ = notify.send(QueueEvent::Drained);
        }

        tokio::select! {
            biased;

            Some(update) = updates.recv() => {
                let requeued = match update {
                    QueueUpdate::Results { batch, device, finished, failed, ack } => {
                        let outcome = queue.report_results(batch, &device, finished, failed);
                        let _ = ack.send(());
                        outcome.requeued
                    }
                    QueueUpdate::Return { batch, ack } => {
                        let requeued = queue.return_batch(batch);
                        let _ = ack.send(());
                        requeued
                    }
                };
                // A settled batch may also unblock copies of its tests.
                if requeued > 0 || !queue.is_empty() {
                    let _ = notify.send(QueueEvent::HasWork);
                }
            }

            request = requests.recv() => match request {
                Some(QueueRequest::RequestNext { device, reply }) => {
                    let _ = reply.send(queue.request_next_batch(&device));
                }
                Some(QueueRequest::IsEmpty(reply)) => {
                    let _ = reply.send(queue.is_empty());
                }
                Some(QueueRequest::Summary(reply)) => {
                    let _ = reply.send(queue.summary());
                }
                Some(QueueRequest::Terminate) | None => break,
            },
        }

        if queue.total() != last_total {
            last_total = queue.total();
            let _ = notify.send(QueueEvent::TotalChanged(last_total));
        }
    }
    debug!(pool = %queue.pool, "Queue stopped");
}
