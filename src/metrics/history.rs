//! JSON-file backed test history.
//!
//! The history file is a single JSON document:
//!
//! ```json
//! {
//!   "runs": [
//!     {
//!       "test": { "package": "com.example", "class": "LoginTest", "method": "works" },
//!       "outcome": "passed",
//!       "duration_ms": 1250,
//!       "timestamp": "2026-01-12T09:30:00Z"
//!     }
//!   ]
//! }
//! ```
//!
//! [`HistoryMetrics`] answers queries from it and [`HistoryRecorder`] appends
//! the results of the current run when it completes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::MetricsProvider;
use crate::device::DevicePoolId;
use crate::execution::RunResult;
use crate::report::Reporter;
use crate::test::{Test, TestOutcome, TestResult};

/// One recorded execution of one test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub test: Test,
    pub outcome: TestOutcome,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// On-disk history document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryFile {
    #[serde(default)]
    pub runs: Vec<HistoryRecord>,
}

impl HistoryFile {
    /// Reads a history file. A missing file is an empty history.
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read history file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse history file: {}", path.display()))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write history file: {}", path.display()))
    }
}

/// Metrics computed from a history file.
///
/// Only runs with a timestamp at or after `since` are considered. Tests
/// without any such run report a success rate of `1.0` and zero duration.
#[derive(Debug, Default)]
pub struct HistoryMetrics {
    runs: HashMap<Test, Vec<HistoryRecord>>,
}

impl HistoryMetrics {
    pub fn load(path: &Path) -> Result<Self> {
        let file = HistoryFile::read(path)?;
        debug!(path = %path.display(), runs = file.runs.len(), "Loaded test history");
        Ok(Self::from_records(file.runs))
    }

    pub fn from_records(records: Vec<HistoryRecord>) -> Self {
        let mut runs: HashMap<Test, Vec<HistoryRecord>> = HashMap::new();
        for record in records {
            runs.entry(record.test.clone()).or_default().push(record);
        }
        Self { runs }
    }

    fn recent<'a>(
        &'a self,
        test: &Test,
        since: DateTime<Utc>,
    ) -> impl Iterator<Item = &'a HistoryRecord> + 'a {
        self.runs
            .get(test)
            .into_iter()
            .flatten()
            .filter(move |r| r.timestamp >= since)
    }
}

impl MetricsProvider for HistoryMetrics {
    fn success_rate(&self, test: &Test, since: DateTime<Utc>) -> f64 {
        let (passed, counted) = self
            .recent(test, since)
            .fold((0usize, 0usize), |(passed, counted), r| match r.outcome {
                TestOutcome::Passed => (passed + 1, counted + 1),
                TestOutcome::Failed | TestOutcome::Incomplete => (passed, counted + 1),
                TestOutcome::Ignored => (passed, counted),
            });
        if counted == 0 {
            1.0
        } else {
            passed as f64 / counted as f64
        }
    }

    fn execution_time(&self, test: &Test, percentile: f64, since: DateTime<Utc>) -> Duration {
        let mut durations: Vec<u64> = self.recent(test, since).map(|r| r.duration_ms).collect();
        durations.sort_unstable();
        nearest_rank(&durations, percentile)
            .map(Duration::from_millis)
            .unwrap_or(Duration::ZERO)
    }
}

/// Nearest-rank percentile of an ascending slice.
fn nearest_rank(sorted: &[u64], percentile: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = ((percentile.clamp(0.0, 100.0) / 100.0) * n as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, n) - 1])
}

/// Reporter that appends every executed result to the history file once the
/// run completes.
pub struct HistoryRecorder {
    path: PathBuf,
    pending: Mutex<Vec<HistoryRecord>>,
}

impl HistoryRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn flush(&self) -> Result<usize> {
        let records = match self.pending.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return Ok(0),
        };
        if records.is_empty() {
            return Ok(0);
        }
        let count = records.len();
        let mut file = HistoryFile::read(&self.path)?;
        file.runs.extend(records);
        file.write(&self.path)?;
        Ok(count)
    }
}

#[async_trait]
impl Reporter for HistoryRecorder {
    async fn on_test_finished(&self, _pool: &DevicePoolId, result: &TestResult) {
        let record = HistoryRecord {
            test: result.test.clone(),
            outcome: result.outcome,
            duration_ms: result.duration.as_millis() as u64,
            timestamp: Utc::now(),
        };
        if let Ok(mut guard) = self.pending.lock() {
            guard.push(record);
        }
    }

    async fn on_run_complete(&self, _result: &RunResult) {
        match self.flush() {
            Ok(count) => debug!(path = %self.path.display(), count, "Recorded test history"),
            Err(e) => warn!("Failed to record test history: {:#}", e),
        }
    }
}
