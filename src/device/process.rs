//! Device driven by shell commands, locally or over SSH.
//!
//! The device runs its configured `run_command` once per batch with the
//! canonical test names appended as arguments, and reads outcomes from the
//! command's stdout:
//!
//! | Line | Meaning |
//! |------|---------|
//! | `STARTED <test>` | The test began (resets the unresponsiveness timer) |
//! | `PASSED <test>` | The test passed |
//! | `FAILED <test>: <message>` | The test failed; the message is optional |
//! | `IGNORED <test>` | The test was skipped by the device |
//!
//! Every output line, stdout and stderr, is appended to the device's log file
//! under the output root. Tests without an outcome line are left out of the
//! results.
//!
//! # SSH
//!
//! With an `ssh` section the commands run on a remote host as
//!
//! ```sh
//! ssh [options] user@host "export KEY='value'; cd '/path'; command args..."
//! ```
//!
//! using `BatchMode=yes` so a missing key fails instead of prompting. An exit
//! code of 255 is how `ssh` reports a transport failure and is treated as the
//! device being disconnected.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use super::{
    Device, DeviceError, DeviceInfo, DevicePoolId, DeviceResult, EventSender, ExecutionContext,
    ExecutionEvent, OutputLine,
};
use crate::config::{ProcessDeviceConfig, SshConfig};
use crate::output::FileType;
use crate::test::{Test, TestBatch, TestOutcome, TestResult};

/// Exit code `ssh` uses for its own errors.
const SSH_TRANSPORT_ERROR: i32 = 255;

/// A device whose work is done by spawning commands.
pub struct ProcessDevice {
    config: ProcessDeviceConfig,
    ssh: Option<SshTarget>,
    released: bool,
}

/// Resolved ssh destination and options.
struct SshTarget {
    destination: String,
    opts: Vec<String>,
}

impl SshTarget {
    fn new(config: &SshConfig) -> Self {
        let mut opts = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=30".to_string(),
        ];

        if config.disable_host_key_check {
            opts.push("-o".to_string());
            opts.push("StrictHostKeyChecking=no".to_string());
            opts.push("-o".to_string());
            opts.push("UserKnownHostsFile=/dev/null".to_string());
        }

        if let Some(key_path) = &config.key_path {
            opts.push("-i".to_string());
            opts.push(shellexpand::tilde(key_path).into_owned());
        }

        opts.push("-p".to_string());
        opts.push(config.port.to_string());

        let destination = match &config.user {
            Some(user) => format!("{}@{}", user, config.host),
            None => config.host.clone(),
        };

        Self { destination, opts }
    }
}

/// Outcome line parsed from command output.
#[derive(Debug, PartialEq)]
enum Report {
    Started(Test),
    Finished(Test, TestOutcome, Option<String>),
}

impl ProcessDevice {
    pub fn new(config: ProcessDeviceConfig) -> Self {
        let ssh = config.ssh.as_ref().map(SshTarget::new);
        Self {
            config,
            ssh,
            released: false,
        }
    }

    /// Builds the process for `words`, wrapped in ssh when configured.
    fn command(&self, words: &[String]) -> DeviceResult<tokio::process::Command> {
        let (program, args) = words
            .split_first()
            .ok_or_else(|| DeviceError::ExecFailed("empty command".to_string()))?;

        let mut process = match &self.ssh {
            Some(ssh) => {
                let mut process = tokio::process::Command::new("ssh");
                process.args(&ssh.opts);
                process.arg(&ssh.destination);
                process.arg(self.remote_command(words));
                process
            }
            None => {
                let mut process = tokio::process::Command::new(program);
                process.args(args);
                if let Some(dir) = &self.config.working_dir {
                    process.current_dir(dir);
                }
                process.envs(&self.config.env);
                process
            }
        };

        process.stdin(Stdio::null());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);
        Ok(process)
    }

    /// Remote shell string with environment and working directory setup.
    fn remote_command(&self, words: &[String]) -> String {
        let mut full_cmd = String::new();

        let mut env: Vec<_> = self.config.env.iter().collect();
        env.sort();
        for (key, value) in env {
            full_cmd.push_str(&format!("export {}={}; ", key, shell_words::quote(value)));
        }

        if let Some(dir) = &self.config.working_dir {
            full_cmd.push_str(&format!(
                "cd {}; ",
                shell_words::quote(&dir.to_string_lossy())
            ));
        }

        full_cmd.push_str(&shell_words::join(words));
        full_cmd
    }

    fn split(&self, command: &str) -> DeviceResult<Vec<String>> {
        shell_words::split(command)
            .map_err(|e| DeviceError::ExecFailed(format!("invalid command {:?}: {}", command, e)))
    }

    fn check_transport(&self, code: Option<i32>) -> DeviceResult<()> {
        if self.ssh.is_some() && code == Some(SSH_TRANSPORT_ERROR) {
            return Err(DeviceError::Disconnected(format!(
                "ssh to {} failed",
                self.config.info.serial
            )));
        }
        Ok(())
    }

    async fn open_log(
        ctx: &ExecutionContext,
        pool: &DevicePoolId,
        serial: &str,
    ) -> DeviceResult<(PathBuf, tokio::fs::File)> {
        let path = ctx.files.device_file(FileType::Log, pool, serial)?;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok((path, file))
    }
}

#[async_trait]
impl Device for ProcessDevice {
    fn info(&self) -> &DeviceInfo {
        &self.config.info
    }

    fn healthy(&self) -> bool {
        !self.released
    }

    async fn prepare(&mut self, _ctx: &ExecutionContext) -> DeviceResult<()> {
        let Some(prepare) = &self.config.prepare_command else {
            return Ok(());
        };
        let words = self.split(prepare)?;
        let output = self
            .command(&words)?
            .output()
            .await
            .map_err(|e| DeviceError::PrepareFailed(e.to_string()))?;

        self.check_transport(output.status.code())?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DeviceError::PrepareFailed(format!(
                "{} exited with {}: {}",
                prepare,
                output.status,
                stderr.trim()
            )));
        }
        debug!(serial = %self.config.info.serial, "Prepared device");
        Ok(())
    }

    async fn execute(
        &mut self,
        ctx: &ExecutionContext,
        pool: &DevicePoolId,
        batch: &TestBatch,
        events: EventSender,
    ) -> DeviceResult<Vec<TestResult>> {
        let serial = self.config.info.serial.clone();
        let mut words = self.split(&self.config.run_command)?;
        words.extend(batch.tests.iter().map(Test::name));

        let (log_path, mut log) = Self::open_log(ctx, pool, &serial).await?;
        debug!(%serial, batch = %batch.id, log = %log_path.display(), "Spawning batch command");

        let mut child = self
            .command(&words)?
            .spawn()
            .map_err(|e| DeviceError::ExecFailed(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeviceError::ExecFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DeviceError::ExecFailed("stderr not captured".to_string()))?;

        let stdout_stream =
            tokio_stream::wrappers::LinesStream::new(BufReader::new(stdout).lines())
                .map(|line| OutputLine::Stdout(line.unwrap_or_default()));
        let stderr_stream =
            tokio_stream::wrappers::LinesStream::new(BufReader::new(stderr).lines())
                .map(|line| OutputLine::Stderr(line.unwrap_or_default()));
        let mut lines = stream::select(stdout_stream, stderr_stream);

        let batch_start = Instant::now();
        let mut started: HashMap<Test, Instant> = HashMap::new();
        let mut results: Vec<TestResult> = Vec::new();

        while let Some(line) = lines.next().await {
            let text = match &line {
                OutputLine::Stdout(text) | OutputLine::Stderr(text) => text.clone(),
            };
            log.write_all(text.as_bytes()).await?;
            log.write_all(b"\n").await?;

            if let OutputLine::Stdout(text) = &line {
                match parse_report(text) {
                    Some(Report::Started(test)) => {
                        started.insert(test.clone(), Instant::now());
                        let _ = events.send(ExecutionEvent::TestStarted(test));
                    }
                    Some(Report::Finished(test, outcome, message)) => {
                        let since = started.remove(&test).unwrap_or(batch_start);
                        let mut result = TestResult::new(test, outcome, serial.as_str())
                            .with_duration(since.elapsed());
                        result.message = message;
                        results.push(result);
                    }
                    None => {}
                }
            }
            let _ = events.send(ExecutionEvent::Output(line));
        }
        log.flush().await?;

        let status = child.wait().await?;
        self.check_transport(status.code())?;

        if !status.success() && results.is_empty() {
            return Err(DeviceError::ExecFailed(format!(
                "batch command exited with {} without reporting any test",
                status
            )));
        }
        if !status.success() {
            warn!(%serial, batch = %batch.id, %status, "Batch command exited with failure");
        }
        Ok(results)
    }

    async fn release(&mut self) -> DeviceResult<()> {
        self.released = true;
        Ok(())
    }
}

fn parse_report(line: &str) -> Option<Report> {
    let (keyword, rest) = line.trim().split_once(' ')?;
    let rest = rest.trim();
    match keyword {
        "STARTED" => Test::parse(rest).map(Report::Started),
        "PASSED" => Test::parse(rest).map(|t| Report::Finished(t, TestOutcome::Passed, None)),
        "IGNORED" => Test::parse(rest).map(|t| Report::Finished(t, TestOutcome::Ignored, None)),
        "FAILED" => {
            let (name, message) = match rest.split_once(": ") {
                Some((name, message)) => (name, Some(message.to_string())),
                None => (rest, None),
            };
            Test::parse(name).map(|t| Report::Finished(t, TestOutcome::Failed, message))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::FileManager;
    use crate::test::BatchId;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    /// Echoes one outcome per argument: names ending in `fails` fail.
    const REPORTER: &str = r#"sh -c 'for t in "$@"; do echo "STARTED $t"; case "$t" in *fails) echo "FAILED $t: boom";; *) echo "PASSED $t";; esac; done' sh"#;

    fn config(run_command: &str) -> ProcessDeviceConfig {
        ProcessDeviceConfig {
            info: DeviceInfo::new("local-1"),
            prepare_command: None,
            run_command: run_command.to_string(),
            working_dir: None,
            env: HashMap::new(),
            ssh: None,
        }
    }

    fn context(dir: &TempDir) -> ExecutionContext {
        ExecutionContext {
            run_id: "run".to_string(),
            files: Arc::new(FileManager::new(dir.path())),
        }
    }

    fn batch(tests: Vec<Test>) -> TestBatch {
        TestBatch {
            id: BatchId(1),
            tests,
            expected_duration: Duration::ZERO,
            max_duration: Duration::ZERO,
        }
    }

    #[test]
    fn test_parse_report() {
        let test = Test::new("com.example", "A", "b");
        assert_eq!(
            parse_report("PASSED com.example.A#b"),
            Some(Report::Finished(test.clone(), TestOutcome::Passed, None))
        );
        assert_eq!(
            parse_report("FAILED com.example.A#b: expected 1: got 2"),
            Some(Report::Finished(
                test.clone(),
                TestOutcome::Failed,
                Some("expected 1: got 2".to_string())
            ))
        );
        assert_eq!(
            parse_report("  STARTED com.example.A#b  "),
            Some(Report::Started(test))
        );
        assert_eq!(parse_report("PASSED not-a-test"), None);
        assert_eq!(parse_report("random output"), None);
    }

    #[test]
    fn test_remote_command_quotes_everything() {
        let mut config = config("./run.sh");
        config.working_dir = Some(PathBuf::from("/work dir"));
        config.env.insert("TOKEN".to_string(), "it's".to_string());
        config.ssh = Some(SshConfig {
            host: "mac-1".to_string(),
            user: Some("ci".to_string()),
            port: 2222,
            key_path: None,
            disable_host_key_check: true,
        });
        let device = ProcessDevice::new(config);

        let words = vec!["./run.sh".to_string(), "p.A#b".to_string()];
        assert_eq!(
            device.remote_command(&words),
            "export TOKEN='it'\\''s'; cd '/work dir'; ./run.sh 'p.A#b'"
        );

        let ssh = device.ssh.as_ref().unwrap();
        assert_eq!(ssh.destination, "ci@mac-1");
        assert!(ssh.opts.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(ssh.opts.ends_with(&["-p".to_string(), "2222".to_string()]));
    }

    #[tokio::test]
    async fn test_execute_reports_outcomes_and_writes_log() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        let pool = DevicePoolId::new("omni");
        let mut device = ProcessDevice::new(config(REPORTER));
        let passes = Test::new("p", "C", "passes");
        let fails = Test::new("p", "C", "fails");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let results = device
            .execute(&ctx, &pool, &batch(vec![passes.clone(), fails.clone()]), tx)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].test, passes);
        assert_eq!(results[0].outcome, TestOutcome::Passed);
        assert_eq!(results[1].outcome, TestOutcome::Failed);
        assert_eq!(results[1].message.as_deref(), Some("boom"));

        let mut started = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ExecutionEvent::TestStarted(_)) {
                started += 1;
            }
        }
        assert_eq!(started, 2);

        let log = std::fs::read_to_string(temp_dir.path().join("logs/omni/local-1.log")).unwrap();
        assert!(log.contains("PASSED p.C#passes"));
    }

    #[tokio::test]
    async fn test_failing_command_without_results_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let mut device = ProcessDevice::new(config("sh -c 'exit 3'"));
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = device
            .execute(
                &context(&temp_dir),
                &DevicePoolId::new("omni"),
                &batch(vec![Test::new("p", "C", "m")]),
                tx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::ExecFailed(_)));
    }

    #[tokio::test]
    async fn test_prepare_failure() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = config(REPORTER);
        config.prepare_command = Some("sh -c 'echo nope >&2; exit 1'".to_string());
        let mut device = ProcessDevice::new(config);

        let err = device.prepare(&context(&temp_dir)).await.unwrap_err();
        assert!(matches!(err, DeviceError::PrepareFailed(msg) if msg.contains("nope")));
    }
}
