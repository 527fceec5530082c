// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! A single worker process.
//!
//! Workers speak a line-delimited JSON protocol. For every invocation the pool
//! writes one request line to stdin:
//!
//! ```json
//! {"run_id": "...", "action": {"action_id": "...", "package_id": "...", "name": "...", "entry_point": "..."},
//!  "input": {...}, "artifacts_dir": "/data/runs/<run_id>"}
//! ```
//!
//! and expects one reply line on stdout:
//!
//! ```json
//! {"status": "passed", "result": {...}}
//! {"status": "failed", "error": "message"}
//! ```
//!
//! Every other stdout line is captured as run output. Single-use workers are
//! expected to exit with status 0 after replying; reuse workers wait for the
//! next request line.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::process_pool::ProcessPoolConfig;
use super::traits::{LaunchOptions, Result, RunOutcome, RunnerError};
use crate::registry::ActionRef;

/// How long to wait for the stderr reader to drain after the process exits.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Most stdout, and separately stderr, kept per invocation.
pub const MAX_CAPTURED_BYTES: usize = 1024 * 1024;

/// Longest stdout line read, reply lines included. The rest of a longer line
/// is discarded.
const MAX_LINE_BYTES: u64 = 16 * 1024 * 1024;

const TRUNCATED_MARKER: &str = "\n[output truncated]\n";

/// Append `text` while `buf` is under `limit`. The first cut adds a marker.
fn append_capped(buf: &mut String, text: &str, limit: usize) {
    if buf.len() >= limit {
        return;
    }
    let room = limit - buf.len();
    if text.len() <= room {
        buf.push_str(text);
        return;
    }
    let mut cut = room;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    buf.push_str(&text[..cut]);
    buf.push_str(TRUNCATED_MARKER);
}

/// Next stdout line without its line ending, `None` at end of stream.
async fn read_line_capped(reader: &mut BufReader<ChildStdout>) -> std::io::Result<Option<String>> {
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(MAX_LINE_BYTES)
        .read_until(b'\n', &mut buf)
        .await?;
    if read == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if read as u64 == MAX_LINE_BYTES {
        let mut rest = Vec::new();
        loop {
            rest.clear();
            let skipped = (&mut *reader)
                .take(64 * 1024)
                .read_until(b'\n', &mut rest)
                .await?;
            if skipped == 0 || rest.last() == Some(&b'\n') {
                break;
            }
        }
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

#[derive(Serialize)]
struct WorkerRequest<'a> {
    run_id: &'a str,
    action: &'a ActionRef,
    input: &'a Value,
    artifacts_dir: &'a Path,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ReplyStatus {
    Passed,
    Failed,
}

#[derive(Debug, Deserialize)]
struct WorkerReply {
    status: ReplyStatus,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Parse a stdout line as a protocol reply. Anything else is plain output.
fn parse_reply(line: &str) -> Option<WorkerReply> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// A spawned worker process with piped stdio.
pub(crate) struct Worker {
    id: u64,
    pid: Option<u32>,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    stderr: Arc<Mutex<String>>,
    stderr_task: Option<JoinHandle<()>>,
    invocations: u64,
}

impl Worker {
    /// Spawn a worker from the pool's command line.
    pub(crate) fn spawn(config: &ProcessPoolConfig, id: u64) -> Result<Self> {
        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| RunnerError::SpawnFailed(format!("{}: {}", config.program, e)))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::SpawnFailed("worker stdout was not captured".into()))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::SpawnFailed("worker stderr was not captured".into()))?;

        let stderr = Arc::new(Mutex::new(String::new()));
        let sink = stderr.clone();
        let stderr_task = tokio::spawn(async move {
            // Keeps draining past the cap so the worker never blocks on a full pipe.
            let mut pipe = stderr_pipe;
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let text = String::from_utf8_lossy(&chunk[..n]);
                        append_capped(&mut *sink.lock().await, &text, MAX_CAPTURED_BYTES);
                    }
                }
            }
        });

        let pid = child.id();
        debug!(worker_id = id, pid = ?pid, program = %config.program, "Spawned worker");

        Ok(Self {
            id,
            pid,
            child,
            stdin,
            stdout: BufReader::new(stdout),
            stderr,
            stderr_task: Some(stderr_task),
            invocations: 0,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Returns false once the process has exited.
    pub(crate) fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Run one invocation. Returns the outcome and whether the worker can
    /// take another request.
    pub(crate) async fn invoke(
        &mut self,
        options: &LaunchOptions,
        cancel: &CancellationToken,
        timeout: Duration,
        grace: Duration,
        single_use: bool,
    ) -> (RunOutcome, bool) {
        self.invocations += 1;
        let mut captured = String::new();

        let request = WorkerRequest {
            run_id: &options.run_id,
            action: &options.action,
            input: &options.input,
            artifacts_dir: &options.artifacts_dir,
        };
        let line = match serde_json::to_string(&request) {
            Ok(line) => line,
            Err(e) => return (RunnerError::from(e).into(), true),
        };

        if let Err(e) = self.send(&line).await {
            debug!(worker_id = self.id, error = %e, "Worker rejected request");
            let exit_code = self.wait_exit(grace).await;
            return (self.crashed(exit_code, captured).await, false);
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let reply = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(worker_id = self.id, run_id = %options.run_id, "Cancelling worker");
                    let exit_code = self.terminate(grace).await;
                    let stderr = self.take_stderr(true).await;
                    let outcome = RunOutcome::cancelled("run was cancelled")
                        .with_output(captured, stderr, exit_code);
                    return (outcome, false);
                }
                _ = &mut deadline => {
                    warn!(worker_id = self.id, run_id = %options.run_id, timeout = ?timeout, "Execution timed out, killing worker");
                    let exit_code = self.terminate(grace).await;
                    let stderr = self.take_stderr(true).await;
                    let outcome = RunOutcome::from(RunnerError::Timeout(timeout))
                        .with_output(captured, stderr, exit_code);
                    return (outcome, false);
                }
                line = read_line_capped(&mut self.stdout) => match line {
                    Ok(Some(line)) => match parse_reply(&line) {
                        Some(reply) => break reply,
                        None => {
                            append_capped(&mut captured, &line, MAX_CAPTURED_BYTES);
                            append_capped(&mut captured, "\n", MAX_CAPTURED_BYTES);
                        }
                    },
                    Ok(None) | Err(_) => {
                        let exit_code = self.wait_exit(grace).await;
                        return (self.crashed(exit_code, captured).await, false);
                    }
                },
            }
        };

        let mut outcome = match reply.status {
            ReplyStatus::Passed => RunOutcome::passed(reply.result),
            ReplyStatus::Failed => {
                let mut failed = RunOutcome::failed(
                    reply
                        .error
                        .unwrap_or_else(|| "action reported failure".to_string()),
                );
                failed.result = reply.result;
                failed
            }
        };

        if !single_use {
            let stderr = self.take_stderr(false).await;
            return (outcome.with_output(captured, stderr, None), true);
        }

        // Closing stdin tells a single-use worker there is nothing more to do.
        drop(self.stdin.take());
        let exit_code = self.wait_exit(grace).await;
        let stderr = self.take_stderr(true).await;
        if exit_code != Some(0) {
            outcome.status = cadence_core::status::RunStatus::Failed;
            outcome.error = Some(match (exit_code, outcome.error.take()) {
                (Some(code), Some(err)) => format!("{} (worker exited with code {})", err, code),
                (Some(code), None) => format!("worker exited with code {} after replying", code),
                (None, Some(err)) => format!("{} (worker was killed)", err),
                (None, None) => "worker was killed after replying".to_string(),
            });
        }
        (outcome.with_output(captured, stderr, exit_code), false)
    }

    async fn send(&mut self, line: &str) -> std::io::Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker stdin is closed")
        })?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    async fn crashed(&mut self, exit_code: Option<i32>, captured: String) -> RunOutcome {
        let stderr = self.take_stderr(true).await;
        warn!(worker_id = self.id, exit_code = ?exit_code, "Worker exited without replying");
        let mut outcome = RunOutcome::from(RunnerError::WorkerExited { exit_code, stderr });
        if !captured.is_empty() {
            outcome.stdout = Some(captured);
        }
        outcome
    }

    /// Wait up to `grace` for the process to exit on its own, then terminate it.
    async fn wait_exit(&mut self, grace: Duration) -> Option<i32> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            _ => self.terminate(grace).await,
        }
    }

    /// SIGTERM, wait `grace`, then SIGKILL. Returns the exit code if the
    /// process exited normally.
    pub(crate) async fn terminate(&mut self, grace: Duration) -> Option<i32> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return status.code();
        }

        if let Some(pid) = self.pid {
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!(worker_id = self.id, pid, error = %e, "Failed to send SIGTERM"),
            }

            if let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await {
                return status.code();
            }
            warn!(worker_id = self.id, pid, "Worker ignored SIGTERM, killing");
        }

        if let Err(e) = self.child.kill().await {
            warn!(worker_id = self.id, error = %e, "Failed to kill worker");
        }
        self.child.try_wait().ok().flatten().and_then(|s| s.code())
    }

    /// Take everything written to stderr so far. With `exited`, first give the
    /// reader a moment to drain the pipe.
    async fn take_stderr(&mut self, exited: bool) -> String {
        if exited && let Some(task) = self.stderr_task.take() {
            let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await;
        }
        std::mem::take(&mut *self.stderr.lock().await)
            .trim_end()
            .to_string()
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("invocations", &self.invocations)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_reply_passed() {
        let reply = parse_reply(r#"{"status": "passed", "result": {"n": 1}}"#).unwrap();
        assert!(matches!(reply.status, ReplyStatus::Passed));
        assert_eq!(reply.result, Some(json!({"n": 1})));
    }

    #[test]
    fn test_parse_reply_failed() {
        let reply = parse_reply(r#"  {"status":"failed","error":"boom"}  "#).unwrap();
        assert!(matches!(reply.status, ReplyStatus::Failed));
        assert_eq!(reply.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_parse_reply_ignores_plain_output() {
        assert!(parse_reply("hello world").is_none());
        assert!(parse_reply(r#"{"level": "info", "msg": "progress"}"#).is_none());
        assert!(parse_reply(r#"{"status": "running"}"#).is_none());
    }

    #[test]
    fn test_append_capped() {
        let mut buf = String::new();
        append_capped(&mut buf, "abc", 5);
        append_capped(&mut buf, "def", 5);
        assert_eq!(buf, format!("abcde{}", TRUNCATED_MARKER));

        // Full buffers take nothing more, marker included.
        append_capped(&mut buf, "ghi", 5);
        assert_eq!(buf, format!("abcde{}", TRUNCATED_MARKER));
    }

    #[test]
    fn test_append_capped_respects_char_boundaries() {
        let mut buf = String::new();
        append_capped(&mut buf, "aé", 2);
        assert_eq!(buf, format!("a{}", TRUNCATED_MARKER));
    }

    #[test]
    fn test_request_shape() {
        let action = ActionRef {
            action_id: "pkg.echo".into(),
            package_id: "pkg".into(),
            name: "echo".into(),
            entry_point: "echo:main".into(),
        };
        let input = json!({"x": 1});
        let request = WorkerRequest {
            run_id: "r-1",
            action: &action,
            input: &input,
            artifacts_dir: Path::new("/tmp/runs/r-1"),
        };
        let encoded: Value = serde_json::to_value(&request).unwrap();
        assert_eq!(encoded["run_id"], "r-1");
        assert_eq!(encoded["action"]["entry_point"], "echo:main");
        assert_eq!(encoded["artifacts_dir"], "/tmp/runs/r-1");
    }
}
