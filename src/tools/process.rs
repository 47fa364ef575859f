//! Subprocess execution with hard deadlines and process-group teardown.
//!
//! Every child is placed in its own process group. When the deadline passes
//! or the run is cancelled, the whole group receives SIGTERM, then SIGKILL
//! after the grace period, so grandchildren (test runners, interpreters) do
//! not outlive the call. Dropping an in-flight call kills the group as well.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::errors::ToolError;
use crate::util::truncate_utf8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Limits applied to one subprocess.
#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub max_output_bytes: usize,
}

/// Kills the child's process group unless disarmed.
struct ProcessGroupGuard {
    pgid: Option<i32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|p| i32::try_from(p).ok()),
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }

    fn signal(&self, signal: i32) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            // SAFETY: killpg only sends a signal; an exited group yields ESRCH.
            unsafe {
                libc::killpg(pgid, signal);
            }
        }
        #[cfg(not(unix))]
        let _ = signal;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        self.signal(libc::SIGKILL);
    }
}

/// Spawn `command` and wait for it under `limits`, honouring `cancel`.
pub async fn run_process(
    mut command: Command,
    tool: &'static str,
    limits: ProcessLimits,
    cancel: &CancellationToken,
) -> Result<ProcessOutput, ToolError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let started = Instant::now();
    let child = command
        .spawn()
        .map_err(|source| ToolError::Io { tool, source })?;
    let mut guard = ProcessGroupGuard::new(child.id());
    let wait = child.wait_with_output();
    tokio::pin!(wait);

    let interrupted = tokio::select! {
        output = &mut wait => {
            guard.disarm();
            let output = output.map_err(|source| ToolError::Io { tool, source })?;
            return Ok(ProcessOutput {
                exit_code: output.status.code(),
                success: output.status.success(),
                stdout: bounded(&output.stdout, limits.max_output_bytes),
                stderr: bounded(&output.stderr, limits.max_output_bytes),
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }
        _ = tokio::time::sleep(limits.timeout) => ToolError::Timeout { tool, after: limits.timeout },
        _ = cancel.cancelled() => ToolError::Cancelled { tool },
    };

    #[cfg(unix)]
    {
        guard.signal(libc::SIGTERM);
        let _ = tokio::time::timeout(limits.kill_grace, &mut wait).await;
    }
    // Guard drop delivers SIGKILL to anything still alive in the group.
    drop(guard);
    tracing::warn!(tool, error = %interrupted, "subprocess torn down");
    Err(interrupted)
}

fn bounded(bytes: &[u8], max_output_bytes: usize) -> String {
    truncate_utf8(&String::from_utf8_lossy(bytes), max_output_bytes)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn limits(timeout_ms: u64) -> ProcessLimits {
        ProcessLimits {
            timeout: Duration::from_millis(timeout_ms),
            kill_grace: Duration::from_millis(100),
            max_output_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn test_run_process_captures_output() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo hello; echo oops >&2; exit 3"]);
        let output = run_process(command, "sandbox_exec", limits(5_000), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success);
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_run_process_times_out_within_bound() {
        let mut command = Command::new("sh");
        command.args(["-c", "sleep 30"]);
        let started = Instant::now();
        let err = run_process(command, "sandbox_exec", limits(200), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_run_process_kills_grandchildren_on_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("survived");
        let script = format!("(sleep 1; touch {}) & wait", marker.display());
        let mut command = Command::new("sh");
        command.args(["-c", &script]);
        let err = run_process(command, "sandbox_exec", limits(100), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!marker.exists(), "background child outlived teardown");
    }

    #[tokio::test]
    async fn test_run_process_honours_cancellation() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let mut command = Command::new("sh");
        command.args(["-c", "sleep 30"]);
        let err = run_process(command, "git_ops", limits(30_000), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled { tool: "git_ops" }));
    }

    #[tokio::test]
    async fn test_run_process_missing_binary_is_io_error() {
        let command = Command::new("definitely-not-a-real-binary-xyz");
        let err = run_process(command, "sandbox_exec", limits(1_000), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Io { .. }));
    }
}
