//! Tool Gateway.
//!
//! Every tool call an executor makes goes through [`ToolGateway::invoke`]:
//!
//! ```text
//!   executor ──► invoke(phase, call, timeout)
//!                  │  tool_call event
//!                  ├─ cancelled? ──────────────► ToolError::Cancelled
//!                  ├─ dispatch under timeout T ─► repo_map | git_ops | sandbox_exec
//!                  │    (subprocesses torn down by process group)
//!                  ├─ backstop at T + grace ───► ToolError::Timeout
//!                  │  tool_result / error event
//!                  ▼
//!               Result<ToolOutput, ToolError>
//! ```
//!
//! The gateway owns the run's working copy. Nothing reaches the caller's
//! `repo_path` except the read-only probe and the initial clone/copy.

pub mod git_ops;
pub mod process;
pub mod repo_map;
pub mod sandbox;
pub mod workspace;

use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::DevflowConfig;
use crate::engine::event_log::EventSink;
use crate::engine::models::{EventKind, Phase};
use crate::errors::ToolError;
use crate::util::{short_id, truncate_utf8};

use git_ops::{GitOp, GitOutput};
use process::{ProcessLimits, ProcessOutput};
use repo_map::{RepoMapOutput, RepoQuery, WalkBudget};
use sandbox::{ExecRequest, SandboxPolicy};
use workspace::Workspace;

/// Upper bound on git output (diffs) kept in memory.
const GIT_MAX_OUTPUT_BYTES: usize = 8 * 1024 * 1024;
/// Slack on top of a call's timeout before the gateway gives up on teardown.
const BACKSTOP_MARGIN: Duration = Duration::from_millis(500);
/// Output excerpt size recorded in tool_result events.
const EVENT_EXCERPT_BYTES: usize = 2048;

/// Join `rel` onto `root`, refusing absolute paths, parent traversal and
/// any existing symlink along the way. Sandbox commands can create links in
/// the working copy, so a lexically clean path may still point outside it.
pub fn resolve_within(tool: &'static str, root: &Path, rel: &str) -> Result<PathBuf, ToolError> {
    let candidate = Path::new(rel);
    if rel.trim().is_empty() {
        return Err(ToolError::NotAllowed {
            tool,
            detail: "empty path".into(),
        });
    }
    for component in candidate.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(ToolError::NotAllowed {
                    tool,
                    detail: format!("path '{}' escapes the working copy", rel),
                });
            }
        }
    }

    let mut current = root.to_path_buf();
    for component in candidate.components() {
        let Component::Normal(part) = component else {
            continue;
        };
        current.push(part);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(ToolError::NotAllowed {
                    tool,
                    detail: format!("path '{}' passes through a symlink", rel),
                });
            }
            Ok(_) => {}
            // Nothing below a missing component can be a link yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(source) => return Err(ToolError::Io { tool, source }),
        }
    }
    Ok(root.join(candidate))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    RepoMap,
    GitOps,
    SandboxExec,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RepoMap => "repo_map",
            Self::GitOps => "git_ops",
            Self::SandboxExec => "sandbox_exec",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    RepoMap(RepoQuery),
    Git(GitOp),
    Sandbox(ExecRequest),
}

impl ToolCall {
    pub fn kind(&self) -> ToolKind {
        match self {
            ToolCall::RepoMap(_) => ToolKind::RepoMap,
            ToolCall::Git(_) => ToolKind::GitOps,
            ToolCall::Sandbox(_) => ToolKind::SandboxExec,
        }
    }

    fn describe(&self) -> serde_json::Value {
        match self {
            ToolCall::RepoMap(query) => serde_json::to_value(query).unwrap_or_default(),
            ToolCall::Git(op) => op.describe(),
            ToolCall::Sandbox(request) => json!({"command": request.display()}),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutput {
    RepoMap(RepoMapOutput),
    Git(GitOutput),
    Sandbox(ProcessOutput),
}

impl ToolOutput {
    fn summary(&self) -> serde_json::Value {
        match self {
            ToolOutput::RepoMap(RepoMapOutput::Probe(report)) => json!({"is_git_repo": report.is_git_repo}),
            ToolOutput::RepoMap(RepoMapOutput::Tree { entries, truncated }) => {
                json!({"entries": entries.len(), "truncated": truncated})
            }
            ToolOutput::RepoMap(RepoMapOutput::File { content, truncated, .. }) => json!({
                "found": content.is_some(),
                "bytes": content.as_ref().map_or(0, String::len),
                "truncated": truncated,
            }),
            ToolOutput::RepoMap(RepoMapOutput::Matches { matches }) => json!({"matches": matches.len()}),
            ToolOutput::Git(output) => json!({
                "op": output.op,
                "paths": output.paths,
                "output_bytes": output.stdout.len(),
            }),
            ToolOutput::Sandbox(output) => json!({
                "exit_code": output.exit_code,
                "success": output.success,
                "duration_ms": output.duration_ms,
                "stdout": tail(&output.stdout),
                "stderr": tail(&output.stderr),
            }),
        }
    }
}

fn tail(text: &str) -> String {
    if text.len() <= EVENT_EXCERPT_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - EVENT_EXCERPT_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

/// Timeouts and retry policy the gateway applies.
#[derive(Debug, Clone)]
pub struct GatewayPolicy {
    pub repo_map_timeout: Duration,
    pub git_timeout: Duration,
    pub sandbox_timeout: Duration,
    pub kill_grace: Duration,
    pub tool_retries: u32,
    pub sandbox: SandboxPolicy,
}

impl From<&DevflowConfig> for GatewayPolicy {
    fn from(config: &DevflowConfig) -> Self {
        Self {
            repo_map_timeout: config.tools.repo_map_timeout(),
            git_timeout: config.tools.git_timeout(),
            sandbox_timeout: config.tools.sandbox_timeout(),
            kill_grace: Duration::from_millis(config.engine.cancel_grace_ms),
            tool_retries: config.engine.tool_retries,
            sandbox: SandboxPolicy::from(&config.sandbox),
        }
    }
}

impl GatewayPolicy {
    pub fn default_timeout(&self, kind: ToolKind) -> Duration {
        match kind {
            ToolKind::RepoMap => self.repo_map_timeout,
            ToolKind::GitOps => self.git_timeout,
            ToolKind::SandboxExec => self.sandbox_timeout,
        }
    }
}

/// Per-run tool mediator. Owns the run's working copy and cancellation token.
pub struct ToolGateway {
    run_id: String,
    policy: GatewayPolicy,
    cancel: CancellationToken,
    events: EventSink,
    workspace: OnceLock<Workspace>,
    sandbox_calls: AtomicU64,
}

impl ToolGateway {
    pub fn new(policy: GatewayPolicy, cancel: CancellationToken, events: EventSink) -> Self {
        Self {
            run_id: events.run_id().to_string(),
            policy,
            cancel,
            events,
            workspace: OnceLock::new(),
            sandbox_calls: AtomicU64::new(0),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn workdir(&self) -> Result<&Path, ToolError> {
        self.workspace
            .get()
            .map(|ws| ws.path.as_path())
            .ok_or_else(|| ToolError::WorkspaceUnavailable("no working copy provisioned".into()))
    }

    fn limits(&self, timeout: Duration, max_output_bytes: usize) -> ProcessLimits {
        ProcessLimits {
            timeout,
            kill_grace: self.policy.kill_grace,
            max_output_bytes,
        }
    }

    /// Invoke with the tool's configured timeout.
    pub async fn call(&self, phase: Phase, call: ToolCall) -> Result<ToolOutput, ToolError> {
        let timeout = self.policy.default_timeout(call.kind());
        self.invoke(phase, call, timeout).await
    }

    /// Run one tool call under a hard deadline. Both the call and its outcome
    /// are appended to the event log.
    pub async fn invoke(
        &self,
        phase: Phase,
        call: ToolCall,
        timeout: Duration,
    ) -> Result<ToolOutput, ToolError> {
        let kind = call.kind();
        let sink = self.events.for_phase(phase);
        sink.emit(
            EventKind::ToolCall,
            json!({
                "tool": kind.as_str(),
                "args": call.describe(),
                "timeout_ms": timeout.as_millis() as u64,
            }),
        )
        .await;

        let started = Instant::now();
        let result = if self.cancel.is_cancelled() {
            Err(ToolError::Cancelled { tool: kind.as_str() })
        } else {
            let backstop = timeout + self.policy.kill_grace + BACKSTOP_MARGIN;
            tokio::select! {
                outcome = tokio::time::timeout(backstop, self.dispatch(&call, timeout)) => {
                    outcome.unwrap_or(Err(ToolError::Timeout { tool: kind.as_str(), after: timeout }))
                }
                _ = self.cancel.cancelled() => Err(ToolError::Cancelled { tool: kind.as_str() }),
            }
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(output) => {
                sink.emit(
                    EventKind::ToolResult,
                    json!({
                        "tool": kind.as_str(),
                        "ok": true,
                        "latency_ms": latency_ms,
                        "result": output.summary(),
                    }),
                )
                .await;
            }
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, tool = kind.as_str(), latency_ms, error = %e, "tool call failed");
                sink.emit(
                    EventKind::Error,
                    json!({
                        "tool": kind.as_str(),
                        "ok": false,
                        "latency_ms": latency_ms,
                        "error_code": e.code(),
                        "error_message": e.to_string(),
                        "retryable": e.is_retryable(),
                    }),
                )
                .await;
            }
        }
        result
    }

    /// `call` with the local bounded retry for transient tool failures.
    pub async fn call_with_retry(&self, phase: Phase, call: ToolCall) -> Result<ToolOutput, ToolError> {
        let mut attempt = 0;
        loop {
            match self.call(phase, call.clone()).await {
                Err(e) if e.is_retryable() && attempt < self.policy.tool_retries => {
                    attempt += 1;
                    let delay = Duration::from_millis(200 * u64::from(attempt));
                    self.events
                        .for_phase(phase)
                        .emit(
                            EventKind::Retry,
                            json!({
                                "tool": call.kind().as_str(),
                                "attempt": attempt,
                                "max_retries": self.policy.tool_retries,
                                "delay_ms": delay.as_millis() as u64,
                                "error": e.to_string(),
                            }),
                        )
                        .await;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            return Err(ToolError::Cancelled { tool: call.kind().as_str() });
                        }
                    }
                }
                other => return other,
            }
        }
    }

    async fn dispatch(&self, call: &ToolCall, timeout: Duration) -> Result<ToolOutput, ToolError> {
        match call {
            ToolCall::RepoMap(query) => {
                let root = self.workspace.get().map(|ws| ws.path.clone());
                let query = query.clone();
                let budget = WalkBudget::new(timeout, self.cancel.clone());
                let task = tokio::task::spawn_blocking(move || repo_map::query(root.as_deref(), &query, &budget));
                // Backstop for a read stuck in the kernel; walks stop on their own.
                match tokio::time::timeout(timeout + BACKSTOP_MARGIN, task).await {
                    Ok(Ok(result)) => result.map(ToolOutput::RepoMap),
                    Ok(Err(e)) => Err(ToolError::Failed {
                        tool: ToolKind::RepoMap.as_str(),
                        message: format!("repo_map task failed: {}", e),
                    }),
                    Err(_) => Err(ToolError::Timeout {
                        tool: ToolKind::RepoMap.as_str(),
                        after: timeout,
                    }),
                }
            }
            ToolCall::Git(op) => {
                let limits = self.limits(timeout, GIT_MAX_OUTPUT_BYTES);
                git_ops::execute(self.workdir()?, op, limits, &self.cancel)
                    .await
                    .map(ToolOutput::Git)
            }
            ToolCall::Sandbox(request) => {
                let workdir = self.workdir()?;
                let seq = self.sandbox_calls.fetch_add(1, Ordering::Relaxed);
                let container = format!("devflow-{}-{}", short_id(&self.run_id), seq);
                let limits = self.limits(timeout, self.policy.sandbox.max_output_bytes);
                sandbox::execute(&self.policy.sandbox, workdir, request, &container, limits, &self.cancel)
                    .await
                    .map(ToolOutput::Sandbox)
            }
        }
    }

    /// Create the run's private working copy of `source` under `dest`.
    /// Logged as a `git_ops` provisioning call.
    pub async fn provision_workspace(
        &self,
        phase: Phase,
        source: &Path,
        dest: &Path,
        base_branch: &str,
    ) -> Result<&Workspace, ToolError> {
        if let Some(existing) = self.workspace.get() {
            return Ok(existing);
        }
        let sink = self.events.for_phase(phase);
        let tool = ToolKind::GitOps.as_str();
        sink.emit(
            EventKind::ToolCall,
            json!({
                "tool": tool,
                "args": {"op": "provision", "source": source.display().to_string(), "base_branch": base_branch},
                "timeout_ms": self.policy.git_timeout.as_millis() as u64,
            }),
        )
        .await;

        let started = Instant::now();
        let limits = self.limits(self.policy.git_timeout, GIT_MAX_OUTPUT_BYTES);
        let result = if self.cancel.is_cancelled() {
            Err(ToolError::Cancelled { tool })
        } else {
            Workspace::provision(source, dest, base_branch, limits, &self.cancel).await
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(ws) => {
                sink.emit(
                    EventKind::ToolResult,
                    json!({
                        "tool": tool,
                        "ok": true,
                        "latency_ms": latency_ms,
                        "result": {
                            "op": "provision",
                            "base_commit": ws.base_commit,
                            "base_branch_found": ws.base_branch_found,
                            "source_is_git": ws.source_is_git,
                        },
                    }),
                )
                .await;
                Ok(self.workspace.get_or_init(|| ws))
            }
            Err(e) => {
                sink.emit(
                    EventKind::Error,
                    json!({
                        "tool": tool,
                        "ok": false,
                        "latency_ms": latency_ms,
                        "error_code": e.code(),
                        "error_message": e.to_string(),
                        "retryable": e.is_retryable(),
                    }),
                )
                .await;
                Err(e)
            }
        }
    }

    /// Delete the working copy, if one was provisioned.
    pub async fn release_workspace(&self) {
        if let Some(ws) = self.workspace.get() {
            if let Err(e) = Workspace::remove(&ws.path).await {
                tracing::warn!(run_id = %self.run_id, path = %ws.path.display(), error = %e, "failed to remove working copy");
            }
        }
    }

    /// Unified diff of the working copy against its base commit.
    pub async fn diff(&self, phase: Phase) -> Result<String, ToolError> {
        let base = self
            .workspace
            .get()
            .map(|ws| ws.base_commit.clone())
            .ok_or_else(|| ToolError::WorkspaceUnavailable("no working copy provisioned".into()))?;
        match self.call_with_retry(phase, ToolCall::Git(GitOp::Diff { base })).await? {
            ToolOutput::Git(output) => Ok(output.stdout),
            _ => Ok(String::new()),
        }
    }
}

/// Output shortened for prompts and defect reports.
pub fn excerpt(output: &ProcessOutput, max_bytes: usize) -> String {
    let mut text = String::new();
    if !output.stdout.trim().is_empty() {
        text.push_str(output.stdout.trim_end());
    }
    if !output.stderr.trim().is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(output.stderr.trim_end());
    }
    truncate_utf8(&text, max_bytes)
}
