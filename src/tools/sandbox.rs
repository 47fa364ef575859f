//! Sandboxed program execution inside a run's working copy.
//!
//! The policy is the contract the gateway relies on: only allow-listed
//! programs, never a shell string, working directory pinned to the working
//! copy, secrets scrubbed from the environment, and no network. Isolation
//! comes from the backend: the local backend prefixes the command with
//! `isolation_wrapper` (by default bubblewrap with the host read-only and only
//! the working copy writable), the docker backend runs with `--network none`
//! and only the working copy mounted.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::process::{ProcessLimits, ProcessOutput, run_process};
use crate::config::{SandboxBackend, SandboxSection, WORKDIR_PLACEHOLDER};
use crate::errors::ToolError;

const TOOL: &str = "sandbox_exec";

/// Substrings that mark an environment variable as secret regardless of prefix.
const SECRET_MARKERS: &[&str] = &["TOKEN", "SECRET", "PASSWORD", "API_KEY", "CREDENTIAL"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ExecRequest {
    pub fn new(program: &str, args: &[String]) -> Self {
        Self {
            program: program.to_string(),
            args: args.to_vec(),
        }
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    pub backend: SandboxBackend,
    pub allowed_programs: Vec<String>,
    pub isolation_wrapper: Vec<String>,
    pub unconfined: bool,
    pub image: String,
    pub memory: String,
    pub cpus: String,
    pub max_output_bytes: usize,
    pub denied_env_prefixes: Vec<String>,
}

impl From<&SandboxSection> for SandboxPolicy {
    fn from(section: &SandboxSection) -> Self {
        Self {
            backend: section.backend,
            allowed_programs: section.allowed_programs.clone(),
            isolation_wrapper: section.isolation_wrapper.clone(),
            unconfined: section.unconfined,
            image: section.image.clone(),
            memory: section.memory.clone(),
            cpus: section.cpus.clone(),
            max_output_bytes: section.max_output_bytes,
            denied_env_prefixes: section.denied_env_prefixes.clone(),
        }
    }
}

impl SandboxPolicy {
    pub fn check(&self, request: &ExecRequest) -> Result<(), ToolError> {
        let program = request.program.as_str();
        if program.contains('/') || program.contains('\\') {
            return Err(ToolError::NotAllowed {
                tool: TOOL,
                detail: format!("program must be a bare name, got '{}'", program),
            });
        }
        if !self.allowed_programs.iter().any(|allowed| allowed == program) {
            return Err(ToolError::NotAllowed {
                tool: TOOL,
                detail: format!("program '{}' is not in the allow-list", program),
            });
        }
        Ok(())
    }

    pub fn is_secret_env(&self, key: &str) -> bool {
        let upper = key.to_ascii_uppercase();
        self.denied_env_prefixes
            .iter()
            .any(|prefix| upper.starts_with(&prefix.to_ascii_uppercase()))
            || SECRET_MARKERS.iter().any(|marker| upper.contains(marker))
    }

    fn scrubbed_env(&self) -> Vec<(String, String)> {
        std::env::vars()
            .filter(|(key, _)| !self.is_secret_env(key))
            .collect()
    }

    /// The local wrapper with `{workdir}` substituted. A wrapper that never
    /// names the working copy cannot be scoping writes to it.
    fn local_wrapper(&self, workdir: &Path) -> Result<Vec<String>, ToolError> {
        let confined = self
            .isolation_wrapper
            .iter()
            .any(|arg| arg.contains(WORKDIR_PLACEHOLDER));
        if !confined && !self.unconfined {
            return Err(ToolError::NotAllowed {
                tool: TOOL,
                detail: format!(
                    "isolation_wrapper does not reference {}; refusing to run unconfined",
                    WORKDIR_PLACEHOLDER
                ),
            });
        }
        let workdir = workdir.display().to_string();
        Ok(self
            .isolation_wrapper
            .iter()
            .map(|arg| arg.replace(WORKDIR_PLACEHOLDER, &workdir))
            .collect())
    }

    /// Build the process for `request` without spawning it.
    pub fn build_command(
        &self,
        workdir: &Path,
        request: &ExecRequest,
        container_name: &str,
    ) -> Result<Command, ToolError> {
        self.check(request)?;

        let mut command = match self.backend {
            SandboxBackend::Local => {
                let wrapper = self.local_wrapper(workdir)?;
                let mut command = match wrapper.split_first() {
                    Some((wrapper, wrapper_args)) => {
                        let mut command = Command::new(wrapper);
                        command.args(wrapper_args).arg(&request.program);
                        command
                    }
                    None => Command::new(&request.program),
                };
                command.args(&request.args);
                command
            }
            SandboxBackend::Docker => {
                let mut command = Command::new("docker");
                command
                    .args(["run", "--rm", "--network", "none", "--pids-limit", "256"])
                    .args(["--name", container_name])
                    .args(["--memory", self.memory.as_str()])
                    .args(["--cpus", self.cpus.as_str()])
                    .args(["-e", "PYTHONDONTWRITEBYTECODE=1"])
                    .args(["-w", "/workspace"])
                    .arg("-v")
                    .arg(format!("{}:/workspace", workdir.display()));
                #[cfg(unix)]
                {
                    // SAFETY: getuid/getgid cannot fail.
                    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
                    command.arg("--user").arg(format!("{}:{}", uid, gid));
                }
                command
                    .arg(&self.image)
                    .arg(&request.program)
                    .args(&request.args);
                command
            }
        };

        command
            .current_dir(workdir)
            .env_clear()
            .envs(self.scrubbed_env())
            .env("PYTHONDONTWRITEBYTECODE", "1");
        Ok(command)
    }
}

/// Run `request` in `workdir` under `limits`. A non-zero exit is a normal
/// result, not an error.
pub async fn execute(
    policy: &SandboxPolicy,
    workdir: &Path,
    request: &ExecRequest,
    container_name: &str,
    limits: ProcessLimits,
    cancel: &CancellationToken,
) -> Result<ProcessOutput, ToolError> {
    let limits = ProcessLimits {
        max_output_bytes: policy.max_output_bytes,
        ..limits
    };
    let command = policy.build_command(workdir, request, container_name)?;
    let result = run_process(command, TOOL, limits, cancel).await;

    if policy.backend == SandboxBackend::Docker
        && matches!(
            result,
            Err(ToolError::Timeout { .. }) | Err(ToolError::Cancelled { .. })
        )
    {
        remove_container(container_name).await;
    }
    result
}

/// Killing the docker client does not stop the container; remove it explicitly.
async fn remove_container(name: &str) {
    let mut command = Command::new("docker");
    command.args(["rm", "-f", name]).kill_on_drop(true);
    let outcome = tokio::time::timeout(std::time::Duration::from_secs(10), command.output()).await;
    if !matches!(outcome, Ok(Ok(ref out)) if out.status.success()) {
        tracing::warn!(container = name, "failed to remove sandbox container");
    }
}
