//! Allow-listed git operations on a run's working copy.
//!
//! Only `Branch`, `Stage`, `Commit` and `Diff` exist; there is no way to pass
//! an arbitrary git subcommand or shell string through this module. File
//! edits travel with `Stage` and are confined to the working copy.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::process::{ProcessLimits, run_process};
use super::resolve_within;
use crate::errors::ToolError;

const TOOL: &str = "git_ops";

pub const COMMIT_AUTHOR_NAME: &str = "DevFlow Agent";
pub const COMMIT_AUTHOR_EMAIL: &str = "devflow@localhost";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FileChange {
    Write { path: String, content: String },
    Delete { path: String },
}

impl FileChange {
    pub fn path(&self) -> &str {
        match self {
            FileChange::Write { path, .. } | FileChange::Delete { path } => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GitOp {
    /// Create and switch to a new branch.
    Branch { name: String },
    /// Apply file changes inside the working copy and stage them.
    Stage { changes: Vec<FileChange> },
    Commit { message: String },
    /// Unified diff of the working copy (tracked and untracked) against `base`.
    Diff { base: String },
}

impl GitOp {
    pub fn name(&self) -> &'static str {
        match self {
            GitOp::Branch { .. } => "branch",
            GitOp::Stage { .. } => "stage",
            GitOp::Commit { .. } => "commit",
            GitOp::Diff { .. } => "diff",
        }
    }

    /// Argument summary for the event log; file contents are reduced to sizes.
    pub fn describe(&self) -> serde_json::Value {
        match self {
            GitOp::Branch { name } => serde_json::json!({"op": "branch", "name": name}),
            GitOp::Stage { changes } => serde_json::json!({
                "op": "stage",
                "changes": changes.iter().map(|c| match c {
                    FileChange::Write { path, content } =>
                        serde_json::json!({"write": path, "bytes": content.len()}),
                    FileChange::Delete { path } => serde_json::json!({"delete": path}),
                }).collect::<Vec<_>>(),
            }),
            GitOp::Commit { message } => serde_json::json!({"op": "commit", "message": message}),
            GitOp::Diff { base } => serde_json::json!({"op": "diff", "base": base}),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GitOutput {
    pub op: &'static str,
    pub stdout: String,
    pub paths: Vec<String>,
}

/// A `git -C <workdir>` command with prompts disabled and a fixed identity.
pub fn git_command(workdir: &Path) -> Command {
    let mut command = Command::new("git");
    command
        .arg("-C")
        .arg(workdir)
        .arg("-c")
        .arg(format!("user.name={}", COMMIT_AUTHOR_NAME))
        .arg("-c")
        .arg(format!("user.email={}", COMMIT_AUTHOR_EMAIL))
        .args(["-c", "commit.gpgsign=false"])
        .env("GIT_TERMINAL_PROMPT", "0");
    command
}

/// Run git with fixed arguments and return stdout; a non-zero exit is a
/// `ToolError::Failed` carrying stderr.
pub async fn run_git(
    workdir: &Path,
    args: &[&str],
    limits: ProcessLimits,
    cancel: &CancellationToken,
) -> Result<String, ToolError> {
    let mut command = git_command(workdir);
    command.args(args);
    let output = run_process(command, TOOL, limits, cancel).await?;
    if !output.success {
        let detail = if output.stderr.trim().is_empty() {
            output.stdout.trim().to_string()
        } else {
            output.stderr.trim().to_string()
        };
        return Err(ToolError::Failed {
            tool: TOOL,
            message: format!("git {} exited with {:?}: {}", args.join(" "), output.exit_code, detail),
        });
    }
    Ok(output.stdout)
}

pub fn validate_branch_name(name: &str) -> Result<(), ToolError> {
    let valid = !name.is_empty()
        && !name.starts_with('-')
        && !name.starts_with('/')
        && !name.ends_with('/')
        && !name.ends_with(".lock")
        && !name.contains("..")
        && !name.contains("//")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if valid {
        Ok(())
    } else {
        Err(ToolError::NotAllowed {
            tool: TOOL,
            detail: format!("invalid branch name '{}'", name),
        })
    }
}

/// Write or delete files inside the working copy. Returns the touched paths.
pub fn apply_changes(workdir: &Path, changes: &[FileChange]) -> Result<Vec<String>, ToolError> {
    let mut touched = Vec::with_capacity(changes.len());
    for change in changes {
        let rel = change.path();
        if rel.split(['/', '\\']).any(|part| part == ".git") {
            return Err(ToolError::NotAllowed {
                tool: TOOL,
                detail: format!("refusing to touch git metadata: {}", rel),
            });
        }
        let target = resolve_within(TOOL, workdir, rel)?;
        match change {
            FileChange::Write { content, .. } => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|source| ToolError::Io { tool: TOOL, source })?;
                }
                std::fs::write(&target, content)
                    .map_err(|source| ToolError::Io { tool: TOOL, source })?;
            }
            FileChange::Delete { .. } => {
                if target.is_file() {
                    std::fs::remove_file(&target)
                        .map_err(|source| ToolError::Io { tool: TOOL, source })?;
                }
            }
        }
        touched.push(rel.to_string());
    }
    Ok(touched)
}

pub async fn execute(
    workdir: &Path,
    op: &GitOp,
    limits: ProcessLimits,
    cancel: &CancellationToken,
) -> Result<GitOutput, ToolError> {
    match op {
        GitOp::Branch { name } => {
            validate_branch_name(name)?;
            let stdout = run_git(workdir, &["checkout", "-q", "-b", name.as_str()], limits, cancel).await?;
            Ok(GitOutput {
                op: op.name(),
                stdout,
                paths: Vec::new(),
            })
        }
        GitOp::Stage { changes } => {
            let paths = apply_changes(workdir, changes)?;
            let stdout = run_git(workdir, &["add", "-A"], limits, cancel).await?;
            Ok(GitOutput {
                op: op.name(),
                stdout,
                paths,
            })
        }
        GitOp::Commit { message } => {
            run_git(workdir, &["add", "-A"], limits, cancel).await?;
            let stdout = run_git(workdir, &["commit", "-q", "-m", message.as_str()], limits, cancel).await?;
            Ok(GitOutput {
                op: op.name(),
                stdout,
                paths: Vec::new(),
            })
        }
        GitOp::Diff { base } => {
            // Stage everything first so files created by sandboxed commands show up.
            run_git(workdir, &["add", "-A"], limits, cancel).await?;
            let stdout = run_git(
                workdir,
                &["diff", "--cached", "--no-color", "--no-ext-diff", base.as_str(), "--"],
                limits,
                cancel,
            )
            .await?;
            let paths = parse_changed_files(&stdout);
            Ok(GitOutput {
                op: op.name(),
                stdout,
                paths,
            })
        }
    }
}

/// Files named in a unified diff, sorted and de-duplicated.
pub fn parse_changed_files(patch: &str) -> Vec<String> {
    let mut files = BTreeSet::new();
    for line in patch.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            if let Some(rhs) = rest.split_whitespace().nth(1) {
                files.insert(rhs.trim_start_matches("b/").to_string());
            }
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            let path = rest.trim();
            if path != "/dev/null" {
                files.insert(path.trim_start_matches("b/").to_string());
            }
        }
    }
    files.into_iter().collect()
}
