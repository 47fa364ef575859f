//! Per-run working copies.
//!
//! A run never touches the caller's `repo_path`: it gets a private copy under
//! `engine.workspace_root/<run_id>`. Git repositories are cloned (committed
//! state of `base_branch`); plain directories are copied and snapshotted into
//! a fresh repository so diffs have a baseline.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::git_ops::run_git;
use super::process::ProcessLimits;
use super::repo_map::is_ignored;
use crate::errors::ToolError;

const TOOL: &str = "git_ops";

/// Build and cache artifacts kept out of diffs.
const EXCLUDES: &str = "__pycache__/\n*.pyc\n.pytest_cache/\n.mypy_cache/\n.ruff_cache/\nnode_modules/\ntarget/\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub path: PathBuf,
    /// Commit the run's diff is computed against.
    pub base_commit: String,
    /// False when `base_branch` did not exist and the source's default
    /// branch was used instead.
    pub base_branch_found: bool,
    pub source_is_git: bool,
}

impl Workspace {
    pub async fn provision(
        source: &Path,
        dest: &Path,
        base_branch: &str,
        limits: ProcessLimits,
        cancel: &CancellationToken,
    ) -> Result<Workspace, ToolError> {
        let parent = dest
            .parent()
            .ok_or_else(|| ToolError::WorkspaceUnavailable(format!("{} has no parent", dest.display())))?
            .to_path_buf();
        let io = |source| ToolError::Io { tool: TOOL, source };

        if dest.exists() {
            tokio::fs::remove_dir_all(dest).await.map_err(io)?;
        }
        tokio::fs::create_dir_all(&parent).await.map_err(io)?;

        let source_is_git = source.join(".git").exists();
        let mut base_branch_found = true;

        if source_is_git {
            let source_arg = source.to_string_lossy().into_owned();
            let dest_arg = dest.to_string_lossy().into_owned();
            run_git(
                &parent,
                &["clone", "--quiet", "--no-hardlinks", source_arg.as_str(), dest_arg.as_str()],
                limits,
                cancel,
            )
            .await?;
            if let Err(e) = run_git(dest, &["checkout", "-q", base_branch], limits, cancel).await {
                if matches!(e, ToolError::Cancelled { .. }) {
                    return Err(e);
                }
                tracing::warn!(base_branch, error = %e, "base branch unavailable; using source HEAD");
                base_branch_found = false;
            }
        } else {
            let (from, to) = (source.to_path_buf(), dest.to_path_buf());
            tokio::task::spawn_blocking(move || copy_tree(&from, &to))
                .await
                .map_err(|e| ToolError::Failed {
                    tool: TOOL,
                    message: format!("copy task failed: {}", e),
                })??;
            run_git(dest, &["init", "-q"], limits, cancel).await?;
            run_git(dest, &["add", "-A"], limits, cancel).await?;
            run_git(
                dest,
                &["commit", "-q", "--allow-empty", "-m", "devflow: baseline snapshot"],
                limits,
                cancel,
            )
            .await?;
            base_branch_found = false;
        }

        let exclude = dest.join(".git").join("info").join("exclude");
        if let Some(info_dir) = exclude.parent() {
            tokio::fs::create_dir_all(info_dir).await.map_err(io)?;
        }
        tokio::fs::write(&exclude, EXCLUDES).await.map_err(io)?;

        let base_commit = run_git(dest, &["rev-parse", "HEAD"], limits, cancel)
            .await?
            .trim()
            .to_string();

        Ok(Workspace {
            path: dest.to_path_buf(),
            base_commit,
            base_branch_found,
            source_is_git,
        })
    }

    pub async fn remove(path: &Path) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Copy regular files and directories, skipping ignored directories and symlinks.
fn copy_tree(source: &Path, dest: &Path) -> Result<(), ToolError> {
    let io = |source| ToolError::Io { tool: TOOL, source };
    std::fs::create_dir_all(dest).map_err(io)?;
    let walker = WalkDir::new(source)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !is_ignored(e));
    for entry in walker {
        let entry = entry.map_err(|e| ToolError::Failed {
            tool: TOOL,
            message: format!("walking {}: {}", source.display(), e),
        })?;
        let rel = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(io)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target).map_err(io)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limits() -> ProcessLimits {
        ProcessLimits {
            timeout: Duration::from_secs(30),
            kill_grace: Duration::from_millis(100),
            max_output_bytes: 1 << 20,
        }
    }

    async fn git_source() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        run_git(dir.path(), &["init", "-q", "-b", "main"], limits(), &cancel)
            .await
            .unwrap();
        std::fs::write(dir.path().join("app.py"), "print('hi')\n").unwrap();
        run_git(dir.path(), &["add", "-A"], limits(), &cancel).await.unwrap();
        run_git(dir.path(), &["commit", "-q", "-m", "init"], limits(), &cancel)
            .await
            .unwrap();
        dir
    }

    #[tokio::test]
    async fn test_provision_clones_git_source() {
        let source = git_source().await;
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("run-1");
        let ws = Workspace::provision(source.path(), &dest, "main", limits(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(ws.source_is_git);
        assert!(ws.base_branch_found);
        assert_eq!(ws.base_commit.len(), 40);
        assert!(dest.join("app.py").exists());

        // Edits in the copy never reach the source.
        std::fs::write(dest.join("app.py"), "changed\n").unwrap();
        let original = std::fs::read_to_string(source.path().join("app.py")).unwrap();
        assert_eq!(original, "print('hi')\n");
    }

    #[tokio::test]
    async fn test_provision_falls_back_when_base_branch_missing() {
        let source = git_source().await;
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::provision(
            source.path(),
            &root.path().join("run-2"),
            "develop",
            limits(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(!ws.base_branch_found);
    }

    #[tokio::test]
    async fn test_provision_snapshots_plain_directory() {
        let source = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(source.path().join("pkg")).unwrap();
        std::fs::create_dir_all(source.path().join("node_modules/dep")).unwrap();
        std::fs::write(source.path().join("pkg/mod.py"), "x = 1\n").unwrap();
        std::fs::write(source.path().join("node_modules/dep/index.js"), "").unwrap();

        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("run-3");
        let ws = Workspace::provision(source.path(), &dest, "main", limits(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!ws.source_is_git);
        assert!(dest.join("pkg/mod.py").exists());
        assert!(!dest.join("node_modules").exists());
        assert!(dest.join(".git").exists());
        assert!(!source.path().join(".git").exists());

        Workspace::remove(&dest).await.unwrap();
        assert!(!dest.exists());
        Workspace::remove(&dest).await.unwrap();
    }
}
