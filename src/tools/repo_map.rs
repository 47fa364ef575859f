//! Read-only repository inspection: probe, tree, read, search.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use walkdir::{DirEntry, WalkDir};

use super::resolve_within;
use crate::errors::ToolError;

const TOOL: &str = "repo_map";

/// Directory names never descended into.
pub const IGNORED_DIRS: &[&str] = &[
    ".git",
    ".devflow",
    "node_modules",
    "target",
    "__pycache__",
    ".venv",
    "venv",
    ".mypy_cache",
    ".pytest_cache",
    ".ruff_cache",
    "dist",
    "build",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum RepoQuery {
    /// Check that a caller-supplied repository path is usable. Never writes.
    Probe { path: PathBuf },
    Tree { max_depth: usize, max_entries: usize },
    ReadFile { path: String, max_bytes: usize },
    Search { pattern: String, max_matches: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub path: PathBuf,
    pub is_git_repo: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchMatch {
    pub path: String,
    pub line: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepoMapOutput {
    Probe(ProbeReport),
    Tree { entries: Vec<String>, truncated: bool },
    File { path: String, content: Option<String>, truncated: bool },
    Matches { matches: Vec<SearchMatch> },
}

/// Deadline and cancellation for a blocking walk. The gateway stops waiting
/// at its timeout; this is what makes the walk itself stop.
#[derive(Debug, Clone)]
pub struct WalkBudget {
    deadline: Option<Instant>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl WalkBudget {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
            timeout,
            cancel,
        }
    }

    pub fn check(&self) -> Result<(), ToolError> {
        if self.cancel.is_cancelled() {
            return Err(ToolError::Cancelled { tool: TOOL });
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(ToolError::Timeout {
                tool: TOOL,
                after: self.timeout,
            });
        }
        Ok(())
    }
}

/// Execute a query. `Probe` inspects its own path; everything else is
/// resolved against `root`.
pub fn query(root: Option<&Path>, query: &RepoQuery, budget: &WalkBudget) -> Result<RepoMapOutput, ToolError> {
    match query {
        RepoQuery::Probe { path } => probe(path).map(RepoMapOutput::Probe),
        RepoQuery::Tree {
            max_depth,
            max_entries,
        } => {
            let (entries, truncated) = tree(require_root(root)?, *max_depth, *max_entries, budget)?;
            Ok(RepoMapOutput::Tree { entries, truncated })
        }
        RepoQuery::ReadFile { path, max_bytes } => {
            let (content, truncated) = read_file(require_root(root)?, path, *max_bytes)?;
            Ok(RepoMapOutput::File {
                path: path.clone(),
                content,
                truncated,
            })
        }
        RepoQuery::Search {
            pattern,
            max_matches,
        } => {
            let matches = search(require_root(root)?, pattern, *max_matches, budget)?;
            Ok(RepoMapOutput::Matches { matches })
        }
    }
}

fn require_root(root: Option<&Path>) -> Result<&Path, ToolError> {
    root.ok_or_else(|| ToolError::WorkspaceUnavailable("no working copy provisioned".into()))
}

pub fn probe(path: &Path) -> Result<ProbeReport, ToolError> {
    let metadata = std::fs::metadata(path).map_err(|e| ToolError::Failed {
        tool: TOOL,
        message: format!("cannot access repository {}: {}", path.display(), e),
    })?;
    if !metadata.is_dir() {
        return Err(ToolError::Failed {
            tool: TOOL,
            message: format!("repository path {} is not a directory", path.display()),
        });
    }
    std::fs::read_dir(path).map_err(|e| ToolError::Failed {
        tool: TOOL,
        message: format!("cannot read repository {}: {}", path.display(), e),
    })?;
    Ok(ProbeReport {
        path: path.to_path_buf(),
        is_git_repo: path.join(".git").exists(),
    })
}

pub fn is_ignored(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| IGNORED_DIRS.contains(&name))
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Sorted relative paths; directories carry a trailing `/`.
pub fn tree(
    root: &Path,
    max_depth: usize,
    max_entries: usize,
    budget: &WalkBudget,
) -> Result<(Vec<String>, bool), ToolError> {
    let mut entries = Vec::new();
    let mut truncated = false;
    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth.max(1))
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_ignored(e));

    for entry in walker.flatten() {
        budget.check()?;
        if entries.len() >= max_entries {
            truncated = true;
            break;
        }
        let mut rel = relative(root, entry.path());
        if entry.file_type().is_dir() {
            rel.push('/');
        }
        entries.push(rel);
    }
    Ok((entries, truncated))
}

/// Read a file inside `root`. A missing file yields `None` content so
/// executors can treat it as "create".
pub fn read_file(
    root: &Path,
    rel: &str,
    max_bytes: usize,
) -> Result<(Option<String>, bool), ToolError> {
    let path = resolve_within(TOOL, root, rel)?;
    if !path.exists() {
        return Ok((None, false));
    }
    let bytes = std::fs::read(&path).map_err(|source| ToolError::Io { tool: TOOL, source })?;
    let truncated = bytes.len() > max_bytes;
    let text = String::from_utf8_lossy(&bytes[..bytes.len().min(max_bytes)]).into_owned();
    Ok((Some(text), truncated))
}

pub fn search(
    root: &Path,
    pattern: &str,
    max_matches: usize,
    budget: &WalkBudget,
) -> Result<Vec<SearchMatch>, ToolError> {
    let regex = Regex::new(pattern).map_err(|e| ToolError::NotAllowed {
        tool: TOOL,
        detail: format!("invalid search pattern: {}", e),
    })?;
    let mut matches = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_ignored(e));

    'files: for entry in walker.flatten() {
        budget.check()?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        for (idx, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                matches.push(SearchMatch {
                    path: relative(root, entry.path()),
                    line: idx + 1,
                    text: line.trim().chars().take(200).collect(),
                });
                if matches.len() >= max_matches {
                    break 'files;
                }
            }
        }
    }
    Ok(matches)
}
