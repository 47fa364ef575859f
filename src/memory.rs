//! Memory / Retrieval Store.
//!
//! Keyword retrieval over a run's working copy. Files are split into fixed
//! line windows; a query is reduced to significant terms and each window is
//! scored by term hits in its text and path. The index is built lazily on the
//! first query and rebuilt after `invalidate` (the executor calls it after it
//! writes files). Retrieval never writes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use glob::Pattern;
use serde::Serialize;
use tokio::sync::Mutex;
use walkdir::WalkDir;

use crate::config::MemorySection;
use crate::tools::repo_map::is_ignored;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "from", "that", "this", "will", "have", "should", "would",
    "could", "also", "each", "when", "into", "more", "other", "add", "use", "new", "make",
    "all", "are", "not", "but", "can", "its", "our", "you", "def", "let", "var", "self",
];

/// A ranked slice of a repository file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Excerpt {
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    pub score: f64,
}

impl Excerpt {
    pub fn render(&self) -> String {
        format!(
            "### {}:{}-{}\n```\n{}\n```",
            self.path, self.start_line, self.end_line, self.text
        )
    }
}

/// Render excerpts as a prompt section; empty input renders a placeholder.
pub fn render_excerpts(excerpts: &[Excerpt]) -> String {
    if excerpts.is_empty() {
        return "(no relevant repository context found)".to_string();
    }
    excerpts
        .iter()
        .map(Excerpt::render)
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[derive(Debug)]
struct Chunk {
    path: String,
    path_lower: String,
    start_line: usize,
    end_line: usize,
    text: String,
    text_lower: String,
}

pub struct RepoMemory {
    root: OnceLock<PathBuf>,
    settings: MemorySection,
    index: Mutex<Option<Arc<Vec<Chunk>>>>,
}

impl RepoMemory {
    pub fn new(settings: MemorySection) -> Self {
        Self {
            root: OnceLock::new(),
            settings,
            index: Mutex::new(None),
        }
    }

    /// Point the store at a working copy. Later calls are ignored.
    pub fn attach(&self, root: &Path) {
        let _ = self.root.set(root.to_path_buf());
    }

    pub fn default_k(&self) -> usize {
        self.settings.top_k
    }

    /// Drop the index so the next query sees current file contents.
    pub async fn invalidate(&self) {
        *self.index.lock().await = None;
    }

    /// At most `k` excerpts ranked by relevance to `query`. Empty until a
    /// working copy is attached.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<Excerpt>> {
        let Some(root) = self.root.get().cloned() else {
            return Ok(Vec::new());
        };
        let terms = extract_terms(query);
        if terms.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let index = {
            let mut guard = self.index.lock().await;
            match guard.as_ref() {
                Some(index) => index.clone(),
                None => {
                    let settings = self.settings.clone();
                    let built = tokio::task::spawn_blocking(move || build_index(&root, &settings))
                        .await
                        .context("memory index task panicked")?;
                    let built = Arc::new(built);
                    *guard = Some(built.clone());
                    built
                }
            }
        };

        tokio::task::spawn_blocking(move || rank(&index, &terms, k))
            .await
            .context("memory ranking task panicked")
    }
}

/// Significant lowercase terms of `query`, deduplicated in order.
pub fn extract_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for word in query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
    {
        if word.len() >= 3 && !STOP_WORDS.contains(&word) && !terms.iter().any(|t| t == word) {
            terms.push(word.to_string());
        }
    }
    terms
}

fn ignore_patterns(settings: &MemorySection) -> Vec<Pattern> {
    settings
        .ignore
        .iter()
        .filter_map(|raw| match Pattern::new(raw) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                tracing::warn!(pattern = %raw, error = %e, "ignoring invalid memory ignore glob");
                None
            }
        })
        .collect()
}

fn build_index(root: &Path, settings: &MemorySection) -> Vec<Chunk> {
    let patterns = ignore_patterns(settings);
    let window = settings.chunk_lines.max(1);
    let mut chunks = Vec::new();

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_ignored(e));
    for entry in walker.flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let name = entry.file_name().to_string_lossy();
        if patterns.iter().any(|p| p.matches(&rel) || p.matches(&name)) {
            continue;
        }
        if entry.metadata().map(|m| m.len() > settings.max_file_bytes).unwrap_or(true) {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };

        let lines: Vec<&str> = content.lines().collect();
        for (i, window_lines) in lines.chunks(window).enumerate() {
            let text = window_lines.join("\n");
            if text.trim().is_empty() {
                continue;
            }
            let start_line = i * window + 1;
            chunks.push(Chunk {
                path: rel.clone(),
                path_lower: rel.to_lowercase(),
                start_line,
                end_line: start_line + window_lines.len() - 1,
                text_lower: text.to_lowercase(),
                text,
            });
        }
    }
    chunks
}

fn score(chunk: &Chunk, terms: &[String]) -> f64 {
    let mut score = 0.0;
    for term in terms {
        let hits = chunk.text_lower.matches(term.as_str()).count().min(5);
        if hits > 0 {
            score += 1.0 + (hits - 1) as f64 * 0.25;
        }
        if chunk.path_lower.contains(term.as_str()) {
            score += 1.5;
        }
    }
    score
}

fn rank(index: &[Chunk], terms: &[String], k: usize) -> Vec<Excerpt> {
    let mut scored: Vec<(f64, &Chunk)> = index
        .iter()
        .map(|chunk| (score(chunk, terms), chunk))
        .filter(|(s, _)| *s > 0.0)
        .collect();
    scored.sort_by(|a, b| {
        b.0.total_cmp(&a.0)
            .then_with(|| a.1.path.cmp(&b.1.path))
            .then_with(|| a.1.start_line.cmp(&b.1.start_line))
    });
    scored
        .into_iter()
        .take(k)
        .map(|(score, chunk)| Excerpt {
            path: chunk.path.clone(),
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            text: chunk.text.clone(),
            score,
        })
        .collect()
}
