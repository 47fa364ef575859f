use anyhow::anyhow;
use futures::future::try_join_all;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Mutex, Semaphore};

use super::prompts::{SYSTEM_PROMPT, execute_prompt, repair_prompt};
use super::{Defect, PipelineState, StepContext, StepOutcome};
use crate::engine::documents::{Checklist, ChecklistAction, ChecklistItem};
use crate::engine::models::{ArtifactUpdate, EventKind, Phase};
use crate::errors::{StepError, ToolError};
use crate::llm::router::Prompt;
use crate::memory::render_excerpts;
use crate::tools::git_ops::{FileChange, GitOp, parse_changed_files};
use crate::tools::repo_map::{RepoMapOutput, RepoQuery};
use crate::tools::sandbox::ExecRequest;
use crate::tools::{ToolCall, ToolOutput};
use crate::util::{parse_json_response, truncate_utf8};

const MAX_FILE_BYTES: usize = 256 * 1024;
const MAX_REPAIR_DIFF_BYTES: usize = 20_000;
const MAX_QUERY_BYTES: usize = 2_000;

#[derive(Debug, Deserialize)]
struct ItemResponse {
    #[serde(default)]
    file_path: Option<String>,
    #[serde(default)]
    new_content: Option<String>,
    #[serde(default)]
    delete: bool,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    commands: Vec<ExecRequest>,
}

/// What happened to one checklist item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Applied,
    /// The model's answer could not be used; the item stays open.
    Skipped,
}

#[derive(Debug, Deserialize)]
struct FileEdit {
    file_path: String,
    #[serde(default)]
    new_content: Option<String>,
    #[serde(default)]
    delete: bool,
}

impl FileEdit {
    fn into_change(self) -> Option<FileChange> {
        if self.file_path.trim().is_empty() {
            return None;
        }
        if self.delete {
            return Some(FileChange::Delete { path: self.file_path });
        }
        self.new_content.map(|content| FileChange::Write {
            path: self.file_path,
            content,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RepairResponse {
    #[serde(default)]
    changes: Vec<FileEdit>,
    #[serde(default)]
    explanation: String,
}

pub(super) async fn run(ctx: &StepContext, state: &mut PipelineState) -> Result<StepOutcome, StepError> {
    if state.defects.is_empty() {
        let repo_context = state.repo_context.clone();
        let Some(checklist) = state.checklist.as_mut() else {
            return Ok(StepOutcome::fail("no checklist available for execution"));
        };

        let semaphore = Semaphore::new(ctx.config.engine.executor_concurrency.max(1));
        let stage_lock = Mutex::new(());
        let (semaphore, stage_lock, repo_context) = (&semaphore, &stage_lock, repo_context.as_str());

        let mut applied: Vec<String> = Vec::new();
        for (index, wave) in checklist.waves().into_iter().enumerate() {
            ctx.ensure_active()?;
            let pending: Vec<&ChecklistItem> = wave.into_iter().filter(|item| !item.completed).collect();
            tracing::debug!(run_id = %ctx.run.id, wave = index, items = pending.len(), "executing wave");

            let tasks = pending.into_iter().map(|item| async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| StepError::Internal(anyhow!("executor semaphore closed: {}", e)))?;
                let outcome = execute_item(ctx, item, repo_context, stage_lock).await?;
                Ok::<_, StepError>((item.id.clone(), outcome))
            });
            applied.extend(
                try_join_all(tasks)
                    .await?
                    .into_iter()
                    .filter(|(_, outcome)| *outcome == ItemOutcome::Applied)
                    .map(|(id, _)| id),
            );
        }
        mark_completed(checklist, &applied);
    } else {
        let defects = std::mem::take(&mut state.defects);
        repair(ctx, state, &defects).await?;
    }

    // Edits and sandbox commands changed the tree under the index.
    ctx.memory.invalidate().await;
    ctx.ensure_active()?;

    let diff = ctx.tools.diff(Phase::Execute).await?;
    state.changed_files = parse_changed_files(&diff);
    state.diff = diff.clone();
    tracing::info!(run_id = %ctx.run.id, files = state.changed_files.len(), "execution produced diff");

    Ok(StepOutcome::advance(ArtifactUpdate {
        diff: Some(diff),
        ..ArtifactUpdate::default()
    }))
}

async fn execute_item(
    ctx: &StepContext,
    item: &ChecklistItem,
    repo_context: &str,
    stage_lock: &Mutex<()>,
) -> Result<ItemOutcome, StepError> {
    ctx.ensure_active()?;

    let current = match item.file_path.as_deref() {
        Some(path) => read_file(ctx, path).await?,
        None => None,
    };

    let query = format!("{} {}", item.description, item.file_path.as_deref().unwrap_or_default());
    let excerpts = ctx.memory.retrieve(&query, ctx.memory.default_k()).await?;
    let context = format!("{}\n\n## Related To This Step\n{}", repo_context, render_excerpts(&excerpts));

    let prompt = execute_prompt(
        item,
        current.as_deref(),
        &context,
        &ctx.config.sandbox.allowed_programs,
    );
    let response = ctx.ask(Phase::Execute, &Prompt::json(SYSTEM_PROMPT, prompt)).await?;

    let Some(parsed) = parse_json_response::<ItemResponse>(&response) else {
        tracing::warn!(run_id = %ctx.run.id, item = %item.id, "unparseable executor response; skipping item");
        ctx.events
            .for_phase(Phase::Execute)
            .emit(
                EventKind::Error,
                json!({
                    "item": item.id,
                    "error": "model response was not a JSON object; step skipped",
                }),
            )
            .await;
        return Ok(ItemOutcome::Skipped);
    };

    let edit = FileEdit {
        file_path: parsed
            .file_path
            .filter(|p| !p.trim().is_empty())
            .or_else(|| item.file_path.clone())
            .unwrap_or_default(),
        delete: parsed.delete || (item.action == ChecklistAction::Delete && parsed.new_content.is_none()),
        new_content: parsed.new_content,
    };
    if let Some(change) = edit.into_change() {
        // Concurrent `git add` calls race on the index lock.
        let _guard = stage_lock.lock().await;
        ctx.tools
            .call_with_retry(Phase::Execute, ToolCall::Git(GitOp::Stage { changes: vec![change] }))
            .await?;
    }

    for command in parsed.commands {
        match ctx.tools.call_with_retry(Phase::Execute, ToolCall::Sandbox(command)).await {
            Ok(_) => {}
            Err(ToolError::NotAllowed { detail, .. }) => {
                tracing::debug!(run_id = %ctx.run.id, item = %item.id, %detail, "skipped disallowed command");
            }
            Err(e) => return Err(e.into()),
        }
    }

    tracing::info!(
        run_id = %ctx.run.id,
        item = %item.id,
        explanation = %truncate_utf8(&parsed.explanation, 200),
        "checklist item executed"
    );
    Ok(ItemOutcome::Applied)
}

fn mark_completed(checklist: &mut Checklist, applied: &[String]) {
    for item in checklist.items.iter_mut() {
        if applied.contains(&item.id) {
            item.completed = true;
        }
    }
}

async fn read_file(ctx: &StepContext, path: &str) -> Result<Option<String>, StepError> {
    let output = ctx
        .tools
        .call(
            Phase::Execute,
            ToolCall::RepoMap(RepoQuery::ReadFile {
                path: path.to_string(),
                max_bytes: MAX_FILE_BYTES,
            }),
        )
        .await?;
    match output {
        ToolOutput::RepoMap(RepoMapOutput::File { content, .. }) => Ok(content),
        _ => Ok(None),
    }
}

async fn repair(ctx: &StepContext, state: &PipelineState, defects: &[Defect]) -> Result<(), StepError> {
    let rendered = defects.iter().map(Defect::render).collect::<Vec<_>>().join("\n\n");

    let excerpts = ctx
        .memory
        .retrieve(&truncate_utf8(&rendered, MAX_QUERY_BYTES), ctx.memory.default_k())
        .await?;
    let plan = state.plan.as_ref().map(|p| p.to_markdown()).unwrap_or_default();
    let prompt = repair_prompt(
        &plan,
        &truncate_utf8(&state.diff, MAX_REPAIR_DIFF_BYTES),
        &rendered,
        &render_excerpts(&excerpts),
    );
    let response = ctx.ask(Phase::Execute, &Prompt::json(SYSTEM_PROMPT, prompt)).await?;

    let Some(parsed) = parse_json_response::<RepairResponse>(&response) else {
        tracing::warn!(run_id = %ctx.run.id, "unparseable repair response");
        ctx.events
            .for_phase(Phase::Execute)
            .emit(
                EventKind::Error,
                json!({"error": "repair response was not a JSON object; no changes applied"}),
            )
            .await;
        return Ok(());
    };

    let changes: Vec<FileChange> = parsed.changes.into_iter().filter_map(FileEdit::into_change).collect();
    tracing::info!(
        run_id = %ctx.run.id,
        changes = changes.len(),
        explanation = %truncate_utf8(&parsed.explanation, 200),
        "applying repair"
    );
    if !changes.is_empty() {
        ctx.tools
            .call_with_retry(Phase::Execute, ToolCall::Git(GitOp::Stage { changes }))
            .await?;
    }
    Ok(())
}
