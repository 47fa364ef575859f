use std::path::PathBuf;

use serde_json::json;

use super::prompts::{SYSTEM_PROMPT, plan_prompt};
use super::{PipelineState, StepContext, StepOutcome};
use crate::engine::documents::Plan;
use crate::engine::models::{ArtifactUpdate, EventKind, Phase};
use crate::errors::{StepError, ToolError};
use crate::llm::router::Prompt;
use crate::memory::render_excerpts;
use crate::tools::git_ops::GitOp;
use crate::tools::repo_map::{RepoMapOutput, RepoQuery};
use crate::tools::{ToolCall, ToolOutput};
use crate::util::short_id;

const TREE_DEPTH: usize = 3;
const TREE_ENTRIES: usize = 200;

pub(super) async fn run(ctx: &StepContext, state: &mut PipelineState) -> Result<StepOutcome, StepError> {
    let source = PathBuf::from(&ctx.run.repo_path);

    // Read-only accessibility check of the caller's path.
    let probe = ctx
        .tools
        .call(Phase::Plan, ToolCall::RepoMap(RepoQuery::Probe { path: source.clone() }))
        .await;
    match probe {
        Ok(_) => {}
        Err(e @ ToolError::Cancelled { .. }) => return Err(e.into()),
        Err(e) => return Ok(StepOutcome::fail(format!("repository not accessible: {}", e))),
    }

    let workspace = ctx
        .tools
        .provision_workspace(Phase::Plan, &source, &ctx.workspace_dir(), &ctx.run.base_branch)
        .await?;
    if workspace.source_is_git && !workspace.base_branch_found {
        ctx.events
            .for_phase(Phase::Plan)
            .emit(
                EventKind::Error,
                json!({
                    "warning": format!(
                        "base branch '{}' not found; using the repository's current HEAD",
                        ctx.run.base_branch
                    ),
                }),
            )
            .await;
    }
    ctx.memory.attach(&workspace.path);

    let branch = format!("devflow/{}", short_id(&ctx.run.id));
    ctx.tools
        .call_with_retry(Phase::Plan, ToolCall::Git(GitOp::Branch { name: branch }))
        .await?;

    let tree = ctx
        .tools
        .call(
            Phase::Plan,
            ToolCall::RepoMap(RepoQuery::Tree {
                max_depth: TREE_DEPTH,
                max_entries: TREE_ENTRIES,
            }),
        )
        .await?;
    let excerpts = ctx
        .memory
        .retrieve(&ctx.run.feature_request, ctx.memory.default_k())
        .await?;
    state.repo_context = repo_context(&tree, &render_excerpts(&excerpts));

    ctx.ensure_active()?;
    let response = ctx
        .ask(
            Phase::Plan,
            &Prompt::json(SYSTEM_PROMPT, plan_prompt(&ctx.run.feature_request, &state.repo_context)),
        )
        .await?;
    let plan = Plan::parse(&response, &ctx.run.feature_request);
    tracing::info!(run_id = %ctx.run.id, title = %plan.title, "plan generated");

    let markdown = plan.to_markdown();
    state.plan = Some(plan);
    Ok(StepOutcome::advance(ArtifactUpdate {
        plan_markdown: Some(markdown),
        ..ArtifactUpdate::default()
    }))
}

fn repo_context(tree: &ToolOutput, excerpts: &str) -> String {
    let mut context = String::from("## Repository Layout\n");
    if let ToolOutput::RepoMap(RepoMapOutput::Tree { entries, truncated }) = tree {
        for entry in entries {
            context.push_str(&format!("- {}\n", entry));
        }
        if *truncated {
            context.push_str("- ...\n");
        }
    }
    context.push_str("\n## Relevant Code\n");
    context.push_str(excerpts);
    context
}
