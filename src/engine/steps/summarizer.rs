use super::prompts::{SYSTEM_PROMPT, summary_prompt};
use super::{PipelineState, StepContext, StepOutcome};
use crate::engine::documents::RunSummary;
use crate::engine::models::{ArtifactUpdate, Phase};
use crate::errors::StepError;
use crate::llm::router::Prompt;
use crate::tools::ToolCall;
use crate::tools::git_ops::GitOp;
use crate::util::truncate_utf8;

const MAX_SUMMARY_DIFF_BYTES: usize = 5_000;

pub(super) async fn run(ctx: &StepContext, state: &mut PipelineState) -> Result<StepOutcome, StepError> {
    let title = state
        .plan
        .as_ref()
        .map(|p| p.title.clone())
        .unwrap_or_else(|| ctx.run.feature_request.clone());

    ctx.tools
        .call_with_retry(
            Phase::Summarize,
            ToolCall::Git(GitOp::Commit {
                message: format!("feat: {}", title),
            }),
        )
        .await?;

    let report = state.validation.clone().unwrap_or_default();
    let prompt = summary_prompt(
        &ctx.run.feature_request,
        &changes_overview(state),
        &report.describe(),
    );
    let response = ctx.ask(Phase::Summarize, &Prompt::json(SYSTEM_PROMPT, prompt)).await?;
    let summary = RunSummary::parse(&response, &title, state.changed_files.clone(), report.passed);
    tracing::info!(run_id = %ctx.run.id, title = %summary.title, "summary generated");

    Ok(StepOutcome::advance(ArtifactUpdate {
        summary_markdown: Some(summary.to_markdown()),
        diff: Some(state.diff.clone()),
        ..ArtifactUpdate::default()
    }))
}

fn changes_overview(state: &PipelineState) -> String {
    let mut text = String::new();
    if let Some(checklist) = &state.checklist {
        for item in checklist.items.iter().filter(|i| i.completed) {
            match &item.file_path {
                Some(path) => text.push_str(&format!("- {} (`{}`)\n", item.description, path)),
                None => text.push_str(&format!("- {}\n", item.description)),
            }
        }
    }
    text.push_str(&format!(
        "\n```diff\n{}\n```",
        truncate_utf8(&state.diff, MAX_SUMMARY_DIFF_BYTES)
    ));
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::documents::{Checklist, ChecklistAction, ChecklistItem};
    use crate::engine::steps::RetryBudget;

    #[test]
    fn test_changes_overview_lists_completed_items_and_diff() {
        let mut state = PipelineState::new(RetryBudget::new(1));
        state.checklist = Some(Checklist {
            items: vec![
                ChecklistItem {
                    id: "step-1".into(),
                    description: "Add greeting".into(),
                    file_path: Some("app.py".into()),
                    action: ChecklistAction::Modify,
                    dependencies: vec![],
                    completed: true,
                },
                ChecklistItem {
                    id: "step-2".into(),
                    description: "Skipped".into(),
                    file_path: None,
                    action: ChecklistAction::Test,
                    dependencies: vec![],
                    completed: false,
                },
            ],
            test_strategy: "Run tests".into(),
        });
        state.diff = "+print('hi')".into();

        let text = changes_overview(&state);
        assert!(text.starts_with("- Add greeting (`app.py`)\n"));
        assert!(!text.contains("Skipped"));
        assert!(text.ends_with("```diff\n+print('hi')\n```"));
    }
}
