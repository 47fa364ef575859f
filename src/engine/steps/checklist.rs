use super::prompts::{SYSTEM_PROMPT, checklist_prompt};
use super::{PipelineState, StepContext, StepOutcome};
use crate::engine::documents::Checklist;
use crate::engine::models::{ArtifactUpdate, Phase};
use crate::errors::StepError;
use crate::llm::router::Prompt;

pub(super) async fn run(ctx: &StepContext, state: &mut PipelineState) -> Result<StepOutcome, StepError> {
    let Some(plan) = state.plan.as_ref() else {
        return Ok(StepOutcome::fail("no plan available for checklist generation"));
    };

    let response = ctx
        .ask(
            Phase::Checklist,
            &Prompt::json(SYSTEM_PROMPT, checklist_prompt(&plan.to_markdown())),
        )
        .await?;
    let checklist = Checklist::parse(&response);
    if checklist.items.is_empty() {
        return Ok(StepOutcome::fail("plan yielded zero actionable steps"));
    }
    tracing::info!(run_id = %ctx.run.id, items = checklist.items.len(), "checklist generated");

    let markdown = checklist.to_markdown();
    state.checklist = Some(checklist);
    Ok(StepOutcome::advance(ArtifactUpdate {
        checklist_markdown: Some(markdown),
        ..ArtifactUpdate::default()
    }))
}
