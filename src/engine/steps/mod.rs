//! Phase handlers.
//!
//! Each of the five phases is a variant of [`StepExecutor`] sharing one
//! contract: read the [`StepContext`] and the accumulated [`PipelineState`],
//! return a [`StepOutcome`] (artifacts to publish plus the next action).
//! Handlers never touch run status; the orchestrator owns that.

mod checklist;
mod executor;
mod planner;
pub mod prompts;
mod summarizer;
mod validator;

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::documents::{Checklist, Plan};
use super::event_log::EventSink;
use super::models::{ArtifactUpdate, Phase, Run};
use crate::config::DevflowConfig;
use crate::errors::StepError;
use crate::llm::ModelRouter;
use crate::llm::router::Prompt;
use crate::memory::RepoMemory;
use crate::tools::ToolGateway;

/// Everything a phase handler may use. Owned by one run's orchestrator.
pub struct StepContext {
    pub run: Run,
    pub config: Arc<DevflowConfig>,
    pub router: ModelRouter,
    pub tools: ToolGateway,
    pub memory: RepoMemory,
    pub events: EventSink,
}

impl StepContext {
    pub fn cancel_token(&self) -> &CancellationToken {
        self.tools.cancel_token()
    }

    pub fn ensure_active(&self) -> Result<(), StepError> {
        if self.cancel_token().is_cancelled() {
            Err(StepError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Where this run's working copy lives.
    pub fn workspace_dir(&self) -> PathBuf {
        let root = &self.config.engine.workspace_root;
        let root = std::path::absolute(root).unwrap_or_else(|_| root.clone());
        root.join(&self.run.id)
    }

    pub async fn ask(&self, phase: Phase, prompt: &Prompt) -> Result<String, StepError> {
        let response = self
            .router
            .complete(phase, prompt, &self.events, self.cancel_token())
            .await?;
        Ok(response.content)
    }
}

/// Per-run bound on validate→execute repair cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub validation_attempts: u32,
    pub max_attempts: u32,
}

impl RetryBudget {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            validation_attempts: 0,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn record_attempt(&mut self) {
        self.validation_attempts += 1;
    }

    /// Whether a failed validation may go back to execution.
    pub fn can_repair(&self) -> bool {
        self.validation_attempts < self.max_attempts
    }
}

/// One failed validation check, fed back to the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Defect {
    pub check: String,
    pub command: String,
    pub exit_code: Option<i32>,
    pub output: String,
    pub related_files: Vec<String>,
}

impl Defect {
    pub fn render(&self) -> String {
        let mut text = format!(
            "### {} (`{}`, exit {})\n```\n{}\n```",
            self.check,
            self.command,
            self.exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()),
            self.output
        );
        if !self.related_files.is_empty() {
            text.push_str(&format!("\nRelated files: {}", self.related_files.join(", ")));
        }
        text
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    /// Failed once, then passed on the automatic re-run.
    pub flaky: bool,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub checks: Vec<CheckResult>,
}

impl ValidationReport {
    pub fn describe(&self) -> String {
        if self.checks.is_empty() {
            return "No checks configured".to_string();
        }
        self.checks
            .iter()
            .map(|c| {
                let outcome = match (c.passed, c.flaky) {
                    (true, true) => "passed on re-run",
                    (true, false) => "passed",
                    (false, _) => "failed",
                };
                format!("- {}: {}", c.name, outcome)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Typed results carried between phases of one run.
#[derive(Debug)]
pub struct PipelineState {
    pub repo_context: String,
    pub plan: Option<Plan>,
    pub checklist: Option<Checklist>,
    pub diff: String,
    pub changed_files: Vec<String>,
    pub defects: Vec<Defect>,
    pub validation: Option<ValidationReport>,
    pub budget: RetryBudget,
}

impl PipelineState {
    pub fn new(budget: RetryBudget) -> Self {
        Self {
            repo_context: String::new(),
            plan: None,
            checklist: None,
            diff: String::new(),
            changed_files: Vec::new(),
            defects: Vec::new(),
            validation: None,
            budget,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    Advance,
    Repair { defects: Vec<Defect> },
    Fail { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub artifacts: ArtifactUpdate,
    pub next: NextAction,
}

impl StepOutcome {
    pub fn advance(artifacts: ArtifactUpdate) -> Self {
        Self {
            artifacts,
            next: NextAction::Advance,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            artifacts: ArtifactUpdate::default(),
            next: NextAction::Fail {
                reason: reason.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepExecutor {
    Planner,
    ChecklistBuilder,
    Executor,
    Validator,
    Summarizer,
}

impl StepExecutor {
    pub fn for_phase(phase: Phase) -> Self {
        match phase {
            Phase::Plan => Self::Planner,
            Phase::Checklist => Self::ChecklistBuilder,
            Phase::Execute => Self::Executor,
            Phase::Validate => Self::Validator,
            Phase::Summarize => Self::Summarizer,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Self::Planner => Phase::Plan,
            Self::ChecklistBuilder => Phase::Checklist,
            Self::Executor => Phase::Execute,
            Self::Validator => Phase::Validate,
            Self::Summarizer => Phase::Summarize,
        }
    }

    pub async fn run(
        &self,
        ctx: &StepContext,
        state: &mut PipelineState,
    ) -> Result<StepOutcome, StepError> {
        ctx.ensure_active()?;
        match self {
            Self::Planner => planner::run(ctx, state).await,
            Self::ChecklistBuilder => checklist::run(ctx, state).await,
            Self::Executor => executor::run(ctx, state).await,
            Self::Validator => validator::run(ctx, state).await,
            Self::Summarizer => summarizer::run(ctx, state).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_budget_bounds_repairs() {
        let mut budget = RetryBudget::new(2);
        budget.record_attempt();
        assert!(budget.can_repair());
        budget.record_attempt();
        assert!(!budget.can_repair());
        assert_eq!(RetryBudget::new(0).max_attempts, 1);
    }

    #[test]
    fn test_executor_for_phase_roundtrip() {
        for phase in Phase::ALL {
            assert_eq!(StepExecutor::for_phase(phase).phase(), phase);
        }
    }

    #[test]
    fn test_defect_render() {
        let defect = Defect {
            check: "tests".into(),
            command: "pytest -q".into(),
            exit_code: Some(1),
            output: "FAILED test_x".into(),
            related_files: vec!["src/x.py".into()],
        };
        let text = defect.render();
        assert!(text.starts_with("### tests (`pytest -q`, exit 1)"));
        assert!(text.ends_with("Related files: src/x.py"));
    }

    #[test]
    fn test_validation_report_describe() {
        let report = ValidationReport {
            passed: true,
            checks: vec![
                CheckResult {
                    name: "lint".into(),
                    passed: true,
                    flaky: false,
                    exit_code: Some(0),
                },
                CheckResult {
                    name: "tests".into(),
                    passed: true,
                    flaky: true,
                    exit_code: Some(0),
                },
            ],
        };
        assert_eq!(report.describe(), "- lint: passed\n- tests: passed on re-run");
    }
}
