//! Per-run state machine.
//!
//! One `Orchestrator` owns one run for its whole life and is the only writer of
//! its status, step and progress. Phases run strictly in sequence; the
//! validate→execute repair loop is bounded by the run's [`RetryBudget`].

use std::collections::HashSet;

use anyhow::{Result, bail};
use serde_json::json;

use super::event_log::EventLog;
use super::models::{EventKind, Phase, RunStateUpdate, RunStatus};
use super::steps::{NextAction, PipelineState, RetryBudget, StepContext, StepExecutor};

/// Whether the state graph allows moving from `from` to `to`.
pub fn is_valid_transition(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus::*;
    match (from, to) {
        (Queued, Planning)
        | (Planning, Checklist)
        | (Checklist, Executing)
        | (Executing, Validating)
        | (Validating, Executing)
        | (Validating, Summarizing)
        | (Summarizing, Completed) => true,
        (from, Failed | Cancelled) => !from.is_terminal(),
        _ => false,
    }
}

/// Check if a run can still be cancelled.
pub fn is_cancellable(status: RunStatus) -> bool {
    !status.is_terminal()
}

/// Fraction of distinct phases finished.
fn progress_for(completed_phases: usize) -> f64 {
    (completed_phases as f64 / Phase::ALL.len() as f64).min(1.0)
}

fn next_phase(phase: Phase) -> Option<Phase> {
    let index = Phase::ALL.iter().position(|p| *p == phase)?;
    Phase::ALL.get(index + 1).copied()
}

/// How `drive` stopped.
#[derive(Debug)]
enum Exit {
    Completed,
    Failed(String),
    Cancelled,
    /// The stored run was already terminal; nothing left to write.
    Abandoned,
}

pub struct Orchestrator {
    ctx: StepContext,
    log: EventLog,
    status: RunStatus,
    phase: Option<Phase>,
    progress: f64,
    completed: HashSet<Phase>,
}

impl Orchestrator {
    pub fn new(ctx: StepContext, log: EventLog) -> Self {
        let status = ctx.run.status;
        let progress = ctx.run.progress;
        Self {
            ctx,
            log,
            status,
            phase: None,
            progress,
            completed: HashSet::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.ctx.run.id
    }

    /// Drive the run to a terminal status and return it.
    pub async fn start(mut self) -> RunStatus {
        let mut state = PipelineState::new(RetryBudget::new(self.ctx.config.engine.max_validation_attempts));
        let exit = self.drive(&mut state).await;
        let status = self.finish(exit).await;

        if !self.ctx.config.engine.keep_workspaces {
            self.ctx.tools.release_workspace().await;
        }
        tracing::info!(run_id = %self.run_id(), status = %status, "run finished");
        status
    }

    async fn drive(&mut self, state: &mut PipelineState) -> Exit {
        let mut phase = Phase::Plan;
        loop {
            // Checkpoint: never enter a new phase once cancellation is requested.
            if self.ctx.cancel_token().is_cancelled() {
                return Exit::Cancelled;
            }
            match self.enter(phase).await {
                Ok(true) => {}
                Ok(false) => return Exit::Abandoned,
                Err(e) => return Exit::Failed(format!("internal error: {:#}", e)),
            }

            let sink = self.ctx.events.for_phase(phase);
            sink.emit(
                EventKind::Started,
                json!({
                    "status": phase.status().as_str(),
                    "validation_attempts": state.budget.validation_attempts,
                    "repair": phase == Phase::Execute && !state.defects.is_empty(),
                }),
            )
            .await;

            let outcome = match StepExecutor::for_phase(phase).run(&self.ctx, state).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancellation() => return Exit::Cancelled,
                Err(e) => {
                    tracing::warn!(run_id = %self.run_id(), phase = %phase, error = %e, "phase failed");
                    return Exit::Failed(e.failure_message());
                }
            };

            if let Err(e) = self.log.apply_artifacts(self.run_id(), outcome.artifacts).await {
                return Exit::Failed(format!("internal error: {:#}", e));
            }

            self.completed.insert(phase);
            self.progress = self.progress.max(progress_for(self.completed.len()));
            sink.emit(
                EventKind::Completed,
                json!({
                    "next": match &outcome.next {
                        NextAction::Advance => "advance",
                        NextAction::Repair { .. } => "repair",
                        NextAction::Fail { .. } => "fail",
                    },
                    "progress": self.progress,
                }),
            )
            .await;

            match outcome.next {
                NextAction::Advance => match next_phase(phase) {
                    Some(next) => phase = next,
                    None => return Exit::Completed,
                },
                NextAction::Repair { defects } => {
                    // Handlers decide when to repair; the bound is enforced here too.
                    if !state.budget.can_repair() {
                        return Exit::Failed("validation budget exhausted".to_string());
                    }
                    sink.emit(
                        EventKind::Retry,
                        json!({
                            "repair": true,
                            "validation_attempts": state.budget.validation_attempts,
                            "max_attempts": state.budget.max_attempts,
                            "defects": defects,
                        }),
                    )
                    .await;
                    state.defects = defects;
                    phase = Phase::Execute;
                }
                NextAction::Fail { reason } => return Exit::Failed(reason),
            }
        }
    }

    /// Persist entry into `phase`. `false` means the run is already terminal.
    async fn enter(&mut self, phase: Phase) -> Result<bool> {
        self.phase = Some(phase);
        self.transition(phase.status(), Some(phase.step_label().to_string()), None)
            .await
    }

    async fn finish(&mut self, exit: Exit) -> RunStatus {
        let step = self.phase.map(|p| p.step_label().to_string());
        let (status, step, message) = match exit {
            Exit::Completed => (RunStatus::Completed, Some("completed".to_string()), None),
            Exit::Failed(reason) => (RunStatus::Failed, step, Some(reason)),
            Exit::Cancelled => (RunStatus::Cancelled, step, Some("cancelled".to_string())),
            Exit::Abandoned => return self.status,
        };

        let sink = match self.phase {
            Some(phase) => self.ctx.events.for_phase(phase),
            None => self.ctx.events.clone(),
        };
        if let (RunStatus::Failed, Some(reason)) = (status, &message) {
            sink.emit(EventKind::Error, json!({"terminal": true, "reason": reason}))
                .await;
        }
        sink.emit(EventKind::Completed, json!({"outcome": status.as_str()}))
            .await;

        if let Err(e) = self.transition(status, step, message).await {
            tracing::error!(run_id = %self.run_id(), error = %e, "failed to record terminal state");
        }
        self.status
    }

    async fn transition(&mut self, to: RunStatus, current_step: Option<String>, message: Option<String>) -> Result<bool> {
        if !is_valid_transition(self.status, to) {
            bail!("invalid run transition {} -> {}", self.status, to);
        }
        if to == RunStatus::Completed {
            self.progress = 1.0;
        }
        let update = RunStateUpdate {
            status: to,
            current_step,
            progress: self.progress,
            message,
        };
        match self.log.record_state(self.run_id(), update).await? {
            Some(run) => {
                self.status = run.status;
                self.progress = run.progress;
                Ok(true)
            }
            None => {
                tracing::warn!(run_id = %self.run_id(), to = %to, "run already terminal; update refused");
                let id = self.run_id().to_string();
                if let Some(run) = self.log.db().call(move |db| db.get_run(&id)).await? {
                    self.status = run.status;
                }
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        assert!(is_valid_transition(RunStatus::Queued, RunStatus::Planning));
        assert!(is_valid_transition(RunStatus::Validating, RunStatus::Executing));
        assert!(is_valid_transition(RunStatus::Validating, RunStatus::Summarizing));
        assert!(is_valid_transition(RunStatus::Summarizing, RunStatus::Completed));
        assert!(is_valid_transition(RunStatus::Queued, RunStatus::Cancelled));
        assert!(is_valid_transition(RunStatus::Executing, RunStatus::Failed));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!is_valid_transition(RunStatus::Queued, RunStatus::Executing));
        assert!(!is_valid_transition(RunStatus::Planning, RunStatus::Completed));
        assert!(!is_valid_transition(RunStatus::Executing, RunStatus::Summarizing));
        assert!(!is_valid_transition(RunStatus::Completed, RunStatus::Failed));
        assert!(!is_valid_transition(RunStatus::Cancelled, RunStatus::Planning));
        assert!(!is_valid_transition(RunStatus::Failed, RunStatus::Cancelled));
    }

    #[test]
    fn test_is_cancellable() {
        assert!(is_cancellable(RunStatus::Queued));
        assert!(is_cancellable(RunStatus::Validating));
        assert!(!is_cancellable(RunStatus::Completed));
        assert!(!is_cancellable(RunStatus::Cancelled));
    }

    #[test]
    fn test_next_phase_walks_pipeline() {
        assert_eq!(next_phase(Phase::Plan), Some(Phase::Checklist));
        assert_eq!(next_phase(Phase::Validate), Some(Phase::Summarize));
        assert_eq!(next_phase(Phase::Summarize), None);
    }

    #[test]
    fn test_progress_for_counts_phases() {
        assert_eq!(progress_for(0), 0.0);
        assert!((progress_for(2) - 0.4).abs() < f64::EPSILON);
        assert_eq!(progress_for(5), 1.0);
    }
}
