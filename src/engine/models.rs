use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;

pub const DEFAULT_BASE_BRANCH: &str = "main";
pub const DEFAULT_MODEL_PROFILE: &str = "default";

/// RFC 3339 UTC timestamp with millisecond precision.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ── Run status ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Planning,
    Checklist,
    Executing,
    Validating,
    Summarizing,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Planning => "planning",
            Self::Checklist => "checklist",
            Self::Executing => "executing",
            Self::Validating => "validating",
            Self::Summarizing => "summarizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The phase a run in this status is working on, if any.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Planning => Some(Phase::Plan),
            Self::Checklist => Some(Phase::Checklist),
            Self::Executing => Some(Phase::Execute),
            Self::Validating => Some(Phase::Validate),
            Self::Summarizing => Some(Phase::Summarize),
            _ => None,
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "planning" => Ok(Self::Planning),
            "checklist" => Ok(Self::Checklist),
            "executing" => Ok(Self::Executing),
            "validating" => Ok(Self::Validating),
            "summarizing" => Ok(Self::Summarizing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Phases ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Plan,
    Checklist,
    Execute,
    Validate,
    Summarize,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Plan,
        Phase::Checklist,
        Phase::Execute,
        Phase::Validate,
        Phase::Summarize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Checklist => "checklist",
            Self::Execute => "execute",
            Self::Validate => "validate",
            Self::Summarize => "summarize",
        }
    }

    /// Run status while this phase is active.
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Plan => RunStatus::Planning,
            Self::Checklist => RunStatus::Checklist,
            Self::Execute => RunStatus::Executing,
            Self::Validate => RunStatus::Validating,
            Self::Summarize => RunStatus::Summarizing,
        }
    }

    /// Label stored in `Run::current_step`.
    pub fn step_label(&self) -> &'static str {
        self.status().as_str()
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "checklist" => Ok(Self::Checklist),
            "execute" => Ok(Self::Execute),
            "validate" => Ok(Self::Validate),
            "summarize" => Ok(Self::Summarize),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Events ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    ToolCall,
    ToolResult,
    ModelCall,
    Retry,
    Error,
    Completed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::ModelCall => "model_call",
            Self::Retry => "retry",
            Self::Error => "error",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "tool_call" => Ok(Self::ToolCall),
            "tool_result" => Ok(Self::ToolResult),
            "model_call" => Ok(Self::ModelCall),
            "retry" => Ok(Self::Retry),
            "error" => Ok(Self::Error),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid event kind: {}", s)),
        }
    }
}

/// An immutable entry in a run's event stream. `phase` is `None` for
/// run-level lifecycle events (queueing, cancellation, terminal failure).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepEvent {
    pub run_id: String,
    pub sequence_no: i64,
    pub phase: Option<Phase>,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub timestamp: String,
}

// ── Runs ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    pub current_step: Option<String>,
    pub progress: f64,
    pub message: Option<String>,
    pub feature_request: String,
    pub repo_path: String,
    pub base_branch: String,
    pub model_profile: String,
    pub created_at: String,
    pub updated_at: String,
    pub cancel_requested: bool,
}

impl Run {
    pub fn new(request: NewRun) -> Self {
        let now = now_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: RunStatus::Queued,
            current_step: None,
            progress: 0.0,
            message: None,
            feature_request: request.feature_request,
            repo_path: request.repo_path,
            base_branch: request.base_branch,
            model_profile: request.model_profile,
            created_at: now.clone(),
            updated_at: now,
            cancel_requested: false,
        }
    }
}

/// A change to a run's mutable state, applied atomically by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStateUpdate {
    pub status: RunStatus,
    pub current_step: Option<String>,
    pub progress: f64,
    pub message: Option<String>,
}

/// Validated run creation input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRun {
    pub feature_request: String,
    pub repo_path: String,
    pub base_branch: String,
    pub model_profile: String,
}

/// Raw `POST /api/runs` body. Fields are optional so that missing values
/// surface as `ValidationError`s with a field name rather than a parse error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateRunRequest {
    pub feature_request: Option<String>,
    pub repo_path: Option<String>,
    pub base_branch: Option<String>,
    pub model_profile: Option<String>,
}

impl CreateRunRequest {
    pub fn validate<F>(self, profile_exists: F) -> Result<NewRun, ValidationError>
    where
        F: Fn(&str) -> bool,
    {
        let feature_request = required("feature_request", self.feature_request)?;
        let repo_path = required("repo_path", self.repo_path)?;
        let base_branch = optional_or(self.base_branch, DEFAULT_BASE_BRANCH);
        let model_profile = optional_or(self.model_profile, DEFAULT_MODEL_PROFILE);

        if !profile_exists(&model_profile) {
            return Err(ValidationError::UnknownModelProfile(model_profile));
        }

        Ok(NewRun {
            feature_request,
            repo_path,
            base_branch,
            model_profile,
        })
    }
}

fn required(field: &'static str, value: Option<String>) -> Result<String, ValidationError> {
    let value = value.ok_or(ValidationError::MissingField(field))?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyField(field));
    }
    Ok(trimmed.to_string())
}

fn optional_or(value: Option<String>, default: &str) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunResponse {
    pub run_id: String,
    pub status: RunStatus,
    pub current_step: Option<String>,
    pub progress: f64,
    pub message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&Run> for RunResponse {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.id.clone(),
            status: run.status,
            current_step: run.current_step.clone(),
            progress: run.progress,
            message: run.message.clone(),
            created_at: run.created_at.clone(),
            updated_at: run.updated_at.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunListResponse {
    pub runs: Vec<RunResponse>,
    pub total: i64,
    pub page: u32,
    pub per_page: u32,
}

// ── Artifacts ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ArtifactSnapshot {
    pub run_id: String,
    pub plan_markdown: Option<String>,
    pub checklist_markdown: Option<String>,
    pub summary_markdown: Option<String>,
    pub diff: Option<String>,
}

impl ArtifactSnapshot {
    pub fn empty(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            ..Self::default()
        }
    }
}

/// Fields a phase produced; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtifactUpdate {
    pub plan_markdown: Option<String>,
    pub checklist_markdown: Option<String>,
    pub summary_markdown: Option<String>,
    pub diff: Option<String>,
}

impl ArtifactUpdate {
    pub fn is_empty(&self) -> bool {
        self.plan_markdown.is_none()
            && self.checklist_markdown.is_none()
            && self.summary_markdown.is_none()
            && self.diff.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsResponse {
    pub run_id: String,
    pub plan_markdown: Option<String>,
    pub checklist_markdown: Option<String>,
    pub summary_markdown: Option<String>,
    pub diff: Option<String>,
    pub raw_events: Vec<StepEvent>,
}

impl ArtifactsResponse {
    pub fn new(snapshot: ArtifactSnapshot, raw_events: Vec<StepEvent>) -> Self {
        Self {
            run_id: snapshot.run_id,
            plan_markdown: snapshot.plan_markdown,
            checklist_markdown: snapshot.checklist_markdown,
            summary_markdown: snapshot.summary_markdown,
            diff: snapshot.diff,
            raw_events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_roundtrip() {
        let all = [
            RunStatus::Queued,
            RunStatus::Planning,
            RunStatus::Checklist,
            RunStatus::Executing,
            RunStatus::Validating,
            RunStatus::Summarizing,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ];
        for status in all {
            assert_eq!(RunStatus::from_str(status.as_str()).unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!(RunStatus::from_str("running").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Validating.is_terminal());
    }

    #[test]
    fn test_phase_status_mapping() {
        for phase in Phase::ALL {
            assert_eq!(phase.status().phase(), Some(phase));
            assert_eq!(Phase::from_str(phase.as_str()).unwrap(), phase);
        }
        assert_eq!(Phase::Plan.step_label(), "planning");
        assert_eq!(RunStatus::Queued.phase(), None);
    }

    #[test]
    fn test_event_kind_serializes_snake_case() {
        let json = serde_json::to_string(&EventKind::ToolCall).unwrap();
        assert_eq!(json, "\"tool_call\"");
        assert_eq!(EventKind::from_str("model_call").unwrap(), EventKind::ModelCall);
    }

    #[test]
    fn test_create_request_applies_defaults() {
        let request = CreateRunRequest {
            feature_request: Some("  Add retry limit  ".into()),
            repo_path: Some("/tmp/repo".into()),
            base_branch: None,
            model_profile: Some(String::new()),
        };
        let new_run = request.validate(|p| p == "default").unwrap();
        assert_eq!(new_run.feature_request, "Add retry limit");
        assert_eq!(new_run.base_branch, "main");
        assert_eq!(new_run.model_profile, "default");
    }

    #[test]
    fn test_create_request_rejects_missing_repo_path() {
        let request = CreateRunRequest {
            feature_request: Some("x".into()),
            ..Default::default()
        };
        assert_eq!(
            request.validate(|_| true).unwrap_err(),
            ValidationError::MissingField("repo_path")
        );
    }

    #[test]
    fn test_create_request_rejects_blank_feature_request() {
        let request = CreateRunRequest {
            feature_request: Some("   ".into()),
            repo_path: Some("/tmp".into()),
            ..Default::default()
        };
        assert_eq!(
            request.validate(|_| true).unwrap_err(),
            ValidationError::EmptyField("feature_request")
        );
    }

    #[test]
    fn test_create_request_rejects_unknown_profile() {
        let request = CreateRunRequest {
            feature_request: Some("x".into()),
            repo_path: Some("/tmp".into()),
            model_profile: Some("turbo".into()),
            ..Default::default()
        };
        assert_eq!(
            request.validate(|p| p == "default").unwrap_err(),
            ValidationError::UnknownModelProfile("turbo".into())
        );
    }

    #[test]
    fn test_new_run_starts_queued() {
        let run = Run::new(NewRun {
            feature_request: "x".into(),
            repo_path: "/tmp".into(),
            base_branch: "main".into(),
            model_profile: "default".into(),
        });
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.progress, 0.0);
        assert!(!run.cancel_requested);
        assert_eq!(run.created_at, run.updated_at);
        let response = RunResponse::from(&run);
        assert_eq!(response.run_id, run.id);
        assert!(response.current_step.is_none());
    }

    #[test]
    fn test_artifact_update_is_empty() {
        assert!(ArtifactUpdate::default().is_empty());
        let update = ArtifactUpdate {
            diff: Some(String::new()),
            ..Default::default()
        };
        assert!(!update.is_empty());
    }
}
