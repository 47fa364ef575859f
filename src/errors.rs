//! Typed error hierarchy for the run orchestration engine.
//!
//! Four enums cover the subsystem seams:
//! - `ValidationError`: malformed run creation input, rejected before a run exists
//! - `ToolError`: Tool Gateway failures (timeouts, policy rejections, subprocess failures)
//! - `ModelError`: Model Router failures after backoff and failover
//! - `StepError`: what a phase handler returns when it cannot produce an outcome

use std::time::Duration;

use thiserror::Error;

/// Errors raised while validating a run creation request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    #[error("Unknown model profile: {0}")]
    UnknownModelProfile(String),

    #[error("Invalid pagination: {0}")]
    InvalidPagination(String),
}

/// Errors from a single Tool Gateway invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{tool} timed out after {}ms", after.as_millis())]
    Timeout { tool: &'static str, after: Duration },

    #[error("{tool} cancelled")]
    Cancelled { tool: &'static str },

    #[error("{tool} rejected: {detail}")]
    NotAllowed { tool: &'static str, detail: String },

    #[error("{tool} failed: {message}")]
    Failed { tool: &'static str, message: String },

    #[error("Working copy unavailable: {0}")]
    WorkspaceUnavailable(String),

    #[error("{tool} I/O error: {source}")]
    Io {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl ToolError {
    /// Whether a local retry of the same call can reasonably succeed.
    /// Policy rejections and cancellation are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ToolError::Timeout { .. } | ToolError::Failed { .. } | ToolError::Io { .. }
        )
    }

    /// Stable machine-readable code recorded in the event log.
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::Timeout { .. } => "timeout",
            ToolError::Cancelled { .. } => "cancelled",
            ToolError::NotAllowed { .. } => "not_allowed",
            ToolError::Failed { .. } => "failed",
            ToolError::WorkspaceUnavailable(_) => "workspace_unavailable",
            ToolError::Io { .. } => "io",
        }
    }
}

/// Errors from the Model Router and its providers.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Provider {provider} error: {message}")]
    Provider { provider: String, message: String },

    #[error("Provider {provider} timed out")]
    Timeout { provider: String },

    #[error("Provider {provider} returned an invalid response: {message}")]
    InvalidResponse { provider: String, message: String },

    #[error("Model unavailable after {attempts} consecutive failures")]
    Unavailable { attempts: u32 },

    #[error("Unknown model profile: {0}")]
    UnknownProfile(String),

    #[error("Model call cancelled")]
    Cancelled,
}

/// Errors a phase handler can return instead of a `StepOutcome`.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("Run cancelled")]
    Cancelled,

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StepError {
    /// Human-readable failure message carried on the run.
    pub fn failure_message(&self) -> String {
        match self {
            StepError::Cancelled => "cancelled".to_string(),
            StepError::Model(ModelError::Cancelled) => "cancelled".to_string(),
            StepError::Model(e) => format!("model unavailable: {}", e),
            StepError::Tool(e) => format!("tool error: {}", e),
            StepError::Internal(e) => format!("internal error: {:#}", e),
        }
    }

    /// Whether this error represents cooperative cancellation rather than failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            StepError::Cancelled
                | StepError::Model(ModelError::Cancelled)
                | StepError::Tool(ToolError::Cancelled { .. })
        )
    }
}
