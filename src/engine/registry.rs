use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::event_log::EventLog;
use super::models::*;
use super::orchestrator::{Orchestrator, is_cancellable};
use super::steps::StepContext;
use crate::config::DevflowConfig;
use crate::errors::ValidationError;
use crate::llm::{ModelRouter, ProviderRegistry};
use crate::memory::RepoMemory;
use crate::tools::{GatewayPolicy, ToolGateway};

pub const RESTART_MESSAGE: &str = "interrupted by server restart";
pub const DEFAULT_PER_PAGE: u32 = 20;
pub const MAX_PER_PAGE: u32 = 100;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Run not found: {0}")]
    NotFound(String),

    #[error("Run cannot be cancelled")]
    NotCancellable { status: RunStatus },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CancelResponse {
    pub status: String,
    pub run_id: String,
}

/// Live handle for one run's orchestrator task.
struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Entry point for create/list/get/cancel. Owns the id→handle map and the
/// cap on concurrently executing runs; runs over the cap wait in `queued`.
#[derive(Clone)]
pub struct RunRegistry {
    log: EventLog,
    config: Arc<DevflowConfig>,
    providers: Arc<ProviderRegistry>,
    slots: Arc<Semaphore>,
    handles: Arc<Mutex<HashMap<String, RunHandle>>>,
}

impl RunRegistry {
    pub fn new(log: EventLog, config: Arc<DevflowConfig>, providers: Arc<ProviderRegistry>) -> Self {
        let slots = Arc::new(Semaphore::new(config.engine.max_concurrent_runs.max(1)));
        Self {
            log,
            config,
            providers,
            slots,
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    pub fn config(&self) -> &DevflowConfig {
        &self.config
    }

    /// Fail runs whose orchestrators died with a previous process.
    pub async fn recover_on_startup(&self) -> anyhow::Result<Vec<String>> {
        let ids = self
            .log
            .db()
            .call(|db| db.fail_interrupted_runs(RESTART_MESSAGE))
            .await?;
        for id in &ids {
            tracing::warn!(run_id = %id, "marked interrupted run as failed");
            self.log
                .sink(id)
                .emit(EventKind::Error, serde_json::json!({"terminal": true, "reason": RESTART_MESSAGE}))
                .await;
        }
        Ok(ids)
    }

    pub async fn create(&self, request: CreateRunRequest) -> Result<RunResponse, RegistryError> {
        let profiles = &self.config.models.profiles;
        let new_run = request.validate(|name| profiles.contains_key(name))?;
        let run = Run::new(new_run);

        let insert = run.clone();
        self.log.db().call(move |db| db.insert_run(&insert)).await?;
        tracing::info!(run_id = %run.id, profile = %run.model_profile, repo = %run.repo_path, "run queued");

        let response = RunResponse::from(&run);
        let cancel = CancellationToken::new();
        // Held across spawn so a cancel racing this create always finds the handle.
        let mut handles = self.handles.lock().await;
        let task = tokio::spawn(execute_run(
            run.clone(),
            self.log.clone(),
            self.config.clone(),
            self.providers.clone(),
            self.slots.clone(),
            cancel.clone(),
        ));
        handles.insert(run.id, RunHandle { cancel, task });
        Ok(response)
    }

    pub async fn list(&self, page: Option<u32>, per_page: Option<u32>) -> Result<RunListResponse, RegistryError> {
        let page = page.unwrap_or(1);
        let per_page = per_page.unwrap_or(DEFAULT_PER_PAGE);
        if page == 0 {
            return Err(ValidationError::InvalidPagination("page must be at least 1".into()).into());
        }
        if per_page == 0 || per_page > MAX_PER_PAGE {
            return Err(ValidationError::InvalidPagination(format!(
                "per_page must be between 1 and {}",
                MAX_PER_PAGE
            ))
            .into());
        }

        let (runs, total) = self
            .log
            .db()
            .call(move |db| db.list_runs(page, per_page))
            .await?;
        Ok(RunListResponse {
            runs: runs.iter().map(RunResponse::from).collect(),
            total,
            page,
            per_page,
        })
    }

    pub async fn get(&self, id: &str) -> Result<RunResponse, RegistryError> {
        self.load(id).await.map(|run| RunResponse::from(&run))
    }

    pub async fn artifacts(&self, id: &str) -> Result<ArtifactsResponse, RegistryError> {
        self.load(id).await?;
        Ok(self.log.artifacts(id).await?)
    }

    /// Request cooperative cancellation. Returns immediately; the run reaches
    /// `cancelled` at its next checkpoint.
    pub async fn cancel(&self, id: &str) -> Result<CancelResponse, RegistryError> {
        let run = self.load(id).await?;
        if !is_cancellable(run.status) {
            return Err(RegistryError::NotCancellable { status: run.status });
        }

        let run_id = id.to_string();
        let flagged = self
            .log
            .db()
            .call(move |db| db.set_cancel_requested(&run_id))
            .await?;
        if !flagged {
            // Finished between the read and the write.
            let status = self.load(id).await?.status;
            return Err(RegistryError::NotCancellable { status });
        }

        if let Some(handle) = self.handles.lock().await.get(id) {
            handle.cancel.cancel();
        }
        tracing::info!(run_id = %id, status = %run.status, "cancellation requested");
        Ok(CancelResponse {
            status: "cancel_requested".to_string(),
            run_id: id.to_string(),
        })
    }

    /// Cancel every live run and wait up to `grace` for each to settle.
    pub async fn shutdown(&self, grace: Duration) {
        let mut handles = self.handles.lock().await;
        for handle in handles.values() {
            handle.cancel.cancel();
        }
        for (id, handle) in handles.drain() {
            if handle.task.is_finished() {
                continue;
            }
            if tokio::time::timeout(grace, handle.task).await.is_err() {
                tracing::warn!(run_id = %id, "run did not stop within shutdown grace");
            }
        }
    }

    async fn load(&self, id: &str) -> Result<Run, RegistryError> {
        let run_id = id.to_string();
        self.log
            .db()
            .call(move |db| db.get_run(&run_id))
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }
}

/// Body of one run's task: wait for a slot (or cancellation), then hand the
/// run to its orchestrator.
async fn execute_run(
    run: Run,
    log: EventLog,
    config: Arc<DevflowConfig>,
    providers: Arc<ProviderRegistry>,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    // A run cancelled while queued proceeds without a slot; the orchestrator
    // sees the token before entering its first phase.
    let _permit = tokio::select! {
        permit = slots.acquire_owned() => permit.ok(),
        _ = cancel.cancelled() => None,
    };

    let events = log.sink(&run.id);
    let router = match ModelRouter::resolve(&run.model_profile, &config.models, &providers) {
        Ok(router) => router,
        Err(e) => {
            tracing::error!(run_id = %run.id, error = %e, "model routing unavailable");
            events
                .emit(EventKind::Error, serde_json::json!({"terminal": true, "reason": e.to_string()}))
                .await;
            let update = RunStateUpdate {
                status: RunStatus::Failed,
                current_step: None,
                progress: run.progress,
                message: Some(format!("model unavailable: {}", e)),
            };
            if let Err(e) = log.record_state(&run.id, update).await {
                tracing::error!(run_id = %run.id, error = %e, "failed to record run failure");
            }
            return;
        }
    };

    let ctx = StepContext {
        tools: ToolGateway::new(GatewayPolicy::from(config.as_ref()), cancel, events.clone()),
        memory: RepoMemory::new(config.memory.clone()),
        router,
        config,
        events,
        run,
    };
    Orchestrator::new(ctx, log).start().await;
}
