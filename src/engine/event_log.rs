use anyhow::Result;

use super::db::DbHandle;
use super::models::*;

/// Append-only event stream plus the derived artifact snapshot, backed by the
/// run store. Clients poll the run and artifacts endpoints.
#[derive(Clone)]
pub struct EventLog {
    db: DbHandle,
}

impl EventLog {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub async fn append(
        &self,
        run_id: &str,
        phase: Option<Phase>,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<StepEvent> {
        let run_id = run_id.to_string();
        self.db
            .call(move |db| db.append_event(&run_id, phase, kind, &payload))
            .await
    }

    /// Persist a run state change. `None` means the run was already terminal.
    pub async fn record_state(&self, run_id: &str, update: RunStateUpdate) -> Result<Option<Run>> {
        let run_id = run_id.to_string();
        self.db
            .call(move |db| db.update_run_state(&run_id, &update))
            .await
    }

    pub async fn apply_artifacts(&self, run_id: &str, update: ArtifactUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let id = run_id.to_string();
        self.db
            .call(move |db| db.apply_artifacts(&id, &update))
            .await
    }

    pub async fn artifacts(&self, run_id: &str) -> Result<ArtifactsResponse> {
        let run_id = run_id.to_string();
        self.db
            .call(move |db| {
                let snapshot = db.get_artifacts(&run_id)?;
                let events = db.list_events(&run_id)?;
                Ok(ArtifactsResponse::new(snapshot, events))
            })
            .await
    }

    /// A writer scoped to one run and (optionally) one phase.
    pub fn sink(&self, run_id: &str) -> EventSink {
        EventSink {
            log: self.clone(),
            run_id: run_id.to_string(),
            phase: None,
        }
    }
}

/// Scoped event writer handed to tools and model routing.
///
/// Audit writes are best effort from the caller's point of view: a persistence
/// failure is reported through tracing and does not abort the operation that
/// produced the event.
#[derive(Clone)]
pub struct EventSink {
    log: EventLog,
    run_id: String,
    phase: Option<Phase>,
}

impl EventSink {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn phase(&self) -> Option<Phase> {
        self.phase
    }

    pub fn for_phase(&self, phase: Phase) -> EventSink {
        EventSink {
            phase: Some(phase),
            ..self.clone()
        }
    }

    pub async fn emit(&self, kind: EventKind, payload: serde_json::Value) {
        if let Err(e) = self.log.append(&self.run_id, self.phase, kind, payload).await {
            tracing::error!(
                run_id = %self.run_id,
                kind = kind.as_str(),
                error = %e,
                "failed to append event"
            );
        }
    }
}
