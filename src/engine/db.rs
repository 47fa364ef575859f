use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Async-safe handle to the run store.
///
/// Wraps `RunDb` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, keeping synchronous SQLite I/O off the
/// async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<RunDb>>,
}

impl DbHandle {
    pub fn new(db: RunDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open an in-memory store. Test and tooling convenience.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(RunDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&RunDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct RunDb {
    conn: Connection,
}

const TERMINAL_STATUSES: &str = "('completed', 'failed', 'cancelled')";

const RUN_COLUMNS: &str = "id, status, current_step, progress, message, feature_request, repo_path, \
     base_branch, model_profile, cancel_requested, created_at, updated_at";

impl RunDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL DEFAULT 'queued',
                    current_step TEXT,
                    progress REAL NOT NULL DEFAULT 0,
                    message TEXT,
                    feature_request TEXT NOT NULL,
                    repo_path TEXT NOT NULL,
                    base_branch TEXT NOT NULL,
                    model_profile TEXT NOT NULL,
                    cancel_requested INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS run_artifacts (
                    run_id TEXT PRIMARY KEY REFERENCES runs(id) ON DELETE CASCADE,
                    plan_markdown TEXT,
                    checklist_markdown TEXT,
                    summary_markdown TEXT,
                    diff TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS run_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    sequence_no INTEGER NOT NULL,
                    phase TEXT,
                    kind TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    UNIQUE(run_id, sequence_no)
                );

                CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at);
                CREATE INDEX IF NOT EXISTS idx_run_events_run ON run_events(run_id, sequence_no);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    pub fn insert_run(&self, run: &Run) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO runs (id, status, current_step, progress, message, feature_request, repo_path,
                                   base_branch, model_profile, cancel_requested, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    run.id,
                    run.status.as_str(),
                    run.current_step,
                    run.progress,
                    run.message,
                    run.feature_request,
                    run.repo_path,
                    run.base_branch,
                    run.model_profile,
                    run.cancel_requested,
                    run.created_at,
                    run.updated_at,
                ],
            )
            .context("Failed to insert run")?;
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                params![id],
                RunRow::from_row,
            )
            .optional()
            .context("Failed to query run")?;
        row.map(RunRow::into_run).transpose()
    }

    /// One page of runs, newest first, plus the total count.
    pub fn list_runs(&self, page: u32, per_page: u32) -> Result<(Vec<Run>, i64)> {
        let total: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))
            .context("Failed to count runs")?;

        let offset = i64::from(page.saturating_sub(1)) * i64::from(per_page);
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM runs ORDER BY created_at DESC, rowid DESC LIMIT ?1 OFFSET ?2",
                RUN_COLUMNS
            ))
            .context("Failed to prepare list_runs")?;
        let rows = stmt
            .query_map(params![i64::from(per_page), offset], RunRow::from_row)
            .context("Failed to list runs")?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read run row")?.into_run()?);
        }
        Ok((runs, total))
    }

    /// Apply a state change unless the run is already terminal. Progress never
    /// decreases. Returns the stored run, or `None` when the update was refused.
    pub fn update_run_state(&self, id: &str, update: &RunStateUpdate) -> Result<Option<Run>> {
        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE runs
                     SET status = ?2, current_step = ?3, progress = MAX(progress, ?4),
                         message = ?5, updated_at = ?6
                     WHERE id = ?1 AND status NOT IN {}",
                    TERMINAL_STATUSES
                ),
                params![
                    id,
                    update.status.as_str(),
                    update.current_step,
                    update.progress,
                    update.message,
                    now_rfc3339(),
                ],
            )
            .context("Failed to update run state")?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_run(id)
    }

    /// Set the advisory cancellation flag on a non-terminal run.
    /// Returns `false` when the run is unknown or already terminal.
    pub fn set_cancel_requested(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE runs SET cancel_requested = 1, updated_at = ?2
                     WHERE id = ?1 AND status NOT IN {}",
                    TERMINAL_STATUSES
                ),
                params![id, now_rfc3339()],
            )
            .context("Failed to set cancel_requested")?;
        Ok(changed > 0)
    }

    /// Fail every non-terminal run. Used at startup: their orchestrators died
    /// with the previous process.
    pub fn fail_interrupted_runs(&self, message: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT id FROM runs WHERE status NOT IN {}",
                TERMINAL_STATUSES
            ))
            .context("Failed to prepare interrupted run query")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query interrupted runs")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read interrupted run ids")?;

        for id in &ids {
            self.conn
                .execute(
                    "UPDATE runs SET status = 'failed', message = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, message, now_rfc3339()],
                )
                .context("Failed to fail interrupted run")?;
        }
        Ok(ids)
    }

    // ── Events ────────────────────────────────────────────────────────

    /// Append an event, allocating the next per-run sequence number under
    /// the same connection lock so numbering is gap-free and strictly increasing.
    pub fn append_event(
        &self,
        run_id: &str,
        phase: Option<Phase>,
        kind: EventKind,
        payload: &serde_json::Value,
    ) -> Result<StepEvent> {
        let sequence_no: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(sequence_no), 0) + 1 FROM run_events WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .context("Failed to allocate event sequence number")?;
        let timestamp = now_rfc3339();
        let payload_json = serde_json::to_string(payload).context("Failed to encode payload")?;

        self.conn
            .execute(
                "INSERT INTO run_events (run_id, sequence_no, phase, kind, payload, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run_id,
                    sequence_no,
                    phase.map(|p| p.as_str()),
                    kind.as_str(),
                    payload_json,
                    timestamp,
                ],
            )
            .context("Failed to append event")?;

        Ok(StepEvent {
            run_id: run_id.to_string(),
            sequence_no,
            phase,
            kind,
            payload: payload.clone(),
            timestamp,
        })
    }

    pub fn list_events(&self, run_id: &str) -> Result<Vec<StepEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT run_id, sequence_no, phase, kind, payload, timestamp
                 FROM run_events WHERE run_id = ?1 ORDER BY sequence_no ASC",
            )
            .context("Failed to prepare list_events")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(EventRow {
                    run_id: row.get(0)?,
                    sequence_no: row.get(1)?,
                    phase: row.get(2)?,
                    kind: row.get(3)?,
                    payload: row.get(4)?,
                    timestamp: row.get(5)?,
                })
            })
            .context("Failed to list events")?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row.context("Failed to read event row")?.into_event()?);
        }
        Ok(events)
    }

    // ── Artifacts ─────────────────────────────────────────────────────

    /// Merge an artifact update: provided fields overwrite, absent fields keep
    /// their stored value.
    pub fn apply_artifacts(&self, run_id: &str, update: &ArtifactUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        self.conn
            .execute(
                "INSERT INTO run_artifacts (run_id, plan_markdown, checklist_markdown, summary_markdown, diff, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(run_id) DO UPDATE SET
                     plan_markdown = COALESCE(excluded.plan_markdown, plan_markdown),
                     checklist_markdown = COALESCE(excluded.checklist_markdown, checklist_markdown),
                     summary_markdown = COALESCE(excluded.summary_markdown, summary_markdown),
                     diff = COALESCE(excluded.diff, diff),
                     updated_at = excluded.updated_at",
                params![
                    run_id,
                    update.plan_markdown,
                    update.checklist_markdown,
                    update.summary_markdown,
                    update.diff,
                    now_rfc3339(),
                ],
            )
            .context("Failed to apply artifacts")?;
        Ok(())
    }

    pub fn get_artifacts(&self, run_id: &str) -> Result<ArtifactSnapshot> {
        let snapshot = self
            .conn
            .query_row(
                "SELECT plan_markdown, checklist_markdown, summary_markdown, diff
                 FROM run_artifacts WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok(ArtifactSnapshot {
                        run_id: run_id.to_string(),
                        plan_markdown: row.get(0)?,
                        checklist_markdown: row.get(1)?,
                        summary_markdown: row.get(2)?,
                        diff: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query artifacts")?;
        Ok(snapshot.unwrap_or_else(|| ArtifactSnapshot::empty(run_id)))
    }
}

// ── Row types ─────────────────────────────────────────────────────────

struct RunRow {
    id: String,
    status: String,
    current_step: Option<String>,
    progress: f64,
    message: Option<String>,
    feature_request: String,
    repo_path: String,
    base_branch: String,
    model_profile: String,
    cancel_requested: bool,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            current_step: row.get(2)?,
            progress: row.get(3)?,
            message: row.get(4)?,
            feature_request: row.get(5)?,
            repo_path: row.get(6)?,
            base_branch: row.get(7)?,
            model_profile: row.get(8)?,
            cancel_requested: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_run(self) -> Result<Run> {
        let status = RunStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse run status")?;
        Ok(Run {
            id: self.id,
            status,
            current_step: self.current_step,
            progress: self.progress,
            message: self.message,
            feature_request: self.feature_request,
            repo_path: self.repo_path,
            base_branch: self.base_branch,
            model_profile: self.model_profile,
            created_at: self.created_at,
            updated_at: self.updated_at,
            cancel_requested: self.cancel_requested,
        })
    }
}

struct EventRow {
    run_id: String,
    sequence_no: i64,
    phase: Option<String>,
    kind: String,
    payload: String,
    timestamp: String,
}

impl EventRow {
    fn into_event(self) -> Result<StepEvent> {
        let phase = self
            .phase
            .as_deref()
            .map(Phase::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse event phase")?;
        let kind = EventKind::from_str(&self.kind)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse event kind")?;
        let payload = serde_json::from_str(&self.payload).context("Failed to decode payload")?;
        Ok(StepEvent {
            run_id: self.run_id,
            sequence_no: self.sequence_no,
            phase,
            kind,
            payload,
            timestamp: self.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_run(feature: &str) -> Run {
        Run::new(NewRun {
            feature_request: feature.to_string(),
            repo_path: "/tmp/repo".to_string(),
            base_branch: "main".to_string(),
            model_profile: "default".to_string(),
        })
    }

    fn state(status: RunStatus, progress: f64) -> RunStateUpdate {
        RunStateUpdate {
            status,
            current_step: status.phase().map(|p| p.step_label().to_string()),
            progress,
            message: None,
        }
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = RunDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('runs', 'run_artifacts', 'run_events')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 3);
        Ok(())
    }

    #[test]
    fn test_insert_and_get_run() -> Result<()> {
        let db = RunDb::new_in_memory()?;
        let run = sample_run("Add retry limit");
        db.insert_run(&run)?;

        let fetched = db.get_run(&run.id)?.expect("run should exist");
        assert_eq!(fetched.feature_request, "Add retry limit");
        assert_eq!(fetched.status, RunStatus::Queued);
        assert!(!fetched.cancel_requested);
        assert!(db.get_run("missing")?.is_none());
        Ok(())
    }

    #[test]
    fn test_list_runs_paginates_newest_first() -> Result<()> {
        let db = RunDb::new_in_memory()?;
        let mut ids = Vec::new();
        for i in 0..5 {
            let run = sample_run(&format!("feature {}", i));
            db.insert_run(&run)?;
            ids.push(run.id);
        }

        let (page1, total) = db.list_runs(1, 2)?;
        assert_eq!(total, 5);
        assert_eq!(page1.len(), 2);
        assert_eq!(page1[0].id, ids[4]);
        assert_eq!(page1[1].id, ids[3]);

        let (page3, _) = db.list_runs(3, 2)?;
        assert_eq!(page3.len(), 1);
        assert_eq!(page3[0].id, ids[0]);
        Ok(())
    }

    #[test]
    fn test_update_run_state_keeps_progress_monotonic() -> Result<()> {
        let db = RunDb::new_in_memory()?;
        let run = sample_run("x");
        db.insert_run(&run)?;

        db.update_run_state(&run.id, &state(RunStatus::Executing, 0.4))?;
        let updated = db
            .update_run_state(&run.id, &state(RunStatus::Validating, 0.2))?
            .expect("non-terminal update applies");
        assert_eq!(updated.status, RunStatus::Validating);
        assert_eq!(updated.progress, 0.4);
        Ok(())
    }

    #[test]
    fn test_terminal_run_never_changes() -> Result<()> {
        let db = RunDb::new_in_memory()?;
        let run = sample_run("x");
        db.insert_run(&run)?;

        db.update_run_state(&run.id, &state(RunStatus::Cancelled, 0.0))?;
        let refused = db.update_run_state(&run.id, &state(RunStatus::Executing, 0.6))?;
        assert!(refused.is_none());
        assert!(!db.set_cancel_requested(&run.id)?);

        let fetched = db.get_run(&run.id)?.unwrap();
        assert_eq!(fetched.status, RunStatus::Cancelled);
        Ok(())
    }

    #[test]
    fn test_set_cancel_requested() -> Result<()> {
        let db = RunDb::new_in_memory()?;
        let run = sample_run("x");
        db.insert_run(&run)?;
        assert!(db.set_cancel_requested(&run.id)?);
        assert!(db.get_run(&run.id)?.unwrap().cancel_requested);
        assert!(!db.set_cancel_requested("missing")?);
        Ok(())
    }

    #[test]
    fn test_event_sequence_numbers_are_per_run() -> Result<()> {
        let db = RunDb::new_in_memory()?;
        let a = sample_run("a");
        let b = sample_run("b");
        db.insert_run(&a)?;
        db.insert_run(&b)?;

        let payload = serde_json::json!({"tool": "repo_map"});
        let e1 = db.append_event(&a.id, Some(Phase::Plan), EventKind::Started, &payload)?;
        let e2 = db.append_event(&a.id, Some(Phase::Plan), EventKind::ToolCall, &payload)?;
        let f1 = db.append_event(&b.id, None, EventKind::Started, &payload)?;
        assert_eq!((e1.sequence_no, e2.sequence_no, f1.sequence_no), (1, 2, 1));

        let events = db.list_events(&a.id)?;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, EventKind::ToolCall);
        assert_eq!(events[1].payload["tool"], "repo_map");
        assert_eq!(events[0].phase, Some(Phase::Plan));
        Ok(())
    }

    #[test]
    fn test_artifacts_start_null_and_merge_per_field() -> Result<()> {
        let db = RunDb::new_in_memory()?;
        let run = sample_run("x");
        db.insert_run(&run)?;

        let empty = db.get_artifacts(&run.id)?;
        assert_eq!(empty, ArtifactSnapshot::empty(&run.id));

        db.apply_artifacts(
            &run.id,
            &ArtifactUpdate {
                plan_markdown: Some("# Plan".into()),
                ..Default::default()
            },
        )?;
        db.apply_artifacts(
            &run.id,
            &ArtifactUpdate {
                diff: Some("diff --git a/x b/x".into()),
                ..Default::default()
            },
        )?;
        db.apply_artifacts(
            &run.id,
            &ArtifactUpdate {
                diff: Some("diff --git a/y b/y".into()),
                ..Default::default()
            },
        )?;

        let snapshot = db.get_artifacts(&run.id)?;
        assert_eq!(snapshot.plan_markdown.as_deref(), Some("# Plan"));
        assert_eq!(snapshot.diff.as_deref(), Some("diff --git a/y b/y"));
        assert!(snapshot.summary_markdown.is_none());
        Ok(())
    }

    #[test]
    fn test_fail_interrupted_runs() -> Result<()> {
        let db = RunDb::new_in_memory()?;
        let active = sample_run("active");
        let done = sample_run("done");
        db.insert_run(&active)?;
        db.insert_run(&done)?;
        db.update_run_state(&active.id, &state(RunStatus::Executing, 0.4))?;
        db.update_run_state(&done.id, &state(RunStatus::Completed, 1.0))?;

        let failed = db.fail_interrupted_runs("interrupted by server restart")?;
        assert_eq!(failed, vec![active.id.clone()]);
        let run = db.get_run(&active.id)?.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.message.as_deref(), Some("interrupted by server restart"));
        assert_eq!(db.get_run(&done.id)?.unwrap().status, RunStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn test_db_handle_call() -> Result<()> {
        let handle = DbHandle::in_memory()?;
        let run = sample_run("async");
        let id = run.id.clone();
        handle.call(move |db| db.insert_run(&run)).await?;
        let fetched = handle.call(move |db| db.get_run(&id)).await?;
        assert!(fetched.is_some());
        Ok(())
    }
}
