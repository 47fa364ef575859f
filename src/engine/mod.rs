//! Run Orchestration Engine.
//!
//! ```text
//!  POST /api/runs ──► RunRegistry ──(slot)──► Orchestrator ──► StepExecutor
//!                        │                        │               │
//!                   cancel token             EventLog         ToolGateway
//!                        │                        │           ModelRouter
//!                        └──────► RunDb ◄─────────┘           RepoMemory
//! ```
//!
//! - `models`: run, status, phase, event and artifact types
//! - `db`: SQLite persistence behind `DbHandle`
//! - `event_log`: append-only events and the artifact snapshot
//! - `documents`: plan, checklist and summary documents
//! - `steps`: the five phase handlers and their prompts
//! - `orchestrator`: per-run state machine and repair loop
//! - `registry`: create/list/get/cancel with a concurrency cap

pub mod db;
pub mod documents;
pub mod event_log;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod steps;

pub use event_log::{EventLog, EventSink};
pub use registry::{CancelResponse, RegistryError, RunRegistry};
