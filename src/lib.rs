pub mod api;
pub mod config;
pub mod engine;
pub mod errors;
pub mod llm;
pub mod memory;
pub mod server;
pub mod telemetry;
pub mod tools;
pub mod util;
