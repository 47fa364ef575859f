//! API server command: `devflow serve`.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

use devflow::config::DevflowConfig;
use devflow::{server, telemetry};

/// Flag overrides applied on top of file and environment configuration.
#[derive(Debug, Default)]
pub struct ServeOverrides {
    pub port: Option<u16>,
    pub host: Option<String>,
    pub db_path: Option<PathBuf>,
    pub dev: bool,
}

pub async fn cmd_serve(config_path: Option<&Path>, overrides: ServeOverrides) -> Result<()> {
    let mut config = DevflowConfig::resolve(config_path)?;
    if let Some(port) = overrides.port {
        config.server.port = port;
    }
    if let Some(host) = overrides.host {
        config.server.host = host;
    }
    if let Some(db_path) = overrides.db_path {
        config.server.db_path = db_path;
    }
    if overrides.dev && config.logging.level == "info" {
        config.logging.level = "debug".to_string();
    }

    let _guard = telemetry::init(&config.logging)?;

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            tracing::error!(%problem, "invalid configuration");
        }
        bail!("{} configuration problem(s); run `devflow config validate`", problems.len());
    }

    server::start_server(config, overrides.dev).await
}
