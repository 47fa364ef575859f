//! Provider backed by a local command (a CLI agent or a wrapper script).
//!
//! The prompt is written to stdin (system prompt first, separated by a blank
//! line); stdout is the completion. The model name and JSON mode are passed in
//! `DEVFLOW_MODEL` and `DEVFLOW_JSON`.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{ModelProvider, ModelRequest, ModelResponse, TokenUsage};
use crate::config::ProviderSpec;
use crate::errors::ModelError;

pub struct CommandProvider {
    name: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandProvider {
    pub fn new(name: &str, spec: &ProviderSpec) -> Result<Self> {
        let argv = spec
            .command
            .as_deref()
            .with_context(|| format!("provider '{}' has no command", name))?;
        let Some((program, args)) = argv.split_first() else {
            bail!("provider '{}' has an empty command", name);
        };
        Ok(Self {
            name: name.to_string(),
            program: program.clone(),
            args: args.to_vec(),
            timeout: Duration::from_secs(spec.timeout_secs),
        })
    }

    fn error(&self, message: impl Into<String>) -> ModelError {
        ModelError::Provider {
            provider: self.name.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl ModelProvider for CommandProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("DEVFLOW_MODEL", &request.model)
            .env("DEVFLOW_JSON", if request.json { "1" } else { "0" })
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.error(format!("failed to spawn {}: {}", self.program, e)))?;

        let input = if request.system.is_empty() {
            request.prompt.clone()
        } else {
            format!("{}\n\n{}", request.system, request.prompt)
        };
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| self.error(format!("failed to write prompt: {}", e)))?;
            // stdin is dropped here, closing the pipe
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| self.error(e.to_string()))?,
            Err(_) => {
                return Err(ModelError::Timeout {
                    provider: self.name.clone(),
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.error(format!(
                "exited with {:?}: {}",
                output.status.code(),
                stderr.trim().chars().take(500).collect::<String>()
            )));
        }

        let content = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if content.is_empty() {
            return Err(ModelError::InvalidResponse {
                provider: self.name.clone(),
                message: "empty output".into(),
            });
        }
        Ok(ModelResponse {
            content,
            usage: TokenUsage::default(),
        })
    }
}
