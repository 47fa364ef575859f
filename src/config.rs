//! Layered configuration for the DevFlow engine.
//!
//! Configuration is resolved in order: built-in defaults → `.devflow/devflow.toml`
//! (or an explicit `--config` path) → `DEVFLOW_*` environment variables (after
//! `.env` is loaded) → CLI flags. Every numeric policy value (timeouts, attempt
//! budgets, retry counts, concurrency caps) lives here rather than in code.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8000
//! db_path = ".devflow/devflow.db"
//!
//! [engine]
//! max_concurrent_runs = 4
//! max_validation_attempts = 3
//! tool_retries = 2
//! executor_concurrency = 2
//!
//! [tools]
//! sandbox_timeout_secs = 300
//!
//! [sandbox]
//! backend = "local"
//! allowed_programs = ["pytest", "ruff", "python"]
//! # `{workdir}` is replaced with the run's working copy.
//! isolation_wrapper = ["bwrap", "--ro-bind", "/", "/", "--bind", "{workdir}", "{workdir}", "--unshare-net", "--"]
//!
//! [[validation.checks]]
//! name = "tests"
//! program = "pytest"
//! args = ["-q"]
//!
//! [models.providers.deepseek]
//! kind = "openai"
//! base_url = "https://api.deepseek.com"
//! api_key_env = "DEEPSEEK_API_KEY"
//!
//! [models.profiles.default]
//! primary = { provider = "deepseek", model = "deepseek-chat" }
//! secondary = { provider = "kimi", model = "moonshot-v1-32k" }
//!
//! [models.retry]
//! max_retries = 2
//! max_consecutive_failures = 6
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default config file location relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".devflow/devflow.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevflowConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub validation: ValidationSection,
    #[serde(default)]
    pub memory: MemorySection,
    #[serde(default)]
    pub models: ModelsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

// ── Server ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Attach a permissive CORS layer (dashboard served from another origin).
    pub cors_permissive: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            db_path: PathBuf::from(".devflow/devflow.db"),
            cors_permissive: false,
        }
    }
}

// ── Engine ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Worker pool size: runs beyond this wait in `queued`.
    pub max_concurrent_runs: usize,
    /// Upper bound on validate→execute repair cycles per run.
    pub max_validation_attempts: u32,
    /// Local retries for a single retryable tool call.
    pub tool_retries: u32,
    /// Per-run cap on concurrently executing checklist items.
    pub executor_concurrency: usize,
    /// Parent directory for per-run working copies.
    pub workspace_root: PathBuf,
    /// Keep working copies after a run reaches a terminal status.
    pub keep_workspaces: bool,
    /// Grace between SIGTERM and SIGKILL when tearing down a process group.
    pub cancel_grace_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 4,
            max_validation_attempts: 3,
            tool_retries: 2,
            executor_concurrency: 2,
            workspace_root: PathBuf::from(".devflow/workspaces"),
            keep_workspaces: false,
            cancel_grace_ms: 250,
        }
    }
}

// ── Tools ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub repo_map_timeout_secs: u64,
    pub git_timeout_secs: u64,
    pub sandbox_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            repo_map_timeout_secs: 30,
            git_timeout_secs: 60,
            sandbox_timeout_secs: 300,
        }
    }
}

impl ToolsSection {
    pub fn repo_map_timeout(&self) -> Duration {
        Duration::from_secs(self.repo_map_timeout_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn sandbox_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox_timeout_secs)
    }
}

// ── Sandbox ───────────────────────────────────────────────────────────

/// Replaced with the run's working copy in `isolation_wrapper`.
pub const WORKDIR_PLACEHOLDER: &str = "{workdir}";

/// Bubblewrap: the host filesystem read-only, a private `/tmp`, the working
/// copy as the only writable bind mount, and a fresh network namespace.
pub const DEFAULT_ISOLATION_WRAPPER: &[&str] = &[
    "bwrap",
    "--ro-bind",
    "/",
    "/",
    "--dev",
    "/dev",
    "--proc",
    "/proc",
    "--tmpfs",
    "/tmp",
    "--bind",
    WORKDIR_PLACEHOLDER,
    WORKDIR_PLACEHOLDER,
    "--chdir",
    WORKDIR_PLACEHOLDER,
    "--unshare-net",
    "--die-with-parent",
    "--",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    /// Child process in the working copy, wrapped by `isolation_wrapper`.
    #[default]
    Local,
    /// `docker run --network none` with only the working copy mounted.
    Docker,
}

impl std::str::FromStr for SandboxBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(SandboxBackend::Local),
            "docker" => Ok(SandboxBackend::Docker),
            _ => anyhow::bail!("Invalid sandbox backend '{}'. Valid values: local, docker", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub backend: SandboxBackend,
    pub allowed_programs: Vec<String>,
    /// Command prefix for the local backend. It must remove network access
    /// and leave only `{workdir}` (substituted per call) writable.
    pub isolation_wrapper: Vec<String>,
    /// Run the local backend without `isolation_wrapper`. Only for hosts
    /// that are already isolated (for example DevFlow itself in a container).
    pub unconfined: bool,
    pub image: String,
    pub memory: String,
    pub cpus: String,
    pub max_output_bytes: usize,
    pub denied_env_prefixes: Vec<String>,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Local,
            allowed_programs: ["pytest", "ruff", "mypy", "uv", "pip", "python"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            isolation_wrapper: DEFAULT_ISOLATION_WRAPPER.iter().map(|s| s.to_string()).collect(),
            unconfined: false,
            image: "python:3.12-slim".to_string(),
            memory: "512m".to_string(),
            cpus: "1.0".to_string(),
            max_output_bytes: 64 * 1024,
            denied_env_prefixes: [
                "DEVFLOW_",
                "DEEPSEEK_",
                "KIMI_",
                "MOONSHOT_",
                "OPENAI_",
                "ANTHROPIC_",
                "AWS_",
                "GITHUB_",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

// ── Validation ────────────────────────────────────────────────────────

/// One check the Validator runs inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSpec {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CheckSpec {
    pub fn new(name: &str, program: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSection {
    pub checks: Vec<CheckSpec>,
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            checks: vec![
                CheckSpec::new("lint", "ruff", &["check", "."]),
                CheckSpec::new("tests", "pytest", &["-q"]),
            ],
        }
    }
}

// ── Memory ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub top_k: usize,
    pub chunk_lines: usize,
    pub max_file_bytes: u64,
    pub ignore: Vec<String>,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            top_k: 6,
            chunk_lines: 40,
            max_file_bytes: 256 * 1024,
            ignore: ["*.lock", "*.min.js", "*.png", "*.jpg", "*.pdf", "*.zip"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

// ── Models ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible `/chat/completions` endpoint.
    Openai,
    /// Local command that reads the prompt on stdin and prints the completion.
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider_timeout_secs() -> u64 {
    120
}

impl ProviderSpec {
    fn openai(base_url: &str, api_key_env: &str) -> Self {
        Self {
            kind: ProviderKind::Openai,
            base_url: Some(base_url.to_string()),
            api_key_env: Some(api_key_env.to_string()),
            command: None,
            timeout_secs: default_provider_timeout_secs(),
        }
    }
}

/// A provider/model pair a profile routes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTarget {
    pub provider: String,
    pub model: String,
    /// Reasoning-tier model used for the execute phase, if different.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_model: Option<String>,
}

impl ModelTarget {
    pub fn new(provider: &str, model: &str) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            execute_model: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSpec {
    pub primary: ModelTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<ModelTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Retries per provider after the first attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Consecutive failures (across providers) that make the model unavailable.
    pub max_consecutive_failures: u32,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            max_consecutive_failures: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsSection {
    pub providers: BTreeMap<String, ProviderSpec>,
    pub profiles: BTreeMap<String, ProfileSpec>,
    pub retry: RetrySection,
}

impl Default for ModelsSection {
    fn default() -> Self {
        let mut providers = BTreeMap::new();
        providers.insert(
            "deepseek".to_string(),
            ProviderSpec::openai("https://api.deepseek.com", "DEEPSEEK_API_KEY"),
        );
        providers.insert(
            "kimi".to_string(),
            ProviderSpec::openai("https://api.moonshot.cn/v1", "KIMI_API_KEY"),
        );

        let mut profiles = BTreeMap::new();
        profiles.insert(
            "default".to_string(),
            ProfileSpec {
                primary: ModelTarget {
                    execute_model: Some("deepseek-reasoner".to_string()),
                    ..ModelTarget::new("deepseek", "deepseek-chat")
                },
                secondary: Some(ModelTarget::new("kimi", "moonshot-v1-32k")),
            },
        );
        profiles.insert(
            "fast".to_string(),
            ProfileSpec {
                primary: ModelTarget::new("deepseek", "deepseek-chat"),
                secondary: Some(ModelTarget::new("kimi", "moonshot-v1-8k")),
            },
        );
        profiles.insert(
            "quality".to_string(),
            ProfileSpec {
                primary: ModelTarget::new("deepseek", "deepseek-reasoner"),
                secondary: Some(ModelTarget::new("kimi", "moonshot-v1-128k")),
            },
        );

        Self {
            providers,
            profiles,
            retry: RetrySection::default(),
        }
    }
}

// ── Logging ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
    /// Directory for a daily-rolling log file, in addition to stderr.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────

impl DevflowConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse devflow.toml")
    }

    /// Load from `path` if given, else from the default location when it exists.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Resolve file and process environment layers.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Self::load_or_default(path)?;
        config.apply_env_with(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `DEVFLOW_*` overrides using the given lookup.
    pub fn apply_env_with<F>(&mut self, get: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = get("DEVFLOW_HOST") {
            self.server.host = host;
        }
        if let Some(port) = get("DEVFLOW_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid DEVFLOW_PORT '{}'", port))?;
        }
        if let Some(db_path) = get("DEVFLOW_DB_PATH") {
            self.server.db_path = PathBuf::from(db_path);
        }
        if let Some(n) = get("DEVFLOW_MAX_CONCURRENT_RUNS") {
            self.engine.max_concurrent_runs = n
                .parse()
                .with_context(|| format!("Invalid DEVFLOW_MAX_CONCURRENT_RUNS '{}'", n))?;
        }
        if let Some(n) = get("DEVFLOW_MAX_VALIDATION_ATTEMPTS") {
            self.engine.max_validation_attempts = n
                .parse()
                .with_context(|| format!("Invalid DEVFLOW_MAX_VALIDATION_ATTEMPTS '{}'", n))?;
        }
        if let Some(root) = get("DEVFLOW_WORKSPACE_ROOT") {
            self.engine.workspace_root = PathBuf::from(root);
        }
        if let Some(backend) = get("DEVFLOW_SANDBOX_BACKEND") {
            self.sandbox.backend = backend.parse()?;
        }
        if let Some(level) = get("DEVFLOW_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = get("DEVFLOW_LOG_JSON") {
            self.logging.json = json != "false" && json != "0";
        }
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Validate the configuration and return any problems.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.engine.max_concurrent_runs == 0 {
            problems.push("engine.max_concurrent_runs must be at least 1".to_string());
        }
        if self.engine.max_validation_attempts == 0 {
            problems.push("engine.max_validation_attempts must be at least 1".to_string());
        }
        if self.engine.executor_concurrency == 0 {
            problems.push("engine.executor_concurrency must be at least 1".to_string());
        }
        if self.sandbox.allowed_programs.is_empty() {
            problems.push("sandbox.allowed_programs is empty; nothing can run".to_string());
        }
        if self.sandbox.backend == SandboxBackend::Local
            && !self.sandbox.unconfined
            && !self.sandbox.isolation_wrapper.iter().any(|arg| arg.contains(WORKDIR_PLACEHOLDER))
        {
            problems.push(format!(
                "sandbox.isolation_wrapper must confine writes to {}; set sandbox.unconfined = true only if the host is already isolated",
                WORKDIR_PLACEHOLDER
            ));
        }
        for check in &self.validation.checks {
            if !self.sandbox.allowed_programs.contains(&check.program) {
                problems.push(format!(
                    "validation check '{}' uses '{}', which is not in sandbox.allowed_programs",
                    check.name, check.program
                ));
            }
        }
        if self.models.retry.max_consecutive_failures == 0 {
            problems.push("models.retry.max_consecutive_failures must be at least 1".to_string());
        }
        if !self.models.profiles.contains_key("default") {
            problems.push("models.profiles has no 'default' profile".to_string());
        }

        for (name, profile) in &self.models.profiles {
            let targets = std::iter::once(&profile.primary).chain(profile.secondary.as_ref());
            for target in targets {
                if !self.models.providers.contains_key(&target.provider) {
                    problems.push(format!(
                        "profile '{}' references unknown provider '{}'",
                        name, target.provider
                    ));
                }
            }
        }

        for (name, provider) in &self.models.providers {
            match provider.kind {
                ProviderKind::Openai if provider.base_url.is_none() => {
                    problems.push(format!("provider '{}' needs base_url", name));
                }
                ProviderKind::Command
                    if provider.command.as_ref().is_none_or(|c| c.is_empty()) =>
                {
                    problems.push(format!("provider '{}' needs a command", name));
                }
                _ => {}
            }
        }

        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = DevflowConfig::default();
        assert!(config.validate().is_empty(), "{:?}", config.validate());
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.engine.max_validation_attempts, 3);
        assert!(config.models.profiles.contains_key("fast"));
        assert!(config.models.profiles.contains_key("quality"));
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let config = DevflowConfig::parse(
            r#"
            [engine]
            max_validation_attempts = 5

            [sandbox]
            backend = "docker"
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.max_validation_attempts, 5);
        assert_eq!(config.engine.max_concurrent_runs, 4);
        assert_eq!(config.sandbox.backend, SandboxBackend::Docker);
        assert!(!config.sandbox.allowed_programs.is_empty());
    }

    #[test]
    fn test_parse_models_and_checks() {
        let config = DevflowConfig::parse(
            r#"
            [[validation.checks]]
            name = "unit"
            program = "cargo"
            args = ["test"]

            [models.providers.local]
            kind = "command"
            command = ["my-llm", "--json"]

            [models.profiles.default]
            primary = { provider = "local", model = "m1" }
            "#,
        )
        .unwrap();
        assert_eq!(config.validation.checks.len(), 1);
        assert_eq!(config.validation.checks[0].args, vec!["test"]);
        let local = &config.models.providers["local"];
        assert_eq!(local.kind, ProviderKind::Command);
        assert_eq!(local.timeout_secs, 120);
        assert!(config.models.profiles["default"].secondary.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("DEVFLOW_PORT", "9100"),
            ("DEVFLOW_MAX_VALIDATION_ATTEMPTS", "7"),
            ("DEVFLOW_SANDBOX_BACKEND", "docker"),
            ("DEVFLOW_LOG_JSON", "true"),
        ]
        .into_iter()
        .collect();
        let mut config = DevflowConfig::default();
        config
            .apply_env_with(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.engine.max_validation_attempts, 7);
        assert_eq!(config.sandbox.backend, SandboxBackend::Docker);
        assert!(config.logging.json);
    }

    #[test]
    fn test_env_override_rejects_bad_number() {
        let mut config = DevflowConfig::default();
        let err = config
            .apply_env_with(|k| (k == "DEVFLOW_PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("DEVFLOW_PORT"));
    }

    #[test]
    fn test_validate_reports_unknown_provider() {
        let mut config = DevflowConfig::default();
        config.models.profiles.insert(
            "broken".to_string(),
            ProfileSpec {
                primary: ModelTarget::new("nowhere", "x"),
                secondary: None,
            },
        );
        let problems = config.validate();
        assert!(problems.iter().any(|p| p.contains("unknown provider 'nowhere'")));
    }

    #[test]
    fn test_validate_reports_check_outside_allow_list() {
        let mut config = DevflowConfig::default();
        config
            .validation
            .checks
            .push(CheckSpec::new("build", "make", &[]));
        let problems = config.validate();
        assert!(problems.iter().any(|p| p.contains("'make'")));
    }

    #[test]
    fn test_validate_reports_wrapper_that_does_not_confine_writes() {
        let mut config = DevflowConfig::default();
        config.sandbox.isolation_wrapper = vec!["unshare".into(), "--net".into()];
        let problems = config.validate();
        assert!(problems.iter().any(|p| p.contains("sandbox.isolation_wrapper")));

        config.sandbox.unconfined = true;
        assert!(config.validate().is_empty());

        config.sandbox.unconfined = false;
        config.sandbox.backend = SandboxBackend::Docker;
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_toml_roundtrip_of_effective_config() {
        let config = DevflowConfig::default();
        let rendered = config.to_toml().unwrap();
        let parsed = DevflowConfig::parse(&rendered).unwrap();
        assert_eq!(parsed.models.profiles, config.models.profiles);
        assert_eq!(parsed.validation.checks, config.validation.checks);
    }

    #[test]
    fn test_load_or_default_reads_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devflow.toml");
        std::fs::write(&path, "[server]\nport = 8123\n").unwrap();
        let config = DevflowConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(config.server.port, 8123);
    }
}
