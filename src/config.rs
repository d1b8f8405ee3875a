use crate::errors::{AnalystError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which execution host the runner talks to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostKind {
    /// Long-lived Docker container reached through `docker exec`
    /// The container is externally managed; we only check and start it
    #[default]
    Docker,

    /// Interpreter on the local machine, no isolation beyond the policy
    /// Use for development and tests
    Local,
}

impl HostKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Some(Self::Docker),
            "local" | "native" => Some(Self::Local),
            _ => None,
        }
    }

    /// Description for logging/debugging
    pub fn description(&self) -> &'static str {
        match self {
            HostKind::Docker => "Docker container host",
            HostKind::Local => "Local interpreter (unisolated)",
        }
    }
}

/// Execution host identity and lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub kind: HostKind,
    /// Container name used for liveness lookups and `docker exec`
    pub container_name: String,
    /// Command issued once when the host is found down
    pub start_command: Vec<String>,
    /// Interpreter invoked inside the host
    pub interpreter: String,
    /// How long to wait after a start before re-checking liveness
    #[serde(with = "duration_secs")]
    pub startup_grace: Duration,
    /// Bound on each host-control command (status, start, terminate)
    #[serde(with = "duration_secs")]
    pub control_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            kind: HostKind::Docker,
            container_name: "python-analysis-container".to_string(),
            start_command: vec![
                "docker".to_string(),
                "compose".to_string(),
                "up".to_string(),
                "-d".to_string(),
            ],
            interpreter: "python3".to_string(),
            startup_grace: Duration::from_secs(2),
            control_timeout: Duration::from_secs(30),
        }
    }
}

/// Bounds applied to every program invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionLimits {
    /// Wall clock timeout
    #[serde(rename = "timeout_secs", with = "duration_secs")]
    pub timeout: Duration,
    /// Cap on combined stdout + stderr
    pub max_output_bytes: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_output_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Model-call collaborator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    /// Token budget for the code-generating turn
    pub max_tokens: u32,
    /// Token budget for the interpretation turn
    pub interpret_max_tokens: u32,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.anthropic.com".to_string(),
            model: "claude-sonnet-4-5-20250929".to_string(),
            max_tokens: 4096,
            interpret_max_tokens: 2048,
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// Everything an orchestrator needs, passed in at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalystConfig {
    pub host: HostConfig,
    pub limits: ExecutionLimits,
    pub model: ModelConfig,
    /// The single directory generated code may reference
    pub input_root: PathBuf,
    /// Extension appended to file ids by the uploads resolver
    pub file_extension: String,
    /// Fence tag the extractor looks for
    pub code_tag: String,
    /// Extra modules the safety policy refuses on top of its built-in rules
    pub blocked_modules: Vec<String>,
}

impl Default for AnalystConfig {
    fn default() -> Self {
        Self {
            host: HostConfig::default(),
            limits: ExecutionLimits::default(),
            model: ModelConfig::default(),
            input_root: PathBuf::from("/app/uploads"),
            file_extension: ".csv".to_string(),
            code_tag: "python".to_string(),
            blocked_modules: Vec::new(),
        }
    }
}

impl AnalystConfig {
    /// Defaults overlaid with environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Load a JSON config file, then overlay environment variables
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AnalystError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        let mut config: Self = serde_json::from_str(&content).map_err(|e| {
            AnalystError::Configuration(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(key) = env_non_empty("ANTHROPIC_API_KEY") {
            self.model.api_key = Some(key);
        }
        if let Some(url) = env_non_empty("ANTHROPIC_BASE_URL") {
            self.model.base_url = url;
        }
        if let Some(model) = env_non_empty("ANTHROPIC_MODEL") {
            self.model.model = model;
        }
        if let Some(name) = env_non_empty("DOCKER_CONTAINER_NAME") {
            self.host.container_name = name;
        }
        if let Some(kind) = env_non_empty("PYANALYST_HOST").and_then(|v| HostKind::parse(&v)) {
            self.host.kind = kind;
        }
        if let Some(cmd) = env_non_empty("PYANALYST_START_COMMAND") {
            self.host.start_command = cmd.split_whitespace().map(str::to_string).collect();
        }
        if let Some(interpreter) = env_non_empty("PYANALYST_INTERPRETER") {
            self.host.interpreter = interpreter;
        }
        if let Some(root) = env_non_empty("PYANALYST_INPUT_ROOT") {
            self.input_root = PathBuf::from(root);
        }
        if let Some(secs) = env_non_empty("PYANALYST_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.limits.timeout = Duration::from_secs(secs);
        }
        if let Some(modules) = env_non_empty("PYANALYST_BLOCKED_MODULES") {
            self.blocked_modules = modules
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(bytes) =
            env_non_empty("PYANALYST_MAX_OUTPUT_BYTES").and_then(|v| v.parse().ok())
        {
            self.limits.max_output_bytes = bytes;
        }
    }

    /// Reject configurations that can never serve a request
    pub fn validate(&self) -> Result<()> {
        if self.model.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            return Err(AnalystError::Configuration(
                "Anthropic API key is not configured".to_string(),
            ));
        }
        self.validate_execution()
    }

    /// The subset of checks that matter when no model is involved
    pub fn validate_execution(&self) -> Result<()> {
        if self.limits.timeout.is_zero() {
            return Err(AnalystError::Configuration(
                "execution timeout must be greater than zero".to_string(),
            ));
        }
        if self.limits.max_output_bytes == 0 {
            return Err(AnalystError::Configuration(
                "max_output_bytes must be greater than zero".to_string(),
            ));
        }
        if !self.input_root.is_absolute() {
            return Err(AnalystError::Configuration(format!(
                "input root must be absolute: {}",
                self.input_root.display()
            )));
        }
        if self.code_tag.trim().is_empty() {
            return Err(AnalystError::Configuration(
                "code tag must not be empty".to_string(),
            ));
        }
        if self.host.kind == HostKind::Docker && self.host.container_name.trim().is_empty() {
            return Err(AnalystError::Configuration(
                "container name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration {}: {}", secs, e)))
    }
}
