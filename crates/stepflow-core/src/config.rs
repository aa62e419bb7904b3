use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, StepflowError};

/// Top-level stepflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub hitl: HitlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Safety limit on supersteps per run. Unbounded when absent.
    #[serde(default)]
    pub max_supersteps: Option<usize>,
    /// Timeout for a single handler invocation (0 = none).
    #[serde(default)]
    pub handler_timeout_secs: u64,
    /// Timeout for a single AI chat step or tool call.
    #[serde(default = "default_collaborator_timeout")]
    pub collaborator_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_supersteps: None,
            handler_timeout_secs: 0,
            collaborator_timeout_secs: default_collaborator_timeout(),
        }
    }
}

impl EngineConfig {
    pub fn handler_timeout(&self) -> Option<Duration> {
        (self.handler_timeout_secs > 0).then(|| Duration::from_secs(self.handler_timeout_secs))
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_secs(self.collaborator_timeout_secs)
    }
}

fn default_collaborator_timeout() -> u64 { 120 }

/// Where checkpoints are persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    /// Volatile, process-local. Useful for tests.
    Memory,
    /// One JSON document per checkpoint in a directory.
    File,
    /// SQLite database with a `checkpoints` table.
    #[default]
    Sqlite,
}

/// Checkpoint storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub backend: CheckpointBackend,
    /// Database file (sqlite) or directory (file). Default: ~/.stepflow/checkpoints[.db]
    #[serde(default)]
    pub path: Option<String>,
    /// Also checkpoint at the end of every superstep.
    #[serde(default)]
    pub every_superstep: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::default(),
            path: None,
            every_superstep: false,
        }
    }
}

impl CheckpointConfig {
    /// Resolve the storage path for the configured backend (expand ~).
    pub fn resolved_path(&self) -> PathBuf {
        let raw = match (&self.path, self.backend) {
            (Some(p), _) => p.clone(),
            (None, CheckpointBackend::File) => "~/.stepflow/checkpoints".to_string(),
            (None, _) => "~/.stepflow/checkpoints.db".to_string(),
        };
        expand_home(&raw)
    }
}

/// Human-in-the-loop front end configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HitlConfig {
    /// How long an interactive front end waits for an answer (0 = forever).
    #[serde(default)]
    pub response_timeout_secs: u64,
}

impl HitlConfig {
    pub fn response_timeout(&self) -> Option<Duration> {
        (self.response_timeout_secs > 0).then(|| Duration::from_secs(self.response_timeout_secs))
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StepflowError::ConfigNotFound(path.display().to_string()))?;
        debug!(path = %path.display(), bytes = content.len(), "Read config file");

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| StepflowError::Config(e.to_string()))
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(StepflowError::ConfigNotFound(_)) => {
                debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => {
                    warn!(var = %var_name, "Config references unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
