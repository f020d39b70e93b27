//! Configuration file support.
//!
//! All samsara data lives in a `.samsara/` directory:
//! - `.samsara/config.toml` - configuration file
//! - `.samsara/traces/` - query trace files (when enabled)
//!
//! Config discovery searches for `.samsara/config.toml` starting from the
//! current directory and walking up to parent directories. Environment
//! variables override file values where noted.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// The samsara data directory name.
pub const SAMSARA_DIR: &str = ".samsara";
/// The config file name within the samsara directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Planner LLM settings.
    pub planner: PlannerConfig,
    /// Engine loop settings.
    pub engine: EngineSection,
    /// Sandbox runner settings.
    pub sandbox: SandboxSection,
    /// Trace persistence settings.
    pub traces: TracesSection,
}

/// Planner LLM configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Base URL of an OpenAI-compatible API.
    pub base_url: String,
    /// Model to use for planner and sub-LLM calls.
    pub model: String,
    /// API key (SAMSARA_API_KEY overrides).
    pub api_key: Option<String>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model: "qwen3:32b".to_string(),
            api_key: None,
        }
    }
}

/// Engine loop configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSection {
    pub max_iterations: usize,
    pub max_output_chars: usize,
    pub execute_timeout_secs: u64,
    pub max_subcall_payload_chars: usize,
    /// "fast" (concurrent batches) or "deep" (sequential).
    pub mode: String,
    pub verify_citations: bool,
    pub verify: bool,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_output_chars: 20_000,
            execute_timeout_secs: 30,
            max_subcall_payload_chars: 500_000,
            mode: "fast".to_string(),
            verify_citations: true,
            verify: false,
        }
    }
}

/// Sandbox runner configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SandboxSection {
    /// Path to the runner binary; defaults to `samsara-runner` on PATH.
    pub runner: PathBuf,
    /// Prewarmed executors kept in the pool (0 disables pooling).
    pub pool_size: usize,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            runner: PathBuf::from("samsara-runner"),
            pool_size: 0,
        }
    }
}

/// Trace persistence configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TracesSection {
    /// Directory for trace storage; None disables persistence.
    pub dir: Option<PathBuf>,
    /// Trace files retained per project.
    pub retention: usize,
}

impl Default for TracesSection {
    fn default() -> Self {
        Self {
            dir: None,
            retention: 50,
        }
    }
}

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Find and load configuration starting from a specific directory.
    ///
    /// Looks for `.samsara/config.toml` in the directory and its parents.
    pub fn find_and_load_from(start: &Path) -> Result<Option<(Self, PathBuf)>> {
        let mut dir = start.to_path_buf();
        loop {
            let samsara_dir = dir.join(SAMSARA_DIR);
            let config_path = samsara_dir.join(CONFIG_FILE);
            if config_path.exists() {
                let config = Self::from_file(&config_path)?;
                return Ok(Some((config, samsara_dir)));
            }
            if !dir.pop() {
                break;
            }
        }
        Ok(None)
    }

    /// Load configuration from the current directory or use defaults.
    pub fn load_or_default() -> Self {
        let start = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        match Self::find_and_load_from(&start) {
            Ok(Some((config, path))) => {
                tracing::info!("Loaded config from {}", path.display());
                config
            }
            Ok(None) => {
                tracing::debug!("No .samsara/config.toml found, using defaults");
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Resolve the API key: environment variable wins over the file.
    pub fn api_key(&self) -> Option<String> {
        std::env::var("SAMSARA_API_KEY")
            .ok()
            .or_else(|| self.planner.api_key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.engine.max_iterations, 20);
        assert_eq!(config.engine.max_output_chars, 20_000);
        assert_eq!(config.engine.mode, "fast");
        assert!(config.engine.verify_citations);
        assert!(!config.engine.verify);
        assert_eq!(config.traces.retention, 50);
        assert_eq!(config.sandbox.runner, PathBuf::from("samsara-runner"));
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[planner]
model = "gpt-oss:20b"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.planner.model, "gpt-oss:20b");
        // Defaults still apply.
        assert_eq!(config.engine.max_iterations, 20);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[planner]
base_url = "https://api.groq.com/openai/v1"
model = "qwen/qwen3-32b"
api_key = "key-here"

[engine]
max_iterations = 10
execute_timeout_secs = 60
mode = "deep"
verify = true

[sandbox]
runner = "/usr/local/bin/samsara-runner"
pool_size = 2

[traces]
dir = "/tmp/traces"
retention = 25
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.planner.base_url, "https://api.groq.com/openai/v1");
        assert_eq!(config.engine.max_iterations, 10);
        assert_eq!(config.engine.mode, "deep");
        assert!(config.engine.verify);
        assert_eq!(config.sandbox.pool_size, 2);
        assert_eq!(config.traces.dir, Some(PathBuf::from("/tmp/traces")));
        assert_eq!(config.traces.retention, 25);
    }

    #[test]
    fn test_find_and_load_walks_parents() {
        let dir = tempfile::tempdir().unwrap();
        let samsara_dir = dir.path().join(SAMSARA_DIR);
        std::fs::create_dir_all(&samsara_dir).unwrap();
        std::fs::write(
            samsara_dir.join(CONFIG_FILE),
            "[planner]\nmodel = \"found\"\n",
        )
        .unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();

        let (config, found_dir) = Config::find_and_load_from(&nested).unwrap().unwrap();
        assert_eq!(config.planner.model, "found");
        assert_eq!(found_dir, samsara_dir);
    }

    #[test]
    fn test_find_and_load_none_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::find_and_load_from(dir.path()).unwrap();
        assert!(result.is_none());
    }
}
