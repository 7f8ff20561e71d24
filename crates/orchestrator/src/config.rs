use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use taskflow_core::RunMode;
use tokio::fs;
use tracing::{debug, warn};

use crate::retry_policy::{RetryPolicy, StallPolicy};

const CONFIG_DIR: &str = ".taskflow";
const CONFIG_FILE: &str = "config.json";

/// Lower bound for the per-step budget.
pub const MIN_STEP_TIMEOUT_SECS: u64 = 30;

/// Post-run trace summary settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum trace events read back (clamped to 200..=50000)
    #[serde(default = "default_summary_events")]
    pub max_events: usize,
    /// Maximum digest lines sent to the backend (clamped to 30..=2500)
    #[serde(default = "default_summary_lines")]
    pub max_lines: usize,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_events: default_summary_events(),
            max_lines: default_summary_lines(),
        }
    }
}

impl SummaryConfig {
    pub fn event_budget(&self) -> usize {
        self.max_events.clamp(200, 50_000)
    }

    pub fn line_budget(&self) -> usize {
        self.max_lines.clamp(30, 2_500)
    }
}

/// OpenAI-compatible chat endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key; unset means no auth header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model: "llama3.1".to_string(),
            api_key_env: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Engine-wide configuration stored in `.taskflow/config.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,
    #[serde(default = "default_step_retries")]
    pub step_max_retries: u32,
    #[serde(default = "default_retry_floor")]
    pub min_remaining_for_retry_seconds: u64,
    #[serde(default)]
    pub stall_policy: StallPolicy,
    #[serde(default = "default_plan_attempts")]
    pub plan_max_attempts: u32,
    #[serde(default = "default_empty_retries")]
    pub backend_empty_retries: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_ms: u64,
    #[serde(default = "default_activity_capacity")]
    pub activity_capacity: usize,
    #[serde(default = "default_run_parent")]
    pub run_parent_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub post_run_summary: SummaryConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout_seconds: default_step_timeout(),
            step_max_retries: default_step_retries(),
            min_remaining_for_retry_seconds: default_retry_floor(),
            stall_policy: StallPolicy::default(),
            plan_max_attempts: default_plan_attempts(),
            backend_empty_retries: default_empty_retries(),
            poll_interval_ms: default_poll_interval(),
            cancel_grace_ms: default_cancel_grace(),
            activity_capacity: default_activity_capacity(),
            run_parent_dir: default_run_parent(),
            project_name: None,
            mode: RunMode::default(),
            post_run_summary: SummaryConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn config_path(work_dir: &Path) -> PathBuf {
        work_dir.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Read config from the work directory, falling back to defaults
    pub async fn read(work_dir: &Path) -> Self {
        let config_path = Self::config_path(work_dir);

        if !config_path.exists() {
            debug!(path = %config_path.display(), "Config file does not exist, using defaults");
            return Self::default();
        }

        match fs::read_to_string(&config_path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => {
                    debug!(path = %config_path.display(), "Config loaded successfully");
                    config
                }
                Err(e) => {
                    warn!(path = %config_path.display(), error = %e, "Failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %config_path.display(), error = %e, "Failed to read config file, using defaults");
                Self::default()
            }
        }
    }

    /// Write config to the work directory
    pub async fn write(&self, work_dir: &Path) -> std::io::Result<()> {
        let config_path = Self::config_path(work_dir);
        if let Some(dir) = config_path.parent() {
            fs::create_dir_all(dir).await?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        fs::write(&config_path, content).await?;
        debug!(path = %config_path.display(), "Config saved successfully");

        Ok(())
    }

    /// Apply `TASKFLOW_*` overrides from the process environment
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("TASKFLOW_STEP_TIMEOUT_SECONDS") {
            match v.trim().parse() {
                Ok(secs) => self.step_timeout_seconds = secs,
                Err(_) => warn!(value = %v, "Ignoring invalid TASKFLOW_STEP_TIMEOUT_SECONDS"),
            }
        }
        if let Some(v) = lookup("TASKFLOW_STEP_MAX_RETRIES") {
            match v.trim().parse() {
                Ok(retries) => self.step_max_retries = retries,
                Err(_) => warn!(value = %v, "Ignoring invalid TASKFLOW_STEP_MAX_RETRIES"),
            }
        }
        if let Some(v) = lookup("TASKFLOW_MODE") {
            match RunMode::parse(&v) {
                Some(mode) => self.mode = mode,
                None => warn!(value = %v, "Ignoring invalid TASKFLOW_MODE"),
            }
        }
        self
    }

    pub fn with_step_timeout(mut self, secs: u64) -> Self {
        self.step_timeout_seconds = secs;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.step_max_retries = retries;
        self
    }

    pub fn with_stall_policy(mut self, stall: StallPolicy) -> Self {
        self.stall_policy = stall;
        self
    }

    pub fn with_summary(mut self, enabled: bool) -> Self {
        self.post_run_summary.enabled = enabled;
        self
    }

    pub fn with_project(mut self, name: impl Into<String>) -> Self {
        self.project_name = Some(name.into());
        self
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// Per-step budget with the lower bound applied
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds.max(MIN_STEP_TIMEOUT_SECS))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.step_max_retries,
            min_remaining_secs: self.min_remaining_for_retry_seconds,
            stall: self.stall_policy,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_step_timeout() -> u64 {
    600
}

fn default_step_retries() -> u32 {
    6
}

fn default_retry_floor() -> u64 {
    60
}

fn default_plan_attempts() -> u32 {
    4
}

fn default_empty_retries() -> u32 {
    2
}

fn default_poll_interval() -> u64 {
    50
}

fn default_cancel_grace() -> u64 {
    2_000
}

fn default_activity_capacity() -> usize {
    2_000
}

fn default_run_parent() -> String {
    "runs".to_string()
}

fn default_summary_events() -> usize {
    6_000
}

fn default_summary_lines() -> usize {
    260
}

fn default_request_timeout() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.step_timeout_seconds, 600);
        assert_eq!(config.step_max_retries, 6);
        assert_eq!(config.min_remaining_for_retry_seconds, 60);
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.mode, RunMode::Trace);
    }

    #[tokio::test]
    async fn test_config_read_nonexistent() {
        let temp_dir = TempDir::new().unwrap();
        let config = EngineConfig::read(temp_dir.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn test_config_write_and_read() {
        let temp_dir = TempDir::new().unwrap();

        let config = EngineConfig::default()
            .with_step_timeout(120)
            .with_max_retries(2)
            .with_project("acme");
        config.write(temp_dir.path()).await.unwrap();

        let loaded = EngineConfig::read(temp_dir.path()).await;
        assert_eq!(loaded.step_timeout_seconds, 120);
        assert_eq!(loaded.step_max_retries, 2);
        assert_eq!(loaded.project_name.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn test_config_invalid_json_falls_back() {
        let temp_dir = TempDir::new().unwrap();
        let path = EngineConfig::config_path(temp_dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        let config = EngineConfig::read(temp_dir.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"step_max_retries": 1}"#).unwrap();
        assert_eq!(config.step_max_retries, 1);
        assert_eq!(config.step_timeout_seconds, 600);
        assert!(config.post_run_summary.enabled);
    }

    #[test]
    fn test_step_timeout_has_floor() {
        let config = EngineConfig::default().with_step_timeout(5);
        assert_eq!(config.step_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("TASKFLOW_STEP_TIMEOUT_SECONDS", "90"),
            ("TASKFLOW_STEP_MAX_RETRIES", "not-a-number"),
            ("TASKFLOW_MODE", "standard"),
        ]
        .into_iter()
        .collect();

        let config = EngineConfig::default()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.step_timeout_seconds, 90);
        assert_eq!(config.step_max_retries, 6);
        assert_eq!(config.mode, RunMode::Standard);
    }

    #[test]
    fn test_summary_budgets_are_clamped() {
        let summary = SummaryConfig {
            enabled: true,
            max_events: 10,
            max_lines: 1_000_000,
        };
        assert_eq!(summary.event_budget(), 200);
        assert_eq!(summary.line_budget(), 2_500);
    }
}
