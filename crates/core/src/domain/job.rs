use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::policy::{RunMode, ToolPolicy, TraceConfig, WorkerPolicy};
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| CoreError::InvalidJobStatus(s.to_string()))
    }
}

/// Per-submission settings. Every field is optional so that a bare goal can
/// be submitted and the engine defaults apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct JobConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<RunMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_parent_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_file: Option<String>,
    #[serde(default)]
    pub trace_config: TraceConfig,
    #[serde(default)]
    pub tool_policy: ToolPolicy,
    #[serde(default)]
    pub worker_policy: WorkerPolicy,
}

impl JobConfig {
    pub fn with_project(mut self, name: impl Into<String>) -> Self {
        self.project_name = Some(name.into());
        self
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_worker_policy(mut self, policy: WorkerPolicy) -> Self {
        self.worker_policy = policy;
        self
    }

    pub fn with_tool_policy(mut self, policy: ToolPolicy) -> Self {
        self.tool_policy = policy;
        self
    }

    pub fn with_trace_config(mut self, config: TraceConfig) -> Self {
        self.trace_config = config;
        self
    }
}

/// One submitted goal. The goal text is never rewritten once the job
/// starts; amendments are layered on top during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct Job {
    pub uid: Uuid,
    pub goal: String,
    pub config: JobConfig,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(goal: impl Into<String>, config: JobConfig) -> Self {
        Self {
            uid: Uuid::new_v4(),
            goal: goal.into(),
            config,
            status: JobStatus::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_uid(mut self, uid: Uuid) -> Self {
        self.uid = uid;
        self
    }

    /// Apply an edit to a job that has not started yet.
    pub fn apply(&mut self, patch: &JobPatch) {
        if let Some(goal) = patch.goal.as_deref() {
            self.goal = goal.trim().to_string();
        }
        if let Some(project) = patch.project_name.as_deref() {
            let project = project.trim();
            self.config.project_name = (!project.is_empty()).then(|| project.to_string());
        }
    }
}

/// Edit of a queued job. An empty `project_name` clears the project prefix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct JobPatch {
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
}

impl JobPatch {
    pub fn is_empty(&self) -> bool {
        self.goal.is_none() && self.project_name.is_none()
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.is_empty() {
            return Err(CoreError::Validation(
                "at least one of goal or project_name must be provided".to_string(),
            ));
        }
        if matches!(self.goal.as_deref(), Some(goal) if goal.trim().is_empty()) {
            return Err(CoreError::Validation("goal cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// Structured outcome of a job. A failed job still produces one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct JobResult {
    pub uid: Uuid,
    pub status: JobStatus,
    pub success: bool,
    pub answer: String,
    pub reasoning: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "typescript", ts(type = "string | null"))]
    pub output_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "typescript", ts(type = "string | null"))]
    pub trace_file: Option<PathBuf>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn failed(uid: Uuid, answer: impl Into<String>, reasoning: impl Into<String>) -> Self {
        Self {
            uid,
            status: JobStatus::Failed,
            success: false,
            answer: answer.into(),
            reasoning: reasoning.into(),
            run_id: None,
            output_dir: None,
            trace_file: None,
            finished_at: Utc::now(),
        }
    }
}
