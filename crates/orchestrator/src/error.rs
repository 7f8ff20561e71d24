use taskflow_core::{CoreError, JobStatus};
use thiserror::Error;
use uuid::Uuid;

/// Why a planner response could not be turned into a plan.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanParseFailure {
    #[error("no JSON object found in response")]
    NoJsonFound,

    #[error("malformed plan JSON: {error}")]
    MalformedJson { error: String, snippet: String },

    #[error("response has no `plan` array")]
    MissingPlan,

    #[error("plan contains no steps")]
    EmptyPlan,

    #[error("step {index} is missing required field `{field}`")]
    MissingField { index: usize, field: String },

    #[error("step {index} names unknown worker `{worker}`")]
    UnknownWorker { index: usize, worker: String },
}

impl PlanParseFailure {
    pub fn malformed(error: impl std::fmt::Display, snippet: &str) -> Self {
        Self::MalformedJson {
            error: error.to_string(),
            snippet: snippet.chars().take(800).collect(),
        }
    }

    /// Instruction sent back to the planner when asking for another attempt.
    pub fn corrective_prompt(&self) -> String {
        let hint = match self {
            Self::UnknownWorker { worker, .. } => format!(
                "Worker `{}` does not exist. Use only these workers: coder, file, web, casual.",
                worker
            ),
            Self::MissingField { field, .. } => {
                format!("Every step must include the `{}` field.", field)
            }
            _ => "The JSON could not be parsed.".to_string(),
        };
        format!(
            "Failed to parse the plan: {}\nWrite the plan again as one ```json block containing {{\"plan\": [...]}}. Do not ask for clarification.",
            hint
        )
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Reasoning backend failed: {0}")]
    Backend(String),

    #[error("Plan parse failed: {0}")]
    PlanParse(#[from] PlanParseFailure),

    #[error("No plan could be built after {attempts} attempts: {last}")]
    PlanUnavailable {
        attempts: u32,
        last: PlanParseFailure,
    },

    #[error("Worker '{0}' is disabled by the run's worker policy")]
    WorkerDisabled(String),

    #[error("Step {step_id} timed out after {timeout_secs}s")]
    StepTimeout { step_id: String, timeout_secs: u64 },

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job {uid} can no longer be changed (status: {status})")]
    Conflict { uid: Uuid, status: JobStatus },

    #[error("No active run to amend")]
    NoActiveRun,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Job crashed: {0}")]
    JobCrashed(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl OrchestratorError {
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend(reason.into())
    }

    pub fn conflict(uid: Uuid, status: JobStatus) -> Self {
        Self::Conflict { uid, status }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidInput(reason.into())
    }

    /// Errors callers can fix by changing the request, as opposed to
    /// failures inside the engine.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::JobNotFound(_) | Self::Conflict { .. } | Self::NoActiveRun | Self::InvalidInput(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
