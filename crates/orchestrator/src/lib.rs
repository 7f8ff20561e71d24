pub mod amendments;
pub mod background;
pub mod backend;
pub mod config;
pub mod error;
pub mod json_extract;
pub mod plan_builder;
pub mod plan_parser;
pub mod plan_runner;
pub mod prompts;
pub mod retry_policy;
pub mod run_context;
pub mod scheduler;
pub mod summary;
pub mod trace;
pub mod verifier;
pub mod workers;

#[cfg(test)]
mod testing;

pub use amendments::AmendmentBus;
pub use backend::{ChatMessage, HttpBackend, ReasoningBackend, RetryingBackend, Role};
pub use config::{BackendConfig, EngineConfig, SummaryConfig};
pub use error::{OrchestratorError, PlanParseFailure, Result};
pub use plan_builder::PlanBuilder;
pub use plan_runner::{PlanRunner, RunOutcome, StepResult};
pub use retry_policy::{AdvanceReason, RetryPolicy, StallPolicy};
pub use run_context::{RunContext, StopFlag};
pub use scheduler::{Enqueued, JobExecutor, QueueSnapshot, Scheduler};
pub use summary::TraceSummarizer;
pub use trace::{RunReplay, TraceSink};
pub use verifier::{Verifier, VerifyRequest};
pub use workers::{Dispatcher, LlmWorker, Worker, WorkerContext, WorkerOutput, WorkerRegistry};
