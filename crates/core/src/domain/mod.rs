pub mod amendment;
pub mod job;
pub mod plan;
pub mod policy;
pub mod verdict;
pub mod worker;

pub use amendment::Amendment;
pub use job::{Job, JobConfig, JobPatch, JobResult, JobStatus};
pub use plan::{Plan, Step, StepStatus};
pub use policy::{RunMode, ToolPolicy, TraceConfig, WorkerPolicy};
pub use verdict::{RecommendedAction, Verdict};
pub use worker::WorkerKey;
