//! Task workers and the registry the plan runner dispatches through.

mod dispatch;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use taskflow_core::{ToolPolicy, WorkerKey};
use tracing::debug;

use crate::backend::{ChatMessage, ReasoningBackend};
use crate::error::Result;
use crate::run_context::{RunContext, StopFlag};

pub use dispatch::{DispatchOutcome, Dispatcher, OutcomeKind};

/// What a worker hands back for one step attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutput {
    pub answer: String,
    pub success: bool,
}

impl WorkerOutput {
    pub fn success(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            success: true,
        }
    }

    pub fn failure(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            success: false,
        }
    }
}

/// Run-scoped information a worker may use while processing a step.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub run_id: String,
    pub output_dir: PathBuf,
    pub tool_policy: ToolPolicy,
    pub stop: StopFlag,
}

impl WorkerContext {
    pub fn from_run(ctx: &RunContext) -> Self {
        Self {
            run_id: ctx.run_id.clone(),
            output_dir: ctx.output_dir.clone(),
            tool_policy: ctx.tool_policy.clone(),
            stop: ctx.stop_flag().clone(),
        }
    }
}

#[async_trait]
pub trait Worker: Send + Sync {
    fn key(&self) -> WorkerKey;

    async fn process(&self, prompt: &str, ctx: &WorkerContext) -> Result<WorkerOutput>;

    /// Ask an in-flight `process` call to wind down.
    fn request_stop(&self) {}

    /// Whatever the worker produced so far, used when a step times out.
    fn partial_output(&self) -> Option<String> {
        None
    }

    /// Clear per-step state before the next dispatch.
    fn reset_run_state(&self) {}
}

/// Workers by key, built once at startup.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: BTreeMap<WorkerKey, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, worker: Arc<dyn Worker>) -> Self {
        self.register(worker);
        self
    }

    pub fn register(&mut self, worker: Arc<dyn Worker>) {
        self.workers.insert(worker.key(), worker);
    }

    pub fn get(&self, key: WorkerKey) -> Option<Arc<dyn Worker>> {
        self.workers.get(&key).cloned()
    }

    pub fn contains(&self, key: WorkerKey) -> bool {
        self.workers.contains_key(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = WorkerKey> + '_ {
        self.workers.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.workers.keys()).finish()
    }
}

/// Worker that answers a step by asking the reasoning backend.
pub struct LlmWorker {
    key: WorkerKey,
    backend: Arc<dyn ReasoningBackend>,
    last_answer: Mutex<Option<String>>,
    stop: AtomicBool,
}

impl LlmWorker {
    pub fn new(key: WorkerKey, backend: Arc<dyn ReasoningBackend>) -> Self {
        Self {
            key,
            backend,
            last_answer: Mutex::new(None),
            stop: AtomicBool::new(false),
        }
    }

    /// One worker per key, all sharing `backend`.
    pub fn registry(backend: Arc<dyn ReasoningBackend>) -> WorkerRegistry {
        WorkerKey::ALL
            .into_iter()
            .fold(WorkerRegistry::new(), |registry, key| {
                registry.with(Arc::new(Self::new(key, backend.clone())))
            })
    }

    fn persona(&self) -> &'static str {
        match self.key {
            WorkerKey::Coder => "You are a careful programmer. Solve the task with code where it helps and show the final result.",
            WorkerKey::File => "You are a file assistant. Produce the complete content of any file the task asks for.",
            WorkerKey::Web => "You are a research assistant. Gather the requested facts and cite a source URL for each one.",
            WorkerKey::Casual => "You are a helpful assistant. Answer clearly and concisely.",
        }
    }
}

#[async_trait]
impl Worker for LlmWorker {
    fn key(&self) -> WorkerKey {
        self.key
    }

    async fn process(&self, prompt: &str, ctx: &WorkerContext) -> Result<WorkerOutput> {
        if self.stop.load(Ordering::SeqCst) || ctx.stop.is_stopped() {
            return Ok(WorkerOutput::failure("Stopped before the step started."));
        }
        debug!(worker = %self.key, run_id = %ctx.run_id, "Worker processing step");

        let messages = [ChatMessage::system(self.persona()), ChatMessage::user(prompt)];
        let answer = self.backend.respond(&messages).await?;
        *self.last_answer.lock().unwrap() = Some(answer.clone());

        if answer.trim().is_empty() {
            Ok(WorkerOutput::failure(answer))
        } else {
            Ok(WorkerOutput::success(answer))
        }
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn partial_output(&self) -> Option<String> {
        self.last_answer.lock().unwrap().clone()
    }

    fn reset_run_state(&self) {
        self.stop.store(false, Ordering::SeqCst);
        *self.last_answer.lock().unwrap() = None;
    }
}
