//! Scripted backends and workers for unit tests.

use std::collections::VecDeque;
use std::future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use taskflow_core::WorkerKey;

use crate::backend::{ChatMessage, ReasoningBackend};
use crate::error::{OrchestratorError, Result};
use crate::workers::{Worker, WorkerContext, WorkerOutput, WorkerRegistry};

/// Answers with queued responses in order and records every request.
#[derive(Clone, Default)]
pub(crate) struct ScriptedBackend {
    responses: Arc<Mutex<VecDeque<String>>>,
    calls: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl ScriptedBackend {
    pub fn new(responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into_iter().map(Into::into).collect())),
            calls: Arc::default(),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReasoningBackend for ScriptedBackend {
    async fn respond(&self, messages: &[ChatMessage]) -> Result<String> {
        self.calls.lock().unwrap().push(messages.to_vec());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| OrchestratorError::backend("script exhausted"))
    }
}

enum Reply {
    Answer(WorkerOutput),
    Error(String),
    Delayed(Duration, String),
    Hang,
    Panic,
}

struct WorkerState {
    replies: VecDeque<Reply>,
    prompts: Vec<String>,
    partial: Option<String>,
}

/// A worker that plays back scripted replies. Once the script runs out it
/// answers `"done"`.
#[derive(Clone)]
pub(crate) struct ScriptedWorker {
    key: WorkerKey,
    state: Arc<Mutex<WorkerState>>,
    stop: Arc<AtomicBool>,
}

impl ScriptedWorker {
    pub fn new(key: WorkerKey) -> Self {
        Self {
            key,
            state: Arc::new(Mutex::new(WorkerState {
                replies: VecDeque::new(),
                prompts: Vec::new(),
                partial: None,
            })),
            stop: Arc::default(),
        }
    }

    fn push(self, reply: Reply) -> Self {
        self.state.lock().unwrap().replies.push_back(reply);
        self
    }

    pub fn respond(self, text: impl Into<String>) -> Self {
        self.push(Reply::Answer(WorkerOutput::success(text)))
    }

    pub fn respond_failure(self, text: impl Into<String>) -> Self {
        self.push(Reply::Answer(WorkerOutput::failure(text)))
    }

    pub fn fail(self, message: impl Into<String>) -> Self {
        self.push(Reply::Error(message.into()))
    }

    pub fn delay(self, after: Duration, text: impl Into<String>) -> Self {
        self.push(Reply::Delayed(after, text.into()))
    }

    /// Never returns, and ignores stop requests.
    pub fn hang(self) -> Self {
        self.push(Reply::Hang)
    }

    pub fn panic(self) -> Self {
        self.push(Reply::Panic)
    }

    pub fn with_partial(self, text: impl Into<String>) -> Self {
        self.state.lock().unwrap().partial = Some(text.into());
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.state.lock().unwrap().prompts.clone()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn key(&self) -> WorkerKey {
        self.key
    }

    async fn process(&self, prompt: &str, _ctx: &WorkerContext) -> Result<WorkerOutput> {
        let reply = {
            let mut state = self.state.lock().unwrap();
            state.prompts.push(prompt.to_string());
            state.replies.pop_front()
        };

        match reply {
            None => Ok(WorkerOutput::success("done")),
            Some(Reply::Answer(out)) => Ok(out),
            Some(Reply::Error(message)) => Err(OrchestratorError::backend(message)),
            Some(Reply::Delayed(after, text)) => {
                tokio::time::sleep(after).await;
                Ok(WorkerOutput::success(text))
            }
            Some(Reply::Hang) => future::pending().await,
            Some(Reply::Panic) => panic!("scripted worker panic"),
        }
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn partial_output(&self) -> Option<String> {
        self.state.lock().unwrap().partial.clone()
    }

    fn reset_run_state(&self) {
        self.stop.store(false, Ordering::SeqCst);
    }
}

/// Registry with a scripted worker for every key.
pub(crate) fn full_registry() -> WorkerRegistry {
    full_registry_with(Vec::new())
}

/// Like [`full_registry`], with `workers` replacing the defaults for their
/// keys.
pub(crate) fn full_registry_with(workers: Vec<ScriptedWorker>) -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();
    for key in [WorkerKey::Coder, WorkerKey::File, WorkerKey::Web, WorkerKey::Casual] {
        registry.register(Arc::new(ScriptedWorker::new(key)));
    }
    for worker in workers {
        registry.register(Arc::new(worker));
    }
    registry
}
