//! Execution environment of a single job: identifiers, directories,
//! policies and the trace/activity outputs.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use events::{into_fields, ActivityBus};
use serde_json::Value;
use taskflow_core::{JobConfig, RunMode, ToolPolicy, TraceConfig, WorkerPolicy};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::Result;
use crate::trace::TraceSink;

const DEFAULT_RUN_PARENT: &str = "runs";
const DEFAULT_TRACE_FILE: &str = "trace.jsonl";

/// Shared cancellation flag for a run. Clones observe the same flag, and
/// [`stopped`](Self::stopped) lets a task wait for it.
#[derive(Debug, Clone)]
pub struct StopFlag(Arc<watch::Sender<bool>>);

impl Default for StopFlag {
    fn default() -> Self {
        Self(Arc::new(watch::channel(false).0))
    }
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.send_replace(true);
    }

    pub fn clear(&self) {
        self.0.send_replace(false);
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the flag is set, immediately if it already is.
    pub async fn stopped(&self) {
        let mut rx = self.0.subscribe();
        // the sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Everything one execution of a job needs to know about where it runs and
/// what it may do. Immutable once built.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: String,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    pub mode: RunMode,
    pub trace_config: TraceConfig,
    pub tool_policy: ToolPolicy,
    pub worker_policy: WorkerPolicy,
    sink: Option<TraceSink>,
    activity: ActivityBus,
    stop: StopFlag,
}

impl RunContext {
    /// Context without a trace file, writing activity to a private bus.
    pub fn new(run_id: impl Into<String>, work_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_id: run_id.into(),
            work_dir: work_dir.into(),
            output_dir: output_dir.into(),
            mode: RunMode::Standard,
            trace_config: TraceConfig::default(),
            tool_policy: ToolPolicy::default(),
            worker_policy: WorkerPolicy::default(),
            sink: None,
            activity: ActivityBus::new(),
            stop: StopFlag::new(),
        }
    }

    /// Build the context for a dequeued job and create its output directory.
    ///
    /// `default_mode` and `default_run_parent` come from the engine config and
    /// are overridden by the job's own settings.
    pub async fn prepare(
        run_id: impl Into<String>,
        work_dir: &Path,
        config: &JobConfig,
        default_mode: RunMode,
        default_run_parent: &str,
        activity: ActivityBus,
    ) -> Result<Self> {
        let run_id = run_id.into();
        let run_parent = config.run_parent_dir.as_deref().unwrap_or(default_run_parent);
        let output_dir = resolve_output_dir(work_dir, run_parent, &run_id);
        tokio::fs::create_dir_all(&output_dir).await?;

        let mode = config.mode.unwrap_or(default_mode);
        let mut ctx = Self::new(run_id, work_dir, output_dir)
            .with_policies(
                config.trace_config.clone(),
                config.tool_policy.clone(),
                config.worker_policy.clone(),
            )
            .with_activity(activity);
        ctx.mode = mode;

        if mode == RunMode::Trace && ctx.trace_config.enabled {
            let trace_path = resolve_trace_file(&ctx.output_dir, config.trace_file.as_deref());
            ctx = ctx.with_trace_file(trace_path)?;
        }

        debug!(
            run_id = %ctx.run_id,
            output_dir = %ctx.output_dir.display(),
            mode = mode.as_str(),
            "Run context prepared"
        );
        Ok(ctx)
    }

    pub fn with_policies(mut self, trace: TraceConfig, tools: ToolPolicy, workers: WorkerPolicy) -> Self {
        self.trace_config = trace;
        self.tool_policy = tools;
        self.worker_policy = workers;
        self
    }

    pub fn with_worker_policy(mut self, workers: WorkerPolicy) -> Self {
        self.worker_policy = workers;
        self
    }

    pub fn with_activity(mut self, activity: ActivityBus) -> Self {
        self.activity = activity;
        self
    }

    pub fn with_stop_flag(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_trace_file(mut self, path: impl Into<PathBuf>) -> Result<Self> {
        self.sink = Some(TraceSink::new(path, self.trace_config.max_chars_per_field)?);
        self.mode = RunMode::Trace;
        Ok(self)
    }

    pub fn trace_file(&self) -> Option<&Path> {
        self.sink.as_ref().map(|s| s.path())
    }

    pub fn activity(&self) -> &ActivityBus {
        &self.activity
    }

    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Record an event on the activity bus and, in trace mode, in the trace
    /// file. Events filtered out by the trace config go nowhere.
    pub fn trace(&self, event: &str, fields: Value) {
        if !self.trace_config.allow_event(event) {
            return;
        }
        if let Some(sink) = &self.sink {
            sink.record(event, Some(&self.run_id), &into_fields(fields.clone()));
        }
        self.activity.emit(event, Some(&self.run_id), fields);
    }
}

/// `<work_dir>/<run_parent>/<run_id>`, falling back to the default parent
/// when `run_parent` would leave `work_dir`.
pub fn resolve_output_dir(work_dir: &Path, run_parent: &str, run_id: &str) -> PathBuf {
    let parent = Path::new(run_parent.trim());
    let escapes = parent.as_os_str().is_empty()
        || parent
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        warn!(run_parent, "Run parent directory escapes the work dir, using default");
        return work_dir.join(DEFAULT_RUN_PARENT).join(run_id);
    }
    work_dir.join(parent).join(run_id)
}

fn resolve_trace_file(output_dir: &Path, trace_file: Option<&str>) -> PathBuf {
    match trace_file.map(str::trim).filter(|t| !t.is_empty()) {
        Some(file) if Path::new(file).is_absolute() => PathBuf::from(file),
        Some(file) => output_dir.join(file),
        None => output_dir.join(DEFAULT_TRACE_FILE),
    }
}
