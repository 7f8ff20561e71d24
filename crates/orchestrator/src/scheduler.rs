//! Sequential job scheduler.
//!
//! Owns the FIFO queue, the per-job status/result registries and the single
//! active-run pointer. One job runs at a time; everything else waits in the
//! queue and may still be edited or removed until it is dequeued.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use events::ActivityBus;
use serde::Serialize;
use serde_json::json;
use taskflow_core::{Amendment, Job, JobConfig, JobPatch, JobResult, JobStatus};
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::amendments::AmendmentBus;
use crate::background::BackgroundTasks;
use crate::config::EngineConfig;
use crate::error::{OrchestratorError, Result};
use crate::plan_runner::RunOutcome;
use crate::run_context::{RunContext, StopFlag};
use crate::summary::TraceSummarizer;
use crate::trace;

const MAX_PREFIX_LEN: usize = 40;
const CRASH_ANSWER: &str = "Error: run failed. Please retry.";

/// Runs one dequeued job to completion.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, ctx: Arc<RunContext>, goal: String) -> Result<RunOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Enqueued {
    pub uid: Uuid,
    /// 1-based position in the queue at submission time.
    pub position: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub queued: Vec<Job>,
    pub running: Option<Uuid>,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Job>,
    status: HashMap<Uuid, JobStatus>,
    results: HashMap<Uuid, JobResult>,
    run_ids: HashMap<Uuid, String>,
}

struct ActiveRun {
    uid: Uuid,
    run_id: String,
    stop: StopFlag,
}

pub struct Scheduler {
    work_dir: PathBuf,
    config: EngineConfig,
    executor: Arc<dyn JobExecutor>,
    amendments: Arc<AmendmentBus>,
    activity: ActivityBus,
    background: BackgroundTasks,
    summarizer: Option<Arc<TraceSummarizer>>,
    state: Mutex<QueueState>,
    active: RwLock<Option<ActiveRun>>,
    paused: AtomicBool,
    wake: Notify,
}

impl Scheduler {
    pub fn new(
        work_dir: impl Into<PathBuf>,
        config: EngineConfig,
        executor: Arc<dyn JobExecutor>,
        amendments: Arc<AmendmentBus>,
        activity: ActivityBus,
    ) -> Self {
        Self {
            work_dir: work_dir.into(),
            config,
            executor,
            amendments,
            activity,
            background: BackgroundTasks::new(),
            summarizer: None,
            state: Mutex::new(QueueState::default()),
            active: RwLock::new(None),
            paused: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Summarize each successful traced run in the background.
    pub fn with_summarizer(mut self, summarizer: TraceSummarizer) -> Self {
        self.summarizer = Some(Arc::new(summarizer));
        self
    }

    pub fn activity(&self) -> &ActivityBus {
        &self.activity
    }

    pub fn background(&self) -> &BackgroundTasks {
        &self.background
    }

    pub fn enqueue(&self, goal: &str, config: JobConfig) -> Result<Enqueued> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(OrchestratorError::invalid("goal cannot be empty"));
        }

        let job = Job::new(goal, config);
        let uid = job.uid;
        let position = {
            let mut state = self.state.lock().unwrap();
            state.status.insert(uid, JobStatus::Queued);
            state.queue.push_back(job);
            state.queue.len()
        };

        info!(job_uid = %uid, position, "Job queued");
        self.activity
            .emit("job_queued", None, json!({"uid": uid, "position": position}));
        self.wake.notify_one();
        Ok(Enqueued { uid, position })
    }

    /// Pop the oldest queued job and mark it running in the same critical
    /// section, so edits racing with the poller see the new status.
    pub fn dequeue(&self) -> Option<Job> {
        let mut state = self.state.lock().unwrap();
        let mut job = state.queue.pop_front()?;
        job.status = JobStatus::Running;
        state.status.insert(job.uid, JobStatus::Running);
        Some(job)
    }

    pub fn edit_queued(&self, uid: Uuid, patch: &JobPatch) -> Result<Job> {
        patch
            .validate()
            .map_err(|e| OrchestratorError::invalid(e.to_string()))?;

        let mut state = self.state.lock().unwrap();
        Self::ensure_queued(&state, uid)?;
        let job = state
            .queue
            .iter_mut()
            .find(|j| j.uid == uid)
            .ok_or(OrchestratorError::JobNotFound(uid))?;
        job.apply(patch);

        debug!(job_uid = %uid, "Queued job edited");
        Ok(job.clone())
    }

    pub fn delete_queued(&self, uid: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::ensure_queued(&state, uid)?;
        let before = state.queue.len();
        state.queue.retain(|j| j.uid != uid);
        if state.queue.len() == before {
            return Err(OrchestratorError::JobNotFound(uid));
        }
        state.status.remove(&uid);
        state.results.remove(&uid);

        debug!(job_uid = %uid, "Queued job deleted");
        Ok(())
    }

    /// The status registry is authoritative, not the queue contents.
    fn ensure_queued(state: &QueueState, uid: Uuid) -> Result<()> {
        match state.status.get(&uid) {
            None => Err(OrchestratorError::JobNotFound(uid)),
            Some(JobStatus::Queued) => Ok(()),
            Some(status) => Err(OrchestratorError::conflict(uid, *status)),
        }
    }

    pub fn status(&self, uid: Uuid) -> Option<JobStatus> {
        self.state.lock().unwrap().status.get(&uid).copied()
    }

    pub fn result(&self, uid: Uuid) -> Option<JobResult> {
        self.state.lock().unwrap().results.get(&uid).cloned()
    }

    pub fn run_id(&self, uid: Uuid) -> Option<String> {
        self.state.lock().unwrap().run_ids.get(&uid).cloned()
    }

    pub fn queue_items(&self) -> QueueSnapshot {
        let queued = self.state.lock().unwrap().queue.iter().cloned().collect();
        let running = self.active.read().unwrap().as_ref().map(|a| a.uid);
        QueueSnapshot { queued, running }
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn active_run_id(&self) -> Option<String> {
        self.active.read().unwrap().as_ref().map(|a| a.run_id.clone())
    }

    /// Attach a note to the run that is currently executing.
    pub fn amend(&self, text: &str) -> Result<(String, Amendment)> {
        let text = text.trim();
        if text.is_empty() {
            return Err(OrchestratorError::invalid("amendment text cannot be empty"));
        }
        // the active lock is held so the run cannot finish and clear its
        // notes between the check and the add
        let active = self.active.read().unwrap();
        let run_id = active
            .as_ref()
            .map(|a| a.run_id.clone())
            .ok_or(OrchestratorError::NoActiveRun)?;
        if !self.amendments.add(&run_id, text) {
            return Err(OrchestratorError::NoActiveRun);
        }
        drop(active);

        info!(run_id = %run_id, "Amendment added");
        let preview: String = text.chars().take(200).collect();
        self.activity
            .emit("amendment", Some(&run_id), json!({"text": preview}));
        Ok((run_id, Amendment::new(text)))
    }

    pub fn amendments(&self, run_id: &str) -> Vec<Amendment> {
        self.amendments.pending(run_id)
    }

    /// Pause the queue and ask the active run to stop. Returns whether a run
    /// was active.
    pub fn request_stop(&self) -> bool {
        self.paused.store(true, Ordering::SeqCst);
        let active = self.active.read().unwrap();
        match active.as_ref() {
            Some(run) => {
                info!(run_id = %run.run_id, "Stop requested");
                run.stop.stop();
                true
            }
            None => {
                info!("Queue paused");
                false
            }
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("Queue resumed");
        }
        self.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Poll until `shutdown` flips to `true`. A job that fails or panics is
    /// recorded and the loop moves on.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(work_dir = %self.work_dir.display(), "Scheduler started");
        let mut tick = tokio::time::interval(self.config.poll_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.wake.notified() => {}
                _ = tick.tick() => {}
            }

            while self.process_next().await.is_some() {
                if *shutdown.borrow() {
                    break;
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// Run the next queued job, unless the queue is paused or empty.
    pub async fn process_next(&self) -> Option<JobResult> {
        if self.is_paused() {
            return None;
        }
        let job = self.dequeue()?;
        Some(self.process_one(job).await)
    }

    async fn process_one(&self, job: Job) -> JobResult {
        let uid = job.uid;
        let prefix = job
            .config
            .project_name
            .as_deref()
            .or(self.config.project_name.as_deref())
            .and_then(safe_run_prefix);
        let run_id = match prefix {
            Some(prefix) => format!("{}_{}", prefix, Uuid::new_v4()),
            None => Uuid::new_v4().to_string(),
        };
        self.state.lock().unwrap().run_ids.insert(uid, run_id.clone());

        info!(job_uid = %uid, run_id = %run_id, "Job started");
        self.activity
            .emit("job_started", Some(&run_id), json!({"uid": uid, "goal": job.goal}));

        let stop = StopFlag::new();
        let ctx = match RunContext::prepare(
            run_id.clone(),
            &self.work_dir,
            &job.config,
            self.config.mode,
            &self.config.run_parent_dir,
            self.activity.clone(),
        )
        .await
        {
            Ok(ctx) => Arc::new(ctx.with_stop_flag(stop.clone())),
            Err(e) => {
                error!(job_uid = %uid, run_id = %run_id, error = %e, "Failed to prepare run");
                let mut result = JobResult::failed(uid, CRASH_ANSWER, e.to_string());
                result.run_id = Some(run_id);
                return self.finish(result);
            }
        };

        *self.active.write().unwrap() = Some(ActiveRun {
            uid,
            run_id: run_id.clone(),
            stop,
        });

        let executor = self.executor.clone();
        let run_ctx = ctx.clone();
        let goal = job.goal.clone();
        let handle = tokio::spawn(async move { executor.execute(run_ctx, goal).await });

        let outcome = match handle.await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(e),
            Err(join_err) => Err(OrchestratorError::JobCrashed(join_err.to_string())),
        };

        {
            let mut active = self.active.write().unwrap();
            *active = None;
            self.amendments.clear(&run_id);
        }

        let trace_file = ctx.trace_file().map(Path::to_path_buf);
        let result = match outcome {
            Ok(outcome) => {
                let status = if outcome.success { JobStatus::Done } else { JobStatus::Failed };
                let reasoning = if outcome.stopped {
                    "Run stopped by request.".to_string()
                } else {
                    format!("{} step(s) executed.", outcome.results.len())
                };
                JobResult {
                    uid,
                    status,
                    success: outcome.success,
                    answer: outcome.answer,
                    reasoning,
                    run_id: Some(run_id.clone()),
                    output_dir: Some(ctx.output_dir.clone()),
                    trace_file: trace_file.clone(),
                    finished_at: Utc::now(),
                }
            }
            Err(e) => {
                error!(job_uid = %uid, run_id = %run_id, error = %e, "Job failed");
                ctx.trace(trace::JOB_FAILED, json!({"uid": uid, "error": e.to_string()}));
                let mut result = JobResult::failed(uid, CRASH_ANSWER, e.to_string());
                result.run_id = Some(run_id.clone());
                result.output_dir = Some(ctx.output_dir.clone());
                result.trace_file = trace_file.clone();
                result
            }
        };

        if result.success {
            if let (Some(summarizer), Some(path)) = (self.summarizer.clone(), trace_file) {
                let activity = self.activity.clone();
                let query = job.goal.clone();
                let run_id = run_id.clone();
                self.background.spawn("run_summary", async move {
                    summarizer
                        .summarize(&run_id, &query, &path, &activity)
                        .await
                        .map(|_| ())
                });
            }
        }

        self.finish(result)
    }

    fn finish(&self, result: JobResult) -> JobResult {
        info!(
            job_uid = %result.uid,
            status = result.status.as_str(),
            success = result.success,
            "Job finished"
        );
        self.activity.emit(
            "job_finished",
            result.run_id.as_deref(),
            json!({"uid": result.uid, "status": result.status, "success": result.success}),
        );

        let mut state = self.state.lock().unwrap();
        state.status.insert(result.uid, result.status);
        state.results.insert(result.uid, result.clone());
        result
    }
}

/// Filesystem-safe run id prefix derived from a project name.
pub fn safe_run_prefix(project_name: &str) -> Option<String> {
    let lowered = project_name.trim().to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_dash = false;
    for ch in lowered.chars() {
        if ch.is_alphanumeric() || matches!(ch, '_' | '.' | '-') {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }

    let trim = |s: &str| s.trim_matches(|c| matches!(c, '-' | '.' | ' ' | '_')).to_string();
    let slug: String = trim(&out).chars().take(MAX_PREFIX_LEN).collect();
    let slug = trim(&slug);
    (!slug.is_empty()).then_some(slug)
}
