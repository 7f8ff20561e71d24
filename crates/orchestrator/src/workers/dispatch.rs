use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use taskflow_core::Step;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Worker, WorkerContext, WorkerOutput, WorkerRegistry};
use crate::error::Result;
use crate::run_context::RunContext;
use crate::trace;

/// Shortest time a worker is ever given, even when the step budget is
/// nearly used up.
const MIN_DISPATCH_SECS: u64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Completed,
    /// The worker overran its budget; `output` holds salvaged partial work.
    TimedOut,
    /// The worker policy of the run forbids this worker.
    Disabled,
    /// The run was stopped while the worker was busy.
    Stopped,
    /// The worker returned an error, panicked or is not registered.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub output: String,
    pub success: bool,
    pub kind: OutcomeKind,
}

impl DispatchOutcome {
    fn failed(output: String) -> Self {
        Self {
            output,
            success: false,
            kind: OutcomeKind::Failed,
        }
    }
}

/// Runs one step attempt on its worker under a hard deadline.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<WorkerRegistry>,
    cancel_grace: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<WorkerRegistry>, cancel_grace: Duration) -> Self {
        Self {
            registry,
            cancel_grace,
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Never returns an error: disabled workers, failures and timeouts are
    /// all reported through the outcome.
    pub async fn dispatch(&self, ctx: &RunContext, step: &Step, prompt: String, budget: Duration) -> DispatchOutcome {
        let key = step.worker;

        if !ctx.worker_policy.allow_worker(key) {
            warn!(run_id = %ctx.run_id, step_id = %step.id, worker = %key, "Worker disabled by policy");
            ctx.trace(
                trace::WORKER_DISABLED,
                json!({"step_id": step.id, "worker": key.as_str()}),
            );
            return DispatchOutcome {
                output: format!(
                    "Worker '{}' is disabled by the run's worker policy. The plan must be updated to use allowed workers.",
                    key
                ),
                success: false,
                kind: OutcomeKind::Disabled,
            };
        }

        let Some(worker) = self.registry.get(key) else {
            warn!(run_id = %ctx.run_id, worker = %key, "No worker registered");
            return DispatchOutcome::failed(format!("Worker '{}' is not available.", key));
        };

        worker.reset_run_state();
        let timeout = budget.max(Duration::from_secs(MIN_DISPATCH_SECS));
        let wctx = WorkerContext::from_run(ctx);

        debug!(
            run_id = %ctx.run_id,
            step_id = %step.id,
            worker = %key,
            timeout_secs = timeout.as_secs(),
            "Dispatching step"
        );

        let task_worker = worker.clone();
        let mut handle: JoinHandle<Result<WorkerOutput>> =
            tokio::spawn(async move { task_worker.process(&prompt, &wctx).await });

        let joined = tokio::select! {
            joined = tokio::time::timeout(timeout, &mut handle) => joined,
            _ = ctx.stop_flag().stopped() => {
                info!(run_id = %ctx.run_id, step_id = %step.id, worker = %key, "Run stopped, cancelling worker");
                let (finished, partial) = self.cancel(worker.as_ref(), &mut handle).await;
                let output = finished
                    .or(partial)
                    .unwrap_or_else(|| "[system] Run stopped by request.".to_string());
                return DispatchOutcome {
                    output,
                    success: false,
                    kind: OutcomeKind::Stopped,
                };
            }
        };

        match joined {
            Ok(Ok(Ok(out))) => DispatchOutcome {
                output: out.answer,
                success: out.success,
                kind: OutcomeKind::Completed,
            },
            Ok(Ok(Err(e))) => {
                warn!(run_id = %ctx.run_id, step_id = %step.id, worker = %key, error = %e, "Worker failed");
                DispatchOutcome::failed(format!("Worker '{}' failed: {}", key, e))
            }
            Ok(Err(join_err)) => {
                warn!(run_id = %ctx.run_id, step_id = %step.id, worker = %key, error = %join_err, "Worker task crashed");
                DispatchOutcome::failed(format!("Worker '{}' crashed: {}", key, join_err))
            }
            Err(_) => {
                let (_, partial) = self.cancel(worker.as_ref(), &mut handle).await;
                let secs = timeout.as_secs();
                let note = format!(
                    "[system] Loop detector: step timed out after {}s. Forcing advance to the next step so the queue can continue.",
                    secs
                );

                info!(run_id = %ctx.run_id, step_id = %step.id, worker = %key, timeout_secs = secs, "Step timed out, forcing advance");
                ctx.trace(
                    trace::STEP_TIMEOUT,
                    json!({
                        "step_id": step.id,
                        "worker": key.as_str(),
                        "timeout_s": secs,
                        "task": step.task,
                        "salvaged": partial.is_some(),
                    }),
                );

                let output = match partial {
                    Some(partial) => format!("{}\n\n{}", partial, note),
                    None => note,
                };
                DispatchOutcome {
                    output,
                    success: true,
                    kind: OutcomeKind::TimedOut,
                }
            }
        }
    }

    /// Ask the worker to stop, give it the grace period, then abort it.
    /// Returns the answer if it still finished in time, and whatever partial
    /// work it exposes.
    async fn cancel(
        &self,
        worker: &dyn Worker,
        handle: &mut JoinHandle<Result<WorkerOutput>>,
    ) -> (Option<String>, Option<String>) {
        worker.request_stop();
        let finished = match tokio::time::timeout(self.cancel_grace, &mut *handle).await {
            Ok(Ok(Ok(out))) => Some(out.answer),
            Ok(_) => None,
            Err(_) => {
                handle.abort();
                None
            }
        };

        let partial = worker
            .partial_output()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        (finished, partial)
    }
}
