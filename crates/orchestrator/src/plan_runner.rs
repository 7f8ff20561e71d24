//! Drives one job end to end: plan, then for every step dispatch, verify,
//! retry or advance, and repair the remaining plan.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use taskflow_core::{Plan, Step, StepStatus, WorkerKey};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::amendments::{format_block, AmendmentBus};
use crate::backend::{ReasoningBackend, RetryingBackend};
use crate::config::EngineConfig;
use crate::error::{OrchestratorError, Result};
use crate::plan_builder::PlanBuilder;
use crate::prompts::Prompts;
use crate::retry_policy::{Progress, RetryPolicy};
use crate::run_context::RunContext;
use crate::scheduler::JobExecutor;
use crate::trace;
use crate::verifier::{Verifier, VerifyRequest};
use crate::workers::{Dispatcher, OutcomeKind, WorkerRegistry};

/// Output of one finished step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepResult {
    pub step_id: String,
    pub worker: WorkerKey,
    pub output: String,
    pub success: bool,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Output of the last executed step, or the reason no step ran.
    pub answer: String,
    pub success: bool,
    pub plan: Option<Plan>,
    pub results: Vec<StepResult>,
    pub stopped: bool,
}

impl RunOutcome {
    fn unplanned(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            success: false,
            plan: None,
            results: Vec::new(),
            stopped: false,
        }
    }
}

pub struct PlanRunner {
    planner: PlanBuilder,
    verifier: Verifier,
    dispatcher: Dispatcher,
    amendments: Arc<AmendmentBus>,
    retry: RetryPolicy,
    step_timeout: Duration,
}

impl PlanRunner {
    pub fn new(
        backend: Arc<dyn ReasoningBackend>,
        registry: Arc<WorkerRegistry>,
        amendments: Arc<AmendmentBus>,
        config: &EngineConfig,
    ) -> Self {
        let backend: Arc<dyn ReasoningBackend> =
            Arc::new(RetryingBackend::new(backend, config.backend_empty_retries));
        let retry = config.retry_policy();

        Self {
            planner: PlanBuilder::new(backend.clone(), registry.clone(), config.plan_max_attempts),
            verifier: Verifier::new(backend, retry.max_retries, retry.min_remaining_secs),
            dispatcher: Dispatcher::new(registry, config.cancel_grace()),
            amendments,
            retry,
            step_timeout: config.step_timeout(),
        }
    }

    pub async fn run(&self, ctx: &RunContext, goal: &str) -> RunOutcome {
        info!(run_id = %ctx.run_id, "Run started");
        ctx.trace(trace::USER_QUERY, json!({"query": goal}));

        let mut plan = match self.planner.build_plan(ctx, goal).await {
            Ok(plan) => plan,
            Err(OrchestratorError::PlanUnavailable { attempts, last }) => {
                warn!(run_id = %ctx.run_id, attempts, error = %last, "No usable plan");
                return self.finish(ctx, RunOutcome::unplanned("Failed to parse the tasks."));
            }
            Err(e) => {
                warn!(run_id = %ctx.run_id, error = %e, "Planning failed");
                return self.finish(ctx, RunOutcome::unplanned(format!("Planning failed: {}", e)));
            }
        };

        let mut results: Vec<StepResult> = Vec::new();
        let mut stopped = false;
        let mut i = 0;

        while i < plan.len() {
            if ctx.is_stopped() {
                stopped = true;
                break;
            }

            let result = self.run_step(ctx, &mut plan, i, &results, false).await;
            let step_id = result.step_id.clone();
            let (output, success) = (result.output.clone(), result.success);
            results.push(result);

            if ctx.is_stopped() {
                stopped = true;
                break;
            }

            plan = self.planner.repair_plan(ctx, &plan, &step_id, &output, success).await;
            i += 1;
        }

        // notes that arrived after the last step was accepted get one more
        // round of that step; once none are waiting the run stops taking them
        while !stopped && !self.amendments.close_if_drained(&ctx.run_id) {
            if ctx.is_stopped() {
                stopped = true;
                break;
            }
            let Some(idx) = results
                .last()
                .and_then(|last| plan.steps.iter().position(|s| s.id == last.step_id))
            else {
                break;
            };

            let step = &mut plan.steps[idx];
            step.reopen();
            info!(run_id = %ctx.run_id, step_id = %step.id, "Late amendment, reopening last step");
            ctx.trace(
                trace::PLAN_STEP,
                json!({"step_idx": idx, "status": step.status.as_str(), "step": step}),
            );

            let earlier = &results[..results.len() - 1];
            let result = self.run_step(ctx, &mut plan, idx, earlier, true).await;
            results.pop();
            results.push(result);
        }

        if stopped {
            info!(run_id = %ctx.run_id, step_idx = i, "Run stopped by request");
            ctx.trace(trace::RUN_STOPPED, json!({"step_idx": i}));
        }

        let answer = results.last().map(|r| r.output.clone()).unwrap_or_default();
        self.finish(
            ctx,
            RunOutcome {
                answer,
                success: !stopped,
                plan: Some(plan),
                results,
                stopped,
            },
        )
    }

    fn finish(&self, ctx: &RunContext, outcome: RunOutcome) -> RunOutcome {
        info!(
            run_id = %ctx.run_id,
            success = outcome.success,
            steps = outcome.results.len(),
            "Run finished"
        );
        ctx.trace(
            trace::FINAL_ANSWER,
            json!({"answer": outcome.answer, "success": outcome.success, "stopped": outcome.stopped}),
        );
        outcome
    }

    /// Attempts triggered only by new amendments do not count toward the
    /// retry ceiling; `amended` marks the first attempt as one of those.
    async fn run_step(
        &self,
        ctx: &RunContext,
        plan: &mut Plan,
        idx: usize,
        results: &[StepResult],
        amended: bool,
    ) -> StepResult {
        let goal = plan.goal.clone();
        let step = &mut plan.steps[idx];
        let inputs = collect_inputs(step, results);

        set_status(ctx, step, idx, StepStatus::Running);
        info!(run_id = %ctx.run_id, step_id = %step.id, worker = %step.worker, "Step started");

        let started = Instant::now();
        let max_attempts = self.retry.max_attempts();
        let mut previous: Option<Progress> = None;
        let mut output = String::new();
        let mut success;
        let mut amended_retry = amended;

        loop {
            let remaining = self.step_timeout.saturating_sub(started.elapsed());

            if !amended_retry && step.attempts >= max_attempts {
                output = append_note(&output, "[system] Verifier: incomplete, but advancing (max retries).");
                ctx.trace(
                    trace::STEP_FORCED_ADVANCE,
                    json!({"step_idx": idx, "step_id": step.id, "reason": "max retries"}),
                );
                success = true;
                break;
            }

            if remaining.is_zero() {
                warn!(run_id = %ctx.run_id, step_id = %step.id, "Step time budget exceeded, forcing advance");
                output = append_note(
                    &output,
                    &format!(
                        "[system] Step time budget exceeded ({}s). Forcing advance to keep the queue moving.",
                        self.step_timeout.as_secs()
                    ),
                );
                ctx.trace(
                    trace::STEP_BUDGET_EXCEEDED,
                    json!({"step_idx": idx, "step_id": step.id, "elapsed_s": started.elapsed().as_secs()}),
                );
                success = true;
                break;
            }

            if !amended_retry {
                step.attempts += 1;
            }
            amended_retry = false;
            let attempt = step.attempts;

            let amendments = self.amendments.take(&ctx.run_id);
            if !amendments.is_empty() {
                info!(run_id = %ctx.run_id, step_id = %step.id, count = amendments.len(), "Incorporating amendments");
                step.task.push_str(&format_block(&goal, &amendments));
                ctx.trace(
                    trace::AMENDMENT_INCORPORATED,
                    json!({
                        "step_idx": idx,
                        "step_id": step.id,
                        "count": amendments.len(),
                        "texts": amendments.iter().map(|a| a.text.as_str()).collect::<Vec<_>>(),
                    }),
                );
            }

            let prompt = Prompts::worker_prompt(&step.task, &inputs, step);
            let outcome = self.dispatcher.dispatch(ctx, step, prompt, remaining).await;
            output = outcome.output;
            success = outcome.success;

            if ctx.is_stopped() {
                break;
            }
            match outcome.kind {
                OutcomeKind::TimedOut | OutcomeKind::Disabled | OutcomeKind::Stopped => break,
                OutcomeKind::Completed | OutcomeKind::Failed => {}
            }

            if self.amendments.has_pending(&ctx.run_id) {
                debug!(run_id = %ctx.run_id, step_id = %step.id, "Amendment arrived during dispatch, retrying step");
                amended_retry = true;
                continue;
            }

            let remaining_secs = self.step_timeout.saturating_sub(started.elapsed()).as_secs();
            let verdict = self
                .verifier
                .verify(VerifyRequest {
                    goal: &goal,
                    step,
                    output: &output,
                    success,
                    attempt,
                    elapsed_secs: started.elapsed().as_secs(),
                    remaining_secs,
                })
                .await;
            ctx.trace(
                trace::STEP_VERDICT,
                json!({"step_idx": idx, "step_id": step.id, "attempt": attempt, "verdict": verdict}),
            );

            let advance = if verdict.is_done {
                None
            } else {
                self.retry.decide(&verdict, attempt, remaining_secs, previous)
            };
            if (verdict.is_done || advance.is_some()) && self.amendments.has_pending(&ctx.run_id) {
                debug!(run_id = %ctx.run_id, step_id = %step.id, "Amendment arrived during verification, retrying step");
                amended_retry = true;
                continue;
            }

            if verdict.is_done {
                output = append_note(
                    &output,
                    &format!("[system] Verifier: step complete (confidence={:.2}).", verdict.confidence),
                );
                success = true;
                break;
            }

            if let Some(reason) = advance {
                info!(run_id = %ctx.run_id, step_id = %step.id, reason = reason.as_str(), "Advancing incomplete step");
                output = append_note(
                    &output,
                    &format!("[system] Verifier: incomplete, but advancing ({}).", reason.as_str()),
                );
                ctx.trace(
                    trace::STEP_FORCED_ADVANCE,
                    json!({
                        "step_idx": idx,
                        "step_id": step.id,
                        "reason": reason.as_str(),
                        "missing": verdict.missing,
                    }),
                );
                success = true;
                break;
            }

            debug!(run_id = %ctx.run_id, step_id = %step.id, attempt, missing = verdict.missing.len(), "Retrying step");
            previous = Some(Progress::from(&verdict));
            step.task
                .push_str(&Prompts::retry_note(&verdict, attempt, self.retry.max_retries, &output));
        }

        let status = if success { StepStatus::Completed } else { StepStatus::Failed };
        set_status(ctx, step, idx, status);

        StepResult {
            step_id: step.id.clone(),
            worker: step.worker,
            output,
            success,
            attempts: step.attempts,
        }
    }
}

#[async_trait]
impl JobExecutor for PlanRunner {
    async fn execute(&self, ctx: Arc<RunContext>, goal: String) -> Result<RunOutcome> {
        Ok(self.run(&ctx, &goal).await)
    }
}

/// Trace the transition, then apply it.
fn set_status(ctx: &RunContext, step: &mut Step, idx: usize, status: StepStatus) {
    ctx.trace(
        trace::PLAN_STEP,
        json!({"step_idx": idx, "status": status.as_str(), "step": step}),
    );
    if let Err(e) = step.transition(status) {
        warn!(run_id = %ctx.run_id, step_id = %step.id, error = %e, "Unexpected step transition");
        step.status = status;
    }
}

/// Outputs of the steps this one needs; workers that consume earlier work
/// get the two latest outputs when nothing was wired.
fn collect_inputs(step: &Step, results: &[StepResult]) -> Vec<(String, String)> {
    let mut inputs: Vec<(String, String)> = step
        .needs
        .iter()
        .filter_map(|need| {
            results
                .iter()
                .rev()
                .find(|r| &r.step_id == need)
                .map(|r| (r.step_id.clone(), r.output.clone()))
        })
        .collect();

    if inputs.is_empty() && step.worker.inherits_recent_outputs() {
        let skip = results.len().saturating_sub(2);
        inputs = results
            .iter()
            .skip(skip)
            .map(|r| (r.step_id.clone(), r.output.clone()))
            .collect();
    }
    inputs
}

fn append_note(output: &str, note: &str) -> String {
    if output.is_empty() {
        note.to_string()
    } else {
        format!("{}\n\n{}", output, note)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{full_registry_with, ScriptedBackend, ScriptedWorker};
    use crate::trace::{ForcedAdvanceKind, RunReplay};
    use events::ActivityBus;
    use taskflow_core::WorkerPolicy;
    use tempfile::TempDir;

    fn plan_response(steps: serde_json::Value) -> String {
        format!("Plan:\n```json\n{}\n```", json!({ "plan": steps }))
    }

    fn verdict_json(is_done: bool, confidence: f64, missing: &[&str]) -> String {
        json!({
            "is_done": is_done,
            "confidence": confidence,
            "missing": missing,
            "recommended_action": if is_done { "advance" } else { "retry" },
            "rationale": if is_done { "all checks pass" } else { "checks missing" },
        })
        .to_string()
    }

    fn runner(backend: &ScriptedBackend, workers: Vec<ScriptedWorker>, amendments: Arc<AmendmentBus>, config: &EngineConfig) -> PlanRunner {
        PlanRunner::new(
            Arc::new(backend.clone()),
            Arc::new(full_registry_with(workers)),
            amendments,
            config,
        )
    }

    async fn trace_ctx(dir: &TempDir, run_id: &str) -> RunContext {
        RunContext::new(run_id, dir.path(), dir.path().join(run_id))
            .with_activity(ActivityBus::new())
            .with_trace_file(dir.path().join(run_id).join("trace.jsonl"))
            .unwrap()
    }

    async fn replay(ctx: &RunContext) -> RunReplay {
        let events = trace::read_events(ctx.trace_file().unwrap(), 1000).await.unwrap();
        RunReplay::from_events(&events)
    }

    #[tokio::test]
    async fn test_retry_until_verifier_accepts() {
        let backend = ScriptedBackend::new([
            plan_response(json!([{
                "id": "1", "agent": "file", "task": "Write the report",
                "deliverable": "report.md",
                "definition_of_done": ["output contains heading 'Summary'"]
            }])),
            verdict_json(false, 0.3, &["add heading 'Summary'"]),
            verdict_json(true, 0.9, &[]),
            "NO_UPDATE".to_string(),
        ]);
        let worker = ScriptedWorker::new(WorkerKey::File)
            .respond("# Report\nfindings")
            .respond("# Report\n## Summary\nfindings");
        let dir = TempDir::new().unwrap();
        let ctx = trace_ctx(&dir, "run-a").await;

        let outcome = runner(&backend, vec![worker.clone()], Arc::new(AmendmentBus::new()), &EngineConfig::default())
            .run(&ctx, "Write a report")
            .await;

        assert!(outcome.success);
        let step = &outcome.plan.as_ref().unwrap().steps[0];
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.attempts, 2);
        assert!(outcome.answer.contains("## Summary"));
        assert!(outcome.answer.ends_with("[system] Verifier: step complete (confidence=0.90)."));

        let prompts = worker.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[0].contains("VERIFIER FEEDBACK"));
        assert!(prompts[1].contains("VERIFIER FEEDBACK - ATTEMPT 1/6 INCOMPLETE"));
        assert!(prompts[1].contains("1. add heading 'Summary'"));
        assert!(prompts[1].contains("# Report\nfindings"));

        let replay = replay(&ctx).await;
        assert_eq!(replay.verdicts.len(), 2);
        assert_eq!(replay.step_outcomes(), vec![("1".to_string(), StepStatus::Completed)]);
        assert_eq!(replay.final_answer.as_deref(), Some(outcome.answer.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_advances_without_verifier() {
        let backend = ScriptedBackend::new([
            plan_response(json!([{
                "id": "1", "agent": "web", "task": "Research prices",
                "definition_of_done": ["three prices with URLs"]
            }])),
            "NO_UPDATE".to_string(),
        ]);
        let worker = ScriptedWorker::new(WorkerKey::Web)
            .hang()
            .with_partial("On https://shop.example: model A costs 10");
        let config = EngineConfig::default().with_step_timeout(30);
        let dir = TempDir::new().unwrap();
        let ctx = trace_ctx(&dir, "run-b").await;

        let started = Instant::now();
        let outcome = runner(&backend, vec![worker], Arc::new(AmendmentBus::new()), &config)
            .run(&ctx, "Find prices")
            .await;

        assert!(outcome.success);
        let result = &outcome.results[0];
        assert!(result.success);
        assert_eq!(result.attempts, 1);
        assert!(result.output.starts_with("On https://shop.example"));
        assert!(result.output.contains("step timed out after 30s"));
        assert_eq!(outcome.plan.unwrap().steps[0].status, StepStatus::Completed);

        // planning and repair only
        assert_eq!(backend.call_count(), 2);
        assert!(started.elapsed() < Duration::from_secs(40));

        let replay = replay(&ctx).await;
        assert!(replay.verdicts.is_empty());
        assert_eq!(replay.forced_advances[0].kind, ForcedAdvanceKind::Timeout);
    }

    #[tokio::test]
    async fn test_unparseable_plans_fail_the_run() {
        let backend = ScriptedBackend::new(["no plan", "still none", "nope", "never"]);
        let dir = TempDir::new().unwrap();
        let ctx = trace_ctx(&dir, "run-c").await;

        let outcome = runner(&backend, vec![], Arc::new(AmendmentBus::new()), &EngineConfig::default())
            .run(&ctx, "goal")
            .await;

        assert!(!outcome.success);
        assert!(outcome.plan.is_none());
        assert_eq!(outcome.answer, "Failed to parse the tasks.");
        assert_eq!(backend.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_amendment_during_dispatch_skips_verifier() {
        let backend = ScriptedBackend::new([
            plan_response(json!([
                {"id": "1", "agent": "casual", "task": "Intro"},
                {"id": "2", "agent": "web", "task": "Compare plans", "definition_of_done": ["lists every plan"]}
            ])),
            "NO_UPDATE".to_string(),
            verdict_json(true, 0.8, &[]),
            "NO_UPDATE".to_string(),
        ]);
        let intro = ScriptedWorker::new(WorkerKey::Casual).respond("hello");
        let web = ScriptedWorker::new(WorkerKey::Web)
            .delay(Duration::from_secs(5), "plans without pricing")
            .respond("plans with pricing");
        let amendments = Arc::new(AmendmentBus::new());
        let runner = runner(
            &backend,
            vec![intro, web.clone()],
            amendments.clone(),
            &EngineConfig::default(),
        );
        let dir = TempDir::new().unwrap();
        let ctx = trace_ctx(&dir, "run-d").await;

        let amend = async {
            // lands while step 2 is being dispatched
            tokio::time::sleep(Duration::from_secs(2)).await;
            assert!(amendments.add("run-d", "also include pricing"));
        };
        let (outcome, ()) = tokio::join!(runner.run(&ctx, "Compare hosting plans"), amend);

        assert!(outcome.success);
        assert!(outcome.answer.starts_with("plans with pricing"));
        let step = &outcome.plan.as_ref().unwrap().steps[1];
        assert_eq!(step.attempts, 1);
        assert!(step.task.contains("1. also include pricing"));

        let prompts = web.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[0].contains("also include pricing"));
        assert!(prompts[1].contains("also include pricing"));
        assert!(!amendments.has_pending("run-d"));

        // planning, repair, one verification, repair
        assert_eq!(backend.call_count(), 4);
        let replay = replay(&ctx).await;
        assert_eq!(replay.amendments_incorporated, 1);
        assert_eq!(replay.verdicts.iter().filter(|(id, _)| id == "2").count(), 1);
    }

    /// Adds an amendment to the bus right before answering call `on_call`.
    struct AmendingBackend {
        inner: ScriptedBackend,
        bus: Arc<AmendmentBus>,
        run_id: &'static str,
        on_call: usize,
    }

    #[async_trait]
    impl ReasoningBackend for AmendingBackend {
        async fn respond(&self, messages: &[crate::backend::ChatMessage]) -> Result<String> {
            if self.inner.call_count() + 1 == self.on_call {
                assert!(self.bus.add(self.run_id, "also include pricing"));
            }
            self.inner.respond(messages).await
        }
    }

    fn amending_runner(
        backend: &ScriptedBackend,
        on_call: usize,
        run_id: &'static str,
        worker: ScriptedWorker,
        amendments: Arc<AmendmentBus>,
    ) -> PlanRunner {
        let amending = AmendingBackend {
            inner: backend.clone(),
            bus: amendments.clone(),
            run_id,
            on_call,
        };
        PlanRunner::new(
            Arc::new(amending),
            Arc::new(full_registry_with(vec![worker])),
            amendments,
            &EngineConfig::default(),
        )
    }

    fn one_step_plan() -> String {
        plan_response(json!([{
            "id": "1", "agent": "web", "task": "Compare hosting plans",
            "definition_of_done": ["lists every plan"]
        }]))
    }

    #[tokio::test]
    async fn test_amendment_during_verification_reruns_step() {
        let backend = ScriptedBackend::new([
            one_step_plan(),
            verdict_json(true, 0.9, &[]),
            verdict_json(true, 0.9, &[]),
            "NO_UPDATE".to_string(),
        ]);
        let worker = ScriptedWorker::new(WorkerKey::Web)
            .respond("plans without pricing")
            .respond("plans with pricing");
        let amendments = Arc::new(AmendmentBus::new());
        let dir = TempDir::new().unwrap();
        let ctx = trace_ctx(&dir, "run-v").await;

        // the first verification sees the amendment arrive
        let outcome = amending_runner(&backend, 2, "run-v", worker.clone(), amendments.clone())
            .run(&ctx, "Compare hosting plans")
            .await;

        assert!(outcome.success);
        assert!(outcome.answer.starts_with("plans with pricing"));
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].attempts, 1);

        let prompts = worker.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("1. also include pricing"));
        assert!(!amendments.has_pending("run-v"));
        assert_eq!(backend.call_count(), 4);

        let replay = replay(&ctx).await;
        assert_eq!(replay.amendments_incorporated, 1);
        assert!(replay.forced_advances.is_empty());
    }

    #[tokio::test]
    async fn test_amendment_after_last_step_reopens_it() {
        let backend = ScriptedBackend::new([
            one_step_plan(),
            verdict_json(true, 0.9, &[]),
            "NO_UPDATE".to_string(),
            verdict_json(true, 0.95, &[]),
        ]);
        let worker = ScriptedWorker::new(WorkerKey::Web)
            .respond("plans without pricing")
            .respond("plans with pricing");
        let amendments = Arc::new(AmendmentBus::new());
        let dir = TempDir::new().unwrap();
        let ctx = trace_ctx(&dir, "run-l").await;

        // lands while the finished plan is being repaired
        let outcome = amending_runner(&backend, 3, "run-l", worker.clone(), amendments.clone())
            .run(&ctx, "Compare hosting plans")
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.results.len(), 1);
        assert!(outcome.answer.starts_with("plans with pricing"));
        assert!(outcome.answer.ends_with("(confidence=0.95)."));
        assert_eq!(outcome.plan.as_ref().unwrap().steps[0].status, StepStatus::Completed);
        assert!(worker.prompts()[1].contains("1. also include pricing"));
        assert_eq!(backend.call_count(), 4);

        // the finished run takes no more notes
        assert!(!amendments.add("run-l", "one more thing"));

        let replay = replay(&ctx).await;
        assert_eq!(replay.amendments_incorporated, 1);
        assert_eq!(replay.step_outcomes(), vec![("1".to_string(), StepStatus::Completed)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_amendment_retry_does_not_use_up_retries() {
        let backend = ScriptedBackend::new([
            one_step_plan(),
            verdict_json(true, 0.8, &[]),
            "NO_UPDATE".to_string(),
        ]);
        let worker = ScriptedWorker::new(WorkerKey::Web)
            .delay(Duration::from_secs(5), "plans without pricing")
            .respond("plans with pricing");
        let amendments = Arc::new(AmendmentBus::new());
        let runner = runner(
            &backend,
            vec![worker.clone()],
            amendments.clone(),
            &EngineConfig::default().with_max_retries(0),
        );
        let ctx = RunContext::new("run-m", "/tmp", "/tmp/run-m");

        let amend = async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            assert!(amendments.add("run-m", "also include pricing"));
        };
        let (outcome, ()) = tokio::join!(runner.run(&ctx, "Compare hosting plans"), amend);

        let result = &outcome.results[0];
        assert_eq!(result.attempts, 1);
        assert!(result.output.starts_with("plans with pricing"));
        assert!(!result.output.contains("(max retries)"));
        assert_eq!(worker.prompts().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_worker_reply_is_verified_and_retried() {
        let backend = ScriptedBackend::new([
            plan_response(json!([{
                "id": "1", "agent": "file", "task": "Write notes.txt",
                "definition_of_done": ["notes.txt exists"]
            }])),
            verdict_json(false, 0.1, &["create notes.txt"]),
            verdict_json(true, 0.9, &[]),
            "NO_UPDATE".to_string(),
        ]);
        let worker = ScriptedWorker::new(WorkerKey::File)
            .respond_failure("could not open notes.txt")
            .respond("notes.txt written");

        let outcome = runner(&backend, vec![worker.clone()], Arc::new(AmendmentBus::new()), &EngineConfig::default())
            .run(&RunContext::new("run-w", "/tmp", "/tmp/run-w"), "write notes")
            .await;

        let result = &outcome.results[0];
        assert!(result.success);
        assert_eq!(result.attempts, 2);
        assert!(result.output.starts_with("notes.txt written"));
        // the failed reply still went to the verifier
        assert_eq!(backend.call_count(), 4);
        assert!(worker.prompts()[1].contains("1. create notes.txt"));
    }

    #[tokio::test]
    async fn test_disabled_worker_fails_step_and_plan_is_repaired() {
        let backend = ScriptedBackend::new([
            plan_response(json!([{"id": "1", "agent": "web", "task": "Search"}])),
            plan_response(json!([
                {"id": "1", "agent": "web", "task": "Search"},
                {"id": "2", "agent": "casual", "task": "Answer from memory"}
            ])),
            "NO_UPDATE".to_string(),
        ]);
        let web = ScriptedWorker::new(WorkerKey::Web).respond("never used");
        let casual = ScriptedWorker::new(WorkerKey::Casual).respond("from memory");
        let dir = TempDir::new().unwrap();
        let ctx = trace_ctx(&dir, "run-e")
            .await
            .with_worker_policy(WorkerPolicy::disabling(["web"]));

        let outcome = runner(&backend, vec![web.clone(), casual], Arc::new(AmendmentBus::new()), &EngineConfig::default())
            .run(&ctx, "question")
            .await;

        assert!(web.prompts().is_empty());
        assert_eq!(outcome.results.len(), 2);
        assert!(!outcome.results[0].success);
        assert!(outcome.results[1].output.starts_with("from memory"));
        let plan = outcome.plan.unwrap();
        assert_eq!(plan.steps[0].status, StepStatus::Failed);
        assert_eq!(plan.steps[1].status, StepStatus::Completed);

        // the repair prompt reports the failure
        assert!(backend.calls()[1][1].content.contains("ended in failure"));
        let replay = replay(&ctx).await;
        assert_eq!(replay.plans.len(), 2);
        assert_eq!(replay.disabled_workers, vec!["web".to_string()]);
    }

    #[tokio::test]
    async fn test_no_progress_forces_advance() {
        let backend = ScriptedBackend::new([
            plan_response(json!([{"id": "1", "agent": "coder", "task": "Compute", "dod": ["prints 42"]}])),
            verdict_json(false, 0.2, &["print 42"]),
            verdict_json(false, 0.2, &["print 42"]),
            "NO_UPDATE".to_string(),
        ]);
        let worker = ScriptedWorker::new(WorkerKey::Coder).respond("41").respond("41");

        let outcome = runner(&backend, vec![worker], Arc::new(AmendmentBus::new()), &EngineConfig::default())
            .run(&RunContext::new("run-f", "/tmp", "/tmp/run-f"), "compute")
            .await;

        let result = &outcome.results[0];
        assert!(result.success);
        assert_eq!(result.attempts, 2);
        assert!(result.output.ends_with("[system] Verifier: incomplete, but advancing (no progress)."));
    }

    #[tokio::test]
    async fn test_attempts_never_exceed_retry_ceiling() {
        let backend = ScriptedBackend::new([
            plan_response(json!([{"id": "1", "agent": "coder", "task": "Compute", "dod": ["a", "b", "c"]}])),
            verdict_json(false, 0.1, &["a", "b", "c"]),
            verdict_json(false, 0.2, &["b", "c"]),
            "NO_UPDATE".to_string(),
        ]);
        let worker = ScriptedWorker::new(WorkerKey::Coder).respond("x").respond("y");
        let config = EngineConfig::default().with_max_retries(1);

        let outcome = runner(&backend, vec![worker], Arc::new(AmendmentBus::new()), &config)
            .run(&RunContext::new("run-g", "/tmp", "/tmp/run-g"), "compute")
            .await;

        let result = &outcome.results[0];
        assert_eq!(result.attempts, 2);
        assert!(result.output.ends_with("(max retries)."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_running_step() {
        let backend = ScriptedBackend::new([plan_response(json!([
            {"id": "1", "agent": "casual", "task": "Slow"},
            {"id": "2", "agent": "casual", "task": "Never"}
        ]))]);
        let worker = ScriptedWorker::new(WorkerKey::Casual).delay(Duration::from_secs(5), "partial");
        let runner = runner(&backend, vec![worker.clone()], Arc::new(AmendmentBus::new()), &EngineConfig::default());
        let ctx = RunContext::new("run-h", "/tmp", "/tmp/run-h");

        let started = Instant::now();
        let stop = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            ctx.stop_flag().stop();
        };
        let (outcome, ()) = tokio::join!(runner.run(&ctx, "slow things"), stop);

        assert!(outcome.stopped);
        assert!(!outcome.success);
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(worker.prompts().len(), 1);
        assert!(worker.stop_requested());
        // stop plus the cancel grace period
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        let plan = outcome.plan.unwrap();
        assert_ne!(plan.steps[0].status, StepStatus::Running);
        assert_eq!(plan.steps[1].status, StepStatus::Pending);
    }

    #[test]
    fn test_inputs_follow_needs_then_recent_outputs() {
        let results: Vec<StepResult> = ["1", "2", "3"]
            .iter()
            .map(|id| StepResult {
                step_id: id.to_string(),
                worker: WorkerKey::Web,
                output: format!("out {id}"),
                success: true,
                attempts: 1,
            })
            .collect();

        let wired = Step::new("4", WorkerKey::File, "t").with_needs(["1"]);
        assert_eq!(collect_inputs(&wired, &results), vec![("1".to_string(), "out 1".to_string())]);

        let unwired_file = Step::new("4", WorkerKey::File, "t");
        let ids: Vec<String> = collect_inputs(&unwired_file, &results).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["2", "3"]);

        let unwired_web = Step::new("4", WorkerKey::Web, "t");
        assert!(collect_inputs(&unwired_web, &results).is_empty());
    }
}
