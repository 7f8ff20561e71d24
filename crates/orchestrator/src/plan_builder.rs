use std::sync::Arc;

use serde_json::json;
use taskflow_core::{Plan, Step};
use tracing::{debug, info, warn};

use crate::backend::{ChatMessage, ReasoningBackend};
use crate::error::{OrchestratorError, PlanParseFailure, Result};
use crate::plan_parser::parse_plan_response;
use crate::prompts::Prompts;
use crate::run_context::RunContext;
use crate::trace;
use crate::workers::WorkerRegistry;

/// Builds the initial plan for a goal and repairs it after each step.
pub struct PlanBuilder {
    backend: Arc<dyn ReasoningBackend>,
    registry: Arc<WorkerRegistry>,
    max_attempts: u32,
}

impl PlanBuilder {
    pub fn new(backend: Arc<dyn ReasoningBackend>, registry: Arc<WorkerRegistry>, max_attempts: u32) -> Self {
        Self {
            backend,
            registry,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Ask the planner for a plan, re-prompting with corrective instructions
    /// until a response parses or the attempts run out.
    pub async fn build_plan(&self, ctx: &RunContext, goal: &str) -> Result<Plan> {
        let request = Prompts::planning_request(goal, &ctx.tool_policy, &ctx.worker_policy);
        let mut messages = vec![
            ChatMessage::system(Prompts::planner_system()),
            ChatMessage::user(request),
        ];

        match self.converse(ctx, goal, &mut messages).await? {
            Some(plan) => {
                info!(run_id = %ctx.run_id, steps = plan.len(), "Plan created");
                ctx.trace(trace::PLAN_CREATED, json!({"goal": goal, "steps": plan.steps}));
                Ok(plan)
            }
            None => Err(OrchestratorError::PlanUnavailable {
                attempts: self.max_attempts,
                last: PlanParseFailure::MissingPlan,
            }),
        }
    }

    /// Ask the planner to rewrite the steps after `step_id` given that step's
    /// output. Any failure, or a `NO_UPDATE` answer, keeps `plan` unchanged.
    pub async fn repair_plan(
        &self,
        ctx: &RunContext,
        plan: &Plan,
        step_id: &str,
        last_work: &str,
        success: bool,
    ) -> Plan {
        let Some(idx) = plan.position(step_id) else {
            warn!(run_id = %ctx.run_id, step_id, "Step not in plan, skipping repair");
            return plan.clone();
        };

        let next_task = plan.steps.get(idx + 1).map(|s| s.task.as_str());
        let request = Prompts::repair_request(&plan.goal, step_id, last_work, success, next_task);
        let mut messages = vec![
            ChatMessage::system(Prompts::planner_system()),
            ChatMessage::user(request),
        ];

        match self.converse(ctx, &plan.goal, &mut messages).await {
            Ok(Some(candidate)) => {
                let repaired = merge_repair(plan, idx, candidate.steps);
                if repaired == *plan {
                    debug!(run_id = %ctx.run_id, step_id, "Repair produced an identical plan");
                    return repaired;
                }
                info!(
                    run_id = %ctx.run_id,
                    step_id,
                    before = plan.len(),
                    after = repaired.len(),
                    "Plan updated"
                );
                ctx.trace(
                    trace::PLAN_UPDATED,
                    json!({"after_step": step_id, "steps": repaired.steps}),
                );
                repaired
            }
            Ok(None) => {
                debug!(run_id = %ctx.run_id, step_id, "No plan update required");
                plan.clone()
            }
            Err(e) => {
                warn!(run_id = %ctx.run_id, step_id, error = %e, "Plan repair failed, keeping current plan");
                plan.clone()
            }
        }
    }

    /// Shared request/parse loop. `Ok(None)` means the planner answered
    /// `NO_UPDATE`.
    async fn converse(&self, ctx: &RunContext, goal: &str, messages: &mut Vec<ChatMessage>) -> Result<Option<Plan>> {
        let mut last_failure = PlanParseFailure::NoJsonFound;

        for attempt in 1..=self.max_attempts {
            let answer = self.backend.respond(messages).await?;

            match parse_plan_response(&answer, goal, &self.registry) {
                Ok(parsed) => return Ok(parsed),
                Err(failure) => {
                    warn!(
                        run_id = %ctx.run_id,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %failure,
                        "Planner response rejected"
                    );
                    let snippet = match &failure {
                        PlanParseFailure::MalformedJson { snippet, .. } => snippet.clone(),
                        _ => String::new(),
                    };
                    ctx.trace(
                        trace::PLAN_PARSE_ERROR,
                        json!({"attempt": attempt, "error": failure.to_string(), "snippet": snippet}),
                    );
                    messages.push(ChatMessage::assistant(answer));
                    messages.push(ChatMessage::user(failure.corrective_prompt()));
                    last_failure = failure;
                }
            }
        }

        Err(OrchestratorError::PlanUnavailable {
            attempts: self.max_attempts,
            last: last_failure,
        })
    }
}

/// Keep every step up to and including `idx`, then take the candidate's
/// steps that follow the same step id. The result is at most one step
/// longer than `plan`.
fn merge_repair(plan: &Plan, idx: usize, candidate: Vec<Step>) -> Plan {
    let step_id = &plan.steps[idx].id;
    let tail_start = candidate
        .iter()
        .position(|s| &s.id == step_id)
        .map(|p| p + 1)
        .unwrap_or(idx + 1);

    let mut steps: Vec<Step> = plan.steps[..=idx].to_vec();
    steps.extend(candidate.into_iter().skip(tail_start));
    steps.truncate(plan.len() + 1);

    Plan::new(plan.goal.clone(), steps)
}
