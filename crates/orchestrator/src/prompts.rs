use taskflow_core::{Step, ToolPolicy, Verdict, WorkerPolicy};

const PLANNER_SYSTEM: &str = r#"You are a project planner. You split a user goal into a short sequence of steps and assign each step to exactly one worker.

## Workers
- coder: writes and runs code to compute, transform or analyse data.
- file: reads, writes and organises files in the run's output directory; runs shell commands.
- web: searches the web and browses pages to gather information; records notes and source URLs.
- casual: answers conversationally, summarises or rewrites text it is given.

## Rules
- Steps run in order. A step can only use the output of earlier steps it lists in `need`.
- Keep the plan as short as the goal allows.
- Every step states a concrete deliverable and checkable completion criteria.
- Never ask the user for clarification; make reasonable assumptions instead.

## Output
Explain your reasoning in one or two sentences, then write the plan:

```json
{
  "plan": [
    {
      "id": "1",
      "agent": "web",
      "task": "Find the current list prices of the three best selling e-bikes",
      "need": [],
      "deliverable": "Notes listing each model with its price and source URL",
      "definition_of_done": ["Three models are listed", "Each model has a price and a URL"]
    }
  ]
}
```"#;

const PLAN_SCHEMA: &str = "\n\nPlan JSON requirements:\n\
- Output ONLY one ```json block with {\"plan\": [...]}.\n\
- Each item must include: id, agent, task, deliverable, definition_of_done (array).\n\
- definition_of_done must be concrete checks (no vague wording).\n\
- JSON must be STRICTLY valid: strings must not contain raw newlines; use \\n if needed.\n";

const VERIFIER_SYSTEM: &str = "You are a STRICT verifier checking whether one plan step is complete.\n\
Mark a step done only when EVERY Definition-of-Done check is explicitly satisfied by the output.\n\
If evidence is missing or you are unsure, set is_done=false.\n\n\
Reply with a single JSON object with these keys:\n\
- is_done: boolean\n\
- confidence: number between 0.0 and 1.0\n\
- missing: array of specific, actionable fix instructions\n\
- recommended_action: \"advance\" or \"retry\"\n\
- rationale: short explanation of the decision\n\n\
Each item in `missing` must tell the worker exactly what to add or change.\n\
Vague: \"Report is incomplete\". Actionable: \"Add a section titled 'Pricing' listing each plan and its monthly cost\".\n\n\
When a file was written, judge the content shown in the output, not the fact that a file exists.\n\
Do not recommend retry for cosmetic polish, only for missing requirements.\n";

const SUMMARY_SYSTEM: &str = "You summarise the execution trace of an automated multi-step run.\n\
Write 5 to 12 short bullet points covering: what was asked, the plan, what each step produced, \
where steps were retried or forced to advance, and the final answer. Mention file paths and URLs when they appear. \
Do not invent events that are not in the trace.";

pub struct Prompts;

impl Prompts {
    pub fn planner_system() -> &'static str {
        PLANNER_SYSTEM
    }

    pub fn plan_schema() -> &'static str {
        PLAN_SCHEMA
    }

    /// Goal with the run's policies and the schema requirements appended.
    pub fn planning_request(goal: &str, tools: &ToolPolicy, workers: &WorkerPolicy) -> String {
        let mut request = goal.to_string();
        if tools.enabled {
            request.push_str(&tools.prompt_block());
        }
        if workers.enabled {
            request.push_str(&workers.prompt_block());
        }
        request.push_str(PLAN_SCHEMA);
        request
    }

    pub fn repair_request(
        goal: &str,
        step_id: &str,
        last_work: &str,
        success: bool,
        next_task: Option<&str>,
    ) -> String {
        let outcome = if success { "success" } else { "failure" };
        let next = match next_task {
            Some(task) => format!("Next task is: {}.", task),
            None => "No task follows, this was the last step. If it failed, add a step to recover.".to_string(),
        };

        format!(
            r#"Your goal is: {goal}

You made a plan earlier and workers are executing it.
The worker on step {step_id} produced:
{last_work}

According to the runtime, step {step_id} ended in {outcome}.
{next}

Is the work of step {step_id} leading to success?
- If it is: answer exactly "NO_UPDATE".
- If it is leading to failure: update the plan. When a step failed, add a step that retries or recovers from the failure.

Rewrite the whole plan in a ```json block like before, but only change the steps after step {step_id}.
Do not change past steps. Keep the same number of steps as the current plan, or add at most one.{schema}"#,
            goal = goal,
            step_id = step_id,
            last_work = last_work,
            outcome = outcome,
            next = next,
            schema = PLAN_SCHEMA
        )
    }

    pub fn verifier_system() -> &'static str {
        VERIFIER_SYSTEM
    }

    #[allow(clippy::too_many_arguments)]
    pub fn verifier_request(
        goal: &str,
        step: &Step,
        checks: &[&str],
        sampled_output: &str,
        success: bool,
        attempt: u32,
        elapsed_secs: u64,
        remaining_secs: u64,
    ) -> String {
        format!(
            r#"GOAL:
{goal}

STEP {id} TASK:
{task}

DELIVERABLE:
{deliverable}

DEFINITION_OF_DONE (ALL must be satisfied):
- {checks}

STEP OUTPUT (what the worker produced):
{output}

EXECUTION CONTEXT:
- success_flag: {success}
- attempt: {attempt}
- elapsed_seconds: {elapsed}
- remaining_seconds_before_forced_advance: {remaining}

Verify completion from the output above. If items are missing, list specific, actionable fixes."#,
            goal = goal,
            id = step.id,
            task = step.task,
            deliverable = step.deliverable,
            checks = checks.join("\n- "),
            output = sampled_output,
            success = success,
            attempt = attempt,
            elapsed = elapsed_secs,
            remaining = remaining_secs
        )
    }

    /// Prompt handed to a worker: inputs from earlier steps, the task, and the
    /// step's completion criteria.
    pub fn worker_prompt(task: &str, inputs: &[(String, String)], step: &Step) -> String {
        let infos = if inputs.is_empty() {
            "No inputs from earlier steps.".to_string()
        } else {
            inputs
                .iter()
                .map(|(id, output)| format!("- Output of step {}:\n{}\n", id, output))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let mut prompt = format!(
            r#"You are given the work of earlier steps:
{infos}

Your task is:
{task}

Critical rules:
- Do NOT ask the user questions or request clarification.
- If required information seems missing, recover on your own with tools and best-effort assumptions.
- If the task refers to an input produced by another step, treat the content above as the source of truth."#,
            infos = infos,
            task = task
        );

        let checks = step.done_checks();
        let deliverable = step.deliverable.trim();
        if !deliverable.is_empty() || !checks.is_empty() {
            prompt.push_str("\n\nDefinition of Done:\n");
            if !deliverable.is_empty() {
                prompt.push_str(&format!("- Deliverable: {}\n", deliverable));
            }
            for check in checks {
                prompt.push_str(&format!("- {}\n", check));
            }
            prompt.push_str("\nIf satisfied, stop and proceed.\n");
        }
        prompt
    }

    /// Feedback appended to a step's task before the next attempt.
    pub fn retry_note(verdict: &Verdict, attempt: u32, max_retries: u32, previous_output: &str) -> String {
        let banner = "=".repeat(60);
        let rule = "-".repeat(40);

        let mut note = format!(
            "\n\n{banner}\nVERIFIER FEEDBACK - ATTEMPT {attempt}/{max_retries} INCOMPLETE\n{banner}\n\n"
        );
        let rationale = verdict.rationale.trim();
        if !rationale.is_empty() {
            note.push_str(&format!("REASON: {}\n\n", rationale));
        }
        note.push_str("ITEMS TO FIX (address each one):\n");
        for (idx, item) in verdict.missing.iter().take(8).enumerate() {
            note.push_str(&format!("  {}. {}\n", idx + 1, item));
        }
        note.push('\n');

        let previous = tail_chars(previous_output.trim(), 2000);
        if !previous.is_empty() {
            note.push_str("YOUR PREVIOUS OUTPUT (build on this, don't start over):\n");
            note.push_str(&format!("{rule}\n{previous}\n{rule}\n\n"));
        }

        note.push_str("INSTRUCTIONS:\n");
        note.push_str("- Fix EACH numbered item above\n");
        note.push_str("- When writing a file, write the COMPLETE file including previous content and fixes\n");
        note.push_str("- Do not browse again unless you need NEW information\n");
        note.push_str(&banner);
        note.push('\n');
        note
    }

    pub fn summary_system() -> &'static str {
        SUMMARY_SYSTEM
    }

    pub fn summary_request(query: &str, digest: &str) -> String {
        format!(
            "USER QUERY:\n{}\n\nTRACE DIGEST (one event per line, most relevant events):\n{}\n\nWrite the bullet summary now.",
            query, digest
        )
    }
}

/// Last `n` characters of `text`.
pub(crate) fn tail_chars(text: &str, n: usize) -> &str {
    let count = text.chars().count();
    if count <= n {
        return text;
    }
    match text.char_indices().nth(count - n) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}
