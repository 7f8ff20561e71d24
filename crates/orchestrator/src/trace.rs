//! Append-only JSONL trace of one run.
//!
//! Each line is a JSON object with at least `timestamp` and `event`. The file
//! is the durable audit trail of a run: [`RunReplay`] rebuilds plan
//! evolution and step outcomes from it without any other state.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::{Map, Value};
use taskflow_core::{Step, StepStatus, Verdict};
use tracing::{debug, warn};

pub const PLAN_CREATED: &str = "plan_created";
pub const PLAN_UPDATED: &str = "plan_updated";
pub const PLAN_PARSE_ERROR: &str = "planner_plan_parse_error";
pub const PLAN_STEP: &str = "plan_step";
pub const STEP_VERDICT: &str = "plan_step_verdict";
pub const STEP_TIMEOUT: &str = "plan_step_timeout_forced_advance";
pub const STEP_BUDGET_EXCEEDED: &str = "plan_step_time_budget_forced_advance";
pub const STEP_FORCED_ADVANCE: &str = "plan_step_forced_advance";
pub const WORKER_DISABLED: &str = "worker_disabled";
pub const AMENDMENT_INCORPORATED: &str = "amendment_incorporated";
pub const USER_QUERY: &str = "user_query";
pub const FINAL_ANSWER: &str = "final_answer";
pub const RUN_STOPPED: &str = "run_stopped";
pub const JOB_FAILED: &str = "job_failed";
pub const RUN_SUMMARY: &str = "run_summary";

/// Writes trace events to a JSONL file.
#[derive(Debug)]
pub struct TraceSink {
    path: PathBuf,
    max_chars_per_field: Option<usize>,
    write_lock: Mutex<()>,
}

impl TraceSink {
    /// Create a sink, creating the parent directory if needed
    pub fn new(path: impl Into<PathBuf>, max_chars_per_field: Option<usize>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self {
            path,
            max_chars_per_field,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event line.
    pub fn write_event(&self, event: &str, run_id: Option<&str>, fields: &Map<String, Value>) -> std::io::Result<()> {
        let mut payload = Map::new();
        for (key, value) in fields {
            let value = match self.max_chars_per_field {
                Some(limit) => truncate_value(value, limit),
                None => value.clone(),
            };
            payload.insert(key.clone(), value);
        }
        payload.insert("timestamp".to_string(), Value::String(Utc::now().to_rfc3339()));
        payload.insert("event".to_string(), Value::String(event.to_string()));
        if let Some(run_id) = run_id {
            payload.insert("run_id".to_string(), Value::String(run_id.to_string()));
        }

        let mut line = serde_json::to_string(&Value::Object(payload))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push('\n');

        let _guard = self.write_lock.lock().unwrap();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }

    /// Like [`write_event`](Self::write_event) but never fails the caller.
    pub fn record(&self, event: &str, run_id: Option<&str>, fields: &Map<String, Value>) {
        if let Err(e) = self.write_event(event, run_id, fields) {
            warn!(path = %self.path.display(), event, error = %e, "Failed to write trace event");
        }
    }
}

/// Cut a string to `limit` characters, noting how much was dropped.
pub fn truncate_text(text: &str, limit: usize) -> String {
    let total = text.chars().count();
    if total <= limit {
        return text.to_string();
    }
    let kept: String = text.chars().take(limit).collect();
    format!("{}... [truncated {} chars]", kept, total - limit)
}

fn truncate_value(value: &Value, limit: usize) -> Value {
    match value {
        Value::String(s) => Value::String(truncate_text(s, limit)),
        Value::Array(_) | Value::Object(_) => {
            let text = value.to_string();
            if text.chars().count() <= limit {
                value.clone()
            } else {
                Value::String(truncate_text(&text, limit))
            }
        }
        other => other.clone(),
    }
}

/// Read up to `max_events` events from a trace file, skipping blank and
/// unparseable lines.
pub async fn read_events(path: &Path, max_events: usize) -> std::io::Result<Vec<Value>> {
    let content = tokio::fs::read_to_string(path).await?;
    let events: Vec<Value> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(Value::is_object)
        .take(max_events)
        .collect();
    debug!(path = %path.display(), count = events.len(), "Read trace events");
    Ok(events)
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepTransition {
    pub step_idx: usize,
    pub step_id: String,
    pub status: StepStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForcedAdvanceKind {
    Timeout,
    BudgetExceeded,
    Verifier(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForcedAdvance {
    pub step_id: String,
    pub kind: ForcedAdvanceKind,
}

/// What a trace file says happened in a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReplay {
    pub run_id: Option<String>,
    pub query: Option<String>,
    /// Initial plan followed by every repaired version
    pub plans: Vec<Vec<Step>>,
    pub transitions: Vec<StepTransition>,
    pub verdicts: Vec<(String, Verdict)>,
    pub forced_advances: Vec<ForcedAdvance>,
    pub amendments_incorporated: usize,
    pub disabled_workers: Vec<String>,
    pub final_answer: Option<String>,
    pub failure: Option<String>,
    pub stopped: bool,
    pub summary: Option<String>,
}

impl RunReplay {
    pub fn from_events(events: &[Value]) -> Self {
        let mut replay = Self::default();

        for ev in events {
            let Some(name) = ev.get("event").and_then(Value::as_str) else {
                continue;
            };
            if replay.run_id.is_none() {
                replay.run_id = str_field(ev, "run_id");
            }

            match name {
                USER_QUERY => replay.query = str_field(ev, "query"),
                PLAN_CREATED | PLAN_UPDATED => {
                    if let Some(steps) = ev.get("steps").and_then(decode_steps) {
                        replay.plans.push(steps);
                    }
                }
                PLAN_STEP => {
                    let status = ev
                        .get("status")
                        .and_then(Value::as_str)
                        .and_then(StepStatus::parse);
                    let step_idx = ev.get("step_idx").and_then(Value::as_u64);
                    let step_id = ev
                        .get("step")
                        .and_then(|s| s.get("id"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .or_else(|| str_field(ev, "step_id"));
                    if let (Some(status), Some(step_idx), Some(step_id)) = (status, step_idx, step_id) {
                        replay.transitions.push(StepTransition {
                            step_idx: step_idx as usize,
                            step_id,
                            status,
                        });
                    }
                }
                STEP_VERDICT => {
                    let verdict = ev
                        .get("verdict")
                        .cloned()
                        .and_then(|v| serde_json::from_value::<Verdict>(v).ok());
                    if let (Some(step_id), Some(verdict)) = (str_field(ev, "step_id"), verdict) {
                        replay.verdicts.push((step_id, verdict));
                    }
                }
                STEP_TIMEOUT | STEP_BUDGET_EXCEEDED | STEP_FORCED_ADVANCE => {
                    let kind = match name {
                        STEP_TIMEOUT => ForcedAdvanceKind::Timeout,
                        STEP_BUDGET_EXCEEDED => ForcedAdvanceKind::BudgetExceeded,
                        _ => ForcedAdvanceKind::Verifier(str_field(ev, "reason").unwrap_or_default()),
                    };
                    if let Some(step_id) = str_field(ev, "step_id") {
                        replay.forced_advances.push(ForcedAdvance { step_id, kind });
                    }
                }
                AMENDMENT_INCORPORATED => {
                    replay.amendments_incorporated +=
                        ev.get("count").and_then(Value::as_u64).unwrap_or(1) as usize;
                }
                WORKER_DISABLED => {
                    if let Some(worker) = str_field(ev, "worker") {
                        replay.disabled_workers.push(worker);
                    }
                }
                FINAL_ANSWER => replay.final_answer = str_field(ev, "answer"),
                JOB_FAILED => replay.failure = str_field(ev, "error"),
                RUN_STOPPED => replay.stopped = true,
                RUN_SUMMARY => replay.summary = str_field(ev, "summary"),
                _ => {}
            }
        }

        replay
    }

    /// Last recorded status of every step, in order of first appearance.
    pub fn step_outcomes(&self) -> Vec<(String, StepStatus)> {
        let mut outcomes: Vec<(String, StepStatus)> = Vec::new();
        for t in &self.transitions {
            match outcomes.iter_mut().find(|(id, _)| *id == t.step_id) {
                Some(entry) => entry.1 = t.status,
                None => outcomes.push((t.step_id.clone(), t.status)),
            }
        }
        outcomes
    }

    pub fn final_plan(&self) -> Option<&[Step]> {
        self.plans.last().map(Vec::as_slice)
    }
}

fn str_field(ev: &Value, key: &str) -> Option<String> {
    ev.get(key).and_then(Value::as_str).map(str::to_string)
}

fn decode_steps(value: &Value) -> Option<Vec<Step>> {
    serde_json::from_value(value.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskflow_core::WorkerKey;
    use tempfile::TempDir;

    fn fields(value: Value) -> Map<String, Value> {
        events::into_fields(value)
    }

    #[tokio::test]
    async fn test_write_and_read_events() {
        let dir = TempDir::new().unwrap();
        let sink = TraceSink::new(dir.path().join("nested/trace.jsonl"), None).unwrap();

        sink.write_event("user_query", Some("run-1"), &fields(json!({"query": "hello"})))
            .unwrap();
        sink.write_event("final_answer", Some("run-1"), &fields(json!({"answer": "bye"})))
            .unwrap();

        let events = read_events(sink.path(), 100).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event"], "user_query");
        assert_eq!(events[0]["run_id"], "run-1");
        assert!(events[0]["timestamp"].is_string());
        assert_eq!(events[1]["answer"], "bye");
    }

    #[tokio::test]
    async fn test_fields_are_truncated() {
        let dir = TempDir::new().unwrap();
        let sink = TraceSink::new(dir.path().join("trace.jsonl"), Some(5)).unwrap();

        sink.write_event(
            "tool",
            None,
            &fields(json!({"output": "abcdefghij", "count": 123456789, "list": [1, 2, 3, 4, 5]})),
        )
        .unwrap();

        let events = read_events(sink.path(), 10).await.unwrap();
        assert_eq!(events[0]["output"], "abcde... [truncated 5 chars]");
        assert_eq!(events[0]["count"], 123456789);
        assert!(events[0]["list"].as_str().unwrap().contains("[truncated"));
        // reserved keys are never truncated
        assert_eq!(events[0]["event"], "tool");
    }

    #[test]
    fn test_truncate_text_respects_char_boundaries() {
        assert_eq!(truncate_text("héllo wörld", 4), "héll... [truncated 7 chars]");
        assert_eq!(truncate_text("short", 10), "short");
    }

    #[tokio::test]
    async fn test_read_events_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace.jsonl");
        std::fs::write(&path, "{\"event\":\"a\"}\n\nnot json\n[1,2]\n{\"event\":\"b\"}\n").unwrap();

        let events = read_events(&path, 10).await.unwrap();
        assert_eq!(events.len(), 2);

        let events = read_events(&path, 1).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_replay_rebuilds_run() {
        let step = Step::new("1", WorkerKey::Web, "find prices");
        let repaired = vec![step.clone(), Step::new("2", WorkerKey::File, "write csv")];
        let verdict = Verdict::done(0.9, "ok");

        let events = vec![
            json!({"event": "user_query", "run_id": "r1", "query": "prices"}),
            json!({"event": "plan_created", "steps": [step]}),
            json!({"event": "plan_step", "step_idx": 0, "status": "running", "step": {"id": "1"}}),
            json!({"event": "amendment_incorporated", "step_id": "1", "count": 2}),
            json!({"event": "plan_step_verdict", "step_id": "1", "verdict": verdict}),
            json!({"event": "plan_step", "step_idx": 0, "status": "completed", "step": {"id": "1"}}),
            json!({"event": "plan_updated", "steps": repaired}),
            json!({"event": "plan_step", "step_idx": 1, "status": "running", "step": {"id": "2"}}),
            json!({"event": "plan_step_timeout_forced_advance", "step_id": "2"}),
            json!({"event": "plan_step", "step_idx": 1, "status": "completed", "step": {"id": "2"}}),
            json!({"event": "final_answer", "answer": "done"}),
            json!({"event": "run_summary", "summary": "- found prices"}),
        ];

        let replay = RunReplay::from_events(&events);
        assert_eq!(replay.run_id.as_deref(), Some("r1"));
        assert_eq!(replay.query.as_deref(), Some("prices"));
        assert_eq!(replay.plans.len(), 2);
        assert_eq!(replay.final_plan().unwrap().len(), 2);
        assert_eq!(replay.amendments_incorporated, 2);
        assert_eq!(replay.verdicts.len(), 1);
        assert_eq!(
            replay.forced_advances,
            vec![ForcedAdvance {
                step_id: "2".to_string(),
                kind: ForcedAdvanceKind::Timeout
            }]
        );
        assert_eq!(
            replay.step_outcomes(),
            vec![
                ("1".to_string(), StepStatus::Completed),
                ("2".to_string(), StepStatus::Completed)
            ]
        );
        assert_eq!(replay.final_answer.as_deref(), Some("done"));
        assert_eq!(replay.summary.as_deref(), Some("- found prices"));
    }
}
