//! Post-run trace summary.
//!
//! Reads a finished run's trace back, keeps the events most relevant to the
//! original query and asks the backend for a bulleted summary, which is
//! appended to the same trace as a `run_summary` event.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use events::{into_fields, ActivityBus};
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::backend::{ChatMessage, ReasoningBackend};
use crate::config::SummaryConfig;
use crate::error::Result;
use crate::prompts::Prompts;
use crate::trace::{self, read_events, truncate_text, TraceSink};

/// Events that always make it into the digest, ahead of relevance hits.
const ALWAYS_INCLUDE: &[&str] = &[
    trace::USER_QUERY,
    trace::FINAL_ANSWER,
    trace::PLAN_STEP,
    trace::PLAN_CREATED,
    trace::PLAN_UPDATED,
    trace::STEP_VERDICT,
];
const ALWAYS_BONUS: usize = 5;
const MAX_QUERY_TERMS: usize = 25;
const MAX_EVENT_CHARS: usize = 900;

fn term_regex() -> &'static Regex {
    static TERMS: OnceLock<Regex> = OnceLock::new();
    TERMS.get_or_init(|| Regex::new(r"[a-z0-9_\-]{3,}").expect("Invalid query term regex pattern"))
}

pub struct TraceSummarizer {
    backend: Arc<dyn ReasoningBackend>,
    config: SummaryConfig,
}

impl TraceSummarizer {
    pub fn new(backend: Arc<dyn ReasoningBackend>, config: SummaryConfig) -> Self {
        Self { backend, config }
    }

    /// Summarize the run recorded in `trace_file`. Returns `Ok(None)` when
    /// there was nothing to summarize.
    pub async fn summarize(
        &self,
        run_id: &str,
        query: &str,
        trace_file: &Path,
        activity: &ActivityBus,
    ) -> Result<Option<String>> {
        if !self.config.enabled || !trace_file.exists() {
            return Ok(None);
        }

        let events = read_events(trace_file, self.config.event_budget()).await?;
        let digest = build_digest(&events, query, self.config.line_budget());
        if digest.is_empty() {
            debug!(run_id, "Trace has nothing to summarize");
            return Ok(None);
        }

        let messages = [
            ChatMessage::system(Prompts::summary_system()),
            ChatMessage::user(Prompts::summary_request(query, &digest.join("\n"))),
        ];
        let summary = self.backend.respond(&messages).await?.trim().to_string();
        if summary.is_empty() {
            return Ok(None);
        }

        // the summary is written untruncated
        let sink = TraceSink::new(trace_file, None)?;
        sink.write_event(
            trace::RUN_SUMMARY,
            Some(run_id),
            &into_fields(json!({"query": query, "summary": summary})),
        )?;
        activity.emit(
            "print",
            Some(run_id),
            json!({"text": format!("Run summary (auto):\n{}", summary)}),
        );

        info!(run_id, lines = digest.len(), "Run summary appended to trace");
        Ok(Some(summary))
    }
}

/// Relevance-biased digest of `events`, one line per kept event, in trace
/// order.
pub fn build_digest(events: &[Value], question: &str, max_lines: usize) -> Vec<String> {
    let question = question.to_lowercase();
    let terms: Vec<&str> = term_regex()
        .find_iter(&question)
        .map(|m| m.as_str())
        .take(MAX_QUERY_TERMS)
        .collect();

    let mut picked: Vec<(usize, &Value, usize)> = events
        .iter()
        .enumerate()
        .filter_map(|(idx, ev)| {
            let text = ev.to_string().to_lowercase();
            let hits = terms.iter().filter(|t| text.contains(*t)).count();
            let name = ev.get("event").and_then(Value::as_str).unwrap_or_default();
            if ALWAYS_INCLUDE.contains(&name) {
                Some((idx, ev, ALWAYS_BONUS + hits))
            } else if hits > 0 {
                Some((idx, ev, hits))
            } else {
                None
            }
        })
        .collect();

    picked.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));
    picked.truncate(max_lines);
    picked.sort_by_key(|(idx, _, _)| *idx);

    picked
        .into_iter()
        .map(|(idx, ev, _)| {
            let ts = ev.get("timestamp").and_then(Value::as_str).unwrap_or_default();
            let name = ev.get("event").and_then(Value::as_str).unwrap_or_default();
            format!("[{}] {} {} {}", idx, ts, name, compact(ev))
        })
        .collect()
}

/// The event's own fields as one JSON line, without the envelope.
fn compact(ev: &Value) -> String {
    let fields: serde_json::Map<String, Value> = ev
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter(|(k, _)| !matches!(k.as_str(), "timestamp" | "event" | "run_id"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default();
    truncate_text(&Value::Object(fields).to_string(), MAX_EVENT_CHARS)
}
