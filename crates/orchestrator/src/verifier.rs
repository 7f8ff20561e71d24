//! Judging a step attempt against its definition of done.

use std::sync::Arc;

use serde_json::{Map, Value};
use taskflow_core::{RecommendedAction, Step, Verdict};
use tracing::{debug, warn};

use crate::backend::{ChatMessage, ReasoningBackend};
use crate::json_extract::first_object;
use crate::prompts::Prompts;

/// Output longer than this is sampled before it reaches the backend.
const MAX_SAMPLE_CHARS: usize = 14_000;

/// Everything the verifier looks at for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct VerifyRequest<'a> {
    pub goal: &'a str,
    pub step: &'a Step,
    pub output: &'a str,
    pub success: bool,
    pub attempt: u32,
    pub elapsed_secs: u64,
    pub remaining_secs: u64,
}

pub struct Verifier {
    backend: Arc<dyn ReasoningBackend>,
    max_retries: u32,
    min_remaining_secs: u64,
}

impl Verifier {
    pub fn new(backend: Arc<dyn ReasoningBackend>, max_retries: u32, min_remaining_secs: u64) -> Self {
        Self {
            backend,
            max_retries,
            min_remaining_secs,
        }
    }

    /// Never fails: backend errors and unparseable answers yield a not-done
    /// verdict.
    pub async fn verify(&self, req: VerifyRequest<'_>) -> Verdict {
        let checks = req.step.done_checks();
        if checks.is_empty() {
            return self.without_criteria(&req);
        }

        let sampled = sample_output(req.output.trim(), MAX_SAMPLE_CHARS);
        let user = Prompts::verifier_request(
            req.goal,
            req.step,
            &checks,
            &sampled,
            req.success,
            req.attempt,
            req.elapsed_secs,
            req.remaining_secs,
        );
        let messages = [ChatMessage::system(Prompts::verifier_system()), ChatMessage::user(user)];

        let raw = match self.backend.respond(&messages).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(step_id = %req.step.id, error = %e, "Verifier backend call failed");
                String::new()
            }
        };

        let verdict = match first_object(&raw) {
            Some(map) => self.from_json(&map, &req),
            None => {
                debug!(step_id = %req.step.id, "Verifier answer is not JSON");
                Verdict::not_done(
                    vec!["Verifier returned invalid JSON".to_string()],
                    self.fallback_action(&req),
                    "Verifier output could not be parsed.",
                )
            }
        };
        self.enforce_floor(verdict, req.remaining_secs)
    }

    fn without_criteria(&self, req: &VerifyRequest<'_>) -> Verdict {
        let rationale = "No DoD available; used conservative fallback.";
        if req.success && !req.output.trim().is_empty() {
            Verdict::done(0.5, rationale)
        } else {
            let verdict = Verdict::not_done(
                vec!["No definition_of_done provided in plan".to_string()],
                self.fallback_action(req),
                rationale,
            );
            self.enforce_floor(verdict, req.remaining_secs)
        }
    }

    fn from_json(&self, map: &Map<String, Value>, req: &VerifyRequest<'_>) -> Verdict {
        // only an explicit boolean counts as done
        let is_done = map.get("is_done").and_then(Value::as_bool).unwrap_or(false);
        let confidence = map.get("confidence").map(as_float).unwrap_or(0.0);
        let missing = map.get("missing").map(missing_items).unwrap_or_default();
        let rationale = map
            .get("rationale")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        let recommended_action = map
            .get("recommended_action")
            .and_then(Value::as_str)
            .and_then(RecommendedAction::parse)
            .unwrap_or_else(|| {
                if is_done {
                    RecommendedAction::Advance
                } else {
                    self.fallback_action(req)
                }
            });

        Verdict {
            is_done,
            confidence: 0.0,
            missing,
            recommended_action,
            rationale,
        }
        .with_confidence(confidence)
    }

    fn fallback_action(&self, req: &VerifyRequest<'_>) -> RecommendedAction {
        if req.remaining_secs > self.min_remaining_secs && req.attempt <= self.max_retries {
            RecommendedAction::Retry
        } else {
            RecommendedAction::Advance
        }
    }

    fn enforce_floor(&self, mut verdict: Verdict, remaining_secs: u64) -> Verdict {
        if remaining_secs <= self.min_remaining_secs {
            verdict.recommended_action = RecommendedAction::Advance;
        }
        verdict
    }
}

fn as_float(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn missing_items(value: &Value) -> Vec<String> {
    let items = match value {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::String(s) => s.trim().to_string(),
            other => other.to_string(),
        })
        .filter(|s| !s.is_empty())
        .collect()
}

/// Bounded sample of a long output: its beginning, a middle section and its
/// end, each a quarter of `max_chars`.
///
/// The middle starts at the middle markdown header when the text has more
/// than two `##`/`###` headers, otherwise at the midpoint.
pub fn sample_output(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let chunk = max_chars / 4;

    let head = slice_chars(text, 0, chunk);

    let mut header_offsets = Vec::new();
    let mut offset = 0usize;
    for line in text.split('\n') {
        if line.starts_with("## ") || line.starts_with("### ") {
            header_offsets.push(offset);
        }
        offset += line.chars().count() + 1;
    }

    let middle = if header_offsets.len() > 2 {
        let start = header_offsets[header_offsets.len() / 2];
        format!("\n... [middle sections sampled] ...\n{}", slice_chars(text, start, chunk))
    } else {
        format!("\n... [middle sampled] ...\n{}", slice_chars(text, total / 2, chunk))
    };

    let tail = format!("\n... [end section] ...\n{}", slice_chars(text, total - chunk, chunk));

    format!("{}{}{}", head, middle, tail)
}

/// `len` characters of `text` starting at character `start`.
fn slice_chars(text: &str, start: usize, len: usize) -> &str {
    if len == 0 {
        return "";
    }
    let mut indices = text.char_indices().map(|(i, _)| i).chain(std::iter::once(text.len()));
    let Some(from) = indices.nth(start) else {
        return "";
    };
    let to = indices.nth(len - 1).unwrap_or(text.len());
    &text[from..to]
}
