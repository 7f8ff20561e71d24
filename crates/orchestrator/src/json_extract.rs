//! Locating JSON payloads inside free-form backend text.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

fn fence_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)[ \t]*\r?\n?(.*?)```").expect("Invalid fence regex pattern"))
}

/// Bodies of ```` ```json ```` fenced blocks, in order of appearance.
pub fn fenced_json_blocks(text: &str) -> Vec<&str> {
    fence_regex()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .collect()
}

/// Top-level brace-delimited regions of `text`.
///
/// Braces inside JSON strings are ignored. Quotes outside any region are
/// treated as prose, so apostrophes before the payload do not confuse the
/// scan. An unbalanced trailing region is dropped.
pub fn balanced_objects(text: &str) -> Vec<&str> {
    let mut regions = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if depth == 0 {
            if c == '{' {
                depth = 1;
                start = i;
                in_string = false;
                escaped = false;
            }
            continue;
        }

        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    regions.push(&text[start..=i]);
                }
            }
            _ => {}
        }
    }

    regions
}

/// First JSON object in `text`: the whole text when it parses strictly,
/// otherwise the first balanced region that does.
pub fn first_object(text: &str) -> Option<Map<String, Value>> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text.trim()) {
        return Some(map);
    }
    balanced_objects(text)
        .into_iter()
        .find_map(|candidate| match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        })
}
