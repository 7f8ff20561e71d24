//! User notes injected into an active run.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use taskflow_core::Amendment;

#[derive(Debug, Default)]
struct BusState {
    pending: HashMap<String, Vec<Amendment>>,
    closed: HashSet<String>,
}

/// Pending amendments keyed by run id.
///
/// Each amendment is handed out by exactly one [`take`](Self::take). Once a
/// run is [closed](Self::close_if_drained) it accepts no further notes.
#[derive(Debug, Default)]
pub struct AmendmentBus {
    state: Mutex<BusState>,
}

impl AmendmentBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a note for `run_id`. Returns false when the text is blank or the
    /// run no longer accepts amendments.
    pub fn add(&self, run_id: &str, text: &str) -> bool {
        let amendment = Amendment::new(text);
        if amendment.text.is_empty() {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        if state.closed.contains(run_id) {
            return false;
        }
        state.pending.entry(run_id.to_string()).or_default().push(amendment);
        true
    }

    /// Snapshot of pending notes without consuming them.
    pub fn pending(&self, run_id: &str) -> Vec<Amendment> {
        self.state
            .lock()
            .unwrap()
            .pending
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_pending(&self, run_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .pending
            .get(run_id)
            .is_some_and(|a| !a.is_empty())
    }

    /// Remove and return everything pending for `run_id`.
    pub fn take(&self, run_id: &str) -> Vec<Amendment> {
        self.state.lock().unwrap().pending.remove(run_id).unwrap_or_default()
    }

    /// Stop accepting notes for `run_id`, but only if none are waiting.
    /// Returns false, leaving the run open, when something is still pending.
    pub fn close_if_drained(&self, run_id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.pending.get(run_id).is_some_and(|a| !a.is_empty()) {
            return false;
        }
        state.pending.remove(run_id);
        state.closed.insert(run_id.to_string());
        true
    }

    /// Forget everything about `run_id`, pending notes included.
    pub fn clear(&self, run_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.pending.remove(run_id);
        state.closed.remove(run_id);
    }
}

/// Text folded into a step's task when amendments are incorporated.
pub fn format_block(original_request: &str, amendments: &[Amendment]) -> String {
    let original: String = original_request.chars().take(500).collect();
    let mut block = format!(
        "\n\n[USER AMENDMENTS - apply to this step]\nOriginal request: {}\nAmendments:\n",
        original
    );
    for (i, amendment) in amendments.iter().enumerate() {
        block.push_str(&format!("{}. {}\n", i + 1, amendment.text));
    }
    block
}
