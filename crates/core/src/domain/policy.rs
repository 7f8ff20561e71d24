//! Per-run feature policies: what gets traced, which tools and which
//! workers a run may use.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::worker::WorkerKey;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub enum RunMode {
    /// Activity bus only, no trace file.
    Standard,
    /// Activity bus plus a JSONL trace file in the run's output directory.
    #[default]
    Trace,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Trace => "trace",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "standard" => Some(Self::Standard),
            // deep_research was folded into trace mode
            "trace" | "deep_research" => Some(Self::Trace),
            _ => None,
        }
    }
}

/// Controls which events are recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct TraceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// `None` allows every event not explicitly disabled.
    #[serde(default)]
    pub enabled_events: Option<BTreeSet<String>>,
    #[serde(default)]
    pub disabled_events: BTreeSet<String>,
    /// Per-field character limit in the trace file. `None` disables truncation.
    #[serde(default)]
    pub max_chars_per_field: Option<usize>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enabled_events: None,
            disabled_events: BTreeSet::new(),
            max_chars_per_field: None,
        }
    }
}

impl TraceConfig {
    pub fn allow_event(&self, event: &str) -> bool {
        if !self.enabled || self.disabled_events.contains(event) {
            return false;
        }
        match &self.enabled_events {
            Some(enabled) => enabled.contains(event),
            None => true,
        }
    }
}

/// Tool allow/deny lists and output preferences handed to workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct ToolPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub enabled_tools: Option<BTreeSet<String>>,
    #[serde(default)]
    pub disabled_tools: BTreeSet<String>,
    #[serde(default = "default_spreadsheet_format")]
    pub spreadsheet_format: String,
    #[serde(default = "default_output_format")]
    pub default_output_format: String,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            enabled_tools: None,
            disabled_tools: BTreeSet::new(),
            spreadsheet_format: default_spreadsheet_format(),
            default_output_format: default_output_format(),
        }
    }
}

impl ToolPolicy {
    /// A disabled policy allows everything.
    pub fn allow_tool(&self, key: &str, tag: Option<&str>) -> bool {
        if !self.enabled {
            return true;
        }
        let key = key.trim();
        let tag = tag.map(str::trim).unwrap_or_default();
        if self.disabled_tools.contains(key) || (!tag.is_empty() && self.disabled_tools.contains(tag))
        {
            return false;
        }
        match &self.enabled_tools {
            Some(enabled) => enabled.contains(key) || (!tag.is_empty() && enabled.contains(tag)),
            None => true,
        }
    }

    /// Instructions appended to the planning goal.
    pub fn prompt_block(&self) -> String {
        let mut block = String::from("\n\nTool policy (must follow):\n");
        block.push_str(&format!("- spreadsheet_format: {}\n", self.spreadsheet_format));
        block.push_str(&format!("- default_output_format: {}\n", self.default_output_format));
        if let Some(enabled) = &self.enabled_tools {
            block.push_str(&format!("- enabled_tools: {}\n", join_set(enabled)));
        }
        if !self.disabled_tools.is_empty() {
            block.push_str(&format!("- disabled_tools: {}\n", join_set(&self.disabled_tools)));
        }
        block.push_str("- Do not assign tasks requiring disabled tools.\n");
        match self.default_output_format.as_str() {
            "none" => block.push_str(
                "- Do not create output files unless the user explicitly asks for one.\n",
            ),
            "md" => block.push_str("- Reports and summaries should be written as markdown.\n"),
            "csv" => block.push_str("- Tabular data should be written as CSV.\n"),
            _ => {}
        }
        block
    }
}

/// Which workers a run may dispatch to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct WorkerPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub enabled_workers: Option<BTreeSet<String>>,
    #[serde(default)]
    pub disabled_workers: BTreeSet<String>,
}

impl Default for WorkerPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            enabled_workers: None,
            disabled_workers: BTreeSet::new(),
        }
    }
}

impl WorkerPolicy {
    pub fn disabling(workers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            disabled_workers: workers.into_iter().map(|w| w.into().to_lowercase()).collect(),
            ..Self::default()
        }
    }

    /// Names are matched against both the canonical key (`coder`) and the
    /// agent type (`code_agent`).
    pub fn allow_worker(&self, key: WorkerKey) -> bool {
        if !self.enabled {
            return true;
        }
        let names = [key.as_str(), key.agent_type()];
        if names.iter().any(|n| self.disabled_workers.contains(*n)) {
            return false;
        }
        match &self.enabled_workers {
            Some(enabled) => names.iter().any(|n| enabled.contains(*n)),
            None => true,
        }
    }

    pub fn prompt_block(&self) -> String {
        let mut block = String::from("\n\nWorker policy (must follow):\n");
        if let Some(enabled) = &self.enabled_workers {
            block.push_str(&format!("- enabled_workers: {}\n", join_set(enabled)));
        }
        if !self.disabled_workers.is_empty() {
            block.push_str(&format!("- disabled_workers: {}\n", join_set(&self.disabled_workers)));
        }
        block.push_str("- Do not assign tasks to disabled workers.\n");
        block
    }
}

fn join_set(set: &BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join(", ")
}

fn default_true() -> bool {
    true
}

fn default_spreadsheet_format() -> String {
    "csv".to_string()
}

fn default_output_format() -> String {
    "none".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_trace_config_filters() {
        let mut config = TraceConfig::default();
        assert!(config.allow_event("plan_created"));

        config.disabled_events = set(&["plan_step"]);
        assert!(!config.allow_event("plan_step"));

        config.enabled_events = Some(set(&["plan_created"]));
        assert!(config.allow_event("plan_created"));
        assert!(!config.allow_event("final_answer"));

        config.enabled = false;
        assert!(!config.allow_event("plan_created"));
    }

    #[test]
    fn test_tool_policy_matches_key_or_tag() {
        let policy = ToolPolicy {
            disabled_tools: set(&["bash"]),
            ..ToolPolicy::default()
        };
        assert!(!policy.allow_tool("bash", None));
        assert!(!policy.allow_tool("run", Some("bash")));
        assert!(policy.allow_tool("python", None));

        let allow_list = ToolPolicy {
            enabled_tools: Some(set(&["web_search"])),
            ..ToolPolicy::default()
        };
        assert!(allow_list.allow_tool("web_search", None));
        assert!(!allow_list.allow_tool("python", None));

        let off = ToolPolicy {
            enabled: false,
            disabled_tools: set(&["bash"]),
            ..ToolPolicy::default()
        };
        assert!(off.allow_tool("bash", None));
    }

    #[test]
    fn test_worker_policy_matches_key_and_agent_type() {
        let policy = WorkerPolicy::disabling(["web"]);
        assert!(!policy.allow_worker(WorkerKey::Web));
        assert!(policy.allow_worker(WorkerKey::Coder));

        let by_type = WorkerPolicy::disabling(["code_agent"]);
        assert!(!by_type.allow_worker(WorkerKey::Coder));

        let allow_list = WorkerPolicy {
            enabled_workers: Some(set(&["casual"])),
            ..WorkerPolicy::default()
        };
        assert!(allow_list.allow_worker(WorkerKey::Casual));
        assert!(!allow_list.allow_worker(WorkerKey::File));
    }

    #[test]
    fn test_prompt_blocks_list_sorted_sets() {
        let policy = WorkerPolicy::disabling(["web", "coder"]);
        let block = policy.prompt_block();
        assert!(block.contains("disabled_workers: coder, web"));

        let tools = ToolPolicy::default().prompt_block();
        assert!(tools.contains("spreadsheet_format: csv"));
        assert!(tools.contains("explicitly asks"));
    }

    #[test]
    fn test_run_mode_parse() {
        assert_eq!(RunMode::parse("Standard"), Some(RunMode::Standard));
        assert_eq!(RunMode::parse("deep_research"), Some(RunMode::Trace));
        assert_eq!(RunMode::parse("loud"), None);
    }
}
