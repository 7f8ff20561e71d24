use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Closed set of worker kinds a plan step can be assigned to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub enum WorkerKey {
    Coder,
    File,
    Web,
    Casual,
}

/// Loose names that planners tend to emit instead of the canonical keys.
/// Keys are lowercase and trimmed before lookup.
const ALIASES: &[(&str, WorkerKey)] = &[
    ("coder", WorkerKey::Coder),
    ("python", WorkerKey::Coder),
    ("code", WorkerKey::Coder),
    ("coding", WorkerKey::Coder),
    ("developer", WorkerKey::Coder),
    ("coderagent", WorkerKey::Coder),
    ("code_agent", WorkerKey::Coder),
    ("file", WorkerKey::File),
    ("bash", WorkerKey::File),
    ("shell", WorkerKey::File),
    ("terminal", WorkerKey::File),
    ("filesystem", WorkerKey::File),
    ("files", WorkerKey::File),
    ("fileagent", WorkerKey::File),
    ("file_agent", WorkerKey::File),
    ("web", WorkerKey::Web),
    ("browser", WorkerKey::Web),
    ("search", WorkerKey::Web),
    ("websearch", WorkerKey::Web),
    ("browser_agent", WorkerKey::Web),
    ("casual", WorkerKey::Casual),
    ("talk", WorkerKey::Casual),
    ("chat", WorkerKey::Casual),
    ("casual_agent", WorkerKey::Casual),
];

impl WorkerKey {
    pub const ALL: [WorkerKey; 4] = [Self::Coder, Self::File, Self::Web, Self::Casual];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coder => "coder",
            Self::File => "file",
            Self::Web => "web",
            Self::Casual => "casual",
        }
    }

    pub fn agent_type(&self) -> &'static str {
        match self {
            Self::Coder => "code_agent",
            Self::File => "file_agent",
            Self::Web => "browser_agent",
            Self::Casual => "casual_agent",
        }
    }

    /// Resolve a planner-supplied worker name through the alias table.
    pub fn resolve(raw: &str) -> Option<Self> {
        let needle = raw.trim().to_lowercase();
        ALIASES
            .iter()
            .find(|(alias, _)| *alias == needle)
            .map(|(_, key)| *key)
    }

    /// Whether this worker receives the latest outputs when a step forgot to
    /// declare its inputs.
    pub fn inherits_recent_outputs(&self) -> bool {
        matches!(self, Self::File | Self::Coder | Self::Casual)
    }
}

impl std::fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::resolve(s).ok_or_else(|| CoreError::UnknownWorker(s.to_string()))
    }
}
