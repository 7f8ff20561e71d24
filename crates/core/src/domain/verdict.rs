use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub enum RecommendedAction {
    Advance,
    Retry,
}

impl RecommendedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Advance => "advance",
            Self::Retry => "retry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "advance" => Some(Self::Advance),
            "retry" => Some(Self::Retry),
            _ => None,
        }
    }
}

/// Judgment of one step attempt against its definition of done.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct Verdict {
    pub is_done: bool,
    /// Always within `0.0..=1.0`.
    pub confidence: f64,
    pub missing: Vec<String>,
    pub recommended_action: RecommendedAction,
    pub rationale: String,
}

impl Verdict {
    pub fn done(confidence: f64, rationale: impl Into<String>) -> Self {
        Self {
            is_done: true,
            confidence: confidence.clamp(0.0, 1.0),
            missing: Vec::new(),
            recommended_action: RecommendedAction::Advance,
            rationale: rationale.into(),
        }
    }

    pub fn not_done(
        missing: Vec<String>,
        recommended_action: RecommendedAction,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            is_done: false,
            confidence: 0.0,
            missing,
            recommended_action,
            rationale: rationale.into(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }
}
