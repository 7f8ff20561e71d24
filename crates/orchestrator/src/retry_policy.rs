//! Retry/advance decision for a step whose verdict came back not done.

use serde::{Deserialize, Serialize};
use taskflow_core::{RecommendedAction, Verdict};

/// Missing-item count and confidence of one verified attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub missing: usize,
    pub confidence: f64,
}

impl From<&Verdict> for Progress {
    fn from(verdict: &Verdict) -> Self {
        Self {
            missing: verdict.missing.len(),
            confidence: verdict.confidence,
        }
    }
}

/// Cutoff for retries that stop making headway.
///
/// A step is stalled when the missing-item count did not shrink and the
/// confidence did not rise compared to the previous verified attempt.
/// Whether an exactly equal confidence counts as "did not rise" is
/// configurable; by default it does.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StallPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub equal_confidence_is_progress: bool,
    /// Attempts that are never considered stalled.
    #[serde(default = "default_grace_attempts")]
    pub grace_attempts: u32,
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            equal_confidence_is_progress: false,
            grace_attempts: default_grace_attempts(),
        }
    }
}

impl StallPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn is_stalled(&self, previous: Option<Progress>, current: Progress, attempt: u32) -> bool {
        if !self.enabled || attempt <= self.grace_attempts {
            return false;
        }
        let Some(previous) = previous else {
            return false;
        };
        let confidence_flat = if self.equal_confidence_is_progress {
            current.confidence < previous.confidence
        } else {
            current.confidence <= previous.confidence
        };
        current.missing >= previous.missing && confidence_flat
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceReason {
    MaxRetries,
    NoProgress,
    TimeOrVerifier,
}

impl AdvanceReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxRetries => "max retries",
            Self::NoProgress => "no progress",
            Self::TimeOrVerifier => "time/verifier",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub min_remaining_secs: u64,
    pub stall: StallPolicy,
}

impl RetryPolicy {
    /// Attempts allowed per step, counting the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// `None` means retry; otherwise the step is force-advanced for the
    /// returned reason.
    pub fn decide(
        &self,
        verdict: &Verdict,
        attempt: u32,
        remaining_secs: u64,
        previous: Option<Progress>,
    ) -> Option<AdvanceReason> {
        let can_retry = attempt <= self.max_retries;
        let stalled = self.stall.is_stalled(previous, Progress::from(verdict), attempt);

        if !can_retry {
            Some(AdvanceReason::MaxRetries)
        } else if stalled {
            Some(AdvanceReason::NoProgress)
        } else if verdict.recommended_action != RecommendedAction::Retry
            || remaining_secs <= self.min_remaining_secs
        {
            Some(AdvanceReason::TimeOrVerifier)
        } else {
            None
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_grace_attempts() -> u32 {
    1
}
