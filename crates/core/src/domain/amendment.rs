use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A note added to the active run without requeueing the job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct Amendment {
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Amendment {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into().trim().to_string(),
            timestamp: Utc::now(),
        }
    }
}
