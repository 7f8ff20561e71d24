use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Invalid job status: {0}")]
    InvalidJobStatus(String),

    #[error("Invalid step status transition from {from} to {to}")]
    InvalidStepTransition { from: String, to: String },

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CoreError::UnknownWorker("teleporter".to_string());
        assert!(error.to_string().contains("teleporter"));

        let error = CoreError::InvalidStepTransition {
            from: "completed".to_string(),
            to: "running".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid step status transition from completed to running"
        );
    }
}
