use serde::{Deserialize, Serialize};

use super::worker::WorkerKey;
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn allowed_transitions(&self) -> &'static [StepStatus] {
        match self {
            Self::Pending => &[Self::Running],
            Self::Running => &[Self::Completed, Self::Failed],
            Self::Completed | Self::Failed => &[],
        }
    }

    pub fn validate_transition(&self, to: StepStatus) -> Result<(), CoreError> {
        if self.allowed_transitions().contains(&to) {
            Ok(())
        } else {
            Err(CoreError::InvalidStepTransition {
                from: self.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct Step {
    pub id: String,
    pub worker: WorkerKey,
    /// Task text handed to the worker. Retry notes and amendments are
    /// appended to it between attempts.
    pub task: String,
    #[serde(default)]
    pub deliverable: String,
    #[serde(default)]
    pub definition_of_done: Vec<String>,
    /// Ids of earlier steps whose outputs this step consumes.
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub attempts: u32,
}

impl Step {
    pub fn new(id: impl Into<String>, worker: WorkerKey, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            worker,
            task: task.into(),
            deliverable: String::new(),
            definition_of_done: Vec::new(),
            needs: Vec::new(),
            status: StepStatus::Pending,
            attempts: 0,
        }
    }

    pub fn with_deliverable(mut self, deliverable: impl Into<String>) -> Self {
        self.deliverable = deliverable.into();
        self
    }

    pub fn with_definition_of_done(
        mut self,
        checks: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.definition_of_done = checks.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_needs(mut self, needs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.needs = needs.into_iter().map(Into::into).collect();
        self
    }

    /// Non-blank definition-of-done checks.
    pub fn done_checks(&self) -> Vec<&str> {
        self.definition_of_done
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .collect()
    }

    pub fn transition(&mut self, to: StepStatus) -> Result<(), CoreError> {
        self.status.validate_transition(to)?;
        self.status = to;
        Ok(())
    }

    /// Send a finished step back to `Pending` for another round of work.
    /// Returns false when the step had not finished.
    pub fn reopen(&mut self) -> bool {
        if !self.status.is_terminal() {
            return false;
        }
        self.status = StepStatus::Pending;
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct Plan {
    pub goal: String,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new(goal: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            goal: goal.into(),
            steps,
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn position(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_transitions() {
        let mut step = Step::new("1", WorkerKey::Web, "find prices");
        assert_eq!(step.status, StepStatus::Pending);

        step.transition(StepStatus::Running).unwrap();
        step.transition(StepStatus::Completed).unwrap();
        assert!(step.status.is_terminal());

        let err = step.transition(StepStatus::Running).unwrap_err();
        assert!(err.to_string().contains("completed"));
    }

    #[test]
    fn test_reopen_only_finished_steps() {
        let mut step = Step::new("1", WorkerKey::File, "write file");
        assert!(!step.reopen());

        step.transition(StepStatus::Running).unwrap();
        assert!(!step.reopen());
        step.transition(StepStatus::Failed).unwrap();
        assert!(step.reopen());
        assert_eq!(step.status, StepStatus::Pending);
        step.transition(StepStatus::Running).unwrap();
    }

    #[test]
    fn test_pending_cannot_complete_directly() {
        let mut step = Step::new("1", WorkerKey::File, "write file");
        assert!(step.transition(StepStatus::Completed).is_err());
        assert_eq!(step.status, StepStatus::Pending);
    }

    #[test]
    fn test_done_checks_skip_blank_lines() {
        let step = Step::new("1", WorkerKey::Coder, "task")
            .with_definition_of_done(["has tests", "  ", "compiles"]);
        assert_eq!(step.done_checks(), vec!["has tests", "compiles"]);
    }

    #[test]
    fn test_plan_lookup() {
        let plan = Plan::new(
            "goal",
            vec![
                Step::new("1", WorkerKey::Web, "a"),
                Step::new("2", WorkerKey::File, "b").with_needs(["1"]),
            ],
        );
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.position("2"), Some(1));
        assert_eq!(plan.step("2").unwrap().needs, vec!["1".to_string()]);
        assert!(plan.step("3").is_none());
    }

    #[test]
    fn test_step_status_parse() {
        assert_eq!(StepStatus::parse("running"), Some(StepStatus::Running));
        assert_eq!(StepStatus::parse("skipped"), None);
    }
}
