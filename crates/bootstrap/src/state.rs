//! Step bookkeeping for the bootstrap sequence.
//!
//! A [`BootstrapStep`] moves `Pending -> Running -> Completed | Failed` and
//! never backwards. The orchestrator owns every instance.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Lifecycle of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started yet.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully or was already satisfied.
    Completed,
    /// Finished with an error.
    Failed,
}

impl StepStatus {
    /// Whether the step has finished.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// What a failure of the step means for the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPolicy {
    /// Failure halts the sequence.
    Required,
    /// Failure is recorded as a warning and the sequence continues.
    WarningOnly,
}

/// Rejected status change.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("step '{step}' cannot move from {from} to {to}")]
pub struct InvalidTransition {
    /// Step name.
    pub step: String,
    /// Current status.
    pub from: StepStatus,
    /// Requested status.
    pub to: StepStatus,
}

/// Progress record of one step.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapStep {
    pub name: String,
    pub description: String,
    pub policy: StepPolicy,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// The effect was already present, so nothing was executed.
    pub skipped: bool,
}

impl BootstrapStep {
    /// A pending step.
    #[must_use]
    pub fn new(name: &str, description: &str, policy: StepPolicy) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            policy,
            status: StepStatus::Pending,
            started_at: None,
            ended_at: None,
            error: None,
            skipped: false,
        }
    }

    fn transition(&mut self, to: StepStatus) -> Result<(), InvalidTransition> {
        let allowed = matches!(
            (self.status, to),
            (StepStatus::Pending, StepStatus::Running)
                | (StepStatus::Running, StepStatus::Completed | StepStatus::Failed)
        );
        if !allowed {
            return Err(InvalidTransition {
                step: self.name.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Mark the step as running.
    ///
    /// # Errors
    ///
    /// Returns an error unless the step is pending.
    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        self.transition(StepStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the step as completed; `skipped` records a check-before-act hit.
    ///
    /// # Errors
    ///
    /// Returns an error unless the step is running.
    pub fn complete(&mut self, skipped: bool) -> Result<(), InvalidTransition> {
        self.transition(StepStatus::Completed)?;
        self.ended_at = Some(Utc::now());
        self.skipped = skipped;
        Ok(())
    }

    /// Mark the step as failed.
    ///
    /// # Errors
    ///
    /// Returns an error unless the step is running.
    pub fn fail(&mut self, error: &str) -> Result<(), InvalidTransition> {
        self.transition(StepStatus::Failed)?;
        self.ended_at = Some(Utc::now());
        self.error = Some(error.to_string());
        Ok(())
    }

    /// Wall time between start and end, if both are known.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.ended_at?);
        (end - start).to_std().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut step = BootstrapStep::new("install-fluxcd", "Install Flux", StepPolicy::Required);
        assert_eq!(step.status, StepStatus::Pending);

        step.start().unwrap();
        assert_eq!(step.status, StepStatus::Running);
        assert!(step.started_at.is_some());

        step.complete(false).unwrap();
        assert_eq!(step.status, StepStatus::Completed);
        assert!(step.status.is_terminal());
        assert!(step.duration().is_some());
    }

    #[test]
    fn test_failure_records_error() {
        let mut step = BootstrapStep::new("wait-nodes", "Wait", StepPolicy::Required);
        step.start().unwrap();
        step.fail("timed out").unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.error.as_deref(), Some("timed out"));
    }

    #[test]
    fn test_transitions_are_monotonic() {
        let mut step = BootstrapStep::new("verify-cluster", "Verify", StepPolicy::Required);
        assert!(step.complete(false).is_err());

        step.start().unwrap();
        assert!(step.start().is_err());

        step.complete(true).unwrap();
        let err = step.fail("late").unwrap_err();
        assert_eq!(err.from, StepStatus::Completed);
        assert_eq!(err.to, StepStatus::Failed);
        assert_eq!(step.status, StepStatus::Completed);
        assert!(step.skipped);
    }
}
