//! Step bookkeeping for cleanup paths that must never abort.

use crate::command_runner::CommandResult;
use crate::error::ManagerError;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    Failed(String),
}

/// Ordered record of the steps a repair or uninstall attempted.
#[derive(Debug, Default)]
pub struct StepLog {
    steps: Vec<(String, StepOutcome)>,
}

impl StepLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, step: impl Into<String>, outcome: StepOutcome) {
        let step = step.into();
        if let StepOutcome::Failed(reason) = &outcome {
            warn!(%step, %reason, "Step failed, continuing");
        }
        self.steps.push((step, outcome));
    }

    pub fn record_result(&mut self, step: impl Into<String>, result: Result<(), ManagerError>) {
        let outcome = match result {
            Ok(()) => StepOutcome::Done,
            Err(err) => StepOutcome::Failed(err.to_string()),
        };
        self.record(step, outcome);
    }

    /// Record a best-effort command; a nonzero exit counts as a failed step.
    pub fn record_command(&mut self, step: impl Into<String>, result: &CommandResult) {
        let outcome = if result.success() {
            StepOutcome::Done
        } else {
            StepOutcome::Failed(format!("exit {}: {}", result.exit_code, result.summary()))
        };
        self.record(step, outcome);
    }

    pub fn steps(&self) -> &[(String, StepOutcome)] {
        &self.steps
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.steps.iter().filter_map(|(step, outcome)| match outcome {
            StepOutcome::Failed(reason) => Some((step.as_str(), reason.as_str())),
            StepOutcome::Done => None,
        })
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn render_failures(&self) -> Vec<String> {
        self.failures()
            .map(|(step, reason)| format!("{step}: {reason}"))
            .collect()
    }
}
