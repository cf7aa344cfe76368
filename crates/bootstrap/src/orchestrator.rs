//! Sequential step driver.
//!
//! Steps run one at a time in a fixed order. Before executing, each step is
//! asked whether its effect is already present; if so it completes without
//! doing anything. A failing required step stops the sequence and leaves the
//! effects of earlier steps in place. A failing warning-only step is
//! recorded and the sequence continues.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::context::StepContext;
use crate::state::{BootstrapStep, StepPolicy, StepStatus};
use crate::ui;

/// One unit of the bootstrap sequence.
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable identifier, e.g. `install-fluxcd`.
    fn name(&self) -> &'static str;

    /// Human-readable description for progress output.
    fn description(&self) -> &'static str;

    /// Whether a failure halts the sequence.
    fn policy(&self) -> StepPolicy {
        StepPolicy::Required
    }

    /// Whether the step's effect is already observable.
    async fn already_satisfied(&self, _ctx: &StepContext) -> Result<bool> {
        Ok(false)
    }

    /// Perform the step.
    async fn execute(&self, ctx: &StepContext) -> Result<()>;
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub steps: Vec<BootstrapStep>,
    pub total: Duration,
}

impl RunSummary {
    /// Warning-only steps that failed.
    pub fn warnings(&self) -> impl Iterator<Item = &BootstrapStep> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed && s.policy == StepPolicy::WarningOnly)
    }

    /// Steps skipped because their effect was already present.
    pub fn skipped(&self) -> impl Iterator<Item = &BootstrapStep> {
        self.steps.iter().filter(|s| s.skipped)
    }
}

/// Runs a list of steps and tracks their status.
pub struct Orchestrator {
    steps: Vec<Box<dyn Step>>,
    records: Vec<BootstrapStep>,
}

impl Orchestrator {
    /// An orchestrator over `steps`, all pending.
    #[must_use]
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        let records = steps
            .iter()
            .map(|s| BootstrapStep::new(s.name(), s.description(), s.policy()))
            .collect();
        Self { steps, records }
    }

    /// Current status of every step.
    #[must_use]
    pub fn steps(&self) -> &[BootstrapStep] {
        &self.records
    }

    /// Run every step in order.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing required step, prefixed with
    /// its name. [`Orchestrator::steps`] still reflects how far the run got.
    pub async fn run(&mut self, ctx: &StepContext) -> Result<RunSummary> {
        let started = Instant::now();
        let total = self.steps.len();

        for (index, step) in self.steps.iter().enumerate() {
            let record = &mut self.records[index];
            ui::print_progress_step(index + 1, total, step.description());
            record.start()?;

            if ctx.cancel.is_cancelled() {
                record.fail("cancelled")?;
                return Err(anyhow!("bootstrap cancelled before step '{}'", step.name()));
            }

            let outcome = match step.already_satisfied(ctx).await {
                Ok(true) => {
                    info!(step = step.name(), "Already satisfied, skipping");
                    Ok(true)
                }
                Ok(false) => step.execute(ctx).await.map(|()| false),
                Err(e) => {
                    warn!(step = step.name(), error = %e, "Pre-check failed, executing anyway");
                    step.execute(ctx).await.map(|()| false)
                }
            };

            match outcome {
                Ok(skipped) => {
                    record.complete(skipped)?;
                    if skipped {
                        ui::print_info(&format!("{} already done", step.name()));
                    } else {
                        ui::print_success(step.description());
                    }
                }
                Err(e) => {
                    record.fail(&format!("{e:#}"))?;
                    match step.policy() {
                        StepPolicy::WarningOnly => {
                            warn!(step = step.name(), error = %e, "Step failed, continuing");
                            ui::print_warning(&format!("{}: {e:#}", step.name()));
                        }
                        StepPolicy::Required => {
                            error!(step = step.name(), error = %e, "Step failed");
                            ui::print_error(&format!("{}: {e:#}", step.name()));
                            self.log_timing(started.elapsed());
                            return Err(e.context(format!("step '{}' failed", step.name())));
                        }
                    }
                }
            }
        }

        let elapsed = started.elapsed();
        self.log_timing(elapsed);
        Ok(RunSummary {
            steps: self.records.clone(),
            total: elapsed,
        })
    }

    fn log_timing(&self, total: Duration) {
        for record in &self.records {
            if let Some(duration) = record.duration() {
                info!(
                    step = %record.name,
                    status = %record.status,
                    skipped = record.skipped,
                    duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                    "Step timing"
                );
            }
        }
        info!(total_secs = total.as_secs(), "Bootstrap timing summary");
    }
}
