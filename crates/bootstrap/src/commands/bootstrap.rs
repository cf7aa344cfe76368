use anyhow::Result;
use clap::Args;
use colored::Colorize;

use super::check::run_checks;
use super::{cancel_on_interrupt, confirm, ClusterArgs};
use crate::context::StepContext;
use crate::orchestrator::Orchestrator;
use crate::prereq::report;
use crate::steps::sequence_for;
use crate::ui;

/// Run the full bootstrap sequence against one cluster
#[derive(Args)]
pub struct BootstrapCommand {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    yes: bool,

    /// Skip prerequisite checks
    #[arg(long)]
    skip_checks: bool,
}

impl BootstrapCommand {
    pub async fn run(&self) -> Result<()> {
        let config = self.cluster.load()?;
        ui::print_section(&format!("🚀 Bootstrapping {}", config.cluster_name()));

        ui::print_kv("Role", &config.role.to_string());
        ui::print_kv("Repository", &config.gitops.repository);
        ui::print_kv("Path", config.gitops_path());
        ui::print_kv("Storage", &config.storage().to_string());
        ui::print_kv("Peer", config.peer_name());
        println!();

        if self.skip_checks {
            ui::print_warning("Skipping prerequisite checks");
        } else {
            ui::print_step("Checking prerequisites");
            report(&run_checks(&config).await)?;
        }

        if !confirm("Proceed with bootstrap?", self.yes)? {
            println!("{}", "Bootstrap cancelled.".yellow());
            return Ok(());
        }

        let ctx = StepContext::connect(config)
            .await?
            .with_cancellation(cancel_on_interrupt());
        if ctx.peer.is_none() {
            ui::print_info("Peer cluster not reachable; mesh trust will be deferred");
        }

        let mut orchestrator = Orchestrator::new(sequence_for(ctx.config.role));
        let result = orchestrator.run(&ctx).await;

        ui::print_section("Summary");
        ui::print_step_summary(orchestrator.steps());
        println!();

        let summary = result?;
        let warnings = summary.warnings().count();
        if warnings == 0 {
            ui::print_success(&format!(
                "{} bootstrapped in {:.0}s",
                ctx.cluster_name(),
                summary.total.as_secs_f64()
            ));
        } else {
            ui::print_warning(&format!(
                "{} bootstrapped with {warnings} warning(s); run `diagnose` for details",
                ctx.cluster_name()
            ));
        }
        Ok(())
    }
}
