use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use super::{cancel_on_interrupt, ClusterArgs};
use crate::context::connect;
use crate::tooling::CliTooling;
use crate::ui;
use crate::waiter::{LayerOutcome, WaitTargets, Waiter};

/// Run only the layered infrastructure readiness gate
#[derive(Args)]
pub struct WaitCommand {
    #[command(flatten)]
    cluster: ClusterArgs,
}

impl WaitCommand {
    pub async fn run(&self) -> Result<()> {
        let config = self.cluster.load()?;
        ui::print_section(&format!("⏳ Waiting for {} infrastructure", config.cluster_name()));

        let kubeconfig = config.cluster.kubeconfig.clone();
        let context = config.cluster.context.clone();
        let local = connect(kubeconfig.as_deref(), context.as_deref())
            .await
            .with_context(|| format!("Failed to connect to {}", config.cluster_name()))?;

        let waiter = Waiter::new(Arc::new(local), WaitTargets::from_config(&config))
            .with_timeouts(config.layer_timeouts())
            .with_tooling(Arc::new(CliTooling::new(kubeconfig, context)))
            .with_cancellation(cancel_on_interrupt());

        let spinner = ui::spinner("Walking infrastructure layers");
        let result = waiter.wait_for_infrastructure().await;
        spinner.finish_and_clear();
        let report = result?;

        for layer in &report.layers {
            let elapsed = format!("{:.0}s", layer.elapsed.as_secs_f64());
            match &layer.outcome {
                LayerOutcome::Ready => {
                    ui::print_check_result(&layer.layer.to_string(), true, Some(&elapsed));
                }
                LayerOutcome::Skipped => {
                    ui::print_check_result(&layer.layer.to_string(), true, Some("skipped"));
                }
                LayerOutcome::Warning {
                    message,
                    diagnostics,
                } => {
                    ui::print_check_result(&layer.layer.to_string(), false, Some(message));
                    for line in diagnostics {
                        println!("      {line}");
                    }
                }
            }
        }

        println!();
        if report.is_clean() {
            ui::print_success("All infrastructure layers ready");
        } else {
            ui::print_warning("Some layers are still converging");
        }
        Ok(())
    }
}
