use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use super::ClusterArgs;
use crate::context::connect;
use crate::health::{HealthChecker, HealthPolicy, HealthState};
use crate::ui;

/// Rolled-up health of one cluster
#[derive(Args)]
pub struct HealthCommand {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Print the status as JSON
    #[arg(long)]
    json: bool,
}

impl HealthCommand {
    pub async fn run(&self) -> Result<()> {
        let config = self.cluster.load()?;
        let local = connect(
            config.cluster.kubeconfig.as_deref(),
            config.cluster.context.as_deref(),
        )
        .await
        .with_context(|| format!("Failed to connect to {}", config.cluster_name()))?;

        let status = HealthChecker::new(Arc::new(local), config.cluster_name())
            .with_policy(HealthPolicy {
                warning_ratio: config.health.warning_ratio,
            })
            .with_dns_name(&config.health.dns_name)
            .check_cluster_health()
            .await;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&status)?);
        } else {
            ui::print_section(&format!("❤️  {} health", config.cluster_name()));
            ui::print_health(&status);
        }

        if status.overall() == HealthState::Unhealthy {
            anyhow::bail!("{} is unhealthy", config.cluster_name());
        }
        Ok(())
    }
}
