use anyhow::Result;
use clap::Args;
use federation::ControlPlane;
use tracing::warn;

use super::ClusterArgs;
use crate::config::BootstrapConfig;
use crate::context::connect;
use crate::prereq::{report, CheckResult, PrerequisiteChecker};
use crate::ui;

/// Check the tools, credentials and cluster access a bootstrap needs
#[derive(Args)]
pub struct CheckCommand {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Print results as JSON
    #[arg(long)]
    json: bool,
}

impl CheckCommand {
    pub async fn run(&self) -> Result<()> {
        let config = self.cluster.load()?;
        if !self.json {
            ui::print_section(&format!("🔍 Prerequisites for {}", config.cluster_name()));
        }

        let results = run_checks(&config).await;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&results)?);
            return Ok(());
        }
        report(&results)
    }
}

/// Connect to the configured cluster, if possible, and run every check.
pub(crate) async fn run_checks(config: &BootstrapConfig) -> Vec<CheckResult> {
    let cluster = match connect(
        config.cluster.kubeconfig.as_deref(),
        config.cluster.context.as_deref(),
    )
    .await
    {
        Ok(cp) => Some(cp),
        Err(e) => {
            warn!(error = %e, "No kubeconfig for prerequisite checks");
            None
        }
    };
    PrerequisiteChecker::new(config)
        .run(cluster.as_ref().map(|cp| cp as &dyn ControlPlane))
        .await
}
