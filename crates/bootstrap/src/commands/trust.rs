use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use federation::TrustManager;

use super::{cancel_on_interrupt, confirm, ClusterArgs};
use crate::context::connect;
use crate::ui;

/// Mint (or remove) mesh credentials that let a remote cluster read this one
#[derive(Args)]
pub struct TrustCommand {
    /// Name the remote cluster will know this cluster by
    remote: String,

    #[command(flatten)]
    cluster: ClusterArgs,

    /// Write the secret manifest to a file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Remove the credentials instead of creating them
    #[arg(long)]
    delete: bool,

    /// Do not authenticate with the minted credential before printing it
    #[arg(long)]
    skip_verify: bool,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    yes: bool,
}

impl TrustCommand {
    pub async fn run(&self) -> Result<()> {
        let config = self.cluster.load()?;
        let local = connect(
            config.cluster.kubeconfig.as_deref(),
            config.cluster.context.as_deref(),
        )
        .await
        .with_context(|| format!("Failed to connect to {}", config.cluster_name()))?;
        let manager = TrustManager::new(Arc::new(local)).with_cancellation(cancel_on_interrupt());

        if self.delete {
            let prompt = format!(
                "Remove mesh credentials for '{}' from {}?",
                self.remote,
                config.cluster_name()
            );
            if !confirm(&prompt, self.yes)? {
                println!("{}", "Nothing removed.".yellow());
                return Ok(());
            }
            manager.delete_remote_secret(&self.remote).await?;
            ui::print_success(&format!("Removed credentials for {}", self.remote));
            return Ok(());
        }

        let bundle = manager.create_remote_secret(&self.remote).await?;
        if !self.skip_verify {
            manager
                .verify_bundle(&bundle)
                .await
                .context("Minted credential failed verification")?;
        }
        let manifest = serde_yaml::to_string(&bundle.secret())?;

        match &self.output {
            Some(path) => {
                std::fs::write(path, manifest)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                ui::print_success(&format!(
                    "Remote secret for {} written to {}",
                    self.remote,
                    path.display()
                ));
                ui::print_info("Apply it on the remote cluster with kubectl apply -f");
            }
            None => print!("{manifest}"),
        }
        Ok(())
    }
}
