//! CLI subcommands.

pub mod bootstrap;
pub mod check;
pub mod diagnose;
pub mod discover;
pub mod health;
pub mod trust;
pub mod wait;

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use dialoguer::{theme::ColorfulTheme, Confirm};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{BootstrapConfig, ClusterRole};

/// Which cluster to act on and how to reach it.
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Cluster role (primary|homelab, secondary|nas)
    #[arg(short, long, default_value = "primary")]
    pub role: ClusterRole,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Kubeconfig for the cluster, overriding configuration
    #[arg(long, value_name = "FILE")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context
    #[arg(long)]
    pub context: Option<String>,
}

impl ClusterArgs {
    /// Configuration for the selected role with command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be loaded.
    pub fn load(&self) -> Result<BootstrapConfig> {
        let mut config = BootstrapConfig::load(self.role, self.config.as_deref())?;
        if let Some(kubeconfig) = &self.kubeconfig {
            config.cluster.kubeconfig = Some(kubeconfig.clone());
        }
        if let Some(context) = &self.context {
            config.cluster.context = Some(context.clone());
        }
        Ok(config)
    }
}

/// Ask before a mutating command, unless `assume_yes`.
pub(crate) fn confirm(prompt: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(true)
        .interact()?)
}

/// A token cancelled on Ctrl-C.
pub(crate) fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            token.cancel();
        }
    });
    cancel
}
