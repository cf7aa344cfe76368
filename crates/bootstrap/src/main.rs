//! Homelab bootstrap CLI.
//!
//! Installs the GitOps stack on the homelab and NAS clusters, waits for the
//! platform layers to converge and federates the two clusters for the mesh.

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use homelab_bootstrap::commands::bootstrap::BootstrapCommand;
use homelab_bootstrap::commands::check::CheckCommand;
use homelab_bootstrap::commands::diagnose::DiagnoseCommand;
use homelab_bootstrap::commands::discover::DiscoverCommand;
use homelab_bootstrap::commands::health::HealthCommand;
use homelab_bootstrap::commands::trust::TrustCommand;
use homelab_bootstrap::commands::wait::WaitCommand;

/// Log output format.
#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Homelab bootstrap - GitOps bootstrap and cluster federation.
#[derive(Parser)]
#[command(
    name = "homelab-bootstrap",
    version,
    about = "Bootstrap and federate the homelab clusters",
    long_about = "Bootstrap the homelab and NAS Kubernetes clusters.\n\n\
                  Installs Cilium and Flux, points Flux at the homelab repository,\n\
                  waits for the platform layers to converge and exchanges mesh\n\
                  credentials between the two clusters.\n\n\
                  Every step checks whether its effect is already present, so\n\
                  re-running a command picks up where the last run stopped."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bootstrap sequence for a cluster role.
    Bootstrap(BootstrapCommand),

    /// Check tools, credentials and cluster access.
    Check(CheckCommand),

    /// Wait for the infrastructure layers only.
    Wait(WaitCommand),

    /// Discover clusters, optionally publishing this one.
    Discover(DiscoverCommand),

    /// Mint mesh credentials for a remote cluster.
    Trust(TrustCommand),

    /// Diagnose both clusters.
    Diagnose(DiagnoseCommand),

    /// Rolled-up health of one cluster.
    Health(HealthCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("info,federation=debug,homelab_bootstrap=debug")
    } else {
        EnvFilter::new("warn,federation=info,homelab_bootstrap=info")
    };

    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }

    match cli.command {
        Commands::Bootstrap(cmd) => cmd.run().await,
        Commands::Check(cmd) => cmd.run().await,
        Commands::Wait(cmd) => cmd.run().await,
        Commands::Discover(cmd) => cmd.run().await,
        Commands::Trust(cmd) => cmd.run().await,
        Commands::Diagnose(cmd) => cmd.run().await,
        Commands::Health(cmd) => cmd.run().await,
    }
}
