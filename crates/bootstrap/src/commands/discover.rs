use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use federation::{store_discovery_info, ClusterDiscovery, ControlPlane};
use tracing::warn;

use super::ClusterArgs;
use crate::context::connect;
use crate::ui;

/// Find reachable clusters, optionally publishing this one
#[derive(Args)]
pub struct DiscoverCommand {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Write this cluster's API endpoint into its discovery registry
    #[arg(long)]
    publish: bool,

    /// Show only this cluster, failing if it was not found
    #[arg(long, value_name = "CLUSTER")]
    name: Option<String>,

    /// Print records as JSON
    #[arg(long)]
    json: bool,
}

impl DiscoverCommand {
    pub async fn run(&self) -> Result<()> {
        let config = self.cluster.load()?;

        let local: Option<Arc<dyn ControlPlane>> = match connect(
            config.cluster.kubeconfig.as_deref(),
            config.cluster.context.as_deref(),
        )
        .await
        {
            Ok(cp) => Some(Arc::new(cp)),
            Err(e) if self.publish => {
                return Err(e).with_context(|| format!("Cannot publish {}", config.cluster_name()));
            }
            Err(e) => {
                warn!(error = %e, "No local cluster, registry and mesh discovery disabled");
                None
            }
        };

        if self.publish {
            if let Some(cp) = &local {
                let record =
                    store_discovery_info(cp.as_ref(), config.cluster_name(), config.role.is_secondary())
                        .await?;
                ui::print_success(&format!("Published {} at {}", record.name, record.api_server_url));
            }
        }

        let spinner = ui::spinner("Discovering clusters");
        let discovery = ClusterDiscovery::standard(&config.project_root(), local);
        let mut records = discovery.discover_clusters().await;
        spinner.finish_and_clear();

        if let Some(name) = &self.name {
            records = vec![discovery.get_cluster(name)?];
        }

        if self.json {
            println!("{}", serde_json::to_string_pretty(&records)?);
            return Ok(());
        }

        ui::print_section("🔎 Discovered clusters");
        if records.is_empty() {
            ui::print_warning("No clusters found");
            return Ok(());
        }
        for record in &records {
            let role = if record.is_secondary { "secondary" } else { "primary" };
            println!(
                "  {} {:<10} {:<32} {:<16} {}",
                "●".green(),
                record.name.bold(),
                record.api_server_url,
                record.network_label,
                format!("{role}, {:?}", record.source).bright_black()
            );
            if let Some(path) = &record.credential_ref {
                ui::print_kv("kubeconfig", &path.display().to_string());
            }
        }
        Ok(())
    }
}
