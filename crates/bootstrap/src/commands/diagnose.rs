use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Args;

use crate::config::ClusterRole;
use crate::context::connect;
use crate::diagnostics::{ClusterTarget, DiagnosticManager, DiagnosticSummary};
use crate::ui;

/// Diagnose both clusters, tolerating either being unreachable
#[derive(Args)]
pub struct DiagnoseCommand {
    /// Kubeconfig for the primary cluster
    #[arg(long, env = "HOMELAB_KUBECONFIG_PATH", value_name = "FILE")]
    homelab_kubeconfig: Option<PathBuf>,

    /// Kubeconfig for the secondary cluster
    #[arg(long, env = "NAS_KUBECONFIG_PATH", value_name = "FILE")]
    nas_kubeconfig: Option<PathBuf>,

    /// Print findings as JSON
    #[arg(long)]
    json: bool,
}

async fn target(role: ClusterRole, kubeconfig: Option<&Path>) -> ClusterTarget {
    let name = role.cluster_name();
    let Some(path) = kubeconfig else {
        return ClusterTarget::unavailable(name, "no kubeconfig configured");
    };
    match connect(Some(path), None).await {
        Ok(cp) => ClusterTarget::connected(name, Arc::new(cp)),
        Err(e) => ClusterTarget::unavailable(name, e.to_string()),
    }
}

impl DiagnoseCommand {
    pub async fn run(&self) -> Result<()> {
        let (primary, secondary) = tokio::join!(
            target(ClusterRole::Primary, self.homelab_kubeconfig.as_deref()),
            target(ClusterRole::Secondary, self.nas_kubeconfig.as_deref()),
        );

        let findings = DiagnosticManager::new(primary, secondary)
            .diagnose_system()
            .await;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&findings)?);
        } else {
            ui::print_section("🩺 System diagnostics");
            ui::print_findings(&findings);
        }

        let summary = DiagnosticSummary::from_findings(&findings);
        if summary.has_errors() {
            bail!("diagnostics found {} error(s)", summary.errors);
        }
        Ok(())
    }
}
