//! Cilium CNI for the primary cluster.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, instrument};

use super::{wait_for_daemon_set, INSTALL_WAIT};
use crate::context::StepContext;
use crate::orchestrator::Step;

const CILIUM_NAMESPACE: &str = "kube-system";
const CILIUM_REPO: &str = "https://helm.cilium.io/";

/// `install-cilium`: Helm install of the CNI with the configured pod CIDR.
pub struct InstallCilium;

#[async_trait]
impl Step for InstallCilium {
    fn name(&self) -> &'static str {
        "install-cilium"
    }

    fn description(&self) -> &'static str {
        "Installing Cilium CNI"
    }

    async fn already_satisfied(&self, ctx: &StepContext) -> Result<bool> {
        Ok(ctx
            .local
            .get_deployment(CILIUM_NAMESPACE, "cilium-operator")
            .await?
            .is_some())
    }

    #[instrument(skip_all, fields(pod_cidr = ctx.config.pod_cidr()))]
    async fn execute(&self, ctx: &StepContext) -> Result<()> {
        // `repo add` fails when the repo is already known; `repo update` decides.
        if let Err(e) = ctx.tooling.helm(&["repo", "add", "cilium", CILIUM_REPO]).await {
            info!(error = %e, "Cilium repo add failed, updating instead");
        }
        ctx.tooling
            .helm(&["repo", "update", "cilium"])
            .await
            .context("Failed to update Cilium Helm repository")?;

        let cidr = format!(
            "ipam.operator.clusterPoolIPv4PodCIDRList={{{}}}",
            ctx.config.pod_cidr()
        );
        ctx.tooling
            .helm(&[
                "upgrade",
                "--install",
                "cilium",
                "cilium/cilium",
                "--namespace",
                CILIUM_NAMESPACE,
                "--set",
                "ipam.mode=cluster-pool",
                "--set",
                &cidr,
                "--set",
                "kubeProxyReplacement=false",
            ])
            .await
            .context("Cilium installation failed")?;

        wait_for_daemon_set(ctx, CILIUM_NAMESPACE, "cilium", INSTALL_WAIT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BootstrapConfig, ClusterRole};
    use crate::tooling::recording::RecordingTooling;
    use crate::transit::TransitProvisioner;
    use federation::testing::FakeControlPlane;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_install_passes_pod_cidr() {
        let fake = Arc::new(FakeControlPlane::default());
        fake.set_daemon_set(CILIUM_NAMESPACE, "cilium", 3, 3);
        let tooling = Arc::new(RecordingTooling::default());
        let mut config = BootstrapConfig::for_role(ClusterRole::Primary);
        config.cluster.pod_cidr = Some("10.42.0.0/16".to_string());
        let ctx = StepContext::new(config, fake.clone(), tooling.clone())
            .with_transit(TransitProvisioner::Secondary);

        assert!(!InstallCilium.already_satisfied(&ctx).await.unwrap());
        InstallCilium.execute(&ctx).await.unwrap();

        let calls = tooling.invocations();
        assert_eq!(calls.len(), 3);
        assert!(calls[2].starts_with("helm upgrade --install cilium cilium/cilium"));
        assert!(calls[2].contains("clusterPoolIPv4PodCIDRList={10.42.0.0/16}"));
    }

    #[tokio::test]
    async fn test_skipped_when_operator_exists() {
        let fake = Arc::new(FakeControlPlane::default());
        fake.set_deployment(CILIUM_NAMESPACE, "cilium-operator", 1, 1);
        let ctx = StepContext::new(
            BootstrapConfig::for_role(ClusterRole::Primary),
            fake.clone(),
            Arc::new(RecordingTooling::default()),
        )
        .with_transit(TransitProvisioner::Secondary);

        assert!(InstallCilium.already_satisfied(&ctx).await.unwrap());
    }
}
