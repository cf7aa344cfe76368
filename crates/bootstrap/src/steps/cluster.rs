//! Steps that inspect the cluster rather than install into it.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use federation::resources::{CustomResources, FLUX_NAMESPACE};
use federation::{poll_with, store_discovery_info, ClusterDiscovery, PollSpec};
use tracing::{info, instrument, warn};

use crate::context::StepContext;
use crate::health::{HealthChecker, HealthPolicy, HealthState};
use crate::orchestrator::Step;
use crate::state::StepPolicy;
use crate::status::{deployment_ready, node_ready};
use crate::ui;
use crate::waiter::{LayerOutcome, WaitTargets, Waiter};

const NODE_WAIT: PollSpec = PollSpec::new(Duration::from_secs(10), Duration::from_secs(600));
const SYNC_CONTROLLERS: [&str; 3] = ["source-controller", "kustomize-controller", "helm-controller"];

/// `verify-cluster`: the API server answers.
pub struct VerifyCluster;

#[async_trait]
impl Step for VerifyCluster {
    fn name(&self) -> &'static str {
        "verify-cluster"
    }

    fn description(&self) -> &'static str {
        "Verifying cluster connectivity"
    }

    async fn execute(&self, ctx: &StepContext) -> Result<()> {
        let version = ctx
            .local
            .server_version()
            .await
            .with_context(|| format!("Cannot reach {} API server", ctx.cluster_name()))?;
        let nodes = ctx.local.list_nodes().await?;
        info!(
            cluster = ctx.cluster_name(),
            api = %ctx.local.api_server_url(),
            %version,
            nodes = nodes.len(),
            "Cluster reachable"
        );
        Ok(())
    }
}

/// `wait-nodes`: every node Ready, and as many as configured.
pub struct WaitNodes;

impl WaitNodes {
    async fn nodes_ready(ctx: &StepContext) -> federation::Result<bool> {
        let nodes = ctx.local.list_nodes().await?;
        let ready = nodes.iter().filter(|n| node_ready(n)).count();
        let expected = ctx.config.cluster.expected_nodes.unwrap_or(1).max(1);
        info!(ready, total = nodes.len(), expected, "Waiting for nodes");
        Ok(ready == nodes.len() && ready >= expected)
    }
}

#[async_trait]
impl Step for WaitNodes {
    fn name(&self) -> &'static str {
        "wait-nodes"
    }

    fn description(&self) -> &'static str {
        "Waiting for nodes to be ready"
    }

    async fn already_satisfied(&self, ctx: &StepContext) -> Result<bool> {
        Ok(Self::nodes_ready(ctx).await?)
    }

    async fn execute(&self, ctx: &StepContext) -> Result<()> {
        let outcome = poll_with(NODE_WAIT, &ctx.cancel, move || Self::nodes_ready(ctx)).await?;
        if !outcome.is_satisfied() {
            return Err(outcome.into_timeout("all nodes Ready", NODE_WAIT.timeout).into());
        }
        Ok(())
    }
}

/// `store-discovery-info`: publish this cluster's API endpoint, then log
/// what discovery can currently see.
pub struct StoreDiscoveryInfo;

#[async_trait]
impl Step for StoreDiscoveryInfo {
    fn name(&self) -> &'static str {
        "store-discovery-info"
    }

    fn description(&self) -> &'static str {
        "Publishing cluster discovery info"
    }

    fn policy(&self) -> StepPolicy {
        StepPolicy::WarningOnly
    }

    async fn execute(&self, ctx: &StepContext) -> Result<()> {
        ctx.local
            .ensure_namespace(FLUX_NAMESPACE)
            .await
            .context("Failed to ensure flux-system namespace")?;
        let record = store_discovery_info(
            ctx.local.as_ref(),
            ctx.cluster_name(),
            ctx.config.role.is_secondary(),
        )
        .await?;
        info!(cluster = %record.name, api = %record.api_server_url, "Published discovery record");

        let discovery =
            ClusterDiscovery::standard(&ctx.config.project_root(), Some(ctx.local.clone()));
        let known = discovery.discover_clusters().await;
        info!(
            clusters = ?known.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "Discovered clusters"
        );
        Ok(())
    }
}

/// `wait-infrastructure`: the layered readiness gate.
pub struct WaitInfrastructure;

#[async_trait]
impl Step for WaitInfrastructure {
    fn name(&self) -> &'static str {
        "wait-infrastructure"
    }

    fn description(&self) -> &'static str {
        "Waiting for infrastructure layers"
    }

    fn policy(&self) -> StepPolicy {
        StepPolicy::WarningOnly
    }

    #[instrument(skip_all, fields(cluster = ctx.cluster_name()))]
    async fn execute(&self, ctx: &StepContext) -> Result<()> {
        let waiter = Waiter::new(ctx.local.clone(), WaitTargets::from_config(&ctx.config))
            .with_timeouts(ctx.config.layer_timeouts())
            .with_tooling(ctx.tooling.clone())
            .with_cancellation(ctx.cancel.clone());

        let report = waiter.wait_for_infrastructure().await?;
        for layer in &report.layers {
            match &layer.outcome {
                LayerOutcome::Ready => ui::print_check_result(&layer.layer.to_string(), true, None),
                LayerOutcome::Skipped => {
                    ui::print_check_result(&layer.layer.to_string(), true, Some("skipped"));
                }
                LayerOutcome::Warning { message, .. } => {
                    ui::print_check_result(&layer.layer.to_string(), false, Some(message));
                }
            }
        }
        if !report.is_clean() {
            warn!(
                warnings = report.warnings().count(),
                "Infrastructure still converging"
            );
        }
        Ok(())
    }
}

/// `validate-deployment`: Flux is installed and syncing.
pub struct ValidateDeployment;

#[async_trait]
impl Step for ValidateDeployment {
    fn name(&self) -> &'static str {
        "validate-deployment"
    }

    fn description(&self) -> &'static str {
        "Validating Flux sync status"
    }

    fn policy(&self) -> StepPolicy {
        StepPolicy::WarningOnly
    }

    async fn execute(&self, ctx: &StepContext) -> Result<()> {
        if !ctx.local.namespace_exists(FLUX_NAMESPACE).await? {
            bail!("namespace {FLUX_NAMESPACE} does not exist");
        }

        let mut missing = Vec::new();
        for controller in SYNC_CONTROLLERS {
            match ctx.local.get_deployment(FLUX_NAMESPACE, controller).await? {
                Some(d) if deployment_ready(&d) => {
                    ui::print_check_result(controller, true, None);
                }
                Some(_) => {
                    ui::print_check_result(controller, false, Some("not ready"));
                    missing.push(controller);
                }
                None => {
                    ui::print_check_result(controller, false, Some("missing"));
                    missing.push(controller);
                }
            }
        }

        for status in CustomResources::new(ctx.local.as_ref()).kustomizations().await? {
            info!(kustomization = %status.summary(), "Sync status");
        }

        if !missing.is_empty() {
            bail!("Flux controllers not ready: {}", missing.join(", "));
        }
        Ok(())
    }
}

/// `health-check`: rolled-up cluster health.
pub struct HealthCheck;

#[async_trait]
impl Step for HealthCheck {
    fn name(&self) -> &'static str {
        "health-check"
    }

    fn description(&self) -> &'static str {
        "Checking cluster health"
    }

    fn policy(&self) -> StepPolicy {
        StepPolicy::WarningOnly
    }

    async fn execute(&self, ctx: &StepContext) -> Result<()> {
        let status = HealthChecker::new(ctx.local.clone(), ctx.cluster_name())
            .with_policy(HealthPolicy {
                warning_ratio: ctx.config.health.warning_ratio,
            })
            .with_dns_name(&ctx.config.health.dns_name)
            .check_cluster_health()
            .await;
        ui::print_health(&status);

        if status.overall() == HealthState::Unhealthy {
            bail!("{} is unhealthy", ctx.cluster_name());
        }
        Ok(())
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

    fn context(fake: &Arc<FakeControlPlane>, role: ClusterRole) -> StepContext {
        StepContext::new(
            BootstrapConfig::for_role(role),
            fake.clone(),
            Arc::new(RecordingTooling::default()),
        )
        .with_transit(TransitProvisioner::Secondary)
    }

    #[tokio::test]
    async fn test_verify_cluster_unreachable() {
        let fake = Arc::new(FakeControlPlane::default());
        fake.set_unreachable(true);

        let err = VerifyCluster
            .execute(&context(&fake, ClusterRole::Primary))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("Cannot reach homelab API server"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_nodes_waits_for_expected_count() {
        let fake = Arc::new(FakeControlPlane::default());
        fake.add_node("cp-1", true, Some("10.0.0.1"), None);
        let mut config = BootstrapConfig::for_role(ClusterRole::Primary);
        config.cluster.expected_nodes = Some(2);
        let ctx = StepContext::new(config, fake.clone(), Arc::new(RecordingTooling::default()))
            .with_transit(TransitProvisioner::Secondary);

        assert!(!WaitNodes.already_satisfied(&ctx).await.unwrap());
        let err = WaitNodes.execute(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("all nodes Ready"));

        fake.add_node("worker-1", true, Some("10.0.0.2"), None);
        assert!(WaitNodes.already_satisfied(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_discovery_info_writes_registry() {
        let fake = Arc::new(FakeControlPlane::default());
        fake.add_node("nas-1", true, Some("192.168.1.42"), None);
        let mut config = BootstrapConfig::for_role(ClusterRole::Secondary);
        let root = tempfile::tempdir().unwrap();
        config.project_root = Some(root.path().to_path_buf());
        let ctx = StepContext::new(config, fake.clone(), Arc::new(RecordingTooling::default()))
            .with_transit(TransitProvisioner::Secondary);

        StoreDiscoveryInfo.execute(&ctx).await.unwrap();

        let data = fake
            .config_map(FLUX_NAMESPACE, "cluster-discovery")
            .and_then(|cm| cm.data)
            .unwrap();
        assert_eq!(data["nas"], "https://192.168.1.42:6443,nas-network,true");
    }

    #[tokio::test]
    async fn test_validate_deployment_reports_missing_controllers() {
        let fake = Arc::new(FakeControlPlane::default());
        fake.add_namespace(FLUX_NAMESPACE);
        fake.set_deployment(FLUX_NAMESPACE, "source-controller", 1, 1);
        fake.set_deployment(FLUX_NAMESPACE, "kustomize-controller", 1, 0);
        let ctx = context(&fake, ClusterRole::Primary);

        let err = ValidateDeployment.execute(&ctx).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Flux controllers not ready: kustomize-controller, helm-controller"
        );

        fake.set_deployment(FLUX_NAMESPACE, "kustomize-controller", 1, 1);
        fake.set_deployment(FLUX_NAMESPACE, "helm-controller", 1, 1);
        ValidateDeployment.execute(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_health_check_fails_when_unhealthy() {
        let fake = Arc::new(FakeControlPlane::default());
        fake.set_unreachable(true);
        let mut config = BootstrapConfig::for_role(ClusterRole::Primary);
        config.health.dns_name = "localhost".to_string();
        let ctx = StepContext::new(config, fake.clone(), Arc::new(RecordingTooling::default()))
            .with_transit(TransitProvisioner::Secondary);

        let err = HealthCheck.execute(&ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "homelab is unhealthy");
    }
}
