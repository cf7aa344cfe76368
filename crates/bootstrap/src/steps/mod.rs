//! The bootstrap steps and the per-role sequence.

pub mod cilium;
pub mod cluster;
pub mod flux;
pub mod gateway;
pub mod mesh;
pub mod secrets;

use std::time::Duration;

use anyhow::Result;
use federation::{poll_with, PollSpec};
use tracing::info;

use crate::config::ClusterRole;
use crate::context::StepContext;
use crate::orchestrator::Step;
use crate::status::{daemon_set_ready, deployment_ready};

/// Steps for `role`, in execution order.
#[must_use]
pub fn sequence_for(role: ClusterRole) -> Vec<Box<dyn Step>> {
    match role {
        ClusterRole::Primary => vec![
            Box::new(cluster::VerifyCluster),
            Box::new(cilium::InstallCilium),
            Box::new(cluster::WaitNodes),
            Box::new(flux::InstallFlux),
            Box::new(flux::BootstrapGitOps),
            Box::new(secrets::SetupSecrets),
            Box::new(cluster::StoreDiscoveryInfo),
            Box::new(mesh::EnsureMeshTrust),
            Box::new(cluster::WaitInfrastructure),
            Box::new(gateway::FinalizeMesh),
            Box::new(cluster::ValidateDeployment),
            Box::new(cluster::HealthCheck),
        ],
        ClusterRole::Secondary => vec![
            Box::new(cluster::VerifyCluster),
            Box::new(flux::InstallFlux),
            Box::new(flux::BootstrapGitOps),
            Box::new(secrets::SetupSecrets),
            Box::new(cluster::StoreDiscoveryInfo),
            Box::new(mesh::EnsureMeshTrust),
            Box::new(cluster::WaitInfrastructure),
            Box::new(gateway::FinalizeMesh),
            Box::new(cluster::ValidateDeployment),
        ],
    }
}

/// Wait until every deployment in `names` reports all replicas ready.
pub(crate) async fn wait_for_deployments(
    ctx: &StepContext,
    namespace: &str,
    names: &[&str],
    spec: PollSpec,
) -> Result<()> {
    for name in names {
        let local = ctx.local.as_ref();
        let outcome = poll_with(spec, &ctx.cancel, move || async move {
            Ok(local
                .get_deployment(namespace, name)
                .await?
                .is_some_and(|d| deployment_ready(&d)))
        })
        .await?;

        if !outcome.is_satisfied() {
            return Err(outcome
                .into_timeout(format!("deployment {namespace}/{name}"), spec.timeout)
                .into());
        }
        info!(namespace, deployment = name, "Deployment ready");
    }
    Ok(())
}

/// Wait until a daemon set has every desired pod ready.
pub(crate) async fn wait_for_daemon_set(
    ctx: &StepContext,
    namespace: &str,
    name: &str,
    spec: PollSpec,
) -> Result<()> {
    let local = ctx.local.as_ref();
    let outcome = poll_with(spec, &ctx.cancel, move || async move {
        Ok(local
            .get_daemon_set(namespace, name)
            .await?
            .is_some_and(|ds| daemon_set_ready(&ds)))
    })
    .await?;

    if outcome.is_satisfied() {
        info!(namespace, daemon_set = name, "Daemon set ready");
        Ok(())
    } else {
        Err(outcome
            .into_timeout(format!("daemon set {namespace}/{name}"), spec.timeout)
            .into())
    }
}

/// Poll spec shared by the install steps.
pub(crate) const INSTALL_WAIT: PollSpec =
    PollSpec::new(Duration::from_secs(10), Duration::from_secs(300));
