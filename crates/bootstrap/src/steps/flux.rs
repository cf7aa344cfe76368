//! Flux installation and the GitOps source it reconciles from.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use federation::resources::{
    CustomResources, GitRepositorySpec, KustomizationSpec, FLUX_NAMESPACE,
};
use federation::{poll_with, PollSpec};
use tracing::{info, instrument};

use super::{wait_for_deployments, INSTALL_WAIT};
use crate::context::StepContext;
use crate::orchestrator::Step;
use crate::secrets::opaque_secret;

/// Upstream Flux install bundle.
pub const FLUX_INSTALL_MANIFEST: &str =
    "https://github.com/fluxcd/flux2/releases/latest/download/install.yaml";

/// Name shared by the root `GitRepository`, `Kustomization` and auth secret.
pub const FLUX_ROOT: &str = "flux-system";

const FLUX_CONTROLLERS: [&str; 4] = [
    "source-controller",
    "kustomize-controller",
    "helm-controller",
    "notification-controller",
];
const SOURCE_READY: PollSpec = PollSpec::new(Duration::from_secs(10), Duration::from_secs(300));

/// `install-fluxcd`: apply the install bundle and wait for the controllers.
pub struct InstallFlux;

#[async_trait]
impl Step for InstallFlux {
    fn name(&self) -> &'static str {
        "install-fluxcd"
    }

    fn description(&self) -> &'static str {
        "Installing Flux"
    }

    async fn already_satisfied(&self, ctx: &StepContext) -> Result<bool> {
        for controller in FLUX_CONTROLLERS {
            if ctx.local.get_deployment(FLUX_NAMESPACE, controller).await?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    #[instrument(skip_all)]
    async fn execute(&self, ctx: &StepContext) -> Result<()> {
        let manifest = &ctx.config.gitops.install_manifest;
        info!(%manifest, "Applying Flux install manifest");
        ctx.tooling
            .apply_manifest(manifest)
            .await
            .context("Failed to apply Flux install manifest")?;

        wait_for_deployments(ctx, FLUX_NAMESPACE, &FLUX_CONTROLLERS, INSTALL_WAIT).await
    }
}

/// `bootstrap-gitops`: point Flux at the homelab repository.
pub struct BootstrapGitOps;

impl BootstrapGitOps {
    fn git_repository(ctx: &StepContext) -> GitRepositorySpec {
        let gitops = &ctx.config.gitops;
        GitRepositorySpec {
            name: FLUX_ROOT.to_string(),
            url: gitops.repository.clone(),
            branch: gitops.branch.clone(),
            interval: "1m0s".to_string(),
            secret_ref: gitops.token.as_ref().map(|_| FLUX_ROOT.to_string()),
        }
    }

    fn kustomization(ctx: &StepContext) -> KustomizationSpec {
        KustomizationSpec {
            name: FLUX_ROOT.to_string(),
            path: ctx.config.gitops_path().to_string(),
            source: FLUX_ROOT.to_string(),
            interval: "10m0s".to_string(),
            prune: true,
            depends_on: Vec::new(),
        }
    }
}

#[async_trait]
impl Step for BootstrapGitOps {
    fn name(&self) -> &'static str {
        "bootstrap-gitops"
    }

    fn description(&self) -> &'static str {
        "Configuring GitOps source"
    }

    async fn already_satisfied(&self, ctx: &StepContext) -> Result<bool> {
        let resources = CustomResources::new(ctx.local.as_ref());
        let source_ready = resources
            .git_repository(FLUX_ROOT)
            .await?
            .is_some_and(|s| s.is_ready());
        Ok(source_ready && resources.kustomization(FLUX_ROOT).await?.is_some())
    }

    #[instrument(skip_all, fields(repository = %ctx.config.gitops.repository))]
    async fn execute(&self, ctx: &StepContext) -> Result<()> {
        ctx.local.ensure_namespace(FLUX_NAMESPACE).await?;

        if let Some(token) = &ctx.config.gitops.token {
            let data = BTreeMap::from([
                ("username".to_string(), "git".to_string()),
                ("password".to_string(), token.clone()),
            ]);
            ctx.local
                .apply_secret(&opaque_secret(FLUX_NAMESPACE, FLUX_ROOT, &data, &[]))
                .await
                .context("Failed to write Git credentials")?;
        }

        let resources = CustomResources::new(ctx.local.as_ref());
        resources
            .apply_git_repository(&Self::git_repository(ctx))
            .await
            .context("Failed to apply GitRepository")?;
        resources
            .apply_kustomization(&Self::kustomization(ctx))
            .await
            .context("Failed to apply Kustomization")?;
        info!(path = ctx.config.gitops_path(), "GitOps source configured");

        let source = &resources;
        let outcome = poll_with(SOURCE_READY, &ctx.cancel, move || async move {
            Ok(source
                .git_repository(FLUX_ROOT)
                .await?
                .is_some_and(|s| s.is_ready()))
        })
        .await?;

        if !outcome.is_satisfied() {
            let last = resources
                .git_repository(FLUX_ROOT)
                .await
                .ok()
                .flatten()
                .map_or_else(|| "missing".to_string(), |s| s.summary());
            return Err(outcome
                .into_timeout(format!("GitRepository {FLUX_ROOT} Ready ({last})"), SOURCE_READY.timeout)
                .into());
        }
        Ok(())
    }
}
