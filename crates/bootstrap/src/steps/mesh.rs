//! `ensure-mesh-trust`: exchange remote secrets with the peer cluster.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use federation::trust::{remote_secret_name, MESH_NAMESPACE};
use federation::{ControlPlane, TrustManager};
use tracing::{info, instrument};

use crate::context::StepContext;
use crate::orchestrator::Step;

/// Mints a reader credential on each cluster and installs it on the other.
pub struct EnsureMeshTrust;

impl EnsureMeshTrust {
    fn manager(ctx: &StepContext, control_plane: &Arc<dyn ControlPlane>) -> TrustManager {
        TrustManager::new(control_plane.clone())
            .with_connector(ctx.credentials.clone())
            .with_cancellation(ctx.cancel.clone())
    }
}

#[async_trait]
impl Step for EnsureMeshTrust {
    fn name(&self) -> &'static str {
        "ensure-mesh-trust"
    }

    fn description(&self) -> &'static str {
        "Establishing cross-cluster mesh trust"
    }

    async fn already_satisfied(&self, ctx: &StepContext) -> Result<bool> {
        let Some(peer) = &ctx.peer else {
            return Ok(false);
        };
        let on_local = ctx
            .local
            .get_secret(MESH_NAMESPACE, &remote_secret_name(ctx.config.peer_name()))
            .await?
            .is_some();
        let on_peer = peer
            .get_secret(MESH_NAMESPACE, &remote_secret_name(ctx.cluster_name()))
            .await?
            .is_some();
        Ok(on_local && on_peer)
    }

    #[instrument(skip_all, fields(cluster = ctx.cluster_name(), peer = ctx.config.peer_name()))]
    async fn execute(&self, ctx: &StepContext) -> Result<()> {
        let local = Self::manager(ctx, &ctx.local);
        let local_bundle = local
            .create_remote_secret(ctx.cluster_name())
            .await
            .with_context(|| format!("Failed to create remote secret on {}", ctx.cluster_name()))?;
        local
            .verify_bundle(&local_bundle)
            .await
            .with_context(|| format!("Reader credential for {} failed verification", ctx.cluster_name()))?;

        let Some(peer_plane) = &ctx.peer else {
            info!(
                peer = ctx.config.peer_name(),
                "Peer cluster not configured, trust exchange deferred"
            );
            return Ok(());
        };

        let peer = Self::manager(ctx, peer_plane);
        let peer_bundle = peer
            .create_remote_secret(ctx.config.peer_name())
            .await
            .with_context(|| {
                format!("Failed to create remote secret on {}", ctx.config.peer_name())
            })?;

        local
            .install_remote_secret(&peer_bundle)
            .await
            .context("Failed to install peer credentials locally")?;
        peer.install_remote_secret(&local_bundle)
            .await
            .context("Failed to install local credentials on peer")?;
        peer.verify_bundle(&peer_bundle).await.with_context(|| {
            format!(
                "Reader credential for {} failed verification",
                ctx.config.peer_name()
            )
        })?;

        info!("Cross-cluster trust established");
        Ok(())
    }
}
