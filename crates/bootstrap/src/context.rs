//! Everything a bootstrap step needs, built once per run.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use federation::{ControlPlane, CredentialConnector, KubeControlPlane, KubeconfigConnector};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::BootstrapConfig;
use crate::tooling::{CliTooling, ClusterTooling};
use crate::transit::{TransitProvisioner, VaultTransit};

/// Connect to a cluster through an explicit kubeconfig, or the ambient
/// configuration when none is given.
///
/// # Errors
///
/// Returns an error if the kubeconfig cannot be loaded.
pub async fn connect(
    kubeconfig: Option<&Path>,
    context: Option<&str>,
) -> federation::Result<KubeControlPlane> {
    match kubeconfig {
        Some(path) => KubeControlPlane::from_kubeconfig_context(path, context).await,
        None => KubeControlPlane::infer().await,
    }
}

/// Shared state handed to every step.
pub struct StepContext {
    pub config: BootstrapConfig,
    pub local: Arc<dyn ControlPlane>,
    /// The other cluster, when its kubeconfig is configured and loadable.
    pub peer: Option<Arc<dyn ControlPlane>>,
    pub tooling: Arc<dyn ClusterTooling>,
    pub transit: TransitProvisioner,
    /// Opens sessions with minted credentials to check what they grant.
    pub credentials: Arc<dyn CredentialConnector>,
    pub cancel: CancellationToken,
}

impl StepContext {
    /// Context over already connected clients.
    #[must_use]
    pub fn new(
        config: BootstrapConfig,
        local: Arc<dyn ControlPlane>,
        tooling: Arc<dyn ClusterTooling>,
    ) -> Self {
        let transit = TransitProvisioner::for_role(
            config.role.is_secondary(),
            VaultTransit::from_settings(&config.vault, |key| std::env::var(key).ok()),
        );
        Self {
            config,
            local,
            peer: None,
            tooling,
            transit,
            credentials: Arc::new(KubeconfigConnector),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_peer(mut self, peer: Arc<dyn ControlPlane>) -> Self {
        self.peer = Some(peer);
        self
    }

    #[must_use]
    pub fn with_transit(mut self, transit: TransitProvisioner) -> Self {
        self.transit = transit;
        self
    }

    #[must_use]
    pub fn with_credential_connector(mut self, connector: Arc<dyn CredentialConnector>) -> Self {
        self.credentials = connector;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Connect to the local cluster and, if configured, the peer.
    ///
    /// An unreachable peer is not an error; trust exchange is deferred.
    ///
    /// # Errors
    ///
    /// Returns an error if the local cluster's kubeconfig cannot be loaded.
    pub async fn connect(config: BootstrapConfig) -> Result<Self> {
        let kubeconfig = config.cluster.kubeconfig.clone();
        let context = config.cluster.context.clone();

        let local = connect(kubeconfig.as_deref(), context.as_deref())
            .await
            .with_context(|| format!("Failed to connect to {} cluster", config.cluster_name()))?;
        info!(cluster = config.cluster_name(), api = %local.api_server_url(), "Connected");

        let tooling = Arc::new(CliTooling::new(kubeconfig, context));
        let peer_kubeconfig = config.peer.kubeconfig.clone();
        let mut ctx = Self::new(config, Arc::new(local), tooling);

        if let Some(path) = peer_kubeconfig {
            match KubeControlPlane::from_kubeconfig(&path).await {
                Ok(peer) => ctx = ctx.with_peer(Arc::new(peer)),
                Err(e) => warn!(path = %path.display(), error = %e, "Peer cluster unavailable"),
            }
        }
        Ok(ctx)
    }

    /// Local cluster name.
    #[must_use]
    pub fn cluster_name(&self) -> &str {
        self.config.cluster_name()
    }
}
