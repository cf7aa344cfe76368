//! Layered infrastructure readiness gate.
//!
//! Once Flux is syncing, the platform converges in layers: the root
//! kustomization has to appear, then the controllers, then the platform
//! foundation, storage and security. [`Waiter::wait_for_infrastructure`]
//! walks those layers strictly in order.
//!
//! Hard gates fail the wait: the root kustomization never appearing, the
//! controllers layer not becoming ready, local-path storage without a ready
//! provisioner or default class, and a missing CephCluster. The platform
//! foundation and security layers, a slow Rook operator and an unbound test
//! claim only record a warning, and the wait moves on.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use federation::resources::CustomResources;
use federation::{poll_with, ClusterError, ControlPlane, PollSpec, Result};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{BootstrapConfig, StorageProvider};
use crate::status::{deployment_ready, is_default_storage_class, pod_phase};
use crate::tooling::ClusterTooling;

/// Rancher local-path-provisioner manifest.
pub const LOCAL_PATH_MANIFEST: &str =
    "https://raw.githubusercontent.com/rancher/local-path-provisioner/v0.0.26/deploy/local-path-storage.yaml";
const LOCAL_PATH_NAMESPACE: &str = "local-path-storage";
const LOCAL_PATH_DEPLOYMENT: &str = "local-path-provisioner";
const LOCAL_PATH_CLASS: &str = "local-path";

const ROOK_NAMESPACE: &str = "rook-ceph";
const ROOK_OPERATOR: &str = "rook-ceph-operator";
const CEPH_CLUSTER: &str = "rook-ceph";
const CEPH_STORAGE_CLASS: &str = "rook-ceph-block";
const PVC_TEST_NAMESPACE: &str = "default";

/// One gate of the readiness sequence, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Layer {
    KustomizationCreation,
    Controllers,
    PlatformFoundation,
    Storage,
    Security,
}

impl Layer {
    /// Every layer, in the order they are evaluated.
    pub const ORDER: [Self; 5] = [
        Self::KustomizationCreation,
        Self::Controllers,
        Self::PlatformFoundation,
        Self::Storage,
        Self::Security,
    ];
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KustomizationCreation => write!(f, "kustomization-creation"),
            Self::Controllers => write!(f, "controllers"),
            Self::PlatformFoundation => write!(f, "platform-foundation"),
            Self::Storage => write!(f, "storage"),
            Self::Security => write!(f, "security"),
        }
    }
}

/// Poll interval and deadline of every layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerTimeoutConfig {
    pub kustomization_creation: PollSpec,
    pub controllers: PollSpec,
    pub platform_foundation: PollSpec,
    pub storage: PollSpec,
    pub security: PollSpec,
    /// Bound on the throwaway claim of the block storage test.
    pub pvc_bind: PollSpec,
}

impl Default for LayerTimeoutConfig {
    fn default() -> Self {
        let five = Duration::from_secs(5);
        Self {
            kustomization_creation: PollSpec::new(Duration::from_secs(2), Duration::from_secs(60)),
            controllers: PollSpec::new(five, Duration::from_secs(600)),
            platform_foundation: PollSpec::new(five, Duration::from_secs(600)),
            storage: PollSpec::new(five, Duration::from_secs(600)),
            security: PollSpec::new(five, Duration::from_secs(300)),
            pvc_bind: PollSpec::new(five, Duration::from_secs(120)),
        }
    }
}

/// Names and provider the gate is parameterised with.
#[derive(Debug, Clone)]
pub struct WaitTargets {
    pub platform_unit: String,
    pub controllers_unit: Option<String>,
    pub security_unit: Option<String>,
    pub storage: StorageProvider,
}

impl WaitTargets {
    /// Targets resolved from configuration.
    #[must_use]
    pub fn from_config(config: &BootstrapConfig) -> Self {
        Self {
            platform_unit: config.platform_unit().to_string(),
            controllers_unit: config.controllers_unit().map(ToString::to_string),
            security_unit: config.security_unit().map(ToString::to_string),
            storage: config.storage(),
        }
    }
}

/// How a layer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerOutcome {
    /// The gating condition held.
    Ready,
    /// Nothing to wait for.
    Skipped,
    /// Soft gate that did not converge in time.
    Warning {
        message: String,
        diagnostics: Vec<String>,
    },
}

/// Outcome of one layer.
#[derive(Debug, Clone)]
pub struct LayerReport {
    pub layer: Layer,
    pub outcome: LayerOutcome,
    pub elapsed: Duration,
}

/// Per-layer outcomes of a successful wait.
#[derive(Debug, Clone, Default)]
pub struct WaitReport {
    pub layers: Vec<LayerReport>,
}

impl WaitReport {
    fn record(&mut self, layer: Layer, outcome: LayerOutcome, started: Instant) {
        let elapsed = started.elapsed();
        match &outcome {
            LayerOutcome::Ready => info!(%layer, elapsed_secs = elapsed.as_secs(), "Layer ready"),
            LayerOutcome::Skipped => debug!(%layer, "Layer skipped"),
            LayerOutcome::Warning { message, .. } => warn!(%layer, %message, "Layer not ready, continuing"),
        }
        self.layers.push(LayerReport {
            layer,
            outcome,
            elapsed,
        });
    }

    /// Layers that ended in a warning.
    pub fn warnings(&self) -> impl Iterator<Item = &LayerReport> {
        self.layers
            .iter()
            .filter(|l| matches!(l.outcome, LayerOutcome::Warning { .. }))
    }

    /// Whether every layer was ready or skipped.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.warnings().next().is_none()
    }
}

/// Drives the readiness gate against one cluster.
pub struct Waiter {
    control_plane: Arc<dyn ControlPlane>,
    targets: WaitTargets,
    timeouts: LayerTimeoutConfig,
    tooling: Option<Arc<dyn ClusterTooling>>,
    cancel: CancellationToken,
}

impl Waiter {
    /// A waiter with default timeouts and no way to install missing storage.
    #[must_use]
    pub fn new(control_plane: Arc<dyn ControlPlane>, targets: WaitTargets) -> Self {
        Self {
            control_plane,
            targets,
            timeouts: LayerTimeoutConfig::default(),
            tooling: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Override layer timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: LayerTimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Tooling used to install local-path-provisioner when it is missing.
    #[must_use]
    pub fn with_tooling(mut self, tooling: Arc<dyn ClusterTooling>) -> Self {
        self.tooling = Some(tooling);
        self
    }

    /// Cancellation observed by every poll loop.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn resources(&self) -> CustomResources<'_, dyn ControlPlane> {
        CustomResources::new(self.control_plane.as_ref())
    }

    /// Walk every layer in order.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the root or controllers kustomization never
    /// appears, `Timeout` when the controllers never become ready, storage
    /// errors that leave the cluster without a usable storage class, and
    /// `Cancelled` when the cancellation token fires.
    #[instrument(skip(self), fields(platform = %self.targets.platform_unit))]
    pub async fn wait_for_infrastructure(&self) -> Result<WaitReport> {
        let mut report = WaitReport::default();

        let started = Instant::now();
        self.wait_for_creation(&self.targets.platform_unit).await?;
        report.record(Layer::KustomizationCreation, LayerOutcome::Ready, started);

        let started = Instant::now();
        let outcome = match &self.targets.controllers_unit {
            Some(name) => {
                self.wait_for_controllers(name).await?;
                LayerOutcome::Ready
            }
            None => LayerOutcome::Skipped,
        };
        report.record(Layer::Controllers, outcome, started);

        let started = Instant::now();
        let outcome = self
            .wait_soft(&self.targets.platform_unit, self.timeouts.platform_foundation)
            .await?;
        report.record(Layer::PlatformFoundation, outcome, started);

        let started = Instant::now();
        let outcome = self.wait_for_storage().await?;
        report.record(Layer::Storage, outcome, started);

        let started = Instant::now();
        let outcome = match &self.targets.security_unit {
            Some(name) => self.wait_soft(name, self.timeouts.security).await?,
            None => LayerOutcome::Skipped,
        };
        report.record(Layer::Security, outcome, started);

        Ok(report)
    }

    async fn kustomization_exists(&self, name: &str) -> Result<bool> {
        Ok(self.resources().kustomization(name).await?.is_some())
    }

    async fn kustomization_ready(&self, name: &str) -> Result<bool> {
        Ok(self
            .resources()
            .kustomization(name)
            .await?
            .is_some_and(|k| k.is_ready()))
    }

    async fn wait_for_creation(&self, name: &str) -> Result<()> {
        let spec = self.timeouts.kustomization_creation;
        info!(kustomization = name, "Waiting for kustomization to be created");

        let this = self;
        let outcome = poll_with(spec, &self.cancel, move || async move {
            this.kustomization_exists(name).await
        })
        .await?;

        if outcome.is_satisfied() {
            return Ok(());
        }

        let diagnostics = self.flux_diagnostics().await;
        log_diagnostics(name, &diagnostics);
        Err(ClusterError::NotFound(outcome.annotate(format!(
            "kustomization '{name}' was not created within {}s ({})",
            spec.timeout.as_secs(),
            diagnostics.join("; ")
        ))))
    }

    async fn wait_for_controllers(&self, name: &str) -> Result<()> {
        if !self.kustomization_exists(name).await? {
            let siblings = self.sibling_diagnostics().await;
            log_diagnostics(name, &siblings);
            return Err(ClusterError::NotFound(format!(
                "controllers kustomization '{name}' does not exist ({})",
                siblings.join("; ")
            )));
        }

        let spec = self.timeouts.controllers;
        info!(kustomization = name, "Waiting for controllers to be ready");
        let this = self;
        let outcome = poll_with(spec, &self.cancel, move || async move {
            this.kustomization_ready(name).await
        })
        .await?;

        if outcome.is_satisfied() {
            return Ok(());
        }

        let diagnostics = self.kustomization_diagnostics(name).await;
        log_diagnostics(name, &diagnostics);
        Err(outcome.into_timeout(
            format!("kustomization '{name}' to become ready"),
            spec.timeout,
        ))
    }

    async fn wait_soft(&self, name: &str, spec: PollSpec) -> Result<LayerOutcome> {
        info!(kustomization = name, "Waiting for kustomization to be ready");
        let this = self;
        let outcome = poll_with(spec, &self.cancel, move || async move {
            this.kustomization_ready(name).await
        })
        .await?;

        if outcome.is_satisfied() {
            return Ok(LayerOutcome::Ready);
        }

        let diagnostics = self.kustomization_diagnostics(name).await;
        log_diagnostics(name, &diagnostics);
        Ok(LayerOutcome::Warning {
            message: outcome.annotate(format!(
                "kustomization '{name}' not ready after {}s",
                spec.timeout.as_secs()
            )),
            diagnostics,
        })
    }

    /// Storage gate for the configured provider.
    ///
    /// # Errors
    ///
    /// Returns an error when no usable storage class can be established.
    pub async fn wait_for_storage(&self) -> Result<LayerOutcome> {
        match self.targets.storage {
            StorageProvider::None => {
                debug!("Storage provider is none, skipping storage checks");
                Ok(LayerOutcome::Skipped)
            }
            StorageProvider::LocalPath => self.wait_for_local_path().await,
            StorageProvider::Ceph => self.wait_for_ceph().await,
        }
    }

    async fn has_default_storage_class(&self) -> Result<bool> {
        Ok(self
            .control_plane
            .list_storage_classes()
            .await?
            .iter()
            .any(is_default_storage_class))
    }

    async fn deployment_available(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self
            .control_plane
            .get_deployment(namespace, name)
            .await?
            .as_ref()
            .is_some_and(deployment_ready))
    }

    async fn wait_for_local_path(&self) -> Result<LayerOutcome> {
        if self.has_default_storage_class().await? {
            info!("Default storage class already present");
            return Ok(LayerOutcome::Ready);
        }

        if self
            .control_plane
            .get_deployment(LOCAL_PATH_NAMESPACE, LOCAL_PATH_DEPLOYMENT)
            .await?
            .is_none()
        {
            self.install_local_path().await?;
        }

        let spec = self.timeouts.storage;
        let this = self;
        let outcome = poll_with(spec, &self.cancel, move || async move {
            this.deployment_available(LOCAL_PATH_NAMESPACE, LOCAL_PATH_DEPLOYMENT)
                .await
        })
        .await?;
        if !outcome.is_satisfied() {
            let diagnostics = self.pod_diagnostics(LOCAL_PATH_NAMESPACE, None).await;
            log_diagnostics(LOCAL_PATH_DEPLOYMENT, &diagnostics);
            return Err(outcome.into_timeout(
                format!("deployment {LOCAL_PATH_NAMESPACE}/{LOCAL_PATH_DEPLOYMENT}"),
                spec.timeout,
            ));
        }

        let outcome = poll_with(spec, &self.cancel, move || async move {
            this.has_default_storage_class().await
        })
        .await?;
        if !outcome.is_satisfied() {
            return Err(ClusterError::NotFound(outcome.annotate(
                "no default storage class after installing local-path-provisioner",
            )));
        }

        info!("Local path storage ready");
        Ok(LayerOutcome::Ready)
    }

    async fn install_local_path(&self) -> Result<()> {
        let Some(tooling) = &self.tooling else {
            return Err(ClusterError::Config(
                "local-path-provisioner is not installed and no tooling is available".to_string(),
            ));
        };

        info!("Installing local-path-provisioner");
        tooling
            .apply_manifest(LOCAL_PATH_MANIFEST)
            .await
            .map_err(|e| ClusterError::Command(format!("{e:#}")))?;
        tooling
            .kubectl(&[
                "patch",
                "storageclass",
                LOCAL_PATH_CLASS,
                "-p",
                r#"{"metadata":{"annotations":{"storageclass.kubernetes.io/is-default-class":"true"}}}"#,
            ])
            .await
            .map_err(|e| ClusterError::Command(format!("{e:#}")))?;
        Ok(())
    }

    async fn wait_for_ceph(&self) -> Result<LayerOutcome> {
        let spec = self.timeouts.storage;
        let this = self;

        info!("Waiting for Rook operator");
        let outcome = poll_with(spec, &self.cancel, move || async move {
            this.deployment_available(ROOK_NAMESPACE, ROOK_OPERATOR).await
        })
        .await?;
        if !outcome.is_satisfied() {
            let diagnostics = self
                .pod_diagnostics(ROOK_NAMESPACE, Some("app=rook-ceph-operator"))
                .await;
            log_diagnostics(ROOK_OPERATOR, &diagnostics);
            return Ok(LayerOutcome::Warning {
                message: outcome.annotate(format!("{ROOK_NAMESPACE}/{ROOK_OPERATOR} not available")),
                diagnostics,
            });
        }

        info!("Waiting for CephCluster");
        let outcome = poll_with(spec, &self.cancel, move || async move {
            Ok(this
                .resources()
                .ceph_cluster(ROOK_NAMESPACE, CEPH_CLUSTER)
                .await?
                .is_some())
        })
        .await?;
        if !outcome.is_satisfied() {
            let diagnostics = self.pod_diagnostics(ROOK_NAMESPACE, None).await;
            log_diagnostics(CEPH_CLUSTER, &diagnostics);
            return Err(ClusterError::NotFound(outcome.annotate(format!(
                "CephCluster {ROOK_NAMESPACE}/{CEPH_CLUSTER} was not created"
            ))));
        }

        self.test_volume_claim().await
    }

    /// Create a claim on the block storage class, wait for it to bind and
    /// delete it whatever happened.
    async fn test_volume_claim(&self) -> Result<LayerOutcome> {
        let name = format!(
            "bootstrap-storage-test-{}",
            chrono::Utc::now().timestamp()
        );
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(PVC_TEST_NAMESPACE.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: Some(CEPH_STORAGE_CLASS.to_string()),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity("1Gi".to_string()),
                    )])),
                    ..VolumeResourceRequirements::default()
                }),
                ..PersistentVolumeClaimSpec::default()
            }),
            ..PersistentVolumeClaim::default()
        };

        info!(claim = %name, "Testing volume provisioning");
        self.control_plane.create_pvc(&claim).await?;

        let bound = self.wait_for_bind(&name).await;

        if let Err(e) = self.control_plane.delete_pvc(PVC_TEST_NAMESPACE, &name).await {
            warn!(claim = %name, error = %e, "Failed to delete storage test claim");
        }

        match bound? {
            None => {
                info!("Storage test claim bound");
                Ok(LayerOutcome::Ready)
            }
            Some(phase) => Ok(LayerOutcome::Warning {
                message: format!(
                    "test claim on {CEPH_STORAGE_CLASS} did not bind (last phase: {phase})"
                ),
                diagnostics: Vec::new(),
            }),
        }
    }

    /// `None` once bound, otherwise the last phase observed.
    async fn wait_for_bind(&self, name: &str) -> Result<Option<String>> {
        let last_phase = std::sync::Mutex::new("Unknown".to_string());
        let slot = &last_phase;
        let this = self;

        let outcome = poll_with(self.timeouts.pvc_bind, &self.cancel, move || async move {
            let phase = this
                .control_plane
                .get_pvc(PVC_TEST_NAMESPACE, name)
                .await?
                .and_then(|c| c.status)
                .and_then(|s| s.phase)
                .unwrap_or_else(|| "Unknown".to_string());
            let bound = phase == "Bound";
            if let Ok(mut guard) = slot.lock() {
                *guard = phase;
            }
            Ok(bound)
        })
        .await?;

        if outcome.is_satisfied() {
            Ok(None)
        } else {
            Ok(Some(last_phase.into_inner().unwrap_or_default()))
        }
    }

    async fn sibling_diagnostics(&self) -> Vec<String> {
        match self.resources().kustomizations().await {
            Ok(list) if list.is_empty() => vec!["no kustomizations in flux-system".to_string()],
            Ok(list) => list.iter().map(federation::ReconcileStatus::summary).collect(),
            Err(e) => vec![format!("failed to list kustomizations: {e}")],
        }
    }

    async fn flux_diagnostics(&self) -> Vec<String> {
        let mut lines = Vec::new();
        match self.control_plane.namespace_exists(federation::resources::FLUX_NAMESPACE).await {
            Ok(true) => {}
            Ok(false) => lines.push("namespace flux-system does not exist".to_string()),
            Err(e) => lines.push(format!("failed to check flux-system: {e}")),
        }
        lines.extend(
            self.pod_diagnostics(federation::resources::FLUX_NAMESPACE, None)
                .await,
        );
        lines.extend(self.sibling_diagnostics().await);
        lines
    }

    async fn kustomization_diagnostics(&self, name: &str) -> Vec<String> {
        let mut lines = match self.resources().kustomization(name).await {
            Ok(Some(status)) => vec![status.summary()],
            Ok(None) => vec![format!("{name}: not found")],
            Err(e) => vec![format!("failed to read kustomization {name}: {e}")],
        };
        lines.extend(self.sibling_diagnostics().await);
        lines
    }

    async fn pod_diagnostics(&self, namespace: &str, selector: Option<&str>) -> Vec<String> {
        match self.control_plane.list_pods(namespace, selector).await {
            Ok(pods) if pods.is_empty() => vec![format!("no pods in {namespace}")],
            Ok(pods) => pods
                .iter()
                .map(|p| {
                    format!(
                        "pod {namespace}/{}: {}",
                        p.metadata.name.as_deref().unwrap_or("unknown"),
                        pod_phase(p)
                    )
                })
                .collect(),
            Err(e) => vec![format!("failed to list pods in {namespace}: {e}")],
        }
    }
}

fn log_diagnostics(subject: &str, lines: &[String]) {
    for line in lines {
        warn!(subject, diagnostic = %line, "Diagnostic");
    }
}
