//! Bootstrap configuration.
//!
//! One YAML document per cluster role, overlaid with environment overrides.
//! Anything left unset falls back to the defaults of the role.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::waiter::LayerTimeoutConfig;

/// Which of the two federated clusters is being bootstrapped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterRole {
    /// The main homelab cluster.
    #[default]
    #[serde(alias = "homelab")]
    Primary,
    /// The NAS cluster.
    #[serde(alias = "nas")]
    Secondary,
}

impl ClusterRole {
    /// Cluster name used for discovery records and trust bundles.
    #[must_use]
    pub fn cluster_name(self) -> &'static str {
        match self {
            Self::Primary => "homelab",
            Self::Secondary => "nas",
        }
    }

    /// Name of the other cluster in the federation.
    #[must_use]
    pub fn peer(self) -> Self {
        match self {
            Self::Primary => Self::Secondary,
            Self::Secondary => Self::Primary,
        }
    }

    /// Whether this is the NAS side.
    #[must_use]
    pub fn is_secondary(self) -> bool {
        matches!(self, Self::Secondary)
    }
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

impl FromStr for ClusterRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "primary" | "homelab" => Ok(Self::Primary),
            "secondary" | "nas" => Ok(Self::Secondary),
            _ => Err(anyhow::anyhow!("Unknown cluster role: {s}")),
        }
    }
}

/// Backing storage the readiness gate checks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageProvider {
    /// Rook-Ceph block storage.
    #[serde(alias = "rook-ceph")]
    Ceph,
    /// Rancher local-path-provisioner.
    LocalPath,
    /// No storage check.
    None,
}

impl fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ceph => write!(f, "ceph"),
            Self::LocalPath => write!(f, "local-path"),
            Self::None => write!(f, "none"),
        }
    }
}

impl FromStr for StorageProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ceph" | "rook-ceph" => Ok(Self::Ceph),
            "local-path" | "localpath" => Ok(Self::LocalPath),
            "none" => Ok(Self::None),
            _ => Err(anyhow::anyhow!("Unknown storage provider: {s}")),
        }
    }
}

/// Connection settings for the cluster being bootstrapped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Cluster name; defaults to the role's name.
    pub name: Option<String>,
    /// Path to the kubeconfig; `None` infers from the environment.
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig context to use.
    pub context: Option<String>,
    /// Number of nodes `wait-nodes` expects; `None` accepts any non-zero count.
    pub expected_nodes: Option<usize>,
    /// Pod CIDR handed to Cilium.
    pub pod_cidr: Option<String>,
}

/// The GitOps source Flux is pointed at.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitOpsSettings {
    /// Repository URL.
    pub repository: String,
    /// Branch to track.
    pub branch: String,
    /// Path of the cluster's root kustomization; defaults per role.
    pub path: Option<String>,
    /// Token for private repositories.
    #[serde(skip_serializing)]
    pub token: Option<String>,
    /// Flux install manifest.
    pub install_manifest: String,
}

impl Default for GitOpsSettings {
    fn default() -> Self {
        Self {
            repository: "https://github.com/fredericrous/homelab".to_string(),
            branch: "main".to_string(),
            path: None,
            token: None,
            install_manifest: crate::steps::flux::FLUX_INSTALL_MANIFEST.to_string(),
        }
    }
}

/// Per-layer timeout overrides, in seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutOverrides {
    pub kustomization_creation: Option<u64>,
    pub controllers: Option<u64>,
    pub platform_foundation: Option<u64>,
    pub storage: Option<u64>,
    pub security: Option<u64>,
    pub pvc_bind: Option<u64>,
}

impl TimeoutOverrides {
    /// Apply the overrides on top of `base`, keeping its poll intervals.
    #[must_use]
    pub fn apply(&self, base: LayerTimeoutConfig) -> LayerTimeoutConfig {
        let secs = |value: Option<u64>, default: Duration| value.map_or(default, Duration::from_secs);
        let mut out = base;
        out.kustomization_creation.timeout =
            secs(self.kustomization_creation, base.kustomization_creation.timeout);
        out.controllers.timeout = secs(self.controllers, base.controllers.timeout);
        out.platform_foundation.timeout =
            secs(self.platform_foundation, base.platform_foundation.timeout);
        out.storage.timeout = secs(self.storage, base.storage.timeout);
        out.security.timeout = secs(self.security, base.security.timeout);
        out.pvc_bind.timeout = secs(self.pvc_bind, base.pvc_bind.timeout);
        out
    }
}

/// Reconciliation units and storage the readiness gate waits for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InfrastructureSettings {
    /// Platform foundation kustomization.
    pub platform_unit: Option<String>,
    /// Controllers kustomization; an empty string disables the layer.
    pub controllers_unit: Option<String>,
    /// Optional security kustomization.
    pub security_unit: Option<String>,
    /// Storage provider.
    pub storage: Option<StorageProvider>,
    /// Timeout overrides.
    pub timeouts: TimeoutOverrides,
}

/// The other cluster of the federation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSettings {
    /// Peer cluster name; defaults to the other role's name.
    pub name: Option<String>,
    /// Kubeconfig for the peer; trust exchange is deferred without one.
    pub kubeconfig: Option<PathBuf>,
}

/// Health aggregation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Fraction of probes in warning above which the cluster is in warning.
    pub warning_ratio: f64,
    /// Name the `dns` probe resolves.
    pub dns_name: String,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            warning_ratio: 0.5,
            dns_name: crate::health::CLUSTER_DNS_NAME.to_string(),
        }
    }
}

/// East-west gateway publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSettings {
    /// Whether `finalize-mesh` does anything.
    pub enabled: bool,
    /// Hosts advertised when the gateway only exposes a node port; the first
    /// node address is used when empty.
    pub gateway_fallbacks: Vec<String>,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            gateway_fallbacks: Vec::new(),
        }
    }
}

/// Vault credentials used on the primary to mint the transit token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultSettings {
    /// Explicit address of the NAS Vault.
    pub address: Option<String>,
    /// Root token; never written back out.
    #[serde(skip_serializing)]
    pub token: Option<String>,
}

/// Complete configuration for one bootstrap run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Cluster role.
    pub role: ClusterRole,
    /// Local cluster connection.
    pub cluster: ClusterSettings,
    /// GitOps source.
    pub gitops: GitOpsSettings,
    /// Readiness gate.
    pub infrastructure: InfrastructureSettings,
    /// Peer cluster for trust exchange.
    pub peer: PeerSettings,
    /// Health aggregation.
    pub health: HealthSettings,
    /// Service mesh gateway.
    pub mesh: MeshSettings,
    /// Vault transit.
    pub vault: VaultSettings,
    /// Repository checkout holding `.env` and kubeconfigs; discovered if unset.
    pub project_root: Option<PathBuf>,
}

impl BootstrapConfig {
    /// Role defaults with nothing overridden.
    #[must_use]
    pub fn for_role(role: ClusterRole) -> Self {
        Self {
            role,
            ..Self::default()
        }
    }

    /// Load the configuration for `role`.
    ///
    /// Uses `explicit` if given, otherwise the first existing file from
    /// [`config_candidates`], otherwise role defaults. Environment overrides
    /// are applied last.
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file exists but cannot be parsed,
    /// or if an explicit path does not exist.
    pub fn load(role: ClusterRole, explicit: Option<&Path>) -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to resolve current directory")?;

        let path = match explicit {
            Some(path) => {
                anyhow::ensure!(path.exists(), "Config file not found: {}", path.display());
                Some(path.to_path_buf())
            }
            None => config_candidates(role, &cwd, dirs::config_dir().as_deref())
                .into_iter()
                .find(|p| p.exists()),
        };

        let mut config = match path {
            Some(path) => {
                info!(path = %path.display(), "Loading configuration");
                Self::from_file(&path)?
            }
            None => {
                debug!(%role, "No configuration file found, using role defaults");
                Self::for_role(role)
            }
        };

        config.role = role;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        if config.project_root.is_none() {
            config.project_root = find_project_root(&cwd);
        }
        Ok(config)
    }

    /// Parse a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let (local_key, peer_key) = match self.role {
            ClusterRole::Primary => ("HOMELAB_KUBECONFIG_PATH", "NAS_KUBECONFIG_PATH"),
            ClusterRole::Secondary => ("NAS_KUBECONFIG_PATH", "HOMELAB_KUBECONFIG_PATH"),
        };
        if let Some(path) = non_empty(local_key) {
            self.cluster.kubeconfig = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty(peer_key) {
            self.peer.kubeconfig = Some(PathBuf::from(path));
        }
        if let Some(token) = non_empty("GITHUB_TOKEN") {
            self.gitops.token = Some(token);
        }
        if let Some(token) = non_empty("VAULT_TOKEN") {
            self.vault.token = Some(token);
        }
    }

    /// Local cluster name.
    #[must_use]
    pub fn cluster_name(&self) -> &str {
        self.cluster
            .name
            .as_deref()
            .unwrap_or_else(|| self.role.cluster_name())
    }

    /// Peer cluster name.
    #[must_use]
    pub fn peer_name(&self) -> &str {
        self.peer
            .name
            .as_deref()
            .unwrap_or_else(|| self.role.peer().cluster_name())
    }

    /// Platform foundation kustomization.
    #[must_use]
    pub fn platform_unit(&self) -> &str {
        self.infrastructure
            .platform_unit
            .as_deref()
            .unwrap_or(match self.role {
                ClusterRole::Primary => "platform-foundation",
                ClusterRole::Secondary => "nas-platform-foundation",
            })
    }

    /// Controllers kustomization, `None` when the layer is disabled.
    #[must_use]
    pub fn controllers_unit(&self) -> Option<&str> {
        match self.infrastructure.controllers_unit.as_deref() {
            Some("") => None,
            Some(name) => Some(name),
            None => match self.role {
                ClusterRole::Primary => Some("controllers"),
                ClusterRole::Secondary => None,
            },
        }
    }

    /// Security kustomization, if configured.
    #[must_use]
    pub fn security_unit(&self) -> Option<&str> {
        self.infrastructure
            .security_unit
            .as_deref()
            .filter(|s| !s.is_empty())
    }

    /// Storage provider.
    #[must_use]
    pub fn storage(&self) -> StorageProvider {
        self.infrastructure.storage.unwrap_or(match self.role {
            ClusterRole::Primary => StorageProvider::Ceph,
            ClusterRole::Secondary => StorageProvider::LocalPath,
        })
    }

    /// Layer timeouts with overrides applied.
    #[must_use]
    pub fn layer_timeouts(&self) -> LayerTimeoutConfig {
        self.infrastructure
            .timeouts
            .apply(LayerTimeoutConfig::default())
    }

    /// Cluster-vars keys holding this cluster's gateway address and port.
    #[must_use]
    pub fn gateway_var_keys(&self) -> (&'static str, &'static str) {
        gateway_var_keys(self.role)
    }

    /// Cluster-vars keys holding the peer's gateway address and port.
    #[must_use]
    pub fn peer_gateway_var_keys(&self) -> (&'static str, &'static str) {
        gateway_var_keys(self.role.peer())
    }

    /// Kustomizations nudged once gateway variables change.
    #[must_use]
    pub fn mesh_reconcile_units(&self) -> Vec<&str> {
        let mut units: Vec<&str> = self.controllers_unit().into_iter().collect();
        units.push(self.platform_unit());
        units
    }

    /// Path inside the repository Flux reconciles from.
    #[must_use]
    pub fn gitops_path(&self) -> &str {
        self.gitops.path.as_deref().unwrap_or(match self.role {
            ClusterRole::Primary => "./clusters/homelab",
            ClusterRole::Secondary => "./clusters/nas",
        })
    }

    /// Pod CIDR handed to Cilium.
    #[must_use]
    pub fn pod_cidr(&self) -> &str {
        self.cluster.pod_cidr.as_deref().unwrap_or("10.244.0.0/16")
    }

    /// Repository root, falling back to the current directory.
    #[must_use]
    pub fn project_root(&self) -> PathBuf {
        self.project_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn gateway_var_keys(role: ClusterRole) -> (&'static str, &'static str) {
    match role {
        ClusterRole::Primary => ("HOMELAB_EW_GATEWAY_ADDR", "HOMELAB_EW_GATEWAY_PORT"),
        ClusterRole::Secondary => ("NAS_EW_GATEWAY_ADDR", "NAS_EW_GATEWAY_PORT"),
    }
}

/// Configuration files tried for `role`, in order.
#[must_use]
pub fn config_candidates(role: ClusterRole, cwd: &Path, config_dir: Option<&Path>) -> Vec<PathBuf> {
    let file = format!("{}.yaml", role.cluster_name());
    let mut candidates = vec![
        cwd.join("bootstrap").join("configs").join(&file),
        cwd.join("configs").join(&file),
    ];
    if let Some(dir) = config_dir {
        candidates.push(dir.join("homelab").join(&file));
    }
    candidates.push(Path::new("/etc/homelab").join(&file));
    candidates
}

/// Walk up from `start` to the first directory containing `.git` or a
/// `bootstrap` directory.
#[must_use]
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists() || dir.join("bootstrap").is_dir())
        .map(Path::to_path_buf)
}
