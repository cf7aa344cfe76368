//! Finding the clusters this one should federate with.
//!
//! Several independent [`DiscoveryStrategy`] implementations run
//! concurrently; their results are merged once all of them have finished,
//! keyed by cluster name with the first reported record winning.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use crate::cluster::ControlPlane;
use crate::error::{ClusterError, Result};
use crate::kube_client::KubeControlPlane;
use crate::kubeconfig::current_server_from_file;
use crate::resources::{labels, FLUX_NAMESPACE};

/// Name of the registry config map in `flux-system`.
pub const DISCOVERY_CONFIG_MAP: &str = "cluster-discovery";

/// Label carried by services that front a remote cluster.
pub const MESH_SERVICE_SELECTOR: &str = "istio/multiCluster=true";

/// Port the Kubernetes API server listens on.
pub const API_SERVER_PORT: u16 = 6443;

/// Where a [`ClusterRecord`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoverySource {
    KubeconfigFile,
    Registry,
    MeshService,
    NetworkScan,
}

/// A cluster found by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRecord {
    pub name: String,
    pub api_server_url: String,
    pub network_label: String,
    pub is_secondary: bool,
    /// Kubeconfig that reaches the cluster, when one is known.
    pub credential_ref: Option<PathBuf>,
    pub source: DiscoverySource,
}

impl ClusterRecord {
    fn new(name: &str, api_server_url: String, is_secondary: bool, source: DiscoverySource) -> Self {
        Self {
            name: name.to_string(),
            api_server_url,
            network_label: network_label(is_secondary).to_string(),
            is_secondary,
            credential_ref: None,
            source,
        }
    }
}

/// Mesh network label for a cluster.
#[must_use]
pub fn network_label(is_secondary: bool) -> &'static str {
    if is_secondary {
        "nas-network"
    } else {
        "homelab-network"
    }
}

/// One way of locating clusters.
///
/// A strategy reports every cluster it can see. Errors are allowed and are
/// treated by [`ClusterDiscovery`] as "found nothing".
#[async_trait]
pub trait DiscoveryStrategy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Run the strategy once.
    async fn discover(&self) -> Result<Vec<ClusterRecord>>;
}

/// A kubeconfig path and the cluster it is expected to reach.
#[derive(Debug, Clone)]
pub struct KubeconfigCandidate {
    pub name: String,
    pub path: PathBuf,
    pub is_secondary: bool,
}

impl KubeconfigCandidate {
    fn new(name: &str, path: PathBuf, is_secondary: bool) -> Self {
        Self {
            name: name.to_string(),
            path,
            is_secondary,
        }
    }
}

/// Probes well-known kubeconfig files.
pub struct KubeconfigFileStrategy {
    candidates: Vec<KubeconfigCandidate>,
    verify: bool,
}

impl KubeconfigFileStrategy {
    /// Strategy over an explicit candidate list.
    ///
    /// With `verify` set, a candidate only counts if its API server answers.
    #[must_use]
    pub fn new(candidates: Vec<KubeconfigCandidate>, verify: bool) -> Self {
        Self { candidates, verify }
    }

    /// The usual locations under a repository root, the user's
    /// `~/.kube/config`, and the `HOMELAB_KUBECONFIG_PATH` /
    /// `NAS_KUBECONFIG_PATH` overrides.
    #[must_use]
    pub fn well_known(project_root: &Path) -> Self {
        let mut candidates = vec![
            KubeconfigCandidate::new("homelab", project_root.join("kubeconfig"), false),
            KubeconfigCandidate::new(
                "nas",
                project_root.join("infrastructure/nas/kubeconfig.yaml"),
                true,
            ),
            KubeconfigCandidate::new("nas", project_root.join("infrastructure/nas/kubeconfig"), true),
        ];
        if let Some(home) = dirs::home_dir() {
            candidates.push(KubeconfigCandidate::new("default", home.join(".kube/config"), false));
        }
        if let Ok(path) = std::env::var("HOMELAB_KUBECONFIG_PATH") {
            if !path.is_empty() {
                candidates.push(KubeconfigCandidate::new("homelab", PathBuf::from(path), false));
            }
        }
        if let Ok(path) = std::env::var("NAS_KUBECONFIG_PATH") {
            if !path.is_empty() {
                candidates.push(KubeconfigCandidate::new("nas", PathBuf::from(path), true));
            }
        }
        Self::new(candidates, true)
    }

    /// Candidates this strategy will look at.
    #[must_use]
    pub fn candidates(&self) -> &[KubeconfigCandidate] {
        &self.candidates
    }

    async fn probe(&self, candidate: &KubeconfigCandidate) -> Result<ClusterRecord> {
        let server = current_server_from_file(&candidate.path)?;
        if self.verify {
            let control_plane = KubeControlPlane::from_kubeconfig(&candidate.path).await?;
            control_plane.server_version().await?;
        }
        let mut record = ClusterRecord::new(
            &candidate.name,
            server,
            candidate.is_secondary,
            DiscoverySource::KubeconfigFile,
        );
        record.credential_ref = Some(candidate.path.clone());
        Ok(record)
    }
}

#[async_trait]
impl DiscoveryStrategy for KubeconfigFileStrategy {
    fn name(&self) -> &'static str {
        "kubeconfig"
    }

    async fn discover(&self) -> Result<Vec<ClusterRecord>> {
        let mut found = Vec::new();
        for candidate in &self.candidates {
            if !candidate.path.exists() {
                continue;
            }
            match self.probe(candidate).await {
                Ok(record) => {
                    debug!(name = %record.name, path = %candidate.path.display(), "Found cluster via kubeconfig");
                    found.push(record);
                }
                Err(e) => {
                    debug!(path = %candidate.path.display(), error = %e, "Kubeconfig candidate unusable");
                }
            }
        }
        Ok(found)
    }
}

/// Reads the registry config map other clusters publish into.
pub struct RegistryStrategy {
    control_plane: Arc<dyn ControlPlane>,
}

impl RegistryStrategy {
    #[must_use]
    pub fn new(control_plane: Arc<dyn ControlPlane>) -> Self {
        Self { control_plane }
    }
}

/// Parse one registry entry of the form `apiServer,network,isSecondary`.
fn parse_registry_entry(name: &str, value: &str) -> Option<ClusterRecord> {
    let mut parts = value.split(',').map(str::trim);
    let api_server_url = parts.next().filter(|s| !s.is_empty())?;
    let network = parts.next()?;
    let is_secondary = parts.next()? == "true";
    Some(ClusterRecord {
        name: name.to_string(),
        api_server_url: api_server_url.to_string(),
        network_label: network.to_string(),
        is_secondary,
        credential_ref: None,
        source: DiscoverySource::Registry,
    })
}

#[async_trait]
impl DiscoveryStrategy for RegistryStrategy {
    fn name(&self) -> &'static str {
        "registry"
    }

    async fn discover(&self) -> Result<Vec<ClusterRecord>> {
        let Some(config_map) = self
            .control_plane
            .get_config_map(FLUX_NAMESPACE, DISCOVERY_CONFIG_MAP)
            .await?
        else {
            return Ok(Vec::new());
        };

        Ok(config_map
            .data
            .unwrap_or_default()
            .iter()
            .filter_map(|(name, value)| {
                let record = parse_registry_entry(name, value);
                if record.is_none() {
                    debug!(name = %name, "Ignoring malformed registry entry");
                }
                record
            })
            .collect())
    }
}

/// Looks for services labelled as cross-cluster mesh endpoints.
pub struct MeshServiceStrategy {
    control_plane: Arc<dyn ControlPlane>,
}

impl MeshServiceStrategy {
    #[must_use]
    pub fn new(control_plane: Arc<dyn ControlPlane>) -> Self {
        Self { control_plane }
    }
}

#[async_trait]
impl DiscoveryStrategy for MeshServiceStrategy {
    fn name(&self) -> &'static str {
        "mesh-services"
    }

    async fn discover(&self) -> Result<Vec<ClusterRecord>> {
        let services = self.control_plane.list_services(MESH_SERVICE_SELECTOR).await?;

        Ok(services
            .iter()
            .filter_map(|svc| {
                let labels = svc.metadata.labels.as_ref()?;
                let name = labels.get("cluster").filter(|n| !n.is_empty())?;
                let cluster_ip = svc.spec.as_ref()?.cluster_ip.as_deref()?;
                Some(ClusterRecord {
                    name: name.clone(),
                    api_server_url: format!("https://{cluster_ip}"),
                    network_label: labels.get("network").cloned().unwrap_or_default(),
                    is_secondary: name == "nas",
                    credential_ref: None,
                    source: DiscoverySource::MeshService,
                })
            })
            .collect())
    }
}

/// Host offset within the local /24 and the cluster expected there.
#[derive(Debug, Clone)]
pub struct ScanTarget {
    pub host: u8,
    pub name: String,
    pub is_secondary: bool,
}

/// TCP-probes a few fixed addresses on the local /24 for an API server.
pub struct NetworkScanStrategy {
    prefix: Option<[u8; 3]>,
    targets: Vec<ScanTarget>,
    port: u16,
    connect_timeout: Duration,
}

impl Default for NetworkScanStrategy {
    fn default() -> Self {
        Self {
            prefix: None,
            targets: vec![
                ScanTarget {
                    host: 42,
                    name: "nas".to_string(),
                    is_secondary: true,
                },
                ScanTarget {
                    host: 67,
                    name: "homelab".to_string(),
                    is_secondary: false,
                },
                ScanTarget {
                    host: 100,
                    name: "cluster".to_string(),
                    is_secondary: false,
                },
            ],
            port: API_SERVER_PORT,
            connect_timeout: Duration::from_secs(2),
        }
    }
}

impl NetworkScanStrategy {
    /// Scan a fixed network prefix instead of the one of the local address.
    #[must_use]
    pub fn with_prefix(mut self, prefix: [u8; 3]) -> Self {
        self.prefix = Some(prefix);
        self
    }

    #[must_use]
    pub fn with_targets(mut self, targets: Vec<ScanTarget>) -> Self {
        self.targets = targets;
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    async fn local_prefix(&self) -> Option<[u8; 3]> {
        if let Some(prefix) = self.prefix {
            return Some(prefix);
        }
        // Connecting a UDP socket only selects a route; nothing is sent.
        let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
        socket.connect("8.8.8.8:80").await.ok()?;
        match socket.local_addr().ok()?.ip() {
            IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => {
                let [a, b, c, _] = ip.octets();
                Some([a, b, c])
            }
            _ => None,
        }
    }

    async fn port_open(&self, addr: SocketAddr) -> bool {
        matches!(
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

#[async_trait]
impl DiscoveryStrategy for NetworkScanStrategy {
    fn name(&self) -> &'static str {
        "network-scan"
    }

    async fn discover(&self) -> Result<Vec<ClusterRecord>> {
        let Some([a, b, c]) = self.local_prefix().await else {
            debug!("No local IPv4 address, skipping network scan");
            return Ok(Vec::new());
        };

        let probes = self.targets.iter().map(|target| async move {
            let ip = Ipv4Addr::new(a, b, c, target.host);
            let open = self.port_open(SocketAddr::from((ip, self.port))).await;
            (target, ip, open)
        });

        let mut found = Vec::new();
        for (target, ip, open) in futures::future::join_all(probes).await {
            if open {
                debug!(name = %target.name, %ip, "Found cluster via network scan");
                found.push(ClusterRecord::new(
                    &target.name,
                    format!("https://{ip}:{}", self.port),
                    target.is_secondary,
                    DiscoverySource::NetworkScan,
                ));
            }
        }
        Ok(found)
    }
}

/// Runs every strategy and keeps the merged result for later lookups.
pub struct ClusterDiscovery {
    strategies: Vec<Arc<dyn DiscoveryStrategy>>,
    per_strategy_timeout: Duration,
    discovered: Mutex<BTreeMap<String, ClusterRecord>>,
}

impl ClusterDiscovery {
    /// Discovery over an explicit strategy set.
    #[must_use]
    pub fn new(strategies: Vec<Arc<dyn DiscoveryStrategy>>) -> Self {
        Self {
            strategies,
            per_strategy_timeout: Duration::from_secs(30),
            discovered: Mutex::new(BTreeMap::new()),
        }
    }

    /// The four standard strategies. Without a local control plane only the
    /// file and network strategies run.
    #[must_use]
    pub fn standard(project_root: &Path, local: Option<Arc<dyn ControlPlane>>) -> Self {
        let mut strategies: Vec<Arc<dyn DiscoveryStrategy>> =
            vec![Arc::new(KubeconfigFileStrategy::well_known(project_root))];
        if let Some(cp) = local {
            strategies.push(Arc::new(RegistryStrategy::new(Arc::clone(&cp))));
            strategies.push(Arc::new(MeshServiceStrategy::new(cp)));
        }
        strategies.push(Arc::new(NetworkScanStrategy::default()));
        Self::new(strategies)
    }

    /// Upper bound on any single strategy's run time.
    #[must_use]
    pub fn with_strategy_timeout(mut self, timeout: Duration) -> Self {
        self.per_strategy_timeout = timeout;
        self
    }

    /// Run all strategies concurrently and merge their results.
    ///
    /// Records are unique by name; when two strategies report the same name,
    /// the one that finished first wins. Strategy failures contribute no
    /// records and are never returned as errors.
    pub async fn discover_clusters(&self) -> Vec<ClusterRecord> {
        info!(strategies = self.strategies.len(), "Starting cluster discovery");

        let mut running: FuturesUnordered<_> = self
            .strategies
            .iter()
            .map(|strategy| {
                let timeout = self.per_strategy_timeout;
                async move {
                    let outcome = tokio::time::timeout(timeout, strategy.discover()).await;
                    (strategy.name(), outcome)
                }
            })
            .collect();

        let mut batches = Vec::with_capacity(self.strategies.len());
        while let Some((name, outcome)) = running.next().await {
            match outcome {
                Ok(Ok(records)) => {
                    debug!(strategy = name, found = records.len(), "Discovery strategy finished");
                    batches.push(records);
                }
                Ok(Err(e)) => debug!(strategy = name, error = %e, "Discovery strategy failed"),
                Err(_) => debug!(strategy = name, "Discovery strategy timed out"),
            }
        }

        let mut merged: Vec<ClusterRecord> = Vec::new();
        for record in batches.into_iter().flatten() {
            if merged.iter().all(|r| r.name != record.name) {
                merged.push(record);
            }
        }

        {
            let mut cache = match self.discovered.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            for record in &merged {
                cache.insert(record.name.clone(), record.clone());
            }
        }

        info!(found = merged.len(), "Cluster discovery completed");
        merged
    }

    /// A previously discovered cluster, as reported by the latest run that
    /// saw it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no discovery run has reported `name`.
    pub fn get_cluster(&self, name: &str) -> Result<ClusterRecord> {
        let cache = match self.discovered.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("cluster {name} not discovered")))
    }
}

fn node_address(nodes: &[Node]) -> Option<String> {
    let addresses = |kind: &str| {
        nodes.iter().find_map(|node| {
            node.status
                .as_ref()?
                .addresses
                .as_ref()?
                .iter()
                .find(|a| a.type_ == kind)
                .map(|a| a.address.clone())
        })
    };
    addresses("ExternalIP").or_else(|| addresses("InternalIP"))
}

/// Publish this cluster's reachability into its own registry config map.
///
/// Only the entry for `local_name` is written; entries for other clusters
/// are preserved.
///
/// # Errors
///
/// Returns an error if nodes cannot be listed, no node has an address, or
/// the config map cannot be written.
pub async fn store_discovery_info(
    control_plane: &dyn ControlPlane,
    local_name: &str,
    is_secondary: bool,
) -> Result<ClusterRecord> {
    let nodes = control_plane.list_nodes().await?;
    if nodes.is_empty() {
        return Err(ClusterError::NotFound("no nodes in cluster".to_string()));
    }
    let ip = node_address(&nodes)
        .ok_or_else(|| ClusterError::NotFound("no node has an IP address".to_string()))?;

    let record = ClusterRecord::new(
        local_name,
        format!("https://{ip}:{API_SERVER_PORT}"),
        is_secondary,
        DiscoverySource::Registry,
    );
    let entry = format!(
        "{},{},{}",
        record.api_server_url, record.network_label, record.is_secondary
    );

    let existing = control_plane
        .get_config_map(FLUX_NAMESPACE, DISCOVERY_CONFIG_MAP)
        .await?;
    let mut data = existing.and_then(|cm| cm.data).unwrap_or_default();
    data.insert(local_name.to_string(), entry);

    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(DISCOVERY_CONFIG_MAP.to_string()),
            namespace: Some(FLUX_NAMESPACE.to_string()),
            labels: Some(labels([
                ("app.kubernetes.io/name", "cluster-discovery"),
                ("app.kubernetes.io/part-of", "bootstrap"),
            ])),
            ..ObjectMeta::default()
        },
        data: Some(data),
        ..ConfigMap::default()
    };
    control_plane.apply_config_map(&config_map).await.map_err(|e| {
        warn!(error = %e, "Failed to store discovery info");
        e
    })?;

    info!(cluster = local_name, %ip, "Stored cluster discovery info");
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeControlPlane;
    use k8s_openapi::api::core::v1::{Service, ServiceSpec};
    use std::io::Write as _;

    struct Fixed {
        name: &'static str,
        delay: Duration,
        records: Vec<ClusterRecord>,
    }

    #[async_trait]
    impl DiscoveryStrategy for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn discover(&self) -> Result<Vec<ClusterRecord>> {
            tokio::time::sleep(self.delay).await;
            Ok(self.records.clone())
        }
    }

    struct Failing;

    #[async_trait]
    impl DiscoveryStrategy for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn discover(&self) -> Result<Vec<ClusterRecord>> {
            Err(ClusterError::Connectivity("boom".to_string()))
        }
    }

    fn record(name: &str, url: &str, source: DiscoverySource) -> ClusterRecord {
        ClusterRecord::new(name, url.to_string(), name == "nas", source)
    }

    fn write_kubeconfig(dir: &Path, rel: &str, server: &str) -> PathBuf {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            "apiVersion: v1\nkind: Config\nclusters:\n  - name: c\n    cluster:\n      server: {server}\n"
        )
        .unwrap();
        path
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_keeps_first_finisher() {
        let slow = Fixed {
            name: "slow",
            delay: Duration::from_secs(5),
            records: vec![record("nas", "https://slow:6443", DiscoverySource::NetworkScan)],
        };
        let fast = Fixed {
            name: "fast",
            delay: Duration::from_secs(1),
            records: vec![
                record("nas", "https://fast:6443", DiscoverySource::Registry),
                record("homelab", "https://h:6443", DiscoverySource::Registry),
            ],
        };
        let discovery = ClusterDiscovery::new(vec![Arc::new(slow), Arc::new(fast)]);

        let clusters = discovery.discover_clusters().await;

        assert_eq!(clusters.len(), 2);
        let nas = clusters.iter().find(|c| c.name == "nas").unwrap();
        assert_eq!(nas.api_server_url, "https://fast:6443");
        assert_eq!(discovery.get_cluster("nas").unwrap().source, DiscoverySource::Registry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_and_hung_strategies_are_non_fatal() {
        let hung = Fixed {
            name: "hung",
            delay: Duration::from_secs(3600),
            records: vec![record("ghost", "https://ghost", DiscoverySource::NetworkScan)],
        };
        let ok = Fixed {
            name: "ok",
            delay: Duration::ZERO,
            records: vec![record("homelab", "https://h:6443", DiscoverySource::Registry)],
        };
        let discovery = ClusterDiscovery::new(vec![Arc::new(Failing), Arc::new(hung), Arc::new(ok)])
            .with_strategy_timeout(Duration::from_secs(10));

        let clusters = discovery.discover_clusters().await;

        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].name, "homelab");
        assert!(discovery.get_cluster("ghost").unwrap_err().is_not_found());
    }

    struct Moving {
        url: Mutex<&'static str>,
    }

    #[async_trait]
    impl DiscoveryStrategy for Moving {
        fn name(&self) -> &'static str {
            "moving"
        }

        async fn discover(&self) -> Result<Vec<ClusterRecord>> {
            let url = *self.url.lock().unwrap();
            Ok(vec![record("nas", url, DiscoverySource::Registry)])
        }
    }

    #[tokio::test]
    async fn test_rerun_replaces_cached_record() {
        let moving = Arc::new(Moving {
            url: Mutex::new("https://192.168.1.42:6443"),
        });
        let discovery = ClusterDiscovery::new(vec![Arc::clone(&moving) as Arc<dyn DiscoveryStrategy>]);

        discovery.discover_clusters().await;
        assert_eq!(
            discovery.get_cluster("nas").unwrap().api_server_url,
            "https://192.168.1.42:6443"
        );

        *moving.url.lock().unwrap() = "https://192.168.1.50:6443";
        discovery.discover_clusters().await;

        assert_eq!(
            discovery.get_cluster("nas").unwrap().api_server_url,
            "https://192.168.1.50:6443"
        );
    }

    #[tokio::test]
    async fn test_all_strategies_failing_yields_empty() {
        let discovery = ClusterDiscovery::new(vec![Arc::new(Failing), Arc::new(Failing)]);
        assert!(discovery.discover_clusters().await.is_empty());
    }

    #[tokio::test]
    async fn test_kubeconfig_candidates_with_shared_name_dedupe() {
        let dir = tempfile::tempdir().unwrap();
        let homelab = write_kubeconfig(dir.path(), "kubeconfig", "https://192.168.1.67:6443");
        let nas_yaml = write_kubeconfig(
            dir.path(),
            "infrastructure/nas/kubeconfig.yaml",
            "https://192.168.1.42:6443",
        );
        let nas_plain = write_kubeconfig(
            dir.path(),
            "infrastructure/nas/kubeconfig",
            "https://192.168.1.43:6443",
        );
        let strategy = KubeconfigFileStrategy::new(
            vec![
                KubeconfigCandidate::new("homelab", homelab, false),
                KubeconfigCandidate::new("nas", nas_yaml.clone(), true),
                KubeconfigCandidate::new("nas", nas_plain, true),
            ],
            false,
        );
        let discovery = ClusterDiscovery::new(vec![Arc::new(strategy)]);

        let clusters = discovery.discover_clusters().await;

        assert_eq!(clusters.len(), 2);
        let nas: Vec<_> = clusters.iter().filter(|c| c.name == "nas").collect();
        assert_eq!(nas.len(), 1);
        assert_eq!(nas[0].api_server_url, "https://192.168.1.42:6443");
        assert_eq!(nas[0].credential_ref.as_deref(), Some(nas_yaml.as_path()));
        assert_eq!(nas[0].network_label, "nas-network");
        assert!(nas[0].is_secondary);
    }

    #[tokio::test]
    async fn test_kubeconfig_missing_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = KubeconfigFileStrategy::new(
            vec![KubeconfigCandidate::new("homelab", dir.path().join("absent"), false)],
            false,
        );
        assert!(strategy.discover().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_registry_strategy_parses_entries() {
        let fake = Arc::new(FakeControlPlane::default());
        fake.put_config_map(ConfigMap {
            metadata: ObjectMeta {
                name: Some(DISCOVERY_CONFIG_MAP.to_string()),
                namespace: Some(FLUX_NAMESPACE.to_string()),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([
                ("nas".to_string(), "https://192.168.1.42:6443,nas-network,true".to_string()),
                ("broken".to_string(), "https://x".to_string()),
            ])),
            ..ConfigMap::default()
        });

        let records = RegistryStrategy::new(fake).discover().await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "nas");
        assert!(records[0].is_secondary);
        assert_eq!(records[0].network_label, "nas-network");
    }

    #[tokio::test]
    async fn test_registry_strategy_without_config_map() {
        let fake = Arc::new(FakeControlPlane::default());
        assert!(RegistryStrategy::new(fake).discover().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mesh_service_strategy_reads_labels() {
        let fake = Arc::new(FakeControlPlane::default());
        fake.add_service(Service {
            metadata: ObjectMeta {
                name: Some("nas-gateway".to_string()),
                namespace: Some("istio-system".to_string()),
                labels: Some(labels([
                    ("istio/multiCluster", "true"),
                    ("cluster", "nas"),
                    ("network", "nas-network"),
                ])),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.96.0.50".to_string()),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        });
        fake.add_service(Service {
            metadata: ObjectMeta {
                name: Some("unrelated".to_string()),
                namespace: Some("default".to_string()),
                labels: Some(labels([("cluster", "other")])),
                ..ObjectMeta::default()
            },
            ..Service::default()
        });

        let records = MeshServiceStrategy::new(fake).discover().await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].api_server_url, "https://10.96.0.50");
        assert_eq!(records[0].source, DiscoverySource::MeshService);
    }

    #[tokio::test]
    async fn test_network_scan_finds_listening_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let strategy = NetworkScanStrategy::default()
            .with_prefix([127, 0, 0])
            .with_port(port)
            .with_targets(vec![ScanTarget {
                host: 1,
                name: "homelab".to_string(),
                is_secondary: false,
            }]);

        let records = strategy.discover().await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].api_server_url, format!("https://127.0.0.1:{port}"));
        assert_eq!(records[0].network_label, "homelab-network");
    }

    #[tokio::test]
    async fn test_store_discovery_info_merges_entries() {
        let fake = FakeControlPlane::default();
        fake.add_node("n1", true, Some("10.0.0.5"), None);
        fake.add_node("n2", true, Some("10.0.0.6"), Some("192.168.1.67"));
        fake.put_config_map(ConfigMap {
            metadata: ObjectMeta {
                name: Some(DISCOVERY_CONFIG_MAP.to_string()),
                namespace: Some(FLUX_NAMESPACE.to_string()),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([(
                "nas".to_string(),
                "https://192.168.1.42:6443,nas-network,true".to_string(),
            )])),
            ..ConfigMap::default()
        });

        let record = store_discovery_info(&fake, "homelab", false).await.unwrap();

        assert_eq!(record.api_server_url, "https://192.168.1.67:6443");
        let data = fake
            .config_map(FLUX_NAMESPACE, DISCOVERY_CONFIG_MAP)
            .unwrap()
            .data
            .unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data["homelab"], "https://192.168.1.67:6443,homelab-network,false");
    }

    #[tokio::test]
    async fn test_store_discovery_info_falls_back_to_internal_ip() {
        let fake = FakeControlPlane::default();
        fake.add_node("n1", true, Some("10.0.0.5"), None);

        let record = store_discovery_info(&fake, "nas", true).await.unwrap();

        assert_eq!(record.api_server_url, "https://10.0.0.5:6443");
        let data = fake
            .config_map(FLUX_NAMESPACE, DISCOVERY_CONFIG_MAP)
            .unwrap()
            .data
            .unwrap();
        assert_eq!(data["nas"], "https://10.0.0.5:6443,nas-network,true");
    }

    #[tokio::test]
    async fn test_store_discovery_info_without_nodes_fails() {
        let fake = FakeControlPlane::default();
        assert!(store_discovery_info(&fake, "homelab", false).await.is_err());
    }
}
