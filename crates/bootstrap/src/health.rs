//! Rolled-up cluster health.
//!
//! A fixed set of probes each yields a [`HealthState`]; the overall state is
//! derived from them by [`HealthPolicy::overall`] and cannot be set directly.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use federation::ControlPlane;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::status::{daemon_set_ready, is_default_storage_class, node_ready, pod_running};

/// Name resolved by the DNS probe.
pub const CLUSTER_DNS_NAME: &str = "kubernetes.default.svc.cluster.local";

/// State of one probe or of the whole cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Warning,
    Unhealthy,
    /// No probe has run.
    Unknown,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Warning => write!(f, "warning"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Aggregation rule for the overall state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthPolicy {
    /// Overall is `Warning` when more than this fraction of probes warn.
    pub warning_ratio: f64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self { warning_ratio: 0.5 }
    }
}

impl HealthPolicy {
    /// Any unhealthy probe makes the cluster unhealthy; otherwise it is in
    /// warning when the warning share exceeds `warning_ratio`; otherwise
    /// healthy. No probes at all is `Unknown`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn overall<'a, I>(&self, states: I) -> HealthState
    where
        I: IntoIterator<Item = &'a HealthState>,
    {
        let (mut total, mut warnings) = (0usize, 0usize);
        for state in states {
            match state {
                HealthState::Unhealthy => return HealthState::Unhealthy,
                HealthState::Warning => warnings += 1,
                HealthState::Healthy | HealthState::Unknown => {}
            }
            total += 1;
        }

        if total == 0 {
            HealthState::Unknown
        } else if warnings as f64 > total as f64 * self.warning_ratio {
            HealthState::Warning
        } else {
            HealthState::Healthy
        }
    }
}

/// Per-probe states and the derived overall state at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    cluster: String,
    components: BTreeMap<String, HealthState>,
    details: BTreeMap<String, String>,
    overall: HealthState,
    timestamp: DateTime<Utc>,
    #[serde(skip)]
    policy: HealthPolicy,
}

impl HealthStatus {
    /// An empty status for `cluster`.
    #[must_use]
    pub fn new(cluster: &str, policy: HealthPolicy) -> Self {
        Self {
            cluster: cluster.to_string(),
            components: BTreeMap::new(),
            details: BTreeMap::new(),
            overall: HealthState::Unknown,
            timestamp: Utc::now(),
            policy,
        }
    }

    /// Record one probe result and recompute the overall state.
    pub fn record(&mut self, component: &str, state: HealthState, detail: impl Into<String>) {
        self.components.insert(component.to_string(), state);
        self.details.insert(component.to_string(), detail.into());
        self.overall = self.policy.overall(self.components.values());
        self.timestamp = Utc::now();
    }

    #[must_use]
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    #[must_use]
    pub fn components(&self) -> &BTreeMap<String, HealthState> {
        &self.components
    }

    #[must_use]
    pub fn details(&self) -> &BTreeMap<String, String> {
        &self.details
    }

    #[must_use]
    pub fn overall(&self) -> HealthState {
        self.overall
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

type Probe = (HealthState, String);

/// Runs the health probes against one cluster.
pub struct HealthChecker {
    control_plane: Arc<dyn ControlPlane>,
    cluster: String,
    policy: HealthPolicy,
    dns_name: String,
    latency_threshold: Duration,
}

impl HealthChecker {
    #[must_use]
    pub fn new(control_plane: Arc<dyn ControlPlane>, cluster: &str) -> Self {
        Self {
            control_plane,
            cluster: cluster.to_string(),
            policy: HealthPolicy::default(),
            dns_name: CLUSTER_DNS_NAME.to_string(),
            latency_threshold: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: HealthPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Resolve a different name in the DNS probe.
    #[must_use]
    pub fn with_dns_name(mut self, name: &str) -> Self {
        self.dns_name = name.to_string();
        self
    }

    /// API round-trips slower than this are reported as a warning.
    #[must_use]
    pub fn with_latency_threshold(mut self, threshold: Duration) -> Self {
        self.latency_threshold = threshold;
        self
    }

    /// Run every probe concurrently and aggregate.
    #[instrument(skip(self), fields(cluster = %self.cluster))]
    pub async fn check_cluster_health(&self) -> HealthStatus {
        let (api, nodes, cni, dns, storage, control_plane, network) = tokio::join!(
            self.check_api_server(),
            self.check_nodes(),
            self.check_cni(),
            self.check_dns(),
            self.check_storage(),
            self.check_control_plane(),
            self.check_network(),
        );

        let mut status = HealthStatus::new(&self.cluster, self.policy);
        for (component, (state, detail)) in [
            ("api_server", api),
            ("nodes", nodes),
            ("cni", cni),
            ("dns", dns),
            ("storage", storage),
            ("control_plane", control_plane),
            ("network_connectivity", network),
        ] {
            debug!(component, %state, %detail, "Health probe");
            status.record(component, state, detail);
        }
        status
    }

    async fn check_api_server(&self) -> Probe {
        let started = Instant::now();
        match self.control_plane.server_version().await {
            Ok(version) => {
                let latency = started.elapsed();
                let detail = format!("{version}, {}ms", latency.as_millis());
                if latency > self.latency_threshold {
                    (HealthState::Warning, format!("slow API server: {detail}"))
                } else {
                    (HealthState::Healthy, detail)
                }
            }
            Err(e) => (HealthState::Unhealthy, format!("API server unreachable: {e}")),
        }
    }

    async fn check_nodes(&self) -> Probe {
        match self.control_plane.list_nodes().await {
            Ok(nodes) if nodes.is_empty() => (HealthState::Unhealthy, "no nodes".to_string()),
            Ok(nodes) => {
                let ready = nodes.iter().filter(|n| node_ready(n)).count();
                let detail = format!("{ready}/{} nodes ready", nodes.len());
                if ready == nodes.len() {
                    (HealthState::Healthy, detail)
                } else {
                    (HealthState::Warning, detail)
                }
            }
            Err(e) => (HealthState::Unhealthy, format!("failed to list nodes: {e}")),
        }
    }

    async fn check_cni(&self) -> Probe {
        match self.control_plane.get_daemon_set("kube-system", "cilium").await {
            Ok(Some(ds)) if daemon_set_ready(&ds) => (HealthState::Healthy, "cilium ready".to_string()),
            Ok(Some(_)) => (HealthState::Warning, "cilium not fully ready".to_string()),
            Ok(None) => (HealthState::Warning, "cilium daemonset not found".to_string()),
            Err(e) => (HealthState::Warning, format!("failed to read cilium daemonset: {e}")),
        }
    }

    async fn check_dns(&self) -> Probe {
        let target = format!("{}:443", self.dns_name);
        let lookup = tokio::time::timeout(Duration::from_secs(5), tokio::net::lookup_host(target)).await;
        match lookup {
            Ok(Ok(mut addrs)) => {
                if addrs.next().is_some() {
                    (HealthState::Healthy, format!("{} resolves", self.dns_name))
                } else {
                    (HealthState::Unhealthy, format!("{} has no addresses", self.dns_name))
                }
            }
            Ok(Err(e)) => (HealthState::Unhealthy, format!("failed to resolve {}: {e}", self.dns_name)),
            Err(_) => (HealthState::Unhealthy, format!("timed out resolving {}", self.dns_name)),
        }
    }

    async fn check_storage(&self) -> Probe {
        match self.control_plane.list_storage_classes().await {
            Ok(classes) if classes.is_empty() => (HealthState::Warning, "no storage classes".to_string()),
            Ok(classes) => match classes.iter().find(|c| is_default_storage_class(c)) {
                Some(class) => (
                    HealthState::Healthy,
                    format!(
                        "default storage class {}",
                        class.metadata.name.as_deref().unwrap_or("unknown")
                    ),
                ),
                None => (HealthState::Warning, "no default storage class".to_string()),
            },
            Err(e) => (HealthState::Warning, format!("failed to list storage classes: {e}")),
        }
    }

    async fn check_control_plane(&self) -> Probe {
        self.pods_running("tier=control-plane", "control plane").await
    }

    async fn check_network(&self) -> Probe {
        self.pods_running("k8s-app=kube-proxy", "kube-proxy").await
    }

    async fn pods_running(&self, selector: &str, what: &str) -> Probe {
        match self.control_plane.list_pods("kube-system", Some(selector)).await {
            Ok(pods) if pods.is_empty() => (HealthState::Warning, format!("no {what} pods found")),
            Ok(pods) => {
                let running = pods.iter().filter(|p| pod_running(p)).count();
                let detail = format!("{running}/{} {what} pods running", pods.len());
                if running == pods.len() {
                    (HealthState::Healthy, detail)
                } else {
                    (HealthState::Warning, detail)
                }
            }
            Err(e) => (HealthState::Warning, format!("failed to list {what} pods: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use federation::testing::FakeControlPlane;

    use super::HealthState::{Healthy, Unhealthy, Warning};

    #[test]
    fn test_one_unhealthy_probe_wins() {
        let policy = HealthPolicy::default();
        assert_eq!(policy.overall(&[Unhealthy, Healthy, Healthy, Healthy]), Unhealthy);
        assert_eq!(policy.overall(&[Warning, Warning, Warning, Unhealthy]), Unhealthy);
    }

    #[test]
    fn test_warning_needs_strict_majority() {
        let policy = HealthPolicy::default();
        assert_eq!(policy.overall(&[Warning, Warning, Healthy, Healthy]), Healthy);
        assert_eq!(policy.overall(&[Warning, Warning, Warning, Healthy]), Warning);
        assert_eq!(policy.overall(&[Warning]), Warning);
        assert_eq!(policy.overall(&[] as &[HealthState]), HealthState::Unknown);
    }

    #[test]
    fn test_warning_ratio_is_tunable() {
        let strict = HealthPolicy { warning_ratio: 0.0 };
        assert_eq!(strict.overall(&[Warning, Healthy, Healthy, Healthy]), Warning);
    }

    #[test]
    fn test_overall_follows_recorded_probes() {
        let mut status = HealthStatus::new("homelab", HealthPolicy::default());
        assert_eq!(status.overall(), HealthState::Unknown);

        status.record("api_server", Healthy, "ok");
        assert_eq!(status.overall(), Healthy);
        status.record("dns", Unhealthy, "nxdomain");
        assert_eq!(status.overall(), Unhealthy);
        status.record("dns", Healthy, "ok");
        assert_eq!(status.overall(), Healthy);
        assert_eq!(status.details()["dns"], "ok");
    }

    fn healthy_fake() -> Arc<FakeControlPlane> {
        let fake = Arc::new(FakeControlPlane::default());
        fake.add_node("cp-1", true, Some("10.0.0.1"), None);
        fake.set_daemon_set("kube-system", "cilium", 1, 1);
        fake.add_storage_class("rook-ceph-block", true);
        fake.add_pod("kube-system", "kube-apiserver-cp-1", &[("tier", "control-plane")], "Running");
        fake.add_pod("kube-system", "kube-proxy-abc", &[("k8s-app", "kube-proxy")], "Running");
        fake
    }

    #[tokio::test]
    async fn test_healthy_cluster() {
        let checker = HealthChecker::new(healthy_fake(), "homelab").with_dns_name("localhost");
        let status = checker.check_cluster_health().await;

        assert_eq!(status.components().len(), 7);
        assert_eq!(status.overall(), Healthy, "{:?}", status.details());
    }

    #[tokio::test]
    async fn test_unreachable_cluster_is_unhealthy() {
        let fake = healthy_fake();
        fake.set_unreachable(true);
        let status = HealthChecker::new(fake, "nas")
            .with_dns_name("localhost")
            .check_cluster_health()
            .await;

        assert_eq!(status.components()["api_server"], Unhealthy);
        assert_eq!(status.overall(), Unhealthy);
    }

    #[tokio::test]
    async fn test_missing_cni_is_minority_warning() {
        let fresh = Arc::new(FakeControlPlane::default());
        fresh.add_node("cp-1", true, None, None);
        fresh.add_storage_class("local-path", true);
        fresh.add_pod("kube-system", "kube-apiserver", &[("tier", "control-plane")], "Running");
        fresh.add_pod("kube-system", "kube-proxy", &[("k8s-app", "kube-proxy")], "Running");

        let status = HealthChecker::new(fresh, "nas")
            .with_dns_name("localhost")
            .check_cluster_health()
            .await;

        assert_eq!(status.components()["cni"], Warning);
        assert_eq!(status.overall(), Healthy);
    }
}
