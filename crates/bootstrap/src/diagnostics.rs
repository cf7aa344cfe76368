//! Best-effort diagnostics across both clusters.
//!
//! Nothing in here fails: every probe result, including "could not connect",
//! becomes a [`DiagnosticFinding`].

use std::fmt;
use std::sync::Arc;

use federation::resources::FLUX_NAMESPACE;
use federation::ControlPlane;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::status::{deployment_ready, deployment_replicas, node_ready, pod_running};

const FLUX_CONTROLLERS: [&str; 3] = ["source-controller", "kustomize-controller", "helm-controller"];
const ISTIO_NAMESPACE: &str = "istio-system";

/// Severity of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingStatus {
    Healthy,
    Warning,
    Error,
}

impl fmt::Display for FindingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One component-level observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticFinding {
    pub component: String,
    pub status: FindingStatus,
    pub message: String,
    /// Whether the condition is expected to clear without operator action.
    pub recoverable: bool,
}

impl DiagnosticFinding {
    fn new(component: &str, status: FindingStatus, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            component: component.to_string(),
            status,
            message: message.into(),
            recoverable,
        }
    }

    fn healthy(component: &str, message: impl Into<String>) -> Self {
        Self::new(component, FindingStatus::Healthy, message, true)
    }

    fn warning(component: &str, message: impl Into<String>) -> Self {
        Self::new(component, FindingStatus::Warning, message, true)
    }

    fn error(component: &str, message: impl Into<String>, recoverable: bool) -> Self {
        Self::new(component, FindingStatus::Error, message, recoverable)
    }
}

/// Counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticSummary {
    pub healthy: usize,
    pub warnings: usize,
    pub errors: usize,
}

impl DiagnosticSummary {
    /// Tally a set of findings.
    #[must_use]
    pub fn from_findings(findings: &[DiagnosticFinding]) -> Self {
        findings.iter().fold(Self::default(), |mut acc, f| {
            match f.status {
                FindingStatus::Healthy => acc.healthy += 1,
                FindingStatus::Warning => acc.warnings += 1,
                FindingStatus::Error => acc.errors += 1,
            }
            acc
        })
    }

    /// Whether any finding is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }
}

/// A cluster to diagnose: a connection, or the reason there is none.
pub struct ClusterTarget {
    name: String,
    connection: Result<Arc<dyn ControlPlane>, String>,
}

impl ClusterTarget {
    /// A connected cluster.
    #[must_use]
    pub fn connected(name: &str, control_plane: Arc<dyn ControlPlane>) -> Self {
        Self {
            name: name.to_string(),
            connection: Ok(control_plane),
        }
    }

    /// A cluster that could not be connected to.
    #[must_use]
    pub fn unavailable(name: &str, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            connection: Err(reason.into()),
        }
    }
}

/// Runs the fixed probe set on the primary and secondary cluster.
pub struct DiagnosticManager {
    primary: ClusterTarget,
    secondary: ClusterTarget,
}

impl DiagnosticManager {
    #[must_use]
    pub fn new(primary: ClusterTarget, secondary: ClusterTarget) -> Self {
        Self { primary, secondary }
    }

    /// Diagnose both clusters concurrently; primary findings come first.
    #[instrument(skip(self))]
    pub async fn diagnose_system(&self) -> Vec<DiagnosticFinding> {
        let (mut primary, secondary) = futures::join!(
            diagnose_target(&self.primary, true),
            diagnose_target(&self.secondary, false)
        );
        primary.extend(secondary);
        debug!(findings = primary.len(), "Diagnostics complete");
        primary
    }
}

async fn diagnose_target(target: &ClusterTarget, is_primary: bool) -> Vec<DiagnosticFinding> {
    let component = format!("{}-connectivity", target.name);
    match &target.connection {
        Ok(control_plane) => diagnose_cluster(control_plane.as_ref(), &target.name, is_primary).await,
        Err(reason) if is_primary => vec![DiagnosticFinding::error(
            &component,
            format!("cannot connect to {} cluster: {reason}", target.name),
            true,
        )],
        Err(reason) => vec![DiagnosticFinding::warning(
            &component,
            format!("cannot connect to {} cluster: {reason}", target.name),
        )],
    }
}

async fn diagnose_cluster(
    control_plane: &dyn ControlPlane,
    cluster: &str,
    is_primary: bool,
) -> Vec<DiagnosticFinding> {
    let mut findings = Vec::new();

    let api = format!("{cluster}-api-server");
    match control_plane.server_version().await {
        Ok(version) => findings.push(DiagnosticFinding::healthy(
            &api,
            format!("API server reachable ({version})"),
        )),
        Err(e) => {
            findings.push(DiagnosticFinding::error(
                &api,
                format!("API server unreachable: {e}"),
                false,
            ));
            return findings;
        }
    }

    findings.push(check_nodes(control_plane, cluster).await);
    findings.extend(check_flux(control_plane, cluster).await);
    if is_primary {
        findings.extend(check_istio(control_plane, cluster).await);
    }
    findings
}

async fn check_nodes(control_plane: &dyn ControlPlane, cluster: &str) -> DiagnosticFinding {
    let component = format!("{cluster}-nodes");
    match control_plane.list_nodes().await {
        Ok(nodes) if nodes.is_empty() => DiagnosticFinding::error(&component, "no nodes found", true),
        Ok(nodes) => {
            let ready = nodes.iter().filter(|n| node_ready(n)).count();
            let message = format!("{ready}/{} nodes ready", nodes.len());
            if ready == nodes.len() {
                DiagnosticFinding::healthy(&component, message)
            } else {
                DiagnosticFinding::warning(&component, message)
            }
        }
        Err(e) => DiagnosticFinding::error(&component, format!("failed to list nodes: {e}"), true),
    }
}

async fn check_flux(control_plane: &dyn ControlPlane, cluster: &str) -> Vec<DiagnosticFinding> {
    let namespace = format!("{cluster}-flux-namespace");
    match control_plane.namespace_exists(FLUX_NAMESPACE).await {
        Ok(true) => {}
        Ok(false) => {
            return vec![DiagnosticFinding::error(
                &namespace,
                "flux-system namespace not found, Flux is not installed",
                true,
            )]
        }
        Err(e) => {
            return vec![DiagnosticFinding::error(
                &namespace,
                format!("failed to check flux-system namespace: {e}"),
                true,
            )]
        }
    }

    let mut findings = vec![DiagnosticFinding::healthy(&namespace, "flux-system namespace exists")];
    for controller in FLUX_CONTROLLERS {
        let component = format!("{cluster}-flux-{controller}");
        let finding = match control_plane.get_deployment(FLUX_NAMESPACE, controller).await {
            Ok(Some(deployment)) => {
                let (ready, desired) = deployment_replicas(&deployment);
                let message = format!("{ready}/{desired} replicas ready");
                if deployment_ready(&deployment) {
                    DiagnosticFinding::healthy(&component, message)
                } else {
                    DiagnosticFinding::warning(&component, message)
                }
            }
            Ok(None) => DiagnosticFinding::error(&component, "deployment not found", true),
            Err(e) => DiagnosticFinding::error(&component, format!("failed to read deployment: {e}"), true),
        };
        findings.push(finding);
    }

    let controllers = &findings[1..];
    let worst = controllers
        .iter()
        .map(|f| f.status)
        .max()
        .unwrap_or(FindingStatus::Healthy);
    let healthy = controllers
        .iter()
        .filter(|f| f.status == FindingStatus::Healthy)
        .count();
    findings.push(DiagnosticFinding::new(
        &format!("{cluster}-flux-overall"),
        worst,
        format!("{healthy}/{} Flux controllers healthy", FLUX_CONTROLLERS.len()),
        true,
    ));
    findings
}

async fn check_istio(control_plane: &dyn ControlPlane, cluster: &str) -> Vec<DiagnosticFinding> {
    let namespace = format!("{cluster}-istio-namespace");
    match control_plane.namespace_exists(ISTIO_NAMESPACE).await {
        Ok(true) => {}
        Ok(false) => {
            return vec![DiagnosticFinding::warning(
                &namespace,
                "istio-system namespace not found",
            )]
        }
        Err(e) => {
            return vec![DiagnosticFinding::warning(
                &namespace,
                format!("failed to check istio-system namespace: {e}"),
            )]
        }
    }

    let component = format!("{cluster}-istio-control-plane");
    let control = match control_plane
        .list_pods(ISTIO_NAMESPACE, Some("app=istiod"))
        .await
    {
        Ok(pods) if pods.is_empty() => DiagnosticFinding::error(&component, "no istiod pods found", true),
        Ok(pods) => {
            let running = pods.iter().filter(|p| pod_running(p)).count();
            let message = format!("{running}/{} istiod pods running", pods.len());
            if running == pods.len() {
                DiagnosticFinding::healthy(&component, message)
            } else {
                DiagnosticFinding::warning(&component, message)
            }
        }
        Err(e) => DiagnosticFinding::error(&component, format!("failed to list istiod pods: {e}"), true),
    };

    vec![
        DiagnosticFinding::healthy(&namespace, "istio-system namespace exists"),
        control,
    ]
}
