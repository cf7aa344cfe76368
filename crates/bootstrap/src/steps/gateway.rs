//! `finalize-mesh`: publish east-west gateway endpoints into cluster
//! variables and wait for the mesh control plane to come up.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use federation::resources::FLUX_NAMESPACE;
use federation::trust::MESH_NAMESPACE;
use federation::{poll_with, ClusterError, ControlPlane, PollOutcome, PollSpec};
use k8s_openapi::api::core::v1::{Service, ServicePort};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::{wait_for_daemon_set, wait_for_deployments};
use crate::context::StepContext;
use crate::orchestrator::Step;
use crate::secrets::{opaque_secret, secret_value, CLUSTER_VARS_SECRET, REFLECTOR_ANNOTATIONS};
use crate::status::deployment_ready;

/// East-west gateway service and deployment name.
pub const GATEWAY_SERVICE: &str = "istio-eastwestgateway";

const GATEWAY_TLS_PORT: i32 = 15443;
const GATEWAY_WAIT: PollSpec = PollSpec::new(Duration::from_secs(5), Duration::from_secs(300));
const FALLBACK_AFTER: Duration = Duration::from_secs(120);
const MESH_WAIT: PollSpec = PollSpec::new(Duration::from_secs(10), Duration::from_secs(300));
const RECONCILE_ANNOTATION: &str = "reconcile.fluxcd.io/requestedAt";

/// How a gateway endpoint was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointSource {
    LoadBalancer,
    ExternalIp,
    ClusterIp,
    NodePort,
}

/// Address peers use to reach the east-west gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEndpoint {
    pub host: String,
    pub port: i32,
    pub source: EndpointSource,
}

fn tls_port(service: &Service) -> Option<&ServicePort> {
    service
        .spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .find(|p| p.name.as_deref() == Some("tls") || p.port == GATEWAY_TLS_PORT)
}

/// The endpoint a service currently exposes on its TLS port.
///
/// Load balancer ingress wins over external IPs, which win over the cluster
/// IP. A node-port endpoint has an empty host.
#[must_use]
pub fn endpoint_from_service(service: &Service) -> Option<GatewayEndpoint> {
    let port = tls_port(service)?;
    let spec = service.spec.as_ref()?;
    let endpoint = |host: &str, port: i32, source| GatewayEndpoint {
        host: host.to_string(),
        port,
        source,
    };

    let ingress = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.first())
        .and_then(|first| {
            first
                .ip
                .as_deref()
                .filter(|h| !h.is_empty())
                .or_else(|| first.hostname.as_deref().filter(|h| !h.is_empty()))
        });
    if let Some(host) = ingress {
        return Some(endpoint(host, port.port, EndpointSource::LoadBalancer));
    }

    if let Some(host) = spec.external_ips.as_ref().and_then(|ips| ips.first()) {
        return Some(endpoint(host, port.port, EndpointSource::ExternalIp));
    }

    match spec.type_.as_deref().unwrap_or("ClusterIP") {
        "ClusterIP" => spec
            .cluster_ip
            .as_deref()
            .filter(|ip| !ip.is_empty() && *ip != "None")
            .map(|ip| endpoint(ip, port.port, EndpointSource::ClusterIp)),
        "NodePort" => port
            .node_port
            .filter(|p| *p != 0)
            .map(|node_port| endpoint("", node_port, EndpointSource::NodePort)),
        _ => None,
    }
}

/// What to advertise for `service` after waiting `waited`.
///
/// With `allow_fallback`, a node-port endpoint is advertised on the first
/// fallback host, and a load balancer that never got an address falls back
/// to its node port after [`FALLBACK_AFTER`].
fn resolve(
    service: &Service,
    fallbacks: &[String],
    allow_fallback: bool,
    waited: Duration,
) -> federation::Result<Option<GatewayEndpoint>> {
    match endpoint_from_service(service) {
        Some(endpoint) if endpoint.source != EndpointSource::NodePort => Ok(Some(endpoint)),
        Some(endpoint) if allow_fallback => match fallbacks.first() {
            Some(host) => Ok(Some(GatewayEndpoint {
                host: host.clone(),
                ..endpoint
            })),
            None => Err(ClusterError::Config(
                "gateway is exposed on a node port but no fallback address is known".to_string(),
            )),
        },
        _ if allow_fallback && waited >= FALLBACK_AFTER => {
            let node_port = tls_port(service).and_then(|p| p.node_port).filter(|p| *p != 0);
            Ok(fallbacks.first().zip(node_port).map(|(host, port)| GatewayEndpoint {
                host: host.clone(),
                port,
                source: EndpointSource::NodePort,
            }))
        }
        _ => Ok(None),
    }
}

/// Poll the gateway service until it yields an address.
async fn wait_for_gateway(
    control_plane: &dyn ControlPlane,
    fallbacks: &[String],
    allow_fallback: bool,
    cancel: &CancellationToken,
) -> federation::Result<GatewayEndpoint> {
    let started = Instant::now();
    let found: Mutex<Option<GatewayEndpoint>> = Mutex::new(None);
    let slot = &found;

    let outcome = poll_with(GATEWAY_WAIT, cancel, move || async move {
        let Some(service) = control_plane.get_service(MESH_NAMESPACE, GATEWAY_SERVICE).await? else {
            return Ok(false);
        };
        let Some(endpoint) = resolve(&service, fallbacks, allow_fallback, started.elapsed())? else {
            return Ok(false);
        };
        if let Ok(mut guard) = slot.lock() {
            *guard = Some(endpoint);
        }
        Ok(true)
    })
    .await?;

    match (outcome, found.into_inner().ok().flatten()) {
        (PollOutcome::Satisfied, Some(endpoint)) => Ok(endpoint),
        (outcome, _) => Err(outcome.into_timeout(
            format!("address of {MESH_NAMESPACE}/{GATEWAY_SERVICE}"),
            GATEWAY_WAIT.timeout,
        )),
    }
}

/// Publishes gateway endpoints and waits for the mesh control plane.
pub struct FinalizeMesh;

impl FinalizeMesh {
    /// Configured fallback hosts, or the first node's internal address.
    async fn fallbacks(ctx: &StepContext) -> Vec<String> {
        if !ctx.config.mesh.gateway_fallbacks.is_empty() {
            return ctx.config.mesh.gateway_fallbacks.clone();
        }
        let nodes = match ctx.local.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "Cannot list nodes for gateway fallback");
                return Vec::new();
            }
        };
        nodes
            .iter()
            .filter_map(|node| node.status.as_ref()?.addresses.as_ref())
            .flatten()
            .find(|a| a.type_ == "InternalIP")
            .map(|a| vec![a.address.clone()])
            .unwrap_or_default()
    }

    /// Merge `updates` into `flux-system/cluster-vars`, keeping other keys.
    async fn publish(ctx: &StepContext, updates: BTreeMap<String, String>) -> Result<()> {
        ctx.local
            .ensure_namespace(FLUX_NAMESPACE)
            .await
            .context("Failed to ensure flux-system namespace")?;
        let existing = ctx
            .local
            .get_secret(FLUX_NAMESPACE, CLUSTER_VARS_SECRET)
            .await
            .context("Failed to read cluster-vars secret")?;

        let mut vars: BTreeMap<String, String> = existing
            .and_then(|secret| secret.data)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(key, value)| String::from_utf8(value.0).ok().map(|v| (key, v)))
            .collect();
        vars.extend(updates);

        let secret = opaque_secret(FLUX_NAMESPACE, CLUSTER_VARS_SECRET, &vars, &REFLECTOR_ANNOTATIONS);
        ctx.local
            .apply_secret(&secret)
            .await
            .context("Failed to update gateway variables")?;
        Ok(())
    }

    /// Ask Flux to pick up the new variables now rather than on its interval.
    async fn request_reconcile(ctx: &StepContext) -> Result<()> {
        let requested_at = format!("{RECONCILE_ANNOTATION}={}", chrono::Utc::now().to_rfc3339());
        for unit in ctx.config.mesh_reconcile_units() {
            let target = format!("kustomization/{unit}");
            ctx.tooling
                .kubectl(&["annotate", "--overwrite", "-n", FLUX_NAMESPACE, &target, &requested_at])
                .await
                .with_context(|| format!("Failed to reconcile {unit}"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Step for FinalizeMesh {
    fn name(&self) -> &'static str {
        "finalize-mesh"
    }

    fn description(&self) -> &'static str {
        "Publishing gateway endpoints and verifying the mesh"
    }

    async fn already_satisfied(&self, ctx: &StepContext) -> Result<bool> {
        if !ctx.config.mesh.enabled {
            return Ok(true);
        }
        let local = ctx.local.as_ref();
        let Some(endpoint) = local
            .get_service(MESH_NAMESPACE, GATEWAY_SERVICE)
            .await?
            .as_ref()
            .and_then(endpoint_from_service)
            .filter(|e| e.source != EndpointSource::NodePort)
        else {
            return Ok(false);
        };
        let Some(vars) = local.get_secret(FLUX_NAMESPACE, CLUSTER_VARS_SECRET).await? else {
            return Ok(false);
        };
        let (addr_key, port_key) = ctx.config.gateway_var_keys();
        if secret_value(&vars, addr_key) != Some(endpoint.host)
            || secret_value(&vars, port_key) != Some(endpoint.port.to_string())
        {
            return Ok(false);
        }
        for name in ["istiod", GATEWAY_SERVICE] {
            let ready = local
                .get_deployment(MESH_NAMESPACE, name)
                .await?
                .is_some_and(|d| deployment_ready(&d));
            if !ready {
                return Ok(false);
            }
        }
        Ok(true)
    }

    #[instrument(skip_all, fields(cluster = ctx.cluster_name()))]
    async fn execute(&self, ctx: &StepContext) -> Result<()> {
        let fallbacks = Self::fallbacks(ctx).await;
        let local = wait_for_gateway(ctx.local.as_ref(), &fallbacks, true, &ctx.cancel)
            .await
            .context("Failed to detect local east-west gateway address")?;

        let mut updates = BTreeMap::new();
        let (addr_key, port_key) = ctx.config.gateway_var_keys();
        updates.insert(addr_key.to_string(), local.host.clone());
        updates.insert(port_key.to_string(), local.port.to_string());

        match &ctx.peer {
            Some(peer) => match wait_for_gateway(peer.as_ref(), &[], false, &ctx.cancel).await {
                Ok(endpoint) => {
                    let (addr_key, port_key) = ctx.config.peer_gateway_var_keys();
                    updates.insert(addr_key.to_string(), endpoint.host);
                    updates.insert(port_key.to_string(), endpoint.port.to_string());
                }
                Err(ClusterError::Cancelled) => return Err(ClusterError::Cancelled.into()),
                Err(e) => warn!(peer = ctx.config.peer_name(), error = %e, "Unable to discover peer gateway"),
            },
            None => warn!(
                peer = ctx.config.peer_name(),
                "Peer cluster not configured, peer gateway variables not published"
            ),
        }

        Self::publish(ctx, updates).await?;
        Self::request_reconcile(ctx).await?;

        wait_for_deployments(ctx, MESH_NAMESPACE, &["istiod", GATEWAY_SERVICE], MESH_WAIT)
            .await
            .context("Mesh control plane not ready")?;
        if let Err(e) = wait_for_daemon_set(ctx, MESH_NAMESPACE, "ztunnel", MESH_WAIT).await {
            warn!(error = %e, "ztunnel not ready");
        }

        info!(gateway = %local.host, port = local.port, source = ?local.source, "Mesh finalized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BootstrapConfig, ClusterRole};
    use crate::tooling::recording::RecordingTooling;
    use federation::testing::FakeControlPlane;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, ServiceSpec, ServiceStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Arc;

    fn gateway(type_: &str, cluster_ip: Option<&str>, ingress_ip: Option<&str>, node_port: Option<i32>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(GATEWAY_SERVICE.to_string()),
                namespace: Some(MESH_NAMESPACE.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(type_.to_string()),
                cluster_ip: cluster_ip.map(ToString::to_string),
                ports: Some(vec![
                    ServicePort {
                        name: Some("status-port".to_string()),
                        port: 15021,
                        ..ServicePort::default()
                    },
                    ServicePort {
                        name: Some("tls".to_string()),
                        port: GATEWAY_TLS_PORT,
                        node_port,
                        ..ServicePort::default()
                    },
                ]),
                ..ServiceSpec::default()
            }),
            status: ingress_ip.map(|ip| ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: Some(ip.to_string()),
                        ..LoadBalancerIngress::default()
                    }]),
                    ..LoadBalancerStatus::default()
                }),
                ..ServiceStatus::default()
            }),
        }
    }

    fn mesh_ready(fake: &FakeControlPlane) {
        fake.set_deployment(MESH_NAMESPACE, "istiod", 1, 1);
        fake.set_deployment(MESH_NAMESPACE, GATEWAY_SERVICE, 1, 1);
        fake.set_daemon_set(MESH_NAMESPACE, "ztunnel", 2, 2);
    }

    fn context(fake: &Arc<FakeControlPlane>, tooling: &Arc<RecordingTooling>) -> StepContext {
        StepContext::new(
            BootstrapConfig::for_role(ClusterRole::Primary),
            fake.clone(),
            tooling.clone(),
        )
    }

    #[test]
    fn test_load_balancer_address_wins() {
        let service = gateway("LoadBalancer", Some("10.96.0.12"), Some("192.168.1.200"), Some(31443));
        let endpoint = endpoint_from_service(&service).unwrap();
        assert_eq!(endpoint.host, "192.168.1.200");
        assert_eq!(endpoint.port, GATEWAY_TLS_PORT);
        assert_eq!(endpoint.source, EndpointSource::LoadBalancer);
    }

    #[test]
    fn test_cluster_ip_service() {
        let service = gateway("ClusterIP", Some("10.96.0.12"), None, None);
        let endpoint = endpoint_from_service(&service).unwrap();
        assert_eq!(endpoint.source, EndpointSource::ClusterIp);
        assert_eq!(endpoint.host, "10.96.0.12");
    }

    #[test]
    fn test_service_without_tls_port_has_no_endpoint() {
        let mut service = gateway("ClusterIP", Some("10.96.0.12"), None, None);
        if let Some(spec) = service.spec.as_mut() {
            spec.ports = Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: 80,
                ..ServicePort::default()
            }]);
        }
        assert!(endpoint_from_service(&service).is_none());
    }

    #[test]
    fn test_node_port_is_advertised_on_fallback_host() {
        let service = gateway("NodePort", Some("10.96.0.12"), None, Some(31443));
        let fallbacks = vec!["192.168.1.67".to_string()];

        let endpoint = resolve(&service, &fallbacks, true, Duration::ZERO)
            .unwrap()
            .unwrap();
        assert_eq!(endpoint.host, "192.168.1.67");
        assert_eq!(endpoint.port, 31443);

        let err = resolve(&service, &[], true, Duration::ZERO).unwrap_err();
        assert!(matches!(err, ClusterError::Config(_)));
        assert!(resolve(&service, &fallbacks, false, Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn test_pending_load_balancer_falls_back_after_delay() {
        let service = gateway("LoadBalancer", Some("10.96.0.12"), None, Some(31443));
        let fallbacks = vec!["192.168.1.67".to_string()];

        assert!(resolve(&service, &fallbacks, true, Duration::from_secs(30))
            .unwrap()
            .is_none());
        let endpoint = resolve(&service, &fallbacks, true, FALLBACK_AFTER)
            .unwrap()
            .unwrap();
        assert_eq!(endpoint.source, EndpointSource::NodePort);
        assert_eq!(endpoint.port, 31443);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalize_publishes_both_gateways() {
        let homelab = Arc::new(FakeControlPlane::new("https://192.168.1.67:6443"));
        homelab.add_service(gateway("LoadBalancer", Some("10.96.0.12"), Some("192.168.1.200"), Some(31443)));
        homelab.put_secret(opaque_secret(
            FLUX_NAMESPACE,
            CLUSTER_VARS_SECRET,
            &BTreeMap::from([("CLUSTER_DOMAIN".to_string(), "example.com".to_string())]),
            &REFLECTOR_ANNOTATIONS,
        ));
        mesh_ready(&homelab);
        let nas = Arc::new(FakeControlPlane::new("https://192.168.1.42:6443"));
        nas.add_service(gateway("ClusterIP", Some("10.97.0.8"), None, None));
        let tooling = Arc::new(RecordingTooling::default());
        let ctx = context(&homelab, &tooling).with_peer(nas);

        FinalizeMesh.execute(&ctx).await.unwrap();

        let vars = homelab.secret(FLUX_NAMESPACE, CLUSTER_VARS_SECRET).unwrap();
        assert_eq!(secret_value(&vars, "CLUSTER_DOMAIN").as_deref(), Some("example.com"));
        assert_eq!(secret_value(&vars, "HOMELAB_EW_GATEWAY_ADDR").as_deref(), Some("192.168.1.200"));
        assert_eq!(secret_value(&vars, "HOMELAB_EW_GATEWAY_PORT").as_deref(), Some("15443"));
        assert_eq!(secret_value(&vars, "NAS_EW_GATEWAY_ADDR").as_deref(), Some("10.97.0.8"));

        let annotated: Vec<_> = tooling
            .invocations()
            .into_iter()
            .filter(|call| call.starts_with("kubectl annotate"))
            .collect();
        assert_eq!(annotated.len(), 2);
        assert!(annotated[0].contains("kustomization/controllers"));
        assert!(annotated[1].contains("kustomization/platform-foundation"));

        assert!(FinalizeMesh.already_satisfied(&ctx).await.unwrap());
        homelab.add_service(gateway("LoadBalancer", Some("10.96.0.12"), Some("192.168.1.201"), Some(31443)));
        assert!(!FinalizeMesh.already_satisfied(&ctx).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_gateway_fails() {
        let homelab = Arc::new(FakeControlPlane::default());
        mesh_ready(&homelab);
        let tooling = Arc::new(RecordingTooling::default());
        let ctx = context(&homelab, &tooling);

        let err = FinalizeMesh.execute(&ctx).await.unwrap_err();

        assert!(format!("{err:#}").contains("east-west gateway"));
        assert!(homelab.secret(FLUX_NAMESPACE, CLUSTER_VARS_SECRET).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_istiod_not_ready_fails_after_publishing() {
        let homelab = Arc::new(FakeControlPlane::default());
        homelab.add_service(gateway("ClusterIP", Some("10.96.0.12"), None, None));
        homelab.set_deployment(MESH_NAMESPACE, "istiod", 1, 0);
        let tooling = Arc::new(RecordingTooling::default());
        let ctx = context(&homelab, &tooling);

        let err = FinalizeMesh.execute(&ctx).await.unwrap_err();

        assert!(format!("{err:#}").contains("istio-system/istiod"));
        assert!(homelab.secret(FLUX_NAMESPACE, CLUSTER_VARS_SECRET).is_some());
    }

    #[tokio::test]
    async fn test_disabled_mesh_is_satisfied() {
        let homelab = Arc::new(FakeControlPlane::default());
        let tooling = Arc::new(RecordingTooling::default());
        let mut ctx = context(&homelab, &tooling);
        ctx.config.mesh.enabled = false;

        assert!(FinalizeMesh.already_satisfied(&ctx).await.unwrap());
        assert_eq!(homelab.call_count(), 0);
    }
}
