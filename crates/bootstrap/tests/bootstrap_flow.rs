//! End-to-end runs of the step sequence against an in-memory cluster.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use federation::resources::FLUX_NAMESPACE;
use federation::testing::{FakeControlPlane, FakeCredentialConnector};
use federation::trust::MESH_NAMESPACE;
use homelab_bootstrap::steps::flux::FLUX_INSTALL_MANIFEST;
use homelab_bootstrap::steps::gateway::GATEWAY_SERVICE;
use homelab_bootstrap::steps::sequence_for;
use homelab_bootstrap::tooling::ClusterTooling;
use homelab_bootstrap::transit::TransitProvisioner;
use homelab_bootstrap::waiter::LOCAL_PATH_MANIFEST;
use homelab_bootstrap::{BootstrapConfig, ClusterRole, Orchestrator, StepContext, StepStatus};
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Tooling that makes the fake cluster look like the manifests were applied.
struct SimulatedTooling {
    cluster: Arc<FakeControlPlane>,
    helm_fails: bool,
    log: Mutex<Vec<String>>,
}

impl SimulatedTooling {
    fn new(cluster: &Arc<FakeControlPlane>) -> Self {
        Self {
            cluster: cluster.clone(),
            helm_fails: false,
            log: Mutex::new(Vec::new()),
        }
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterTooling for SimulatedTooling {
    async fn kubectl(&self, args: &[&str]) -> Result<String> {
        self.log.lock().unwrap().push(format!("kubectl {}", args.join(" ")));
        match args {
            ["apply", "-f", FLUX_INSTALL_MANIFEST] => {
                for controller in [
                    "source-controller",
                    "kustomize-controller",
                    "helm-controller",
                    "notification-controller",
                ] {
                    self.cluster.set_deployment(FLUX_NAMESPACE, controller, 1, 1);
                }
            }
            ["apply", "-f", LOCAL_PATH_MANIFEST] => {
                self.cluster
                    .set_deployment("local-path-storage", "local-path-provisioner", 1, 1);
            }
            ["patch", "storageclass", "local-path", ..] => {
                self.cluster.add_storage_class("local-path", true);
            }
            _ => {}
        }
        Ok(String::new())
    }

    async fn helm(&self, args: &[&str]) -> Result<String> {
        self.log.lock().unwrap().push(format!("helm {}", args.join(" ")));
        if self.helm_fails {
            anyhow::bail!("helm failed: chart not found");
        }
        Ok(String::new())
    }
}

fn nas_cluster() -> Arc<FakeControlPlane> {
    let fake = Arc::new(FakeControlPlane::new("https://192.168.1.42:6443"));
    fake.add_node("nas-1", true, Some("192.168.1.42"), None);
    fake.put_config_map(ConfigMap {
        metadata: ObjectMeta {
            name: Some("kube-root-ca.crt".to_string()),
            namespace: Some("kube-system".to_string()),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([(
            "ca.crt".to_string(),
            "-----BEGIN CERTIFICATE-----".to_string(),
        )])),
        ..ConfigMap::default()
    });
    // Flux picks the source up as soon as it is applied.
    fake.set_git_repository("flux-system", Some(true));
    fake.set_kustomization("nas-platform-foundation", Some(true));
    // The platform brings up the mesh.
    fake.add_service(Service {
        metadata: ObjectMeta {
            name: Some(GATEWAY_SERVICE.to_string()),
            namespace: Some(MESH_NAMESPACE.to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("10.43.0.80".to_string()),
            ports: Some(vec![ServicePort {
                name: Some("tls".to_string()),
                port: 15443,
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    });
    fake.set_deployment(MESH_NAMESPACE, "istiod", 1, 1);
    fake.set_deployment(MESH_NAMESPACE, GATEWAY_SERVICE, 1, 1);
    fake.set_daemon_set(MESH_NAMESPACE, "ztunnel", 1, 1);
    fake
}

fn context(
    role: ClusterRole,
    cluster: &Arc<FakeControlPlane>,
    tooling: Arc<SimulatedTooling>,
    root: &std::path::Path,
) -> StepContext {
    let mut config = BootstrapConfig::for_role(role);
    config.project_root = Some(root.to_path_buf());
    config.health.dns_name = "localhost".to_string();
    StepContext::new(config, cluster.clone(), tooling)
        .with_transit(TransitProvisioner::Secondary)
        .with_credential_connector(Arc::new(FakeCredentialConnector::read_only()))
}

#[tokio::test(start_paused = true)]
async fn test_secondary_bootstrap_converges() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join(".env"), "CLUSTER_DOMAIN=example.com\n").unwrap();
    let cluster = nas_cluster();
    let tooling = Arc::new(SimulatedTooling::new(&cluster));
    let ctx = context(ClusterRole::Secondary, &cluster, tooling.clone(), root.path());

    let mut orchestrator = Orchestrator::new(sequence_for(ClusterRole::Secondary));
    let summary = orchestrator.run(&ctx).await.unwrap();

    let failed: Vec<_> = summary
        .steps
        .iter()
        .filter(|s| s.status != StepStatus::Completed)
        .map(|s| (s.name.clone(), s.error.clone()))
        .collect();
    assert!(failed.is_empty(), "unexpected failures: {failed:?}");
    assert_eq!(summary.warnings().count(), 0);

    assert!(tooling
        .log()
        .contains(&format!("kubectl apply -f {FLUX_INSTALL_MANIFEST}")));
    assert!(cluster.secret(FLUX_NAMESPACE, "cluster-vars").is_some());
    let registry = cluster
        .config_map(FLUX_NAMESPACE, "cluster-discovery")
        .and_then(|cm| cm.data)
        .unwrap();
    assert!(registry["nas"].starts_with("https://192.168.1.42:6443"));

    let vars = cluster.secret(FLUX_NAMESPACE, "cluster-vars").unwrap().data.unwrap();
    assert_eq!(vars["CLUSTER_DOMAIN"].0, b"example.com");
    assert_eq!(vars["NAS_EW_GATEWAY_ADDR"].0, b"10.43.0.80");
    assert_eq!(vars["NAS_EW_GATEWAY_PORT"].0, b"15443");
}

#[tokio::test(start_paused = true)]
async fn test_rerun_skips_completed_steps() {
    let root = tempfile::tempdir().unwrap();
    let cluster = nas_cluster();
    let tooling = Arc::new(SimulatedTooling::new(&cluster));
    let ctx = context(ClusterRole::Secondary, &cluster, tooling.clone(), root.path());

    Orchestrator::new(sequence_for(ClusterRole::Secondary))
        .run(&ctx)
        .await
        .unwrap();
    let installs = tooling.log().len();

    let summary = Orchestrator::new(sequence_for(ClusterRole::Secondary))
        .run(&ctx)
        .await
        .unwrap();

    let skipped: Vec<_> = summary.skipped().map(|s| s.name.as_str()).collect();
    assert!(skipped.contains(&"install-fluxcd"));
    assert!(skipped.contains(&"bootstrap-gitops"));
    assert!(skipped.contains(&"finalize-mesh"));
    // Storage is already in place, so nothing is applied again.
    assert_eq!(tooling.log().len(), installs);
}

#[tokio::test(start_paused = true)]
async fn test_primary_halts_on_cni_failure() {
    let root = tempfile::tempdir().unwrap();
    let cluster = Arc::new(FakeControlPlane::new("https://192.168.1.67:6443"));
    cluster.add_node("cp-1", true, Some("192.168.1.67"), None);
    let tooling = Arc::new(SimulatedTooling {
        helm_fails: true,
        ..SimulatedTooling::new(&cluster)
    });
    let ctx = context(ClusterRole::Primary, &cluster, tooling, root.path());

    let mut orchestrator = Orchestrator::new(sequence_for(ClusterRole::Primary));
    let err = orchestrator.run(&ctx).await.unwrap_err();

    assert!(format!("{err:#}").contains("step 'install-cilium' failed"));
    let steps = orchestrator.steps();
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[1].status, StepStatus::Failed);
    assert!(steps[2..].iter().all(|s| s.status == StepStatus::Pending));
    assert!(!cluster.calls().iter().any(|call| call == "ensure_namespace"));
}
