//! In-memory [`ControlPlane`] for tests.
//!
//! State lives behind one mutex and can be mutated while a test is running,
//! which is how waits are driven to completion under paused time.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetStatus, Deployment, DeploymentStatus};
use k8s_openapi::api::authentication::v1::TokenRequest;
use k8s_openapi::api::core::v1::{
    ConfigMap, Node, NodeAddress, NodeCondition, NodeStatus, PersistentVolumeClaim,
    PersistentVolumeClaimStatus, Pod, PodStatus, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;

use serde_json::json;

use crate::cluster::{ControlPlane, DynamicResourceClient};
use crate::error::{ClusterError, Result};
use crate::resources::{ceph_cluster_api, git_repository_api, kustomization_api, FLUX_NAMESPACE};
use crate::trust::{CredentialConnector, TrustBundle};

type Key = (String, String);

#[derive(Default)]
struct State {
    calls: Vec<String>,
    unreachable: bool,
    forbidden: HashSet<String>,
    namespaces: HashSet<String>,
    nodes: Vec<Node>,
    pods: BTreeMap<String, Vec<Pod>>,
    deployments: BTreeMap<Key, Deployment>,
    daemon_sets: BTreeMap<Key, DaemonSet>,
    services: BTreeMap<Key, Service>,
    storage_classes: Vec<StorageClass>,
    config_maps: BTreeMap<Key, ConfigMap>,
    secrets: BTreeMap<Key, Secret>,
    service_accounts: BTreeMap<Key, ServiceAccount>,
    cluster_roles: BTreeMap<String, ClusterRole>,
    bindings: BTreeMap<String, ClusterRoleBinding>,
    pvcs: BTreeMap<Key, PersistentVolumeClaim>,
    pvc_phase: Option<String>,
    dynamic: BTreeMap<(String, String, String), DynamicObject>,
    token_api_available: bool,
    token_failures_remaining: usize,
    issued_tokens: usize,
}

/// Scriptable control plane that records every call it receives.
pub struct FakeControlPlane {
    api_server: String,
    state: Mutex<State>,
}

impl Default for FakeControlPlane {
    fn default() -> Self {
        Self::new("https://127.0.0.1:6443")
    }
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn meta_key(meta: &ObjectMeta) -> Key {
    key(
        meta.namespace.as_deref().unwrap_or("default"),
        meta.name.as_deref().unwrap_or_default(),
    )
}

fn flux_object(resource: &ApiResource, name: &str, ready: Option<bool>) -> DynamicObject {
    let mut object = DynamicObject::new(name, resource).within(FLUX_NAMESPACE);
    object.data = match ready {
        Some(ready) => json!({
            "spec": {},
            "status": {
                "conditions": [{
                    "type": "Ready",
                    "status": if ready { "True" } else { "False" },
                    "reason": if ready { "ReconciliationSucceeded" } else { "Progressing" },
                    "message": if ready { "Applied revision" } else { "reconciliation in progress" },
                }]
            }
        }),
        None => json!({ "spec": {} }),
    };
    object
}

fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.trim().is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.and_then(|l| l.get(k.trim())).map(String::as_str) == Some(v.trim()),
            None => labels.is_some_and(|l| l.contains_key(term.trim())),
        })
}

impl FakeControlPlane {
    /// A reachable, empty cluster.
    #[must_use]
    pub fn new(api_server: &str) -> Self {
        let state = State {
            token_api_available: true,
            ..State::default()
        };
        Self {
            api_server: api_server.to_string(),
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn enter(&self, op: &str) -> Result<MutexGuard<'_, State>> {
        let mut state = self.lock();
        state.calls.push(op.to_string());
        if state.unreachable {
            return Err(ClusterError::Connectivity(format!("{op}: connection refused")));
        }
        if state.forbidden.contains(op) {
            return Err(ClusterError::Permission(format!("{op} is forbidden")));
        }
        Ok(state)
    }

    /// Names of every trait method invoked so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Make every call fail with a connectivity error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Make one operation (by trait method name) fail with a permission error.
    pub fn forbid(&self, op: &str) {
        self.lock().forbidden.insert(op.to_string());
    }

    /// Add a namespace.
    pub fn add_namespace(&self, name: &str) {
        self.lock().namespaces.insert(name.to_string());
    }

    /// Add a node with the given readiness and internal/external addresses.
    pub fn add_node(&self, name: &str, ready: bool, internal_ip: Option<&str>, external_ip: Option<&str>) {
        let mut addresses = Vec::new();
        if let Some(ip) = internal_ip {
            addresses.push(NodeAddress {
                type_: "InternalIP".to_string(),
                address: ip.to_string(),
            });
        }
        if let Some(ip) = external_ip {
            addresses.push(NodeAddress {
                type_: "ExternalIP".to_string(),
                address: ip.to_string(),
            });
        }
        let node = Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            status: Some(NodeStatus {
                addresses: Some(addresses),
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..NodeCondition::default()
                }]),
                ..NodeStatus::default()
            }),
            ..Node::default()
        };
        self.lock().nodes.push(node);
    }

    /// Add a pod with labels and a phase.
    pub fn add_pod(&self, namespace: &str, name: &str, labels: &[(&str, &str)], phase: &str) {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect(),
                ),
                ..ObjectMeta::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..PodStatus::default()
            }),
            ..Pod::default()
        };
        self.lock()
            .pods
            .entry(namespace.to_string())
            .or_default()
            .push(pod);
    }

    /// Add or replace a deployment with replica counts.
    pub fn set_deployment(&self, namespace: &str, name: &str, replicas: i32, ready: i32) {
        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            status: Some(DeploymentStatus {
                replicas: Some(replicas),
                ready_replicas: Some(ready),
                available_replicas: Some(ready),
                ..DeploymentStatus::default()
            }),
            ..Deployment::default()
        };
        self.lock().deployments.insert(key(namespace, name), deployment);
    }

    /// Add or replace a daemon set with desired/ready counts.
    pub fn set_daemon_set(&self, namespace: &str, name: &str, desired: i32, ready: i32) {
        let daemon_set = DaemonSet {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            status: Some(DaemonSetStatus {
                desired_number_scheduled: desired,
                number_ready: ready,
                ..DaemonSetStatus::default()
            }),
            ..DaemonSet::default()
        };
        self.lock().daemon_sets.insert(key(namespace, name), daemon_set);
    }

    /// Add a service.
    pub fn add_service(&self, service: Service) {
        let k = meta_key(&service.metadata);
        self.lock().services.insert(k, service);
    }

    /// Add a storage class, optionally annotated as the default.
    pub fn add_storage_class(&self, name: &str, default: bool) {
        let annotations = default.then(|| {
            BTreeMap::from([(
                "storageclass.kubernetes.io/is-default-class".to_string(),
                "true".to_string(),
            )])
        });
        self.lock().storage_classes.push(StorageClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations,
                ..ObjectMeta::default()
            },
            provisioner: "test".to_string(),
            ..StorageClass::default()
        });
    }

    /// Add or replace a config map.
    pub fn put_config_map(&self, config_map: ConfigMap) {
        let k = meta_key(&config_map.metadata);
        self.lock().config_maps.insert(k, config_map);
    }

    /// Add or replace a secret.
    pub fn put_secret(&self, secret: Secret) {
        let k = meta_key(&secret.metadata);
        self.lock().secrets.insert(k, secret);
    }

    /// Add or replace a cluster role.
    pub fn put_cluster_role(&self, role: ClusterRole) {
        let name = role.metadata.name.clone().unwrap_or_default();
        self.lock().cluster_roles.insert(name, role);
    }

    /// Add or replace a service account.
    pub fn put_service_account(&self, account: ServiceAccount) {
        let k = meta_key(&account.metadata);
        self.lock().service_accounts.insert(k, account);
    }

    /// Add or replace a custom resource.
    pub fn put_dynamic(&self, resource: &ApiResource, object: DynamicObject) {
        let ns = object.metadata.namespace.clone().unwrap_or_default();
        let name = object.metadata.name.clone().unwrap_or_default();
        self.lock()
            .dynamic
            .insert((resource.plural.clone(), ns, name), object);
    }

    /// Add or replace a Flux kustomization in `flux-system`; `ready` of
    /// `None` omits the status entirely.
    pub fn set_kustomization(&self, name: &str, ready: Option<bool>) {
        self.put_dynamic(&kustomization_api(), flux_object(&kustomization_api(), name, ready));
    }

    /// Add or replace a Flux git repository in `flux-system`.
    pub fn set_git_repository(&self, name: &str, ready: Option<bool>) {
        self.put_dynamic(&git_repository_api(), flux_object(&git_repository_api(), name, ready));
    }

    /// Add or replace a Rook `CephCluster` with a status phase.
    pub fn set_ceph_cluster(&self, namespace: &str, name: &str, phase: &str) {
        let mut object = DynamicObject::new(name, &ceph_cluster_api()).within(namespace);
        object.data = json!({ "status": { "phase": phase } });
        self.put_dynamic(&ceph_cluster_api(), object);
    }

    /// Whether the token request API exists (pre-1.24 clusters lack it).
    pub fn set_token_api_available(&self, available: bool) {
        self.lock().token_api_available = available;
    }

    /// Fail the next `n` token requests with a not-ready error.
    pub fn fail_token_requests(&self, n: usize) {
        self.lock().token_failures_remaining = n;
    }

    /// Number of tokens minted so far.
    #[must_use]
    pub fn issued_tokens(&self) -> usize {
        self.lock().issued_tokens
    }

    /// Phase reported by every claim on read, e.g. `Bound`.
    pub fn set_pvc_phase(&self, phase: Option<&str>) {
        self.lock().pvc_phase = phase.map(ToString::to_string);
    }

    /// Claims currently stored.
    #[must_use]
    pub fn pvc_count(&self) -> usize {
        self.lock().pvcs.len()
    }

    /// Service accounts currently stored.
    #[must_use]
    pub fn service_account_count(&self) -> usize {
        self.lock().service_accounts.len()
    }

    /// Cluster roles currently stored.
    #[must_use]
    pub fn cluster_role_count(&self) -> usize {
        self.lock().cluster_roles.len()
    }

    /// Cluster role bindings currently stored.
    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.lock().bindings.len()
    }

    /// Snapshot of a stored secret.
    #[must_use]
    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.lock().secrets.get(&key(namespace, name)).cloned()
    }

    /// Snapshot of a stored config map.
    #[must_use]
    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.lock().config_maps.get(&key(namespace, name)).cloned()
    }

    /// Snapshot of a stored cluster role.
    #[must_use]
    pub fn cluster_role(&self, name: &str) -> Option<ClusterRole> {
        self.lock().cluster_roles.get(name).cloned()
    }

    /// Snapshot of a stored custom resource.
    #[must_use]
    pub fn dynamic(&self, resource: &ApiResource, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.lock()
            .dynamic
            .get(&(resource.plural.clone(), namespace.to_string(), name.to_string()))
            .cloned()
    }
}

#[async_trait]
impl DynamicResourceClient for FakeControlPlane {
    async fn get_dynamic(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let state = self.enter("get_dynamic")?;
        Ok(state
            .dynamic
            .get(&(resource.plural.clone(), namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_dynamic(
        &self,
        resource: &ApiResource,
        namespace: &str,
    ) -> Result<Vec<DynamicObject>> {
        let state = self.enter("list_dynamic")?;
        Ok(state
            .dynamic
            .iter()
            .filter(|((plural, ns, _), _)| *plural == resource.plural && ns == namespace)
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn apply_dynamic(&self, resource: &ApiResource, object: &DynamicObject) -> Result<()> {
        let mut state = self.enter("apply_dynamic")?;
        let ns = object.metadata.namespace.clone().unwrap_or_default();
        let name = object.metadata.name.clone().unwrap_or_default();
        let key = (resource.plural.clone(), ns, name);
        let mut applied = object.clone();
        // Server-side apply leaves the status subresource alone.
        if let Some(status) = state.dynamic.get(&key).and_then(|o| o.data.get("status")) {
            applied.data["status"] = status.clone();
        }
        state.dynamic.insert(key, applied);
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    fn api_server_url(&self) -> String {
        self.api_server.clone()
    }

    async fn server_version(&self) -> Result<String> {
        self.enter("server_version")?;
        Ok("v1.31.0".to_string())
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let state = self.enter("namespace_exists")?;
        Ok(state.namespaces.contains(name))
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let mut state = self.enter("ensure_namespace")?;
        state.namespaces.insert(name.to_string());
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let state = self.enter("list_nodes")?;
        Ok(state.nodes.clone())
    }

    async fn list_pods(&self, namespace: &str, selector: Option<&str>) -> Result<Vec<Pod>> {
        let state = self.enter("list_pods")?;
        Ok(state
            .pods
            .get(namespace)
            .map(|pods| {
                pods.iter()
                    .filter(|p| {
                        selector.is_none_or(|s| matches_selector(p.metadata.labels.as_ref(), s))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let state = self.enter("get_deployment")?;
        Ok(state.deployments.get(&key(namespace, name)).cloned())
    }

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>> {
        let state = self.enter("get_daemon_set")?;
        Ok(state.daemon_sets.get(&key(namespace, name)).cloned())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let state = self.enter("get_service")?;
        Ok(state.services.get(&key(namespace, name)).cloned())
    }

    async fn list_services(&self, selector: &str) -> Result<Vec<Service>> {
        let state = self.enter("list_services")?;
        Ok(state
            .services
            .values()
            .filter(|s| matches_selector(s.metadata.labels.as_ref(), selector))
            .cloned()
            .collect())
    }

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        let state = self.enter("list_storage_classes")?;
        Ok(state.storage_classes.clone())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let state = self.enter("get_config_map")?;
        Ok(state.config_maps.get(&key(namespace, name)).cloned())
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let mut state = self.enter("apply_config_map")?;
        state
            .config_maps
            .insert(meta_key(&config_map.metadata), config_map.clone());
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let state = self.enter("get_secret")?;
        Ok(state.secrets.get(&key(namespace, name)).cloned())
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<()> {
        let mut state = self.enter("apply_secret")?;
        state.secrets.insert(meta_key(&secret.metadata), secret.clone());
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.enter("delete_secret")?;
        state.secrets.remove(&key(namespace, name));
        Ok(())
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>> {
        let state = self.enter("get_service_account")?;
        Ok(state.service_accounts.get(&key(namespace, name)).cloned())
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> Result<ServiceAccount> {
        let mut state = self.enter("create_service_account")?;
        let k = meta_key(&account.metadata);
        if state.service_accounts.contains_key(&k) {
            return Err(ClusterError::Api {
                code: 409,
                message: format!("serviceaccounts \"{}\" already exists", k.1),
            });
        }
        state.service_accounts.insert(k, account.clone());
        Ok(account.clone())
    }

    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.enter("delete_service_account")?;
        state.service_accounts.remove(&key(namespace, name));
        Ok(())
    }

    async fn get_cluster_role(&self, name: &str) -> Result<Option<ClusterRole>> {
        let state = self.enter("get_cluster_role")?;
        Ok(state.cluster_roles.get(name).cloned())
    }

    async fn apply_cluster_role(&self, role: &ClusterRole) -> Result<()> {
        let mut state = self.enter("apply_cluster_role")?;
        let name = role.metadata.name.clone().unwrap_or_default();
        state.cluster_roles.insert(name, role.clone());
        Ok(())
    }

    async fn delete_cluster_role(&self, name: &str) -> Result<()> {
        let mut state = self.enter("delete_cluster_role")?;
        state.cluster_roles.remove(name);
        Ok(())
    }

    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>> {
        let state = self.enter("get_cluster_role_binding")?;
        Ok(state.bindings.get(name).cloned())
    }

    async fn apply_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<()> {
        let mut state = self.enter("apply_cluster_role_binding")?;
        let name = binding.metadata.name.clone().unwrap_or_default();
        state.bindings.insert(name, binding.clone());
        Ok(())
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()> {
        let mut state = self.enter("delete_cluster_role_binding")?;
        state.bindings.remove(name);
        Ok(())
    }

    async fn create_token(
        &self,
        namespace: &str,
        service_account: &str,
        _request: &TokenRequest,
    ) -> Result<String> {
        let mut state = self.enter("create_token")?;
        if !state.token_api_available {
            return Err(ClusterError::NotFound("tokenrequests".to_string()));
        }
        if !state
            .service_accounts
            .contains_key(&key(namespace, service_account))
        {
            return Err(ClusterError::NotFound(format!(
                "serviceaccounts \"{service_account}\""
            )));
        }
        if state.token_failures_remaining > 0 {
            state.token_failures_remaining -= 1;
            return Err(ClusterError::NotReady("token not issued yet".to_string()));
        }
        state.issued_tokens += 1;
        Ok(format!("token-{service_account}-{}", state.issued_tokens))
    }

    async fn create_pvc(&self, claim: &PersistentVolumeClaim) -> Result<()> {
        let mut state = self.enter("create_pvc")?;
        state.pvcs.insert(meta_key(&claim.metadata), claim.clone());
        Ok(())
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let state = self.enter("get_pvc")?;
        let phase = state.pvc_phase.clone();
        Ok(state.pvcs.get(&key(namespace, name)).cloned().map(|mut claim| {
            claim.status = Some(PersistentVolumeClaimStatus {
                phase: phase.or_else(|| Some("Pending".to_string())),
                ..PersistentVolumeClaimStatus::default()
            });
            claim
        }))
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.enter("delete_pvc")?;
        state.pvcs.remove(&key(namespace, name));
        Ok(())
    }
}

/// [`CredentialConnector`] that hands out a fixed fake as the reader's view.
pub struct FakeCredentialConnector {
    reader: Arc<FakeControlPlane>,
    connected: Mutex<Vec<String>>,
}

impl FakeCredentialConnector {
    #[must_use]
    pub fn new(reader: Arc<FakeControlPlane>) -> Self {
        Self {
            reader,
            connected: Mutex::new(Vec::new()),
        }
    }

    /// A reader that sees one node and is denied secrets.
    #[must_use]
    pub fn read_only() -> Self {
        let reader = FakeControlPlane::default();
        reader.add_node("reader-view", true, Some("10.0.0.1"), None);
        reader.forbid("get_secret");
        Self::new(Arc::new(reader))
    }

    /// The fake every connection resolves to.
    #[must_use]
    pub fn reader(&self) -> &Arc<FakeControlPlane> {
        &self.reader
    }

    /// Remote cluster names of the bundles connected so far.
    #[must_use]
    pub fn connected(&self) -> Vec<String> {
        match self.connected.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl CredentialConnector for FakeCredentialConnector {
    async fn connect(&self, bundle: &TrustBundle) -> Result<Arc<dyn ControlPlane>> {
        if let Ok(mut guard) = self.connected.lock() {
            guard.push(bundle.remote_cluster_name.clone());
        }
        Ok(Arc::clone(&self.reader) as Arc<dyn ControlPlane>)
    }
}
