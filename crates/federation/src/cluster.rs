//! The narrow control-plane boundary every component is written against.
//!
//! Production code uses [`crate::KubeControlPlane`]; tests use the in-memory
//! implementation from [`crate::testing`].

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::authentication::v1::TokenRequest;
use k8s_openapi::api::core::v1::{
    ConfigMap, Node, PersistentVolumeClaim, Pod, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;

use crate::error::Result;

/// Field manager used for every server-side apply.
pub const FIELD_MANAGER: &str = "homelab-bootstrap";

/// Read/apply access to custom resources that have no generated bindings.
///
/// Callers never build API paths themselves; see
/// [`crate::resources::CustomResources`] for typed wrappers.
#[async_trait]
pub trait DynamicResourceClient: Send + Sync {
    /// Fetch one namespaced object, `None` if it does not exist.
    async fn get_dynamic(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// List objects of a kind in a namespace.
    async fn list_dynamic(
        &self,
        resource: &ApiResource,
        namespace: &str,
    ) -> Result<Vec<DynamicObject>>;

    /// Create or update an object with server-side apply.
    async fn apply_dynamic(&self, resource: &ApiResource, object: &DynamicObject) -> Result<()>;
}

/// Operations the bootstrap core needs from a cluster's API server.
///
/// Every mutation is a single declarative create-or-update, and every
/// `get_*` returns `Ok(None)` for an absent object instead of an error.
#[async_trait]
pub trait ControlPlane: DynamicResourceClient {
    /// URL of the API server this handle talks to.
    fn api_server_url(&self) -> String;

    /// Round-trip to the API server, returning its version string.
    async fn server_version(&self) -> Result<String>;

    /// Whether a namespace exists.
    async fn namespace_exists(&self, name: &str) -> Result<bool>;

    /// Create a namespace if it is absent.
    async fn ensure_namespace(&self, name: &str) -> Result<()>;

    /// All nodes in the cluster.
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Pods in a namespace, optionally filtered by label selector.
    async fn list_pods(&self, namespace: &str, selector: Option<&str>) -> Result<Vec<Pod>>;

    /// One deployment.
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    /// One daemon set.
    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>>;

    /// One service.
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// Services in every namespace matching a label selector.
    async fn list_services(&self, selector: &str) -> Result<Vec<Service>>;

    /// All storage classes.
    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>>;

    /// One config map.
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// Create or update a config map.
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()>;

    /// One secret.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Create or update a secret.
    async fn apply_secret(&self, secret: &Secret) -> Result<()>;

    /// Delete a secret; absent secrets are not an error.
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    /// One service account.
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>>;

    /// Create a service account.
    async fn create_service_account(&self, account: &ServiceAccount) -> Result<ServiceAccount>;

    /// Delete a service account; absent accounts are not an error.
    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<()>;

    /// One cluster role.
    async fn get_cluster_role(&self, name: &str) -> Result<Option<ClusterRole>>;

    /// Create or overwrite a cluster role.
    async fn apply_cluster_role(&self, role: &ClusterRole) -> Result<()>;

    /// Delete a cluster role; absent roles are not an error.
    async fn delete_cluster_role(&self, name: &str) -> Result<()>;

    /// One cluster role binding.
    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>>;

    /// Create or overwrite a cluster role binding.
    async fn apply_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<()>;

    /// Delete a cluster role binding; absent bindings are not an error.
    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()>;

    /// Mint a bounded-lifetime token for a service account.
    async fn create_token(
        &self,
        namespace: &str,
        service_account: &str,
        request: &TokenRequest,
    ) -> Result<String>;

    /// Create a persistent volume claim.
    async fn create_pvc(&self, claim: &PersistentVolumeClaim) -> Result<()>;

    /// One persistent volume claim.
    async fn get_pvc(&self, namespace: &str, name: &str)
        -> Result<Option<PersistentVolumeClaim>>;

    /// Delete a persistent volume claim; absent claims are not an error.
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()>;
}
