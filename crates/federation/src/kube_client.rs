//! [`ControlPlane`] backed by a real API server through kube-rs.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::authentication::v1::TokenRequest;
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, Node, PersistentVolumeClaim, Pod, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::cluster::{ControlPlane, DynamicResourceClient, FIELD_MANAGER};
use crate::error::{ClusterError, Result};
use crate::trust::{CredentialConnector, TrustBundle};

/// Kubernetes API handle for one cluster.
#[derive(Clone)]
pub struct KubeControlPlane {
    client: Client,
    api_server: String,
}

impl KubeControlPlane {
    /// Connect using a kubeconfig file and its current context.
    ///
    /// # Errors
    ///
    /// Returns an error if the kubeconfig cannot be read or the client cannot be created.
    pub async fn from_kubeconfig(path: &Path) -> Result<Self> {
        Self::from_kubeconfig_context(path, None).await
    }

    /// Connect using a kubeconfig file and an explicit context.
    ///
    /// # Errors
    ///
    /// Returns an error if the kubeconfig cannot be read or the client cannot be created.
    pub async fn from_kubeconfig_context(path: &Path, context: Option<&str>) -> Result<Self> {
        let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
            ClusterError::Kubeconfig(format!("failed to read {}: {e}", path.display()))
        })?;

        let options = KubeConfigOptions {
            context: context.map(ToString::to_string),
            ..KubeConfigOptions::default()
        };

        let config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| ClusterError::Kubeconfig(e.to_string()))?;

        Self::from_config(config)
    }

    /// Connect using an in-memory kubeconfig document and its current context.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not parse or names no usable context.
    pub async fn from_kubeconfig_yaml(yaml: &str) -> Result<Self> {
        let kubeconfig = Kubeconfig::from_yaml(yaml)
            .map_err(|e| ClusterError::Kubeconfig(format!("invalid kubeconfig: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| ClusterError::Kubeconfig(e.to_string()))?;
        Self::from_config(config)
    }

    /// Connect using the ambient configuration (`KUBECONFIG`, in-cluster, ...).
    ///
    /// # Errors
    ///
    /// Returns an error if no configuration can be inferred.
    pub async fn infer() -> Result<Self> {
        let config = Config::infer()
            .await
            .map_err(|e| ClusterError::Kubeconfig(e.to_string()))?;
        Self::from_config(config)
    }

    /// Build from an already resolved client configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be created.
    pub fn from_config(config: Config) -> Result<Self> {
        let api_server = config
            .cluster_url
            .to_string()
            .trim_end_matches('/')
            .to_string();
        let client =
            Client::try_from(config).map_err(|e| ClusterError::Kubeconfig(e.to_string()))?;
        Ok(Self { client, api_server })
    }

    /// Underlying kube client.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn cluster_scoped<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::ClusterResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }
}

/// Connects with the kubeconfig embedded in a [`TrustBundle`].
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeconfigConnector;

#[async_trait]
impl CredentialConnector for KubeconfigConnector {
    async fn connect(&self, bundle: &TrustBundle) -> Result<Arc<dyn ControlPlane>> {
        let control_plane =
            KubeControlPlane::from_kubeconfig_yaml(&bundle.synthetic_credential_blob).await?;
        Ok(Arc::new(control_plane))
    }
}

fn object_name(meta: &ObjectMeta) -> Result<&str> {
    meta.name
        .as_deref()
        .ok_or_else(|| ClusterError::Config("object has no metadata.name".to_string()))
}

async fn apply<K>(api: &Api<K>, name: &str, object: &K) -> Result<()>
where
    K: Clone + DeserializeOwned + Serialize + Debug,
{
    api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(object))
        .await?;
    Ok(())
}

async fn delete_if_present<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(resp)) if resp.code == 404 => {
            debug!(name, "Object already absent");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl DynamicResourceClient for KubeControlPlane {
    async fn get_dynamic(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, resource);
        Ok(api.get_opt(name).await?)
    }

    async fn list_dynamic(
        &self,
        resource: &ApiResource,
        namespace: &str,
    ) -> Result<Vec<DynamicObject>> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, resource);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn apply_dynamic(&self, resource: &ApiResource, object: &DynamicObject) -> Result<()> {
        let namespace = object.metadata.namespace.as_deref().ok_or_else(|| {
            ClusterError::Config(format!("{} has no metadata.namespace", resource.kind))
        })?;
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, resource);
        apply(&api, object_name(&object.metadata)?, object).await
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    fn api_server_url(&self) -> String {
        self.api_server.clone()
    }

    async fn server_version(&self) -> Result<String> {
        let info = self.client.apiserver_version().await?;
        Ok(info.git_version)
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let api: Api<Namespace> = self.cluster_scoped();
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = self.cluster_scoped();
        if api.get_opt(name).await?.is_some() {
            return Ok(());
        }

        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };

        match api.create(&PostParams::default(), &namespace).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = self.cluster_scoped();
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_pods(&self, namespace: &str, selector: Option<&str>) -> Result<Vec<Pod>> {
        let api: Api<Pod> = self.namespaced(namespace);
        let params = match selector {
            Some(selector) => ListParams::default().labels(selector),
            None => ListParams::default(),
        };
        Ok(api.list(&params).await?.items)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = self.namespaced(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>> {
        let api: Api<DaemonSet> = self.namespaced(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = self.namespaced(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_services(&self, selector: &str) -> Result<Vec<Service>> {
        let api: Api<Service> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        let api: Api<StorageClass> = self.cluster_scoped();
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = self.namespaced(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let namespace = config_map.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<ConfigMap> = self.namespaced(namespace);
        apply(&api, object_name(&config_map.metadata)?, config_map).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = self.namespaced(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<()> {
        let namespace = secret.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<Secret> = self.namespaced(namespace);
        apply(&api, object_name(&secret.metadata)?, secret).await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Secret> = self.namespaced(namespace);
        delete_if_present(&api, name).await
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>> {
        let api: Api<ServiceAccount> = self.namespaced(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> Result<ServiceAccount> {
        let namespace = account.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<ServiceAccount> = self.namespaced(namespace);
        Ok(api.create(&PostParams::default(), account).await?)
    }

    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<ServiceAccount> = self.namespaced(namespace);
        delete_if_present(&api, name).await
    }

    async fn get_cluster_role(&self, name: &str) -> Result<Option<ClusterRole>> {
        let api: Api<ClusterRole> = self.cluster_scoped();
        Ok(api.get_opt(name).await?)
    }

    async fn apply_cluster_role(&self, role: &ClusterRole) -> Result<()> {
        let api: Api<ClusterRole> = self.cluster_scoped();
        apply(&api, object_name(&role.metadata)?, role).await
    }

    async fn delete_cluster_role(&self, name: &str) -> Result<()> {
        let api: Api<ClusterRole> = self.cluster_scoped();
        delete_if_present(&api, name).await
    }

    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>> {
        let api: Api<ClusterRoleBinding> = self.cluster_scoped();
        Ok(api.get_opt(name).await?)
    }

    async fn apply_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<()> {
        let api: Api<ClusterRoleBinding> = self.cluster_scoped();
        apply(&api, object_name(&binding.metadata)?, binding).await
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()> {
        let api: Api<ClusterRoleBinding> = self.cluster_scoped();
        delete_if_present(&api, name).await
    }

    async fn create_token(
        &self,
        namespace: &str,
        service_account: &str,
        request: &TokenRequest,
    ) -> Result<String> {
        let api: Api<ServiceAccount> = self.namespaced(namespace);
        let response = api
            .create_token_request(service_account, &PostParams::default(), request)
            .await?;

        response
            .status
            .map(|status| status.token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                ClusterError::NotReady(format!("token for {namespace}/{service_account}"))
            })
    }

    async fn create_pvc(&self, claim: &PersistentVolumeClaim) -> Result<()> {
        let namespace = claim.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<PersistentVolumeClaim> = self.namespaced(namespace);
        api.create(&PostParams::default(), claim).await?;
        Ok(())
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = self.namespaced(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = self.namespaced(namespace);
        delete_if_present(&api, name).await
    }
}
