//! Typed access to the custom resources the bootstrap depends on.
//!
//! Flux and Rook have no generated bindings in k8s-openapi, so these go
//! through [`DynamicResourceClient`] with a fixed [`ApiResource`] per kind.

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde_json::{json, Value};

use crate::cluster::DynamicResourceClient;
use crate::error::Result;

/// Namespace Flux installs into.
pub const FLUX_NAMESPACE: &str = "flux-system";

/// Flux `Kustomization` API resource definition.
#[must_use]
pub fn kustomization_api() -> ApiResource {
    ApiResource {
        group: "kustomize.toolkit.fluxcd.io".to_string(),
        version: "v1".to_string(),
        api_version: "kustomize.toolkit.fluxcd.io/v1".to_string(),
        kind: "Kustomization".to_string(),
        plural: "kustomizations".to_string(),
    }
}

/// Flux `GitRepository` API resource definition.
#[must_use]
pub fn git_repository_api() -> ApiResource {
    ApiResource {
        group: "source.toolkit.fluxcd.io".to_string(),
        version: "v1".to_string(),
        api_version: "source.toolkit.fluxcd.io/v1".to_string(),
        kind: "GitRepository".to_string(),
        plural: "gitrepositories".to_string(),
    }
}

/// Rook `CephCluster` API resource definition.
#[must_use]
pub fn ceph_cluster_api() -> ApiResource {
    ApiResource {
        group: "ceph.rook.io".to_string(),
        version: "v1".to_string(),
        api_version: "ceph.rook.io/v1".to_string(),
        kind: "CephCluster".to_string(),
        plural: "cephclusters".to_string(),
    }
}

/// The `Ready` condition of a Flux object, if it reports one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyCondition {
    /// `True`, `False` or `Unknown`.
    pub status: String,
    /// Machine readable reason.
    pub reason: Option<String>,
    /// Human readable message.
    pub message: Option<String>,
}

impl ReadyCondition {
    /// Whether the condition status is `True`.
    #[must_use]
    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Reconciliation state of one Flux object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileStatus {
    /// Object name.
    pub name: String,
    /// Whether reconciliation is suspended.
    pub suspended: bool,
    /// Parsed `Ready` condition.
    pub ready: Option<ReadyCondition>,
    /// Last applied revision, if reported.
    pub revision: Option<String>,
}

impl ReconcileStatus {
    /// Parse the interesting fields out of a dynamic object.
    #[must_use]
    pub fn from_object(object: &DynamicObject) -> Self {
        let name = object
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| "unknown".to_string());

        let suspended = object
            .data
            .get("spec")
            .and_then(|s| s.get("suspend"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let status = object.data.get("status");

        let ready = status
            .and_then(|s| s.get("conditions"))
            .and_then(Value::as_array)
            .and_then(|conditions| {
                conditions
                    .iter()
                    .find(|c| c.get("type").and_then(Value::as_str) == Some("Ready"))
            })
            .map(|c| ReadyCondition {
                status: c
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown")
                    .to_string(),
                reason: c.get("reason").and_then(Value::as_str).map(ToString::to_string),
                message: c
                    .get("message")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
            });

        let revision = status
            .and_then(|s| s.get("lastAppliedRevision").or_else(|| s.get("artifact")))
            .and_then(|r| r.as_str().or_else(|| r.get("revision").and_then(Value::as_str)))
            .map(ToString::to_string);

        Self {
            name,
            suspended,
            ready,
            revision,
        }
    }

    /// Whether the object reports `Ready=True`.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.as_ref().is_some_and(ReadyCondition::is_true)
    }

    /// Short one-line description for logs and diagnostics.
    #[must_use]
    pub fn summary(&self) -> String {
        match &self.ready {
            Some(c) => format!(
                "{} ready={} reason={} {}",
                self.name,
                c.status,
                c.reason.as_deref().unwrap_or("-"),
                c.message.as_deref().unwrap_or("")
            )
            .trim_end()
            .to_string(),
            None if self.suspended => format!("{} suspended", self.name),
            None => format!("{} (no Ready condition yet)", self.name),
        }
    }
}

/// Phase reported by a `CephCluster`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CephClusterStatus {
    /// `status.phase`, e.g. `Ready` or `Progressing`.
    pub phase: Option<String>,
    /// `status.ceph.health`, e.g. `HEALTH_OK`.
    pub health: Option<String>,
}

/// Desired state for a Flux `GitRepository`.
#[derive(Debug, Clone)]
pub struct GitRepositorySpec {
    /// Object name.
    pub name: String,
    /// Repository URL.
    pub url: String,
    /// Branch to track.
    pub branch: String,
    /// Reconcile interval, e.g. `1m`.
    pub interval: String,
    /// Secret holding credentials, if the repository is private.
    pub secret_ref: Option<String>,
}

/// Desired state for a Flux `Kustomization`.
#[derive(Debug, Clone)]
pub struct KustomizationSpec {
    /// Object name.
    pub name: String,
    /// Path inside the source.
    pub path: String,
    /// Name of the `GitRepository` source.
    pub source: String,
    /// Reconcile interval, e.g. `10m`.
    pub interval: String,
    /// Garbage-collect removed objects.
    pub prune: bool,
    /// Other kustomizations this one waits for.
    pub depends_on: Vec<String>,
}

/// Typed wrapper over a [`DynamicResourceClient`].
pub struct CustomResources<'a, C: ?Sized> {
    client: &'a C,
}

impl<'a, C> CustomResources<'a, C>
where
    C: DynamicResourceClient + ?Sized,
{
    /// Wrap a dynamic client.
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    /// One Flux kustomization in `flux-system`.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails.
    pub async fn kustomization(&self, name: &str) -> Result<Option<ReconcileStatus>> {
        let object = self
            .client
            .get_dynamic(&kustomization_api(), FLUX_NAMESPACE, name)
            .await?;
        Ok(object.as_ref().map(ReconcileStatus::from_object))
    }

    /// Every Flux kustomization in `flux-system`.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails.
    pub async fn kustomizations(&self) -> Result<Vec<ReconcileStatus>> {
        let objects = self
            .client
            .list_dynamic(&kustomization_api(), FLUX_NAMESPACE)
            .await?;
        Ok(objects.iter().map(ReconcileStatus::from_object).collect())
    }

    /// Create or update a Flux kustomization in `flux-system`.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails.
    pub async fn apply_kustomization(&self, spec: &KustomizationSpec) -> Result<()> {
        let resource = kustomization_api();
        let mut object = DynamicObject::new(&spec.name, &resource).within(FLUX_NAMESPACE);

        let mut body = json!({
            "interval": spec.interval,
            "path": spec.path,
            "prune": spec.prune,
            "sourceRef": { "kind": "GitRepository", "name": spec.source },
        });
        if !spec.depends_on.is_empty() {
            body["dependsOn"] = spec
                .depends_on
                .iter()
                .map(|name| json!({ "name": name }))
                .collect();
        }
        object.data = json!({ "spec": body });

        self.client.apply_dynamic(&resource, &object).await
    }

    /// One Flux git repository in `flux-system`.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails.
    pub async fn git_repository(&self, name: &str) -> Result<Option<ReconcileStatus>> {
        let object = self
            .client
            .get_dynamic(&git_repository_api(), FLUX_NAMESPACE, name)
            .await?;
        Ok(object.as_ref().map(ReconcileStatus::from_object))
    }

    /// Create or update a Flux git repository in `flux-system`.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails.
    pub async fn apply_git_repository(&self, spec: &GitRepositorySpec) -> Result<()> {
        let resource = git_repository_api();
        let mut object = DynamicObject::new(&spec.name, &resource).within(FLUX_NAMESPACE);

        let mut body = json!({
            "interval": spec.interval,
            "url": spec.url,
            "ref": { "branch": spec.branch },
        });
        if let Some(secret) = &spec.secret_ref {
            body["secretRef"] = json!({ "name": secret });
        }
        object.data = json!({ "spec": body });

        self.client.apply_dynamic(&resource, &object).await
    }

    /// A Rook `CephCluster`, `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails.
    pub async fn ceph_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CephClusterStatus>> {
        let object = self
            .client
            .get_dynamic(&ceph_cluster_api(), namespace, name)
            .await?;

        Ok(object.map(|o| {
            let status = o.data.get("status");
            CephClusterStatus {
                phase: status
                    .and_then(|s| s.get("phase"))
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                health: status
                    .and_then(|s| s.get("ceph"))
                    .and_then(|c| c.get("health"))
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
            }
        }))
    }
}

/// Label map helper used when building objects.
#[must_use]
pub fn labels<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kustomization(name: &str, data: Value) -> DynamicObject {
        let mut object = DynamicObject::new(name, &kustomization_api()).within(FLUX_NAMESPACE);
        object.data = data;
        object
    }

    #[test]
    fn test_ready_condition_parsed() {
        let object = kustomization(
            "controllers",
            json!({
                "status": {
                    "lastAppliedRevision": "main@sha1:abc",
                    "conditions": [
                        { "type": "Reconciling", "status": "True" },
                        { "type": "Ready", "status": "True", "reason": "ReconciliationSucceeded",
                          "message": "Applied revision: main@sha1:abc" }
                    ]
                }
            }),
        );

        let status = ReconcileStatus::from_object(&object);
        assert!(status.is_ready());
        assert_eq!(status.revision.as_deref(), Some("main@sha1:abc"));
        assert_eq!(
            status.ready.unwrap().reason.as_deref(),
            Some("ReconciliationSucceeded")
        );
    }

    #[test]
    fn test_missing_status_is_not_ready() {
        let status = ReconcileStatus::from_object(&kustomization("platform", json!({})));
        assert!(!status.is_ready());
        assert_eq!(status.summary(), "platform (no Ready condition yet)");
    }

    #[test]
    fn test_false_ready_condition() {
        let object = kustomization(
            "platform-foundation",
            json!({
                "spec": { "suspend": false },
                "status": { "conditions": [
                    { "type": "Ready", "status": "False", "reason": "DependencyNotReady",
                      "message": "dependency 'flux-system/controllers' is not ready" }
                ]}
            }),
        );

        let status = ReconcileStatus::from_object(&object);
        assert!(!status.is_ready());
        assert!(status.summary().contains("DependencyNotReady"));
    }

    #[test]
    fn test_git_repository_revision_from_artifact() {
        let mut object = DynamicObject::new("flux-system", &git_repository_api()).within(FLUX_NAMESPACE);
        object.data = json!({ "status": { "artifact": { "revision": "main@sha1:def" } } });

        let status = ReconcileStatus::from_object(&object);
        assert_eq!(status.revision.as_deref(), Some("main@sha1:def"));
    }

    #[test]
    fn test_api_resources() {
        assert_eq!(kustomization_api().plural, "kustomizations");
        assert_eq!(git_repository_api().group, "source.toolkit.fluxcd.io");
        assert_eq!(ceph_cluster_api().api_version, "ceph.rook.io/v1");
    }
}
