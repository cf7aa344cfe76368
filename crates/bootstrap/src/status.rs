//! Readiness predicates over built-in Kubernetes objects.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::storage::v1::StorageClass;

const DEFAULT_CLASS_ANNOTATIONS: [&str; 2] = [
    "storageclass.kubernetes.io/is-default-class",
    "storageclass.beta.kubernetes.io/is-default-class",
];

/// Ready and desired replica counts of a deployment.
#[must_use]
pub fn deployment_replicas(deployment: &Deployment) -> (i32, i32) {
    let status = deployment.status.as_ref();
    let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
    let desired = status
        .and_then(|s| s.replicas)
        .or_else(|| deployment.spec.as_ref().and_then(|s| s.replicas))
        .unwrap_or(0);
    (ready, desired)
}

/// Every desired replica is ready and there is at least one.
#[must_use]
pub fn deployment_ready(deployment: &Deployment) -> bool {
    let (ready, desired) = deployment_replicas(deployment);
    desired > 0 && ready == desired
}

/// Every scheduled pod of the daemon set is ready.
#[must_use]
pub fn daemon_set_ready(daemon_set: &DaemonSet) -> bool {
    daemon_set
        .status
        .as_ref()
        .is_some_and(|s| s.desired_number_scheduled > 0 && s.number_ready == s.desired_number_scheduled)
}

/// The node's `Ready` condition is `True`.
#[must_use]
pub fn node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// The pod is in phase `Running`.
#[must_use]
pub fn pod_running(pod: &Pod) -> bool {
    pod_phase(pod) == "Running"
}

/// Pod phase, `Unknown` when unreported.
#[must_use]
pub fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown")
}

/// The class carries either default-class annotation set to `true`.
#[must_use]
pub fn is_default_storage_class(class: &StorageClass) -> bool {
    class.metadata.annotations.as_ref().is_some_and(|annotations| {
        DEFAULT_CLASS_ANNOTATIONS
            .iter()
            .any(|key| annotations.get(*key).map(String::as_str) == Some("true"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn deployment(replicas: Option<i32>, ready: Option<i32>) -> Deployment {
        Deployment {
            status: Some(DeploymentStatus {
                replicas,
                ready_replicas: ready,
                ..DeploymentStatus::default()
            }),
            ..Deployment::default()
        }
    }

    #[test]
    fn test_deployment_needs_at_least_one_replica() {
        assert!(deployment_ready(&deployment(Some(2), Some(2))));
        assert!(!deployment_ready(&deployment(Some(2), Some(1))));
        assert!(!deployment_ready(&deployment(Some(0), Some(0))));
        assert!(!deployment_ready(&Deployment::default()));
    }

    #[test]
    fn test_beta_default_annotation_counts() {
        let class = StorageClass {
            metadata: ObjectMeta {
                annotations: Some(BTreeMap::from([(
                    "storageclass.beta.kubernetes.io/is-default-class".to_string(),
                    "true".to_string(),
                )])),
                ..ObjectMeta::default()
            },
            ..StorageClass::default()
        };
        assert!(is_default_storage_class(&class));
        assert!(!is_default_storage_class(&StorageClass::default()));
    }
}
