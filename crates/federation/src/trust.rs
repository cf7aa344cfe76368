//! Cross-cluster trust: minting the read-only credential a remote mesh
//! control plane uses to watch this cluster.
//!
//! Every step is a declarative create-or-update, so [`TrustManager::create_remote_secret`]
//! can be re-run after a partial failure without leaving duplicates behind.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cluster::ControlPlane;
use crate::error::{ClusterError, Result};
use crate::kube_client::KubeconfigConnector;
use crate::kubeconfig::minimal_kubeconfig;
use crate::poll::{poll_with, PollOutcome, PollSpec};
use crate::resources::labels;

/// Namespace holding reader identities and remote secrets.
pub const MESH_NAMESPACE: &str = "istio-system";

/// Audience requested for minted tokens.
pub const TOKEN_AUDIENCE: &str = "https://kubernetes.default.svc.cluster.local";

/// Lifetime requested for minted tokens (one year).
pub const TOKEN_LIFETIME_SECS: i64 = 365 * 24 * 60 * 60;

/// Label marking a secret as a cross-cluster discovery credential.
pub const MULTI_CLUSTER_LABEL: &str = "istio/multiCluster";

const READER_PREFIX: &str = "istio-reader";
const REMOTE_SECRET_PREFIX: &str = "istio-remote-secret";
const CLUSTER_ANNOTATION: &str = "networking.istio.io/cluster";
const LEGACY_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";

/// Identity, role and binding name for a remote cluster.
#[must_use]
pub fn reader_name(remote: &str) -> String {
    format!("{READER_PREFIX}-{remote}")
}

/// Name of the secret wrapping a remote cluster's credential.
#[must_use]
pub fn remote_secret_name(remote: &str) -> String {
    format!("{REMOTE_SECRET_PREFIX}-{remote}")
}

fn read_only(api_group: &str, resources: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(resources.iter().map(ToString::to_string).collect()),
        verbs: ["get", "list", "watch"].map(ToString::to_string).to_vec(),
        ..PolicyRule::default()
    }
}

/// The exact rule set every reader role is reconciled to.
#[must_use]
pub fn canonical_rules() -> Vec<PolicyRule> {
    vec![
        read_only("", &["nodes", "pods", "services", "endpoints"]),
        read_only("discovery.k8s.io", &["endpointslices"]),
        read_only("networking.istio.io", &["*"]),
        read_only("security.istio.io", &["*"]),
    ]
}

/// Credential material for one remote cluster.
#[derive(Clone)]
pub struct TrustBundle {
    pub remote_cluster_name: String,
    pub service_account_name: String,
    pub cluster_role_name: String,
    pub token: String,
    pub ca_certificate: Vec<u8>,
    /// Single-context kubeconfig combining endpoint, CA and token.
    pub synthetic_credential_blob: String,
}

impl std::fmt::Debug for TrustBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustBundle")
            .field("remote_cluster_name", &self.remote_cluster_name)
            .field("service_account_name", &self.service_account_name)
            .field("cluster_role_name", &self.cluster_role_name)
            .field("token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl TrustBundle {
    /// The bundle as a secret for the mesh's multi-cluster secret controller.
    #[must_use]
    pub fn secret(&self) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(remote_secret_name(&self.remote_cluster_name)),
                namespace: Some(MESH_NAMESPACE.to_string()),
                labels: Some(labels([(MULTI_CLUSTER_LABEL, "true")])),
                annotations: Some(labels([(CLUSTER_ANNOTATION, self.remote_cluster_name.as_str())])),
                ..ObjectMeta::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(BTreeMap::from([(
                self.remote_cluster_name.clone(),
                ByteString(self.synthetic_credential_blob.clone().into_bytes()),
            )])),
            ..Secret::default()
        }
    }
}

/// Opens a control plane session authenticated by a bundle's own
/// credential, the way the remote mesh control plane will.
#[async_trait]
pub trait CredentialConnector: Send + Sync {
    /// Build a client from `bundle.synthetic_credential_blob`.
    async fn connect(&self, bundle: &TrustBundle) -> Result<Arc<dyn ControlPlane>>;
}

/// Check that `reader` can see the cluster but cannot read secrets.
///
/// # Errors
///
/// Returns `Credential` when node listing is denied or a secret read is
/// allowed, and any other error unchanged.
pub async fn verify_read_only(reader: &dyn ControlPlane, remote: &str) -> Result<()> {
    let nodes = match reader.list_nodes().await {
        Ok(nodes) => nodes,
        Err(ClusterError::Permission(msg)) => {
            return Err(ClusterError::Credential(format!(
                "reader for {remote} cannot list nodes: {msg}"
            )));
        }
        Err(e) => return Err(e),
    };

    let guarded = remote_secret_name(remote);
    match reader.get_secret(MESH_NAMESPACE, &guarded).await {
        Err(ClusterError::Permission(_)) => {
            debug!(cluster = remote, nodes = nodes.len(), "Reader credential is read-only");
            Ok(())
        }
        Ok(_) => {
            warn!(cluster = remote, "Reader credential can read secrets");
            Err(ClusterError::Credential(format!(
                "reader for {remote} is allowed to read secret {MESH_NAMESPACE}/{guarded}"
            )))
        }
        Err(e) => Err(e),
    }
}

/// Creates and removes reader credentials on one cluster.
pub struct TrustManager {
    control_plane: Arc<dyn ControlPlane>,
    connector: Arc<dyn CredentialConnector>,
    token_poll: PollSpec,
    cancel: CancellationToken,
}

impl TrustManager {
    #[must_use]
    pub fn new(control_plane: Arc<dyn ControlPlane>) -> Self {
        Self {
            control_plane,
            connector: Arc::new(KubeconfigConnector),
            token_poll: PollSpec::new(Duration::from_secs(2), Duration::from_secs(30)),
            cancel: CancellationToken::new(),
        }
    }

    /// Override how bundles are turned into clients for verification.
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn CredentialConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Override how long to wait for a token to materialize.
    #[must_use]
    pub fn with_token_poll(mut self, spec: PollSpec) -> Self {
        self.token_poll = spec;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Provision (or re-provision) the reader identity for `remote` and
    /// return a credential bundle for it.
    ///
    /// # Errors
    ///
    /// Fails if the identity, role or binding cannot be written, or if no
    /// token could be obtained through either issuance path in time.
    #[instrument(skip(self))]
    pub async fn create_remote_secret(&self, remote: &str) -> Result<TrustBundle> {
        info!(cluster = remote, "Creating remote secret");
        let name = reader_name(remote);

        self.ensure_service_account(&name).await?;
        self.ensure_rbac(&name).await?;
        let (token, ca_certificate) = self.wait_for_credentials(&name).await?;

        let blob = minimal_kubeconfig(
            remote,
            &self.control_plane.api_server_url(),
            &ca_certificate,
            &token,
        )?;

        info!(cluster = remote, "Remote secret created");
        Ok(TrustBundle {
            remote_cluster_name: remote.to_string(),
            service_account_name: name.clone(),
            cluster_role_name: name,
            token,
            ca_certificate,
            synthetic_credential_blob: blob,
        })
    }

    /// Authenticate with the bundle's credential and confirm it grants
    /// discovery reads and nothing more.
    ///
    /// # Errors
    ///
    /// Returns an error if no client can be built from the bundle, the
    /// credential is rejected, or it is broader than the reader role.
    #[instrument(skip(self, bundle), fields(cluster = %bundle.remote_cluster_name))]
    pub async fn verify_bundle(&self, bundle: &TrustBundle) -> Result<()> {
        let reader = self.connector.connect(bundle).await?;
        verify_read_only(reader.as_ref(), &bundle.remote_cluster_name).await?;
        info!(cluster = %bundle.remote_cluster_name, "Remote secret credential verified");
        Ok(())
    }

    /// Write a bundle minted elsewhere into this cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret cannot be applied.
    pub async fn install_remote_secret(&self, bundle: &TrustBundle) -> Result<()> {
        self.control_plane.ensure_namespace(MESH_NAMESPACE).await?;
        self.control_plane.apply_secret(&bundle.secret()).await?;
        info!(cluster = %bundle.remote_cluster_name, "Installed remote secret");
        Ok(())
    }

    /// Remove everything [`Self::create_remote_secret`] and
    /// [`Self::install_remote_secret`] created for `remote`.
    ///
    /// # Errors
    ///
    /// Returns an error if any delete call fails for a reason other than absence.
    pub async fn delete_remote_secret(&self, remote: &str) -> Result<()> {
        let name = reader_name(remote);
        let cp = &self.control_plane;
        cp.delete_secret(MESH_NAMESPACE, &remote_secret_name(remote)).await?;
        cp.delete_cluster_role_binding(&name).await?;
        cp.delete_cluster_role(&name).await?;
        cp.delete_service_account(MESH_NAMESPACE, &name).await?;
        info!(cluster = remote, "Removed remote credentials");
        Ok(())
    }

    async fn ensure_service_account(&self, name: &str) -> Result<ServiceAccount> {
        let cp = &self.control_plane;
        cp.ensure_namespace(MESH_NAMESPACE).await?;

        if let Some(existing) = cp.get_service_account(MESH_NAMESPACE, name).await? {
            debug!(service_account = name, "Reusing service account");
            return Ok(existing);
        }

        let account = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(MESH_NAMESPACE.to_string()),
                ..ObjectMeta::default()
            },
            ..ServiceAccount::default()
        };
        match cp.create_service_account(&account).await {
            Ok(created) => Ok(created),
            // Lost a race with another creator; the account is there now.
            Err(ClusterError::Api { code: 409, .. }) => cp
                .get_service_account(MESH_NAMESPACE, name)
                .await?
                .ok_or_else(|| ClusterError::NotFound(format!("serviceaccount {name}"))),
            Err(e) => Err(e),
        }
    }

    async fn ensure_rbac(&self, name: &str) -> Result<()> {
        let role = ClusterRole {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            rules: Some(canonical_rules()),
            ..ClusterRole::default()
        };
        self.control_plane.apply_cluster_role(&role).await?;

        let binding = ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: name.to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: name.to_string(),
                namespace: Some(MESH_NAMESPACE.to_string()),
                ..Subject::default()
            }]),
        };
        self.control_plane.apply_cluster_role_binding(&binding).await
    }

    async fn wait_for_credentials(&self, name: &str) -> Result<(String, Vec<u8>)> {
        let found: Mutex<Option<(String, Vec<u8>)>> = Mutex::new(None);
        let slot = &found;
        let this = self;

        let outcome = poll_with(self.token_poll, &self.cancel, move || async move {
            let Some(credentials) = this.try_credentials(name).await? else {
                return Ok(false);
            };
            if let Ok(mut guard) = slot.lock() {
                *guard = Some(credentials);
            }
            Ok(true)
        })
        .await?;

        let credentials = found.into_inner().ok().flatten();
        match (outcome, credentials) {
            (PollOutcome::Satisfied, Some(credentials)) => Ok(credentials),
            (outcome, _) => Err(outcome.into_timeout(
                format!("token for serviceaccount {MESH_NAMESPACE}/{name}"),
                self.token_poll.timeout,
            )),
        }
    }

    /// One attempt at token and CA retrieval; `None` means "not yet".
    async fn try_credentials(&self, name: &str) -> Result<Option<(String, Vec<u8>)>> {
        let cp = &self.control_plane;
        let Some(account) = cp.get_service_account(MESH_NAMESPACE, name).await? else {
            return Ok(None);
        };

        let request = TokenRequest {
            spec: TokenRequestSpec {
                audiences: vec![TOKEN_AUDIENCE.to_string()],
                expiration_seconds: Some(TOKEN_LIFETIME_SECS),
                ..TokenRequestSpec::default()
            },
            ..TokenRequest::default()
        };
        let minted = match cp.create_token(MESH_NAMESPACE, name, &request).await {
            Ok(token) => Some(token),
            Err(e @ ClusterError::Permission(_)) => return Err(e),
            Err(e) => {
                debug!(error = %e, "Token request failed, checking legacy token secrets");
                None
            }
        };

        let root_ca = cp
            .get_config_map("kube-system", "kube-root-ca.crt")
            .await?
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove("ca.crt"))
            .map(String::into_bytes);

        if let (Some(token), Some(ca)) = (&minted, &root_ca) {
            return Ok(Some((token.clone(), ca.clone())));
        }

        let (legacy_token, legacy_ca) = self.legacy_credentials(&account).await?;
        match (minted.or(legacy_token), root_ca.or(legacy_ca)) {
            (Some(token), Some(ca)) => Ok(Some((token, ca))),
            _ => Ok(None),
        }
    }

    /// Token and CA from a pre-provisioned token secret bound to the account.
    async fn legacy_credentials(
        &self,
        account: &ServiceAccount,
    ) -> Result<(Option<String>, Option<Vec<u8>>)> {
        for reference in account.secrets.iter().flatten() {
            let Some(secret_name) = reference.name.as_deref() else {
                continue;
            };
            let Some(secret) = self
                .control_plane
                .get_secret(MESH_NAMESPACE, secret_name)
                .await?
            else {
                continue;
            };
            if secret.type_.as_deref() != Some(LEGACY_TOKEN_TYPE) {
                continue;
            }
            let mut data = secret.data.unwrap_or_default();
            let token = data
                .remove("token")
                .and_then(|b| String::from_utf8(b.0).ok());
            let ca = data.remove("ca.crt").map(|b| b.0);
            if token.is_some() || ca.is_some() {
                return Ok((token, ca));
            }
        }
        Ok((None, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubeconfig::current_server;
    use crate::testing::{FakeControlPlane, FakeCredentialConnector};
    use k8s_openapi::api::core::v1::{ConfigMap, ObjectReference};

    fn root_ca(fake: &FakeControlPlane) {
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
    }

    fn manager(fake: &Arc<FakeControlPlane>) -> TrustManager {
        TrustManager::new(Arc::clone(fake) as Arc<dyn ControlPlane>)
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_remote_secret_builds_bundle() {
        let fake = Arc::new(FakeControlPlane::new("https://192.168.1.67:6443"));
        root_ca(&fake);

        let bundle = manager(&fake).create_remote_secret("nas").await.unwrap();

        assert_eq!(bundle.service_account_name, "istio-reader-nas");
        assert_eq!(bundle.cluster_role_name, "istio-reader-nas");
        assert_eq!(bundle.ca_certificate, b"-----BEGIN CERTIFICATE-----");
        assert_eq!(
            current_server(&bundle.synthetic_credential_blob).unwrap(),
            "https://192.168.1.67:6443"
        );

        let secret = bundle.secret();
        assert_eq!(secret.metadata.name.as_deref(), Some("istio-remote-secret-nas"));
        assert_eq!(
            secret.metadata.labels.unwrap().get(MULTI_CLUSTER_LABEL).map(String::as_str),
            Some("true")
        );
        assert!(secret.data.unwrap().contains_key("nas"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_twice_yields_single_identity() {
        let fake = Arc::new(FakeControlPlane::default());
        root_ca(&fake);
        let trust = manager(&fake);

        trust.create_remote_secret("nas").await.unwrap();
        let second = trust.create_remote_secret("nas").await.unwrap();

        assert_eq!(fake.service_account_count(), 1);
        assert_eq!(fake.cluster_role_count(), 1);
        assert_eq!(fake.binding_count(), 1);
        assert!(!second.token.is_empty());
        let rules = fake.cluster_role("istio-reader-nas").unwrap().rules.unwrap();
        assert!(rules
            .iter()
            .all(|r| r.verbs == vec!["get".to_string(), "list".to_string(), "watch".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_role_rules_are_overwritten() {
        let fake = Arc::new(FakeControlPlane::default());
        root_ca(&fake);
        fake.put_cluster_role(ClusterRole {
            metadata: ObjectMeta {
                name: Some("istio-reader-nas".to_string()),
                ..ObjectMeta::default()
            },
            rules: Some(vec![read_only("", &["secrets"]), read_only("apps", &["*"])]),
            ..ClusterRole::default()
        });

        manager(&fake).create_remote_secret("nas").await.unwrap();

        let rules = fake.cluster_role("istio-reader-nas").unwrap().rules.unwrap();
        assert_eq!(rules, canonical_rules());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_eventually_materializes() {
        let fake = Arc::new(FakeControlPlane::default());
        root_ca(&fake);
        fake.fail_token_requests(3);

        let bundle = manager(&fake).create_remote_secret("homelab").await.unwrap();

        assert_eq!(bundle.token, "token-istio-reader-homelab-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_token_secret_fallback() {
        let fake = Arc::new(FakeControlPlane::default());
        fake.set_token_api_available(false);
        fake.put_service_account(ServiceAccount {
            metadata: ObjectMeta {
                name: Some("istio-reader-nas".to_string()),
                namespace: Some(MESH_NAMESPACE.to_string()),
                ..ObjectMeta::default()
            },
            secrets: Some(vec![ObjectReference {
                name: Some("istio-reader-nas-token-abcde".to_string()),
                ..ObjectReference::default()
            }]),
            ..ServiceAccount::default()
        });
        fake.put_secret(Secret {
            metadata: ObjectMeta {
                name: Some("istio-reader-nas-token-abcde".to_string()),
                namespace: Some(MESH_NAMESPACE.to_string()),
                ..ObjectMeta::default()
            },
            type_: Some(LEGACY_TOKEN_TYPE.to_string()),
            data: Some(BTreeMap::from([
                ("token".to_string(), ByteString(b"legacy-token".to_vec())),
                ("ca.crt".to_string(), ByteString(b"legacy-ca".to_vec())),
            ])),
            ..Secret::default()
        });

        let bundle = manager(&fake).create_remote_secret("nas").await.unwrap();

        assert_eq!(bundle.token, "legacy-token");
        assert_eq!(bundle.ca_certificate, b"legacy-ca");
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_timeout_is_fatal_and_retryable() {
        let fake = Arc::new(FakeControlPlane::default());
        root_ca(&fake);
        fake.set_token_api_available(false);
        let trust = manager(&fake);

        let err = trust.create_remote_secret("nas").await.unwrap_err();
        assert!(matches!(err, ClusterError::Timeout { .. }));
        assert_eq!(fake.service_account_count(), 1);

        fake.set_token_api_available(true);
        trust.create_remote_secret("nas").await.unwrap();
        assert_eq!(fake.service_account_count(), 1);
        assert_eq!(fake.cluster_role_count(), 1);
    }

    #[tokio::test]
    async fn test_role_write_failure_aborts() {
        let fake = Arc::new(FakeControlPlane::default());
        root_ca(&fake);
        fake.forbid("apply_cluster_role");

        let err = manager(&fake).create_remote_secret("nas").await.unwrap_err();

        assert!(err.is_permission());
        assert_eq!(fake.issued_tokens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_and_delete_remote_secret() {
        let fake = Arc::new(FakeControlPlane::default());
        root_ca(&fake);
        let trust = manager(&fake);
        let bundle = trust.create_remote_secret("nas").await.unwrap();

        trust.install_remote_secret(&bundle).await.unwrap();
        assert!(fake.secret(MESH_NAMESPACE, "istio-remote-secret-nas").is_some());

        trust.delete_remote_secret("nas").await.unwrap();
        assert!(fake.secret(MESH_NAMESPACE, "istio-remote-secret-nas").is_none());
        assert_eq!(fake.service_account_count(), 0);
        assert_eq!(fake.cluster_role_count(), 0);
        assert_eq!(fake.binding_count(), 0);

        trust.delete_remote_secret("nas").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_bundle_with_read_only_reader() {
        let fake = Arc::new(FakeControlPlane::default());
        root_ca(&fake);
        let connector = Arc::new(FakeCredentialConnector::read_only());
        let trust = manager(&fake).with_connector(Arc::clone(&connector) as Arc<dyn CredentialConnector>);

        let bundle = trust.create_remote_secret("nas").await.unwrap();
        trust.verify_bundle(&bundle).await.unwrap();

        assert_eq!(connector.connected(), vec!["nas".to_string()]);
        let reader_calls = connector.reader().calls();
        assert_eq!(reader_calls, vec!["list_nodes", "get_secret"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_bundle_rejects_reader_with_secret_access() {
        let fake = Arc::new(FakeControlPlane::default());
        root_ca(&fake);
        let reader = Arc::new(FakeControlPlane::default());
        reader.add_node("n1", true, Some("10.0.0.5"), None);
        let trust = manager(&fake)
            .with_connector(Arc::new(FakeCredentialConnector::new(reader)));

        let bundle = trust.create_remote_secret("nas").await.unwrap();
        let err = trust.verify_bundle(&bundle).await.unwrap_err();

        assert!(matches!(err, ClusterError::Credential(_)), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_reader_denied_nodes_is_rejected() {
        let reader = FakeControlPlane::default();
        reader.forbid("list_nodes");
        reader.forbid("get_secret");

        let err = verify_read_only(&reader, "nas").await.unwrap_err();

        assert!(matches!(err, ClusterError::Credential(_)));
        assert_eq!(reader.calls(), vec!["list_nodes"]);
    }

    #[tokio::test]
    async fn test_unreachable_reader_keeps_connectivity_error() {
        let reader = FakeControlPlane::default();
        reader.set_unreachable(true);

        let err = verify_read_only(&reader, "nas").await.unwrap_err();

        assert!(err.is_transient());
    }
}
