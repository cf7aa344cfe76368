//! Vault transit token for auto-unseal.
//!
//! The primary cluster's Vault unseals itself through the transit engine of
//! the Vault running on the NAS. The primary needs a token for that engine;
//! the NAS needs nothing, since it is the provider.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use federation::resources::FLUX_NAMESPACE;
use federation::ControlPlane;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::config::VaultSettings;
use crate::secrets::{opaque_secret, secret_value, REFLECTOR_ANNOTATIONS};

/// Namespace of the transit token secret.
pub const TRANSIT_SECRET_NAMESPACE: &str = "vault";
/// Name of the transit token secret.
pub const TRANSIT_SECRET_NAME: &str = "vault-transit-token";
/// Transit key and policy name.
pub const AUTOUNSEAL: &str = "autounseal";

const NAS_VAULT_SERVICE: &str = "vault-vault-nas";
const NAS_VAULT_NODE_PORT: u16 = 61200;
const NAS_HOST_OCTET: &str = "42";

const AUTOUNSEAL_POLICY: &str = r#"path "transit/encrypt/autounseal" {
  capabilities = ["update"]
}

path "transit/decrypt/autounseal" {
  capabilities = ["update"]
}

path "transit/keys/autounseal" {
  capabilities = ["read"]
}
"#;

/// Minimal Vault HTTP client for the transit setup.
pub struct VaultClient {
    http: reqwest::Client,
    address: String,
    token: String,
}

impl VaultClient {
    /// Client for `address` authenticated with `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(address: &str, token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            address: address.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// `None` for a 404, the JSON body (or `Null`) otherwise.
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Option<Value>> {
        let url = format!("{}/v1/{path}", self.address);
        let mut request = self
            .http
            .request(method.clone(), &url)
            .header("X-Vault-Token", &self.token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach Vault at {}", self.address))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("Vault {method} {path} failed with {status}: {text}");
        }
        if text.trim().is_empty() {
            return Ok(Some(Value::Null));
        }
        let value = serde_json::from_str(&text)
            .with_context(|| format!("Invalid JSON from Vault {method} {path}"))?;
        Ok(Some(value))
    }

    /// Enable the transit secrets engine at `transit/` unless it is mounted.
    ///
    /// # Errors
    ///
    /// Returns an error if Vault rejects either request.
    pub async fn ensure_transit_mount(&self) -> Result<()> {
        let mounts = self
            .request(Method::GET, "sys/mounts", None)
            .await?
            .unwrap_or(Value::Null);
        let mounted = mounts.get("transit/").is_some()
            || mounts.get("data").and_then(|d| d.get("transit/")).is_some();
        if mounted {
            debug!("Transit engine already enabled");
            return Ok(());
        }

        info!("Enabling transit secrets engine");
        self.request(Method::POST, "sys/mounts/transit", Some(json!({ "type": "transit" })))
            .await?;
        Ok(())
    }

    /// Create a transit key unless it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if Vault rejects the request.
    pub async fn ensure_transit_key(&self, name: &str) -> Result<()> {
        let path = format!("transit/keys/{name}");
        if self.request(Method::GET, &path, None).await?.is_some() {
            debug!(key = name, "Transit key already exists");
            return Ok(());
        }
        info!(key = name, "Creating transit key");
        self.request(Method::POST, &path, Some(json!({}))).await?;
        Ok(())
    }

    /// Create or replace an ACL policy.
    ///
    /// # Errors
    ///
    /// Returns an error if Vault rejects the request.
    pub async fn write_policy(&self, name: &str, policy: &str) -> Result<()> {
        self.request(
            Method::PUT,
            &format!("sys/policies/acl/{name}"),
            Some(json!({ "policy": policy })),
        )
        .await?;
        Ok(())
    }

    /// Create a renewable, year-long token carrying `policy`.
    ///
    /// # Errors
    ///
    /// Returns an error if Vault rejects the request or returns no token.
    pub async fn create_token(&self, policy: &str) -> Result<String> {
        let body = json!({
            "policies": [policy],
            "ttl": "8760h",
            "renewable": true,
            "metadata": { "purpose": "k8s-vault-autounseal", "cluster": "homelab" },
        });
        let response = self
            .request(Method::POST, "auth/token/create", Some(body))
            .await?
            .unwrap_or(Value::Null);

        response
            .get("auth")
            .and_then(|a| a.get("client_token"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .context("Vault token response has no auth.client_token")
    }

    /// Mount, key, policy and token for auto-unseal, in that order.
    ///
    /// # Errors
    ///
    /// Returns the first Vault error.
    pub async fn provision_autounseal_token(&self) -> Result<String> {
        self.ensure_transit_mount().await?;
        self.ensure_transit_key(AUTOUNSEAL).await?;
        self.write_policy(AUTOUNSEAL, AUTOUNSEAL_POLICY).await?;
        self.create_token(AUTOUNSEAL).await
    }
}

/// Where to find the NAS Vault and how to authenticate to it.
#[derive(Clone, Default)]
pub struct VaultTransit {
    address: Option<String>,
    root_token: Option<String>,
}

impl std::fmt::Debug for VaultTransit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultTransit")
            .field("address", &self.address)
            .field("root_token", &self.root_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl VaultTransit {
    /// Resolve address and root token from settings and the environment.
    #[must_use]
    pub fn from_settings<F>(settings: &VaultSettings, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| lookup(*k).filter(|v| !v.trim().is_empty()))
        };
        Self {
            address: settings
                .address
                .clone()
                .or_else(|| first(&["QNAP_VAULT_ADDR", "NAS_VAULT_ADDR"])),
            root_token: first(&["QNAP_VAULT_TOKEN", "VAULT_ROOT_TOKEN", "NAS_VAULT_TOKEN"])
                .or_else(|| settings.token.clone()),
        }
    }

    /// Whether a root token was found.
    #[must_use]
    pub fn has_root_token(&self) -> bool {
        self.root_token.is_some()
    }

    /// Explicit address and token.
    #[must_use]
    pub fn new(address: Option<String>, root_token: Option<String>) -> Self {
        Self {
            address,
            root_token,
        }
    }

    /// NAS Vault address: in-cluster service, then configuration, then the
    /// NAS host derived from the first node address.
    async fn resolve_address(&self, control_plane: &dyn ControlPlane) -> Option<String> {
        match control_plane
            .get_service(TRANSIT_SECRET_NAMESPACE, NAS_VAULT_SERVICE)
            .await
        {
            Ok(Some(_)) => {
                return Some(format!(
                    "http://{NAS_VAULT_SERVICE}.{TRANSIT_SECRET_NAMESPACE}.svc.cluster.local:8200"
                ))
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "Failed to look up NAS Vault service"),
        }

        if let Some(address) = &self.address {
            return Some(address.clone());
        }

        let nodes = control_plane.list_nodes().await.ok()?;
        let ip = nodes
            .iter()
            .filter_map(|n| n.status.as_ref()?.addresses.as_ref())
            .flatten()
            .find(|a| a.type_ == "InternalIP")
            .map(|a| a.address.clone())?;
        let (prefix, _) = ip.rsplit_once('.')?;
        Some(format!("http://{prefix}.{NAS_HOST_OCTET}:{NAS_VAULT_NODE_PORT}"))
    }

    async fn existing_token(control_plane: &dyn ControlPlane) -> Result<Option<String>> {
        Ok(control_plane
            .get_secret(TRANSIT_SECRET_NAMESPACE, TRANSIT_SECRET_NAME)
            .await?
            .and_then(|s| secret_value(&s, "token")))
    }

    async fn ensure_token(&self, control_plane: &dyn ControlPlane) -> Result<String> {
        if let Some(token) = Self::existing_token(control_plane).await? {
            info!("Reusing existing transit token");
            return Ok(token);
        }

        let address = self
            .resolve_address(control_plane)
            .await
            .context("Cannot determine the NAS Vault address; set NAS_VAULT_ADDR")?;
        let root_token = self
            .root_token
            .as_deref()
            .context("No NAS Vault token; set QNAP_VAULT_TOKEN, VAULT_ROOT_TOKEN or NAS_VAULT_TOKEN")?;

        info!(%address, "Provisioning transit token");
        VaultClient::new(&address, root_token)?
            .provision_autounseal_token()
            .await
    }
}

/// Transit token provisioning, selected by cluster role.
#[derive(Debug, Clone)]
pub enum TransitProvisioner {
    /// Consumer of the NAS transit engine.
    Primary(VaultTransit),
    /// Provider; needs no token.
    Secondary,
}

impl TransitProvisioner {
    #[must_use]
    pub fn for_role(is_secondary: bool, transit: VaultTransit) -> Self {
        if is_secondary {
            Self::Secondary
        } else {
            Self::Primary(transit)
        }
    }

    /// Make sure the transit token secret exists, returning the token.
    ///
    /// # Errors
    ///
    /// Returns an error if a token is needed but cannot be obtained or stored.
    #[instrument(skip_all)]
    pub async fn ensure_token(&self, control_plane: &dyn ControlPlane) -> Result<Option<String>> {
        match self {
            Self::Secondary => {
                debug!("Secondary cluster provides transit, no token needed");
                Ok(None)
            }
            Self::Primary(transit) => {
                let token = transit.ensure_token(control_plane).await?;
                store_transit_token(control_plane, &token).await?;
                Ok(Some(token))
            }
        }
    }
}

/// Write the token into `vault/vault-transit-token` and a copy in
/// `flux-system` for variable substitution.
///
/// # Errors
///
/// Returns an error if a namespace or secret cannot be written.
pub async fn store_transit_token(control_plane: &dyn ControlPlane, token: &str) -> Result<()> {
    let data = BTreeMap::from([
        ("token".to_string(), token.to_string()),
        ("vault_transit_token".to_string(), token.to_string()),
    ]);

    for (namespace, annotations) in [
        (TRANSIT_SECRET_NAMESPACE, &REFLECTOR_ANNOTATIONS[..]),
        (FLUX_NAMESPACE, &[][..]),
    ] {
        control_plane
            .ensure_namespace(namespace)
            .await
            .with_context(|| format!("Failed to ensure namespace {namespace}"))?;
        let secret = opaque_secret(namespace, TRANSIT_SECRET_NAME, &data, annotations);
        if let Err(e) = control_plane.apply_secret(&secret).await {
            warn!(namespace, error = %e, "Failed to store transit token");
            return Err(e).with_context(|| format!("Failed to store {namespace}/{TRANSIT_SECRET_NAME}"));
        }
    }
    info!("Stored transit token");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use federation::testing::FakeControlPlane;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn vault_without_transit() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/sys/mounts"))
            .and(header("X-Vault-Token", "root"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sys/": {} })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/sys/mounts/transit"))
            .and(body_partial_json(json!({ "type": "transit" })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/transit/keys/autounseal"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/transit/keys/autounseal"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/sys/policies/acl/autounseal"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/token/create"))
            .and(body_partial_json(json!({ "policies": ["autounseal"], "ttl": "8760h" })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "auth": { "client_token": "hvs.transit" } })),
            )
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_provisions_mount_key_policy_and_token() {
        let server = vault_without_transit().await;
        let client = VaultClient::new(&server.uri(), "root").unwrap();

        let token = client.provision_autounseal_token().await.unwrap();
        assert_eq!(token, "hvs.transit");
    }

    #[tokio::test]
    async fn test_existing_mount_under_data_is_detected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/sys/mounts"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "data": { "transit/": {} } })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/sys/mounts/transit"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;

        VaultClient::new(&server.uri(), "root")
            .unwrap()
            .ensure_transit_mount()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_vault_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/sys/mounts"))
            .respond_with(ResponseTemplate::new(403).set_body_string("permission denied"))
            .mount(&server)
            .await;

        let err = VaultClient::new(&server.uri(), "bad")
            .unwrap()
            .provision_autounseal_token()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("403"));
    }

    #[tokio::test]
    async fn test_secondary_needs_no_token() {
        let fake = FakeControlPlane::default();
        let provisioner = TransitProvisioner::for_role(true, VaultTransit::default());

        assert_eq!(provisioner.ensure_token(&fake).await.unwrap(), None);
        assert_eq!(fake.call_count(), 0);
    }

    #[tokio::test]
    async fn test_primary_reuses_existing_secret() {
        let fake = FakeControlPlane::default();
        let data = BTreeMap::from([("token".to_string(), "hvs.existing".to_string())]);
        fake.put_secret(opaque_secret(TRANSIT_SECRET_NAMESPACE, TRANSIT_SECRET_NAME, &data, &[]));

        let provisioner = TransitProvisioner::for_role(false, VaultTransit::default());
        let token = provisioner.ensure_token(&fake).await.unwrap();

        assert_eq!(token.as_deref(), Some("hvs.existing"));
        let copy = fake.secret(FLUX_NAMESPACE, TRANSIT_SECRET_NAME).unwrap();
        assert_eq!(secret_value(&copy, "vault_transit_token").as_deref(), Some("hvs.existing"));
    }

    #[tokio::test]
    async fn test_primary_provisions_and_stores_token() {
        let server = vault_without_transit().await;
        let fake = FakeControlPlane::default();
        let provisioner = TransitProvisioner::for_role(
            false,
            VaultTransit::new(Some(server.uri()), Some("root".to_string())),
        );

        let token = provisioner.ensure_token(&fake).await.unwrap();
        assert_eq!(token.as_deref(), Some("hvs.transit"));

        let stored = fake.secret(TRANSIT_SECRET_NAMESPACE, TRANSIT_SECRET_NAME).unwrap();
        assert_eq!(secret_value(&stored, "token").as_deref(), Some("hvs.transit"));
        assert!(stored
            .metadata
            .annotations
            .unwrap()
            .contains_key("reflector.v1.k8s.emberstack.com/reflection-allowed"));
    }

    #[tokio::test]
    async fn test_primary_without_root_token_fails() {
        let fake = FakeControlPlane::default();
        let provisioner = TransitProvisioner::for_role(
            false,
            VaultTransit::new(Some("http://127.0.0.1:1".to_string()), None),
        );
        let err = provisioner.ensure_token(&fake).await.unwrap_err();
        assert!(err.to_string().contains("NAS Vault token"));
    }

    #[tokio::test]
    async fn test_address_resolution_order() {
        let fake = FakeControlPlane::default();
        fake.add_node("cp-1", true, Some("192.168.1.67"), None);

        let transit = VaultTransit::new(None, None);
        assert_eq!(
            transit.resolve_address(&fake).await.as_deref(),
            Some("http://192.168.1.42:61200")
        );

        let transit = VaultTransit::new(Some("http://vault.nas:8200".to_string()), None);
        assert_eq!(
            transit.resolve_address(&fake).await.as_deref(),
            Some("http://vault.nas:8200")
        );

        fake.add_service(Service {
            metadata: ObjectMeta {
                name: Some(NAS_VAULT_SERVICE.to_string()),
                namespace: Some(TRANSIT_SECRET_NAMESPACE.to_string()),
                ..ObjectMeta::default()
            },
            ..Service::default()
        });
        assert_eq!(
            transit.resolve_address(&fake).await.as_deref(),
            Some("http://vault-vault-nas.vault.svc.cluster.local:8200")
        );
    }

    #[test]
    fn test_settings_and_env_lookup() {
        let settings = VaultSettings {
            address: None,
            token: Some("from-config".to_string()),
        };
        let env = |k: &str| match k {
            "NAS_VAULT_ADDR" => Some("http://nas:8200".to_string()),
            "VAULT_ROOT_TOKEN" => Some("from-env".to_string()),
            _ => None,
        };
        let transit = VaultTransit::from_settings(&settings, env);
        assert_eq!(transit.address.as_deref(), Some("http://nas:8200"));
        assert_eq!(transit.root_token.as_deref(), Some("from-env"));

        let transit = VaultTransit::from_settings(&settings, |_| None);
        assert_eq!(transit.root_token.as_deref(), Some("from-config"));
    }
}
