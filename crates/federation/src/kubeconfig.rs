//! Minimal kubeconfig documents: synthesising single-user credentials and
//! reading the API server out of an existing file.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct KubeconfigDoc {
    #[serde(default = "api_version")]
    api_version: String,
    #[serde(default = "kind")]
    kind: String,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    users: Vec<NamedUser>,
    #[serde(default)]
    current_context: Option<String>,
}

fn api_version() -> String {
    "v1".to_string()
}

fn kind() -> String {
    "Config".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    #[serde(default)]
    server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    certificate_authority_data: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContextEntry {
    cluster: String,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedUser {
    name: String,
    user: UserEntry,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
}

/// Build a kubeconfig with exactly one cluster, context and user, all named
/// `cluster_name`, authenticating with a bearer token.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn minimal_kubeconfig(
    cluster_name: &str,
    server: &str,
    ca_certificate: &[u8],
    token: &str,
) -> Result<String> {
    let doc = KubeconfigDoc {
        api_version: api_version(),
        kind: kind(),
        clusters: vec![NamedCluster {
            name: cluster_name.to_string(),
            cluster: ClusterEntry {
                server: Some(server.to_string()),
                certificate_authority_data: Some(STANDARD.encode(ca_certificate)),
            },
        }],
        contexts: vec![NamedContext {
            name: cluster_name.to_string(),
            context: ContextEntry {
                cluster: cluster_name.to_string(),
                user: Some(cluster_name.to_string()),
            },
        }],
        users: vec![NamedUser {
            name: cluster_name.to_string(),
            user: UserEntry {
                token: Some(token.to_string()),
            },
        }],
        current_context: Some(cluster_name.to_string()),
    };

    Ok(serde_yaml::to_string(&doc)?)
}

/// API server URL of the current context of a kubeconfig document.
///
/// Falls back to the first cluster entry when no current context is set.
///
/// # Errors
///
/// Returns an error if the document cannot be parsed or names no server.
pub fn current_server(contents: &str) -> Result<String> {
    let doc: KubeconfigDoc = serde_yaml::from_str(contents)?;

    let cluster_name = doc
        .current_context
        .as_deref()
        .and_then(|current| doc.contexts.iter().find(|c| c.name == current))
        .map(|c| c.context.cluster.as_str());

    let cluster = match cluster_name {
        Some(name) => doc.clusters.iter().find(|c| c.name == name),
        None => doc.clusters.first(),
    };

    cluster
        .and_then(|c| c.cluster.server.clone())
        .ok_or_else(|| ClusterError::Kubeconfig("no API server in current context".to_string()))
}

/// [`current_server`] for a file on disk.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn current_server_from_file(path: &Path) -> Result<String> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        ClusterError::Kubeconfig(format!("failed to read {}: {e}", path.display()))
    })?;
    current_server(&contents)
}
