//! `.env` parsing and the secrets seeded into a fresh cluster.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;

/// Secret holding the variables substituted into Flux kustomizations.
pub const CLUSTER_VARS_SECRET: &str = "cluster-vars";

/// Annotations letting the reflector mirror a secret into other namespaces.
pub const REFLECTOR_ANNOTATIONS: [(&str, &str); 2] = [
    ("reflector.v1.k8s.emberstack.com/reflection-allowed", "true"),
    ("reflector.v1.k8s.emberstack.com/reflection-auto-enabled", "true"),
];

/// Parse `KEY=VALUE` lines.
///
/// Blank lines and `#` comments are skipped, the split happens on the first
/// `=`, matching surrounding quotes are stripped and entries with an empty
/// key or value are dropped.
#[must_use]
pub fn parse_env(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let key = key.trim().trim_start_matches("export ").trim();
            let value = unquote(value.trim());
            (!key.is_empty() && !value.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Read and parse a `.env` file.
///
/// # Errors
///
/// Returns an error if the file does not exist or cannot be read.
pub fn load_env_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read env file {}", path.display()))?;
    Ok(parse_env(&contents))
}

/// An opaque secret built from string values.
#[must_use]
pub fn opaque_secret(
    namespace: &str,
    name: &str,
    data: &BTreeMap<String, String>,
    annotations: &[(&str, &str)],
) -> Secret {
    let annotations = (!annotations.is_empty()).then(|| {
        annotations
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    });

    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations,
            ..ObjectMeta::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(
            data.iter()
                .map(|(k, v)| (k.clone(), ByteString(v.clone().into_bytes())))
                .collect(),
        ),
        ..Secret::default()
    }
}

/// One value of a secret as UTF-8.
#[must_use]
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(key).cloned())
        })
        .filter(|v| !v.is_empty())
}
