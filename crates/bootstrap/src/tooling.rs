//! `kubectl` and `helm` invocations.
//!
//! Manifests that are only published as multi-document YAML (the Flux
//! install bundle, local-path-provisioner) and Helm charts go through the
//! CLIs rather than the API client.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// External CLI tooling run against one cluster.
#[async_trait]
pub trait ClusterTooling: Send + Sync {
    /// Run `kubectl` with `args`, returning stdout.
    async fn kubectl(&self, args: &[&str]) -> Result<String>;

    /// Run `helm` with `args`, returning stdout.
    async fn helm(&self, args: &[&str]) -> Result<String>;

    /// `kubectl apply -f <source>` for a file path or URL.
    async fn apply_manifest(&self, source: &str) -> Result<()> {
        self.kubectl(&["apply", "-f", source]).await.map(|_| ())
    }
}

/// Runs the real binaries from `PATH`.
#[derive(Debug, Clone, Default)]
pub struct CliTooling {
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
}

impl CliTooling {
    /// Tooling bound to a kubeconfig and optional context; `None` uses the
    /// CLIs' own defaults.
    #[must_use]
    pub fn new(kubeconfig: Option<PathBuf>, context: Option<String>) -> Self {
        Self {
            kubeconfig,
            context,
        }
    }
}

async fn run(mut command: Command, program: &str) -> Result<String> {
    let output = command
        .output()
        .await
        .with_context(|| format!("Failed to execute {program}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("{program} failed: {}", stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[async_trait]
impl ClusterTooling for CliTooling {
    async fn kubectl(&self, args: &[&str]) -> Result<String> {
        debug!(?args, "kubectl");
        let mut command = Command::new("kubectl");
        if let Some(kubeconfig) = &self.kubeconfig {
            command.arg("--kubeconfig").arg(kubeconfig);
        }
        if let Some(context) = &self.context {
            command.arg("--context").arg(context);
        }
        command.args(args);
        run(command, "kubectl").await
    }

    async fn helm(&self, args: &[&str]) -> Result<String> {
        debug!(?args, "helm");
        let mut command = Command::new("helm");
        if let Some(kubeconfig) = &self.kubeconfig {
            command.env("KUBECONFIG", kubeconfig);
        }
        if let Some(context) = &self.context {
            command.arg("--kube-context").arg(context);
        }
        command.args(args);
        run(command, "helm").await
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use std::sync::Mutex;

    use super::*;

    /// Records invocations instead of running anything.
    #[derive(Default)]
    pub struct RecordingTooling {
        pub invocations: Mutex<Vec<String>>,
        pub fail: bool,
    }

    impl RecordingTooling {
        pub fn invocations(&self) -> Vec<String> {
            self.invocations.lock().unwrap().clone()
        }

        fn record(&self, program: &str, args: &[&str]) -> Result<String> {
            self.invocations
                .lock()
                .unwrap()
                .push(format!("{program} {}", args.join(" ")));
            if self.fail {
                anyhow::bail!("{program} failed: simulated");
            }
            Ok(String::new())
        }
    }

    #[async_trait]
    impl ClusterTooling for RecordingTooling {
        async fn kubectl(&self, args: &[&str]) -> Result<String> {
            self.record("kubectl", args)
        }

        async fn helm(&self, args: &[&str]) -> Result<String> {
            self.record("helm", args)
        }
    }

    #[tokio::test]
    async fn test_apply_manifest_uses_kubectl_apply() {
        let tooling = RecordingTooling::default();
        tooling.apply_manifest("https://example.com/install.yaml").await.unwrap();
        assert_eq!(
            tooling.invocations(),
            vec!["kubectl apply -f https://example.com/install.yaml".to_string()]
        );
    }
}
