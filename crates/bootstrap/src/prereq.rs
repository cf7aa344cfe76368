//! Prerequisite checks run before bootstrapping.
//!
//! Missing required tools fail the check. Anything the bootstrap can work
//! around (no GitHub token, no `.env`, an unreachable cluster) is reported
//! as a warning.

use std::fmt;

use anyhow::{anyhow, Result};
use colored::Colorize;
use federation::ControlPlane;
use serde::Serialize;

use crate::config::{BootstrapConfig, ClusterRole};
use crate::secrets::load_env_file;
use crate::transit::VaultTransit;
use crate::ui;

/// Tokens shorter than this are almost certainly truncated.
const MIN_TOKEN_LEN: usize = 20;

/// Outcome of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passed,
    Warning,
    Failed,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Warning => write!(f, "warning"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One prerequisite and what was found.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub description: String,
    pub status: CheckStatus,
    pub details: String,
    /// How to fix a failed or warning check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl CheckResult {
    fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            status: CheckStatus::Passed,
            details: String::new(),
            instructions: None,
        }
    }

    fn passed(mut self, details: impl Into<String>) -> Self {
        self.status = CheckStatus::Passed;
        self.details = details.into();
        self
    }

    fn warning(mut self, details: impl Into<String>) -> Self {
        self.status = CheckStatus::Warning;
        self.details = details.into();
        self
    }

    fn failed(mut self, details: impl Into<String>) -> Self {
        self.status = CheckStatus::Failed;
        self.details = details.into();
        self
    }

    fn instructions(mut self, text: impl Into<String>) -> Self {
        self.instructions = Some(text.into());
        self
    }
}

struct Tool {
    command: &'static str,
    purpose: &'static str,
    install: &'static str,
    critical: bool,
    /// Only needed where Cilium is installed.
    primary_only: bool,
}

const TOOLS: [Tool; 4] = [
    Tool {
        command: "kubectl",
        purpose: "Applies manifests and annotates Flux resources",
        install: "Install kubectl from https://kubernetes.io/docs/tasks/tools/",
        critical: true,
        primary_only: false,
    },
    Tool {
        command: "helm",
        purpose: "Installs Cilium",
        install: "Install Helm from https://helm.sh/docs/intro/install/",
        critical: true,
        primary_only: true,
    },
    Tool {
        command: "flux",
        purpose: "Inspects Flux reconciliation by hand",
        install: "curl -s https://fluxcd.io/install.sh | sudo bash",
        critical: false,
        primary_only: false,
    },
    Tool {
        command: "cilium",
        purpose: "Inspects Cilium status by hand",
        install: "Install cilium-cli from https://github.com/cilium/cilium-cli/releases",
        critical: false,
        primary_only: false,
    },
];

type CommandLookup = Box<dyn Fn(&str) -> bool + Send + Sync>;
type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Checks the workstation and cluster before a bootstrap run.
pub struct PrerequisiteChecker<'a> {
    config: &'a BootstrapConfig,
    lookup: CommandLookup,
    env: EnvLookup,
}

impl<'a> PrerequisiteChecker<'a> {
    /// A checker that looks commands up on `PATH`.
    #[must_use]
    pub fn new(config: &'a BootstrapConfig) -> Self {
        Self {
            config,
            lookup: Box::new(|command| which::which(command).is_ok()),
            env: Box::new(|key| std::env::var(key).ok()),
        }
    }

    /// Replace the `PATH` lookup.
    #[must_use]
    pub fn with_lookup(mut self, lookup: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.lookup = Box::new(lookup);
        self
    }

    /// Replace the environment lookup.
    #[must_use]
    pub fn with_env(
        mut self,
        env: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.env = Box::new(env);
        self
    }

    /// Run every check. `cluster` is `None` when the local cluster could not
    /// be reached at all.
    pub async fn run(&self, cluster: Option<&dyn ControlPlane>) -> Vec<CheckResult> {
        let mut results = self.check_commands();
        results.push(self.check_github_token());
        results.push(self.check_env_file());
        if let Some(vault) = self.check_vault() {
            results.push(vault);
        }
        results.push(self.check_cluster(cluster).await);
        results
    }

    /// Required and optional command-line tools.
    #[must_use]
    pub fn check_commands(&self) -> Vec<CheckResult> {
        TOOLS
            .iter()
            .map(|tool| {
                let result = CheckResult::new(format!("command-{}", tool.command), tool.purpose);
                let critical =
                    tool.critical && (!tool.primary_only || self.config.role == ClusterRole::Primary);
                if (self.lookup)(tool.command) {
                    result.passed(format!("{} found", tool.command))
                } else if critical {
                    result
                        .failed(format!("{} not found in PATH", tool.command))
                        .instructions(tool.install)
                } else {
                    result
                        .warning(format!("{} not found in PATH", tool.command))
                        .instructions(tool.install)
                }
            })
            .collect()
    }

    #[must_use]
    pub fn check_github_token(&self) -> CheckResult {
        let result = CheckResult::new("github-token", "GitHub token for the Flux source");
        match self.config.gitops.token.as_deref().map(str::trim) {
            None | Some("") => result
                .warning("No token, Flux can only read a public repository")
                .instructions("Set GITHUB_TOKEN or gitops.token"),
            Some(token) if token.len() < MIN_TOKEN_LEN => result
                .warning(format!("Token looks truncated ({} characters)", token.len()))
                .instructions("Check GITHUB_TOKEN"),
            Some(token) => result.passed(format!("Token found ({} characters)", token.len())),
        }
    }

    #[must_use]
    pub fn check_env_file(&self) -> CheckResult {
        let path = self.config.project_root().join(".env");
        let result = CheckResult::new("env-file", "Variables seeded into cluster-vars");
        match load_env_file(&path) {
            Ok(vars) => result.passed(format!("Found .env with {} variables", vars.len())),
            Err(_) => result
                .warning(format!("{} not found, cluster-vars will not be seeded", path.display()))
                .instructions("Create .env in the repository root"),
        }
    }

    /// Vault access on the primary. `None` on the secondary, which hosts Vault.
    #[must_use]
    pub fn check_vault(&self) -> Option<CheckResult> {
        if self.config.role != ClusterRole::Primary {
            return None;
        }
        let result = CheckResult::new("vault-config", "NAS Vault token for the transit unseal key");
        let transit = VaultTransit::from_settings(&self.config.vault, |key| (self.env)(key));
        Some(if transit.has_root_token() {
            result.passed("NAS Vault token configured")
        } else {
            result
                .warning("No NAS Vault token, only an already stored transit token can be used")
                .instructions("Set QNAP_VAULT_TOKEN, VAULT_ROOT_TOKEN or NAS_VAULT_TOKEN")
        })
    }

    pub async fn check_cluster(&self, cluster: Option<&dyn ControlPlane>) -> CheckResult {
        let result = CheckResult::new(
            "cluster-connectivity",
            format!("API access to {}", self.config.cluster_name()),
        );
        let Some(cluster) = cluster else {
            return result
                .warning("No kubeconfig could be loaded")
                .instructions("Set cluster.kubeconfig or KUBECONFIG");
        };

        let version = match cluster.server_version().await {
            Ok(version) => version,
            Err(e) => return result.warning(format!("Cluster not reachable: {e}")),
        };
        match cluster.list_nodes().await {
            Ok(nodes) => result.passed(format!(
                "Cluster accessible with {} nodes ({version})",
                nodes.len()
            )),
            Err(e) => result.warning(format!(
                "Cluster reachable ({version}) but nodes not listable: {e}"
            )),
        }
    }
}

/// Print `results` and fail if any check failed.
///
/// # Errors
///
/// Returns an error naming the failed checks.
pub fn report(results: &[CheckResult]) -> Result<()> {
    println!();
    for result in results {
        ui::print_check_result(
            &result.name,
            result.status == CheckStatus::Passed,
            Some(&result.details),
        );
    }
    println!();

    let attention: Vec<&CheckResult> = results
        .iter()
        .filter(|r| r.status != CheckStatus::Passed)
        .collect();
    if attention.is_empty() {
        ui::print_success("All prerequisites met!");
        return Ok(());
    }

    ui::print_warning("Some prerequisites are not met:");
    println!();
    for result in &attention {
        let instructions = result.instructions.as_deref().unwrap_or(&result.description);
        if result.status == CheckStatus::Failed {
            println!(
                "  {} {} - {}",
                "✗".red(),
                result.name.red(),
                instructions.bright_black()
            );
        } else {
            println!(
                "  {} {} - {}",
                "⚠".yellow(),
                result.name.yellow(),
                instructions.bright_black()
            );
        }
    }
    println!();

    let failed: Vec<&str> = attention
        .iter()
        .filter(|r| r.status == CheckStatus::Failed)
        .map(|r| r.name.as_str())
        .collect();
    if failed.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "Critical prerequisites not met: {}. Install the required tools and try again.",
            failed.join(", ")
        ))
    }
}
