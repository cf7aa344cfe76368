//! `setup-secrets`: cluster variables and the Vault transit token.

use anyhow::{Context, Result};
use async_trait::async_trait;
use federation::resources::FLUX_NAMESPACE;
use tracing::{info, warn};

use crate::context::StepContext;
use crate::orchestrator::Step;
use crate::secrets::{load_env_file, opaque_secret, CLUSTER_VARS_SECRET, REFLECTOR_ANNOTATIONS};

/// Seeds `flux-system/cluster-vars` from `<project root>/.env` and, on the
/// primary, the transit token Vault auto-unseals with.
pub struct SetupSecrets;

#[async_trait]
impl Step for SetupSecrets {
    fn name(&self) -> &'static str {
        "setup-secrets"
    }

    fn description(&self) -> &'static str {
        "Setting up cluster secrets"
    }

    async fn execute(&self, ctx: &StepContext) -> Result<()> {
        ctx.local
            .ensure_namespace(FLUX_NAMESPACE)
            .await
            .context("Failed to ensure flux-system namespace")?;

        let env_path = ctx.config.project_root().join(".env");
        if env_path.exists() {
            let vars = load_env_file(&env_path)?;
            let secret = opaque_secret(
                FLUX_NAMESPACE,
                CLUSTER_VARS_SECRET,
                &vars,
                &REFLECTOR_ANNOTATIONS,
            );
            ctx.local
                .apply_secret(&secret)
                .await
                .context("Failed to write cluster-vars secret")?;
            info!(variables = vars.len(), "Stored cluster variables");
        } else {
            warn!(path = %env_path.display(), "No .env file, cluster-vars not written");
        }

        match ctx.transit.ensure_token(ctx.local.as_ref()).await {
            Ok(Some(_)) => info!("Transit token in place"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Vault transit token not provisioned; auto-unseal will not work until it is"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BootstrapConfig, ClusterRole};
    use crate::secrets::secret_value;
    use crate::tooling::recording::RecordingTooling;
    use crate::transit::{TransitProvisioner, VaultTransit, TRANSIT_SECRET_NAME, TRANSIT_SECRET_NAMESPACE};
    use federation::testing::FakeControlPlane;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn context(fake: &Arc<FakeControlPlane>, root: &std::path::Path, transit: TransitProvisioner) -> StepContext {
        let mut config = BootstrapConfig::for_role(ClusterRole::Primary);
        config.project_root = Some(root.to_path_buf());
        StepContext::new(config, fake.clone(), Arc::new(RecordingTooling::default()))
            .with_transit(transit)
    }

    #[tokio::test]
    async fn test_writes_cluster_vars_from_env_file() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join(".env"), "CLUSTER_DOMAIN=example.com\n# c\nEMPTY=\n").unwrap();
        let fake = Arc::new(FakeControlPlane::default());

        SetupSecrets
            .execute(&context(&fake, root.path(), TransitProvisioner::Secondary))
            .await
            .unwrap();

        let secret = fake.secret(FLUX_NAMESPACE, CLUSTER_VARS_SECRET).unwrap();
        assert_eq!(secret_value(&secret, "CLUSTER_DOMAIN").as_deref(), Some("example.com"));
        assert_eq!(secret.data.unwrap().len(), 1);
        assert!(fake.secret(TRANSIT_SECRET_NAMESPACE, TRANSIT_SECRET_NAME).is_none());
    }

    #[tokio::test]
    async fn test_transit_failure_is_not_fatal() {
        let root = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeControlPlane::default());
        let transit = TransitProvisioner::Primary(VaultTransit::new(None, None));

        SetupSecrets
            .execute(&context(&fake, root.path(), transit))
            .await
            .unwrap();

        assert!(fake.secret(FLUX_NAMESPACE, CLUSTER_VARS_SECRET).is_none());
    }

    #[tokio::test]
    async fn test_existing_transit_token_is_mirrored() {
        let root = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeControlPlane::default());
        let data = BTreeMap::from([("token".to_string(), "s.existing".to_string())]);
        fake.put_secret(opaque_secret(TRANSIT_SECRET_NAMESPACE, TRANSIT_SECRET_NAME, &data, &[]));
        let transit = TransitProvisioner::Primary(VaultTransit::new(None, None));

        SetupSecrets
            .execute(&context(&fake, root.path(), transit))
            .await
            .unwrap();

        let copy = fake.secret(FLUX_NAMESPACE, TRANSIT_SECRET_NAME).unwrap();
        assert_eq!(secret_value(&copy, "vault_transit_token").as_deref(), Some("s.existing"));
    }
}
