//! Cluster discovery and cross-cluster trust federation for the homelab
//! platform.
//!
//! This crate owns everything that talks to a Kubernetes control plane on
//! behalf of the bootstrap tool:
//!
//! - **Control plane boundary** - [`ControlPlane`] and [`DynamicResourceClient`],
//!   backed by kube-rs in production ([`KubeControlPlane`])
//! - **Polling** - [`poll::poll_until`], the single bounded wait used everywhere
//! - **Custom resources** - typed Flux and Rook accessors in [`resources`]
//! - **Discovery** - concurrent strategies merged by cluster name
//! - **Trust** - read-only remote credentials for the service mesh, verified
//!   by connecting with them
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use federation::{KubeControlPlane, TrustManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let local = Arc::new(KubeControlPlane::infer().await?);
//!     let bundle = TrustManager::new(local).create_remote_secret("nas").await?;
//!     println!("{}", serde_yaml::to_string(&bundle.secret())?);
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_panics_doc)]

pub mod cluster;
pub mod discovery;
pub mod error;
pub mod kube_client;
pub mod kubeconfig;
pub mod poll;
pub mod resources;
pub mod trust;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cluster::{ControlPlane, DynamicResourceClient, FIELD_MANAGER};
pub use discovery::{
    store_discovery_info, ClusterDiscovery, ClusterRecord, DiscoverySource, DiscoveryStrategy,
};
pub use error::{ClusterError, Result};
pub use kube_client::{KubeControlPlane, KubeconfigConnector};
pub use poll::{poll_until, poll_with, PollOutcome, PollSpec};
pub use resources::{CustomResources, ReconcileStatus};
pub use trust::{verify_read_only, CredentialConnector, TrustBundle, TrustManager};
