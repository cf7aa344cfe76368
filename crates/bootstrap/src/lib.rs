//! Homelab cluster bootstrap.
//!
//! Brings a freshly provisioned cluster (the primary `homelab` cluster or the
//! secondary `nas` cluster) to a converged GitOps platform:
//!
//! - **Orchestrator** - fixed, linear step sequence with check-before-act
//!   and warning-only steps ([`orchestrator`], [`steps`])
//! - **Readiness gate** - layered wait on Flux kustomizations and storage
//!   ([`waiter`])
//! - **Diagnostics** - best-effort findings across both clusters
//!   ([`diagnostics`])
//! - **Health** - one rolled-up state per cluster ([`health`])
//! - **Prerequisites** - tools and credentials checked before a run
//!   ([`prereq`])
//!
//! Discovery and cross-cluster trust live in the `federation` crate.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::unused_async)]

pub mod commands;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod health;
pub mod orchestrator;
pub mod prereq;
pub mod secrets;
pub mod state;
pub mod status;
pub mod steps;
pub mod tooling;
pub mod transit;
pub mod ui;
pub mod waiter;

pub use config::{BootstrapConfig, ClusterRole, StorageProvider};
pub use context::StepContext;
pub use orchestrator::{Orchestrator, RunSummary, Step};
pub use state::{BootstrapStep, StepPolicy, StepStatus};
pub use waiter::{LayerTimeoutConfig, Waiter};
