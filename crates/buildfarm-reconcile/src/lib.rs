//! buildfarm-reconcile: drives the build farm toward a requested size.
//!
//! - [`service::ensure`] reconciles one compute stack against a
//!   [`ReplicaPolicy`](bf_core::ReplicaPolicy).
//! - [`FarmStatusService`] aggregates task counts into a
//!   [`FarmStatus`](bf_core::FarmStatus).
//! - [`FarmActions`] combines both into the `status`/`connect`/`down`
//!   operations of the control endpoint.
//! - [`provision`] sets up and tears down the shared infrastructure.

pub mod actions;
pub mod error;
pub mod provision;
pub mod service;
pub mod status;
pub mod template;

#[cfg(test)]
pub(crate) mod fake;

pub use actions::{FarmActions, server_parameters, worker_parameters};
pub use error::{ReconcileError, ReconcileResult};
pub use provision::{TeardownReport, WaitPolicy, setup, teardown};
pub use service::ensure;
pub use status::FarmStatusService;
pub use template::StackTemplate;
