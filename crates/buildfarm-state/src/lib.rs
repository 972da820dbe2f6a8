//! buildfarm-state: local control plane for the build farm.
//!
//! Backed by [redb](https://docs.rs/redb), the `StateStore` persists
//! stacks, container tasks and versioned objects, and implements the
//! `StackBackend`, `TaskBackend` and `ObjectStore` capabilities from
//! `bf-core`. The daemon drives it forward with [`StateStore::settle`],
//! which plays the role of the orchestrator: in-flight stacks complete,
//! task fleets converge on their `InstanceDesiredCount`.
//!
//! # Lifecycle
//!
//! ```text
//! create ─▶ CREATE_IN_PROGRESS ─settle─▶ CREATE_COMPLETE
//! update ─▶ UPDATE_IN_PROGRESS ─settle─▶ UPDATE_COMPLETE
//! delete ─▶ DELETE_IN_PROGRESS ─settle─▶ (removed, tasks stopped)
//!
//! task:  PENDING ─settle─▶ RUNNING ─(surplus/delete)─▶ STOPPED
//! ```

pub mod backend;
pub mod error;
pub mod settle;
pub mod store;
pub mod tables;
pub mod template;
pub mod types;

pub use error::{StateError, StateResult};
pub use settle::SettleReport;
pub use store::{DEFAULT_STOPPED_RETENTION, StateStore};
pub use template::Template;
pub use types::*;
