//! bf-core: shared vocabulary of the remote build farm.
//!
//! Holds the domain types exchanged between the control plane, the
//! control API and the local CLI, the capability traits every
//! infrastructure backend implements, and the JSON configuration.

pub mod backend;
pub mod config;
pub mod types;

pub use backend::{
    BackendError, BackendResult, CloudBackend, DESIRED_COUNT_PARAMETER, ObjectHead, ObjectStore,
    StackBackend, StackDescriptor, StackRequest, TaskBackend, UpdateOutcome, maybe_put_object,
    sha256_hex,
};
pub use config::{AuthConfig, ConfigError, ConfigResult, FarmConfig, StackNames, VpcConfig};
pub use types::*;
