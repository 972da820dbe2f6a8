use std::time::Duration;

use bf_core::{BackendError, ConfigError};
use buildfarm_auth::AuthError;
use thiserror::Error;

pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Caller-side logic error; never retried.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("stack {stack} did not settle within {waited:?}")]
    Timeout { stack: String, waited: Duration },
}
