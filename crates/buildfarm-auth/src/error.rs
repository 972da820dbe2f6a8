use std::path::PathBuf;

use bf_core::BackendError;
use thiserror::Error;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("cannot fetch credentials: {0}")]
    Backend(#[from] BackendError),

    #[error("malformed credential bundle: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("cannot write '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
