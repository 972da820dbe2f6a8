use std::time::Duration;

use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("unsupported endpoint scheme '{0}'; only http is supported")]
    UnsupportedScheme(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("cannot build request: {0}")]
    Request(#[from] http::Error),

    #[error("cannot decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("control endpoint did not answer within {0:?}")]
    TimedOut(Duration),

    #[error("control endpoint returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("TLS error: {0}")]
    Tls(String),
}

impl From<rustls::Error> for ClientError {
    fn from(e: rustls::Error) -> Self {
        ClientError::Tls(e.to_string())
    }
}
