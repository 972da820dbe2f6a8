//! buildfarm-auth: credentials for the build farm.
//!
//! The [`Authenticator`] decides what TLS material servers and workers
//! are templated with and what (if anything) is handed to clients.
//! [`certs`] generates a fresh CA-signed credential bundle.

pub mod authenticator;
pub mod certs;
pub mod error;

pub use authenticator::Authenticator;
pub use certs::{BUNDLE_FILE, generate_bundle, write_folder};
pub use error::{AuthError, AuthResult};
