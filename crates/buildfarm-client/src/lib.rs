//! buildfarm-client: the client side of the build farm.
//!
//! - [`ControlClient`] talks to the control endpoint over HTTP.
//! - [`ConvergencePoller`] repeats `connect` until the farm is usable,
//!   bounded by a [`RetryPolicy`] and cancellable.
//! - [`AuthProxy`] exposes the remote executor on localhost, adding the
//!   client certificate on the way out.

pub mod error;
pub mod endpoint;
pub mod poller;
pub mod proxy;

pub use error::{ClientError, ClientResult};
pub use endpoint::ControlClient;
pub use poller::{ConnectRequest, ControlEndpoint, ConvergencePoller, PollError, Ready, RetryPolicy};
pub use proxy::{AuthProxy, ProxyCredentials};
