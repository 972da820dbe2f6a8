//! buildfarm-api: the remote control endpoint of the build farm.
//!
//! # API Routes
//!
//! | Method | Path | Query | Description |
//! |---|---|---|---|
//! | GET | `/status` | | Current farm snapshot |
//! | GET | `/connect` | `up` (default 2), `force_update` | Ensure a usable farm, return credentials |
//! | GET | `/down` | `to` (required) | Shrink the farm |
//!
//! Every response uses the `{"success", "data", "error"}` envelope.

pub mod handlers;
pub mod params;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use bf_core::{CloudBackend, FarmConfig};
use buildfarm_auth::Authenticator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub backend: Arc<dyn CloudBackend>,
    pub config: Arc<FarmConfig>,
    pub auth: Arc<Authenticator>,
}

impl ApiState {
    pub fn new(backend: Arc<dyn CloudBackend>, config: FarmConfig) -> Self {
        let auth = Authenticator::for_config(&config);
        Self {
            backend,
            config: Arc::new(config),
            auth: Arc::new(auth),
        }
    }
}

/// Build the control endpoint router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handlers::status))
        .route("/connect", get(handlers::connect))
        .route("/down", get(handlers::down))
        .with_state(state)
}
