//! Control endpoint handlers.
//!
//! Each handler recomputes the farm status from the backend, runs the
//! requested action and returns the result in the common envelope.

use std::collections::HashMap;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bf_core::{CloudBackend, ConnectResponse, ScaleReport};
use buildfarm_reconcile::actions::DEFAULT_WORKER_COUNT;
use buildfarm_reconcile::{FarmActions, ReconcileError};
use serde::Serialize;
use tracing::{error, info};

use crate::ApiState;
use crate::params::{InvalidArgument, Params};

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

enum Failure {
    Invalid(InvalidArgument),
    Internal(ReconcileError),
}

impl From<InvalidArgument> for Failure {
    fn from(e: InvalidArgument) -> Self {
        Failure::Invalid(e)
    }
}

impl From<ReconcileError> for Failure {
    fn from(e: ReconcileError) -> Self {
        Failure::Internal(e)
    }
}

fn respond<T: Serialize>(state: &ApiState, action: &str, result: Result<T, Failure>) -> Response {
    match result {
        Ok(data) => ApiResponse::ok(data).into_response(),
        Err(Failure::Invalid(e)) => {
            info!(%action, error = %e, "invalid request");
            error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response()
        }
        Err(Failure::Internal(e)) => {
            error!(%action, error = %e, "request failed");
            let msg = if state.config.debug {
                format!("{e:?}")
            } else {
                e.to_string()
            };
            error_response(&msg, StatusCode::INTERNAL_SERVER_ERROR).into_response()
        }
    }
}

fn actions(state: &ApiState) -> FarmActions<'_, dyn CloudBackend> {
    FarmActions::new(&*state.backend, &state.config, &state.auth)
}

/// GET /status
pub async fn status(State(state): State<ApiState>) -> Response {
    let result = actions(&state).status().map_err(Failure::from);
    respond(&state, "status", result)
}

/// GET /connect?up=N&force_update=BOOL
pub async fn connect(
    State(state): State<ApiState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let result = run_connect(&state, &Params::new(&query));
    respond(&state, "connect", result)
}

fn run_connect(state: &ApiState, params: &Params<'_>) -> Result<ConnectResponse, Failure> {
    let worker_count = params.get_positive_int("up", Some(DEFAULT_WORKER_COUNT))?;
    let force_update = params.get_bool("force_update", false)?;
    Ok(actions(state).connect(worker_count, force_update)?)
}

/// GET /down?to=N
pub async fn down(
    State(state): State<ApiState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let result = run_down(&state, &Params::new(&query));
    respond(&state, "down", result)
}

fn run_down(state: &ApiState, params: &Params<'_>) -> Result<ScaleReport, Failure> {
    let worker_count = params.get_positive_int("to", None)?;
    Ok(actions(state).down(worker_count)?)
}
