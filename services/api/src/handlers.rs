//! Axum Handlers for the REST API
//!
//! Health and tool-server introspection endpoints. It uses `utoipa` doc
//! comments to generate OpenAPI documentation.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tracing::error;
use utoipa::ToSchema;

use crate::state::AppState;

/// A generic error payload.
#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    /// Whether the tool-server worker is running.
    pub tool_worker: bool,
}

#[derive(Serialize, ToSchema)]
pub struct ToolsResponse {
    /// Connected tool server name to the tools it declares.
    pub servers: HashMap<String, Vec<String>>,
}

pub struct ApiError(anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("Internal Server Error: {:?}", self.0);
        let message = "An internal server error occurred.".to_string();
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { message }),
        )
            .into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Report service liveness.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        tool_worker: state.tools.is_running(),
    })
}

/// List the tools of every connected tool server.
#[utoipa::path(
    get,
    path = "/tools",
    responses(
        (status = 200, description = "Tools per connected server", body = ToolsResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn list_tools(State(state): State<Arc<AppState>>) -> Result<Json<ToolsResponse>, ApiError> {
    let tools = state.tools.clone();
    let servers = tokio::task::spawn_blocking(move || tools.available_tools()).await?;
    Ok(Json(ToolsResponse { servers }))
}
