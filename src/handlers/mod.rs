pub mod tasks;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::scheduler::SchedulerError;
use crate::tasks::TaskError;
use crate::AppState;

/// Error response body: {"error": "message"}
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// API error type
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(resource: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("{} not found", resource),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse::new(self.message))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(nf) = err.downcast_ref::<crate::db::NotFoundError>() {
            return Self::not_found(&format!("{} {}", nf.resource, nf.id));
        }
        tracing::error!("Internal error: {:#}", err);
        Self::internal(err.to_string())
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::InvalidScheduledDate(_) | TaskError::InvalidFrequency(_) | TaskError::Validation(_) => {
                Self::bad_request(err.to_string())
            }
            TaskError::NameTaken(_) => Self::conflict(err.to_string()),
            TaskError::NotFound(name) => Self::not_found(&format!("task {}", name)),
            TaskError::Scheduling(SchedulerError::UnknownJob(_)) => {
                Self::conflict(format!("{}: task is not scheduled", err))
            }
            TaskError::Scheduling(SchedulerError::DuplicateJob(_)) => Self::conflict(err.to_string()),
            TaskError::Repository(e) => Self::from(e),
        }
    }
}

/// Response helper: return 201 Created with JSON body
pub fn created<T: Serialize>(item: T) -> (StatusCode, Json<T>) {
    (StatusCode::CREATED, Json(item))
}

/// Healthcheck endpoint: returns 200 OK with status
pub async fn healthcheck(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let ws_clients = match state.ws_hub {
        Some(ref hub) => hub.client_count().await,
        None => 0,
    };
    Json(serde_json::json!({
        "status": "ok",
        "service": "forge-tasks",
        "ws_clients": ws_clients,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
