use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use super::{created, ApiError};
use crate::models::*;
use crate::AppState;

/// Body of POST /api/tasks
#[derive(Debug, Deserialize)]
pub struct CreateTaskBody {
    pub requester: Requester,
    pub targets: Vec<Target>,
    pub task: CreateTaskRequest,
}

async fn respond(state: &AppState, task: &Task) -> TaskResponse {
    TaskResponse::new(task, state.task_service.next_run(task).await)
}

/// GET /api/tasks: list all tasks
pub async fn list_tasks(State(state): State<Arc<AppState>>) -> Result<Json<Vec<TaskResponse>>, ApiError> {
    let tasks = state.task_service.list_tasks().await?;
    let mut out = Vec::with_capacity(tasks.len());
    for task in &tasks {
        out.push(respond(&state, task).await);
    }
    Ok(Json(out))
}

/// POST /api/tasks: create and schedule a task
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTaskBody>,
) -> Result<(StatusCode, Json<TaskResponse>), ApiError> {
    if body.requester.username.trim().is_empty() {
        return Err(ApiError::bad_request("requester username is required"));
    }
    let task = state
        .task_service
        .create_task(&body.requester, body.targets, body.task)
        .await?;
    Ok(created(respond(&state, &task).await))
}

/// GET /api/tasks/:name: get a single task
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    let task = state.task_service.get_task(&name).await?;
    Ok(Json(respond(&state, &task).await))
}

/// GET /api/tasks/:name/logs: run logs keyed by run time, then target
pub async fn get_task_logs(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<RunLogs>, ApiError> {
    let task = state.task_service.get_task(&name).await?;
    Ok(Json(task.logs))
}

/// POST /api/tasks/:name/pause
pub async fn pause_task(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    let mut task = state.task_service.get_task(&name).await?;
    state.task_service.pause_task(&mut task).await?;
    Ok(Json(respond(&state, &task).await))
}

/// POST /api/tasks/:name/resume
pub async fn resume_task(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    let mut task = state.task_service.get_task(&name).await?;
    state.task_service.resume_task(&mut task).await?;
    Ok(Json(respond(&state, &task).await))
}

/// DELETE /api/tasks/:name
pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.task_service.delete_task(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}
