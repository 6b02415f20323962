//! Task and worker status endpoints.

use axum::{
    Json,
    extract::{Path, State},
};
use uuid::Uuid;

use discoverer_core::traits::{ActivityStore, TaskQueue};

use crate::dto::{TaskResponse, WorkerStatusResponse};
use crate::error::ApiError;
use crate::state::AppState;

/// Get a task by ID.
#[utoipa::path(
    get,
    path = "/api/v1/tasks/{id}",
    params(
        ("id" = Uuid, Path, description = "Task UUID")
    ),
    responses(
        (status = 200, description = "Task found", body = TaskResponse),
        (status = 404, description = "Task not found"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "tasks"
)]
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskResponse>, ApiError> {
    let task = state
        .task_repo
        .get_task(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task not found: {}", id)))?;

    Ok(Json(TaskResponse::from(task)))
}

/// Get the worker's lifecycle state and outstanding work.
///
/// Idle checks are not counted as outstanding work.
#[utoipa::path(
    get,
    path = "/api/v1/worker",
    responses(
        (status = 200, description = "Worker status", body = WorkerStatusResponse),
        (status = 500, description = "Internal server error"),
    ),
    tag = "tasks"
)]
pub async fn get_worker_status(
    State(state): State<AppState>,
) -> Result<Json<WorkerStatusResponse>, ApiError> {
    let worker_state = state.activity_repo.state().await?;
    let last_activity = state.activity_repo.last_activity().await?;
    let counts = state.task_repo.task_counts().await?;

    Ok(Json(WorkerStatusResponse::new(
        worker_state.to_string(),
        last_activity,
        counts,
        state.worker_control.name(),
    )))
}
