use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use super::validate_drone;
use crate::http::error::ApiError;
use crate::http::state::AppState;
use crate::task::{CreateTaskRequest, Task, TaskStatus};

#[derive(Debug, Deserialize)]
pub struct TasksQuery {
    pub agent_id: Option<String>,
    pub status: Option<TaskStatus>,
}

/// POST /api/drones/{drone}/tasks - Create a task and queue it for the drone
pub async fn submit_task(
    State(state): State<Arc<AppState>>,
    Path(drone): Path<String>,
    Json(mut req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    validate_drone(&state, &drone)?;
    req.agent_id = drone;

    let task = state.tasks.create(req)?;
    if let Err(e) = state.queue.submit(&task).await {
        // Nothing was queued, so the record would only linger as assigned.
        let _ = state.tasks.delete(&task.id);
        return Err(e.into());
    }
    Ok((StatusCode::CREATED, Json(task)))
}

/// GET /api/tasks - Tasks known to this process, optionally filtered
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TasksQuery>,
) -> Json<Vec<Task>> {
    Json(state.tasks.list(query.agent_id.as_deref(), query.status))
}

/// GET /api/tasks/{id}
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.tasks.get(&task_id)?))
}
