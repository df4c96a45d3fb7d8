use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;

use crate::error::map_db_error;
use crate::model::task;
use crate::routes::response::{UploadTaskResponse, UploadTasksResponse};
use crate::state::AppState;

/// A missing task is the normal terminal state: it finished and was removed.
#[utoipa::path(
    get,
    path = "/task/status/{task_id}",
    tag = "status",
    params(("task_id" = Uuid, Path, description = "Upload task id")),
    responses(
        (status = 200, description = "Task progress", body = UploadTaskResponse),
        (status = 404, description = "Task not found")
    )
)]
pub(crate) async fn get_task_status(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<UploadTaskResponse>, (StatusCode, String)> {
    let task = task::find_task(&state.db, task_id)
        .await
        .map_err(map_db_error)?
        .ok_or((
            StatusCode::NOT_FOUND,
            "Task not found. It may have finished.".to_string(),
        ))?;
    Ok(Json(task.into()))
}

#[utoipa::path(
    post,
    path = "/task/status/",
    tag = "status",
    responses((status = 200, description = "Task progress per id, null when missing", body = UploadTasksResponse))
)]
pub(crate) async fn post_task_status(
    State(state): State<AppState>,
    Json(task_ids): Json<Vec<Uuid>>,
) -> Result<Json<UploadTasksResponse>, (StatusCode, String)> {
    let tasks = task::list_tasks(&state.db, &task_ids)
        .await
        .map_err(map_db_error)?
        .into_iter()
        .map(|task| task.map(UploadTaskResponse::from))
        .collect();
    Ok(Json(UploadTasksResponse { tasks }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/task/status/{task_id}", get(get_task_status))
        .route("/task/status/", post(post_task_status))
}
