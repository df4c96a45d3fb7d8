use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value as JsonValue};
use tokio_util::io::ReaderStream;

use crate::auth::{require_delete, AuthUser};
use crate::config::resolve_under_root;
use crate::state::AppState;

/// Stream a staged blob back; the worker-facing half of the blob contract.
#[utoipa::path(
    get,
    path = "/access/{file_path}",
    tag = "misc",
    params(("file_path" = String, Path, description = "Blob path below the filesystem root")),
    responses(
        (status = 200, description = "File bytes"),
        (status = 404, description = "File not found")
    )
)]
pub(crate) async fn download_file(
    State(state): State<AppState>,
    Path(file_path): Path<String>,
) -> Result<Response, (StatusCode, String)> {
    let local_path = resolve_under_root(&state.config.fs_root, &file_path)
        .map_err(|_| (StatusCode::NOT_FOUND, "File not found.".to_string()))?;

    let file = tokio::fs::File::open(&local_path)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "File not found.".to_string()))?;

    let stream = ReaderStream::new(file);
    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    Ok(response)
}

#[utoipa::path(
    delete,
    path = "/access/{file_path}",
    tag = "misc",
    params(("file_path" = String, Path, description = "Blob path below the filesystem root")),
    responses(
        (status = 200, description = "File deleted"),
        (status = 401, description = "Not allowed to delete"),
        (status = 404, description = "File not found")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn delete_file(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(file_path): Path<String>,
) -> Result<Json<JsonValue>, (StatusCode, String)> {
    require_delete(&user).map_err(|err| (err.status, err.message))?;

    let local_path = resolve_under_root(&state.config.fs_root, &file_path)
        .map_err(|_| (StatusCode::NOT_FOUND, "File not found.".to_string()))?;
    if !local_path.exists() {
        return Err((StatusCode::NOT_FOUND, "File not found.".to_string()));
    }

    tokio::fs::remove_file(&local_path).await.map_err(|err| {
        tracing::error!(path = %local_path.display(), error = %err, "file deletion failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to delete file.".to_string(),
        )
    })?;
    // prune the per-upload subdirectory once it runs empty
    if let Some(parent) = local_path.parent() {
        let _ = tokio::fs::remove_dir(parent).await;
    }

    Ok(Json(json!({ "message": "File deleted." })))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/access/{*file_path}", get(download_file).delete(delete_file))
}
