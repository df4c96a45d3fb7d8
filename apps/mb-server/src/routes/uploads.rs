use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;

use crate::auth::{self, require_upload, AuthUser};
use crate::error::map_db_error;
use crate::jobs::{ParseArchiveJob, KIND_PARSE_ARCHIVE};
use crate::model::task;
use crate::parse::{nied, nzsm};
use crate::routes::response::UploadResponse;
use crate::state::AppState;
use crate::storage;

fn default_overwrite() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub(crate) struct UploadParams {
    #[serde(default)]
    wait_for_result: bool,
    #[serde(default = "default_overwrite")]
    overwrite_existing: bool,
}

async fn read_archives(
    mut multipart: Multipart,
) -> Result<Vec<(String, Vec<u8>)>, (StatusCode, String)> {
    let mut archives = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(|err| {
        (
            StatusCode::BAD_REQUEST,
            format!("malformed multipart body: {err}"),
        )
    })? {
        if field.name() != Some("archives") {
            continue;
        }
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field.bytes().await.map_err(|err| {
            (
                StatusCode::BAD_REQUEST,
                format!("failed to read upload: {err}"),
            )
        })?;
        archives.push((file_name, bytes.to_vec()));
    }
    Ok(archives)
}

/// Stage the uploads and dispatch one parse job per archive. Mode is chosen
/// now, not at startup: live workers get the durable queue, otherwise the
/// in-process executor runs the job.
async fn dispatch_archives(
    state: &AppState,
    region: &str,
    uris: Vec<String>,
    username: &str,
    user_id: &str,
    params: &UploadParams,
) -> Result<UploadResponse, (StatusCode, String)> {
    let access_token = auth::create_token(&state.config, username)
        .map_err(|err| {
            tracing::error!(error = format!("{err:#}"), "token issuance failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
        })?
        .access_token;

    if !params.wait_for_result {
        let has_workers = state.jobs.has_workers().await;
        let mut task_ids = Vec::with_capacity(uris.len());
        for archive_uri in uris {
            let task_id = task::create_task(&state.db, None)
                .await
                .map_err(map_db_error)?;
            task_ids.push(task_id);

            let job = ParseArchiveJob {
                region: region.to_string(),
                archive_uri,
                access_token: Some(access_token.clone()),
                user_id: user_id.to_string(),
                task_id: Some(task_id),
                overwrite_existing: params.overwrite_existing,
            };
            if has_workers {
                state
                    .jobs
                    .enqueue(KIND_PARSE_ARCHIVE, serde_json::json!(job))
                    .await
                    .map_err(map_db_error)?;
            } else {
                state.jobs.spawn_parse_local(job);
            }
        }

        return Ok(UploadResponse {
            message: "Successfully uploaded and will be processed in the background.".to_string(),
            task_ids: Some(task_ids),
            records: None,
        });
    }

    let mut records = Vec::new();
    for archive_uri in uris {
        let job = ParseArchiveJob {
            region: region.to_string(),
            archive_uri,
            access_token: Some(access_token.clone()),
            user_id: user_id.to_string(),
            task_id: None,
            overwrite_existing: params.overwrite_existing,
        };
        match state.jobs.execute_parse(&job, true).await {
            Ok(file_names) => records.extend(file_names),
            Err(err) => {
                tracing::error!(
                    archive_uri = %job.archive_uri,
                    error = format!("{err:#}"),
                    "Failed to parse archive."
                );
            }
        }
    }

    Ok(UploadResponse {
        message: "Successfully uploaded and processed.".to_string(),
        task_ids: None,
        records: Some(records),
    })
}

/// K-NET/KiK-net upload: gzip tarballs only, the file name carries the
/// category. Invalid archives are silently dropped.
#[utoipa::path(
    post,
    path = "/jp/upload",
    tag = "Japan",
    params(
        ("wait_for_result" = bool, Query, description = "Block until parsed"),
        ("overwrite_existing" = bool, Query, description = "Replace hash-identical records")
    ),
    responses(
        (status = 202, description = "Accepted", body = UploadResponse),
        (status = 401, description = "Not allowed to upload")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn upload_jp_archive(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    AuthUser(user): AuthUser,
    multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), (StatusCode, String)> {
    require_upload(&user).map_err(|err| (err.status, err.message))?;

    let mut uris = Vec::new();
    for (file_name, bytes) in read_archives(multipart).await? {
        if nied::validate_archive(&file_name).is_err() {
            continue;
        }
        let uri = storage::store(&state.config, &file_name, &bytes)
            .await
            .map_err(|err| {
                tracing::error!(error = format!("{err:#}"), "blob staging failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            })?;
        uris.push(uri);
    }

    let response = dispatch_archives(
        &state,
        "jp",
        uris,
        &user.username,
        &user.id.to_string(),
        &params,
    )
    .await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GeoNet upload: tarballs, zip archives, or plain component files. Plain
/// files are packed into a deterministic tarball before staging.
#[utoipa::path(
    post,
    path = "/nz/upload",
    tag = "New Zealand",
    params(
        ("wait_for_result" = bool, Query, description = "Block until parsed"),
        ("overwrite_existing" = bool, Query, description = "Replace hash-identical records")
    ),
    responses(
        (status = 202, description = "Accepted", body = UploadResponse),
        (status = 401, description = "Not allowed to upload")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn upload_nz_archive(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    AuthUser(user): AuthUser,
    multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), (StatusCode, String)> {
    require_upload(&user).map_err(|err| (err.status, err.message))?;

    let stage_error = |err: anyhow::Error| {
        tracing::error!(error = format!("{err:#}"), "blob staging failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error".to_string(),
        )
    };

    let mut uris = Vec::new();
    let mut plain_files = Vec::new();
    for (file_name, bytes) in read_archives(multipart).await? {
        if file_name.ends_with(".tar.gz") || file_name.ends_with(".zip") {
            uris.push(
                storage::store(&state.config, &file_name, &bytes)
                    .await
                    .map_err(stage_error)?,
            );
        } else if nzsm::validate_file(&file_name).is_ok() {
            plain_files.push((file_name, bytes));
        }
    }
    if !plain_files.is_empty() {
        uris.push(
            storage::pack(&state.config, &plain_files)
                .await
                .map_err(stage_error)?,
        );
    }

    let response = dispatch_archives(
        &state,
        "nz",
        uris,
        &user.username,
        &user.id.to_string(),
        &params,
    )
    .await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Vendor archives run to hundreds of megabytes; the default body cap is far
/// too small for them.
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jp/upload", post(upload_jp_archive))
        .route("/nz/upload", post(upload_nz_archive))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}
