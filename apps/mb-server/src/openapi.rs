use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::routes;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Strong Motion Database",
        description = "A database for strong motion records."
    ),
    paths(
        routes::status::redirect_to_docs,
        routes::status::alive,
        routes::status::for_test_only,
        routes::status::get_total,
        routes::status::post_total,
        routes::status::aggregation_stats,
        routes::tasks::get_task_status,
        routes::tasks::post_task_status,
        routes::records::download_single_random_raw_record,
        routes::records::download_single_random_waveform,
        routes::records::download_single_random_spectrum,
        routes::records::download_single_random_response_spectrum,
        routes::records::download_waveform,
        routes::records::query_records,
        routes::records::search_records,
        routes::records::process_record,
        routes::records::index_records,
        routes::uploads::upload_jp_archive,
        routes::uploads::upload_nz_archive,
        routes::files::download_file,
        routes::files::delete_file,
        routes::users::acquire_token,
        routes::users::check_new_user,
        routes::users::create_new_user,
        routes::users::delete_user,
        routes::users::retrieve_myself,
    ),
    components(schemas(
        crate::auth::Token,
        crate::process::ProcessConfig,
        crate::query::PaginationConfig,
        crate::query::QueryConfig,
        routes::response::BulkRequest,
        routes::response::ListMetadataResponse,
        routes::response::ListRecordResponse,
        routes::response::MetadataResponse,
        routes::response::PaginationResponse,
        routes::response::ProcessedResponse,
        routes::response::RawRecordResponse,
        routes::response::RecordResponse,
        routes::response::TotalResponse,
        routes::response::UploadResponse,
        routes::response::UploadTaskResponse,
        routes::response::UploadTasksResponse,
        routes::response::UserResponse,
    ))
)]
pub struct ApiDoc;

pub fn openapi_json() -> serde_json::Value {
    serde_json::to_value(ApiDoc::openapi()).unwrap_or_default()
}

async fn serve_docs() -> Json<serde_json::Value> {
    Json(openapi_json())
}

pub fn router() -> Router<AppState> {
    Router::new().route("/docs", get(serve_docs))
}
