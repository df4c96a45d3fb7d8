use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::auth::{require_upload, AuthUser};
use crate::error::{internal_error, map_db_error};
use crate::model::Record;
use crate::process::{response_spectrum, ProcessConfig};
use crate::query::{parse_sort_token, QueryConfig, MAX_OFFSET_HITS};
use crate::routes::response::{
    BulkRequest, ListMetadataResponse, ListRecordResponse, MetadataResponse, PaginationResponse,
    ProcessedResponse, RawRecordResponse, RecordResponse,
};
use crate::state::AppState;
use crate::store;

async fn get_random_record(state: &AppState) -> Result<Record, (StatusCode, String)> {
    let mut records = store::sample(&state.db, 1).await.map_err(map_db_error)?;
    records
        .pop()
        .ok_or((StatusCode::NO_CONTENT, "Record not found.".to_string()))
}

#[utoipa::path(
    get,
    path = "/raw/jackpot",
    tag = "record",
    responses(
        (status = 200, description = "One random raw record", body = RawRecordResponse),
        (status = 204, description = "Empty collection")
    )
)]
pub(crate) async fn download_single_random_raw_record(
    State(state): State<AppState>,
) -> Result<Json<RawRecordResponse>, (StatusCode, String)> {
    let record = get_random_record(&state).await?;
    Ok(Json(RawRecordResponse::from_record(&record, "/raw/jackpot")))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct JackpotParams {
    #[serde(default)]
    normalised: bool,
}

#[utoipa::path(
    get,
    path = "/waveform/jackpot",
    tag = "record",
    responses(
        (status = 200, description = "One random waveform", body = RecordResponse),
        (status = 204, description = "Empty collection")
    )
)]
pub(crate) async fn download_single_random_waveform(
    State(state): State<AppState>,
    Query(params): Query<JackpotParams>,
) -> Result<Json<RecordResponse>, (StatusCode, String)> {
    let record = get_random_record(&state).await?;
    let response = RecordResponse::waveform_of(&record, "/waveform/jackpot", params.normalised)
        .map_err(internal_error)?;
    Ok(Json(response))
}

#[utoipa::path(
    get,
    path = "/spectrum/jackpot",
    tag = "record",
    responses(
        (status = 200, description = "One random Fourier spectrum", body = RecordResponse),
        (status = 204, description = "Empty collection")
    )
)]
pub(crate) async fn download_single_random_spectrum(
    State(state): State<AppState>,
) -> Result<Json<RecordResponse>, (StatusCode, String)> {
    let record = get_random_record(&state).await?;
    let response =
        RecordResponse::spectrum_of(&record, "/spectrum/jackpot").map_err(internal_error)?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponseSpectrumParams {
    #[serde(default = "default_damping_ratio")]
    damping_ratio: f64,
    #[serde(default = "default_period_start")]
    period_start: f64,
    #[serde(default = "default_period_end")]
    period_end: f64,
    #[serde(default = "default_period_step")]
    period_step: f64,
}

fn default_damping_ratio() -> f64 {
    0.05
}
fn default_period_start() -> f64 {
    0.01
}
fn default_period_end() -> f64 {
    10.0
}
fn default_period_step() -> f64 {
    0.01
}

#[utoipa::path(
    get,
    path = "/response_spectrum/jackpot",
    tag = "record",
    params(
        ("damping_ratio" = f64, Query, description = "Oscillator damping ratio"),
        ("period_start" = f64, Query, description = "First period of the bracket"),
        ("period_end" = f64, Query, description = "Last period of the bracket"),
        ("period_step" = f64, Query, description = "Period increment")
    ),
    responses(
        (status = 200, description = "One random response spectrum", body = RecordResponse),
        (status = 204, description = "Empty collection"),
        (status = 400, description = "Invalid bracket")
    )
)]
pub(crate) async fn download_single_random_response_spectrum(
    State(state): State<AppState>,
    Query(params): Query<ResponseSpectrumParams>,
) -> Result<Json<RecordResponse>, (StatusCode, String)> {
    if !(0.0..=1.0).contains(&params.damping_ratio) {
        return Err((
            StatusCode::BAD_REQUEST,
            "Damping ratio must be within [0, 1].".to_string(),
        ));
    }
    if params.period_start < 0.0 || params.period_end < 0.0 || params.period_step < 0.0 {
        return Err((
            StatusCode::BAD_REQUEST,
            "Period bracket must be non-negative.".to_string(),
        ));
    }

    let record = get_random_record(&state).await?;
    let (interval, waveform) = record
        .to_waveform(false, Some("cm/s/s"))
        .map_err(internal_error)?;

    let period = response_spectrum::period_range(
        params.period_start,
        params.period_end,
        params.period_step,
    );
    let damping_ratio = params.damping_ratio;
    let spectrum = {
        let period = period.clone();
        tokio::task::spawn_blocking(move || {
            response_spectrum::response_spectrum(damping_ratio, interval, &waveform, &period)
        })
        .await
        .map_err(internal_error)?
    };

    let mut response = RecordResponse {
        metadata: MetadataResponse::from_record(&record, "/response_spectrum/jackpot"),
        time_interval: Some(interval),
        ..RecordResponse::default()
    };
    response.displacement_spectrum = Some(spectrum.iter().map(|row| row[0]).collect());
    response.velocity_spectrum = Some(spectrum.iter().map(|row| row[1]).collect());
    response.acceleration_spectrum = Some(spectrum.iter().map(|row| row[2]).collect());
    response.period = Some(period);
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum RecordIdRequest {
    One(Uuid),
    Many(Vec<Uuid>),
}

#[utoipa::path(
    post,
    path = "/waveform",
    tag = "record",
    responses((status = 200, description = "Waveforms for the requested ids", body = ListRecordResponse))
)]
pub(crate) async fn download_waveform(
    State(state): State<AppState>,
    Json(request): Json<RecordIdRequest>,
) -> Result<Json<ListRecordResponse>, (StatusCode, String)> {
    let ids = match request {
        RecordIdRequest::One(id) => vec![id],
        RecordIdRequest::Many(ids) => ids,
    };
    let records = store::find_by_ids(&state.db, &ids)
        .await
        .map_err(map_db_error)?;

    let mut responses = Vec::with_capacity(records.len());
    for record in &records {
        responses
            .push(RecordResponse::waveform_of(record, "/waveform", false).map_err(internal_error)?);
    }
    Ok(Json(ListRecordResponse { records: responses }))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct QueryParams {
    #[serde(default)]
    count_total: bool,
}

/// Store-backed query. Counting is opt-in: the geospatial count walks the
/// haversine predicate and the service treats it as expensive.
#[utoipa::path(
    post,
    path = "/query",
    tag = "record",
    request_body = QueryConfig,
    params(("count_total" = bool, Query, description = "Compute the total match count")),
    responses(
        (status = 200, description = "Metadata page", body = ListMetadataResponse),
        (status = 400, description = "Invalid query")
    )
)]
pub(crate) async fn query_records(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
    body: Option<Json<QueryConfig>>,
) -> Result<Json<ListMetadataResponse>, (StatusCode, String)> {
    let query = body.map(|Json(query)| query).unwrap_or_default();
    query
        .validate()
        .map_err(|err| (err.status, err.message))?;
    let (sort_field, descending) =
        parse_sort_token(&query.pagination.sort_by).map_err(|err| (err.status, err.message))?;

    let total = if params.count_total {
        store::count(&state.db, &query).await.map_err(map_db_error)?
    } else {
        0
    };

    let records = store::query_metadata(&state.db, &query, &sort_field, descending)
        .await
        .map_err(map_db_error)?
        .into_iter()
        .map(|metadata| MetadataResponse::from_metadata(metadata, "/query"))
        .collect();

    Ok(Json(ListMetadataResponse {
        records,
        pagination: PaginationResponse::echo(&query.pagination, total),
    }))
}

/// Index-backed search. Offset pagination is capped by the index; deeper
/// result sets stream through `search_after` tokens.
#[utoipa::path(
    post,
    path = "/search",
    tag = "record",
    request_body = QueryConfig,
    responses(
        (status = 200, description = "Metadata page from the search index", body = ListMetadataResponse),
        (status = 400, description = "Invalid query")
    )
)]
pub(crate) async fn search_records(
    State(state): State<AppState>,
    body: Option<Json<QueryConfig>>,
) -> Result<Json<ListMetadataResponse>, (StatusCode, String)> {
    let query = body.map(|Json(query)| query).unwrap_or_default();
    query
        .validate()
        .map_err(|err| (err.status, err.message))?;
    let sort = query
        .to_elastic_sort()
        .map_err(|err| (err.status, err.message))?;

    let pagination = &query.pagination;
    let page_size = pagination.page_size;
    let page_number = pagination
        .page_number
        .min(MAX_OFFSET_HITS / page_size - 1)
        .max(0);

    let results = state
        .elastic
        .search(
            &query,
            Some(page_number * page_size),
            page_size,
            sort,
            pagination.search_after.as_deref(),
        )
        .await
        .map_err(|err| {
            tracing::error!(error = format!("{err:#}"), "search failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Search index is not available.".to_string(),
            )
        })?;

    let next_search_after = results.hits.last().and_then(|hit| hit.sort.clone());
    let records: Vec<MetadataResponse> = results
        .hits
        .iter()
        .map(|hit| MetadataResponse::from_index_hit(&hit.source, "/search"))
        .collect();

    let mut pagination = PaginationResponse::echo(pagination, results.total);
    pagination.page_number = page_number;
    pagination.search_after = next_search_after;

    Ok(Json(ListMetadataResponse {
        records,
        pagination,
    }))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProcessParams {
    record_id: Uuid,
}

#[utoipa::path(
    post,
    path = "/process",
    tag = "record",
    request_body = ProcessConfig,
    params(("record_id" = Uuid, Query, description = "Record to process")),
    responses(
        (status = 200, description = "Processed record", body = ProcessedResponse),
        (status = 400, description = "Invalid processing config"),
        (status = 404, description = "Record not found")
    )
)]
pub(crate) async fn process_record(
    State(state): State<AppState>,
    Query(params): Query<ProcessParams>,
    Json(process_config): Json<ProcessConfig>,
) -> Result<Json<ProcessedResponse>, (StatusCode, String)> {
    process_config
        .validate()
        .map_err(|err| (err.status, err.message))?;

    let record = store::find_one(&state.db, params.record_id)
        .await
        .map_err(map_db_error)?
        .ok_or((StatusCode::NOT_FOUND, "Record not found.".to_string()))?;

    let processed = state
        .jobs
        .process_record_routed(&record, &process_config)
        .await
        .map_err(internal_error)?;

    Ok(Json(ProcessedResponse {
        record: RecordResponse::processed_of(&record, "/process", processed),
        process_config,
    }))
}

/// Proxy a prebuilt bulk payload to the search index.
#[utoipa::path(
    post,
    path = "/index",
    tag = "record",
    request_body = BulkRequest,
    responses(
        (status = 200, description = "Bulk response from the index"),
        (status = 401, description = "Not allowed to upload")
    ),
    security(("HTTPBearer" = []))
)]
pub(crate) async fn index_records(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(body): Json<BulkRequest>,
) -> Result<Json<JsonValue>, (StatusCode, String)> {
    require_upload(&user).map_err(|err| (err.status, err.message))?;

    let result = state
        .elastic
        .bulk_raw(&body.records)
        .await
        .map_err(internal_error)?;
    Ok(Json(result))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/raw/jackpot", get(download_single_random_raw_record))
        .route("/waveform/jackpot", get(download_single_random_waveform))
        .route("/spectrum/jackpot", get(download_single_random_spectrum))
        .route(
            "/response_spectrum/jackpot",
            get(download_single_random_response_spectrum),
        )
        .route("/waveform", post(download_waveform))
        .route("/query", post(query_records))
        .route("/search", post(search_records))
        .route("/process", post(process_record))
        .route("/index", post(index_records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::OnceLock;
    use tower::ServiceExt;

    static STATE: OnceLock<AppState> = OnceLock::new();

    fn state() -> AppState {
        STATE.get_or_init(crate::test_support::test_state).clone()
    }

    async fn post_json(path: &str, body: &str) -> axum::http::StatusCode {
        let app = router().with_state(state());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(path)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        resp.status()
    }

    #[tokio::test]
    async fn query_rejects_unknown_sort_tokens() {
        let status = post_json(
            "/query",
            r#"{"pagination": {"sort_by": "-station_code"}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn query_rejects_out_of_range_magnitudes() {
        let status = post_json("/query", r#"{"min_magnitude": 11.0}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn search_rejects_unknown_regions() {
        let status = post_json("/search", r#"{"region": "eu"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn process_rejects_inverted_cutoffs() {
        let record_id = uuid::Uuid::new_v4();
        let status = post_json(
            &format!("/process?record_id={record_id}"),
            r#"{"low_cut": 30.0, "high_cut": 5.0}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn process_rejects_unknown_windows() {
        let record_id = uuid::Uuid::new_v4();
        let status = post_json(
            &format!("/process?record_id={record_id}"),
            r#"{"window_type": "tukey"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn response_spectrum_jackpot_rejects_bad_damping() {
        let app = router().with_state(state());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/response_spectrum/jackpot?damping_ratio=1.5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
