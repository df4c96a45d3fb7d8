use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Redirect;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::error::map_db_error;
use crate::query::QueryConfig;
use crate::routes::response::TotalResponse;
use crate::state::AppState;
use crate::store;

#[utoipa::path(get, path = "/", responses((status = 307, description = "Interactive docs")))]
pub(crate) async fn redirect_to_docs() -> Redirect {
    Redirect::temporary("/docs")
}

#[utoipa::path(get, path = "/alive", tag = "status", responses((status = 200, description = "Liveness")))]
pub(crate) async fn alive() -> Json<JsonValue> {
    Json(json!({ "message": "I'm alive!" }))
}

#[utoipa::path(get, path = "/test_endpoint", tag = "misc", responses((status = 200, description = "Test payload")))]
pub(crate) async fn for_test_only() -> Json<JsonValue> {
    Json(json!({ "message": "Test endpoint." }))
}

fn default_total_query() -> QueryConfig {
    QueryConfig {
        min_magnitude: Some(0.0),
        ..QueryConfig::default()
    }
}

#[utoipa::path(
    get,
    path = "/total",
    tag = "status",
    responses((status = 200, description = "Record count", body = TotalResponse))
)]
pub(crate) async fn get_total(
    State(state): State<AppState>,
) -> Result<Json<TotalResponse>, (StatusCode, String)> {
    let total = store::count(&state.db, &default_total_query())
        .await
        .map_err(map_db_error)?;
    Ok(Json(TotalResponse { total: vec![total] }))
}

/// One config or a batch of them; counting is explicit because it is the
/// expensive path.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum TotalRequest {
    One(Box<QueryConfig>),
    Many(Vec<QueryConfig>),
}

#[utoipa::path(
    post,
    path = "/total",
    tag = "status",
    responses(
        (status = 200, description = "Record count per query", body = TotalResponse),
        (status = 400, description = "Invalid query")
    )
)]
pub(crate) async fn post_total(
    State(state): State<AppState>,
    body: Option<Json<TotalRequest>>,
) -> Result<Json<TotalResponse>, (StatusCode, String)> {
    let queries: Vec<QueryConfig> = match body {
        Some(Json(TotalRequest::One(query))) => vec![*query],
        Some(Json(TotalRequest::Many(queries))) => queries,
        None => vec![default_total_query()],
    };

    let mut total = Vec::with_capacity(queries.len());
    for query in &queries {
        query.validate().map_err(|err| (err.status, err.message))?;
        total.push(store::count(&state.db, query).await.map_err(map_db_error)?);
    }
    Ok(Json(TotalResponse { total }))
}

#[utoipa::path(
    get,
    path = "/stats",
    tag = "status",
    responses((status = 200, description = "Histogram aggregations over magnitude and PGA"))
)]
pub(crate) async fn aggregation_stats(
    State(state): State<AppState>,
) -> Result<Json<JsonValue>, (StatusCode, String)> {
    let aggregations = state.elastic.stats_aggregation().await.map_err(|err| {
        tracing::error!(error = format!("{err:#}"), "stats aggregation failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Search index is not available.".to_string(),
        )
    })?;
    Ok(Json(aggregations))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(redirect_to_docs))
        .route("/alive", get(alive))
        .route("/test_endpoint", get(for_test_only))
        .route("/total", get(get_total).post(post_total))
        .route("/stats", get(aggregation_stats))
}
