use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sqlx::{Postgres, QueryBuilder};

use crate::error::AppError;

pub const EARTH_RADIUS_METRES: f64 = 6_378_100.0;
pub const DEFAULT_DISTANCE_METRES: f64 = 100_000.0;
/// Offset pagination in the index is capped; deeper pages use `search_after`.
pub const MAX_OFFSET_HITS: i64 = 10_000;

pub const SORT_FIELDS: &[&str] = &["magnitude", "maximum_acceleration", "event_time", "depth"];

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct PaginationConfig {
    #[serde(default = "default_page_size")]
    pub page_size: i64,
    #[serde(default)]
    pub page_number: i64,
    #[serde(default = "default_sort_by")]
    pub sort_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_after: Option<Vec<JsonValue>>,
}

fn default_page_size() -> i64 {
    10
}

fn default_sort_by() -> String {
    "-maximum_acceleration".to_string()
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            page_number: 0,
            sort_by: default_sort_by(),
            search_after: None,
        }
    }
}

impl PaginationConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if !(1..=1000).contains(&self.page_size) {
            return Err(AppError::bad_request("page_size must be within [1, 1000]"));
        }
        if self.page_number < 0 {
            return Err(AppError::bad_request("page_number must be non-negative"));
        }
        parse_sort_token(&self.sort_by)?;
        Ok(())
    }
}

/// `±field` sort token. Anything outside the known field set is rejected.
pub fn parse_sort_token(token: &str) -> Result<(String, bool), AppError> {
    let token = token.trim().to_lowercase();
    let (field, descending) = if let Some(rest) = token.strip_prefix('+') {
        (rest, false)
    } else if let Some(rest) = token.strip_prefix('-') {
        (rest, true)
    } else {
        return Err(AppError::bad_request(format!(
            "Invalid sort_by value: {token}"
        )));
    };
    if !SORT_FIELDS.contains(&field) {
        return Err(AppError::bad_request(format!(
            "Invalid sort_by value: {token}"
        )));
    }
    Ok((field.to_string(), descending))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct QueryConfig {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub min_magnitude: Option<f64>,
    #[serde(default)]
    pub max_magnitude: Option<f64>,
    #[serde(default)]
    pub category: Option<String>,
    /// `[longitude, latitude]`
    #[serde(default)]
    pub event_location: Option<[f64; 2]>,
    /// `[longitude, latitude]`
    #[serde(default)]
    pub station_location: Option<[f64; 2]>,
    /// Metres from `event_location`.
    #[serde(default)]
    pub max_event_distance: Option<f64>,
    /// Metres from `station_location`.
    #[serde(default)]
    pub max_station_distance: Option<f64>,
    #[serde(default)]
    pub from_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub min_pga: Option<f64>,
    #[serde(default)]
    pub max_pga: Option<f64>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub station_code: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub pagination: PaginationConfig,
}

impl QueryConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if let Some(region) = self.region.as_deref() {
            if region != "jp" && region != "nz" {
                return Err(AppError::bad_request("region must be one of jp, nz"));
            }
        }
        for magnitude in [self.min_magnitude, self.max_magnitude].into_iter().flatten() {
            if !(0.0..=10.0).contains(&magnitude) {
                return Err(AppError::bad_request("magnitude must be within [0, 10]"));
            }
        }
        for pga in [self.min_pga, self.max_pga].into_iter().flatten() {
            if pga < 0.0 {
                return Err(AppError::bad_request("PGA bounds must be non-negative"));
            }
        }
        for distance in [self.max_event_distance, self.max_station_distance]
            .into_iter()
            .flatten()
        {
            if distance < 0.0 {
                return Err(AppError::bad_request("distances must be non-negative"));
            }
        }
        self.pagination.validate()
    }

    /// Append the store-side WHERE clauses. The caller has already written a
    /// `WHERE TRUE` anchor so every clause starts with ` AND`.
    pub fn apply_store_filters(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        if let Some(region) = &self.region {
            builder.push(" AND region = ");
            builder.push_bind(region.to_lowercase());
        }
        if let Some(category) = &self.category {
            builder.push(" AND category = ");
            builder.push_bind(category.to_lowercase());
        }
        if let Some(min_magnitude) = self.min_magnitude {
            builder.push(" AND magnitude >= ");
            builder.push_bind(min_magnitude);
        }
        if let Some(max_magnitude) = self.max_magnitude {
            builder.push(" AND magnitude <= ");
            builder.push_bind(max_magnitude);
        }
        if let Some(center) = self.event_location {
            push_distance_cap(
                builder,
                "event_lon",
                "event_lat",
                center,
                self.max_event_distance.unwrap_or(DEFAULT_DISTANCE_METRES),
            );
        }
        if let Some(center) = self.station_location {
            push_distance_cap(
                builder,
                "station_lon",
                "station_lat",
                center,
                self.max_station_distance.unwrap_or(DEFAULT_DISTANCE_METRES),
            );
        }
        if let Some(from_date) = self.from_date {
            builder.push(" AND event_time >= ");
            builder.push_bind(from_date);
        }
        if let Some(to_date) = self.to_date {
            builder.push(" AND event_time <= ");
            builder.push_bind(to_date);
        }
        if let Some(min_pga) = self.min_pga {
            builder.push(" AND maximum_acceleration >= ");
            builder.push_bind(min_pga);
        }
        if let Some(max_pga) = self.max_pga {
            builder.push(" AND maximum_acceleration <= ");
            builder.push_bind(max_pga);
        }
        if let Some(direction) = &self.direction {
            builder.push(" AND direction ~* ");
            builder.push_bind(direction.clone());
        }
        if let Some(file_name) = &self.file_name {
            builder.push(" AND file_name ~* ");
            builder.push_bind(file_name.clone());
        }
        if let Some(station_code) = &self.station_code {
            builder.push(" AND station_code ~* ");
            builder.push_bind(station_code.clone());
        }
    }

    /// The search-index side of the plan: a `bool.must` list with match,
    /// range, regexp and geo_distance clauses. Locations use named axes.
    pub fn to_elastic_query(&self) -> JsonValue {
        let mut must: Vec<JsonValue> = Vec::new();

        if let Some(region) = &self.region {
            must.push(json!({ "match": { "region": region.to_lowercase() } }));
        }
        if let Some(category) = &self.category {
            must.push(json!({ "match": { "category": category.to_lowercase() } }));
        }

        let mut magnitude = serde_json::Map::new();
        if let Some(min_magnitude) = self.min_magnitude {
            magnitude.insert("gte".to_string(), json!(min_magnitude));
        }
        if let Some(max_magnitude) = self.max_magnitude {
            magnitude.insert("lte".to_string(), json!(max_magnitude));
        }
        if !magnitude.is_empty() {
            must.push(json!({ "range": { "magnitude": magnitude } }));
        }

        let mut event_time = serde_json::Map::new();
        if let Some(from_date) = self.from_date {
            event_time.insert("gte".to_string(), json!(from_date));
        }
        if let Some(to_date) = self.to_date {
            event_time.insert("lte".to_string(), json!(to_date));
        }
        if !event_time.is_empty() {
            must.push(json!({ "range": { "event_time": event_time } }));
        }

        let mut pga = serde_json::Map::new();
        if let Some(min_pga) = self.min_pga {
            pga.insert("gte".to_string(), json!(min_pga));
        }
        if let Some(max_pga) = self.max_pga {
            pga.insert("lte".to_string(), json!(max_pga));
        }
        if !pga.is_empty() {
            must.push(json!({ "range": { "maximum_acceleration": pga } }));
        }

        if let Some([lon, lat]) = self.event_location {
            let distance = self.max_event_distance.unwrap_or(DEFAULT_DISTANCE_METRES);
            must.push(json!({
                "geo_distance": {
                    "distance": format!("{}m", distance as i64),
                    "event_location": { "lon": lon, "lat": lat }
                }
            }));
        }
        if let Some([lon, lat]) = self.station_location {
            let distance = self.max_station_distance.unwrap_or(DEFAULT_DISTANCE_METRES);
            must.push(json!({
                "geo_distance": {
                    "distance": format!("{}m", distance as i64),
                    "station_location": { "lon": lon, "lat": lat }
                }
            }));
        }

        if let Some(direction) = &self.direction {
            must.push(json!({ "regexp": { "direction": direction } }));
        }
        if let Some(file_name) = &self.file_name {
            must.push(json!({ "regexp": { "file_name": file_name } }));
        }
        if let Some(station_code) = &self.station_code {
            must.push(json!({ "regexp": { "station_code": station_code } }));
        }

        json!({ "bool": { "must": must } })
    }

    /// Index sort: the requested field plus the id tiebreak that makes
    /// `search_after` tokens unambiguous.
    pub fn to_elastic_sort(&self) -> Result<JsonValue, AppError> {
        let (field, descending) = parse_sort_token(&self.pagination.sort_by)?;
        let order = if descending { "desc" } else { "asc" };
        let mut primary = serde_json::Map::new();
        primary.insert(field, json!({ "order": order }));
        Ok(json!([primary, { "id": { "order": "asc" } }]))
    }
}

fn push_distance_cap(
    builder: &mut QueryBuilder<'_, Postgres>,
    lon_column: &str,
    lat_column: &str,
    center: [f64; 2],
    distance_metres: f64,
) {
    let [lon, lat] = center;
    builder.push(format!(
        " AND {lon_column} IS NOT NULL AND {lat_column} IS NOT NULL"
    ));
    builder.push(format!(
        " AND 2.0 * {EARTH_RADIUS_METRES} * asin(least(1.0, sqrt(\
           power(sin(radians({lat_column} - "
    ));
    builder.push_bind(lat);
    builder.push(") / 2.0), 2) + cos(radians(");
    builder.push_bind(lat);
    builder.push(format!(
        ")) * cos(radians({lat_column})) * power(sin(radians({lon_column} - "
    ));
    builder.push_bind(lon);
    builder.push(") / 2.0), 2)))) <= ");
    builder.push_bind(distance_metres);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_tokens_accept_signed_known_fields() {
        assert_eq!(
            parse_sort_token("-magnitude").unwrap(),
            ("magnitude".to_string(), true)
        );
        assert_eq!(
            parse_sort_token("+event_time").unwrap(),
            ("event_time".to_string(), false)
        );
        assert!(parse_sort_token("magnitude").is_err());
        assert!(parse_sort_token("-station_code").is_err());
        assert!(parse_sort_token("").is_err());
    }

    #[test]
    fn validation_bounds() {
        let mut query = QueryConfig {
            region: Some("jp".to_string()),
            min_magnitude: Some(5.0),
            ..QueryConfig::default()
        };
        assert!(query.validate().is_ok());

        query.region = Some("eu".to_string());
        assert!(query.validate().is_err());

        query.region = Some("nz".to_string());
        query.min_magnitude = Some(11.0);
        assert!(query.validate().is_err());

        query.min_magnitude = None;
        query.pagination.page_size = 2000;
        assert!(query.validate().is_err());
    }

    #[test]
    fn store_filters_reference_bound_fields() {
        let query = QueryConfig {
            region: Some("jp".to_string()),
            min_magnitude: Some(5.0),
            event_location: Some([138.2, 36.1]),
            direction: Some("NS".to_string()),
            ..QueryConfig::default()
        };
        let mut builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM records WHERE TRUE");
        query.apply_store_filters(&mut builder);
        let sql = builder.sql();
        assert!(sql.contains("region = "));
        assert!(sql.contains("magnitude >= "));
        assert!(sql.contains("asin"));
        assert!(sql.contains("direction ~* "));
        assert!(sql.contains("6378100"));
    }

    #[test]
    fn elastic_query_uses_named_axes_and_default_distance() {
        let query = QueryConfig {
            event_location: Some([172.68, -43.53]),
            min_pga: Some(10.0),
            ..QueryConfig::default()
        };
        let value = query.to_elastic_query();
        let must = value["bool"]["must"].as_array().unwrap();
        let geo = must
            .iter()
            .find(|clause| clause.get("geo_distance").is_some())
            .unwrap();
        assert_eq!(geo["geo_distance"]["distance"], "100000m");
        assert_eq!(geo["geo_distance"]["event_location"]["lon"], 172.68);
        assert_eq!(geo["geo_distance"]["event_location"]["lat"], -43.53);
    }

    #[test]
    fn random_configs_emit_one_clause_per_filter_group() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(17);
        for _ in 0..64 {
            let mut expected = 0usize;
            let mut query = QueryConfig::default();
            if rng.gen_bool(0.5) {
                query.region = Some(if rng.gen_bool(0.5) { "jp" } else { "nz" }.to_string());
                expected += 1;
            }
            if rng.gen_bool(0.5) {
                query.min_magnitude = Some(rng.gen_range(0.0..5.0));
                expected += 1;
            }
            if rng.gen_bool(0.5) {
                query.max_pga = Some(rng.gen_range(0.0..1000.0));
                expected += 1;
            }
            if rng.gen_bool(0.5) {
                query.event_location =
                    Some([rng.gen_range(-180.0..180.0), rng.gen_range(-90.0..90.0)]);
                expected += 1;
            }
            if rng.gen_bool(0.5) {
                query.station_code = Some("MQZ".to_string());
                expected += 1;
            }

            assert!(query.validate().is_ok());
            let value = query.to_elastic_query();
            let must = value["bool"]["must"].as_array().unwrap();
            assert_eq!(must.len(), expected);
        }
    }

    #[test]
    fn elastic_sort_has_id_tiebreak() {
        let query = QueryConfig::default();
        let sort = query.to_elastic_sort().unwrap();
        assert_eq!(sort[0]["maximum_acceleration"]["order"], "desc");
        assert_eq!(sort[1]["id"]["order"], "asc");
    }
}
