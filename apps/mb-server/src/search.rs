use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::model::Record;
use crate::query::QueryConfig;

pub const RECORD_INDEX: &str = "record";

/// Secondary index client. The index mirrors record metadata and is
/// eventually consistent with the store; the store stays the source of truth.
#[derive(Clone)]
pub struct ElasticService {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub source: JsonValue,
    pub sort: Option<Vec<JsonValue>>,
}

#[derive(Debug, Clone)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    pub total: i64,
}

impl ElasticService {
    pub fn new(base_url: String, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    /// Keep trying to ensure the mapping until the index service comes up.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut delay = Duration::from_secs(2);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                match self.ensure_index().await {
                    Ok(()) => {
                        tracing::info!("search index mapping ensured");
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "search index ensure failed (will retry)");
                        delay = std::cmp::min(delay * 2, Duration::from_secs(60));
                    }
                }
            }
        });
    }

    pub async fn ping(&self) -> Result<bool> {
        let resp = self
            .http
            .get(&self.base_url)
            .timeout(Duration::from_secs(2))
            .send()
            .await;
        match resp {
            Ok(r) => Ok(r.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    pub async fn ensure_index(&self) -> Result<()> {
        if !self.ping().await? {
            anyhow::bail!("search index is not reachable at {}", self.base_url);
        }

        let url = format!("{}/{}", self.base_url, RECORD_INDEX);
        let resp = self.http.head(&url).send().await?;
        if resp.status().is_success() {
            return Ok(());
        }
        if resp.status() != StatusCode::NOT_FOUND {
            anyhow::bail!("search index probe returned {}", resp.status());
        }

        let resp = self
            .http
            .put(&url)
            .json(&json!({ "mappings": record_mapping() }))
            .send()
            .await
            .with_context(|| format!("create index request failed for {url}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            // A concurrent worker may have won the race.
            if !body.contains("resource_already_exists_exception") {
                anyhow::bail!("create index failed: {status} {body}");
            }
        }
        Ok(())
    }

    /// Batched upsert keyed by record id, one call per parsed archive.
    pub async fn bulk_index(&self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut body = String::new();
        for record in records {
            body.push_str(
                &json!({ "index": { "_index": RECORD_INDEX, "_id": record.id } }).to_string(),
            );
            body.push('\n');
            body.push_str(&index_document(record).to_string());
            body.push('\n');
        }

        let url = format!("{}/_bulk", self.base_url);
        let resp = self
            .http
            .post(&url)
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .with_context(|| format!("bulk index request failed for {url}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("bulk index failed: {status} {body}");
        }

        let parsed: JsonValue = resp.json().await.context("bulk response is not JSON")?;
        if parsed.get("errors").and_then(JsonValue::as_bool) == Some(true) {
            anyhow::bail!("bulk index reported per-item errors");
        }
        Ok(())
    }

    /// Raw bulk payload pass-through for the `/index` endpoint.
    pub async fn bulk_raw(&self, actions: &[JsonValue]) -> Result<JsonValue> {
        let mut body = String::new();
        for action in actions {
            body.push_str(&action.to_string());
            body.push('\n');
        }
        let url = format!("{}/_bulk", self.base_url);
        let resp = self
            .http
            .post(&url)
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .with_context(|| format!("bulk request failed for {url}"))?;
        let status = resp.status();
        let parsed: JsonValue = resp.json().await.unwrap_or_else(|_| json!({}));
        if !status.is_success() {
            anyhow::bail!("bulk request failed: {status} {parsed}");
        }
        Ok(parsed)
    }

    pub async fn search(
        &self,
        query: &QueryConfig,
        from: Option<i64>,
        size: i64,
        sort: JsonValue,
        search_after: Option<&[JsonValue]>,
    ) -> Result<SearchResults> {
        let mut body = json!({
            "query": query.to_elastic_query(),
            "size": size,
            "sort": sort,
            "track_total_hits": true,
        });
        if let Some(search_after) = search_after {
            body["search_after"] = json!(search_after);
        } else if let Some(from) = from {
            body["from"] = json!(from);
        }

        let url = format!("{}/{}/_search", self.base_url, RECORD_INDEX);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("search request failed for {url}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("search failed: {status} {body}");
        }

        let parsed: JsonValue = resp.json().await.context("search response is not JSON")?;
        let total = parsed["hits"]["total"]["value"].as_i64().unwrap_or(0);
        let hits = parsed["hits"]["hits"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|hit| SearchHit {
                source: hit.get("_source").cloned().unwrap_or_else(|| json!({})),
                sort: hit
                    .get("sort")
                    .and_then(JsonValue::as_array)
                    .map(|values| values.to_vec()),
            })
            .collect();

        Ok(SearchResults { hits, total })
    }

    /// Histograms over magnitude and PGA for the stats endpoint.
    pub async fn stats_aggregation(&self) -> Result<JsonValue> {
        let body = json!({
            "query": { "range": { "magnitude": { "gte": 1, "lte": 10 } } },
            "aggs": {
                "magnitude": { "histogram": { "field": "magnitude", "interval": 1 } },
                "pga": { "histogram": { "field": "maximum_acceleration", "interval": 10 } }
            },
            "size": 0
        });

        let url = format!("{}/{}/_search", self.base_url, RECORD_INDEX);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("aggregation request failed for {url}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("aggregation failed: {status} {body}");
        }
        let parsed: JsonValue = resp.json().await?;
        Ok(parsed
            .get("aggregations")
            .cloned()
            .unwrap_or_else(|| json!({})))
    }

}

/// Fixed mapping: text for categorical strings, floats for magnitudes and
/// depths, dates for timestamps, geo_point for locations. `id` is a keyword
/// so the search_after tiebreak can sort on it.
pub fn record_mapping() -> JsonValue {
    json!({
        "properties": {
            "id": { "type": "keyword" },
            "file_name": { "type": "text" },
            "file_hash": { "type": "text" },
            "category": { "type": "text" },
            "region": { "type": "text" },
            "uploaded_by": { "type": "text" },
            "magnitude": { "type": "float" },
            "maximum_acceleration": { "type": "float" },
            "event_time": { "type": "date" },
            "event_location": { "type": "geo_point" },
            "depth": { "type": "float" },
            "station_code": { "type": "text" },
            "station_location": { "type": "geo_point" },
            "station_elevation": { "type": "float" },
            "station_elevation_unit": { "type": "text" },
            "record_time": { "type": "date" },
            "last_update_time": { "type": "date" },
            "sampling_frequency": { "type": "float" },
            "sampling_frequency_unit": { "type": "text" },
            "duration": { "type": "float" },
            "direction": { "type": "text" }
        }
    })
}

/// The metadata subset shipped to the index; locations in `{lon, lat}` object
/// form because the index expects named axes.
pub fn index_document(record: &Record) -> JsonValue {
    let mut doc = json!({
        "id": record.id,
        "file_name": record.file_name,
        "file_hash": record.file_hash,
        "category": record.category,
        "region": record.region,
        "uploaded_by": record.uploaded_by,
        "magnitude": record.magnitude,
        "maximum_acceleration": record.maximum_acceleration,
        "event_time": record.event_time,
        "depth": record.depth,
        "station_code": record.station_code,
        "station_elevation": record.station_elevation,
        "station_elevation_unit": record.station_elevation_unit,
        "record_time": record.record_time,
        "last_update_time": record.last_update_time,
        "sampling_frequency": record.sampling_frequency,
        "sampling_frequency_unit": record.sampling_frequency_unit,
        "duration": record.duration,
        "direction": record.direction,
    });
    if let Some([lon, lat]) = record.event_location() {
        doc["event_location"] = json!({ "lon": lon, "lat": lat });
    }
    if let Some([lon, lat]) = record.station_location() {
        doc["station_location"] = json!({ "lon": lon, "lat": lat });
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Record;

    #[test]
    fn mapping_types_are_fixed() {
        let mapping = record_mapping();
        let properties = &mapping["properties"];
        assert_eq!(properties["magnitude"]["type"], "float");
        assert_eq!(properties["event_time"]["type"], "date");
        assert_eq!(properties["event_location"]["type"], "geo_point");
        assert_eq!(properties["station_location"]["type"], "geo_point");
        assert_eq!(properties["id"]["type"], "keyword");
    }

    #[test]
    fn index_document_drops_samples_and_names_axes() {
        let mut record = Record {
            file_name: Some("X.V2A".to_string()),
            region: Some("nz".to_string()),
            raw_data: vec![1, 2, 3],
            event_lon: Some(172.68),
            event_lat: Some(-43.53),
            ..Record::default()
        };
        record.finalise();
        let doc = index_document(&record);
        assert!(doc.get("raw_data").is_none());
        assert_eq!(doc["event_location"]["lon"], 172.68);
        assert_eq!(doc["event_location"]["lat"], -43.53);
        assert!(doc.get("station_location").is_none());
    }
}
