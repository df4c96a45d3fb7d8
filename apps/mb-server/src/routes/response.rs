use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::model::{Metadata, Record, UploadTask};
use crate::process::{ProcessConfig, ProcessedWaveform};
use crate::query::PaginationConfig;

/// Record metadata as served over the wire; locations in `[lon, lat]` order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct MetadataResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub magnitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_acceleration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_location: Option<[f64; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station_location: Option<[f64; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station_elevation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station_elevation_unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling_frequency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling_frequency_unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_factor: Option<f64>,
}

impl MetadataResponse {
    pub fn from_metadata(metadata: Metadata, endpoint: &str) -> Self {
        Self {
            endpoint: Some(endpoint.to_string()),
            id: metadata.id,
            file_name: metadata.file_name,
            category: metadata.category,
            region: metadata.region,
            uploaded_by: metadata.uploaded_by,
            magnitude: metadata.magnitude,
            maximum_acceleration: metadata.maximum_acceleration,
            event_time: metadata.event_time,
            event_location: match (metadata.event_lon, metadata.event_lat) {
                (Some(lon), Some(lat)) => Some([lon, lat]),
                _ => None,
            },
            depth: metadata.depth,
            station_code: metadata.station_code,
            station_location: match (metadata.station_lon, metadata.station_lat) {
                (Some(lon), Some(lat)) => Some([lon, lat]),
                _ => None,
            },
            station_elevation: metadata.station_elevation,
            station_elevation_unit: metadata.station_elevation_unit,
            record_time: metadata.record_time,
            last_update_time: metadata.last_update_time,
            sampling_frequency: metadata.sampling_frequency,
            sampling_frequency_unit: metadata.sampling_frequency_unit,
            duration: metadata.duration,
            direction: metadata.direction,
            scale_factor: metadata.scale_factor,
        }
    }

    pub fn from_record(record: &Record, endpoint: &str) -> Self {
        Self {
            endpoint: Some(endpoint.to_string()),
            id: record.id,
            file_name: record.file_name.clone(),
            category: record.category.clone(),
            region: record.region.clone(),
            uploaded_by: record.uploaded_by.clone(),
            magnitude: record.magnitude,
            maximum_acceleration: record.maximum_acceleration,
            event_time: record.event_time,
            event_location: record.event_location(),
            depth: record.depth,
            station_code: record.station_code.clone(),
            station_location: record.station_location(),
            station_elevation: record.station_elevation,
            station_elevation_unit: record.station_elevation_unit.clone(),
            record_time: record.record_time,
            last_update_time: record.last_update_time,
            sampling_frequency: record.sampling_frequency,
            sampling_frequency_unit: record.sampling_frequency_unit.clone(),
            duration: record.duration,
            direction: record.direction.clone(),
            scale_factor: record.scale_factor,
        }
    }

    /// Index hits come back as flat documents with named location axes.
    pub fn from_index_hit(source: &JsonValue, endpoint: &str) -> Self {
        let location = |value: &JsonValue| -> Option<[f64; 2]> {
            Some([value.get("lon")?.as_f64()?, value.get("lat")?.as_f64()?])
        };
        let text = |key: &str| {
            source
                .get(key)
                .and_then(JsonValue::as_str)
                .map(str::to_string)
        };
        let number = |key: &str| source.get(key).and_then(JsonValue::as_f64);
        let date = |key: &str| {
            source
                .get(key)
                .and_then(JsonValue::as_str)
                .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
                .map(|value| value.with_timezone(&Utc))
        };

        Self {
            endpoint: Some(endpoint.to_string()),
            id: source
                .get("id")
                .and_then(JsonValue::as_str)
                .and_then(|value| Uuid::parse_str(value).ok())
                .unwrap_or_default(),
            file_name: text("file_name"),
            category: text("category"),
            region: text("region"),
            uploaded_by: text("uploaded_by"),
            magnitude: number("magnitude"),
            maximum_acceleration: number("maximum_acceleration"),
            event_time: date("event_time"),
            event_location: source.get("event_location").and_then(location),
            depth: number("depth"),
            station_code: text("station_code"),
            station_location: source.get("station_location").and_then(location),
            station_elevation: number("station_elevation"),
            station_elevation_unit: text("station_elevation_unit"),
            record_time: date("record_time"),
            last_update_time: date("last_update_time"),
            sampling_frequency: number("sampling_frequency"),
            sampling_frequency_unit: text("sampling_frequency_unit"),
            duration: number("duration"),
            direction: text("direction"),
            scale_factor: number("scale_factor"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct RawRecordResponse {
    #[serde(flatten)]
    pub metadata: MetadataResponse,
    pub raw_data: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_data_unit: Option<String>,
    pub offset: f64,
}

impl RawRecordResponse {
    pub fn from_record(record: &Record, endpoint: &str) -> Self {
        Self {
            metadata: MetadataResponse::from_record(record, endpoint),
            raw_data: record.raw_data.clone(),
            raw_data_unit: record.raw_data_unit.clone(),
            offset: record.offset,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct RecordResponse {
    #[serde(flatten)]
    pub metadata: MetadataResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_data_unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_interval: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waveform: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_interval: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spectrum: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub displacement_spectrum: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velocity_spectrum: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acceleration_spectrum: Option<Vec<f64>>,
}

impl RecordResponse {
    pub fn waveform_of(
        record: &Record,
        endpoint: &str,
        normalised: bool,
    ) -> anyhow::Result<Self> {
        let (interval, waveform) = record.to_waveform(normalised, Some("cm/s/s"))?;
        Ok(Self {
            metadata: MetadataResponse::from_record(record, endpoint),
            processed_data_unit: Some(if normalised { "1" } else { "cm/s/s" }.to_string()),
            time_interval: Some(interval),
            waveform: Some(waveform),
            ..Self::default()
        })
    }

    pub fn spectrum_of(record: &Record, endpoint: &str) -> anyhow::Result<Self> {
        let (frequency_interval, spectrum) = record.to_spectrum()?;
        Ok(Self {
            metadata: MetadataResponse::from_record(record, endpoint),
            frequency_interval: Some(frequency_interval),
            spectrum: Some(spectrum),
            ..Self::default()
        })
    }

    pub fn processed_of(record: &Record, endpoint: &str, processed: ProcessedWaveform) -> Self {
        Self {
            metadata: MetadataResponse::from_record(record, endpoint),
            processed_data_unit: processed.processed_data_unit,
            time_interval: Some(processed.time_interval),
            waveform: Some(processed.waveform),
            frequency_interval: processed.frequency_interval,
            spectrum: processed.spectrum,
            period: processed.period,
            displacement_spectrum: processed.displacement_spectrum,
            velocity_spectrum: processed.velocity_spectrum,
            acceleration_spectrum: processed.acceleration_spectrum,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ProcessedResponse {
    #[serde(flatten)]
    pub record: RecordResponse,
    pub process_config: ProcessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ListRecordResponse {
    pub records: Vec<RecordResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct PaginationResponse {
    pub total: i64,
    pub page_size: i64,
    pub page_number: i64,
    pub sort_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_after: Option<Vec<JsonValue>>,
}

impl PaginationResponse {
    pub fn echo(pagination: &PaginationConfig, total: i64) -> Self {
        Self {
            total,
            page_size: pagination.page_size,
            page_number: pagination.page_number,
            sort_by: pagination.sort_by.clone(),
            search_after: pagination.search_after.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ListMetadataResponse {
    pub records: Vec<MetadataResponse>,
    pub pagination: PaginationResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct UploadResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_ids: Option<Vec<Uuid>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct UploadTaskResponse {
    pub id: Uuid,
    pub create_time: DateTime<Utc>,
    pub total_size: i64,
    pub current_size: i64,
}

impl From<UploadTask> for UploadTaskResponse {
    fn from(task: UploadTask) -> Self {
        Self {
            id: task.id,
            create_time: task.create_time,
            total_size: task.total_size,
            current_size: task.current_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct UploadTasksResponse {
    pub tasks: Vec<Option<UploadTaskResponse>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct UserResponse {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub last_name: String,
    pub first_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct TotalResponse {
    pub total: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct BulkRequest {
    pub records: Vec<JsonValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_response_flattens_locations() {
        let mut record = Record {
            file_name: Some("X.V2A".to_string()),
            region: Some("nz".to_string()),
            event_lon: Some(172.7),
            event_lat: Some(-43.58),
            ..Record::default()
        };
        record.finalise();
        let response = MetadataResponse::from_record(&record, "/query");
        assert_eq!(response.endpoint.as_deref(), Some("/query"));
        assert_eq!(response.event_location, Some([172.7, -43.58]));
        assert!(response.station_location.is_none());
    }

    #[test]
    fn raw_response_serializes_flat() {
        let mut record = Record {
            file_name: Some("X.V2A".to_string()),
            region: Some("nz".to_string()),
            raw_data: vec![1, -2],
            ..Record::default()
        };
        record.finalise();
        let response = RawRecordResponse::from_record(&record, "/raw/jackpot");
        let value = serde_json::to_value(&response).unwrap();
        // flattened metadata keys sit next to the payload keys
        assert_eq!(value["endpoint"], "/raw/jackpot");
        assert_eq!(value["raw_data"], serde_json::json!([1, -2]));
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn index_hit_round_trips_locations() {
        let source = serde_json::json!({
            "id": "6f1e52a4-2c1e-5f65-8a1c-3f0a30b0a000",
            "file_name": "A.V2A",
            "magnitude": 6.3,
            "event_location": { "lon": 172.7, "lat": -43.58 },
            "event_time": "2011-02-22T01:50:29+00:00"
        });
        let response = MetadataResponse::from_index_hit(&source, "/search");
        assert_eq!(response.file_name.as_deref(), Some("A.V2A"));
        assert_eq!(response.event_location, Some([172.7, -43.58]));
        assert!(response.event_time.is_some());
    }
}
