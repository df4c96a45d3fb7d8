use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::model::{Metadata, Record};
use crate::query::QueryConfig;

const RECORD_COLUMNS: &str = "id, file_name, file_hash, category, region, uploaded_by, \
     magnitude, maximum_acceleration, event_time, event_lon, event_lat, depth, \
     station_code, station_lon, station_lat, station_elevation, station_elevation_unit, \
     record_time, last_update_time, sampling_frequency, sampling_frequency_unit, \
     duration, direction, scale_factor, raw_data, raw_data_unit, data_offset";

const METADATA_COLUMNS: &str = "id, file_name, category, region, uploaded_by, \
     magnitude, maximum_acceleration, event_time, event_lon, event_lat, depth, \
     station_code, station_lon, station_lat, station_elevation, station_elevation_unit, \
     record_time, last_update_time, sampling_frequency, sampling_frequency_unit, \
     duration, direction, scale_factor";

/// Upsert by deterministic id. A record whose exact payload (`file_hash`) is
/// already stored is replaced when the caller asked to overwrite and left
/// untouched otherwise.
pub async fn save(
    db: &PgPool,
    record: &mut Record,
    overwrite_existing: bool,
) -> Result<Uuid, sqlx::Error> {
    record.finalise();

    if let Some(file_hash) = record.file_hash.as_deref() {
        let existing: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM records WHERE file_hash = $1 AND region = $2 LIMIT 1",
        )
        .bind(file_hash)
        .bind(record.region.as_deref())
        .fetch_optional(db)
        .await?;

        if let Some(existing_id) = existing {
            if overwrite_existing {
                sqlx::query("DELETE FROM records WHERE id = $1")
                    .bind(existing_id)
                    .execute(db)
                    .await?;
            } else {
                return Ok(existing_id);
            }
        }
    }

    sqlx::query(
        r#"
        INSERT INTO records (
            id, file_name, file_hash, category, region, uploaded_by,
            magnitude, maximum_acceleration, event_time, event_lon, event_lat, depth,
            station_code, station_lon, station_lat, station_elevation, station_elevation_unit,
            record_time, last_update_time, sampling_frequency, sampling_frequency_unit,
            duration, direction, scale_factor, raw_data, raw_data_unit, data_offset
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
            $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27
        )
        ON CONFLICT (id) DO UPDATE SET
            file_name = EXCLUDED.file_name,
            file_hash = EXCLUDED.file_hash,
            category = EXCLUDED.category,
            region = EXCLUDED.region,
            uploaded_by = EXCLUDED.uploaded_by,
            magnitude = EXCLUDED.magnitude,
            maximum_acceleration = EXCLUDED.maximum_acceleration,
            event_time = EXCLUDED.event_time,
            event_lon = EXCLUDED.event_lon,
            event_lat = EXCLUDED.event_lat,
            depth = EXCLUDED.depth,
            station_code = EXCLUDED.station_code,
            station_lon = EXCLUDED.station_lon,
            station_lat = EXCLUDED.station_lat,
            station_elevation = EXCLUDED.station_elevation,
            station_elevation_unit = EXCLUDED.station_elevation_unit,
            record_time = EXCLUDED.record_time,
            last_update_time = EXCLUDED.last_update_time,
            sampling_frequency = EXCLUDED.sampling_frequency,
            sampling_frequency_unit = EXCLUDED.sampling_frequency_unit,
            duration = EXCLUDED.duration,
            direction = EXCLUDED.direction,
            scale_factor = EXCLUDED.scale_factor,
            raw_data = EXCLUDED.raw_data,
            raw_data_unit = EXCLUDED.raw_data_unit,
            data_offset = EXCLUDED.data_offset
        "#,
    )
    .bind(record.id)
    .bind(&record.file_name)
    .bind(&record.file_hash)
    .bind(&record.category)
    .bind(&record.region)
    .bind(&record.uploaded_by)
    .bind(record.magnitude)
    .bind(record.maximum_acceleration)
    .bind(record.event_time)
    .bind(record.event_lon)
    .bind(record.event_lat)
    .bind(record.depth)
    .bind(&record.station_code)
    .bind(record.station_lon)
    .bind(record.station_lat)
    .bind(record.station_elevation)
    .bind(&record.station_elevation_unit)
    .bind(record.record_time)
    .bind(record.last_update_time)
    .bind(record.sampling_frequency)
    .bind(&record.sampling_frequency_unit)
    .bind(record.duration)
    .bind(&record.direction)
    .bind(&record.scale_factor)
    .bind(&record.raw_data)
    .bind(&record.raw_data_unit)
    .bind(record.offset)
    .execute(db)
    .await?;

    Ok(record.id)
}

pub async fn find_one(db: &PgPool, id: Uuid) -> Result<Option<Record>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {RECORD_COLUMNS} FROM records WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(db)
    .await
}

pub async fn find_by_ids(db: &PgPool, ids: &[Uuid]) -> Result<Vec<Record>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {RECORD_COLUMNS} FROM records WHERE id = ANY($1)"
    ))
    .bind(ids)
    .fetch_all(db)
    .await
}

/// Keyset page in id order, for full-table sweeps such as reindexing.
pub async fn page_by_id(
    db: &PgPool,
    after: Option<Uuid>,
    limit: i64,
) -> Result<Vec<Record>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {RECORD_COLUMNS} FROM records WHERE id > $1 ORDER BY id ASC LIMIT $2"
    ))
    .bind(after.unwrap_or(Uuid::nil()))
    .bind(limit.max(1))
    .fetch_all(db)
    .await
}

/// Random sample, the `jackpot` primitive.
pub async fn sample(db: &PgPool, n: i64) -> Result<Vec<Record>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {RECORD_COLUMNS} FROM records ORDER BY random() LIMIT $1"
    ))
    .bind(n.max(1))
    .fetch_all(db)
    .await
}

/// Count with the full filter set. Geospatial caps go through the same
/// haversine predicate as the paged query, so a location-filtered count is
/// the spherical-radius count.
pub async fn count(db: &PgPool, query: &QueryConfig) -> Result<i64, sqlx::Error> {
    let mut builder: QueryBuilder<'_, Postgres> =
        QueryBuilder::new("SELECT COUNT(*) FROM records WHERE TRUE");
    query.apply_store_filters(&mut builder);
    builder.build_query_scalar().fetch_one(db).await
}

/// Sorted metadata page (no sample block), skip/limit pagination.
pub async fn query_metadata(
    db: &PgPool,
    query: &QueryConfig,
    sort_field: &str,
    descending: bool,
) -> Result<Vec<Metadata>, sqlx::Error> {
    let mut builder: QueryBuilder<'_, Postgres> =
        QueryBuilder::new(format!("SELECT {METADATA_COLUMNS} FROM records WHERE TRUE"));
    query.apply_store_filters(&mut builder);

    let order = if descending { "DESC" } else { "ASC" };
    builder.push(format!(" ORDER BY {sort_field} {order} NULLS LAST"));
    builder.push(" OFFSET ");
    builder.push_bind(query.pagination.page_number * query.pagination.page_size);
    builder.push(" LIMIT ");
    builder.push_bind(query.pagination.page_size);

    builder.build_query_as().fetch_all(db).await
}
