use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

pub fn connect_lazy(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(8))
        .connect_lazy(database_url)
        .with_context(|| format!("Failed to create lazy database pool for {database_url}"))
}

/// Idempotent schema bootstrap: tables first, then the index set required by
/// the ranked and geospatial queries.
pub async fn ensure_schema(db: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id UUID PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL,
            first_name TEXT NOT NULL DEFAULT '',
            last_name TEXT NOT NULL DEFAULT '',
            hashed_password TEXT NOT NULL,
            can_upload BOOLEAN NOT NULL DEFAULT FALSE,
            can_delete BOOLEAN NOT NULL DEFAULT FALSE,
            disabled BOOLEAN NOT NULL DEFAULT FALSE
        )
        "#,
    )
    .execute(db)
    .await
    .context("failed to create users table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            id UUID PRIMARY KEY,
            file_name TEXT,
            file_hash TEXT,
            category TEXT,
            region TEXT,
            uploaded_by TEXT,
            magnitude DOUBLE PRECISION,
            maximum_acceleration DOUBLE PRECISION,
            event_time TIMESTAMPTZ,
            event_lon DOUBLE PRECISION,
            event_lat DOUBLE PRECISION,
            depth DOUBLE PRECISION,
            station_code TEXT,
            station_lon DOUBLE PRECISION,
            station_lat DOUBLE PRECISION,
            station_elevation DOUBLE PRECISION,
            station_elevation_unit TEXT,
            record_time TIMESTAMPTZ,
            last_update_time TIMESTAMPTZ,
            sampling_frequency DOUBLE PRECISION,
            sampling_frequency_unit TEXT,
            duration DOUBLE PRECISION,
            direction TEXT,
            scale_factor DOUBLE PRECISION,
            raw_data BIGINT[],
            raw_data_unit TEXT,
            data_offset DOUBLE PRECISION NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(db)
    .await
    .context("failed to create records table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS upload_tasks (
            id UUID PRIMARY KEY,
            create_time TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            pid INTEGER NOT NULL DEFAULT 0,
            total_size BIGINT NOT NULL DEFAULT 0,
            current_size BIGINT NOT NULL DEFAULT 0,
            archive_path TEXT
        )
        "#,
    )
    .execute(db)
    .await
    .context("failed to create upload_tasks table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id UUID PRIMARY KEY,
            kind TEXT NOT NULL,
            payload JSONB NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            attempt_count INTEGER NOT NULL DEFAULT 0,
            last_attempt_at TIMESTAMPTZ,
            next_attempt_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            finished_at TIMESTAMPTZ,
            result JSONB,
            message TEXT
        )
        "#,
    )
    .execute(db)
    .await
    .context("failed to create jobs table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workers (
            id UUID PRIMARY KEY,
            pid INTEGER NOT NULL DEFAULT 0,
            hostname TEXT NOT NULL DEFAULT '',
            started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            heartbeat_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(db)
    .await
    .context("failed to create workers table")?;

    for statement in record_index_statements() {
        sqlx::query(statement)
            .execute(db)
            .await
            .with_context(|| format!("failed to create index: {statement}"))?;
    }

    Ok(())
}

fn record_index_statements() -> &'static [&'static str] {
    &[
        "CREATE INDEX IF NOT EXISTS idx_records_file_name ON records (file_name)",
        "CREATE INDEX IF NOT EXISTS idx_records_file_hash ON records (file_hash)",
        "CREATE INDEX IF NOT EXISTS idx_records_category ON records (category)",
        "CREATE INDEX IF NOT EXISTS idx_records_region ON records (region)",
        "CREATE INDEX IF NOT EXISTS idx_records_magnitude ON records (magnitude DESC)",
        "CREATE INDEX IF NOT EXISTS idx_records_pga ON records (maximum_acceleration DESC)",
        "CREATE INDEX IF NOT EXISTS idx_records_event_time ON records (event_time DESC)",
        "CREATE INDEX IF NOT EXISTS idx_records_event_location ON records (event_lon, event_lat)",
        "CREATE INDEX IF NOT EXISTS idx_records_depth ON records (depth)",
        "CREATE INDEX IF NOT EXISTS idx_records_station_code ON records (station_code)",
        "CREATE INDEX IF NOT EXISTS idx_records_station_location ON records (station_lon, station_lat)",
        "CREATE INDEX IF NOT EXISTS idx_records_direction ON records (direction)",
        "CREATE INDEX IF NOT EXISTS idx_records_ranked ON records \
         (magnitude DESC, maximum_acceleration DESC, event_time DESC, direction, event_lon, event_lat)",
        "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (status, next_attempt_at)",
        "CREATE INDEX IF NOT EXISTS idx_workers_heartbeat ON workers (heartbeat_at)",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_statements_cover_ranked_and_geospatial_queries() {
        let statements = record_index_statements();
        assert!(statements.iter().any(|s| s.contains("magnitude DESC")));
        assert!(statements
            .iter()
            .any(|s| s.contains("event_lon, event_lat")));
        assert!(statements
            .iter()
            .any(|s| s.contains("station_lon, station_lat")));
        assert!(statements.iter().all(|s| s.contains("IF NOT EXISTS")));
    }
}
