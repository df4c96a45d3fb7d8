use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Pacific::Auckland;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::io::{Cursor, Read};
use uuid::Uuid;

use crate::model::{task, Record};
use crate::parse::{basename, parse_direction, split_fixed, wrap_longitude};
use crate::store;
use crate::units;

/// Fixed-to-integer factor: raw samples are stored as
/// `int(FTI · value · float_header[7])` and scaled back by `1/FTI` on read.
pub const FTI: f64 = 100_000.0;

const FIELD_WIDTH: usize = 8;
const SAMPLE_BLOCK_OFFSET: usize = 26;

/// Record timestamps the vendor uses as "unknown".
const SENTINEL_TUPLES: &[[i64; 6]] = &[[1970, 1, 1, 0, 0, -1], [0, 0, 0, 0, 0, 0]];

pub fn validate_file(file_name: &str) -> Result<()> {
    let upper = file_name.to_uppercase();
    if upper.ends_with(".V2A")
        || upper.ends_with(".V1A")
        || upper.ends_with(".V2A.BIN")
        || upper.ends_with(".V1A.BIN")
    {
        return Ok(());
    }
    anyhow::bail!("NZSM archive file should be a V2A/V1A file.");
}

fn is_component_file(name: &str) -> bool {
    let upper = name.to_uppercase();
    upper.ends_with(".V2A") || upper.ends_with(".V1A")
}

enum Entry {
    Skipped,
    Candidate { name: String, text: String },
}

fn decode_tar(bytes: &[u8]) -> Vec<Entry> {
    let mut archive = tar::Archive::new(GzDecoder::new(Cursor::new(bytes)));
    let mut outcomes = Vec::new();

    let entries = match archive.entries() {
        Ok(entries) => entries,
        Err(err) => {
            tracing::error!(error = %err, "Failed to open the archive.");
            return outcomes;
        }
    };

    for entry in entries {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::error!(error = %err, "Failed to read the archive.");
                break;
            }
        };
        let name = entry
            .path()
            .ok()
            .map(|path| path.to_string_lossy().to_string())
            .unwrap_or_default();
        if !is_component_file(&name) {
            outcomes.push(Entry::Skipped);
            continue;
        }
        let mut text = String::new();
        match entry.read_to_string(&mut text) {
            Ok(_) => outcomes.push(Entry::Candidate { name, text }),
            Err(err) => {
                tracing::error!(file_name = %name, error = %err, "Failed to parse.");
                outcomes.push(Entry::Skipped);
            }
        }
    }

    outcomes
}

fn decode_zip(bytes: &[u8]) -> Vec<Entry> {
    let mut archive = match zip::ZipArchive::new(Cursor::new(bytes)) {
        Ok(archive) => archive,
        Err(err) => {
            tracing::error!(error = %err, "Failed to open the archive.");
            return Vec::new();
        }
    };

    let mut outcomes = Vec::new();
    for index in 0..archive.len() {
        let mut file = match archive.by_index(index) {
            Ok(file) => file,
            Err(err) => {
                tracing::error!(error = %err, "Failed to read the archive.");
                outcomes.push(Entry::Skipped);
                continue;
            }
        };
        let name = file.name().to_string();
        if !is_component_file(&name) {
            outcomes.push(Entry::Skipped);
            continue;
        }
        let mut text = String::new();
        match file.read_to_string(&mut text) {
            Ok(_) => outcomes.push(Entry::Candidate { name, text }),
            Err(err) => {
                tracing::error!(file_name = %name, error = %err, "Failed to parse.");
                outcomes.push(Entry::Skipped);
            }
        }
    }
    outcomes
}

/// GeoNet ships either gzip tarballs or zip archives; the name suffix picks
/// the decoder.
pub async fn parse_archive(
    db: &PgPool,
    bytes: &[u8],
    user_id: &str,
    archive_name: &str,
    task_id: Option<Uuid>,
    archive_path: Option<&str>,
    overwrite_existing: bool,
) -> Result<Vec<Record>, sqlx::Error> {
    let outcomes = if archive_name.ends_with(".tar.gz") {
        decode_tar(bytes)
    } else if archive_name.ends_with(".zip") {
        decode_zip(bytes)
    } else {
        tracing::error!(archive_name = %archive_name, "Unsupported archive suffix.");
        Vec::new()
    };

    if let Some(task_id) = task_id {
        task::begin_archive(db, task_id, archive_path, outcomes.len() as i64).await?;
    }

    let mut records = Vec::new();
    for outcome in outcomes {
        if let Some(task_id) = task_id {
            task::bump_progress(db, task_id).await?;
        }
        let Entry::Candidate { name, text } = outcome else {
            continue;
        };
        match parse_file(&text, basename(&name)) {
            Ok(components) => {
                for mut record in components {
                    record.uploaded_by = Some(user_id.to_string());
                    match store::save(db, &mut record, overwrite_existing).await {
                        Ok(_) => records.push(record),
                        Err(err) => {
                            tracing::error!(file_name = %name, error = %err, "Failed to save.")
                        }
                    }
                }
            }
            Err(err) => tracing::error!(file_name = %name, error = %err, "Failed to parse."),
        }
    }

    if let Some(task_id) = task_id {
        task::delete_task(db, task_id).await?;
    }

    Ok(records)
}

/// One stream holds either a single component or three concatenated ones
/// (the two horizontals and the vertical). The block length is derived from
/// the sample counts in the integer header.
pub fn parse_file(text: &str, file_name: &str) -> Result<Vec<Record>> {
    let mut lines: Vec<&str> = text.lines().collect();
    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }
    if lines.len() <= SAMPLE_BLOCK_OFFSET {
        anyhow::bail!("file has no sample block");
    }

    let station_code = lines[1]
        .split_whitespace()
        .nth(1)
        .context("station code not found")?
        .to_string();

    let last_update_time = parse_processed_date(lines[5]);

    let (int_header, _) = parse_header(&lines)?;
    let a_lines = sample_lines(int_header[33]);
    let v_lines = sample_lines(int_header[34]);
    let d_lines = sample_lines(int_header[35]);
    let target_lines = (a_lines + v_lines + d_lines) as usize + SAMPLE_BLOCK_OFFSET;

    let blocks: Vec<&[&str]> = if target_lines == lines.len() {
        vec![&lines[..]]
    } else {
        if 3 * target_lines != lines.len() {
            anyhow::bail!("Number of lines should be a multiple of 3.");
        }
        vec![
            &lines[..target_lines],
            &lines[target_lines..2 * target_lines],
            &lines[2 * target_lines..],
        ]
    };

    let upper_name = basename(file_name).to_uppercase();
    let category = if upper_name.contains(".V2A") {
        "processed"
    } else {
        "unprocessed"
    };

    let mut records = Vec::with_capacity(blocks.len());
    for block in blocks {
        let mut record = parse_lines(block)?;
        record.station_code = Some(station_code.clone());
        record.file_name = Some(upper_name.clone());
        record.category = Some(category.to_string());
        if last_update_time.is_some() {
            record.last_update_time = last_update_time;
        }
        records.push(record);
    }

    Ok(records)
}

/// `... PROCESSED 2011 March 01 ...` on line five carries the correction
/// date, local to New Zealand.
fn parse_processed_date(line: &str) -> Option<DateTime<Utc>> {
    let upper = line.to_uppercase();
    let (_, tail) = upper.split_once("PROCESSED")?;
    let date = NaiveDate::parse_from_str(tail.trim(), "%Y %B %d").ok()?;
    let naive = date.and_hms_opt(0, 0, 0)?;
    Some(
        Auckland
            .from_local_datetime(&naive)
            .earliest()?
            .with_timezone(&Utc),
    )
}

fn sample_lines(count: i64) -> i64 {
    (count + 9) / 10
}

fn parse_header(lines: &[&str]) -> Result<(Vec<i64>, Vec<f64>)> {
    let mut int_header = Vec::with_capacity(40);
    for line in &lines[16..20] {
        for field in split_fixed(line, FIELD_WIDTH) {
            int_header.push(
                field
                    .trim()
                    .parse::<i64>()
                    .with_context(|| format!("bad integer header field: {field:?}"))?,
            );
        }
    }
    let mut float_header = Vec::with_capacity(60);
    for line in &lines[20..26] {
        for field in split_fixed(line, FIELD_WIDTH) {
            float_header.push(
                field
                    .trim()
                    .parse::<f64>()
                    .with_context(|| format!("bad float header field: {field:?}"))?,
            );
        }
    }
    if int_header.len() < 40 || float_header.len() < 36 {
        anyhow::bail!("header block is too short");
    }
    Ok((int_header, float_header))
}

/// First decimal token of the sampling line, the sample interval in seconds.
fn parse_interval(line: &str) -> Result<f64> {
    line.split_whitespace()
        .filter(|token| token.contains('.'))
        .find_map(|token| token.parse::<f64>().ok())
        .context("Sampling frequency/interval not found.")
}

fn header_datetime(tuple: [i64; 6]) -> Result<NaiveDateTime> {
    NaiveDate::from_ymd_opt(tuple[0] as i32, tuple[1] as u32, tuple[2] as u32)
        .and_then(|date| date.and_hms_opt(tuple[3] as u32, tuple[4] as u32, tuple[5] as u32))
        .with_context(|| format!("bad timestamp tuple: {tuple:?}"))
}

/// Decode a single component block following the GeoNet strong-motion file
/// layout: sixteen free-text lines, four integer and six float header lines
/// of eight-character fields, then the acceleration samples, ten per line.
fn parse_lines(lines: &[&str]) -> Result<Record> {
    if lines.len() < SAMPLE_BLOCK_OFFSET {
        anyhow::bail!("component block is too short");
    }
    let file_hash = format!("{:x}", Sha256::digest(lines.join("\n").as_bytes()));
    let (int_header, float_header) = parse_header(lines)?;

    let mut record = Record {
        region: Some("nz".to_string()),
        file_hash: Some(file_hash),
        scale_factor: Some(1.0 / FTI),
        sampling_frequency_unit: Some("Hz".to_string()),
        raw_data_unit: Some("mm/s/s".to_string()),
        ..Record::default()
    };

    record.event_time = Some(
        header_datetime([
            int_header[0],
            int_header[1],
            int_header[2],
            int_header[3],
            int_header[4],
            int_header[5] / 10,
        ])?
        .and_utc(),
    );
    record.event_lon = Some(wrap_longitude(float_header[13]));
    record.event_lat = Some(-float_header[12]);
    record.depth = Some(int_header[16] as f64);
    record.magnitude = Some(if float_header[14] > 0.0 {
        float_header[14]
    } else {
        float_header[16]
    });

    let record_tuple = [
        int_header[8],
        int_header[9],
        int_header[18],
        int_header[19],
        int_header[38],
        int_header[39] / 1000,
    ];
    if !SENTINEL_TUPLES.contains(&record_tuple) {
        record.record_time = Some(header_datetime(record_tuple)?.and_utc());
    }

    record.station_lon = Some(wrap_longitude(float_header[11]));
    record.station_lat = Some(-float_header[10]);
    record.sampling_frequency = Some(1.0 / parse_interval(lines[10])?);
    record.duration = Some(float_header[23]);
    record.direction = Some(parse_direction(
        lines[12]
            .split_whitespace()
            .nth(1)
            .context("direction token not found")?,
    ));
    record.maximum_acceleration = Some(
        (float_header[35] * units::accel_factor("mm/s/s", "Gal")?).abs(),
    );

    let a_lines = sample_lines(int_header[33]) as usize;
    if lines.len() < SAMPLE_BLOCK_OFFSET + a_lines {
        anyhow::bail!("acceleration block is shorter than its declared sample count");
    }
    let mut raw_data = Vec::with_capacity(int_header[33].max(0) as usize);
    for line in &lines[SAMPLE_BLOCK_OFFSET..SAMPLE_BLOCK_OFFSET + a_lines] {
        for field in split_fixed(line, FIELD_WIDTH) {
            let value: f64 = field
                .trim()
                .parse()
                .with_context(|| format!("bad sample field: {field:?}"))?;
            raw_data.push((FTI * value * float_header[7]) as i64);
        }
    }
    record.raw_data = raw_data;

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_line(values: &[f64], width: usize) -> String {
        values
            .iter()
            .map(|value| format!("{value:>width$}"))
            .collect()
    }

    fn fixed_int_line(values: &[i64], width: usize) -> String {
        values
            .iter()
            .map(|value| format!("{value:>width$}"))
            .collect()
    }

    /// A synthetic single-component V2A block with 23 samples.
    pub(crate) fn fixture_block(direction: &str) -> Vec<String> {
        let mut lines = Vec::new();
        lines.push("SITE INFORMATION".to_string());
        lines.push("STATION MQZ CANTERBURY".to_string());
        lines.push("free text".to_string());
        lines.push("free text".to_string());
        lines.push("free text".to_string());
        lines.push("DATA PROCESSED 2011 March 01".to_string());
        lines.push("free text".to_string());
        lines.push("free text".to_string());
        lines.push("free text".to_string());
        lines.push("free text".to_string());
        lines.push("sampling interval 0.020 seconds".to_string());
        lines.push("free text".to_string());
        lines.push(format!("COMP {direction} EPICENTRE"));
        lines.push("free text".to_string());
        lines.push("free text".to_string());
        lines.push("free text".to_string());

        // integer header: 40 fields over four lines
        let mut ints = vec![0i64; 40];
        ints[0] = 2011;
        ints[1] = 2;
        ints[2] = 22;
        ints[3] = 1;
        ints[4] = 50;
        ints[5] = 290; // tenths of a second
        ints[8] = 2011;
        ints[9] = 2;
        ints[16] = 5; // depth km
        ints[18] = 22;
        ints[19] = 1;
        ints[33] = 23; // acceleration samples
        ints[34] = 0;
        ints[35] = 0;
        ints[38] = 50;
        ints[39] = 30_000; // milliseconds
        for chunk in ints.chunks(10) {
            lines.push(fixed_int_line(chunk, 8));
        }

        // float header: 60 fields over six lines
        let mut floats = vec![0.0f64; 60];
        floats[7] = 1.0; // trace scale
        floats[10] = 43.53; // south latitude, sign flipped on read
        floats[11] = 172.68;
        floats[12] = 43.58;
        floats[13] = 172.7;
        floats[14] = 6.3;
        floats[23] = 0.46; // duration
        floats[35] = 1250.0; // PGA mm/s/s
        for chunk in floats.chunks(10) {
            lines.push(fixed_line(chunk, 8));
        }

        // 23 samples over three lines
        let samples: Vec<f64> = (0..23).map(|i| (i as f64 - 11.0) / 100.0).collect();
        for chunk in samples.chunks(10) {
            lines.push(fixed_line(chunk, 8));
        }

        lines
    }

    fn fixture_text(blocks: &[Vec<String>]) -> String {
        blocks
            .iter()
            .flat_map(|block| block.iter().cloned())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn file_names_are_validated() {
        assert!(validate_file("20110222_015029_MQZ.V2A").is_ok());
        assert!(validate_file("20110222_015029_mqz.v1a").is_ok());
        assert!(validate_file("20110222_015029_MQZ.V2A.BIN").is_ok());
        assert!(validate_file("20110222_015029_MQZ.txt").is_err());
    }

    #[test]
    fn single_block_parses() {
        let text = fixture_text(&[fixture_block("N28E")]);
        let records = parse_file(&text, "20110222_015029_MQZ.V2A").unwrap();
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.region.as_deref(), Some("nz"));
        assert_eq!(record.category.as_deref(), Some("processed"));
        assert_eq!(record.station_code.as_deref(), Some("MQZ"));
        assert_eq!(record.direction.as_deref(), Some("N28E"));
        assert_eq!(record.depth, Some(5.0));
        assert_eq!(record.magnitude, Some(6.3));
        assert_eq!(record.sampling_frequency, Some(50.0));
        assert!((record.scale_factor.unwrap() - 1e-5).abs() < 1e-18);
        assert_eq!(record.raw_data_unit.as_deref(), Some("mm/s/s"));
        // PGA converted from mm/s/s into Gal
        assert!((record.maximum_acceleration.unwrap() - 125.0).abs() < 1e-9);
        assert_eq!(record.raw_data.len(), 23);
        // south latitude sign convention
        assert_eq!(record.event_lat, Some(-43.58));
        assert_eq!(record.station_lat, Some(-43.53));
    }

    #[test]
    fn triple_block_yields_three_components() {
        let text = fixture_text(&[
            fixture_block("N28E"),
            fixture_block("S62E"),
            fixture_block("UP"),
        ]);
        let records = parse_file(&text, "20110222_015029_MQZ.V2A").unwrap();
        assert_eq!(records.len(), 3);
        let directions: Vec<_> = records
            .iter()
            .map(|record| record.direction.clone().unwrap())
            .collect();
        assert_eq!(directions, vec!["N28E", "S62E", "UP"]);
        assert!(records
            .iter()
            .all(|record| record.station_code.as_deref() == Some("MQZ")));
        // component hashes differ, so each block stores separately
        assert_ne!(records[0].file_hash, records[1].file_hash);
    }

    #[test]
    fn mangled_block_count_is_rejected() {
        let mut block = fixture_block("N28E");
        let mut extra = fixture_block("S62E");
        extra.pop();
        block.extend(extra);
        let text = fixture_text(&[block]);
        assert!(parse_file(&text, "X.V2A").is_err());
    }

    #[test]
    fn samples_scale_by_fti_and_trace_factor() {
        let text = fixture_text(&[fixture_block("UP")]);
        let records = parse_file(&text, "X.V1A").unwrap();
        let record = &records[0];
        assert_eq!(record.category.as_deref(), Some("unprocessed"));
        // sample value -0.11 scaled by FTI * 1.0 and truncated
        assert_eq!(record.raw_data[0], -11000);
    }

    #[test]
    fn record_time_sentinels_stay_null() {
        let mut block = fixture_block("N28E");
        // rewrite the integer header with the epoch sentinel
        let mut ints = vec![0i64; 40];
        ints[0] = 2011;
        ints[1] = 2;
        ints[2] = 22;
        ints[3] = 1;
        ints[4] = 50;
        ints[5] = 290;
        ints[8] = 1970;
        ints[9] = 1;
        ints[16] = 5;
        ints[18] = 1;
        ints[19] = 0;
        ints[33] = 23;
        ints[38] = 0;
        ints[39] = -1000;
        for (offset, chunk) in ints.chunks(10).enumerate() {
            block[16 + offset] = fixed_int_line(chunk, 8);
        }
        let text = fixture_text(&[block]);
        let records = parse_file(&text, "X.V2A").unwrap();
        assert!(records[0].record_time.is_none());
        assert!(records[0].event_time.is_some());
    }

    #[test]
    fn processed_date_is_auckland_midnight() {
        let parsed = parse_processed_date("DATA PROCESSED 2011 March 01").unwrap();
        // NZDT is UTC+13 at that date
        assert_eq!(parsed.to_rfc3339(), "2011-02-28T11:00:00+00:00");
    }
}
