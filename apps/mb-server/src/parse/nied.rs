use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Asia::Tokyo;
use chrono_tz::Tz;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::io::{Cursor, Read};
use uuid::Uuid;

use crate::model::{task, Record};
use crate::parse::{
    basename, normalise_unit, parse_direction, parse_value, strip_unit, wrap_longitude,
};
use crate::store;
use crate::units;

/// Vendor channel suffixes carrying sample data. Anything else in the
/// archive (plots, station tables) is skipped.
const CHANNEL_SUFFIXES: &[&str] = &["EW1", "EW2", "NS1", "NS2", "UD1", "UD2", "EW", "NS", "UD"];

const HEADER_LINES: usize = 17;
const VALUE_OFFSET: usize = 18;

/// K-NET/KiK-net archives are gzip tarballs whose name carries the category.
pub fn validate_archive(archive_name: &str) -> Result<String> {
    if !archive_name.ends_with(".tar.gz") {
        anyhow::bail!("NIED archive file should be a .tar.gz file.");
    }
    if archive_name.contains("knt") {
        Ok("knt".to_string())
    } else if archive_name.contains("kik") {
        Ok("kik".to_string())
    } else {
        anyhow::bail!("NIED archive file name should contain knt or kik.");
    }
}

enum Entry {
    Skipped,
    Candidate { name: String, text: String },
}

/// Walk the tarball once, decoding data members. A truncated archive keeps
/// whatever was readable before the failure.
fn decode_archive(bytes: &[u8]) -> Vec<Entry> {
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

        if !entry.header().entry_type().is_file()
            || name.ends_with(".ps.gz")
            || !CHANNEL_SUFFIXES
                .iter()
                .any(|suffix| name.ends_with(suffix))
        {
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

/// Parse every data member of the archive, saving records as the walk
/// progresses and keeping the upload task's progress current. Per-entry
/// failures are logged and do not abort the archive.
pub async fn parse_archive(
    db: &PgPool,
    bytes: &[u8],
    user_id: &str,
    archive_name: &str,
    task_id: Option<Uuid>,
    archive_path: Option<&str>,
    overwrite_existing: bool,
) -> Result<Vec<Record>, sqlx::Error> {
    let category = if archive_name.contains("knt") {
        "knt"
    } else {
        "kik"
    };

    let outcomes = decode_archive(bytes);
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
        match parse_file(&text) {
            Ok(mut record) => {
                record.uploaded_by = Some(user_id.to_string());
                record.file_name = Some(basename(&name).to_string());
                record.category = Some(category.to_string());
                match store::save(db, &mut record, overwrite_existing).await {
                    Ok(_) => records.push(record),
                    Err(err) => {
                        tracing::error!(file_name = %name, error = %err, "Failed to save.")
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

fn local_datetime(text: &str, zone: Tz) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(text.trim(), "%Y/%m/%d %H:%M:%S")
        .with_context(|| format!("bad timestamp: {text}"))?;
    let local = zone
        .from_local_datetime(&naive)
        .earliest()
        .with_context(|| format!("unrepresentable local time: {text}"))?;
    Ok(local.with_timezone(&Utc))
}

/// Decode one vendor text file: seventeen labeled header lines, then
/// whitespace-separated fixed-point samples to EOF. Timestamps are Tokyo
/// local time.
pub fn parse_file(text: &str) -> Result<Record> {
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    if lines.len() <= HEADER_LINES {
        anyhow::bail!("file has no sample block");
    }

    let file_hash = format!("{:x}", Sha256::digest(lines.concat().as_bytes()));
    let value = |index: usize| lines[index].get(VALUE_OFFSET..).unwrap_or("").trim();

    let mut record = Record {
        region: Some("jp".to_string()),
        file_hash: Some(file_hash),
        ..Record::default()
    };

    record.event_time = Some(local_datetime(value(0), Tokyo)?);
    record.event_lon = Some(wrap_longitude(value(2).parse()?));
    record.event_lat = Some(value(1).parse()?);
    record.depth = Some(units::to_kilometres(
        value(3).parse()?,
        &normalise_unit(lines[3])?,
    )?);
    record.magnitude = Some(value(4).parse()?);
    record.station_code = Some(value(5).to_string());
    record.station_lon = Some(wrap_longitude(value(7).parse()?));
    record.station_lat = Some(value(6).parse()?);
    record.station_elevation = Some(value(8).parse()?);
    record.station_elevation_unit = Some(normalise_unit(lines[8])?);
    record.record_time = Some(local_datetime(value(9), Tokyo)?);
    record.sampling_frequency = Some(parse_value(value(10))?.parse()?);
    record.sampling_frequency_unit = Some(normalise_unit(lines[10])?);
    record.duration = Some(units::to_seconds(
        value(11).parse()?,
        &normalise_unit(lines[11])?,
    )?);
    record.direction = Some(parse_direction(value(12)));
    record.scale_factor = Some(strip_unit(value(13))?);
    record.maximum_acceleration = Some(value(14).parse::<f64>()?.abs());
    record.raw_data_unit = Some(normalise_unit(lines[14])?);
    record.last_update_time = Some(local_datetime(value(15), Tokyo)?);

    let mut raw_data = Vec::new();
    for line in &lines[HEADER_LINES..] {
        for token in line.split_whitespace() {
            raw_data.push(token.parse::<i64>()?);
        }
    }
    record.raw_data = raw_data;

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    pub(crate) fn fixture() -> String {
        let header = [
            ("Origin Time", "1999/01/27 10:24:00"),
            ("Lat.", "34.925"),
            ("Long.", "139.237"),
            ("Depth. (km)", "59"),
            ("Mag.", "4.9"),
            ("Station Code", "SZO003"),
            ("Station Lat.", "34.9617"),
            ("Station Long.", "138.9248"),
            ("Station Height(m)", "550"),
            ("Record Time", "1999/01/27 10:25:12"),
            ("Sampling Freq(Hz)", "100Hz"),
            ("Duration Time(s)", "41"),
            ("Dir.", "N-S"),
            ("Scale Factor", "2000(gal)/8223790"),
            ("Max. Acc. (gal)", "6.8"),
            ("Last Correction", "1999/01/27 10:25:12"),
            ("Memo.", ""),
        ];
        let mut text = String::new();
        for (key, value) in header {
            text.push_str(&format!("{key:<18}{value}\n"));
        }
        text.push_str("   100    200   -300\n   400   -500    600\n");
        text
    }

    #[test]
    fn archive_names_are_validated() {
        assert_eq!(validate_archive("jp_test.knt.tar.gz").unwrap(), "knt");
        assert_eq!(validate_archive("20230101.kik.tar.gz").unwrap(), "kik");
        assert!(validate_archive("jp_test.knt.zip").is_err());
        assert!(validate_archive("archive.tar.gz").is_err());
    }

    #[test]
    fn header_fields_decode() {
        let record = parse_file(&fixture()).unwrap();
        assert_eq!(record.region.as_deref(), Some("jp"));
        assert_eq!(record.station_code.as_deref(), Some("SZO003"));
        assert_eq!(record.direction.as_deref(), Some("NS"));
        assert_eq!(record.depth, Some(59.0));
        assert_eq!(record.magnitude, Some(4.9));
        assert_eq!(record.sampling_frequency, Some(100.0));
        assert_eq!(record.duration, Some(41.0));
        assert_eq!(record.maximum_acceleration, Some(6.8));
        assert_eq!(record.raw_data_unit.as_deref(), Some("Gal"));
        assert!((record.scale_factor.unwrap() - 2000.0 / 8223790.0).abs() < 1e-12);
        assert_eq!(record.raw_data, vec![100, 200, -300, 400, -500, 600]);
    }

    #[test]
    fn timestamps_are_tokyo_local() {
        let record = parse_file(&fixture()).unwrap();
        // 10:24 JST is 01:24 UTC
        assert_eq!(
            record.event_time.unwrap().to_rfc3339(),
            "1999-01-27T01:24:00+00:00"
        );
    }

    #[test]
    fn truncated_header_is_rejected() {
        let text = fixture()
            .lines()
            .take(10)
            .collect::<Vec<_>>()
            .join("\n");
        assert!(parse_file(&text).is_err());
    }

    #[test]
    fn reparsing_yields_the_same_identity() {
        let make = || {
            let mut record = parse_file(&fixture()).unwrap();
            record.file_name = Some("SZO0039901271027.NS".to_string());
            record.category = Some("knt".to_string());
            record.finalise();
            record
        };
        let first = make();
        let second = make();
        assert_eq!(first.id, second.id);
        assert_eq!(first.file_hash, second.file_hash);
        // NIED offset removes the mean of the samples
        let mean: f64 = first.raw_data.iter().map(|v| *v as f64).sum::<f64>()
            / first.raw_data.len() as f64;
        assert!((first.offset + mean).abs() < 1e-9);
    }

    #[test]
    fn hash_is_stable_across_line_endings() {
        let unix = parse_file(&fixture()).unwrap();
        let dos = parse_file(&fixture().replace('\n', "\r\n")).unwrap();
        assert_eq!(unix.file_hash, dos.file_hash);
    }

    fn gz_tar(members: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (name, content) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, content.as_bytes()).unwrap();
        }
        let mut encoder = builder.into_inner().unwrap();
        encoder.flush().unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn archive_walk_skips_plots_and_foreign_suffixes() {
        let text = fixture();
        let bytes = gz_tar(&[
            ("SZO0039901271027.NS", text.as_str()),
            ("SZO0039901271027.ps.gz", "binary plot"),
            ("readme.txt", "not a channel"),
            ("SZO0039901271027.EW", text.as_str()),
        ]);
        let outcomes = decode_archive(&bytes);
        assert_eq!(outcomes.len(), 4);
        let candidates: Vec<&str> = outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                Entry::Candidate { name, .. } => Some(name.as_str()),
                Entry::Skipped => None,
            })
            .collect();
        assert_eq!(candidates, vec!["SZO0039901271027.NS", "SZO0039901271027.EW"]);
    }

    #[test]
    fn corrupt_archive_decodes_to_nothing() {
        assert!(decode_archive(b"not a tarball").is_empty());
    }
}
