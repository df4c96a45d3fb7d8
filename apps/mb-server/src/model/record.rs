use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids;
use crate::process::fft;
use crate::units;

/// Canonical record, one row per channel. Both regions share the table; the
/// `region` discriminant selects the save-time defaults (`jp` recomputes the
/// DC offset, `nz` carries a fixed scale factor set by its parser).
#[derive(Debug, Clone, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct Record {
    pub id: Uuid,
    pub file_name: Option<String>,
    pub file_hash: Option<String>,
    pub category: Option<String>,
    pub region: Option<String>,
    pub uploaded_by: Option<String>,
    pub magnitude: Option<f64>,
    pub maximum_acceleration: Option<f64>,
    pub event_time: Option<DateTime<Utc>>,
    pub event_lon: Option<f64>,
    pub event_lat: Option<f64>,
    pub depth: Option<f64>,
    pub station_code: Option<String>,
    pub station_lon: Option<f64>,
    pub station_lat: Option<f64>,
    pub station_elevation: Option<f64>,
    pub station_elevation_unit: Option<String>,
    pub record_time: Option<DateTime<Utc>>,
    pub last_update_time: Option<DateTime<Utc>>,
    pub sampling_frequency: Option<f64>,
    pub sampling_frequency_unit: Option<String>,
    pub duration: Option<f64>,
    pub direction: Option<String>,
    pub scale_factor: Option<f64>,
    pub raw_data: Vec<i64>,
    pub raw_data_unit: Option<String>,
    #[sqlx(rename = "data_offset")]
    pub offset: f64,
}

/// Store projection without the sample block.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Metadata {
    pub id: Uuid,
    pub file_name: Option<String>,
    pub category: Option<String>,
    pub region: Option<String>,
    pub uploaded_by: Option<String>,
    pub magnitude: Option<f64>,
    pub maximum_acceleration: Option<f64>,
    pub event_time: Option<DateTime<Utc>>,
    pub event_lon: Option<f64>,
    pub event_lat: Option<f64>,
    pub depth: Option<f64>,
    pub station_code: Option<String>,
    pub station_lon: Option<f64>,
    pub station_lat: Option<f64>,
    pub station_elevation: Option<f64>,
    pub station_elevation_unit: Option<String>,
    pub record_time: Option<DateTime<Utc>>,
    pub last_update_time: Option<DateTime<Utc>>,
    pub sampling_frequency: Option<f64>,
    pub sampling_frequency_unit: Option<String>,
    pub duration: Option<f64>,
    pub direction: Option<String>,
    pub scale_factor: Option<f64>,
}

impl Record {
    /// Save-time normalization: the deterministic id, and for NIED traces the
    /// DC offset removed from the fixed-point samples.
    pub fn finalise(&mut self) {
        if self.region.as_deref() == Some("jp") && !self.raw_data.is_empty() {
            let sum: i128 = self.raw_data.iter().map(|v| *v as i128).sum();
            self.offset = -(sum as f64) / self.raw_data.len() as f64;
        }
        if let Some(file_name) = self.file_name.clone() {
            self.id = ids::record_id(
                &file_name,
                self.region.as_deref(),
                self.category.as_deref(),
                self.last_update_time,
                self.direction.as_deref(),
            );
        }
    }

    pub fn event_location(&self) -> Option<[f64; 2]> {
        Some([self.event_lon?, self.event_lat?])
    }

    pub fn station_location(&self) -> Option<[f64; 2]> {
        Some([self.station_lon?, self.station_lat?])
    }

    pub fn sampling_interval(&self) -> Result<f64> {
        let frequency = self
            .sampling_frequency
            .filter(|f| *f > 0.0)
            .context("record has no sampling frequency")?;
        Ok(1.0 / frequency)
    }

    /// Physical waveform: `(raw + offset) · scale_factor` in the requested
    /// unit, or rescaled to `[-1, 1]` when `normalised`.
    pub fn to_waveform(&self, normalised: bool, unit: Option<&str>) -> Result<(f64, Vec<f64>)> {
        let interval = self.sampling_interval()?;

        let mut samples: Vec<f64> = self
            .raw_data
            .iter()
            .map(|v| *v as f64 + self.offset)
            .collect();

        if normalised {
            normalise(&mut samples);
        } else {
            let scale = self.scale_factor.unwrap_or(1.0);
            let conversion = match (self.raw_data_unit.as_deref(), unit) {
                (Some(from), Some(to)) => units::accel_factor(from, to)?,
                _ => 1.0,
            };
            for value in &mut samples {
                *value *= scale * conversion;
            }
        }

        Ok((interval, samples))
    }

    /// One-sided Fourier amplitude of the physical waveform.
    pub fn to_spectrum(&self) -> Result<(f64, Vec<f64>)> {
        let frequency = self
            .sampling_frequency
            .filter(|f| *f > 0.0)
            .context("record has no sampling frequency")?;
        let (_, waveform) = self.to_waveform(false, None)?;
        Ok(fft::perform_fft(frequency, &waveform))
    }
}

/// In-place rescale to `[-1, 1]` by the largest absolute sample.
pub fn normalise(samples: &mut [f64]) {
    let peak = samples.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    if peak > 0.0 {
        for value in samples.iter_mut() {
            *value /= peak;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> Record {
        Record {
            file_name: Some("SZO0039901271027.NS".to_string()),
            region: Some("jp".to_string()),
            category: Some("knt".to_string()),
            direction: Some("NS".to_string()),
            sampling_frequency: Some(100.0),
            scale_factor: Some(2.0),
            raw_data: vec![1, 2, 3, -2, -4],
            raw_data_unit: Some("Gal".to_string()),
            ..Record::default()
        }
    }

    #[test]
    fn finalise_removes_dc_offset_for_nied() {
        let mut record = sample_record();
        record.finalise();
        assert!((record.offset - 0.0).abs() < 1e-12);

        record.raw_data = vec![10, 20, 30];
        record.finalise();
        assert!((record.offset + 20.0).abs() < 1e-12);
    }

    #[test]
    fn finalise_is_idempotent_on_id() {
        let mut record = sample_record();
        record.finalise();
        let first = record.id;
        record.finalise();
        assert_eq!(first, record.id);
    }

    #[test]
    fn waveform_applies_offset_and_scale() {
        let mut record = sample_record();
        record.raw_data = vec![10, 20, 30];
        record.finalise();
        let (interval, waveform) = record.to_waveform(false, Some("cm/s/s")).unwrap();
        assert!((interval - 0.01).abs() < 1e-12);
        // offset -20 then scale 2: [-20, 0, 20]
        assert_eq!(waveform, vec![-20.0, 0.0, 20.0]);
    }

    #[test]
    fn normalised_waveform_peaks_at_unity() {
        let record = sample_record();
        let (_, waveform) = record.to_waveform(true, None).unwrap();
        let peak = waveform.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
        assert!((peak - 1.0).abs() < 1e-12);
    }

    #[test]
    fn waveform_peak_matches_recorded_pga_for_random_traces() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..32 {
            let n = rng.gen_range(16..512);
            let scale = 10f64.powi(rng.gen_range(-6..0));
            let raw: Vec<i64> = (0..n).map(|_| rng.gen_range(-2_000_000..2_000_000)).collect();

            let mut record = Record {
                file_name: Some("random.NS".to_string()),
                region: Some("nz".to_string()),
                sampling_frequency: Some(200.0),
                scale_factor: Some(scale),
                raw_data: raw,
                raw_data_unit: Some("cm/s/s".to_string()),
                ..Record::default()
            };
            let peak_raw = record
                .raw_data
                .iter()
                .map(|v| (*v as f64).abs())
                .fold(0.0f64, f64::max);
            record.maximum_acceleration = Some(peak_raw * scale);

            let (_, waveform) = record.to_waveform(false, Some("cm/s/s")).unwrap();
            let peak = waveform.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
            let expected = record.maximum_acceleration.unwrap();
            assert!(
                (peak - expected).abs() <= expected * 1e-12 + 1e-12,
                "peak {peak} vs recorded {expected}"
            );
        }
    }

    #[test]
    fn unit_conversion_from_mm() {
        let mut record = sample_record();
        record.raw_data = vec![1000];
        record.raw_data_unit = Some("mm/s/s".to_string());
        record.scale_factor = Some(1.0);
        record.region = Some("nz".to_string());
        let (_, waveform) = record.to_waveform(false, Some("Gal")).unwrap();
        assert!((waveform[0] - 100.0).abs() < 1e-9);
    }
}
