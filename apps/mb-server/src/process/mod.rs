pub mod fft;
pub mod filter;
pub mod response_spectrum;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::model::Record;

/// Processing request. The effective resampling ratio is
/// `up_ratio / down_ratio`; downsampling is expressed through the cutoff
/// choice, only the zero-stuffing side changes the sample grid here.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ProcessConfig {
    #[serde(default = "default_ratio")]
    pub up_ratio: u32,
    #[serde(default = "default_ratio")]
    pub down_ratio: u32,
    #[serde(default = "default_filter_length")]
    pub filter_length: u32,
    #[serde(default = "default_filter_type")]
    pub filter_type: String,
    #[serde(default = "default_window_type")]
    pub window_type: String,
    #[serde(default = "default_low_cut")]
    pub low_cut: f64,
    #[serde(default = "default_high_cut")]
    pub high_cut: f64,
    #[serde(default = "default_damping_ratio")]
    pub damping_ratio: f64,
    #[serde(default = "default_period_end")]
    pub period_end: f64,
    #[serde(default = "default_period_step")]
    pub period_step: f64,
    #[serde(default)]
    pub normalised: bool,
    #[serde(default)]
    pub with_filter: bool,
    #[serde(default)]
    pub with_spectrum: bool,
    #[serde(default)]
    pub with_response_spectrum: bool,
    #[serde(default)]
    pub remove_head: f64,
}

fn default_ratio() -> u32 {
    1
}
fn default_filter_length() -> u32 {
    32
}
fn default_filter_type() -> String {
    "bandpass".to_string()
}
fn default_window_type() -> String {
    "nuttall".to_string()
}
fn default_low_cut() -> f64 {
    0.01
}
fn default_high_cut() -> f64 {
    50.0
}
fn default_damping_ratio() -> f64 {
    0.05
}
fn default_period_end() -> f64 {
    10.0
}
fn default_period_step() -> f64 {
    0.01
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            up_ratio: 1,
            down_ratio: 1,
            filter_length: 32,
            filter_type: default_filter_type(),
            window_type: default_window_type(),
            low_cut: default_low_cut(),
            high_cut: default_high_cut(),
            damping_ratio: default_damping_ratio(),
            period_end: default_period_end(),
            period_step: default_period_step(),
            normalised: false,
            with_filter: false,
            with_spectrum: false,
            with_response_spectrum: false,
            remove_head: 0.0,
        }
    }
}

impl ProcessConfig {
    /// Whether the request is cheap enough to stay on the event loop side.
    pub fn is_light(&self) -> bool {
        !self.with_filter && !self.with_response_spectrum
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.up_ratio < 1 || self.down_ratio < 1 {
            return Err(AppError::bad_request("Resampling ratios must be positive."));
        }
        if self.filter_length < 8 {
            return Err(AppError::bad_request(
                "Filter window length should be at least eight.",
            ));
        }
        if !filter::FILTER_TYPES.contains(&self.filter_type.as_str()) {
            return Err(AppError::bad_request(
                "Filter type should be one of bandpass, bandstop, lowpass and highpass.",
            ));
        }
        if !filter::WINDOW_TYPES.contains(&self.window_type.as_str()) {
            return Err(AppError::bad_request(format!(
                "Unknown window type: {}.",
                self.window_type
            )));
        }
        if self.low_cut <= 0.0 || self.high_cut <= 0.0 {
            return Err(AppError::bad_request("Cutoff frequencies must be positive."));
        }
        if self.low_cut >= self.high_cut {
            return Err(AppError::bad_request(
                "Low cut frequency should be smaller than high cut frequency.",
            ));
        }
        if !(0.0..=1.0).contains(&self.damping_ratio) {
            return Err(AppError::bad_request("Damping ratio must be within [0, 1]."));
        }
        if self.period_end < 0.0 || self.period_step < 0.0 {
            return Err(AppError::bad_request("Period bracket must be non-negative."));
        }
        if self.remove_head < 0.0 {
            return Err(AppError::bad_request("remove_head must be non-negative."));
        }
        Ok(())
    }
}

/// The processed stages of one record; metadata is merged back in by the
/// HTTP layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessedWaveform {
    pub processed_data_unit: Option<String>,
    pub time_interval: f64,
    pub waveform: Vec<f64>,
    pub frequency_interval: Option<f64>,
    pub spectrum: Option<Vec<f64>>,
    pub period: Option<Vec<f64>>,
    pub displacement_spectrum: Option<Vec<f64>>,
    pub velocity_spectrum: Option<Vec<f64>>,
    pub acceleration_spectrum: Option<Vec<f64>>,
}

/// Run the processing pipeline over one record. Signal processing never
/// suspends; heavy requests are kept off the event loop by the dispatcher.
pub fn process_record(
    record: &Record,
    config: &ProcessConfig,
) -> anyhow::Result<ProcessedWaveform> {
    let (interval, mut waveform) = record.to_waveform(config.normalised, Some("cm/s/s"))?;

    if config.remove_head > 0.0 {
        let drop = (config.remove_head / interval).round() as usize;
        if drop < waveform.len() {
            waveform.drain(..drop);
        } else {
            waveform.clear();
        }
    }

    let (new_interval, new_waveform) = if config.with_filter {
        let up_ratio = config.up_ratio as usize;
        let new_interval = interval / up_ratio as f64;

        let eps = f32::EPSILON as f64;
        let f0 = (2.0 * config.low_cut * new_interval).clamp(eps, 1.0 - eps);
        let f1 = (2.0 * config.high_cut * new_interval).clamp(f0 + eps, 1.0 - eps);
        let cutoff: Vec<f64> = match config.filter_type.as_str() {
            "lowpass" => vec![f1],
            "highpass" => vec![f0],
            _ => vec![f0, f1],
        };

        let taps = filter::firwin(
            &config.filter_type,
            &config.window_type,
            2 * config.filter_length as usize + 1,
            &cutoff,
            up_ratio as f64,
        )?;
        let stuffed = filter::zero_stuff(up_ratio, &waveform);
        (new_interval, filter::apply_filter(&taps, &stuffed))
    } else {
        (interval, waveform)
    };

    let mut processed = ProcessedWaveform {
        processed_data_unit: Some(if config.normalised {
            "1".to_string()
        } else {
            "cm/s/s".to_string()
        }),
        time_interval: new_interval,
        waveform: new_waveform,
        ..ProcessedWaveform::default()
    };

    if config.with_spectrum {
        let (frequency_interval, spectrum) =
            fft::perform_fft(1.0 / new_interval, &processed.waveform);
        processed.frequency_interval = Some(frequency_interval);
        processed.spectrum = Some(spectrum);
    }

    if config.with_response_spectrum {
        let period = response_spectrum::period_bracket(config.period_end, config.period_step);
        let spectrum = response_spectrum::response_spectrum(
            config.damping_ratio,
            new_interval,
            &processed.waveform,
            &period,
        );
        processed.displacement_spectrum = Some(spectrum.iter().map(|row| row[0]).collect());
        processed.velocity_spectrum = Some(spectrum.iter().map(|row| row[1]).collect());
        processed.acceleration_spectrum = Some(spectrum.iter().map(|row| row[2]).collect());
        processed.period = Some(period);
    }

    Ok(processed)
}
