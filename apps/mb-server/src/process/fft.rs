use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

/// One-sided Fourier amplitude spectrum: `2·|X[k]|/N` over the first
/// `N/2 + 1` bins, with the bin width `fs/N`.
pub fn perform_fft(sampling_frequency: f64, magnitude: &[f64]) -> (f64, Vec<f64>) {
    let n = magnitude.len();
    if n == 0 {
        return (sampling_frequency, Vec::new());
    }

    let mut buffer: Vec<Complex<f64>> = magnitude
        .iter()
        .map(|value| Complex::new(*value, 0.0))
        .collect();
    FftPlanner::new().plan_fft_forward(n).process(&mut buffer);

    let spectrum = buffer
        .iter()
        .take(n / 2 + 1)
        .map(|bin| 2.0 * bin.norm() / n as f64)
        .collect();

    (sampling_frequency / n as f64, spectrum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn pure_sinusoid_concentrates_in_one_bin() {
        let fs = 200.0;
        let n = 2000;
        let f = 10.0;
        let amplitude = 3.5;
        let signal: Vec<f64> = (0..n)
            .map(|i| amplitude * (2.0 * PI * f * i as f64 / fs).sin())
            .collect();

        let (interval, spectrum) = perform_fft(fs, &signal);
        assert!((interval - 0.1).abs() < 1e-12);
        assert_eq!(spectrum.len(), n / 2 + 1);

        let bin = (f / interval).round() as usize;
        assert!((spectrum[bin] - amplitude).abs() < 1e-6);

        let off_peak = spectrum
            .iter()
            .enumerate()
            .filter(|(i, _)| i.abs_diff(bin) > 2)
            .map(|(_, v)| *v)
            .fold(0.0f64, f64::max);
        assert!(off_peak < amplitude * 1e-6);
    }

    #[test]
    fn dc_signal_doubles_in_zero_bin() {
        // the one-sided scaling doubles every bin, DC included
        let signal = vec![1.0; 64];
        let (_, spectrum) = perform_fft(64.0, &signal);
        assert!((spectrum[0] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn empty_input_is_empty() {
        let (_, spectrum) = perform_fft(100.0, &[]);
        assert!(spectrum.is_empty());
    }
}
