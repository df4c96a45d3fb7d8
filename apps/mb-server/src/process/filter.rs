use anyhow::{Context, Result};
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::f64::consts::PI;

pub const FILTER_TYPES: &[&str] = &["lowpass", "highpass", "bandpass", "bandstop"];
pub const WINDOW_TYPES: &[&str] = &[
    "flattop",
    "blackmanharris",
    "nuttall",
    "hann",
    "hamming",
    "kaiser",
    "chebwin",
];

const KAISER_BETA: f64 = 9.0;
const CHEBWIN_ATTENUATION_DB: f64 = 80.0;

/// Symmetric window of `taps` coefficients for the given type.
pub fn window(window_type: &str, taps: usize) -> Result<Vec<f64>> {
    match window_type {
        "hann" => Ok(cosine_sum(taps, &[0.5, 0.5])),
        "hamming" => Ok(cosine_sum(taps, &[0.54, 0.46])),
        "blackmanharris" => Ok(cosine_sum(taps, &[0.35875, 0.48829, 0.14128, 0.01168])),
        "nuttall" => Ok(cosine_sum(
            taps,
            &[0.363_581_9, 0.489_177_5, 0.136_599_5, 0.010_641_1],
        )),
        "flattop" => Ok(cosine_sum(
            taps,
            &[
                0.215_578_95,
                0.416_631_58,
                0.277_263_158,
                0.083_578_947,
                0.006_947_368,
            ],
        )),
        "kaiser" => Ok(kaiser(taps, KAISER_BETA)),
        "chebwin" => chebwin(taps, CHEBWIN_ATTENUATION_DB),
        other => anyhow::bail!("Unknown window type: {other}."),
    }
}

/// Generalized cosine-sum window with alternating-sign coefficients.
fn cosine_sum(taps: usize, coefficients: &[f64]) -> Vec<f64> {
    if taps == 1 {
        return vec![1.0];
    }
    let denominator = (taps - 1) as f64;
    (0..taps)
        .map(|n| {
            coefficients
                .iter()
                .enumerate()
                .map(|(k, a)| {
                    let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
                    sign * a * (2.0 * PI * k as f64 * n as f64 / denominator).cos()
                })
                .sum()
        })
        .collect()
}

/// Zeroth-order modified Bessel function of the first kind, by its power
/// series. Converges quickly for the beta range used here.
fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut term = 1.0;
    let half_x = x / 2.0;
    for k in 1..64 {
        term *= (half_x / k as f64) * (half_x / k as f64);
        sum += term;
        if term < sum * 1e-18 {
            break;
        }
    }
    sum
}

fn kaiser(taps: usize, beta: f64) -> Vec<f64> {
    if taps == 1 {
        return vec![1.0];
    }
    let alpha = (taps - 1) as f64 / 2.0;
    let denominator = bessel_i0(beta);
    (0..taps)
        .map(|n| {
            let ratio = (n as f64 - alpha) / alpha;
            bessel_i0(beta * (1.0 - ratio * ratio).max(0.0).sqrt()) / denominator
        })
        .collect()
}

/// Chebyshev polynomial of order `order` evaluated outside and inside the
/// unit interval.
fn chebyshev(order: f64, x: f64) -> f64 {
    if x.abs() <= 1.0 {
        (order * x.acos()).cos()
    } else if x > 1.0 {
        (order * x.acosh()).cosh()
    } else {
        let sign = if (order as i64) % 2 == 0 { 1.0 } else { -1.0 };
        sign * (order * (-x).acosh()).cosh()
    }
}

/// Dolph-Chebyshev window with equiripple sidelobes at the given
/// attenuation, synthesized in the frequency domain. The FIR tap count here
/// is always odd.
fn chebwin(taps: usize, attenuation_db: f64) -> Result<Vec<f64>> {
    if taps == 1 {
        return Ok(vec![1.0]);
    }
    if taps % 2 == 0 {
        anyhow::bail!("chebwin synthesis expects an odd tap count");
    }

    let order = (taps - 1) as f64;
    let ripple = 10f64.powf(attenuation_db / 20.0);
    let beta = (ripple.acosh() / order).cosh();

    let mut samples: Vec<Complex<f64>> = (0..taps)
        .map(|k| {
            let x = beta * (PI * k as f64 / taps as f64).cos();
            Complex::new(chebyshev(order, x), 0.0)
        })
        .collect();
    FftPlanner::new()
        .plan_fft_forward(taps)
        .process(&mut samples);

    let half = (taps + 1) / 2;
    let mut window: Vec<f64> = Vec::with_capacity(taps);
    for k in (1..half).rev() {
        window.push(samples[k].re);
    }
    for k in 0..half {
        window.push(samples[k].re);
    }

    let peak = window
        .iter()
        .fold(0.0f64, |acc, value| acc.max(value.abs()));
    let peak = if peak > 0.0 { peak } else { 1.0 };
    for value in &mut window {
        *value /= peak;
    }
    Ok(window)
}

fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

/// Windowed-sinc FIR synthesis. Cutoffs are normalized to the Nyquist
/// frequency; the response is scaled to unity at the center of the first
/// passband. `scale` multiplies every tap, folding in the zero-stuffing
/// gain compensation.
pub fn firwin(
    filter_type: &str,
    window_type: &str,
    taps: usize,
    cutoff: &[f64],
    scale: f64,
) -> Result<Vec<f64>> {
    if taps == 0 {
        anyhow::bail!("filter needs at least one tap");
    }
    for value in cutoff {
        if !(0.0 < *value && *value < 1.0) {
            anyhow::bail!("cutoff frequencies must lie strictly within (0, 1)");
        }
    }

    let pass_zero = match filter_type {
        "lowpass" | "bandstop" => true,
        "highpass" | "bandpass" => false,
        other => anyhow::bail!("Unknown filter type: {other}."),
    };
    let pass_nyquist = (cutoff.len() % 2 == 1) ^ pass_zero;

    let mut edges: Vec<f64> = Vec::with_capacity(cutoff.len() + 2);
    if pass_zero {
        edges.push(0.0);
    }
    edges.extend_from_slice(cutoff);
    if pass_nyquist {
        edges.push(1.0);
    }
    if edges.len() % 2 != 0 {
        anyhow::bail!("cutoff list does not form complete bands");
    }

    let alpha = (taps - 1) as f64 / 2.0;
    let mut coefficients = vec![0.0f64; taps];
    for band in edges.chunks(2) {
        let (left, right) = (band[0], band[1]);
        for (n, tap) in coefficients.iter_mut().enumerate() {
            let m = n as f64 - alpha;
            *tap += right * sinc(right * m) - left * sinc(left * m);
        }
    }

    let shape = window(window_type, taps)?;
    for (tap, w) in coefficients.iter_mut().zip(&shape) {
        *tap *= w;
    }

    let scale_frequency = {
        let (left, right) = (edges[0], edges[1]);
        if left == 0.0 {
            0.0
        } else if right == 1.0 {
            1.0
        } else {
            0.5 * (left + right)
        }
    };
    let gain: f64 = coefficients
        .iter()
        .enumerate()
        .map(|(n, tap)| tap * (PI * (n as f64 - alpha) * scale_frequency).cos())
        .sum();
    let gain = if gain.abs() > f64::EPSILON { gain } else { 1.0 };

    for tap in &mut coefficients {
        *tap = *tap / gain * scale;
    }
    Ok(coefficients)
}

/// Insert `ratio - 1` zeros between consecutive samples; identity at one.
pub fn zero_stuff(ratio: usize, waveform: &[f64]) -> Vec<f64> {
    if ratio <= 1 {
        return waveform.to_vec();
    }
    let mut output = vec![0.0; waveform.len() * ratio];
    for (index, value) in waveform.iter().enumerate() {
        output[index * ratio] = *value;
    }
    output
}

/// Same-length convolution, centered like `numpy.convolve(…, mode="same")`.
pub fn apply_filter(kernel: &[f64], waveform: &[f64]) -> Vec<f64> {
    let n = waveform.len();
    let m = kernel.len();
    if n == 0 || m == 0 {
        return vec![0.0; n];
    }
    let offset = (m - 1) / 2;
    let mut output = vec![0.0f64; n];
    for (i, slot) in output.iter_mut().enumerate() {
        let shifted = i + offset;
        let k_low = shifted.saturating_sub(n - 1);
        let k_high = (m - 1).min(shifted);
        let mut acc = 0.0;
        for k in k_low..=k_high {
            acc += kernel[k] * waveform[shifted - k];
        }
        *slot = acc;
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frequency_response(taps: &[f64], normalized_frequency: f64) -> f64 {
        // magnitude of the DTFT at f (Nyquist-normalized)
        let omega = PI * normalized_frequency;
        let (mut re, mut im) = (0.0, 0.0);
        for (n, tap) in taps.iter().enumerate() {
            re += tap * (omega * n as f64).cos();
            im -= tap * (omega * n as f64).sin();
        }
        (re * re + im * im).sqrt()
    }

    #[test]
    fn windows_are_symmetric_and_unit_peak() {
        for window_type in WINDOW_TYPES {
            let w = window(window_type, 65).unwrap();
            assert_eq!(w.len(), 65);
            let peak = w.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
            assert!(
                (peak - 1.0).abs() < 1e-6,
                "window {window_type} peak {peak}"
            );
            for i in 0..w.len() {
                assert!(
                    (w[i] - w[w.len() - 1 - i]).abs() < 1e-9,
                    "window {window_type} asymmetric at {i}"
                );
            }
        }
    }

    #[test]
    fn unknown_types_are_rejected_with_vendor_wording() {
        assert!(window("tukey", 65).is_err());
        assert!(firwin("notch", "hann", 65, &[0.5], 1.0).is_err());
    }

    #[test]
    fn lowpass_passes_dc_and_rejects_high_frequencies() {
        let taps = firwin("lowpass", "nuttall", 65, &[0.25], 1.0).unwrap();
        assert!((frequency_response(&taps, 0.0) - 1.0).abs() < 1e-6);
        assert!(frequency_response(&taps, 0.8) < 1e-3);
    }

    #[test]
    fn highpass_rejects_dc() {
        let taps = firwin("highpass", "hann", 65, &[0.5], 1.0).unwrap();
        assert!(frequency_response(&taps, 0.0) < 1e-6);
        assert!((frequency_response(&taps, 1.0) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn bandpass_attenuates_both_stopbands() {
        // 5..25 Hz passband on a 200 Hz upsampled trace: normalized [0.05, 0.25]
        let taps = firwin("bandpass", "nuttall", 65, &[0.05, 0.25], 1.0).unwrap();
        let passband = frequency_response(&taps, 0.15);
        let low_stop = frequency_response(&taps, 0.01);
        let high_stop = frequency_response(&taps, 0.8);
        assert!((passband - 1.0).abs() < 0.05);
        // >= 40 dB attenuation relative to the passband
        assert!(20.0 * (low_stop / passband).log10() < -40.0);
        assert!(20.0 * (high_stop / passband).log10() < -40.0);
    }

    #[test]
    fn bandstop_notches_the_middle() {
        let taps = firwin("bandstop", "hamming", 65, &[0.3, 0.5], 1.0).unwrap();
        assert!((frequency_response(&taps, 0.0) - 1.0).abs() < 0.05);
        assert!(frequency_response(&taps, 0.4) < 0.05);
    }

    #[test]
    fn zero_stuffing_preserves_samples_on_stride() {
        let stuffed = zero_stuff(3, &[1.0, 2.0, 3.0]);
        assert_eq!(stuffed, vec![1.0, 0.0, 0.0, 2.0, 0.0, 0.0, 3.0, 0.0, 0.0]);
        assert_eq!(zero_stuff(1, &[1.0, 2.0]), vec![1.0, 2.0]);
    }

    #[test]
    fn same_mode_convolution_matches_numpy_shape() {
        let out = apply_filter(&[1.0, 2.0, 3.0], &[0.0, 1.0, 0.0, 0.0]);
        // numpy.convolve([0,1,0,0], [1,2,3], mode="same") == [1, 2, 3, 0]
        assert_eq!(out, vec![1.0, 2.0, 3.0, 0.0]);
    }

    #[test]
    fn identity_kernel_is_identity() {
        let signal = vec![0.5, -1.5, 2.5, 0.0, 3.0];
        assert_eq!(apply_filter(&[1.0], &signal), signal);
    }

    #[test]
    fn bessel_matches_known_values() {
        assert!((bessel_i0(0.0) - 1.0).abs() < 1e-15);
        // I0(1) = 1.2660658777520084
        assert!((bessel_i0(1.0) - 1.266_065_877_752_008_4).abs() < 1e-12);
        // I0(9) = 1093.588354511375
        assert!((bessel_i0(9.0) - 1093.588_354_511_375).abs() < 1e-6);
    }
}
