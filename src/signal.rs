//! Numeric pipeline for vibration blocks: integration of acceleration into
//! velocity or displacement, and amplitude spectra.
//!
//! Everything in here is pure and stateless; no link is involved and the
//! functions may be called concurrently from any thread.

use std::f64::consts::PI;

use num_complex::Complex;
use rustfft::FftPlanner;

use crate::error::SensorError;

/// Amplitude spectrum as parallel arrays of equal length covering
/// `[0, sampling_freq / 2]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    pub amplitude: Vec<f64>,
    pub frequency: Vec<f64>,
}

/// Applies the probe's conversion coefficient to a raw sample block,
/// yielding acceleration in engineering units.
pub fn raw_to_acceleration(raw: &[i16], coefficient: f32) -> Vec<f64> {
    raw.iter().map(|s| f64::from(*s) * f64::from(coefficient)).collect()
}

fn check_input(data: &[f64], sampling_freq: f64) -> Result<(), SensorError> {
    if data.is_empty() {
        return Err(SensorError::Validation("input block is empty".into()));
    }
    if !(sampling_freq > 0.0) {
        return Err(SensorError::Validation(format!(
            "sampling frequency must be positive, got {}",
            sampling_freq,
        )));
    }
    Ok(())
}

fn check_band(f_min: f64, f_max: f64) -> Result<(), SensorError> {
    if f_min < 0.0 || !(f_max > f_min) {
        return Err(SensorError::Validation(format!(
            "invalid band [{}, {}]",
            f_min, f_max,
        )));
    }
    Ok(())
}

/// Integrates an acceleration block once in the frequency domain, producing
/// velocity. Content outside `[f_min, f_max]` is zeroed, which also removes
/// the DC drift that plain time-domain integration would blow up on.
pub fn acc_to_vel(
    acc: &[f64],
    sampling_freq: f64,
    f_min: f64,
    f_max: f64,
) -> Result<Vec<f64>, SensorError> {
    integrate(acc, sampling_freq, f_min, f_max, 1)
}

/// Integrates twice, producing displacement.
pub fn acc_to_dist(
    acc: &[f64],
    sampling_freq: f64,
    f_min: f64,
    f_max: f64,
) -> Result<Vec<f64>, SensorError> {
    integrate(acc, sampling_freq, f_min, f_max, 2)
}

fn integrate(
    acc: &[f64],
    sampling_freq: f64,
    f_min: f64,
    f_max: f64,
    order: u32,
) -> Result<Vec<f64>, SensorError> {
    check_input(acc, sampling_freq)?;
    check_band(f_min, f_max)?;

    let n = acc.len();
    let mut planner = FftPlanner::new();
    let forward = planner.plan_fft_forward(n);
    let inverse = planner.plan_fft_inverse(n);

    let mut buffer: Vec<Complex<f64>> = acc.iter().map(|&x| Complex::new(x, 0.0)).collect();
    forward.process(&mut buffer);

    let resolution = sampling_freq / n as f64;
    for (k, bin) in buffer.iter_mut().enumerate() {
        // map the upper half of the buffer onto negative frequencies
        let freq = if k <= n / 2 {
            k as f64 * resolution
        } else {
            (k as f64 - n as f64) * resolution
        };
        let magnitude = freq.abs();

        if magnitude < f_min || magnitude > f_max || freq == 0.0 {
            *bin = Complex::new(0.0, 0.0);
        } else {
            // each integration divides by i*omega at the bin frequency
            let omega = Complex::new(0.0, 2.0 * PI * freq);
            *bin /= omega.powu(order);
        }
    }

    inverse.process(&mut buffer);

    // rustfft leaves the inverse unscaled
    let scale = 1.0 / n as f64;
    Ok(buffer.iter().map(|c| c.re * scale).collect())
}

/// Computes a one-sided amplitude spectrum of a time-domain block.
///
/// A Hann window is applied first (amplitudes are compensated for its
/// coherent gain), bins are spaced `sampling_freq / N` apart and the output
/// holds `N/2 + 1` entries.
pub fn fft(data: &[f64], sampling_freq: f64) -> Result<Spectrum, SensorError> {
    check_input(data, sampling_freq)?;

    let n = data.len();
    let mut planner = FftPlanner::new();
    let forward = planner.plan_fft_forward(n);

    // periodic Hann window; its sum is N/2, never zero for N > 1
    let mut window_sum = 0.0;
    let mut buffer: Vec<Complex<f64>> = data
        .iter()
        .enumerate()
        .map(|(i, &x)| {
            let w = if n > 1 {
                0.5 - 0.5 * (2.0 * PI * i as f64 / n as f64).cos()
            } else {
                1.0
            };
            window_sum += w;
            Complex::new(x * w, 0.0)
        })
        .collect();
    forward.process(&mut buffer);

    let n_positive = n / 2 + 1;
    let resolution = sampling_freq / n as f64;
    let frequency: Vec<f64> = (0..n_positive).map(|k| k as f64 * resolution).collect();

    // one-sided scaling: double everything except DC and (for even N) the
    // Nyquist bin, then undo the window's coherent gain
    let amplitude: Vec<f64> = buffer
        .iter()
        .take(n_positive)
        .enumerate()
        .map(|(k, c)| {
            let single = k == 0 || (n % 2 == 0 && k == n / 2);
            let factor = if single { 1.0 } else { 2.0 };
            c.norm() * factor / window_sum
        })
        .collect();

    Ok(Spectrum { amplitude, frequency })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(amplitude: f64, freq: f64, sampling_freq: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| amplitude * (2.0 * PI * freq * i as f64 / sampling_freq).sin())
            .collect()
    }

    #[test]
    fn fft_peaks_at_the_tone() {
        let sampling_freq = 1000.0;
        let n = 1000;
        let signal = sine(2.0, 50.0, sampling_freq, n);

        let spectrum = fft(&signal, sampling_freq).unwrap();
        assert_eq!(spectrum.amplitude.len(), n / 2 + 1);
        assert_eq!(spectrum.frequency.len(), spectrum.amplitude.len());
        assert!((spectrum.frequency[1] - 1.0).abs() < 1e-9);
        assert!((*spectrum.frequency.last().unwrap() - 500.0).abs() < 1e-9);

        let peak = spectrum
            .amplitude
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
            .map(|(k, _)| k)
            .unwrap();
        assert_eq!(peak, 50);
        assert!((spectrum.amplitude[50] - 2.0).abs() < 0.05);

        // the Hann window spreads the tone into the two neighbouring bins;
        // everything further out must be close to zero
        for (k, amp) in spectrum.amplitude.iter().enumerate() {
            if (k as i64 - 50).abs() > 1 {
                assert!(*amp < 0.02, "bin {} has amplitude {}", k, amp);
            }
        }
    }

    #[test]
    fn velocity_differentiates_back_to_acceleration() {
        let sampling_freq = 1000.0;
        let n = 1000;
        let acc = sine(1.0, 50.0, sampling_freq, n);

        let vel = acc_to_vel(&acc, sampling_freq, 10.0, 400.0).unwrap();
        assert_eq!(vel.len(), acc.len());

        // central difference of the velocity must recover the acceleration
        for i in 2..n - 2 {
            let derivative = (vel[i + 1] - vel[i - 1]) * sampling_freq / 2.0;
            assert!(
                (derivative - acc[i]).abs() < 0.05,
                "sample {}: d/dt vel = {}, acc = {}",
                i,
                derivative,
                acc[i],
            );
        }
    }

    #[test]
    fn out_of_band_content_is_suppressed() {
        let sampling_freq = 1000.0;
        let n = 1000;
        // 5 Hz lies below the 10 Hz corner
        let acc = sine(1.0, 5.0, sampling_freq, n);

        let vel = acc_to_vel(&acc, sampling_freq, 10.0, 400.0).unwrap();
        let max = vel.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        assert!(max < 1e-9, "residual amplitude {}", max);
    }

    #[test]
    fn displacement_amplitude_follows_one_over_omega_squared() {
        let sampling_freq = 1000.0;
        let n = 1000;
        let freq = 50.0;
        let acc = sine(1.0, freq, sampling_freq, n);

        let dist = acc_to_dist(&acc, sampling_freq, 10.0, 400.0).unwrap();
        let omega = 2.0 * PI * freq;
        let expected = 1.0 / (omega * omega);
        let max = dist.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        assert!(
            (max - expected).abs() / expected < 0.02,
            "peak {} vs expected {}",
            max,
            expected,
        );
    }

    #[test]
    fn raw_samples_are_scaled() {
        let acc = raw_to_acceleration(&[-2, 0, 4], 0.5);
        assert_eq!(acc, vec![-1.0, 0.0, 2.0]);
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(fft(&[], 1000.0).is_err());
        assert!(acc_to_vel(&[], 1000.0, 10.0, 400.0).is_err());
    }

    #[test]
    fn bad_band_is_rejected() {
        let acc = sine(1.0, 50.0, 1000.0, 64);
        assert!(acc_to_vel(&acc, 1000.0, 400.0, 10.0).is_err());
        assert!(acc_to_vel(&acc, 1000.0, -1.0, 10.0).is_err());
        assert!(acc_to_vel(&acc, 0.0, 10.0, 400.0).is_err());
    }
}
