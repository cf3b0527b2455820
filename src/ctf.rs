//! 1-D contrast transfer function model.
//!
//! Follows the convention of `tom_ctf1d` (Tegunov's `tom_deconv`): the curve
//! is sampled on `n` evenly spaced spatial frequencies covering
//! `[0, Nyquist)`, and the defocus argument is negative for underfocus.

use ndarray::Array1;

/// Acceleration voltage of the assumed microscope (V).
pub const VOLTAGE_V: f64 = 300e3;
/// Spherical aberration of the assumed microscope (m).
pub const SPHERICAL_ABERRATION_M: f64 = 2.7e-3;
/// Amplitude contrast fraction of the assumed microscope.
pub const AMPLITUDE_CONTRAST: f64 = 0.07;

/// Relativistic electron wavelength in meters for a given acceleration
/// voltage in volts.
pub fn electron_wavelength(voltage_v: f64) -> f64 {
    12.2643247e-10 / (voltage_v * (1.0 + voltage_v * 0.978466e-6)).sqrt()
}

/// Evaluates the 1-D CTF on `n` frequency samples spanning `[0, Nyquist)`.
///
/// # Arguments
/// - `n`: Number of frequency samples.
/// - `pixel_size_m`: Pixel size in meters.
/// - `voltage_v`: Acceleration voltage in volts.
/// - `cs_m`: Spherical aberration in meters.
/// - `defocus_m`: Defocus in meters, negative for underfocus.
/// - `amplitude_contrast`: Amplitude contrast fraction in `[0, 1]`.
/// - `phase_shift_rad`: Additional phase shift (phase plate) in radians.
/// - `bfactor`: B-factor envelope in m²; `0.0` disables the envelope.
///
/// # Returns
/// The real-valued CTF curve. At zero frequency the value is exactly the
/// amplitude contrast.
#[allow(clippy::too_many_arguments)]
pub fn ctf_1d(
    n: usize,
    pixel_size_m: f64,
    voltage_v: f64,
    cs_m: f64,
    defocus_m: f64,
    amplitude_contrast: f64,
    phase_shift_rad: f64,
    bfactor: f64,
) -> Array1<f64> {
    let nyquist = 1.0 / (2.0 * pixel_size_m);
    let lambda = electron_wavelength(voltage_v);
    let phase_contrast = (1.0 - amplitude_contrast * amplitude_contrast).sqrt();

    Array1::from_shape_fn(n, |i| {
        let k = i as f64 / n as f64 * nyquist;
        let k2 = k * k;
        let chi = std::f64::consts::PI
            * (cs_m * lambda.powi(3) * k2 * k2 / 2.0 + lambda * defocus_m * k2)
            - phase_shift_rad;
        let envelope = (-bfactor * k2 * 0.25).exp();
        (-phase_contrast * chi.sin() + amplitude_contrast * chi.cos()) * envelope
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_wavelength_at_300kv() {
        // ~1.97 pm at 300 kV.
        let lambda = electron_wavelength(300e3);
        assert_relative_eq!(lambda, 1.9687e-12, max_relative = 1e-3);
    }

    #[test]
    fn test_ctf_zero_frequency_is_amplitude_contrast() {
        let ctf = ctf_1d(
            128,
            1e-10,
            VOLTAGE_V,
            SPHERICAL_ABERRATION_M,
            -3e-6,
            AMPLITUDE_CONTRAST,
            0.0,
            0.0,
        );
        assert_relative_eq!(ctf[0], AMPLITUDE_CONTRAST, epsilon = 1e-12);
    }

    #[test]
    fn test_ctf_is_bounded_and_oscillates() {
        let ctf = ctf_1d(
            2048,
            1e-10,
            VOLTAGE_V,
            SPHERICAL_ABERRATION_M,
            -3e-6,
            AMPLITUDE_CONTRAST,
            0.0,
            0.0,
        );
        for v in ctf.iter() {
            assert!(v.abs() <= 1.0 + 1e-12);
        }
        // 3 um underfocus at 300 kV produces many zero crossings up to Nyquist.
        let crossings = ctf
            .windows(2)
            .into_iter()
            .filter(|w| w[0].signum() != w[1].signum())
            .count();
        assert!(crossings > 10, "expected oscillation, got {}", crossings);
    }

    #[test]
    fn test_phase_shift_moves_the_curve() {
        let plain = ctf_1d(64, 1e-10, VOLTAGE_V, SPHERICAL_ABERRATION_M, -2e-6, 0.07, 0.0, 0.0);
        let shifted = ctf_1d(
            64,
            1e-10,
            VOLTAGE_V,
            SPHERICAL_ABERRATION_M,
            -2e-6,
            0.07,
            std::f64::consts::FRAC_PI_2,
            0.0,
        );
        // With a 90 degree phase shift the zero-frequency value becomes the
        // phase-contrast term.
        assert_relative_eq!(shifted[0], (1.0f64 - 0.07 * 0.07).sqrt(), epsilon = 1e-12);
        assert!((plain[0] - shifted[0]).abs() > 0.5);
    }
}
