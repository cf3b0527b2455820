//! CTF-aware Wiener deconvolution of tilt series.
//!
//! Adapted from the tilt-series variant of `tom_deconv_tomo` (D. Tegunov):
//! per tilt, a 1-D Wiener curve `ctf / (ctf^2 + 1/snr)` is built from the
//! tilt's defocus and an exponential SNR falloff model, then mapped onto the
//! 2-D frequency plane through a radial index and applied as a multiplicative
//! frequency-domain ramp.

use anyhow::{anyhow, Result};
use interp1d::Interp1d;
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, Array3, Axis};
use std::path::PathBuf;

use crate::ctf::{self, AMPLITUDE_CONTRAST, SPHERICAL_ABERRATION_M, VOLTAGE_V};
use crate::fft::{apply_filter_real, ifftshift2, Fft2d};
use crate::io::{self, MrcMode};
use crate::metadata::DefocusSource;
use crate::stack::TiltStack;

/// Interpolation resolution floor; small images still get a densely sampled
/// Wiener curve.
const MIN_INTERP_DIM: usize = 2048;

/// Parameters of the Wiener deconvolution.
#[derive(Clone, Debug)]
pub struct DeconvolutionParams {
    /// How fast the SNR falls off with spatial frequency; higher values
    /// downweight high frequencies more.
    pub snr_falloff: f64,
    /// Global SNR scale on an exponential scale: 1.0 means SNR 1000 at zero
    /// frequency, 0.67 means SNR 100.
    pub deconv_strength: f64,
    /// Fraction of Nyquist cut off at the low end, where deconvolution would
    /// otherwise boost noise the most.
    pub highpass_nyquist: f64,
    /// Whether the data are already phase-flipped; the CTF is then used as
    /// its absolute value.
    pub phase_flipped: bool,
    /// CTF phase shift in degrees (e.g. from a phase plate).
    pub phase_shift_deg: f64,
    /// When set, the deconvolved stack is also written to this MRC path.
    pub output: Option<PathBuf>,
}

impl Default for DeconvolutionParams {
    fn default() -> Self {
        DeconvolutionParams {
            snr_falloff: 1.2,
            deconv_strength: 1.0,
            highpass_nyquist: 0.02,
            phase_flipped: false,
            phase_shift_deg: 0.0,
            output: None,
        }
    }
}

/// Normalized radial frequency index for a `height` x `width` plane, in
/// unshifted FFT layout.
///
/// Each axis of the centered grid is normalized by its half-dimension to
/// `[-1, 1)`, the Euclidean radius is clipped at 1 and the quadrants are
/// swapped to match the unnormalized transform layout. Radius 1 corresponds
/// to the Nyquist frequency.
pub fn radial_index(height: usize, width: usize) -> Array2<f64> {
    let hy = height as f64 / 2.0;
    let hx = width as f64 / 2.0;
    let centered = Array2::from_shape_fn((height, width), |(y, x)| {
        let fy = (y as f64 - hy) / hy;
        let fx = (x as f64 - hx) / hx;
        (fy * fy + fx * fx).sqrt().min(1.0)
    });
    ifftshift2(&centered)
}

/// Smooth low-frequency roll-off: a linear ramp over `highpass_nyquist` of
/// the `[0, 1]` frequency range, mapped through `1 - cos(ramp * pi)`.
///
/// Gain is exactly 0 at zero frequency and 2 beyond the ramp.
fn highpass_curve(interp_dim: usize, highpass_nyquist: f64) -> Array1<f64> {
    Array1::from_shape_fn(interp_dim, |i| {
        let x = i as f64 / interp_dim as f64;
        let ramp = if highpass_nyquist > 0.0 {
            (x / highpass_nyquist).min(1.0)
        } else {
            1.0
        };
        1.0 - (ramp * std::f64::consts::PI).cos()
    })
}

/// 1-D Wiener deconvolution curve for one tilt, sampled on `interp_dim`
/// frequencies covering `[0, Nyquist)`.
///
/// Inside the highpass stop band the SNR is zero and the filter value is
/// defined as 0 rather than letting `1/snr` poison the division.
fn wiener_curve(
    interp_dim: usize,
    pixel_size_a: f64,
    defocus_um: f64,
    params: &DeconvolutionParams,
) -> Array1<f64> {
    let highpass = highpass_curve(interp_dim, params.highpass_nyquist);
    let strength = 10f64.powf(3.0 * params.deconv_strength);

    let mut ctf = ctf::ctf_1d(
        interp_dim,
        pixel_size_a * 1e-10,
        VOLTAGE_V,
        SPHERICAL_ABERRATION_M,
        // The evaluator takes meters, negative for underfocus.
        -defocus_um * 1e-6,
        AMPLITUDE_CONTRAST,
        params.phase_shift_deg.to_radians(),
        0.0,
    );
    if params.phase_flipped {
        ctf.mapv_inplace(f64::abs);
    }

    Array1::from_shape_fn(interp_dim, |i| {
        let falloff = (-(i as f64 / interp_dim as f64) * params.snr_falloff * 100.0
            / pixel_size_a)
            .exp();
        let snr = falloff * strength * highpass[i];
        if snr <= 0.0 {
            0.0
        } else {
            ctf[i] / (ctf[i] * ctf[i] + 1.0 / snr)
        }
    })
}

/// Maps a 1-D Wiener curve onto the 2-D frequency plane.
///
/// The curve samples sit at `i / interp_dim` for radius in `[0, 1)`; queries
/// are clamped to the last sample, so a corner radius clipped at 1 reuses
/// the near-Nyquist filter value (the clamp spans less than one knot
/// spacing).
fn radial_ramp(radial: &Array2<f64>, wiener: &Array1<f64>) -> Result<Array2<f64>> {
    let interp_dim = wiener.len();
    let knots: Vec<f32> = (0..interp_dim)
        .map(|i| (i as f64 / interp_dim as f64) as f32)
        .collect();
    let values: Vec<f32> = wiener.iter().map(|v| *v as f32).collect();
    let last_knot = knots[interp_dim - 1];

    let interp = Interp1d::new_unsorted(knots, values)
        .map_err(|e| anyhow!("failed to build wiener interpolator: {:?}", e))?;

    Ok(radial.mapv(|r| interp.interpolate((r as f32).min(last_knot)) as f64))
}

/// Deconvolves a tilt stack.
///
/// # Arguments
/// - `stack`: Input tilt series.
/// - `pixel_size_a`: Pixel size in Å, must be positive.
/// - `defocus`: Defocus in µm (positive = underfocus): a single value, a
///   per-tilt vector, or an estimation tool output file.
/// - `params`: Wiener filter parameters; see [`DeconvolutionParams`].
///
/// # Returns
/// The deconvolved stack as 32-bit floats.
pub fn deconvolve(
    stack: &TiltStack,
    pixel_size_a: f64,
    defocus: &DefocusSource,
    params: &DeconvolutionParams,
) -> Result<TiltStack> {
    anyhow::ensure!(pixel_size_a > 0.0, "pixel size must be positive");

    let (n, h, w) = stack.data.dim();
    let defocus = defocus.resolve(n)?;
    let interp_dim = MIN_INTERP_DIM.max(h);

    log::info!(
        "deconvolving {} tilts of {}x{} at {:.3} A/px, defocus {:.2}..{:.2} um",
        n,
        h,
        w,
        pixel_size_a,
        defocus.iter().cloned().fold(f64::INFINITY, f64::min),
        defocus.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
    );

    let radial = radial_index(h, w);
    let fft = Fft2d::new(h, w);

    let mut deconvolved = Array3::<f32>::zeros((n, h, w));
    deconvolved
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .try_for_each(|(i, mut tilt_out)| -> Result<()> {
            let wiener = wiener_curve(interp_dim, pixel_size_a, defocus[i], params);
            let ramp = radial_ramp(&radial, &wiener)?;
            let tilt = stack.data.index_axis(Axis(0), i);
            tilt_out.assign(&apply_filter_real(&fft, tilt, &ramp));
            Ok(())
        })?;

    let result = TiltStack::new(deconvolved, MrcMode::Float32);
    if let Some(path) = &params.output {
        io::write_stack(&result, path, pixel_size_a)?;
    }
    Ok(result)
}
