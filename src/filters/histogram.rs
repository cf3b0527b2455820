//! Per-tilt histogram-based contrast operations.
//!
//! Three modes are supported: a 2nd/98th percentile contrast stretch, global
//! histogram equalization, and a localized adaptive equalization (CLAHE-style
//! tile mappings with bilinear blending, clip limit 0.03). All modes operate
//! on each tilt image independently and emit `f32` intensities in `[0, 1]`.

use anyhow::{bail, Result};
use ndarray::{Array2, Array3, ArrayView2, Axis};
use std::str::FromStr;

use crate::io::MrcMode;
use crate::stack::TiltStack;

const NBINS: usize = 256;
const CLAHE_TILES: usize = 8;
const CLAHE_CLIP_LIMIT: f64 = 0.03;

/// Histogram equalization mode.
#[derive(PartialEq, Clone, Copy, Debug)]
pub enum EqualizeMethod {
    /// Rescale the 2nd..98th percentile range to `[0, 1]`.
    ContrastStretch,
    /// Global 256-bin histogram equalization.
    Equalize,
    /// Localized adaptive equalization with a fixed clip limit of 0.03.
    AdaptiveEq,
}

impl FromStr for EqualizeMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "contrast_stretching" => Ok(EqualizeMethod::ContrastStretch),
            "equalization" => Ok(EqualizeMethod::Equalize),
            "adaptive_eq" => Ok(EqualizeMethod::AdaptiveEq),
            other => bail!("unknown equalization method: {}", other),
        }
    }
}

/// Equalizes every tilt image of a stack independently.
///
/// The result is always a float stack with intensities in `[0, 1]`;
/// histogram mappings have no meaningful integer representation.
pub fn equalize_histogram(stack: &TiltStack, method: EqualizeMethod) -> Result<TiltStack> {
    let (n, h, w) = stack.data.dim();
    log::debug!("equalizing {} tilts of {}x{} with {:?}", n, h, w, method);

    let mut equalized = Array3::<f32>::zeros((n, h, w));
    for t in 0..n {
        let tilt = stack.data.index_axis(Axis(0), t);
        let out = match method {
            EqualizeMethod::ContrastStretch => contrast_stretch(tilt),
            EqualizeMethod::Equalize => equalize_global(tilt),
            EqualizeMethod::AdaptiveEq => equalize_adaptive(tilt),
        };
        equalized.index_axis_mut(Axis(0), t).assign(&out);
    }

    Ok(TiltStack::new(equalized, MrcMode::Float32))
}

/// Linearly interpolated percentile, matching numpy's default behavior.
fn percentile(sorted: &[f32], q: f64) -> f32 {
    let pos = q / 100.0 * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = (pos - lower as f64) as f32;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

fn contrast_stretch(image: ArrayView2<'_, f32>) -> Array2<f32> {
    let mut sorted: Vec<f32> = image.iter().copied().collect();
    sorted.sort_by(f32::total_cmp);
    let p2 = percentile(&sorted, 2.0);
    let p98 = percentile(&sorted, 98.0);

    if p98 <= p2 {
        // Degenerate contrast range; nothing to stretch.
        return Array2::zeros(image.dim());
    }
    let scale = 1.0 / (p98 - p2);
    image.mapv(|v| ((v - p2) * scale).clamp(0.0, 1.0))
}

/// Bin index of a value over the `[min, max]` intensity range.
fn bin_of(value: f32, min: f32, inv_range: f32) -> usize {
    (((value - min) * inv_range * (NBINS - 1) as f32).round() as usize).min(NBINS - 1)
}

fn equalize_global(image: ArrayView2<'_, f32>) -> Array2<f32> {
    let min = image.iter().copied().fold(f32::INFINITY, f32::min);
    let max = image.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max <= min {
        return Array2::zeros(image.dim());
    }
    let inv_range = 1.0 / (max - min);

    let mut histogram = [0usize; NBINS];
    for v in image.iter() {
        histogram[bin_of(*v, min, inv_range)] += 1;
    }

    let total = image.len() as f32;
    let mut cdf = [0f32; NBINS];
    let mut cumulative = 0usize;
    for (b, count) in histogram.iter().enumerate() {
        cumulative += count;
        cdf[b] = cumulative as f32 / total;
    }

    image.mapv(|v| cdf[bin_of(v, min, inv_range)])
}

/// CLAHE-style adaptive equalization.
///
/// The image is divided into an 8x8 tile grid; each tile gets a clipped
/// 256-bin histogram (excess redistributed uniformly) and its own CDF
/// mapping. Pixels are mapped by bilinear blending of the four surrounding
/// tile mappings, which avoids visible tile seams.
fn equalize_adaptive(image: ArrayView2<'_, f32>) -> Array2<f32> {
    let (h, w) = image.dim();
    let tiles_y = CLAHE_TILES.min(h);
    let tiles_x = CLAHE_TILES.min(w);

    let min = image.iter().copied().fold(f32::INFINITY, f32::min);
    let max = image.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max <= min {
        return Array2::zeros(image.dim());
    }
    let inv_range = 1.0 / (max - min);

    // Per-tile clipped CDF mappings.
    let mut mappings = vec![[0f32; NBINS]; tiles_y * tiles_x];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let y0 = ty * h / tiles_y;
            let y1 = (ty + 1) * h / tiles_y;
            let x0 = tx * w / tiles_x;
            let x1 = (tx + 1) * w / tiles_x;
            let npix = (y1 - y0) * (x1 - x0);

            let mut histogram = [0f64; NBINS];
            for y in y0..y1 {
                for x in x0..x1 {
                    histogram[bin_of(image[(y, x)], min, inv_range)] += 1.0;
                }
            }

            // Clip and redistribute the excess uniformly.
            let clip = (CLAHE_CLIP_LIMIT * npix as f64).max(1.0);
            let mut excess = 0.0;
            for count in histogram.iter_mut() {
                if *count > clip {
                    excess += *count - clip;
                    *count = clip;
                }
            }
            let bonus = excess / NBINS as f64;
            for count in histogram.iter_mut() {
                *count += bonus;
            }

            let mapping = &mut mappings[ty * tiles_x + tx];
            let mut cumulative = 0.0;
            for (b, count) in histogram.iter().enumerate() {
                cumulative += count;
                mapping[b] = (cumulative / npix as f64) as f32;
            }
        }
    }

    // Bilinear blend between the four surrounding tile mappings.
    let tile_h = h as f32 / tiles_y as f32;
    let tile_w = w as f32 / tiles_x as f32;
    Array2::from_shape_fn((h, w), |(y, x)| {
        let bin = bin_of(image[(y, x)], min, inv_range);

        let fy = ((y as f32 + 0.5) / tile_h - 0.5).clamp(0.0, (tiles_y - 1) as f32);
        let fx = ((x as f32 + 0.5) / tile_w - 0.5).clamp(0.0, (tiles_x - 1) as f32);
        let ty0 = fy.floor() as usize;
        let tx0 = fx.floor() as usize;
        let ty1 = (ty0 + 1).min(tiles_y - 1);
        let tx1 = (tx0 + 1).min(tiles_x - 1);
        let wy = fy - ty0 as f32;
        let wx = fx - tx0 as f32;

        let m00 = mappings[ty0 * tiles_x + tx0][bin];
        let m01 = mappings[ty0 * tiles_x + tx1][bin];
        let m10 = mappings[ty1 * tiles_x + tx0][bin];
        let m11 = mappings[ty1 * tiles_x + tx1][bin];

        (m00 * (1.0 - wy) * (1.0 - wx))
            + (m01 * (1.0 - wy) * wx)
            + (m10 * wy * (1.0 - wx))
            + (m11 * wy * wx)
    })
}
