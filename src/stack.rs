//! Tilt-stack container and simple whole-stack transforms.
//!
//! A tilt series is held as a 3-D array of `f32` intensities with the tilt
//! axis first, i.e. shape `(n_tilts, height, width)`. All tilt images in a
//! stack share the same spatial dimensions by construction. The on-disk
//! sample type is tracked separately so that integer detector stacks can be
//! binned and written back without silently changing their storage mode.

use anyhow::{bail, Result};
use ndarray::{s, Array3, Axis};

use crate::io::MrcMode;

/// In-memory axis ordering used at the API boundary.
///
/// Internally the stack is always tilt-major (`(n, y, x)`). Callers coming
/// from x-major conventions can convert with [`TiltStack::from_array`] and
/// [`TiltStack::into_array`].
#[derive(PartialEq, Clone, Copy, Debug, Default)]
pub enum AxisOrder {
    /// `(x, y, n_tilts)` — spatial axes first, tilt axis last.
    #[default]
    Xyz,
    /// `(n_tilts, y, x)` — tilt axis first.
    Zyx,
}

/// A tilt series: one 2-D projection image per stage tilt.
#[derive(Clone, Debug)]
pub struct TiltStack {
    /// Pixel intensities, shape `(n_tilts, height, width)`.
    pub data: Array3<f32>,
    /// Sample type the stack uses on disk.
    pub mode: MrcMode,
}

impl TiltStack {
    pub fn new(data: Array3<f32>, mode: MrcMode) -> Self {
        TiltStack { data, mode }
    }

    /// Wraps an array given in `order` layout, normalizing to tilt-major.
    pub fn from_array(data: Array3<f32>, order: AxisOrder, mode: MrcMode) -> Self {
        let data = match order {
            AxisOrder::Zyx => data,
            AxisOrder::Xyz => data.permuted_axes([2, 1, 0]).as_standard_layout().to_owned(),
        };
        TiltStack { data, mode }
    }

    /// Consumes the stack, returning the pixel array in the requested layout.
    pub fn into_array(self, order: AxisOrder) -> Array3<f32> {
        match order {
            AxisOrder::Zyx => self.data,
            AxisOrder::Xyz => self
                .data
                .permuted_axes([2, 1, 0])
                .as_standard_layout()
                .to_owned(),
        }
    }

    pub fn n_tilts(&self) -> usize {
        self.data.dim().0
    }

    pub fn height(&self) -> usize {
        self.data.dim().1
    }

    pub fn width(&self) -> usize {
        self.data.dim().2
    }

    /// Splits the stack by tilt-index parity into two independent stacks.
    ///
    /// Tilts `0, 2, 4, …` go to the even stack, `1, 3, 5, …` to the odd
    /// stack; the original per-tilt order is preserved within each group.
    /// Used for independent half-set processing downstream.
    pub fn split_even_odd(&self) -> (TiltStack, TiltStack) {
        let n = self.n_tilts();
        let even: Vec<usize> = (0..n).step_by(2).collect();
        let odd: Vec<usize> = (1..n).step_by(2).collect();

        let even_stack = TiltStack::new(self.data.select(Axis(0), &even), self.mode);
        let odd_stack = TiltStack::new(self.data.select(Axis(0), &odd), self.mode);
        (even_stack, odd_stack)
    }
}

/// Block-mean downsampling over the two spatial axes; the tilt axis is left
/// untouched.
///
/// Trailing rows and columns that do not fill a complete block are dropped.
/// For integer stacks the block means are rounded back, matching the
/// precision loss of raw detector storage.
///
/// # Arguments
/// - `stack`: The input tilt series.
/// - `factor`: Binning factor; `1` is the identity transform.
pub fn bin(stack: &TiltStack, factor: usize) -> Result<TiltStack> {
    if factor == 0 {
        bail!("binning factor must be at least 1");
    }
    if factor == 1 {
        return Ok(stack.clone());
    }

    let (n, h, w) = stack.data.dim();
    let bh = h / factor;
    let bw = w / factor;
    if bh == 0 || bw == 0 {
        bail!(
            "binning factor {} exceeds the spatial dimensions {}x{}",
            factor,
            h,
            w
        );
    }

    log::debug!("binning {} tilts {}x{} -> {}x{}", n, h, w, bh, bw);

    let norm = (factor * factor) as f32;
    let round = stack.mode.is_integer();
    let mut binned = Array3::<f32>::zeros((n, bh, bw));
    for t in 0..n {
        for by in 0..bh {
            for bx in 0..bw {
                let block = stack.data.slice(s![
                    t,
                    by * factor..(by + 1) * factor,
                    bx * factor..(bx + 1) * factor
                ]);
                let mean = block.sum() / norm;
                binned[(t, by, bx)] = if round { mean.round() } else { mean };
            }
        }
    }

    Ok(TiltStack::new(binned, stack.mode))
}
