//! 2-D FFT helpers for per-tilt frequency-domain filtering.
//!
//! The transforms are full complex row-column passes built on `rustfft`
//! plans; `f64` is used internally so that filter round trips stay well below
//! test tolerances even for large detector frames. `rustfft` leaves the
//! inverse unnormalized, so [`Fft2d::inverse_real`] divides by the element
//! count.

use ndarray::{Array2, ArrayView2};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Planned forward/inverse 2-D FFT for one spatial shape.
///
/// The plans are `Arc`-shared and thread safe, so one instance can serve a
/// parallel per-tilt loop.
pub struct Fft2d {
    nrows: usize,
    ncols: usize,
    row_fwd: Arc<dyn Fft<f64>>,
    row_inv: Arc<dyn Fft<f64>>,
    col_fwd: Arc<dyn Fft<f64>>,
    col_inv: Arc<dyn Fft<f64>>,
}

impl Fft2d {
    pub fn new(nrows: usize, ncols: usize) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        Fft2d {
            nrows,
            ncols,
            row_fwd: planner.plan_fft_forward(ncols),
            row_inv: planner.plan_fft_inverse(ncols),
            col_fwd: planner.plan_fft_forward(nrows),
            col_inv: planner.plan_fft_inverse(nrows),
        }
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// Forward 2-D transform of a real image, unshifted layout.
    pub fn forward(&self, image: ArrayView2<'_, f32>) -> Array2<Complex<f64>> {
        let mut spectrum = image.mapv(|v| Complex::new(v as f64, 0.0));
        self.transform(&mut spectrum, false);
        spectrum
    }

    /// Inverse 2-D transform; returns the real part, normalized by `1/(h*w)`.
    ///
    /// The imaginary residue of a filtered real image is numerical noise and
    /// is discarded.
    pub fn inverse_real(&self, mut spectrum: Array2<Complex<f64>>) -> Array2<f64> {
        self.transform(&mut spectrum, true);
        let norm = 1.0 / (self.nrows * self.ncols) as f64;
        spectrum.mapv(|c| c.re * norm)
    }

    fn transform(&self, data: &mut Array2<Complex<f64>>, inverse: bool) {
        let (row_fft, col_fft) = if inverse {
            (&self.row_inv, &self.col_inv)
        } else {
            (&self.row_fwd, &self.col_fwd)
        };

        // Rows are contiguous in standard layout.
        let buf = data
            .as_slice_mut()
            .expect("spectrum array is standard layout");
        for row in buf.chunks_exact_mut(self.ncols) {
            row_fft.process(row);
        }

        // Columns go through a gather/scatter scratch buffer.
        let mut column = vec![Complex::new(0.0, 0.0); self.nrows];
        for c in 0..self.ncols {
            for r in 0..self.nrows {
                column[r] = data[(r, c)];
            }
            col_fft.process(&mut column);
            for r in 0..self.nrows {
                data[(r, c)] = column[r];
            }
        }
    }
}

/// Multiplies the spectrum of a real image by a real-valued frequency-domain
/// filter (unshifted layout) and transforms back.
///
/// Shared by the exposure filter and the deconvolution engine.
pub fn apply_filter_real(
    fft: &Fft2d,
    image: ArrayView2<'_, f32>,
    filter: &Array2<f64>,
) -> Array2<f32> {
    let mut spectrum = fft.forward(image);
    for (s, &f) in spectrum.iter_mut().zip(filter.iter()) {
        *s *= f;
    }
    fft.inverse_real(spectrum).mapv(|v| v as f32)
}

fn roll2<T: Copy + num_traits::Zero>(input: &Array2<T>, sy: usize, sx: usize) -> Array2<T> {
    let (h, w) = input.dim();
    let mut out = Array2::zeros((h, w));
    for y in 0..h {
        for x in 0..w {
            out[((y + sy) % h, (x + sx) % w)] = input[(y, x)];
        }
    }
    out
}

/// Moves the zero-frequency element to the array center (numpy `fftshift`).
pub fn fftshift2<T: Copy + num_traits::Zero>(input: &Array2<T>) -> Array2<T> {
    let (h, w) = input.dim();
    roll2(input, h / 2, w / 2)
}

/// Inverse of [`fftshift2`]; moves the center back to the origin.
pub fn ifftshift2<T: Copy + num_traits::Zero>(input: &Array2<T>) -> Array2<T> {
    let (h, w) = input.dim();
    roll2(input, h - h / 2, w - w / 2)
}
