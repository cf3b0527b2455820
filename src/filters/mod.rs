//! Frequency-domain and histogram filters for tilt series.
//!
//! The two frequency-domain engines share one structure: each tilt image is
//! transformed independently with a 2-D FFT, multiplied by a real-valued
//! filter plane and transformed back, keeping the real part. They differ
//! only in how the filter plane is derived:
//!
//! * **Dose filtering** builds an exposure-dependent attenuator from the
//!   accumulated electron dose and a fixed critical-exposure model.
//!
//! * **Deconvolution** builds a per-tilt 1-D Wiener curve from the CTF and
//!   an SNR falloff model, then maps it radially onto the frequency plane.
//!
//! Histogram equalization operates per tilt in the spatial domain.

/// Wiener deconvolution driven by per-tilt defocus and a 1-D CTF model.
pub mod deconvolution;

/// Exposure filtering driven by per-tilt accumulated dose.
pub mod dose;

/// Percentile stretch, global and adaptive histogram equalization.
pub mod histogram;
