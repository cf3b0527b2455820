//! Tilt-series processing for cryo-electron tomography.
//!
//! This crate covers the per-tilt 2-D frequency-domain pipeline applied to
//! tilt stacks before reconstruction: exposure (dose) filtering, CTF-aware
//! Wiener deconvolution, and the simple whole-stack transforms around them
//! (binning, histogram equalization, even/odd splitting), together with MRC
//! stack I/O and dose/defocus metadata loading.
//!
//! All operations are deterministic pure functions over in-memory stacks;
//! per-tilt work parallelizes across the tilt axis with no shared mutable
//! state. Logging goes through the `log` facade; the crate never installs a
//! logger itself.

/// 1-D contrast transfer function model and microscope constants.
pub mod ctf;

/// Planned 2-D FFTs, quadrant shifts and the shared filter-application
/// helper.
pub mod fft;

/// Dose filtering, deconvolution and histogram equalization.
pub mod filters;

/// MRC stack reading and writing.
pub mod io;

/// Dose and defocus metadata sources and file formats.
pub mod metadata;

/// The tilt-stack container, binning and even/odd splitting.
pub mod stack;

pub use filters::deconvolution::{deconvolve, DeconvolutionParams};
pub use filters::dose::{dose_filter, DoseFilterOptions};
pub use filters::histogram::{equalize_histogram, EqualizeMethod};
pub use io::MrcMode;
pub use metadata::{DefocusFormat, DefocusSource, DoseSource};
pub use stack::{bin, AxisOrder, TiltStack};
