//! MRC stack input/output.
//!
//! Implements the MRC2014 layout (https://www.ccpem.ac.uk/mrc_format/mrc2014.php)
//! for the sample modes that occur in tilt-series work: signed 8/16 bit
//! integers, unsigned 16 bit integers and 32 bit floats. Only little-endian
//! files are produced and consumed; the machine stamp is written accordingly.
//!
//! MRC data is section-major, which maps directly onto the crate's internal
//! `(tilt, y, x)` layout — a section is one tilt image.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use ndarray::Array3;

use crate::stack::TiltStack;

const HEADER_BYTES: u64 = 1024;

/// MRC sample modes supported by this crate.
#[derive(PartialEq, Clone, Copy, Debug)]
pub enum MrcMode {
    /// Mode 0: signed 8-bit integer.
    Int8,
    /// Mode 1: signed 16-bit integer.
    Int16,
    /// Mode 2: 32-bit float.
    Float32,
    /// Mode 6: unsigned 16-bit integer.
    Uint16,
}

impl MrcMode {
    fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(MrcMode::Int8),
            1 => Ok(MrcMode::Int16),
            2 => Ok(MrcMode::Float32),
            6 => Ok(MrcMode::Uint16),
            other => bail!("unsupported MRC mode: {}", other),
        }
    }

    fn code(&self) -> u32 {
        match self {
            MrcMode::Int8 => 0,
            MrcMode::Int16 => 1,
            MrcMode::Float32 => 2,
            MrcMode::Uint16 => 6,
        }
    }

    /// Whether samples are stored as integers on disk.
    pub fn is_integer(&self) -> bool {
        !matches!(self, MrcMode::Float32)
    }
}

/// Reads a tilt stack from an MRC file.
///
/// # Returns
/// The stack (tilt-major) and the pixel size in Å taken from the cell
/// dimensions; `1.0` when the header does not carry a usable cell.
pub fn read_stack(path: impl AsRef<Path>) -> Result<(TiltStack, f64)> {
    let path = path.as_ref();
    let file =
        File::open(path).context(format!("failed to open MRC file: {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let nx = reader.read_u32::<LE>()? as usize;
    let ny = reader.read_u32::<LE>()? as usize;
    let nz = reader.read_u32::<LE>()? as usize;
    let mode = MrcMode::from_code(reader.read_u32::<LE>()?)
        .context(format!("in MRC file: {}", path.display()))?;

    // Words 8-10: sampling grid; words 11-13: cell dimensions in Angstroms.
    reader.seek(SeekFrom::Start(4 * 7))?;
    let mx = reader.read_u32::<LE>()?;
    let _my = reader.read_u32::<LE>()?;
    let _mz = reader.read_u32::<LE>()?;
    let xlen = reader.read_f32::<LE>()?;

    let pixel_size_a = if mx > 0 && xlen > 0.0 {
        xlen as f64 / mx as f64
    } else {
        1.0
    };

    // Word 24: extended header size in bytes.
    reader.seek(SeekFrom::Start(4 * 23))?;
    let nsymbt = reader.read_u32::<LE>()? as u64;

    if nx == 0 || ny == 0 || nz == 0 {
        bail!("MRC file has empty dimensions: {}", path.display());
    }

    reader.seek(SeekFrom::Start(HEADER_BYTES + nsymbt))?;

    let count = nx * ny * nz;
    let mut samples = Vec::with_capacity(count);
    match mode {
        MrcMode::Int8 => {
            let mut raw = vec![0u8; count];
            reader.read_exact(&mut raw)?;
            samples.extend(raw.iter().map(|&v| v as i8 as f32));
        }
        MrcMode::Int16 => {
            for _ in 0..count {
                samples.push(reader.read_i16::<LE>()? as f32);
            }
        }
        MrcMode::Float32 => {
            for _ in 0..count {
                samples.push(reader.read_f32::<LE>()?);
            }
        }
        MrcMode::Uint16 => {
            for _ in 0..count {
                samples.push(reader.read_u16::<LE>()? as f32);
            }
        }
    }

    // Sections are z-major on disk: (nz, ny, nx).
    let data = Array3::from_shape_vec((nz, ny, nx), samples)
        .context("MRC sample count does not match header dimensions")?;

    log::debug!(
        "read {}: {} tilts of {}x{}, mode {:?}, pixel size {:.3} A",
        path.display(),
        nz,
        ny,
        nx,
        mode,
        pixel_size_a
    );

    Ok((TiltStack::new(data, mode), pixel_size_a))
}

/// Writes a tilt stack to an MRC file using the stack's sample mode.
///
/// Float samples are rounded and clamped when writing integer modes. The
/// cell dimensions encode `pixel_size_a`.
pub fn write_stack(stack: &TiltStack, path: impl AsRef<Path>, pixel_size_a: f64) -> Result<()> {
    let path = path.as_ref();
    let (nz, ny, nx) = stack.data.dim();

    let file = File::create(path)
        .context(format!("failed to open file for writing: {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    let mut dmin = f32::INFINITY;
    let mut dmax = f32::NEG_INFINITY;
    let mut sum = 0.0f64;
    for v in stack.data.iter() {
        dmin = dmin.min(*v);
        dmax = dmax.max(*v);
        sum += *v as f64;
    }
    let dmean = (sum / (nx * ny * nz) as f64) as f32;

    // Words 1-4: dimensions and mode.
    writer.write_u32::<LE>(nx as u32)?;
    writer.write_u32::<LE>(ny as u32)?;
    writer.write_u32::<LE>(nz as u32)?;
    writer.write_u32::<LE>(stack.mode.code())?;
    // Words 5-7: start offsets.
    writer.write_all(&[0u8; 4 * 3])?;
    // Words 8-10: sampling grid equals the image grid.
    writer.write_u32::<LE>(nx as u32)?;
    writer.write_u32::<LE>(ny as u32)?;
    writer.write_u32::<LE>(nz as u32)?;
    // Words 11-13: cell dimensions in Angstroms.
    writer.write_f32::<LE>((nx as f64 * pixel_size_a) as f32)?;
    writer.write_f32::<LE>((ny as f64 * pixel_size_a) as f32)?;
    writer.write_f32::<LE>((nz as f64 * pixel_size_a) as f32)?;
    // Words 14-16: cell angles.
    writer.write_f32::<LE>(90.0)?;
    writer.write_f32::<LE>(90.0)?;
    writer.write_f32::<LE>(90.0)?;
    // Words 17-19: axis mapping (x, y, z).
    writer.write_u32::<LE>(1)?;
    writer.write_u32::<LE>(2)?;
    writer.write_u32::<LE>(3)?;
    // Words 20-22: statistics.
    writer.write_f32::<LE>(dmin)?;
    writer.write_f32::<LE>(dmax)?;
    writer.write_f32::<LE>(dmean)?;
    // Word 23: space group (stack of images).
    writer.write_u32::<LE>(0)?;
    // Word 24: no extended header.
    writer.write_u32::<LE>(0)?;
    // Words 25-52: unused.
    writer.write_all(&[0u8; 4 * (53 - 25)])?;
    // Word 53: "MAP " magic.
    writer.write_all(b"MAP ")?;
    // Word 54: little-endian machine stamp.
    writer.write_all(&[0x44, 0x44, 0x00, 0x00])?;
    // Word 55: rms (unset).
    writer.write_f32::<LE>(-1.0)?;
    // Words 56-256: label count and labels, all zero.
    writer.write_all(&[0u8; 4 * (257 - 56)])?;

    match stack.mode {
        MrcMode::Int8 => {
            for v in stack.data.iter() {
                writer.write_i8(v.round().clamp(i8::MIN as f32, i8::MAX as f32) as i8)?;
            }
        }
        MrcMode::Int16 => {
            for v in stack.data.iter() {
                writer
                    .write_i16::<LE>(v.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)?;
            }
        }
        MrcMode::Float32 => {
            for v in stack.data.iter() {
                writer.write_f32::<LE>(*v)?;
            }
        }
        MrcMode::Uint16 => {
            for v in stack.data.iter() {
                writer.write_u16::<LE>(v.round().clamp(0.0, u16::MAX as f32) as u16)?;
            }
        }
    }

    writer.flush()?;

    log::debug!(
        "wrote {}: {} tilts of {}x{}, mode {:?}",
        path.display(),
        nz,
        ny,
        nx,
        stack.mode
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    #[test]
    fn test_float_round_trip_preserves_data_and_pixel_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.mrc");

        let data = Array3::from_shape_fn((3, 8, 6), |(t, y, x)| {
            (t as f32 + 1.0) * 0.5 + y as f32 * 0.25 - x as f32 * 0.125
        });
        let stack = TiltStack::new(data, MrcMode::Float32);
        write_stack(&stack, &path, 2.5).unwrap();

        let (read, pixel_size) = read_stack(&path).unwrap();
        assert_eq!(read.mode, MrcMode::Float32);
        assert_relative_eq!(pixel_size, 2.5, epsilon = 1e-6);
        assert_eq!(read.data, stack.data);
    }

    #[test]
    fn test_int16_round_trip_rounds_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.mrc");

        let data = Array3::from_shape_vec((1, 2, 2), vec![-4.4, 0.6, 120.0, 32766.7]).unwrap();
        let stack = TiltStack::new(data, MrcMode::Int16);
        write_stack(&stack, &path, 1.0).unwrap();

        let (read, _) = read_stack(&path).unwrap();
        assert_eq!(read.mode, MrcMode::Int16);
        assert_eq!(
            read.data.iter().copied().collect::<Vec<f32>>(),
            vec![-4.0, 1.0, 120.0, 32767.0]
        );
    }

    #[test]
    fn test_unsupported_mode_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.mrc");

        // Minimal header with mode 4 (complex), which this crate rejects.
        let mut header = Vec::new();
        for word in [2u32, 2, 1, 4] {
            header.extend_from_slice(&word.to_le_bytes());
        }
        header.resize(1024 + 2 * 2 * 4, 0);
        std::fs::write(&path, header).unwrap();

        assert!(read_stack(&path).is_err());
    }
}
