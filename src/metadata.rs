//! Dose and defocus metadata sources.
//!
//! Both engines consume per-tilt scalars that may arrive as an explicit
//! value, a per-tilt vector, or a reference to a metadata file. The tagged
//! source types here are resolved exactly once at pipeline entry; the
//! resolved vector length is checked against the tilt count and a mismatch
//! is a hard error rather than a silent broadcast.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use ndarray::Array1;

/// Accumulated electron dose per tilt (e/Å²), or a reference to a file that
/// provides it.
#[derive(Clone, Debug)]
pub enum DoseSource {
    /// Explicit per-tilt accumulated dose.
    Values(Array1<f64>),
    /// Delimited text (`.txt`, `.csv`) or SerialEM `.mdoc` file.
    File(PathBuf),
}

impl DoseSource {
    /// Resolves the source to a per-tilt dose vector of length `n_tilts`.
    pub fn resolve(&self, n_tilts: usize) -> Result<Array1<f64>> {
        let dose = match self {
            DoseSource::Values(values) => values.clone(),
            DoseSource::File(path) => total_dose_load(path)?,
        };
        if dose.len() != n_tilts {
            bail!(
                "dose vector length {} does not match tilt count {}",
                dose.len(),
                n_tilts
            );
        }
        if dose.iter().any(|d| *d < 0.0) {
            bail!("accumulated dose must be non-negative");
        }
        if dose.windows(2).into_iter().any(|w| w[1] < w[0]) {
            log::warn!("accumulated dose is not monotonically non-decreasing");
        }
        Ok(dose)
    }
}

/// Loads an accumulated dose vector from a file, dispatching on the
/// extension: `.mdoc` is parsed as SerialEM metadata, `.csv` as
/// comma-delimited, anything else as whitespace-delimited text.
pub fn total_dose_load(path: impl AsRef<Path>) -> Result<Array1<f64>> {
    let path = path.as_ref();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "mdoc" => load_dose_mdoc(path),
        "csv" => load_dose_csv(path),
        _ => load_dose_text(path),
    }
}

fn load_dose_text(path: &Path) -> Result<Array1<f64>> {
    let content = fs::read_to_string(path)
        .context(format!("failed to read dose file: {}", path.display()))?;
    let mut dose = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let first = line
            .split_whitespace()
            .next()
            .ok_or_else(|| anyhow!("empty dose entry on line {}", lineno + 1))?;
        let value: f64 = first
            .parse()
            .context(format!("invalid dose value on line {}: {}", lineno + 1, first))?;
        dose.push(value);
    }
    if dose.is_empty() {
        bail!("dose file contains no values: {}", path.display());
    }
    Ok(Array1::from(dose))
}

fn load_dose_csv(path: &Path) -> Result<Array1<f64>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)
        .context(format!("failed to open dose file: {}", path.display()))?;
    let mut dose = Vec::new();
    for record in rdr.records() {
        let row = record?;
        let first = row
            .get(0)
            .ok_or_else(|| anyhow!("empty record in {}", path.display()))?;
        dose.push(first.parse::<f64>().context(format!("invalid dose value: {}", first))?);
    }
    if dose.is_empty() {
        bail!("dose file contains no values: {}", path.display());
    }
    Ok(Array1::from(dose))
}

/// Parses a SerialEM `.mdoc` file and returns the accumulated dose per tilt:
/// the cumulative sum of the per-section `ExposureDose` fields, in `ZValue`
/// order of appearance.
///
/// A section without `ExposureDose` is an error; an absent field would
/// otherwise silently shift the accumulation for every later tilt.
fn load_dose_mdoc(path: &Path) -> Result<Array1<f64>> {
    let content = fs::read_to_string(path)
        .context(format!("failed to read mdoc file: {}", path.display()))?;

    let mut per_section: Vec<Option<f64>> = Vec::new();
    let mut in_section = false;
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with("[ZValue") {
            in_section = true;
            per_section.push(None);
            continue;
        }
        if !in_section {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "ExposureDose" {
                let dose: f64 = value
                    .trim()
                    .parse()
                    .context(format!("invalid ExposureDose value: {}", value.trim()))?;
                if let Some(last) = per_section.last_mut() {
                    *last = Some(dose);
                }
            }
        }
    }

    if per_section.is_empty() {
        bail!("no ZValue sections found in {}", path.display());
    }

    let mut accumulated = Vec::with_capacity(per_section.len());
    let mut total = 0.0;
    for (i, dose) in per_section.iter().enumerate() {
        let dose =
            dose.ok_or_else(|| anyhow!("section {} has no ExposureDose in {}", i, path.display()))?;
        total += dose;
        accumulated.push(total);
    }
    Ok(Array1::from(accumulated))
}

/// Adds a constant per-image dose on top of a prior-dose vector.
pub fn accumulate_dose(prior_dose: &Array1<f64>, dose_per_image: f64) -> Array1<f64> {
    prior_dose.mapv(|d| d + dose_per_image)
}

/// Writes a dose vector as plain text, one value per line.
pub fn write_dose_text(path: impl AsRef<Path>, dose: &Array1<f64>) -> Result<()> {
    let lines: Vec<String> = dose.iter().map(|d| format!("{:.6}", d)).collect();
    fs::write(path.as_ref(), lines.join("\n") + "\n")
        .context(format!("failed to write dose file: {}", path.as_ref().display()))
}

/// Supported defocus estimation tool output formats.
#[derive(PartialEq, Clone, Copy, Debug)]
pub enum DefocusFormat {
    /// CTFFIND4 text output: `#`-prefixed comments, then one row per
    /// micrograph with defocus 1 and defocus 2 in Å as columns 2 and 3.
    Ctffind4,
    /// GCTF star file: a `loop_` block with `_rlnDefocusU`/`_rlnDefocusV`
    /// columns in Å.
    Gctf,
}

impl FromStr for DefocusFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ctffind4" => Ok(DefocusFormat::Ctffind4),
            "gctf" => Ok(DefocusFormat::Gctf),
            other => bail!("unsupported defocus file format: {}", other),
        }
    }
}

/// Defocus in micrometers (positive = underfocus), one of: a single value
/// broadcast to all tilts, a per-tilt vector, or an estimation tool output
/// file.
#[derive(Clone, Debug)]
pub enum DefocusSource {
    Uniform(f64),
    PerTilt(Array1<f64>),
    File { path: PathBuf, format: DefocusFormat },
}

impl DefocusSource {
    /// Resolves the source to a per-tilt defocus vector of length `n_tilts`.
    pub fn resolve(&self, n_tilts: usize) -> Result<Array1<f64>> {
        let defocus = match self {
            DefocusSource::Uniform(value) => Array1::from_elem(n_tilts, *value),
            DefocusSource::PerTilt(values) => values.clone(),
            DefocusSource::File { path, format } => defocus_load(path, *format)?,
        };
        if defocus.len() != n_tilts {
            bail!(
                "defocus vector length {} does not match tilt count {}",
                defocus.len(),
                n_tilts
            );
        }
        Ok(defocus)
    }
}

/// Loads the per-tilt mean defocus in micrometers from an estimation tool
/// output file.
pub fn defocus_load(path: impl AsRef<Path>, format: DefocusFormat) -> Result<Array1<f64>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .context(format!("failed to read defocus file: {}", path.display()))?;
    let mean = match format {
        DefocusFormat::Ctffind4 => parse_ctffind4(&content)?,
        DefocusFormat::Gctf => parse_gctf_star(&content)?,
    };
    if mean.is_empty() {
        bail!("defocus file contains no entries: {}", path.display());
    }
    Ok(Array1::from(mean))
}

fn parse_ctffind4(content: &str) -> Result<Vec<f64>> {
    let mut mean = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            bail!("ctffind4 row has {} columns, expected at least 3", fields.len());
        }
        let df1: f64 = fields[1].parse().context("invalid defocus 1 value")?;
        let df2: f64 = fields[2].parse().context("invalid defocus 2 value")?;
        // Angstroms to micrometers.
        mean.push((df1 + df2) / 2.0 * 1e-4);
    }
    Ok(mean)
}

fn parse_gctf_star(content: &str) -> Result<Vec<f64>> {
    let mut col_u: Option<usize> = None;
    let mut col_v: Option<usize> = None;
    let mut n_columns = 0usize;
    let mut mean = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("data_") || line == "loop_" {
            continue;
        }
        if let Some(label) = line.strip_prefix('_') {
            let mut parts = label.split_whitespace();
            let name = parts.next().unwrap_or("");
            // "#N" column indices are 1-based.
            let index = parts
                .next()
                .and_then(|p| p.strip_prefix('#'))
                .and_then(|p| p.parse::<usize>().ok())
                .map(|i| i.saturating_sub(1))
                .unwrap_or(n_columns);
            match name {
                "rlnDefocusU" => col_u = Some(index),
                "rlnDefocusV" => col_v = Some(index),
                _ => {}
            }
            n_columns += 1;
            continue;
        }

        let (u, v) = match (col_u, col_v) {
            (Some(u), Some(v)) => (u, v),
            _ => bail!("star file has no _rlnDefocusU/_rlnDefocusV columns"),
        };
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() <= u.max(v) {
            bail!("star data row has {} columns, need {}", fields.len(), u.max(v) + 1);
        }
        let df_u: f64 = fields[u].parse().context("invalid rlnDefocusU value")?;
        let df_v: f64 = fields[v].parse().context("invalid rlnDefocusV value")?;
        mean.push((df_u + df_v) / 2.0 * 1e-4);
    }
    Ok(mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    fn write_fixture(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_dose_text_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(&dir, "dose.txt", "3.000000\n6.000000\n9.000000\n");
        let dose = total_dose_load(&path).unwrap();
        assert_eq!(dose.len(), 3);
        assert_relative_eq!(dose[2], 9.0);
    }

    #[test]
    fn test_dose_csv_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(&dir, "dose.csv", "2.5\n5.0\n7.5\n");
        let dose = total_dose_load(&path).unwrap();
        assert_eq!(dose.to_vec(), vec![2.5, 5.0, 7.5]);
    }

    #[test]
    fn test_mdoc_accumulates_exposure_dose() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(
            &dir,
            "series.mdoc",
            "PixelSpacing = 2.70\nVoltage = 300\n\n\
             [ZValue = 0]\nTiltAngle = 0.0\nExposureDose = 3.0\n\n\
             [ZValue = 1]\nTiltAngle = 3.0\nExposureDose = 3.5\n\n\
             [ZValue = 2]\nTiltAngle = -3.0\nExposureDose = 3.0\n",
        );
        let dose = total_dose_load(&path).unwrap();
        assert_eq!(dose.to_vec(), vec![3.0, 6.5, 9.5]);
    }

    #[test]
    fn test_mdoc_missing_exposure_dose_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(
            &dir,
            "series.mdoc",
            "[ZValue = 0]\nExposureDose = 3.0\n[ZValue = 1]\nTiltAngle = 3.0\n",
        );
        assert!(total_dose_load(&path).is_err());
    }

    #[test]
    fn test_dose_source_length_mismatch_fails_fast() {
        let source = DoseSource::Values(Array1::from(vec![0.0, 1.0, 2.0]));
        assert!(source.resolve(5).is_err());
        assert!(source.resolve(3).is_ok());
    }

    #[test]
    fn test_accumulate_dose_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let prior = Array1::from(vec![0.0, 3.0, 6.0]);
        let total = accumulate_dose(&prior, 3.0);
        assert_eq!(total.to_vec(), vec![3.0, 6.0, 9.0]);

        let path = dir.path().join("total.txt");
        write_dose_text(&path, &total).unwrap();
        let loaded = total_dose_load(&path).unwrap();
        assert_eq!(loaded.to_vec(), total.to_vec());
    }

    #[test]
    fn test_ctffind4_mean_defocus_in_micrometers() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(
            &dir,
            "ctf.txt",
            "# Output from CTFFind version 4.1.14\n\
             # Columns: #1 number; #2 defocus 1 [A]; #3 defocus 2 [A]; #4 azimuth; #5 phase shift; #6 cc; #7 resolution\n\
             1.000000 30000.0 28000.0 45.0 0.0 0.95 4.2\n\
             2.000000 31000.0 29000.0 40.0 0.0 0.93 4.6\n",
        );
        let defocus = defocus_load(&path, DefocusFormat::Ctffind4).unwrap();
        assert_eq!(defocus.len(), 2);
        assert_relative_eq!(defocus[0], 2.9);
        assert_relative_eq!(defocus[1], 3.0);
    }

    #[test]
    fn test_gctf_star_mean_defocus() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(
            &dir,
            "ctf.star",
            "data_\n\nloop_\n\
             _rlnMicrographName #1\n\
             _rlnDefocusU #2\n\
             _rlnDefocusV #3\n\
             _rlnDefocusAngle #4\n\
             img_000.mrc 30000.0 28000.0 30.0\n\
             img_001.mrc 25000.0 23000.0 10.0\n",
        );
        let defocus = defocus_load(&path, DefocusFormat::Gctf).unwrap();
        assert_eq!(defocus.len(), 2);
        assert_relative_eq!(defocus[0], 2.9);
        assert_relative_eq!(defocus[1], 2.4);
    }

    #[test]
    fn test_unknown_defocus_format_is_rejected() {
        assert!("warp9".parse::<DefocusFormat>().is_err());
        assert_eq!("GCTF".parse::<DefocusFormat>().unwrap(), DefocusFormat::Gctf);
    }

    #[test]
    fn test_defocus_source_broadcast() {
        let uniform = DefocusSource::Uniform(3.0);
        let resolved = uniform.resolve(4).unwrap();
        assert_eq!(resolved.to_vec(), vec![3.0; 4]);

        let per_tilt = DefocusSource::PerTilt(Array1::from(vec![1.0, 2.0]));
        assert!(per_tilt.resolve(3).is_err());
    }
}
