//! CSV and WAV file handling.
//!
//! Every result the bench produces is a CSV table with a header row, one column
//! per quantity. Input files come in three shapes:
//! - one-column waveform files (normalized arbitrary waveforms), with or
//!   without a header
//! - two-column signal files (input, output) for transfer-function analysis
//! - WAV recordings, mixed down to mono and normalized to [-1, 1]

use crate::error::{BenchError, BenchResult};
use chrono::Local;
use hound::{SampleFormat, WavReader};
use std::fs;
use std::path::{Path, PathBuf};

/// Write equal-length columns under `headers`, creating parent directories.
pub fn write_columns<P: AsRef<Path>>(path: P, headers: &[&str], columns: &[&[f64]]) -> BenchResult<()> {
    let path = path.as_ref();
    if headers.len() != columns.len() {
        return Err(BenchError::InvalidInput(format!(
            "{} headers for {} columns",
            headers.len(),
            columns.len()
        )));
    }
    let rows = columns.first().map_or(0, |c| c.len());
    if columns.iter().any(|c| c.len() != rows) {
        return Err(BenchError::InvalidInput("CSV columns differ in length".into()));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(headers)?;
    for row in 0..rows {
        writer.write_record(columns.iter().map(|c| c[row].to_string()))?;
    }
    writer.flush()?;
    tracing::info!(path = %path.display(), rows, "CSV written");
    Ok(())
}

/// Write one value per line with no header, the layout arbitrary-waveform
/// files use.
pub fn write_single_column<P: AsRef<Path>>(path: P, values: &[f64]) -> BenchResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    for value in values {
        writer.write_record([format!("{value:.18e}")])?;
    }
    writer.flush()?;
    tracing::info!(path = %path.display(), rows = values.len(), "waveform written");
    Ok(())
}

/// Parse rows of floats, skipping a leading header row and blank fields.
fn read_rows(path: &Path, min_fields: usize) -> BenchResult<Vec<Vec<f64>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        let parsed: Result<Vec<f64>, _> = record
            .iter()
            .filter(|f| !f.is_empty())
            .map(str::parse::<f64>)
            .collect();
        match parsed {
            Ok(values) if values.len() >= min_fields => rows.push(values),
            Ok(values) => {
                return Err(BenchError::InvalidInput(format!(
                    "{}: row {} has {} values, expected {min_fields}",
                    path.display(),
                    index + 1,
                    values.len()
                )))
            }
            // Header row
            Err(_) if index == 0 => continue,
            Err(e) => {
                return Err(BenchError::InvalidInput(format!(
                    "{}: row {}: {e}",
                    path.display(),
                    index + 1
                )))
            }
        }
    }
    Ok(rows)
}

/// Read the first column of a CSV file as floats.
pub fn read_column<P: AsRef<Path>>(path: P) -> BenchResult<Vec<f64>> {
    let rows = read_rows(path.as_ref(), 1)?;
    Ok(rows.into_iter().map(|r| r[0]).collect())
}

/// Read the first two columns of a CSV file.
pub fn read_two_columns<P: AsRef<Path>>(path: P) -> BenchResult<(Vec<f64>, Vec<f64>)> {
    let rows = read_rows(path.as_ref(), 2)?;
    Ok(rows.into_iter().map(|r| (r[0], r[1])).unzip())
}

/// A mono recording.
#[derive(Debug, Clone, PartialEq)]
pub struct WavSignal {
    pub samples: Vec<f64>,
    pub sample_rate: u32,
}

/// Load a WAV file, average its channels and normalize to [-1, 1].
pub fn load_wav<P: AsRef<Path>>(path: P) -> BenchResult<WavSignal> {
    let path = path.as_ref();
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    let interleaved: Vec<f64> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(f64::from))
            .collect::<Result<_, _>>()?,
        SampleFormat::Int => {
            let full_scale = f64::from(1u32 << (spec.bits_per_sample.saturating_sub(1)));
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| f64::from(v) / full_scale))
                .collect::<Result<_, _>>()?
        }
    };

    let channels = usize::from(spec.channels.max(1));
    let samples = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f64>() / frame.len() as f64)
        .collect::<Vec<_>>();
    tracing::debug!(
        path = %path.display(),
        sample_rate = spec.sample_rate,
        channels,
        samples = samples.len(),
        "WAV loaded"
    );
    Ok(WavSignal {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// Load a WAV file that must be recorded at `sample_rate`.
pub fn load_wav_at<P: AsRef<Path>>(path: P, sample_rate: u32) -> BenchResult<Vec<f64>> {
    let path = path.as_ref();
    let signal = load_wav(path)?;
    if signal.sample_rate != sample_rate {
        return Err(BenchError::InvalidInput(format!(
            "{} is sampled at {} Hz, expected {sample_rate} Hz",
            path.display(),
            signal.sample_rate
        )));
    }
    Ok(signal.samples)
}

/// `<dir>/<prefix>_<YYYYmmdd_HHMMSS>.<ext>`
pub fn timestamped_path<P: AsRef<Path>>(dir: P, prefix: &str, ext: &str) -> PathBuf {
    dir.as_ref().join(format!(
        "{prefix}_{}.{ext}",
        Local::now().format("%Y%m%d_%H%M%S")
    ))
}
