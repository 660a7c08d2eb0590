//! Capture one scope channel to CSV, optionally driving a stimulus first.

use crate::config::TimingConfig;
use crate::data::storage;
use crate::hardware::capabilities::OutputControl;
use crate::hardware::oscilloscope::{CapturedWaveform, Oscilloscope};
use crate::hardware::signal_generator::{SignalGenerator, WaveformSettings, WaveformShape};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Stimulus frequency, Hz.
pub const STIMULUS_FREQUENCY_HZ: f64 = 2000.0;

/// Stimulus amplitude, mV.
pub const STIMULUS_AMPLITUDE_MV: f64 = 50.0;

/// Default record length.
pub const DEFAULT_CAPTURE_POINTS: usize = 1000;

/// What the generator drives while the scope captures.
#[derive(Debug, Clone, PartialEq)]
pub enum Stimulus {
    /// 2 kHz, 50 mV sine
    Sine,
    /// Normalized samples played at 2 kHz, 50 mV
    Arbitrary(Vec<f64>),
}

impl Stimulus {
    /// The arbitrary waveform in `path` if it exists, the sine otherwise.
    pub fn from_optional_file(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) if p.exists() => Ok(Stimulus::Arbitrary(
                storage::read_column(p).with_context(|| format!("reading {}", p.display()))?,
            )),
            Some(p) => {
                tracing::warn!(path = %p.display(), "arbitrary waveform not found, using a sine");
                Ok(Stimulus::Sine)
            }
            None => Ok(Stimulus::Sine),
        }
    }

    /// Program the generator and switch its output on.
    pub async fn start(&self, generator: &SignalGenerator) -> Result<()> {
        match self {
            Stimulus::Sine => {
                let settings = WaveformSettings::new(
                    WaveformShape::Sine,
                    STIMULUS_FREQUENCY_HZ,
                    STIMULUS_AMPLITUDE_MV,
                    0.0,
                );
                generator
                    .scpi()
                    .write(&format!(
                        "APPL:SIN {},{},{}",
                        settings.frequency_hz,
                        settings.amplitude_v(),
                        settings.offset_v()
                    ))
                    .await?;
            }
            Stimulus::Arbitrary(samples) => {
                generator
                    .load_arbitrary(samples, STIMULUS_AMPLITUDE_MV, STIMULUS_FREQUENCY_HZ)
                    .await?;
            }
        }
        generator.set_output(true).await
    }
}

/// One capture job.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeCaptureRequest {
    pub channel: u8,
    pub points: usize,
    /// Inserted into the default file name: `scope_<label>_<timestamp>.csv`
    pub label: Option<String>,
    /// Written next to the CSV as `<name>_comments.txt`
    pub comments: Option<String>,
    /// Explicit CSV path; otherwise a timestamped name in the output directory
    pub output: Option<PathBuf>,
}

impl Default for ScopeCaptureRequest {
    fn default() -> Self {
        Self {
            channel: 1,
            points: DEFAULT_CAPTURE_POINTS,
            label: None,
            comments: None,
            output: None,
        }
    }
}

impl ScopeCaptureRequest {
    /// CSV path for this capture under `output_dir`.
    pub fn csv_path(&self, output_dir: &Path) -> PathBuf {
        if let Some(path) = &self.output {
            return path.clone();
        }
        let prefix = match self.label.as_deref().map(str::trim) {
            Some(label) if !label.is_empty() => format!("scope_{}", label.replace(char::is_whitespace, "_")),
            _ => "scope_capture".to_string(),
        };
        storage::timestamped_path(output_dir, &prefix, "csv")
    }
}

/// Files written by a capture.
#[derive(Debug, Clone)]
pub struct ScopeCaptureOutcome {
    pub waveform: CapturedWaveform,
    pub csv_path: PathBuf,
    pub comments_path: Option<PathBuf>,
}

/// `Time_s,Voltage_V`
pub fn write_waveform_csv<P: AsRef<Path>>(path: P, waveform: &CapturedWaveform) -> Result<()> {
    storage::write_columns(
        path,
        &["Time_s", "Voltage_V"],
        &[&waveform.times(), &waveform.voltages],
    )?;
    Ok(())
}

/// Drive the optional stimulus, capture, write the CSV (and comments).
///
/// The stimulus output is switched off after the capture, successful or not.
pub async fn capture_to_csv(
    scope: &Oscilloscope,
    stimulus: Option<(&SignalGenerator, &Stimulus)>,
    request: &ScopeCaptureRequest,
    timing: &TimingConfig,
    output_dir: &Path,
) -> Result<ScopeCaptureOutcome> {
    let waveform = match stimulus {
        Some((generator, stimulus)) => {
            let captured = async {
                stimulus.start(generator).await?;
                scope.capture(request.channel, request.points, timing).await
            }
            .await;
            let off = generator.set_output(false).await;
            let waveform = captured?;
            off?;
            waveform
        }
        None => scope.capture(request.channel, request.points, timing).await?,
    };

    let csv_path = request.csv_path(output_dir);
    write_waveform_csv(&csv_path, &waveform)?;

    let comments_path = match request.comments.as_deref().filter(|c| !c.trim().is_empty()) {
        Some(comments) => {
            let stem = csv_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "scope".to_string());
            let path = csv_path.with_file_name(format!("{stem}_comments.txt"));
            fs::write(&path, comments).with_context(|| format!("writing {}", path.display()))?;
            Some(path)
        }
        None => None,
    };

    tracing::info!(path = %csv_path.display(), points = waveform.len(), "scope capture saved");
    Ok(ScopeCaptureOutcome {
        waveform,
        csv_path,
        comments_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstrumentKind;
    use crate::hardware::mock::MockTransport;
    use std::sync::Arc;

    #[test]
    fn test_default_file_names() {
        let dir = Path::new("data");
        let plain = ScopeCaptureRequest::default().csv_path(dir);
        assert!(plain.file_name().unwrap().to_string_lossy().starts_with("scope_capture_"));

        let labelled = ScopeCaptureRequest {
            label: Some("output stage".into()),
            ..Default::default()
        };
        let name = labelled.csv_path(dir).file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("scope_output_stage_"), "{name}");

        let explicit = ScopeCaptureRequest {
            output: Some(PathBuf::from("x/y.csv")),
            ..Default::default()
        };
        assert_eq!(explicit.csv_path(dir), PathBuf::from("x/y.csv"));
    }

    #[test]
    fn test_missing_arb_file_falls_back_to_sine() {
        let stimulus = Stimulus::from_optional_file(Some(Path::new("/nonexistent/arb.csv"))).unwrap();
        assert_eq!(stimulus, Stimulus::Sine);
        assert_eq!(Stimulus::from_optional_file(None).unwrap(), Stimulus::Sine);
    }

    #[tokio::test]
    async fn test_capture_with_sine_stimulus() {
        let dir = tempfile::tempdir().unwrap();
        let scope_mock = Arc::new(MockTransport::simulating(InstrumentKind::Oscilloscope, "scope"));
        let gen_mock = Arc::new(MockTransport::new("gen"));
        let scope = Oscilloscope::new("scope", scope_mock);
        let generator = SignalGenerator::new("gen", gen_mock.clone());

        let request = ScopeCaptureRequest {
            points: 100,
            comments: Some("input shorted".into()),
            ..Default::default()
        };
        let outcome = capture_to_csv(
            &scope,
            Some((&generator, &Stimulus::Sine)),
            &request,
            &TimingConfig::immediate(),
            dir.path(),
        )
        .await
        .unwrap();

        assert_eq!(gen_mock.commands(), vec!["APPL:SIN 2000,0.05,0", "OUTP ON", "OUTP OFF"]);
        assert_eq!(outcome.waveform.len(), 100);
        let text = fs::read_to_string(&outcome.csv_path).unwrap();
        assert!(text.starts_with("Time_s,Voltage_V\n"));
        assert_eq!(text.lines().count(), 101);
        let comments = outcome.comments_path.unwrap();
        assert_eq!(fs::read_to_string(comments).unwrap(), "input shorted");
    }

    #[tokio::test]
    async fn test_capture_with_arbitrary_stimulus() {
        let dir = tempfile::tempdir().unwrap();
        let scope = Oscilloscope::new(
            "scope",
            Arc::new(MockTransport::simulating(InstrumentKind::Oscilloscope, "scope")),
        );
        let gen_mock = Arc::new(MockTransport::new("gen"));
        let generator = SignalGenerator::new("gen", gen_mock.clone());
        let request = ScopeCaptureRequest {
            points: 10,
            output: Some(dir.path().join("arb.csv")),
            ..Default::default()
        };
        capture_to_csv(
            &scope,
            Some((&generator, &Stimulus::Arbitrary(vec![-1.0, 0.0, 1.0]))),
            &request,
            &TimingConfig::immediate(),
            dir.path(),
        )
        .await
        .unwrap();
        let commands = gen_mock.commands();
        assert_eq!(commands[0], "DATA VOLATILE,0,8191,16383");
        assert_eq!(commands[3], "VOLT 0.05");
        assert_eq!(commands[4], "FREQ 2000");
        assert_eq!(commands[5], "OUTP ON");
        assert!(dir.path().join("arb.csv").exists());
    }

    #[tokio::test]
    async fn test_failed_capture_still_stops_stimulus() {
        let dir = tempfile::tempdir().unwrap();
        // no simulation: :WAV:DATA? is unanswered
        let scope = Oscilloscope::new("scope", Arc::new(MockTransport::new("scope")));
        let gen_mock = Arc::new(MockTransport::new("gen"));
        let generator = SignalGenerator::new("gen", gen_mock.clone());
        let result = capture_to_csv(
            &scope,
            Some((&generator, &Stimulus::Sine)),
            &ScopeCaptureRequest::default(),
            &TimingConfig::immediate(),
            dir.path(),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(gen_mock.commands().last().unwrap(), "OUTP OFF");
    }
}
