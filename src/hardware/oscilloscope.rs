//! Keysight InfiniiVision Oscilloscope Driver
//!
//! Single-shot ASCII waveform capture. The `:WAV:PRE?` preamble carries the
//! scaling needed to turn sample indices into a time axis:
//!
//! ```text
//! format, type, points, count, xincrement, xorigin, xreference,
//! yincrement, yorigin, yreference
//! ```
//!
//! With ASCII transfers the data values are already in volts; the y fields
//! are kept for completeness.

use crate::config::TimingConfig;
use crate::error::BenchError;
use crate::hardware::capabilities::Identify;
use crate::hardware::scpi::{parse_ascii_values, ScpiInstrument};
use crate::hardware::transport::ScpiTransport;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Parsed `:WAV:PRE?` reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveformPreamble {
    pub format: i32,
    pub acquisition_type: i32,
    pub points: usize,
    pub count: u32,
    pub x_increment: f64,
    pub x_origin: f64,
    pub x_reference: f64,
    pub y_increment: f64,
    pub y_origin: f64,
    pub y_reference: f64,
}

impl WaveformPreamble {
    /// Parse the ten comma-separated preamble fields.
    pub fn parse(reply: &str) -> Result<Self> {
        let fields: Vec<f64> = reply
            .trim()
            .split(',')
            .map(|f| {
                f.trim()
                    .parse::<f64>()
                    .with_context(|| format!("bad preamble field '{f}'"))
            })
            .collect::<Result<_>>()?;
        if fields.len() != 10 {
            return Err(BenchError::Instrument(format!(
                "preamble has {} fields, expected 10",
                fields.len()
            ))
            .into());
        }
        Ok(Self {
            format: fields[0] as i32,
            acquisition_type: fields[1] as i32,
            points: fields[2] as usize,
            count: fields[3] as u32,
            x_increment: fields[4],
            x_origin: fields[5],
            x_reference: fields[6],
            y_increment: fields[7],
            y_origin: fields[8],
            y_reference: fields[9],
        })
    }

    /// Time of sample `index`.
    pub fn time_at(&self, index: usize) -> f64 {
        (index as f64 - self.x_reference) * self.x_increment + self.x_origin
    }
}

/// A captured trace.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedWaveform {
    pub channel: u8,
    pub voltages: Vec<f64>,
    pub preamble: WaveformPreamble,
}

impl CapturedWaveform {
    /// Time axis matching `voltages`.
    pub fn times(&self) -> Vec<f64> {
        (0..self.voltages.len())
            .map(|i| self.preamble.time_at(i))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.voltages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voltages.is_empty()
    }
}

/// Driver for an InfiniiVision scope.
pub struct Oscilloscope {
    scpi: ScpiInstrument,
}

impl Oscilloscope {
    pub fn new(id: impl Into<String>, transport: Arc<dyn ScpiTransport>) -> Self {
        Self {
            scpi: ScpiInstrument::new(id, transport),
        }
    }

    pub async fn connect(id: impl Into<String>, transport: Arc<dyn ScpiTransport>) -> Result<Self> {
        let scope = Self::new(id, transport);
        scope.scpi.reset().await?;
        tracing::info!(id = scope.scpi.id(), resource = scope.scpi.resource(), "oscilloscope connected");
        Ok(scope)
    }

    pub fn scpi(&self) -> &ScpiInstrument {
        &self.scpi
    }

    /// Run, take a single acquisition, and read back `points` samples.
    pub async fn capture(&self, channel: u8, points: usize, timing: &TimingConfig) -> Result<CapturedWaveform> {
        if !(1..=4).contains(&channel) {
            return Err(BenchError::InvalidInput(format!("scope channel {channel} does not exist")).into());
        }
        if points == 0 {
            return Err(BenchError::InvalidInput("capture needs at least one point".into()).into());
        }

        self.scpi
            .write_all(&[
                ":STOP".to_string(),
                ":WAV:FORM ASCii".to_string(),
                format!(":WAV:SOUR CHAN{channel}"),
                ":RUN".to_string(),
            ])
            .await?;
        tokio::time::sleep(timing.scope_run_settle()).await;
        self.scpi.write(":SING").await?;
        tokio::time::sleep(timing.scope_single_wait()).await;
        self.scpi
            .write_all(&[":WAV:POIN:MODE RAW".to_string(), format!(":WAV:POIN {points}")])
            .await?;

        let voltages = self.scpi.query_ascii_values(":WAV:DATA?").await?;
        let preamble = WaveformPreamble::parse(&self.scpi.query(":WAV:PRE?").await?)?;
        if preamble.points != voltages.len() {
            tracing::warn!(
                preamble_points = preamble.points,
                received = voltages.len(),
                "preamble point count differs from data"
            );
        }
        tracing::info!(channel, points = voltages.len(), "waveform captured");
        Ok(CapturedWaveform {
            channel,
            voltages,
            preamble,
        })
    }

    /// Immediate waveform measurement on `channel`.
    pub async fn measure_waveform(&self, channel: u8) -> Result<Vec<f64>> {
        self.scpi
            .write_all(&[
                ":MEASU:IMMED:TYPe WAVeform".to_string(),
                format!(":MEASU:IMMED:WAVeform:CH{channel} ON"),
            ])
            .await?;
        let reply = self
            .scpi
            .query(&format!(":MEASU:IMMED:WAVeform:CH{channel}?"))
            .await?;
        parse_ascii_values(&reply)
    }
}

#[async_trait]
impl Identify for Oscilloscope {
    async fn identify(&self) -> Result<String> {
        self.scpi.identify().await
    }

    async fn reset(&self) -> Result<()> {
        self.scpi.reset().await
    }
}
