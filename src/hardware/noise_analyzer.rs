//! Audio / Noise Analyzer Capability
//!
//! The APx500 family is automated through a vendor object model rather than
//! SCPI, so it is modeled here as a capability trait. [`SimulatedNoiseAnalyzer`]
//! implements it for `--simulate` runs and tests; a vendor backend would
//! implement the same trait.

use crate::config::duration_from_secs;
use crate::data::Spectrum;
use crate::error::BenchError;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Analog connector type on either side of the signal path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connector {
    AnalogBalanced,
    AnalogUnbalanced,
}

/// What the analyzer input measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Measurand {
    Voltage,
    Current,
}

/// Analog input bandwidth setting (audio band / sample rate pair).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputBandwidth {
    Bw20k44kHz,
    Bw40k96kHz,
    Bw90k192kHz,
}

impl InputBandwidth {
    /// Upper edge of the analysis band.
    pub fn upper_hz(self) -> f64 {
        match self {
            InputBandwidth::Bw20k44kHz => 20_000.0,
            InputBandwidth::Bw40k96kHz => 40_000.0,
            InputBandwidth::Bw90k192kHz => 90_000.0,
        }
    }
}

/// Noise-density measurement setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseSetup {
    pub input_connector: Connector,
    pub output_connector: Connector,
    pub measurand: Measurand,
    pub channel_name: String,
    pub acquisition_seconds: f64,
    pub averages: u32,
    pub bandwidth: InputBandwidth,
}

impl Default for NoiseSetup {
    fn default() -> Self {
        Self {
            input_connector: Connector::AnalogBalanced,
            output_connector: Connector::AnalogBalanced,
            measurand: Measurand::Voltage,
            channel_name: "Sensor".to_string(),
            acquisition_seconds: 5.0,
            averages: 10,
            bandwidth: InputBandwidth::Bw20k44kHz,
        }
    }
}

impl NoiseSetup {
    /// Acquisition time as a `Duration`.
    pub fn acquisition(&self) -> Result<Duration, BenchError> {
        duration_from_secs("acquisition time", self.acquisition_seconds)
    }

    pub fn validate(&self) -> Result<(), BenchError> {
        self.acquisition()?;
        if self.averages == 0 {
            return Err(BenchError::InvalidInput("averages must be at least 1".into()));
        }
        Ok(())
    }
}

/// Capability: Noise Density Measurement
///
/// # Contract
/// - `configure` before `start`
/// - `results` only once `is_running` reports false after a `start`
#[async_trait]
pub trait NoiseAnalyzer: Send + Sync {
    /// Apply the signal-path and analyzer setup.
    async fn configure(&self, setup: &NoiseSetup) -> Result<()>;

    /// Start the measurement sequence.
    async fn start(&self) -> Result<()>;

    /// Whether the sequence is still acquiring.
    async fn is_running(&self) -> Result<bool>;

    /// Voltage noise density: frequencies (Hz) and levels (V/√Hz).
    async fn results(&self) -> Result<Spectrum>;
}

/// 1/f corner of the simulated amplifier, Hz.
const SIMULATED_CORNER_HZ: f64 = 100.0;

/// White-noise floor of the simulated amplifier, V/√Hz.
const SIMULATED_WHITE_DENSITY: f64 = 4.0e-9;

/// Points per decade in the simulated spectrum.
const SIMULATED_POINTS_PER_DECADE: usize = 50;

#[derive(Default)]
struct AnalyzerState {
    setup: Option<NoiseSetup>,
    started: Option<Instant>,
}

/// Analyzer that produces a 1/f + white noise curve.
#[derive(Default)]
pub struct SimulatedNoiseAnalyzer {
    state: Mutex<AnalyzerState>,
}

impl SimulatedNoiseAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquisition(&self) -> Result<(NoiseSetup, Instant)> {
        let state = self.state.lock();
        let setup = state
            .setup
            .clone()
            .ok_or_else(|| BenchError::Instrument("noise analyzer not configured".into()))?;
        let started = state
            .started
            .ok_or_else(|| BenchError::Instrument("noise measurement not started".into()))?;
        Ok((setup, started))
    }
}

#[async_trait]
impl NoiseAnalyzer for SimulatedNoiseAnalyzer {
    async fn configure(&self, setup: &NoiseSetup) -> Result<()> {
        setup.validate()?;
        tracing::debug!(?setup, "simulated analyzer configured");
        let mut state = self.state.lock();
        state.setup = Some(setup.clone());
        state.started = None;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.setup.is_none() {
            return Err(BenchError::Instrument("noise analyzer not configured".into()).into());
        }
        state.started = Some(Instant::now());
        Ok(())
    }

    async fn is_running(&self) -> Result<bool> {
        let (setup, started) = self.acquisition()?;
        Ok(started.elapsed() < setup.acquisition()?)
    }

    async fn results(&self) -> Result<Spectrum> {
        if self.is_running().await? {
            return Err(BenchError::Instrument("noise measurement still running".into()).into());
        }
        let (setup, _) = self.acquisition()?;

        // Averaging shrinks the scatter by 1/sqrt(N)
        let scatter = 0.1 / f64::from(setup.averages).sqrt();
        let mut rng = rand::thread_rng();
        let frequencies = log_spaced(10.0, setup.bandwidth.upper_hz(), SIMULATED_POINTS_PER_DECADE);
        let values = frequencies
            .iter()
            .map(|f| {
                let density = SIMULATED_WHITE_DENSITY * (1.0 + SIMULATED_CORNER_HZ / f).sqrt();
                density * (1.0 + rng.gen_range(-scatter..=scatter))
            })
            .collect();
        Ok(Spectrum::new(frequencies, values)?)
    }
}

/// Logarithmically spaced points from `start` to `stop` inclusive.
fn log_spaced(start: f64, stop: f64, per_decade: usize) -> Vec<f64> {
    let decades = (stop / start).log10();
    let n = ((decades * per_decade as f64).ceil() as usize).max(1);
    (0..=n)
        .map(|i| start * 10f64.powf(decades * i as f64 / n as f64))
        .collect()
}
