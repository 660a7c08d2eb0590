//! Keysight 33500B / 33600A Function Generator Driver
//!
//! Two-channel function / arbitrary waveform generator. Amplitudes and offsets
//! are handled in millivolts on the Rust side and converted to volts on the
//! wire. Burst mode plus a bus trigger is how bursts are fired; the `10 MHz In`
//! reference and `Trig In` connectors let a second generator follow a primary
//! one (see [`crate::procedures::generator_sync`]).

use crate::error::BenchError;
use crate::hardware::capabilities::{Identify, OutputControl, Triggerable};
use crate::hardware::scpi::ScpiInstrument;
use crate::hardware::transport::ScpiTransport;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Full-scale code of the 14-bit arbitrary waveform DAC.
pub const ARB_FULL_SCALE: f64 = 16383.0;

/// Waveform shapes the generator can output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WaveformShape {
    #[default]
    Sine,
    Square,
    Ramp,
    Pulse,
    Noise,
    Dc,
    User,
}

impl WaveformShape {
    /// SCPI function mnemonic.
    pub fn mnemonic(self) -> &'static str {
        match self {
            WaveformShape::Sine => "SIN",
            WaveformShape::Square => "SQU",
            WaveformShape::Ramp => "RAMP",
            WaveformShape::Pulse => "PULS",
            WaveformShape::Noise => "NOIS",
            WaveformShape::Dc => "DC",
            WaveformShape::User => "USER",
        }
    }
}

impl fmt::Display for WaveformShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

impl FromStr for WaveformShape {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sin" | "sine" => Ok(WaveformShape::Sine),
            "squ" | "square" => Ok(WaveformShape::Square),
            "ramp" | "triangle" => Ok(WaveformShape::Ramp),
            "puls" | "pulse" => Ok(WaveformShape::Pulse),
            "nois" | "noise" => Ok(WaveformShape::Noise),
            "dc" => Ok(WaveformShape::Dc),
            "user" | "arb" => Ok(WaveformShape::User),
            other => Err(BenchError::InvalidInput(format!("Unknown waveform shape '{other}'"))),
        }
    }
}

/// One channel's waveform settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaveformSettings {
    pub shape: WaveformShape,
    pub frequency_hz: f64,
    pub amplitude_mv: f64,
    pub offset_mv: f64,
    #[serde(default)]
    pub phase_deg: f64,
}

impl WaveformSettings {
    pub fn new(shape: WaveformShape, frequency_hz: f64, amplitude_mv: f64, offset_mv: f64) -> Self {
        Self {
            shape,
            frequency_hz,
            amplitude_mv,
            offset_mv,
            phase_deg: 0.0,
        }
    }

    pub fn with_phase(mut self, phase_deg: f64) -> Self {
        self.phase_deg = phase_deg;
        self
    }

    pub fn amplitude_v(&self) -> f64 {
        self.amplitude_mv / 1000.0
    }

    pub fn offset_v(&self) -> f64 {
        self.offset_mv / 1000.0
    }

    /// Reject settings no generator accepts. DC only needs a finite offset.
    pub fn validate(&self) -> Result<(), BenchError> {
        if !self.offset_mv.is_finite() || !self.phase_deg.is_finite() {
            return Err(BenchError::InvalidInput("offset and phase must be finite".into()));
        }
        if self.shape == WaveformShape::Dc {
            return Ok(());
        }
        if !(self.frequency_hz.is_finite() && self.frequency_hz > 0.0) {
            return Err(BenchError::InvalidInput(format!(
                "frequency must be positive, got {}",
                self.frequency_hz
            )));
        }
        if !(self.amplitude_mv.is_finite() && self.amplitude_mv > 0.0) {
            return Err(BenchError::InvalidInput(format!(
                "amplitude must be positive, got {} mV",
                self.amplitude_mv
            )));
        }
        Ok(())
    }
}

/// 10 MHz reference source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceSource {
    Internal,
    External,
}

/// Trigger source for bursts and sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Bus,
    External,
    Immediate,
}

/// Driver for a 33500B-class generator.
pub struct SignalGenerator {
    scpi: ScpiInstrument,
    armed: AtomicBool,
}

impl SignalGenerator {
    pub fn new(id: impl Into<String>, transport: Arc<dyn ScpiTransport>) -> Self {
        Self {
            scpi: ScpiInstrument::new(id, transport),
            armed: AtomicBool::new(false),
        }
    }

    /// Reset and bring the generator into the bench's baseline state.
    pub async fn connect(id: impl Into<String>, transport: Arc<dyn ScpiTransport>) -> Result<Self> {
        let generator = Self::new(id, transport);
        generator.scpi.reset().await?;
        generator
            .scpi
            .write_all(&[
                "SYST:BEEP:STAT OFF",
                "PHAS:SYNC",
                "ROSC:SOUR INT",
                "TRIG:SOUR BUS",
                "OUTP1:LOAD INF",
                "OUTP2:LOAD INF",
            ])
            .await?;
        tracing::info!(
            id = generator.scpi.id(),
            resource = generator.scpi.resource(),
            "signal generator connected"
        );
        Ok(generator)
    }

    pub fn scpi(&self) -> &ScpiInstrument {
        &self.scpi
    }

    /// `APPL:<shape> f,a,o` then `PHAS p` on the active channel.
    pub async fn apply(&self, settings: &WaveformSettings) -> Result<()> {
        settings.validate()?;
        if settings.shape == WaveformShape::Dc {
            return self
                .scpi
                .write(&format!("APPL:DC DEF,DEF,{}", settings.offset_v()))
                .await;
        }
        self.scpi
            .write(&format!(
                "APPL:{} {},{},{}",
                settings.shape.mnemonic(),
                settings.frequency_hz,
                settings.amplitude_v(),
                settings.offset_v()
            ))
            .await?;
        self.scpi.write(&format!("PHAS {}", settings.phase_deg)).await
    }

    /// Program one channel's function, frequency, amplitude and offset.
    ///
    /// A DC channel only gets its function and offset.
    pub async fn configure_channel(&self, channel: u8, settings: &WaveformSettings) -> Result<()> {
        check_channel(channel)?;
        settings.validate()?;
        if settings.shape == WaveformShape::Dc {
            return self
                .scpi
                .write_all(&[
                    format!("SOUR{channel}:FUNC DC"),
                    format!("SOUR{channel}:VOLT:OFFS {}", settings.offset_v()),
                ])
                .await;
        }
        self.scpi
            .write_all(&[
                format!("SOUR{channel}:FUNC {}", settings.shape.mnemonic()),
                format!("SOUR{channel}:FREQ {}", settings.frequency_hz),
                format!("SOUR{channel}:VOLT {}", settings.amplitude_v()),
                format!("SOUR{channel}:VOLT:OFFS {}", settings.offset_v()),
            ])
            .await
    }

    pub async fn set_channel_phase(&self, channel: u8, phase_deg: f64) -> Result<()> {
        check_channel(channel)?;
        self.scpi.write(&format!("SOUR{channel}:PHAS {phase_deg}")).await
    }

    /// `PHAS p` on the active channel.
    pub async fn set_phase(&self, phase_deg: f64) -> Result<()> {
        self.scpi.write(&format!("PHAS {phase_deg}")).await
    }

    /// Restart both channels' phase accumulators together.
    pub async fn sync_phase(&self) -> Result<()> {
        self.scpi.write("PHAS:SYNC").await
    }

    /// `OUTP<n> ON|OFF`
    pub async fn set_channel_output(&self, channel: u8, enabled: bool) -> Result<()> {
        check_channel(channel)?;
        self.scpi
            .write(&format!("OUTP{channel} {}", on_off(enabled)))
            .await
    }

    /// Both channel outputs.
    pub async fn set_all_outputs(&self, enabled: bool) -> Result<()> {
        for channel in [1, 2] {
            self.set_channel_output(channel, enabled).await?;
        }
        Ok(())
    }

    pub async fn set_reference(&self, source: ReferenceSource) -> Result<()> {
        let src = match source {
            ReferenceSource::Internal => "INT",
            ReferenceSource::External => "EXT",
        };
        self.scpi.write(&format!("ROSC:SOUR {src}")).await
    }

    pub async fn set_trigger_source(&self, source: TriggerSource) -> Result<()> {
        let src = match source {
            TriggerSource::Bus => "BUS",
            TriggerSource::External => "EXT",
            TriggerSource::Immediate => "IMM",
        };
        self.scpi.write(&format!("TRIG:SOUR {src}")).await
    }

    /// Drive the rear `Trig Out` connector.
    pub async fn set_trigger_output(&self, enabled: bool) -> Result<()> {
        self.scpi.write(&format!("OUTP:TRIG {}", on_off(enabled))).await
    }

    /// Triggered burst of `cycles` periods, or an infinite burst for `None`.
    pub async fn configure_burst(&self, cycles: Option<u32>) -> Result<()> {
        let ncyc = match cycles {
            Some(0) => {
                return Err(BenchError::InvalidInput("burst cycle count must be positive".into()).into())
            }
            Some(n) => n.to_string(),
            None => "INF".to_string(),
        };
        self.scpi
            .write_all(&[
                "BURS:STAT ON".to_string(),
                format!("BURS:NCYC {ncyc}"),
                "BURS:MODE TRIG".to_string(),
            ])
            .await
    }

    /// Load normalized samples into volatile memory and select them.
    ///
    /// Samples are clipped to [-1, 1] and scaled onto the 14-bit DAC range.
    pub async fn load_arbitrary(&self, samples: &[f64], amplitude_mv: f64, frequency_hz: f64) -> Result<()> {
        if samples.is_empty() {
            return Err(BenchError::InvalidInput("arbitrary waveform has no samples".into()).into());
        }
        let codes = arb_codes(samples);
        let data = codes.iter().map(u16::to_string).collect::<Vec<_>>().join(",");
        tracing::info!(points = codes.len(), "loading arbitrary waveform");
        self.scpi
            .write_all(&[
                format!("DATA VOLATILE,{data}"),
                "FUNC:USER VOLATILE".to_string(),
                "FUNC:SHAP USER".to_string(),
                format!("VOLT {}", amplitude_mv / 1000.0),
                format!("FREQ {frequency_hz}"),
            ])
            .await
    }

    /// Clear the armed flag without touching the instrument.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    pub async fn drain_errors(&self) -> Result<Vec<String>> {
        self.scpi.drain_errors().await
    }
}

/// Scale normalized samples to DAC codes: `((x + 1) * 8191.5)` truncated.
pub fn arb_codes(samples: &[f64]) -> Vec<u16> {
    samples
        .iter()
        .map(|x| {
            let clipped = if x.is_nan() { 0.0 } else { x.clamp(-1.0, 1.0) };
            ((clipped + 1.0) * (ARB_FULL_SCALE / 2.0)) as u16
        })
        .collect()
}

fn check_channel(channel: u8) -> Result<(), BenchError> {
    if channel == 1 || channel == 2 {
        Ok(())
    } else {
        Err(BenchError::InvalidInput(format!("generator channel {channel} does not exist")))
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "ON"
    } else {
        "OFF"
    }
}

#[async_trait]
impl Identify for SignalGenerator {
    async fn identify(&self) -> Result<String> {
        self.scpi.identify().await
    }

    async fn reset(&self) -> Result<()> {
        self.disarm();
        self.scpi.reset().await
    }
}

/// Acts on the active channel (`OUTP ON|OFF`).
#[async_trait]
impl OutputControl for SignalGenerator {
    async fn set_output(&self, enabled: bool) -> Result<()> {
        self.scpi.write(&format!("OUTP {}", on_off(enabled))).await
    }
}

#[async_trait]
impl Triggerable for SignalGenerator {
    async fn arm(&self) -> Result<()> {
        self.armed.store(true, Ordering::SeqCst);
        tracing::debug!(id = self.scpi.id(), "armed");
        Ok(())
    }

    async fn trigger(&self) -> Result<()> {
        if !self.armed.load(Ordering::SeqCst) {
            return Err(BenchError::NotArmed(self.scpi.id().to_string()).into());
        }
        self.scpi.bus_trigger().await
    }

    async fn is_armed(&self) -> Result<bool> {
        Ok(self.armed.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockTransport;

    fn generator() -> (SignalGenerator, Arc<MockTransport>) {
        let mock = Arc::new(MockTransport::new("mock"));
        (SignalGenerator::new("gen", mock.clone()), mock)
    }

    #[tokio::test]
    async fn test_connect_sequence() {
        let mock = Arc::new(MockTransport::new("mock"));
        SignalGenerator::connect("gen", mock.clone()).await.unwrap();
        assert_eq!(
            mock.commands(),
            vec![
                "*RST",
                "*CLS",
                "SYST:BEEP:STAT OFF",
                "PHAS:SYNC",
                "ROSC:SOUR INT",
                "TRIG:SOUR BUS",
                "OUTP1:LOAD INF",
                "OUTP2:LOAD INF",
            ]
        );
    }

    #[tokio::test]
    async fn test_apply_converts_millivolts() {
        let (generator, mock) = generator();
        let settings = WaveformSettings::new(WaveformShape::Sine, 1000.0, 50.0, 0.0).with_phase(90.0);
        generator.apply(&settings).await.unwrap();
        assert_eq!(mock.commands(), vec!["APPL:SIN 1000,0.05,0", "PHAS 90"]);
    }

    #[tokio::test]
    async fn test_configure_channel() {
        let (generator, mock) = generator();
        let settings = WaveformSettings::new(WaveformShape::Square, 2000.0, 100.0, 10.0);
        generator.configure_channel(2, &settings).await.unwrap();
        assert_eq!(
            mock.commands(),
            vec!["SOUR2:FUNC SQU", "SOUR2:FREQ 2000", "SOUR2:VOLT 0.1", "SOUR2:VOLT:OFFS 0.01"]
        );
        assert!(generator.configure_channel(3, &settings).await.is_err());
    }

    #[tokio::test]
    async fn test_dc_channel_sets_offset_only() {
        let (generator, mock) = generator();
        let settings = WaveformSettings::new(WaveformShape::Dc, 0.0, 0.0, 250.0);
        generator.configure_channel(1, &settings).await.unwrap();
        generator.apply(&settings).await.unwrap();
        assert_eq!(
            mock.commands(),
            vec!["SOUR1:FUNC DC", "SOUR1:VOLT:OFFS 0.25", "APPL:DC DEF,DEF,0.25"]
        );
    }

    #[tokio::test]
    async fn test_invalid_settings_send_nothing() {
        let (generator, mock) = generator();
        let settings = WaveformSettings::new(WaveformShape::Sine, 0.0, 50.0, 0.0);
        assert!(generator.apply(&settings).await.is_err());
        assert!(mock.commands().is_empty());
    }

    #[tokio::test]
    async fn test_burst_commands() {
        let (generator, mock) = generator();
        generator.configure_burst(Some(20)).await.unwrap();
        generator.configure_burst(None).await.unwrap();
        assert!(generator.configure_burst(Some(0)).await.is_err());
        assert_eq!(
            mock.commands(),
            vec![
                "BURS:STAT ON",
                "BURS:NCYC 20",
                "BURS:MODE TRIG",
                "BURS:STAT ON",
                "BURS:NCYC INF",
                "BURS:MODE TRIG",
            ]
        );
    }

    #[test]
    fn test_arb_codes_scaling() {
        assert_eq!(arb_codes(&[-1.0, 0.0, 1.0]), vec![0, 8191, 16383]);
        assert_eq!(arb_codes(&[-3.0, 2.0]), vec![0, 16383]);
    }

    #[tokio::test]
    async fn test_load_arbitrary() {
        let (generator, mock) = generator();
        generator.load_arbitrary(&[-1.0, 1.0], 50.0, 2000.0).await.unwrap();
        assert_eq!(
            mock.commands(),
            vec![
                "DATA VOLATILE,0,16383",
                "FUNC:USER VOLATILE",
                "FUNC:SHAP USER",
                "VOLT 0.05",
                "FREQ 2000",
            ]
        );
        assert!(generator.load_arbitrary(&[], 50.0, 2000.0).await.is_err());
    }

    #[tokio::test]
    async fn test_trigger_requires_arm() {
        let (generator, mock) = generator();
        let err = generator.trigger().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<BenchError>(), Some(BenchError::NotArmed(_))));

        generator.arm().await.unwrap();
        assert!(generator.is_armed().await.unwrap());
        generator.trigger().await.unwrap();
        assert_eq!(mock.commands(), vec!["*TRG"]);

        generator.disarm();
        assert!(!generator.is_armed().await.unwrap());
    }

    #[test]
    fn test_shape_parsing() {
        assert_eq!("sine".parse::<WaveformShape>().unwrap(), WaveformShape::Sine);
        assert_eq!("SQU".parse::<WaveformShape>().unwrap(), WaveformShape::Square);
        assert!("sawtooth".parse::<WaveformShape>().is_err());
    }
}
