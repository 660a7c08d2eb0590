//! Both channels of one generator driving a differential pair.
//!
//! Channel 2 copies channel 1's waveform and runs either in antiphase
//! (complementary outputs) or in phase. A clock is the same routine with a
//! square wave, so a signal generator and a clock generator can be held
//! together with [`run_signal_and_clock`].

use crate::error::BenchError;
use crate::hardware::signal_generator::{SignalGenerator, WaveformSettings, WaveformShape};
use crate::procedures::countdown::CancelToken;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Phase relation between the two channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseMode {
    /// Channel 2 at 180°
    #[default]
    Complementary,
    /// Both channels at 0°
    InPhase,
}

impl PhaseMode {
    /// `(channel 1, channel 2)` phases in degrees.
    pub fn phases(self) -> (f64, f64) {
        match self {
            PhaseMode::Complementary => (0.0, 180.0),
            PhaseMode::InPhase => (0.0, 0.0),
        }
    }
}

impl fmt::Display for PhaseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseMode::Complementary => write!(f, "complementary"),
            PhaseMode::InPhase => write!(f, "in_phase"),
        }
    }
}

impl FromStr for PhaseMode {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "complementary" | "180" | "0/180" => Ok(PhaseMode::Complementary),
            "in_phase" | "in-phase" | "0" | "0/0" => Ok(PhaseMode::InPhase),
            other => Err(BenchError::InvalidInput(format!("unknown phase mode '{other}'"))),
        }
    }
}

/// What one generator should output, and for how long.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DualChannelRequest {
    pub settings: WaveformSettings,
    pub phase: PhaseMode,
    pub duration: Duration,
}

impl DualChannelRequest {
    pub fn new(settings: WaveformSettings, phase: PhaseMode, duration: Duration) -> Self {
        Self {
            settings,
            phase,
            duration,
        }
    }

    /// A square-wave clock.
    pub fn clock(frequency_hz: f64, amplitude_mv: f64, offset_mv: f64, phase: PhaseMode, duration: Duration) -> Self {
        Self::new(
            WaveformSettings::new(WaveformShape::Square, frequency_hz, amplitude_mv, offset_mv),
            phase,
            duration,
        )
    }

    pub fn validate(&self) -> Result<(), BenchError> {
        let secs = self.duration.as_secs_f64();
        if secs <= 0.0 {
            return Err(BenchError::InvalidInput(format!(
                "duration must be positive, got {secs} s"
            )));
        }
        self.settings.validate()
    }
}

/// Configure both channels, hold the outputs for the duration, switch off.
///
/// Outputs are switched off even when the hold is cancelled.
pub async fn run_dual_channel(
    generator: &SignalGenerator,
    request: &DualChannelRequest,
    cancel: &CancelToken,
) -> Result<()> {
    request.validate()?;
    let id = generator.scpi().id().to_string();
    tracing::info!(
        generator = %id,
        shape = %request.settings.shape,
        frequency_hz = request.settings.frequency_hz,
        amplitude_mv = request.settings.amplitude_mv,
        phase = %request.phase,
        duration_s = request.duration.as_secs_f64(),
        "starting dual-channel output"
    );

    let held = async {
        configure_pair(generator, request).await?;
        generator.set_all_outputs(true).await?;
        if request.settings.shape != WaveformShape::Dc {
            generator.sync_phase().await?;
        }
        cancel.sleep(request.duration).await
    }
    .await;
    let off = generator.set_all_outputs(false).await;
    tracing::info!(generator = %id, "dual-channel output off");
    held.and(off)
}

async fn configure_pair(generator: &SignalGenerator, request: &DualChannelRequest) -> Result<()> {
    for channel in [1, 2] {
        generator.configure_channel(channel, &request.settings).await?;
    }
    if request.settings.shape == WaveformShape::Dc {
        return Ok(());
    }
    let (first, second) = request.phase.phases();
    generator.set_channel_phase(1, first).await?;
    generator.set_channel_phase(2, second).await?;
    generator.sync_phase().await
}

/// Hold a signal generator and a clock generator at the same time.
///
/// Both run to completion; the first error is returned.
pub async fn run_signal_and_clock(
    signal: &SignalGenerator,
    signal_request: &DualChannelRequest,
    clock: &SignalGenerator,
    clock_request: &DualChannelRequest,
    cancel: &CancelToken,
) -> Result<()> {
    signal_request.validate()?;
    clock_request.validate()?;
    let (signal_result, clock_result) = tokio::join!(
        run_dual_channel(signal, signal_request, cancel),
        run_dual_channel(clock, clock_request, cancel),
    );
    signal_result.and(clock_result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockTransport;
    use crate::procedures::countdown::CancelHandle;
    use std::sync::Arc;

    fn generator() -> (SignalGenerator, Arc<MockTransport>) {
        let mock = Arc::new(MockTransport::new("mock"));
        (SignalGenerator::new("gen", mock.clone()), mock)
    }

    fn sine() -> WaveformSettings {
        WaveformSettings::new(WaveformShape::Sine, 1000.0, 100.0, 0.0)
    }

    #[tokio::test]
    async fn test_complementary_sequence() {
        let (generator, mock) = generator();
        let request = DualChannelRequest::new(sine(), PhaseMode::Complementary, Duration::from_millis(5));
        run_dual_channel(&generator, &request, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(
            mock.commands(),
            vec![
                "SOUR1:FUNC SIN",
                "SOUR1:FREQ 1000",
                "SOUR1:VOLT 0.1",
                "SOUR1:VOLT:OFFS 0",
                "SOUR2:FUNC SIN",
                "SOUR2:FREQ 1000",
                "SOUR2:VOLT 0.1",
                "SOUR2:VOLT:OFFS 0",
                "SOUR1:PHAS 0",
                "SOUR2:PHAS 180",
                "PHAS:SYNC",
                "OUTP1 ON",
                "OUTP2 ON",
                "PHAS:SYNC",
                "OUTP1 OFF",
                "OUTP2 OFF",
            ]
        );
    }

    #[tokio::test]
    async fn test_dc_skips_phase() {
        let (generator, mock) = generator();
        let dc = WaveformSettings::new(WaveformShape::Dc, 0.0, 0.0, 500.0);
        let request = DualChannelRequest::new(dc, PhaseMode::Complementary, Duration::from_millis(1));
        run_dual_channel(&generator, &request, &CancelToken::never())
            .await
            .unwrap();
        assert!(!mock.commands().iter().any(|c| c.contains("PHAS")));
        assert!(mock.commands().contains(&"SOUR2:VOLT:OFFS 0.5".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_turns_outputs_off() {
        let (generator, mock) = generator();
        let handle = CancelHandle::new();
        handle.cancel();
        let request = DualChannelRequest::new(sine(), PhaseMode::InPhase, Duration::from_secs(60));
        assert!(run_dual_channel(&generator, &request, &handle.token()).await.is_err());
        let commands = mock.commands();
        assert!(commands.contains(&"SOUR2:PHAS 0".to_string()));
        assert_eq!(&commands[commands.len() - 2..], ["OUTP1 OFF", "OUTP2 OFF"]);
    }

    #[tokio::test]
    async fn test_rejects_zero_duration() {
        let (generator, mock) = generator();
        let request = DualChannelRequest::new(sine(), PhaseMode::InPhase, Duration::ZERO);
        assert!(run_dual_channel(&generator, &request, &CancelToken::never()).await.is_err());
        assert!(mock.commands().is_empty());
    }

    #[tokio::test]
    async fn test_signal_and_clock_run_together() {
        let (signal, signal_mock) = generator();
        let (clock, clock_mock) = generator();
        let clock_request =
            DualChannelRequest::clock(10_000.0, 1000.0, 500.0, PhaseMode::Complementary, Duration::from_millis(5));
        let signal_request = DualChannelRequest::new(sine(), PhaseMode::InPhase, Duration::from_millis(5));
        run_signal_and_clock(&signal, &signal_request, &clock, &clock_request, &CancelToken::never())
            .await
            .unwrap();
        assert!(clock_mock.commands().contains(&"SOUR1:FUNC SQU".to_string()));
        assert!(signal_mock.commands().contains(&"SOUR1:FUNC SIN".to_string()));
        assert_eq!(clock_mock.commands().last().unwrap(), "OUTP2 OFF");
    }

    #[test]
    fn test_phase_mode_parse() {
        assert_eq!("complementary".parse::<PhaseMode>().unwrap(), PhaseMode::Complementary);
        assert_eq!("0/0".parse::<PhaseMode>().unwrap(), PhaseMode::InPhase);
        assert!("90".parse::<PhaseMode>().is_err());
    }
}
