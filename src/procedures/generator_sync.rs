//! Two generators locked to one reference and fired by one trigger.
//!
//! ```text
//!  primary (ROSC INT, TRIG BUS) ── 10 MHz Ref Out ──▶ secondary (ROSC EXT)
//!          Trig Out ───────────────────────────────▶  Trig In (TRIG EXT)
//! ```
//!
//! `*TRG` on the primary starts its burst and, through Trig Out, the
//! secondary's burst on the same reference edge.

use crate::config::{duration_from_secs, TimingConfig};
use crate::error::{BenchError, BenchResult};
use crate::hardware::capabilities::{OutputControl, Triggerable};
use crate::hardware::signal_generator::{ReferenceSource, SignalGenerator, TriggerSource, WaveformSettings};
use crate::procedures::countdown::CancelToken;
use anyhow::Result;
use std::time::Duration;

/// Default phase of the secondary relative to the primary, degrees.
pub const DEFAULT_PHASE_OFFSET_DEG: f64 = 180.0;

/// Burst parameters shared by both generators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BurstSettings {
    pub waveform: WaveformSettings,
    /// Cycles per burst; `None` bursts until the outputs are switched off
    pub cycles: Option<u32>,
    /// Secondary phase = primary phase + offset (mod 360)
    pub phase_offset_deg: f64,
}

impl BurstSettings {
    pub fn new(waveform: WaveformSettings, cycles: Option<u32>) -> Self {
        Self {
            waveform,
            cycles,
            phase_offset_deg: DEFAULT_PHASE_OFFSET_DEG,
        }
    }

    pub fn with_phase_offset(mut self, offset_deg: f64) -> Self {
        self.phase_offset_deg = offset_deg;
        self
    }

    /// Phase programmed into the secondary.
    pub fn secondary_phase(&self) -> f64 {
        (self.waveform.phase_deg + self.phase_offset_deg).rem_euclid(360.0)
    }

    /// How long one burst lasts, or `fallback` for infinite bursts.
    pub fn hold(&self, fallback: Duration) -> BenchResult<Duration> {
        match self.cycles {
            Some(n) => duration_from_secs("burst length", f64::from(n) / self.waveform.frequency_hz),
            None => Ok(fallback),
        }
    }
}

/// Error-queue contents read around a synchronized run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorSnapshot {
    pub primary: Vec<String>,
    pub secondary: Vec<String>,
}

impl ErrorSnapshot {
    pub fn is_clean(&self) -> bool {
        self.primary.is_empty() && self.secondary.is_empty()
    }
}

/// Outcome of [`DualGeneratorSync::run`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub bursts: u32,
    pub before: ErrorSnapshot,
    pub after: ErrorSnapshot,
}

/// A primary/secondary generator pair.
pub struct DualGeneratorSync {
    primary: SignalGenerator,
    secondary: SignalGenerator,
    timing: TimingConfig,
}

impl DualGeneratorSync {
    pub fn new(primary: SignalGenerator, secondary: SignalGenerator, timing: TimingConfig) -> Self {
        Self {
            primary,
            secondary,
            timing,
        }
    }

    pub fn primary(&self) -> &SignalGenerator {
        &self.primary
    }

    pub fn secondary(&self) -> &SignalGenerator {
        &self.secondary
    }

    async fn errors(&self) -> Result<ErrorSnapshot> {
        Ok(ErrorSnapshot {
            primary: self.primary.drain_errors().await?,
            secondary: self.secondary.drain_errors().await?,
        })
    }

    /// Reference, trigger routing, burst and phase setup; outputs on.
    pub async fn arm(&self, burst: &BurstSettings, cancel: &CancelToken) -> Result<()> {
        burst.waveform.validate()?;
        for generator in [&self.primary, &self.secondary] {
            generator.scpi().reset().await?;
            generator.scpi().write("SYST:BEEP:STAT OFF").await?;
        }

        self.primary.set_reference(ReferenceSource::Internal).await?;
        self.primary.set_trigger_source(TriggerSource::Bus).await?;
        self.primary.set_trigger_output(true).await?;
        self.secondary.set_reference(ReferenceSource::External).await?;
        self.secondary.set_trigger_source(TriggerSource::External).await?;
        tracing::info!("waiting for the secondary to lock to the external reference");
        cancel.sleep(self.timing.reference_lock()).await?;

        let secondary_waveform = burst.waveform.with_phase(burst.secondary_phase());
        for (generator, waveform) in [
            (&self.primary, &burst.waveform),
            (&self.secondary, &secondary_waveform),
        ] {
            generator.set_output(false).await?;
            generator.apply(waveform).await?;
            generator.configure_burst(burst.cycles).await?;
        }
        for generator in [&self.primary, &self.secondary] {
            generator.sync_phase().await?;
        }
        for generator in [&self.primary, &self.secondary] {
            generator.set_output(true).await?;
            generator.arm().await?;
        }
        tracing::info!(
            primary_phase = burst.waveform.phase_deg,
            secondary_phase = burst.secondary_phase(),
            cycles = ?burst.cycles,
            "generators armed"
        );
        cancel.sleep(self.timing.output_settle()).await
    }

    /// One bus trigger on the primary, then wait out the burst.
    pub async fn fire(&self, burst: &BurstSettings, cancel: &CancelToken) -> Result<()> {
        self.primary.trigger().await?;
        let hold = burst.hold(self.timing.burst_hold())?;
        tracing::info!(hold_s = hold.as_secs_f64(), "burst fired");
        cancel.sleep(hold).await
    }

    /// Both outputs off.
    pub async fn disarm(&self) -> Result<()> {
        self.primary.disarm();
        self.secondary.disarm();
        let primary = self.primary.set_output(false).await;
        let secondary = self.secondary.set_output(false).await;
        tracing::info!("generators disarmed");
        primary.and(secondary)
    }

    /// Arm once, fire `bursts` times, always disarm.
    pub async fn run(&self, burst: &BurstSettings, bursts: u32, cancel: &CancelToken) -> Result<SyncReport> {
        if bursts == 0 {
            return Err(BenchError::InvalidInput("burst count must be at least 1".into()).into());
        }
        burst.waveform.validate()?;
        burst.hold(self.timing.burst_hold())?;
        let before = self.errors().await?;

        let fired = async {
            self.arm(burst, cancel).await?;
            for n in 1..=bursts {
                tracing::debug!(burst = n, of = bursts, "firing");
                self.fire(burst, cancel).await?;
            }
            Ok::<_, anyhow::Error>(())
        }
        .await;
        let disarmed = self.disarm().await;
        fired?;
        disarmed?;

        let after = self.errors().await?;
        if !after.is_clean() {
            tracing::warn!(?after, "generators reported errors during the run");
        }
        Ok(SyncReport { bursts, before, after })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockTransport;
    use crate::hardware::signal_generator::WaveformShape;
    use std::sync::Arc;

    fn pair() -> (DualGeneratorSync, Arc<MockTransport>, Arc<MockTransport>) {
        let primary = Arc::new(MockTransport::new("primary"));
        let secondary = Arc::new(MockTransport::new("secondary"));
        let sync = DualGeneratorSync::new(
            SignalGenerator::new("gen_primary", primary.clone()),
            SignalGenerator::new("gen_secondary", secondary.clone()),
            TimingConfig::immediate(),
        );
        (sync, primary, secondary)
    }

    fn burst() -> BurstSettings {
        BurstSettings::new(WaveformSettings::new(WaveformShape::Sine, 1000.0, 50.0, 0.0), Some(20))
    }

    #[test]
    fn test_secondary_phase_wraps() {
        let b = burst();
        assert_eq!(b.secondary_phase(), 180.0);
        let mut shifted = b.with_phase_offset(270.0);
        shifted.waveform.phase_deg = 180.0;
        assert_eq!(shifted.secondary_phase(), 90.0);
        assert_eq!(b.with_phase_offset(-90.0).secondary_phase(), 270.0);
    }

    #[test]
    fn test_hold_from_cycles() {
        assert!((burst().hold(Duration::from_secs(3)).unwrap().as_secs_f64() - 0.02).abs() < 1e-9);
        let infinite = BurstSettings::new(burst().waveform, None);
        assert_eq!(infinite.hold(Duration::from_secs(3)).unwrap(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_unrepresentable_burst_length_rejected_before_arming() {
        let (sync, primary, secondary) = pair();
        let slow = BurstSettings::new(WaveformSettings::new(WaveformShape::Sine, 1e-20, 50.0, 0.0), Some(1));
        assert!(matches!(slow.hold(Duration::from_secs(3)), Err(BenchError::InvalidInput(_))));

        let err = sync.run(&slow, 1, &CancelToken::never()).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<BenchError>(), Some(BenchError::InvalidInput(_))));
        assert!(primary.commands().is_empty());
        assert!(secondary.commands().is_empty());
    }

    #[tokio::test]
    async fn test_arm_routes_reference_and_trigger() {
        let (sync, primary, secondary) = pair();
        sync.arm(&burst(), &CancelToken::never()).await.unwrap();

        assert_eq!(
            primary.commands(),
            vec![
                "*RST",
                "*CLS",
                "SYST:BEEP:STAT OFF",
                "ROSC:SOUR INT",
                "TRIG:SOUR BUS",
                "OUTP:TRIG ON",
                "OUTP OFF",
                "APPL:SIN 1000,0.05,0",
                "PHAS 0",
                "BURS:STAT ON",
                "BURS:NCYC 20",
                "BURS:MODE TRIG",
                "PHAS:SYNC",
                "OUTP ON",
            ]
        );
        let secondary_commands = secondary.commands();
        assert!(secondary_commands.contains(&"ROSC:SOUR EXT".to_string()));
        assert!(secondary_commands.contains(&"TRIG:SOUR EXT".to_string()));
        assert!(secondary_commands.contains(&"PHAS 180".to_string()));
        assert!(!secondary_commands.contains(&"OUTP:TRIG ON".to_string()));
        assert!(sync.primary().is_armed().await.unwrap());
    }

    #[tokio::test]
    async fn test_fire_requires_arm() {
        let (sync, primary, _) = pair();
        let err = sync.fire(&burst(), &CancelToken::never()).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<BenchError>(), Some(BenchError::NotArmed(_))));
        assert!(primary.commands().is_empty());
    }

    #[tokio::test]
    async fn test_run_triggers_primary_only_and_disarms() {
        let (sync, primary, secondary) = pair();
        let report = sync.run(&burst(), 3, &CancelToken::never()).await.unwrap();
        assert_eq!(report.bursts, 3);
        assert!(report.before.is_clean() && report.after.is_clean());

        let triggers = primary.commands().iter().filter(|c| *c == "*TRG").count();
        assert_eq!(triggers, 3);
        assert!(!secondary.commands().contains(&"*TRG".to_string()));
        assert_eq!(primary.writes().last().unwrap(), "OUTP OFF");
        assert_eq!(secondary.writes().last().unwrap(), "OUTP OFF");
        assert!(!sync.primary().is_armed().await.unwrap());
    }

    #[tokio::test]
    async fn test_run_disarms_when_cancelled() {
        let (sync, primary, secondary) = pair();
        let handle = crate::procedures::countdown::CancelHandle::new();
        handle.cancel();
        let err = sync.run(&burst(), 1, &handle.token()).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<BenchError>(), Some(BenchError::Cancelled)));
        assert!(primary.commands().iter().all(|c| c != "*TRG"));
        assert_eq!(primary.writes().last().unwrap(), "OUTP OFF");
        assert_eq!(secondary.writes().last().unwrap(), "OUTP OFF");
    }

    #[tokio::test]
    async fn test_zero_bursts_rejected() {
        let (sync, primary, _) = pair();
        assert!(sync.run(&burst(), 0, &CancelToken::never()).await.is_err());
        assert!(primary.commands().is_empty());
    }
}
