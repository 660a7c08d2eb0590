//! Hold an output for a fixed time, then switch it off.
//!
//! The output is turned off whether the countdown finishes, is cancelled or
//! the instrument reports an error.

use crate::error::BenchError;
use crate::hardware::power_supply::PowerSupply;
use crate::hardware::smu::Smu;
use crate::procedures::countdown::{CancelToken, Countdown};
use anyhow::Result;
use std::future::Future;
use std::time::Duration;

/// Fixed-output request for one supply channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupplyOutput {
    pub channel: u8,
    pub volts: f64,
    pub amps: f64,
    pub duration: Duration,
}

/// Voltage-source request for the SMU.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmuOutput {
    pub volts: f64,
    pub compliance_a: f64,
    pub duration: Duration,
}

fn require_positive(name: &str, value: f64) -> Result<(), BenchError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(BenchError::InvalidInput(format!("{name} must be positive, got {value}")))
    }
}

impl SupplyOutput {
    pub fn validate(&self) -> Result<(), BenchError> {
        require_positive("voltage", self.volts)?;
        require_positive("current", self.amps)?;
        require_positive("duration", self.duration.as_secs_f64())
    }
}

impl SmuOutput {
    pub fn validate(&self) -> Result<(), BenchError> {
        require_positive("voltage", self.volts)?;
        require_positive("compliance current", self.compliance_a)?;
        require_positive("duration", self.duration.as_secs_f64())
    }
}

/// Run `hold` and then `off`, returning the first error.
async fn hold_then_off<H, O>(hold: H, off: O) -> Result<()>
where
    H: Future<Output = Result<()>>,
    O: Future<Output = Result<()>>,
{
    let held = hold.await;
    let off = off.await;
    held.and(off)
}

/// Apply a fixed voltage/current, count down `duration`, turn the channel off.
pub async fn hold_supply_output<F>(
    psu: &PowerSupply,
    request: &SupplyOutput,
    tick: Duration,
    cancel: &CancelToken,
    on_tick: F,
) -> Result<()>
where
    F: FnMut(Duration),
{
    request.validate()?;
    tracing::info!(
        channel = request.channel,
        volts = request.volts,
        amps = request.amps,
        duration_s = request.duration.as_secs_f64(),
        "holding supply output"
    );
    hold_then_off(
        async {
            psu.apply_fixed(request.channel, request.volts, request.amps)
                .await?;
            Countdown::new(request.duration)
                .with_tick(tick)
                .run(cancel, on_tick)
                .await
        },
        psu.turn_off(request.channel),
    )
    .await
}

/// Source a voltage with compliance, count down `duration`, turn the SMU off.
pub async fn hold_smu_output<F>(
    smu: &Smu,
    request: &SmuOutput,
    tick: Duration,
    cancel: &CancelToken,
    on_tick: F,
) -> Result<()>
where
    F: FnMut(Duration),
{
    request.validate()?;
    tracing::info!(
        volts = request.volts,
        compliance_a = request.compliance_a,
        duration_s = request.duration.as_secs_f64(),
        "holding SMU output"
    );
    hold_then_off(
        async {
            smu.source_voltage(request.volts, request.compliance_a).await?;
            let current = smu.measure_current().await?;
            tracing::info!(current_a = current, "SMU current");
            Countdown::new(request.duration)
                .with_tick(tick)
                .run(cancel, on_tick)
                .await
        },
        smu.turn_off(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstrumentKind;
    use crate::hardware::mock::MockTransport;
    use crate::procedures::countdown::CancelHandle;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_supply_hold_sequence() {
        let mock = Arc::new(MockTransport::simulating(InstrumentKind::PowerSupply, "sim"));
        let psu = PowerSupply::new("psu", mock.clone());
        let request = SupplyOutput {
            channel: 1,
            volts: 3.3,
            amps: 0.1,
            duration: Duration::from_secs(2),
        };
        let mut ticks = Vec::new();
        hold_supply_output(&psu, &request, Duration::from_secs(1), &CancelToken::never(), |r| {
            ticks.push(r.as_secs())
        })
        .await
        .unwrap();

        assert_eq!(ticks, vec![2, 1, 0]);
        assert_eq!(
            mock.writes(),
            vec![
                "VOLT:MODE FIXED,(@1)",
                "CURR:MODE FIXED,(@1)",
                "VOLT 3.3,(@1)",
                "CURR 0.1,(@1)",
                "OUTP ON,(@1)",
                "OUTP OFF,(@1)",
                "VOLT 0,(@1)",
                "CURR 0,(@1)",
            ]
        );
    }

    #[tokio::test]
    async fn test_supply_rejects_non_positive_inputs() {
        let mock = Arc::new(MockTransport::new("mock"));
        let psu = PowerSupply::new("psu", mock.clone());
        let request = SupplyOutput {
            channel: 1,
            volts: 0.0,
            amps: 0.1,
            duration: Duration::from_secs(1),
        };
        assert!(
            hold_supply_output(&psu, &request, Duration::from_secs(1), &CancelToken::never(), |_| {})
                .await
                .is_err()
        );
        assert!(mock.commands().is_empty());
    }

    #[tokio::test]
    async fn test_smu_cancelled_still_turns_off() {
        let mock = Arc::new(MockTransport::simulating(InstrumentKind::Smu, "sim"));
        let smu = Smu::new("smu", mock.clone());
        let handle = CancelHandle::new();
        handle.cancel();
        let request = SmuOutput {
            volts: 1.0,
            compliance_a: 100e-6,
            duration: Duration::from_secs(30),
        };
        let err = hold_smu_output(&smu, &request, Duration::from_secs(1), &handle.token(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<BenchError>(), Some(BenchError::Cancelled)));
        let writes = mock.writes();
        assert_eq!(&writes[writes.len() - 3..], ["OUTP OFF", "VOLT 0", "CURR 0"]);
    }
}
