//! Keysight B2900 Source-Measure Unit Driver
//!
//! Single-channel voltage source with current compliance. Only the fixed
//! voltage-source mode used on the bench is exposed.

use crate::error::BenchError;
use crate::hardware::capabilities::{Identify, OutputControl};
use crate::hardware::scpi::ScpiInstrument;
use crate::hardware::transport::ScpiTransport;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Driver for a B2901/B2902 SMU.
pub struct Smu {
    scpi: ScpiInstrument,
    output_on: AtomicBool,
}

impl Smu {
    pub fn new(id: impl Into<String>, transport: Arc<dyn ScpiTransport>) -> Self {
        Self {
            scpi: ScpiInstrument::new(id, transport),
            output_on: AtomicBool::new(false),
        }
    }

    pub async fn connect(id: impl Into<String>, transport: Arc<dyn ScpiTransport>) -> Result<Self> {
        let smu = Self::new(id, transport);
        smu.scpi.reset().await?;
        tracing::info!(id = smu.scpi.id(), resource = smu.scpi.resource(), "SMU connected");
        Ok(smu)
    }

    pub fn scpi(&self) -> &ScpiInstrument {
        &self.scpi
    }

    /// Source `volts` with a current compliance of `compliance_a`, output on.
    pub async fn source_voltage(&self, volts: f64, compliance_a: f64) -> Result<()> {
        if !(volts.is_finite() && volts > 0.0) {
            return Err(BenchError::InvalidInput(format!("SMU voltage must be positive, got {volts}")).into());
        }
        if !(compliance_a.is_finite() && compliance_a > 0.0) {
            return Err(BenchError::InvalidInput(format!(
                "SMU current compliance must be positive, got {compliance_a}"
            ))
            .into());
        }
        tracing::info!(volts, compliance_a, "SMU sourcing voltage");
        self.scpi
            .write_all(&[
                ":SOUR:FUNC:MODE VOLT".to_string(),
                "VOLT:MODE FIXED".to_string(),
                "CURR:MODE FIXED".to_string(),
                format!(":SENS:CURR:PROT {compliance_a}"),
                format!("VOLT {volts}"),
                "OUTP ON".to_string(),
            ])
            .await?;
        self.output_on.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn measure_current(&self) -> Result<f64> {
        self.scpi.query_f64(":MEAS:CURR?").await
    }

    pub async fn measure_voltage(&self) -> Result<f64> {
        self.scpi.query_f64(":MEAS:VOLT?").await
    }

    /// Output off, then source levels to zero.
    pub async fn turn_off(&self) -> Result<()> {
        tracing::info!(id = self.scpi.id(), "SMU output off");
        self.scpi.write_all(&["OUTP OFF", "VOLT 0", "CURR 0"]).await?;
        self.output_on.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Identify for Smu {
    async fn identify(&self) -> Result<String> {
        self.scpi.identify().await
    }

    async fn reset(&self) -> Result<()> {
        self.scpi.reset().await
    }
}

#[async_trait]
impl OutputControl for Smu {
    async fn set_output(&self, enabled: bool) -> Result<()> {
        self.scpi
            .write(if enabled { "OUTP ON" } else { "OUTP OFF" })
            .await?;
        self.output_on.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    async fn output_enabled(&self) -> Result<bool> {
        Ok(self.output_on.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstrumentKind;
    use crate::hardware::mock::MockTransport;

    #[tokio::test]
    async fn test_source_voltage_sequence() {
        let mock = Arc::new(MockTransport::new("mock"));
        let smu = Smu::new("smu", mock.clone());
        smu.source_voltage(1.8, 100e-6).await.unwrap();
        assert_eq!(
            mock.commands(),
            vec![
                ":SOUR:FUNC:MODE VOLT",
                "VOLT:MODE FIXED",
                "CURR:MODE FIXED",
                ":SENS:CURR:PROT 0.0001",
                "VOLT 1.8",
                "OUTP ON",
            ]
        );
        assert!(smu.output_enabled().await.unwrap());

        mock.clear();
        smu.turn_off().await.unwrap();
        assert_eq!(mock.commands(), vec!["OUTP OFF", "VOLT 0", "CURR 0"]);
        assert!(!smu.output_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_non_positive_inputs() {
        let mock = Arc::new(MockTransport::new("mock"));
        let smu = Smu::new("smu", mock.clone());
        assert!(smu.source_voltage(0.0, 1e-6).await.is_err());
        assert!(smu.source_voltage(1.0, -1e-6).await.is_err());
        assert!(mock.commands().is_empty());
    }

    #[tokio::test]
    async fn test_simulated_compliance() {
        let mock = Arc::new(MockTransport::simulating(InstrumentKind::Smu, "smu"));
        let smu = Smu::new("smu", mock);
        smu.source_voltage(5.0, 1e-3).await.unwrap();
        let i = smu.measure_current().await.unwrap();
        assert!((i - 1e-3).abs() < 1e-12, "limited to compliance, got {i}");
    }
}
