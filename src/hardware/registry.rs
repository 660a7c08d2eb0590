//! Instrument Registry
//!
//! Opens drivers for the instruments named in the bench configuration. Every
//! lookup goes through an id (or, without one, the first enabled instrument of
//! the wanted kind) and checks the configured kind before a session is opened.
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │                InstrumentRegistry                  │
//! │   BenchConfig.instruments  +  simulate flag        │
//! ├────────────────────────────────────────────────────┤
//! │  open_transport(def, simulate)                     │
//! │   TcpTransport | VisaTransport | MockTransport     │
//! ├────────────────────────────────────────────────────┤
//! │  PowerSupply | SignalGenerator | Smu | Oscilloscope│
//! └────────────────────────────────────────────────────┘
//! ```

use crate::config::{BenchConfig, InstrumentDefinition, InstrumentKind};
use crate::error::BenchError;
use crate::hardware::noise_analyzer::{NoiseAnalyzer, SimulatedNoiseAnalyzer};
use crate::hardware::oscilloscope::Oscilloscope;
use crate::hardware::power_supply::PowerSupply;
use crate::hardware::scpi::ScpiInstrument;
use crate::hardware::signal_generator::SignalGenerator;
use crate::hardware::smu::Smu;
use crate::hardware::transport::{list_resources, open_transport, ScpiTransport};
use anyhow::Result;
use std::sync::Arc;

/// What `list` reports about a configured instrument.
#[derive(Debug, Clone)]
pub struct InstrumentInfo {
    pub id: String,
    pub kind: InstrumentKind,
    pub resource: String,
    /// `*IDN?` reply, or the reason it could not be read
    pub identity: std::result::Result<String, String>,
}

/// Opens configured instruments.
pub struct InstrumentRegistry {
    config: BenchConfig,
    simulate: bool,
}

impl InstrumentRegistry {
    pub fn new(config: BenchConfig, simulate: bool) -> Self {
        Self { config, simulate }
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn is_simulated(&self) -> bool {
        self.simulate
    }

    fn definition(&self, id: Option<&str>, kind: InstrumentKind) -> Result<&InstrumentDefinition> {
        let def = self.config.resolve(id, kind)?;
        if def.kind != kind {
            return Err(BenchError::Configuration(format!(
                "instrument '{}' is a {}, not a {kind}",
                def.id, def.kind
            ))
            .into());
        }
        Ok(def)
    }

    async fn transport(&self, id: Option<&str>, kind: InstrumentKind) -> Result<(String, Arc<dyn ScpiTransport>)> {
        let def = self.definition(id, kind)?;
        let transport = open_transport(def, self.simulate).await?;
        Ok((def.id.clone(), transport))
    }

    pub async fn power_supply(&self, id: Option<&str>) -> Result<PowerSupply> {
        let (id, transport) = self.transport(id, InstrumentKind::PowerSupply).await?;
        PowerSupply::connect(id, transport).await
    }

    pub async fn signal_generator(&self, id: Option<&str>) -> Result<SignalGenerator> {
        let (id, transport) = self.transport(id, InstrumentKind::SignalGenerator).await?;
        SignalGenerator::connect(id, transport).await
    }

    pub async fn smu(&self, id: Option<&str>) -> Result<Smu> {
        let (id, transport) = self.transport(id, InstrumentKind::Smu).await?;
        Smu::connect(id, transport).await
    }

    pub async fn oscilloscope(&self, id: Option<&str>) -> Result<Oscilloscope> {
        let (id, transport) = self.transport(id, InstrumentKind::Oscilloscope).await?;
        Oscilloscope::connect(id, transport).await
    }

    /// The noise analyzer. Only the simulated backend exists.
    pub fn noise_analyzer(&self) -> Result<Arc<dyn NoiseAnalyzer>> {
        if !self.simulate {
            tracing::warn!("no vendor analyzer backend available, using the simulated analyzer");
        }
        Ok(Arc::new(SimulatedNoiseAnalyzer::new()))
    }

    /// Identify every enabled instrument. Failures are reported per instrument.
    pub async fn identify_all(&self) -> Vec<InstrumentInfo> {
        let mut found = Vec::new();
        for def in self.config.enabled_instruments() {
            let identity = match open_transport(def, self.simulate).await {
                Ok(transport) => {
                    let scpi = ScpiInstrument::new(def.id.clone(), transport);
                    let idn = scpi.identify().await.map_err(|e| format!("{e:#}"));
                    scpi.close().await.ok();
                    idn
                }
                Err(e) => Err(format!("{e:#}")),
            };
            found.push(InstrumentInfo {
                id: def.id.clone(),
                kind: def.kind,
                resource: def.resource.clone(),
                identity,
            });
        }
        found
    }

    /// Resources visible on this machine.
    pub async fn visible_resources(&self) -> Result<Vec<String>> {
        let configured: Vec<InstrumentDefinition> = self.config.enabled_instruments().cloned().collect();
        list_resources(&configured).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bench() -> BenchConfig {
        BenchConfig {
            instruments: vec![
                InstrumentDefinition::new(
                    "psu",
                    InstrumentKind::PowerSupply,
                    "USB0::0x2A8D::0x1002::MY61005055::0::INSTR",
                ),
                InstrumentDefinition::new(
                    "gen_primary",
                    InstrumentKind::SignalGenerator,
                    "USB0::0x0957::0x2707::MY62004397::0::INSTR",
                ),
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_opens_by_kind_when_simulated() {
        let registry = InstrumentRegistry::new(bench(), true);
        let psu = registry.power_supply(None).await.unwrap();
        assert_eq!(psu.scpi().id(), "psu");
        let generator = registry.signal_generator(Some("gen_primary")).await.unwrap();
        assert_eq!(generator.scpi().id(), "gen_primary");
    }

    #[tokio::test]
    async fn test_kind_mismatch_rejected() {
        let registry = InstrumentRegistry::new(bench(), true);
        let err = registry.power_supply(Some("gen_primary")).await.err().unwrap();
        assert!(err.to_string().contains("not a power_supply"));
        assert!(registry.smu(None).await.is_err());
    }

    #[tokio::test]
    async fn test_identify_all_simulated() {
        let registry = InstrumentRegistry::new(bench(), true);
        let infos = registry.identify_all().await;
        assert_eq!(infos.len(), 2);
        assert!(infos[0].identity.as_ref().unwrap().contains("E36313A"));
        assert!(infos[1].identity.as_ref().unwrap().contains("33522B"));
    }
}
