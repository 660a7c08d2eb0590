//! Keysight E36313A Triple-Output Power Supply Driver
//!
//! Protocol overview:
//! - SCPI over USBTMC or LAN, channels addressed with `(@n)` lists
//! - Fixed mode: `VOLT`/`CURR` setpoints, `OUTP ON|OFF`
//! - List mode: up to 100 steps of voltage/current/dwell, advanced by a bus
//!   trigger, with begin/end-of-step trigger outputs
//! - Data log: voltage and current sampled at a fixed period into internal
//!   memory, started by the same bus trigger as the list
//!
//! # Example Usage
//!
//! ```no_run
//! use bench_daq::hardware::power_supply::PowerSupply;
//! use bench_daq::hardware::mock::MockTransport;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = Arc::new(MockTransport::simulating(
//!         bench_daq::config::InstrumentKind::PowerSupply,
//!         "USB0::0x2A8D::0x1002::MY61005055::0::INSTR",
//!     ));
//!     let psu = PowerSupply::connect("psu", transport).await?;
//!     psu.apply_fixed(1, 3.3, 0.1).await?;
//!     println!("{:.3} V", psu.measure_voltage(1).await?);
//!     psu.turn_off(1).await?;
//!     Ok(())
//! }
//! ```

use crate::error::BenchError;
use crate::hardware::capabilities::{Identify, OutputControl};
use crate::hardware::scpi::{channel_list, format_list, ScpiInstrument};
use crate::hardware::transport::ScpiTransport;
use crate::procedures::sweep::SweepTable;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Questionable-instrument summary condition register for channel 1.
pub const WAIT_TRIGGER_STATUS_QUERY: &str = "STAT:QUES:INST:ISUM1:COND?";

/// Bit 7: data log waiting for trigger. Bit 8: list waiting for trigger.
pub const WAIT_TRIGGER_MASK: u32 = 0x180;

/// Shortest data-log sample period the E36313A accepts, in seconds.
pub const MIN_DATALOG_PERIOD_S: f64 = 0.2;

/// Reject data log periods the instrument cannot sample at.
pub fn check_datalog_period(period: Duration) -> Result<(), BenchError> {
    let period_s = period.as_secs_f64();
    if period_s < MIN_DATALOG_PERIOD_S {
        return Err(BenchError::InvalidInput(format!(
            "data log period {period_s} s is below the {MIN_DATALOG_PERIOD_S} s minimum"
        )));
    }
    Ok(())
}

/// Voltage and current records fetched from the data log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatalogRecords {
    pub voltages: Vec<f64>,
    pub currents: Vec<f64>,
}

impl DatalogRecords {
    /// Split a `FETC:DLOG?` reply: first half voltages, second half currents.
    pub fn from_interleaved_halves(values: &[f64]) -> Result<Self> {
        if values.len() % 2 != 0 {
            return Err(BenchError::Instrument(format!(
                "data log returned an odd number of values ({})",
                values.len()
            ))
            .into());
        }
        let (voltages, currents) = values.split_at(values.len() / 2);
        Ok(Self {
            voltages: voltages.to_vec(),
            currents: currents.to_vec(),
        })
    }

    pub fn len(&self) -> usize {
        self.voltages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voltages.is_empty()
    }
}

/// Driver for the E36313A.
pub struct PowerSupply {
    scpi: ScpiInstrument,
}

impl PowerSupply {
    /// Wrap an open transport without touching the instrument.
    pub fn new(id: impl Into<String>, transport: Arc<dyn ScpiTransport>) -> Self {
        Self {
            scpi: ScpiInstrument::new(id, transport),
        }
    }

    /// Wrap the transport and reset the supply.
    pub async fn connect(id: impl Into<String>, transport: Arc<dyn ScpiTransport>) -> Result<Self> {
        let psu = Self::new(id, transport);
        psu.scpi.reset().await?;
        tracing::info!(id = psu.scpi.id(), resource = psu.scpi.resource(), "power supply connected");
        Ok(psu)
    }

    /// Underlying SCPI session.
    pub fn scpi(&self) -> &ScpiInstrument {
        &self.scpi
    }

    /// Fixed-mode setpoints on one channel, then output on.
    pub async fn apply_fixed(&self, channel: u8, volts: f64, amps: f64) -> Result<()> {
        let ch = channel_list(channel);
        tracing::info!(channel, volts, amps, "applying fixed output");
        self.scpi
            .write_all(&[
                format!("VOLT:MODE FIXED,{ch}"),
                format!("CURR:MODE FIXED,{ch}"),
                format!("VOLT {volts},{ch}"),
                format!("CURR {amps},{ch}"),
                format!("OUTP ON,{ch}"),
            ])
            .await
    }

    pub async fn set_voltage(&self, channel: u8, volts: f64) -> Result<()> {
        self.scpi
            .write(&format!("VOLT {volts},{}", channel_list(channel)))
            .await
    }

    pub async fn set_current(&self, channel: u8, amps: f64) -> Result<()> {
        self.scpi
            .write(&format!("CURR {amps},{}", channel_list(channel)))
            .await
    }

    pub async fn set_channel_output(&self, channel: u8, enabled: bool) -> Result<()> {
        let state = if enabled { "ON" } else { "OFF" };
        self.scpi
            .write(&format!("OUTP {state},{}", channel_list(channel)))
            .await
    }

    /// `MEAS:VOLT? (@ch)`
    pub async fn measure_voltage(&self, channel: u8) -> Result<f64> {
        self.scpi
            .query_f64(&format!("MEAS:VOLT? {}", channel_list(channel)))
            .await
    }

    /// `MEAS:CURR? (@ch)`
    pub async fn measure_current(&self, channel: u8) -> Result<f64> {
        self.scpi
            .query_f64(&format!("MEAS:CURR? {}", channel_list(channel)))
            .await
    }

    /// Output off, then both setpoints to zero.
    pub async fn turn_off(&self, channel: u8) -> Result<()> {
        let ch = channel_list(channel);
        tracing::info!(channel, "turning output off");
        self.scpi
            .write_all(&[
                format!("OUTP OFF,{ch}"),
                format!("VOLT 0,{ch}"),
                format!("CURR 0,{ch}"),
            ])
            .await
    }

    /// Program a list sequence and put the channel in bus-triggered list mode.
    pub async fn load_list(&self, channel: u8, table: &SweepTable) -> Result<()> {
        table.validate()?;
        let ch = channel_list(channel);
        tracing::info!(channel, steps = table.len(), "loading list");
        self.scpi
            .write_all(&[
                format!("LIST:VOLT {},{ch}", format_list(&table.voltages)),
                format!("LIST:CURR {},{ch}", format_list(&table.currents)),
                format!("LIST:DWEL {},{ch}", format_list(&table.dwells)),
                format!("LIST:TOUT:BOST {},{ch}", format_flags(&table.begin_of_step)),
                format!("LIST:TOUT:EOST {},{ch}", format_flags(&table.end_of_step)),
                format!("VOLT:MODE LIST,{ch}"),
                format!("CURR:MODE LIST,{ch}"),
                format!("TRIG:SOUR BUS,{ch}"),
                format!("LIST:COUN 1,{ch}"),
                format!("LIST:STEP AUTO,{ch}"),
            ])
            .await
    }

    /// Configure the data log to record voltage and current on a bus trigger.
    pub async fn configure_datalog(&self, channel: u8, duration: Duration, period: Duration) -> Result<()> {
        check_datalog_period(period)?;
        let period_s = period.as_secs_f64();
        let ch = channel_list(channel);
        self.scpi
            .write_all(&[
                format!("SENS:DLOG:FUNC:VOLT 1,{ch}"),
                format!("SENS:DLOG:FUNC:CURR 1,{ch}"),
                format!("SENS:DLOG:TIME {}", duration.as_secs_f64()),
                format!("SENS:DLOG:PER {period_s}"),
                "TRIG:DLOG:SOUR BUS".to_string(),
            ])
            .await
    }

    /// `INIT (@ch)`: list waits for trigger.
    pub async fn initiate_list(&self, channel: u8) -> Result<()> {
        self.scpi.write(&format!("INIT {}", channel_list(channel))).await
    }

    /// Start the data log into `file` on the instrument's external storage.
    pub async fn initiate_datalog(&self, file: &str) -> Result<()> {
        self.scpi
            .write(&format!("INIT:DLOG \"External:\\{file}\""))
            .await
    }

    /// Poll until both the list and the data log wait for trigger.
    pub async fn wait_for_trigger_state(&self, interval: Duration, attempts: u32) -> Result<u32> {
        self.scpi
            .poll_until(WAIT_TRIGGER_STATUS_QUERY, WAIT_TRIGGER_MASK, attempts, interval)
            .await
    }

    /// Fetch `count` records (voltage and current) from the data log.
    pub async fn fetch_datalog(&self, channel: u8, count: usize) -> Result<DatalogRecords> {
        let values = self
            .scpi
            .query_ascii_values(&format!("FETC:DLOG? {},{}", 2 * count, channel_list(channel)))
            .await?;
        let records = DatalogRecords::from_interleaved_halves(&values)?;
        if records.len() != count {
            tracing::warn!(expected = count, got = records.len(), "short data log");
        }
        Ok(records)
    }

    /// `ABOR (@ch)`
    pub async fn abort(&self, channel: u8) -> Result<()> {
        self.scpi.write(&format!("ABOR {}", channel_list(channel))).await
    }

    pub async fn bus_trigger(&self) -> Result<()> {
        self.scpi.bus_trigger().await
    }

    pub async fn drain_errors(&self) -> Result<Vec<String>> {
        self.scpi.drain_errors().await
    }
}

fn format_flags(flags: &[bool]) -> String {
    flags
        .iter()
        .map(|f| if *f { "1" } else { "0" })
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl Identify for PowerSupply {
    async fn identify(&self) -> Result<String> {
        self.scpi.identify().await
    }

    async fn reset(&self) -> Result<()> {
        self.scpi.reset().await
    }
}

/// Acts on all three outputs.
#[async_trait]
impl OutputControl for PowerSupply {
    async fn set_output(&self, enabled: bool) -> Result<()> {
        let state = if enabled { "ON" } else { "OFF" };
        self.scpi.write(&format!("OUTP {state},(@1:3)")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockTransport;

    fn supply(mock: MockTransport) -> (PowerSupply, Arc<MockTransport>) {
        let mock = Arc::new(mock);
        (PowerSupply::new("psu", mock.clone()), mock)
    }

    #[tokio::test]
    async fn test_apply_fixed_sequence() {
        let (psu, mock) = supply(MockTransport::new("mock"));
        psu.apply_fixed(1, 3.3, 0.05).await.unwrap();
        assert_eq!(
            mock.commands(),
            vec![
                "VOLT:MODE FIXED,(@1)",
                "CURR:MODE FIXED,(@1)",
                "VOLT 3.3,(@1)",
                "CURR 0.05,(@1)",
                "OUTP ON,(@1)",
            ]
        );
    }

    #[tokio::test]
    async fn test_turn_off_order() {
        let (psu, mock) = supply(MockTransport::new("mock"));
        psu.turn_off(2).await.unwrap();
        assert_eq!(mock.commands(), vec!["OUTP OFF,(@2)", "VOLT 0,(@2)", "CURR 0,(@2)"]);
    }

    #[tokio::test]
    async fn test_load_list_commands() {
        let (psu, mock) = supply(MockTransport::new("mock"));
        let table = SweepTable::new(vec![0.1, 0.2], vec![1.2, 1.2], vec![0.5, 0.5])
            .unwrap()
            .with_trigger_outputs(vec![true, false], vec![false, true])
            .unwrap();
        psu.load_list(1, &table).await.unwrap();

        let cmds = mock.commands();
        assert_eq!(cmds[0], "LIST:VOLT 0.1,0.2,(@1)");
        assert_eq!(cmds[2], "LIST:DWEL 0.5,0.5,(@1)");
        assert_eq!(cmds[3], "LIST:TOUT:BOST 1,0,(@1)");
        assert_eq!(cmds[4], "LIST:TOUT:EOST 0,1,(@1)");
        assert!(cmds.contains(&"TRIG:SOUR BUS,(@1)".to_string()));
        assert_eq!(cmds.last().unwrap(), "LIST:STEP AUTO,(@1)");
    }

    #[tokio::test]
    async fn test_datalog_period_minimum() {
        let (psu, mock) = supply(MockTransport::new("mock"));
        let err = psu
            .configure_datalog(1, Duration::from_secs(1), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<BenchError>(), Some(BenchError::InvalidInput(_))));
        assert!(mock.commands().is_empty());

        psu.configure_datalog(1, Duration::from_secs(2), Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(mock.commands()[2], "SENS:DLOG:TIME 2");
        assert_eq!(mock.commands()[3], "SENS:DLOG:PER 0.2");
        assert_eq!(mock.commands()[4], "TRIG:DLOG:SOUR BUS");
    }

    #[tokio::test]
    async fn test_initiate_datalog_path() {
        let (psu, mock) = supply(MockTransport::new("mock"));
        psu.initiate_datalog("sweep.dlog").await.unwrap();
        assert_eq!(mock.commands(), vec!["INIT:DLOG \"External:\\sweep.dlog\""]);
    }

    #[tokio::test]
    async fn test_fetch_datalog_splits_halves() {
        let mock = MockTransport::new("mock").with_response(
            "FETC:DLOG? 4,(@1)",
            "+1.0E-01,+2.0E-01,+1.0E-04,+2.0E-04",
        );
        let (psu, _) = supply(mock);
        let records = psu.fetch_datalog(1, 2).await.unwrap();
        assert_eq!(records.voltages, vec![0.1, 0.2]);
        assert_eq!(records.currents, vec![1.0e-4, 2.0e-4]);
    }

    #[test]
    fn test_odd_datalog_rejected() {
        assert!(DatalogRecords::from_interleaved_halves(&[1.0, 2.0, 3.0]).is_err());
    }

    #[tokio::test]
    async fn test_wait_for_trigger_state() {
        let mock = MockTransport::new("mock");
        mock.push_response(WAIT_TRIGGER_STATUS_QUERY, "+128");
        mock.push_response(WAIT_TRIGGER_STATUS_QUERY, "+384");
        let (psu, _) = supply(mock);
        let reg = psu.wait_for_trigger_state(Duration::ZERO, 10).await.unwrap();
        assert_eq!(reg & WAIT_TRIGGER_MASK, WAIT_TRIGGER_MASK);
    }

    #[tokio::test]
    async fn test_simulated_measurement() {
        let (psu, _) = supply(MockTransport::simulating(
            crate::config::InstrumentKind::PowerSupply,
            "psu",
        ));
        psu.apply_fixed(1, 2.0, 0.5).await.unwrap();
        let v = psu.measure_voltage(1).await.unwrap();
        let i = psu.measure_current(1).await.unwrap();
        assert!((v - 2.0).abs() < 1e-9);
        assert!((i - 0.002).abs() < 1e-9);
    }
}
