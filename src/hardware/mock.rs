//! Mock SCPI transport
//!
//! Stands in for a real instrument session without any hardware attached. It
//! provides:
//! - a call log of every command and query, for test verification
//! - scripted replies (exact match, with optional sequences, or prefix match)
//! - one-shot failure injection
//! - an optional simulation mode that answers the way a healthy bench does
//!   (identity strings, measured values that follow the programmed setpoints,
//!   data-log contents that follow the programmed list, oscilloscope traces)
//!
//! # Example
//!
//! ```
//! use bench_daq::hardware::mock::MockTransport;
//! use bench_daq::hardware::transport::ScpiTransport;
//!
//! # tokio_test_block_on(async {
//! let mock = MockTransport::new("USB0::1::2::SN::INSTR").with_response("MEAS:VOLT? (@1)", "+1.000E+00");
//! mock.write("VOLT 1,(@1)").await.unwrap();
//! assert_eq!(mock.query("MEAS:VOLT? (@1)").await.unwrap(), "+1.000E+00");
//! assert_eq!(mock.commands(), vec!["VOLT 1,(@1)", "MEAS:VOLT? (@1)"]);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```

use crate::config::InstrumentKind;
use crate::error::BenchError;
use crate::hardware::transport::ScpiTransport;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;

/// Status value reported for `STAT:QUES:INST:ISUM1:COND?` when both the list
/// and the data log wait for a trigger (bits 7 and 8).
pub const SIMULATED_WAIT_TRIGGER_STATUS: u32 = 0x180;

/// Load resistance used by the simulation to derive measured current.
const SIMULATED_LOAD_OHMS: f64 = 1_000.0;

#[derive(Default)]
struct Simulation {
    kind: Option<InstrumentKind>,
    voltage: f64,
    current_limit: f64,
    output_on: bool,
    list_voltages: Vec<f64>,
    list_currents: Vec<f64>,
    list_dwells: Vec<f64>,
    dlog_period: f64,
    waveform_points: usize,
}

impl Simulation {
    fn for_kind(kind: InstrumentKind) -> Self {
        Self {
            kind: Some(kind),
            current_limit: 1.0,
            dlog_period: 0.2,
            waveform_points: 1000,
            ..Default::default()
        }
    }

    fn identity(&self) -> &'static str {
        match self.kind {
            Some(InstrumentKind::PowerSupply) => {
                "Keysight Technologies,E36313A,MY61005055,2.1.0-1.0.4-1.12"
            }
            Some(InstrumentKind::SignalGenerator) => {
                "Agilent Technologies,33522B,MY62004397,5.03-3.15-2.00-58-00"
            }
            Some(InstrumentKind::Smu) => "Keysight Technologies,B2901B,MY65150106,5.0.2010.1",
            Some(InstrumentKind::Oscilloscope) => {
                "KEYSIGHT TECHNOLOGIES,DSOX1204G,MY65120148,02.12.2021071625"
            }
            None => "Simulated,Instrument,0,0",
        }
    }

    fn measured_current(&self, voltage: f64) -> f64 {
        (voltage / SIMULATED_LOAD_OHMS).min(self.current_limit)
    }

    fn observe_write(&mut self, command: &str) {
        let (header, args) = split_command(command);
        let header = header.trim_start_matches(':').to_uppercase();
        let values = numeric_args(args);
        match header.as_str() {
            "VOLT" | "SOUR:VOLT" => {
                if let Some(v) = values.first() {
                    self.voltage = *v;
                }
            }
            "CURR" | "SENS:CURR:PROT" => {
                if let Some(c) = values.first() {
                    self.current_limit = *c;
                }
            }
            "OUTP" | "OUTPUT" => self.output_on = args.trim().to_uppercase().starts_with("ON"),
            "LIST:VOLT" => self.list_voltages = values,
            "LIST:CURR" => self.list_currents = values,
            "LIST:DWEL" => self.list_dwells = values,
            "SENS:DLOG:PER" => {
                if let Some(p) = values.first() {
                    self.dlog_period = *p;
                }
            }
            "WAV:POIN" => {
                if let Some(n) = values.first() {
                    self.waveform_points = *n as usize;
                }
            }
            _ => {}
        }
    }

    fn answer(&self, query: &str) -> Option<String> {
        let (header, args) = split_command(query);
        let header = header.trim_start_matches(':').to_uppercase();
        let reply = match header.as_str() {
            "*IDN?" => self.identity().to_string(),
            "MEAS:VOLT?" => {
                let v = if self.output_on { self.voltage } else { 0.0 };
                format!("{v:+.6E}")
            }
            "MEAS:CURR?" => {
                let v = if self.output_on { self.voltage } else { 0.0 };
                format!("{:+.6E}", self.measured_current(v))
            }
            "STAT:QUES:INST:ISUM1:COND?" => SIMULATED_WAIT_TRIGGER_STATUS.to_string(),
            "FETC:DLOG?" => {
                let total = numeric_args(args).first().copied().unwrap_or(0.0) as usize;
                self.datalog(total / 2)
            }
            "WAV:DATA?" => self.ascii_trace(),
            "WAV:PRE?" => format!(
                "+4,+0,+{},+1,+1.000000E-06,-5.000000E-04,+0,+1.000000E+00,+0.000000E+00,+0",
                self.waveform_points
            ),
            h if h.starts_with("MEASU:IMMED:WAV") => self.ascii_trace(),
            _ => return None,
        };
        Some(reply)
    }

    /// Data log contents: `count` voltages followed by `count` currents.
    fn datalog(&self, count: usize) -> String {
        let mut volts = Vec::with_capacity(count);
        let mut amps = Vec::with_capacity(count);
        for i in 0..count {
            let t = i as f64 * self.dlog_period;
            let mut elapsed = 0.0;
            let mut step = self.list_voltages.len().saturating_sub(1);
            for (idx, dwell) in self.list_dwells.iter().enumerate() {
                elapsed += dwell;
                if t < elapsed {
                    step = idx;
                    break;
                }
            }
            let v = self.list_voltages.get(step).copied().unwrap_or(self.voltage);
            let limit = self.list_currents.get(step).copied().unwrap_or(self.current_limit);
            volts.push(v);
            amps.push((v / SIMULATED_LOAD_OHMS).min(limit));
        }
        volts
            .iter()
            .chain(amps.iter())
            .map(|x| format!("{x:+.6E}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Five cycles of a 50 mV sine as an ASCII definite-length block.
    fn ascii_trace(&self) -> String {
        let n = self.waveform_points.max(1);
        let body = (0..n)
            .map(|i| {
                let phase = 2.0 * PI * 5.0 * i as f64 / n as f64;
                format!("{:+.6E}", 0.05 * phase.sin())
            })
            .collect::<Vec<_>>()
            .join(",");
        let len = body.len().to_string();
        format!("#{}{}{}", len.len(), len, body)
    }
}

/// Split `HEADER args` into its parts.
fn split_command(command: &str) -> (&str, &str) {
    let trimmed = command.trim();
    match trimmed.find(char::is_whitespace) {
        Some(idx) => (&trimmed[..idx], trimmed[idx..].trim()),
        None => (trimmed, ""),
    }
}

/// Numeric arguments of a command, ignoring channel lists and keywords.
fn numeric_args(args: &str) -> Vec<f64> {
    args.split(',')
        .map(str::trim)
        .filter(|a| !a.starts_with("(@"))
        .filter_map(|a| a.parse::<f64>().ok())
        .collect()
}

#[derive(Default)]
struct MockState {
    log: Vec<String>,
    exact: HashMap<String, VecDeque<String>>,
    prefixes: Vec<(String, String)>,
    raw: VecDeque<Vec<u8>>,
    fail_next: bool,
    closed: bool,
    simulation: Option<Simulation>,
}

/// Mock SCPI transport for tests and `--simulate` runs.
pub struct MockTransport {
    resource: String,
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Create a mock that only answers scripted queries, `SYST:ERR?` and `*OPC?`.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Create a mock that behaves like a healthy instrument of `kind`.
    pub fn simulating(kind: InstrumentKind, resource: impl Into<String>) -> Self {
        let mock = Self::new(resource);
        mock.state.lock().simulation = Some(Simulation::for_kind(kind));
        mock
    }

    /// Reply with `response` whenever exactly `query` is asked.
    pub fn with_response(self, query: &str, response: &str) -> Self {
        self.push_response(query, response);
        self
    }

    /// Reply with `response` to any query starting with `prefix`.
    pub fn with_prefix_response(self, prefix: &str, response: &str) -> Self {
        self.state
            .lock()
            .prefixes
            .push((prefix.to_string(), response.to_string()));
        self
    }

    /// Queue a reply for `query`. Replies are consumed in order; the last one sticks.
    pub fn push_response(&self, query: &str, response: &str) {
        self.state
            .lock()
            .exact
            .entry(query.to_string())
            .or_default()
            .push_back(response.to_string());
    }

    /// Queue bytes for the next `read_raw`.
    pub fn push_raw(&self, bytes: &[u8]) {
        self.state.lock().raw.push_back(bytes.to_vec());
    }

    /// Make the next operation fail.
    pub fn fail_next(&self) {
        self.state.lock().fail_next = true;
    }

    /// Every command and query sent so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Commands sent so far that are not queries.
    pub fn writes(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| !c.trim_end().ends_with('?') && !c.contains("? "))
            .collect()
    }

    /// Clear the call log.
    pub fn clear(&self) {
        self.state.lock().log.clear();
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn check_failure(&self, state: &mut MockState, command: &str) -> Result<()> {
        if std::mem::take(&mut state.fail_next) {
            return Err(BenchError::transport(
                &self.resource,
                format!("injected failure on '{command}'"),
            )
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl ScpiTransport for MockTransport {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn write(&self, command: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.log.push(command.to_string());
        self.check_failure(&mut state, command)?;
        if let Some(sim) = state.simulation.as_mut() {
            sim.observe_write(command);
        }
        tracing::trace!(resource = %self.resource, command, "mock write");
        Ok(())
    }

    async fn query(&self, command: &str) -> Result<String> {
        let mut state = self.state.lock();
        state.log.push(command.to_string());
        self.check_failure(&mut state, command)?;

        if let Some(queue) = state.exact.get_mut(command) {
            let reply = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            if let Some(reply) = reply {
                return Ok(reply);
            }
        }

        if let Some((_, reply)) = state
            .prefixes
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
        {
            return Ok(reply.clone());
        }

        if let Some(reply) = state.simulation.as_ref().and_then(|sim| sim.answer(command)) {
            return Ok(reply);
        }

        match command.trim() {
            "SYST:ERR?" | ":SYST:ERR?" => Ok("+0,\"No error\"".to_string()),
            "*OPC?" => Ok("1".to_string()),
            other => Err(BenchError::transport(
                &self.resource,
                format!("no scripted response for '{other}'"),
            )
            .into()),
        }
    }

    async fn read_raw(&self) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        state
            .raw
            .pop_front()
            .ok_or_else(|| BenchError::transport(&self.resource, "nothing to read").into())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_log_and_writes() {
        let mock = MockTransport::new("mock");
        mock.write("*RST").await.unwrap();
        mock.query("SYST:ERR?").await.unwrap();
        mock.write("OUTP ON,(@1)").await.unwrap();

        assert_eq!(mock.commands(), vec!["*RST", "SYST:ERR?", "OUTP ON,(@1)"]);
        assert_eq!(mock.writes(), vec!["*RST", "OUTP ON,(@1)"]);
    }

    #[tokio::test]
    async fn test_response_sequence_sticks_on_last() {
        let mock = MockTransport::new("mock");
        mock.push_response("STAT?", "0");
        mock.push_response("STAT?", "384");

        assert_eq!(mock.query("STAT?").await.unwrap(), "0");
        assert_eq!(mock.query("STAT?").await.unwrap(), "384");
        assert_eq!(mock.query("STAT?").await.unwrap(), "384");
    }

    #[tokio::test]
    async fn test_unscripted_query_fails() {
        let mock = MockTransport::new("mock");
        assert!(mock.query("MEAS:VOLT?").await.is_err());
    }

    #[tokio::test]
    async fn test_failure_is_one_shot() {
        let mock = MockTransport::new("mock");
        mock.fail_next();
        assert!(mock.write("*RST").await.is_err());
        assert!(mock.write("*RST").await.is_ok());
    }

    #[tokio::test]
    async fn test_simulated_supply_follows_setpoints() {
        let mock = MockTransport::simulating(InstrumentKind::PowerSupply, "psu");
        mock.write("VOLT 2.5,(@1)").await.unwrap();
        mock.write("CURR 0.001,(@1)").await.unwrap();
        mock.write("OUTP ON,(@1)").await.unwrap();

        let v: f64 = mock.query("MEAS:VOLT? (@1)").await.unwrap().parse().unwrap();
        let i: f64 = mock.query("MEAS:CURR? (@1)").await.unwrap().parse().unwrap();
        assert!((v - 2.5).abs() < 1e-9);
        assert!((i - 0.001).abs() < 1e-9, "current limited to 1 mA, got {i}");
    }

    #[tokio::test]
    async fn test_simulated_datalog_follows_list() {
        let mock = MockTransport::simulating(InstrumentKind::PowerSupply, "psu");
        mock.write("LIST:VOLT 0.1,0.2,(@1)").await.unwrap();
        mock.write("LIST:CURR 1.2,1.2,(@1)").await.unwrap();
        mock.write("LIST:DWEL 0.4,0.4,(@1)").await.unwrap();
        mock.write("SENS:DLOG:PER 0.2").await.unwrap();

        let reply = mock.query("FETC:DLOG? 8,(@1)").await.unwrap();
        let values: Vec<f64> = reply.split(',').map(|v| v.parse().unwrap()).collect();
        assert_eq!(values.len(), 8);
        assert_eq!(&values[..4], &[0.1, 0.1, 0.2, 0.2]);
    }

    #[tokio::test]
    async fn test_simulated_scope_block() {
        let mock = MockTransport::simulating(InstrumentKind::Oscilloscope, "scope");
        mock.write(":WAV:POIN 100").await.unwrap();
        let data = mock.query(":WAV:DATA?").await.unwrap();
        assert!(data.starts_with('#'));
        let digits: usize = data[1..2].parse().unwrap();
        let len: usize = data[2..2 + digits].parse().unwrap();
        assert_eq!(data.len(), 2 + digits + len);
    }
}
