//! Power-supply voltage sweeps.
//!
//! Two ways to run the same [`SweepTable`]:
//!
//! - **Stepped**: the host sets each point, waits the dwell and measures.
//!   Timing is only as good as the host's sleep, but every point is read back.
//! - **List mode**: the table is loaded into the supply, which steps on its own
//!   after one bus trigger while the internal data log records voltage and
//!   current every `period`.

use crate::config::{duration_from_secs, TimingConfig};
use crate::data::storage;
use crate::error::{BenchError, BenchResult};
use crate::hardware::power_supply::{self, DatalogRecords, PowerSupply};
use crate::procedures::countdown::CancelToken;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// File name handed to `INIT:DLOG` for list sweeps.
pub const DEFAULT_DATALOG_FILE: &str = "list_sweep.dlog";

/// Voltage / current / dwell points with optional step trigger outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepTable {
    pub voltages: Vec<f64>,
    pub currents: Vec<f64>,
    /// Seconds at each step
    pub dwells: Vec<f64>,
    /// Trigger-out pulse at the beginning of each step
    pub begin_of_step: Vec<bool>,
    /// Trigger-out pulse at the end of each step
    pub end_of_step: Vec<bool>,
}

/// One row of a sweep CSV file.
#[derive(Debug, Deserialize)]
struct SweepRow {
    voltage: f64,
    current: f64,
    dwell: f64,
    #[serde(default, deserialize_with = "flag")]
    bost: bool,
    #[serde(default, deserialize_with = "flag")]
    eost: bool,
}

/// Accepts `0`/`1` as well as `true`/`false`; blank is false.
fn flag<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let raw = String::deserialize(deserializer)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "off" => Ok(false),
        "1" | "true" | "on" => Ok(true),
        other => Err(serde::de::Error::custom(format!("not a trigger flag: {other}"))),
    }
}

impl SweepTable {
    /// Build a table with no step trigger outputs.
    pub fn new(voltages: Vec<f64>, currents: Vec<f64>, dwells: Vec<f64>) -> BenchResult<Self> {
        let n = voltages.len();
        let table = Self {
            voltages,
            currents,
            dwells,
            begin_of_step: vec![false; n],
            end_of_step: vec![false; n],
        };
        table.validate()?;
        Ok(table)
    }

    /// Replace the trigger-out flags. Missing trailing flags are off.
    pub fn with_trigger_outputs(mut self, mut begin_of_step: Vec<bool>, mut end_of_step: Vec<bool>) -> BenchResult<Self> {
        let n = self.len();
        if begin_of_step.len() > n || end_of_step.len() > n {
            return Err(BenchError::InvalidInput(format!(
                "more trigger flags than the {n} sweep steps"
            )));
        }
        begin_of_step.resize(n, false);
        end_of_step.resize(n, false);
        self.begin_of_step = begin_of_step;
        self.end_of_step = end_of_step;
        Ok(self)
    }

    /// Load `voltage,current,dwell[,bost,eost]` rows with a header line.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> BenchResult<Self> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_path(path)?;
        let mut table = Self {
            voltages: Vec::new(),
            currents: Vec::new(),
            dwells: Vec::new(),
            begin_of_step: Vec::new(),
            end_of_step: Vec::new(),
        };
        for row in reader.deserialize::<SweepRow>() {
            let row = row?;
            table.voltages.push(row.voltage);
            table.currents.push(row.current);
            table.dwells.push(row.dwell);
            table.begin_of_step.push(row.bost);
            table.end_of_step.push(row.eost);
        }
        table.validate()?;
        tracing::info!(path = %path.display(), steps = table.len(), "sweep table loaded");
        Ok(table)
    }

    /// Equal, non-empty lists; positive dwells; non-negative setpoints.
    pub fn validate(&self) -> BenchResult<()> {
        let n = self.voltages.len();
        if n == 0 {
            return Err(BenchError::InvalidInput("sweep table is empty".into()));
        }
        let lengths = [
            self.currents.len(),
            self.dwells.len(),
            self.begin_of_step.len(),
            self.end_of_step.len(),
        ];
        if lengths.iter().any(|len| *len != n) {
            return Err(BenchError::InvalidInput(format!(
                "sweep lists differ in length: {n} voltages, {} currents, {} dwells, {} BOST, {} EOST",
                lengths[0], lengths[1], lengths[2], lengths[3]
            )));
        }
        for (step, ((v, c), d)) in self
            .voltages
            .iter()
            .zip(&self.currents)
            .zip(&self.dwells)
            .enumerate()
        {
            if !(d.is_finite() && *d > 0.0) {
                return Err(BenchError::InvalidInput(format!(
                    "step {step}: dwell must be positive, got {d}"
                )));
            }
            if !(v.is_finite() && *v >= 0.0) || !(c.is_finite() && *c >= 0.0) {
                return Err(BenchError::InvalidInput(format!(
                    "step {step}: voltage and current must be non-negative, got {v} V / {c} A"
                )));
            }
        }
        self.total_dwell()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.voltages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voltages.is_empty()
    }

    /// Sum of all dwells.
    pub fn total_dwell(&self) -> BenchResult<Duration> {
        duration_from_secs("total dwell", self.dwells.iter().sum())
    }
}

/// One stepped-sweep point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SweepSample {
    pub set_voltage: f64,
    pub set_current: f64,
    pub dwell: f64,
    pub measured_voltage: f64,
    pub measured_current: f64,
}

/// Host-timed sweep: set, dwell, measure for every step.
///
/// The output is switched off when the sweep ends, fails or is cancelled.
pub async fn run_stepped_sweep(
    psu: &PowerSupply,
    channel: u8,
    table: &SweepTable,
    cancel: &CancelToken,
) -> Result<Vec<SweepSample>> {
    table.validate()?;
    tracing::info!(channel, steps = table.len(), "starting stepped sweep");

    let result = stepped_points(psu, channel, table, cancel).await;
    let off = psu.set_channel_output(channel, false).await;
    let samples = result?;
    off?;
    Ok(samples)
}

async fn stepped_points(
    psu: &PowerSupply,
    channel: u8,
    table: &SweepTable,
    cancel: &CancelToken,
) -> Result<Vec<SweepSample>> {
    psu.set_channel_output(channel, true).await?;
    let mut samples = Vec::with_capacity(table.len());
    for step in 0..table.len() {
        let (v, c, dwell) = (table.voltages[step], table.currents[step], table.dwells[step]);
        psu.set_voltage(channel, v).await?;
        psu.set_current(channel, c).await?;
        tracing::info!(step, volts = v, amps = c, dwell_s = dwell, "sweep step");
        cancel.sleep(duration_from_secs("dwell", dwell)?).await?;

        let sample = SweepSample {
            set_voltage: v,
            set_current: c,
            dwell,
            measured_voltage: psu.measure_voltage(channel).await?,
            measured_current: psu.measure_current(channel).await?,
        };
        tracing::info!(
            step,
            measured_v = sample.measured_voltage,
            measured_a = sample.measured_current,
            "measured"
        );
        samples.push(sample);
    }
    Ok(samples)
}

/// Instrument-timed sweep in list mode, recorded by the data log.
///
/// Returns `Σdwell / period` voltage and current records.
pub async fn run_list_sweep(
    psu: &PowerSupply,
    channel: u8,
    table: &SweepTable,
    period: Duration,
    timing: &TimingConfig,
    cancel: &CancelToken,
) -> Result<DatalogRecords> {
    table.validate()?;
    power_supply::check_datalog_period(period)?;
    let total = table.total_dwell()?;
    let count = (total.as_secs_f64() / period.as_secs_f64() + 1e-9).floor() as usize;
    tracing::info!(
        channel,
        steps = table.len(),
        total_s = total.as_secs_f64(),
        records = count,
        "starting list sweep"
    );

    psu.load_list(channel, table).await?;
    psu.configure_datalog(channel, total, period).await?;
    psu.set_channel_output(channel, true).await?;

    let run = async {
        psu.initiate_list(channel).await?;
        psu.initiate_datalog(DEFAULT_DATALOG_FILE).await?;
        psu.wait_for_trigger_state(timing.trigger_poll(), timing.trigger_poll_attempts)
            .await?;
        psu.bus_trigger().await?;
        cancel.sleep(total.saturating_add(timing.datalog_margin())).await
    };
    if let Err(e) = run.await {
        tracing::error!(error = %e, "list sweep aborted, switching output off");
        psu.abort(channel).await.ok();
        psu.set_channel_output(channel, false).await.ok();
        return Err(e);
    }
    psu.set_channel_output(channel, false).await?;

    let records = psu.fetch_datalog(channel, count).await?;
    psu.drain_errors().await?;
    Ok(records)
}

/// `Set_V,Set_A,Dwell_s,Measured_V,Measured_A`
pub fn write_samples_csv<P: AsRef<Path>>(path: P, samples: &[SweepSample]) -> BenchResult<()> {
    let column = |f: fn(&SweepSample) -> f64| samples.iter().map(f).collect::<Vec<_>>();
    storage::write_columns(
        path,
        &["Set_V", "Set_A", "Dwell_s", "Measured_V", "Measured_A"],
        &[
            &column(|s| s.set_voltage),
            &column(|s| s.set_current),
            &column(|s| s.dwell),
            &column(|s| s.measured_voltage),
            &column(|s| s.measured_current),
        ],
    )
}

/// `Time_s,Voltage_V,Current_A` with the time axis derived from `period`.
pub fn write_datalog_csv<P: AsRef<Path>>(path: P, records: &DatalogRecords, period: Duration) -> BenchResult<()> {
    let times: Vec<f64> = (0..records.len())
        .map(|i| i as f64 * period.as_secs_f64())
        .collect();
    storage::write_columns(
        path,
        &["Time_s", "Voltage_V", "Current_A"],
        &[&times, &records.voltages, &records.currents],
    )
}
