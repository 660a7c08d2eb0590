//! Bench configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/bench.toml`)
//! 2. environment variables prefixed with `BENCH_DAQ_`, nested keys split on `__`
//!
//! Every section has defaults, so an empty file yields a usable (if
//! instrument-less) configuration.
//!
//! # Example
//! ```no_run
//! use bench_daq::config::BenchConfig;
//!
//! let config = BenchConfig::load()?;
//! println!("Bench: {}", config.application.name);
//! # Ok::<(), bench_daq::error::BenchError>(())
//! ```

use crate::error::{BenchError, BenchResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/bench.toml";

/// Top-level bench configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Where result files are written
    #[serde(default)]
    pub storage: StorageConfig,
    /// Sleep-based margins used by the procedures
    #[serde(default)]
    pub timing: TimingConfig,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Result file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output directory for CSV files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

/// Timing margins, all in milliseconds.
///
/// The instruments give no completion handshake for most of these steps, so
/// the procedures sleep for a fixed time instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Wait after switching the secondary generator to the external reference
    #[serde(default = "default_reference_lock_ms")]
    pub reference_lock_ms: u64,
    /// Wait after enabling generator outputs before firing the trigger
    #[serde(default = "default_output_settle_ms")]
    pub output_settle_ms: u64,
    /// Hold time after a trigger when the burst length is infinite
    #[serde(default = "default_burst_hold_ms")]
    pub burst_hold_ms: u64,
    /// Wait after `:RUN` before requesting a single acquisition
    #[serde(default = "default_scope_run_settle_ms")]
    pub scope_run_settle_ms: u64,
    /// Wait after `:SING` before reading the waveform
    #[serde(default = "default_scope_single_wait_ms")]
    pub scope_single_wait_ms: u64,
    /// Interval between wait-for-trigger status polls
    #[serde(default = "default_trigger_poll_ms")]
    pub trigger_poll_ms: u64,
    /// Number of wait-for-trigger status polls before giving up
    #[serde(default = "default_trigger_poll_attempts")]
    pub trigger_poll_attempts: u32,
    /// Extra hold after a supply list run before the data log is fetched
    #[serde(default = "default_datalog_margin_ms")]
    pub datalog_margin_ms: u64,
    /// Interval between analyzer "still running" polls
    #[serde(default = "default_analyzer_poll_ms")]
    pub analyzer_poll_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            reference_lock_ms: default_reference_lock_ms(),
            output_settle_ms: default_output_settle_ms(),
            burst_hold_ms: default_burst_hold_ms(),
            scope_run_settle_ms: default_scope_run_settle_ms(),
            scope_single_wait_ms: default_scope_single_wait_ms(),
            trigger_poll_ms: default_trigger_poll_ms(),
            trigger_poll_attempts: default_trigger_poll_attempts(),
            datalog_margin_ms: default_datalog_margin_ms(),
            analyzer_poll_ms: default_analyzer_poll_ms(),
        }
    }
}

impl TimingConfig {
    /// All margins zero; used by simulations and tests.
    pub fn immediate() -> Self {
        Self {
            reference_lock_ms: 0,
            output_settle_ms: 0,
            burst_hold_ms: 0,
            scope_run_settle_ms: 0,
            scope_single_wait_ms: 0,
            trigger_poll_ms: 0,
            trigger_poll_attempts: default_trigger_poll_attempts(),
            datalog_margin_ms: 0,
            analyzer_poll_ms: 0,
        }
    }

    pub fn reference_lock(&self) -> Duration {
        Duration::from_millis(self.reference_lock_ms)
    }

    pub fn output_settle(&self) -> Duration {
        Duration::from_millis(self.output_settle_ms)
    }

    pub fn burst_hold(&self) -> Duration {
        Duration::from_millis(self.burst_hold_ms)
    }

    pub fn scope_run_settle(&self) -> Duration {
        Duration::from_millis(self.scope_run_settle_ms)
    }

    pub fn scope_single_wait(&self) -> Duration {
        Duration::from_millis(self.scope_single_wait_ms)
    }

    pub fn trigger_poll(&self) -> Duration {
        Duration::from_millis(self.trigger_poll_ms)
    }

    pub fn datalog_margin(&self) -> Duration {
        Duration::from_millis(self.datalog_margin_ms)
    }

    pub fn analyzer_poll(&self) -> Duration {
        Duration::from_millis(self.analyzer_poll_ms)
    }
}

/// A positive number of seconds from a file or the command line as a `Duration`.
///
/// Values too large for a `Duration` are rejected instead of panicking.
pub fn duration_from_secs(what: &str, seconds: f64) -> BenchResult<Duration> {
    if !(seconds.is_finite() && seconds > 0.0) {
        return Err(BenchError::InvalidInput(format!(
            "{what} must be a positive number of seconds, got {seconds}"
        )));
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| BenchError::InvalidInput(format!("{what} of {seconds} s is out of range: {e}")))
}

/// What an instrument entry is used as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    PowerSupply,
    SignalGenerator,
    Smu,
    Oscilloscope,
}

impl InstrumentKind {
    /// Default I/O timeout for this kind of instrument in milliseconds.
    pub fn default_timeout_ms(self) -> u64 {
        match self {
            InstrumentKind::Oscilloscope => 10_000,
            _ => 5_000,
        }
    }
}

impl std::fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InstrumentKind::PowerSupply => "power_supply",
            InstrumentKind::SignalGenerator => "signal_generator",
            InstrumentKind::Smu => "smu",
            InstrumentKind::Oscilloscope => "oscilloscope",
        };
        f.write_str(name)
    }
}

/// Instrument definition in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Unique instrument identifier (e.g. "generator_primary")
    pub id: String,
    /// What the instrument is
    pub kind: InstrumentKind,
    /// VISA resource string
    pub resource: String,
    /// I/O timeout in milliseconds; kind default when absent
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Whether this instrument is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Line terminator appended to every command
    #[serde(default = "default_write_termination")]
    pub write_termination: String,
}

impl InstrumentDefinition {
    /// Build a definition with kind defaults.
    pub fn new(id: impl Into<String>, kind: InstrumentKind, resource: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            resource: resource.into(),
            timeout_ms: None,
            enabled: true,
            write_termination: default_write_termination(),
        }
    }

    /// Effective I/O timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or_else(|| self.kind.default_timeout_ms()))
    }
}

// Default value functions
fn default_name() -> String {
    "ASIC Bench".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_reference_lock_ms() -> u64 {
    1000
}

fn default_output_settle_ms() -> u64 {
    500
}

fn default_burst_hold_ms() -> u64 {
    3000
}

fn default_scope_run_settle_ms() -> u64 {
    500
}

fn default_scope_single_wait_ms() -> u64 {
    1000
}

fn default_trigger_poll_ms() -> u64 {
    100
}

fn default_trigger_poll_attempts() -> u32 {
    10
}

fn default_datalog_margin_ms() -> u64 {
    1000
}

fn default_analyzer_poll_ms() -> u64 {
    100
}

fn default_enabled() -> bool {
    true
}

fn default_write_termination() -> String {
    "\n".to_string()
}

impl BenchConfig {
    /// Load configuration from `config/bench.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `BENCH_DAQ_`.
    /// Example: `BENCH_DAQ_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> BenchResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> BenchResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(BenchConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BENCH_DAQ_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> BenchResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(BenchError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(BenchError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.timing.trigger_poll_attempts == 0 {
            return Err(BenchError::Configuration(
                "timing.trigger_poll_attempts must be at least 1".to_string(),
            ));
        }

        let mut ids = std::collections::HashSet::new();
        for instrument in &self.instruments {
            if !ids.insert(&instrument.id) {
                return Err(BenchError::Configuration(format!(
                    "Duplicate instrument ID: {}",
                    instrument.id
                )));
            }
            if instrument.resource.trim().is_empty() {
                return Err(BenchError::Configuration(format!(
                    "Instrument '{}' has an empty resource string",
                    instrument.id
                )));
            }
            if instrument.timeout_ms == Some(0) {
                return Err(BenchError::Configuration(format!(
                    "Instrument '{}' has a zero timeout",
                    instrument.id
                )));
            }
        }

        Ok(())
    }

    /// Get all enabled instruments
    pub fn enabled_instruments(&self) -> impl Iterator<Item = &InstrumentDefinition> {
        self.instruments.iter().filter(|inst| inst.enabled)
    }

    /// Look up an enabled instrument by id
    pub fn instrument(&self, id: &str) -> BenchResult<&InstrumentDefinition> {
        self.enabled_instruments()
            .find(|inst| inst.id == id)
            .ok_or_else(|| {
                BenchError::Configuration(format!("No enabled instrument with id '{id}'"))
            })
    }

    /// First enabled instrument of a kind
    pub fn find_kind(&self, kind: InstrumentKind) -> BenchResult<&InstrumentDefinition> {
        self.enabled_instruments()
            .find(|inst| inst.kind == kind)
            .ok_or_else(|| {
                BenchError::Configuration(format!("No enabled instrument of kind '{kind}'"))
            })
    }

    /// Resolve an explicit id, falling back to the first instrument of `kind`
    pub fn resolve(
        &self,
        id: Option<&str>,
        kind: InstrumentKind,
    ) -> BenchResult<&InstrumentDefinition> {
        match id {
            Some(id) => self.instrument(id),
            None => self.find_kind(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn bench_with(instruments: Vec<InstrumentDefinition>) -> BenchConfig {
        BenchConfig {
            instruments,
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_validate() {
        let config = BenchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timing.reference_lock_ms, 1000);
        assert_eq!(config.timing.trigger_poll_attempts, 10);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = BenchConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_instrument_ids() {
        let config = bench_with(vec![
            InstrumentDefinition::new("gen", InstrumentKind::SignalGenerator, "USB0::1::2::A::INSTR"),
            InstrumentDefinition::new("gen", InstrumentKind::SignalGenerator, "USB0::1::2::B::INSTR"),
        ]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut psu = InstrumentDefinition::new("psu", InstrumentKind::PowerSupply, "USB0::1::2::A::INSTR");
        psu.timeout_ms = Some(0);
        assert!(bench_with(vec![psu]).validate().is_err());
    }

    #[test]
    fn test_duration_from_secs_bounds() {
        assert_eq!(duration_from_secs("dwell", 1.5).unwrap(), Duration::from_millis(1500));
        assert!(duration_from_secs("dwell", 0.0).is_err());
        assert!(duration_from_secs("dwell", f64::INFINITY).is_err());
        assert!(matches!(
            duration_from_secs("dwell", 1e20),
            Err(BenchError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_kind_timeouts() {
        let scope = InstrumentDefinition::new("scope", InstrumentKind::Oscilloscope, "X");
        let psu = InstrumentDefinition::new("psu", InstrumentKind::PowerSupply, "X");
        assert_eq!(scope.timeout(), Duration::from_secs(10));
        assert_eq!(psu.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_lookup_skips_disabled() {
        let mut first = InstrumentDefinition::new("gen_a", InstrumentKind::SignalGenerator, "A");
        first.enabled = false;
        let second = InstrumentDefinition::new("gen_b", InstrumentKind::SignalGenerator, "B");
        let config = bench_with(vec![first, second]);

        assert_eq!(config.find_kind(InstrumentKind::SignalGenerator).map(|i| i.id.as_str()).ok(), Some("gen_b"));
        assert!(config.instrument("gen_a").is_err());
        assert!(config.find_kind(InstrumentKind::Smu).is_err());
    }

    #[test]
    fn test_load_from_file_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "bench.toml",
                r#"
                [application]
                name = "Amp bench"

                [timing]
                output_settle_ms = 250

                [[instruments]]
                id = "psu"
                kind = "power_supply"
                resource = "USB0::0x2A8D::0x1002::MY61005055::0::INSTR"
                "#,
            )?;
            jail.set_env("BENCH_DAQ_APPLICATION__LOG_LEVEL", "debug");

            let config = BenchConfig::load_from("bench.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.application.name, "Amp bench");
            assert_eq!(config.application.log_level, "debug");
            assert_eq!(config.timing.output_settle_ms, 250);
            assert_eq!(config.timing.reference_lock_ms, 1000);
            assert_eq!(config.instruments.len(), 1);
            assert_eq!(config.instruments[0].kind, InstrumentKind::PowerSupply);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        Jail::expect_with(|_jail| {
            let config = BenchConfig::load_from("absent.toml").map_err(|e| e.to_string())?;
            assert!(config.instruments.is_empty());
            assert_eq!(config.storage.output_dir, PathBuf::from("data"));
            Ok(())
        });
    }
}
