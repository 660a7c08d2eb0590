//! Custom error types for the bench.
//!
//! `BenchError` is the typed error for everything that is decided inside this
//! crate: configuration and input validation, transport selection, instrument
//! replies that do not make sense, timeouts while polling status registers and
//! cancellation of timed outputs. Driver and procedure code works in
//! `anyhow::Result` and converts into `BenchError` where a caller needs to match
//! on the failure (for example, to tell a Ctrl-C apart from a dead instrument).
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment` while reading the TOML file or the
//!   `BENCH_DAQ_` environment overrides.
//! - **`Configuration`**: Semantic problems in a configuration that parsed fine
//!   (duplicate instrument ids, a zero timeout).
//! - **`InvalidInput`**: Values supplied on the command line or in a sweep table
//!   that the hardware must never see (negative dwell, unequal list lengths).
//! - **`Io` / `Csv` / `Wav`**: File handling.
//! - **`Transport`** and **`Instrument`**: Communication failures and nonsense
//!   replies, respectively.
//! - **`Timeout`**: A polled condition never became true.
//! - **`NotArmed`**: A trigger was requested before the device was armed.
//! - **`FeatureNotEnabled`**: A resource needs a transport that was not compiled in.
//! - **`Cancelled`**: An operator stopped a timed operation.

use thiserror::Error;

/// Convenience alias for results using the bench error type.
pub type BenchResult<T> = std::result::Result<T, BenchError>;

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Transport error on {resource}: {message}")]
    Transport { resource: String, message: String },

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Device '{0}' is not armed")]
    NotArmed(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<figment::Error> for BenchError {
    fn from(value: figment::Error) -> Self {
        BenchError::Config(Box::new(value))
    }
}

impl BenchError {
    /// Shorthand for a transport failure on a named resource.
    pub fn transport(resource: impl Into<String>, message: impl Into<String>) -> Self {
        BenchError::Transport {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// True when the error came from an operator stop rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BenchError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_names_resource() {
        let err = BenchError::transport("TCPIP0::10.0.0.5::5025::SOCKET", "connection refused");
        let text = err.to_string();
        assert!(text.contains("TCPIP0::10.0.0.5::5025::SOCKET"));
        assert!(text.contains("connection refused"));
    }

    #[test]
    fn feature_error_mentions_flag() {
        let err = BenchError::FeatureNotEnabled("instrument_visa".into());
        assert!(err.to_string().contains("--features instrument_visa"));
    }

    #[test]
    fn cancelled_is_detected_through_anyhow() {
        let err: anyhow::Error = BenchError::Cancelled.into();
        let bench = err.downcast_ref::<BenchError>();
        assert!(bench.is_some_and(BenchError::is_cancelled));
    }
}
