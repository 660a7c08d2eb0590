//! Measurement data containers and file storage.

pub mod storage;

use crate::error::{BenchError, BenchResult};
use serde::{Deserialize, Serialize};

/// Equal-length frequency and value arrays.
///
/// Used for noise-density curves and for magnitude/phase views of a transfer
/// function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    pub frequencies: Vec<f64>,
    pub values: Vec<f64>,
}

impl Spectrum {
    pub fn new(frequencies: Vec<f64>, values: Vec<f64>) -> BenchResult<Self> {
        if frequencies.len() != values.len() {
            return Err(BenchError::InvalidInput(format!(
                "spectrum has {} frequencies but {} values",
                frequencies.len(),
                values.len()
            )));
        }
        Ok(Self { frequencies, values })
    }

    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty()
    }

    /// Points strictly below `cutoff_hz`.
    pub fn below(&self, cutoff_hz: f64) -> Self {
        let (frequencies, values) = self
            .frequencies
            .iter()
            .zip(&self.values)
            .filter(|(f, _)| **f < cutoff_hz)
            .map(|(f, v)| (*f, *v))
            .unzip();
        Self { frequencies, values }
    }
}
