//! Open-loop gain and gain-bandwidth product from paired samples.

use crate::error::{BenchError, BenchResult};

/// Weight of the standard deviation in the "typical" gain (≈ 68th percentile).
pub const TYPICAL_STD_WEIGHT: f64 = 0.47;

/// Summary of an element-wise gain measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainSummary {
    pub mean: f64,
    /// Population standard deviation
    pub std_dev: f64,
    /// `mean + 0.47 * std_dev`
    pub typical: f64,
    pub min: f64,
}

/// Output/input ratio of two equal-length recordings.
#[derive(Debug, Clone)]
pub struct OpenLoopGain {
    input: Vec<f64>,
    output: Vec<f64>,
}

impl OpenLoopGain {
    pub fn new(input: Vec<f64>, output: Vec<f64>) -> Self {
        Self { input, output }
    }

    /// Element-wise gain.
    pub fn gains(&self) -> BenchResult<Vec<f64>> {
        if self.input.len() != self.output.len() {
            return Err(BenchError::InvalidInput(format!(
                "Input and output signals must have the same length ({} vs {})",
                self.input.len(),
                self.output.len()
            )));
        }
        if self.input.is_empty() {
            return Err(BenchError::InvalidInput("no samples to measure".into()));
        }
        if let Some(i) = self.input.iter().position(|v| *v == 0.0) {
            return Err(BenchError::InvalidInput(format!("input sample {i} is zero")));
        }
        Ok(self
            .output
            .iter()
            .zip(&self.input)
            .map(|(y, x)| y / x)
            .collect())
    }

    pub fn measure(&self) -> BenchResult<GainSummary> {
        let gains = self.gains()?;
        let summary = summarize(&gains);
        tracing::info!(
            mean = summary.mean,
            typical = summary.typical,
            min = summary.min,
            "open-loop gain"
        );
        Ok(summary)
    }
}

fn summarize(gains: &[f64]) -> GainSummary {
    let n = gains.len() as f64;
    let mean = gains.iter().sum::<f64>() / n;
    let std_dev = (gains.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / n).sqrt();
    GainSummary {
        mean,
        std_dev,
        typical: mean + TYPICAL_STD_WEIGHT * std_dev,
        min: gains.iter().copied().fold(f64::INFINITY, f64::min),
    }
}

/// `n` evenly spaced points from `start` to `stop` inclusive.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => (0..n)
            .map(|i| start + (stop - start) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

/// Gain measured against a frequency axis.
#[derive(Debug, Clone)]
pub struct GainBandwidthProduct {
    gain: OpenLoopGain,
    frequencies: Vec<f64>,
}

impl GainBandwidthProduct {
    /// With no frequency axis, `linspace(1, 1000, n)` is assumed.
    pub fn new(input: Vec<f64>, output: Vec<f64>, frequencies: Option<Vec<f64>>) -> Self {
        let frequencies = frequencies
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| linspace(1.0, 1000.0, input.len()));
        Self {
            gain: OpenLoopGain::new(input, output),
            frequencies,
        }
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    /// Frequency at which the gain first drops to typical/√2 (−3 dB), or the
    /// last frequency when it never does.
    pub fn bandwidth(&self) -> BenchResult<f64> {
        let gains = self.gain.gains()?;
        if gains.len() != self.frequencies.len() {
            return Err(BenchError::InvalidInput(format!(
                "{} gain points for {} frequencies",
                gains.len(),
                self.frequencies.len()
            )));
        }
        let threshold = summarize(&gains).typical / std::f64::consts::SQRT_2;
        let index = gains
            .iter()
            .position(|g| *g <= threshold)
            .unwrap_or(gains.len() - 1);
        Ok(self.frequencies[index])
    }

    /// Typical gain × bandwidth.
    pub fn product(&self) -> BenchResult<f64> {
        let summary = self.gain.measure()?;
        let bandwidth = self.bandwidth()?;
        let gbp = summary.typical * bandwidth;
        tracing::info!(typical_gain = summary.typical, bandwidth_hz = bandwidth, gbp, "gain-bandwidth product");
        Ok(gbp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_gain() {
        let input = vec![0.1, 0.2, -0.3];
        let output: Vec<f64> = input.iter().map(|x| 100.0 * x).collect();
        let summary = OpenLoopGain::new(input, output).measure().unwrap();
        assert!((summary.mean - 100.0).abs() < 1e-9);
        assert!(summary.std_dev < 1e-9);
        assert!((summary.typical - 100.0).abs() < 1e-9);
        assert!((summary.min - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_typical_uses_population_std() {
        // Gains 1 and 3: mean 2, population std 1
        let summary = OpenLoopGain::new(vec![1.0, 1.0], vec![1.0, 3.0]).measure().unwrap();
        assert!((summary.std_dev - 1.0).abs() < 1e-12);
        assert!((summary.typical - 2.47).abs() < 1e-12);
        assert_eq!(summary.min, 1.0);
    }

    #[test]
    fn test_length_mismatch_and_zero_input() {
        assert!(OpenLoopGain::new(vec![1.0], vec![1.0, 2.0]).measure().is_err());
        assert!(OpenLoopGain::new(vec![], vec![]).measure().is_err());
        assert!(OpenLoopGain::new(vec![1.0, 0.0], vec![1.0, 1.0]).measure().is_err());
    }

    #[test]
    fn test_linspace() {
        let f = linspace(1.0, 1000.0, 4);
        assert_eq!(f, vec![1.0, 334.0, 667.0, 1000.0]);
        assert_eq!(linspace(1.0, 2.0, 1), vec![1.0]);
    }

    #[test]
    fn test_gbp_rolloff() {
        // Single-pole roll-off, 100 V/V, corner at 200 Hz
        let freqs = linspace(1.0, 1000.0, 1000);
        let gains: Vec<f64> = freqs.iter().map(|f| 100.0 / (1.0 + (f / 200.0).powi(2)).sqrt()).collect();
        let input = vec![0.01; freqs.len()];
        let output: Vec<f64> = gains.iter().map(|g| g * 0.01).collect();
        let gbp = GainBandwidthProduct::new(input, output, Some(freqs));

        let bw = gbp.bandwidth().unwrap();
        let typical = OpenLoopGain::new(vec![0.01; 1000], gains.iter().map(|g| g * 0.01).collect())
            .measure()
            .unwrap()
            .typical;
        let expected_bw = 200.0 * ((100.0 / (typical / std::f64::consts::SQRT_2)).powi(2) - 1.0).sqrt();
        assert!((bw - expected_bw).abs() <= 1.0 + 1e-9, "bw {bw}, expected {expected_bw}");
        assert!((gbp.product().unwrap() - typical * bw).abs() < 1e-9);
    }

    #[test]
    fn test_gbp_flat_uses_last_frequency() {
        let gbp = GainBandwidthProduct::new(vec![1.0; 5], vec![10.0; 5], None);
        assert_eq!(gbp.frequencies().len(), 5);
        assert_eq!(gbp.bandwidth().unwrap(), 1000.0);
        assert!((gbp.product().unwrap() - 10_000.0).abs() < 1e-9);
    }
}
