//! Transfer-function estimation between an input and an output recording.
//!
//! Two estimators are provided:
//!
//! - **FFT**: `H = Y / (X + ε)` over the whole record, ε = 1e-10·max|X|. Only
//!   the positive-frequency bins `k < n/2` are kept, at `k·fs/n`.
//! - **Welch**: `H = Pxy / (Pxx + ε)`, ε = 1e-10·max Pxx, with `Pxy` the
//!   averaged cross spectral density and `Pxx` the averaged power spectral
//!   density of the input. Segments of `nperseg` samples (default `n/8`)
//!   overlap by half, have their mean removed, are windowed, and are scaled to
//!   a one-sided density.
//!
//! Welch trades frequency resolution for a far less noisy estimate and is the
//! one to use for real recordings.

use crate::data::storage;
use crate::data::Spectrum;
use crate::error::{BenchError, BenchResult};
use num_complex::Complex;
use rustfft::FftPlanner;
use std::f64::consts::PI;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Sample rate used when none is given, Hz.
pub const DEFAULT_SAMPLE_RATE: f64 = 44_100.0;

/// Segment window for the Welch estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Window {
    #[default]
    Hann,
    Hamming,
    Rectangular,
}

impl Window {
    /// Periodic window of length `n`, as used for spectral estimation.
    pub fn coefficients(self, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| {
                let phase = 2.0 * PI * i as f64 / n as f64;
                match self {
                    Window::Hann => 0.5 - 0.5 * phase.cos(),
                    Window::Hamming => 0.54 - 0.46 * phase.cos(),
                    Window::Rectangular => 1.0,
                }
            })
            .collect()
    }
}

impl FromStr for Window {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hann" | "hanning" => Ok(Window::Hann),
            "hamming" => Ok(Window::Hamming),
            "boxcar" | "rectangular" | "none" => Ok(Window::Rectangular),
            other => Err(BenchError::InvalidInput(format!("Unknown window '{other}'"))),
        }
    }
}

/// Estimation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Fft,
    Welch {
        window: Window,
        /// Segment length; `n/8` when `None`
        nperseg: Option<usize>,
    },
}

impl Method {
    /// Welch with a Hann window and the default segment length.
    pub fn welch() -> Self {
        Method::Welch {
            window: Window::Hann,
            nperseg: None,
        }
    }
}

impl FromStr for Method {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fft" => Ok(Method::Fft),
            "welch" => Ok(Method::welch()),
            other => Err(BenchError::InvalidInput(format!(
                "Method must be 'fft' or 'welch', got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Fft => f.write_str("fft"),
            Method::Welch { .. } => f.write_str("welch"),
        }
    }
}

/// A computed transfer function.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferFunction {
    pub frequencies: Vec<f64>,
    pub response: Vec<Complex<f64>>,
}

/// Estimates `H(f)` from an input/output pair and applies it to new signals.
pub struct TransferFunctionAnalyzer {
    sample_rate: f64,
    input: Option<Vec<f64>>,
    output: Option<Vec<f64>>,
    result: Option<TransferFunction>,
    planner: FftPlanner<f64>,
}

impl Default for TransferFunctionAnalyzer {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE)
    }
}

impl TransferFunctionAnalyzer {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            input: None,
            output: None,
            result: None,
            planner: FftPlanner::new(),
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Set both signals, truncating to the shorter one.
    pub fn set_signals(&mut self, input: &[f64], output: &[f64]) {
        let len = input.len().min(output.len());
        if input.len() != output.len() {
            tracing::debug!(input = input.len(), output = output.len(), len, "truncating signals to common length");
        }
        self.input = Some(input[..len].to_vec());
        self.output = Some(output[..len].to_vec());
        self.result = None;
        tracing::info!(samples = len, "signals set");
    }

    /// Load both signals from WAV files recorded at this analyzer's rate.
    pub fn load_wav_files<P: AsRef<Path>, Q: AsRef<Path>>(&mut self, input: P, output: Q) -> BenchResult<()> {
        let rate = self.sample_rate.round() as u32;
        let x = storage::load_wav_at(input, rate)?;
        let y = storage::load_wav_at(output, rate)?;
        self.set_signals(&x, &y);
        Ok(())
    }

    /// Compute and store the transfer function.
    pub fn compute(&mut self, method: Method) -> BenchResult<&TransferFunction> {
        let (input, output) = match (&self.input, &self.output) {
            (Some(x), Some(y)) if !x.is_empty() => (x.clone(), y.clone()),
            _ => {
                return Err(BenchError::InvalidInput(
                    "Input and output signals must be set first".into(),
                ))
            }
        };

        let tf = match method {
            Method::Fft => self.fft_estimate(&input, &output),
            Method::Welch { window, nperseg } => {
                let nperseg = nperseg.unwrap_or(input.len() / 8);
                self.welch_estimate(&input, &output, window, nperseg)?
            }
        };
        tracing::info!(%method, bins = tf.frequencies.len(), "transfer function computed");
        Ok(&*self.result.insert(tf))
    }

    /// The last computed transfer function.
    pub fn transfer_function(&self) -> BenchResult<&TransferFunction> {
        self.result
            .as_ref()
            .ok_or_else(|| BenchError::InvalidInput("Transfer function not computed yet".into()))
    }

    /// `20·log10(|H| + 1e-10)` per bin.
    pub fn magnitude_db(&self) -> BenchResult<Spectrum> {
        let tf = self.transfer_function()?;
        let values = tf
            .response
            .iter()
            .map(|h| 20.0 * (h.norm() + 1e-10).log10())
            .collect();
        Spectrum::new(tf.frequencies.clone(), values)
    }

    /// Phase of `H` in degrees, in (-180, 180].
    pub fn phase_deg(&self) -> BenchResult<Spectrum> {
        let tf = self.transfer_function()?;
        let values = tf.response.iter().map(|h| h.arg().to_degrees()).collect();
        Spectrum::new(tf.frequencies.clone(), values)
    }

    /// Filter `test` through the computed transfer function.
    ///
    /// Magnitude and phase are interpolated onto the test signal's bins
    /// (clamped at both ends), mirrored with conjugates for the negative
    /// frequencies, multiplied with the test spectrum and transformed back.
    pub fn apply(&mut self, test: &[f64]) -> BenchResult<Vec<f64>> {
        let tf = self.transfer_function()?.clone();
        let n = test.len();
        if n == 0 {
            return Ok(Vec::new());
        }

        let magnitude: Vec<f64> = tf.response.iter().map(|h| h.norm()).collect();
        let phase: Vec<f64> = tf.response.iter().map(|h| h.arg()).collect();
        let bin_hz = self.sample_rate / n as f64;

        let mut h_full = vec![Complex::new(0.0, 0.0); n];
        for k in 0..=n / 2 {
            let f = k as f64 * bin_hz;
            let mag = interp(f, &tf.frequencies, &magnitude);
            let ph = interp(f, &tf.frequencies, &phase);
            let h = Complex::from_polar(mag, ph);
            // DC and Nyquist bins must be real for a real output
            h_full[k] = if k == 0 || 2 * k == n { Complex::new(h.re, 0.0) } else { h };
            if k != 0 && 2 * k != n {
                h_full[n - k] = h.conj();
            }
        }

        let mut spectrum: Vec<Complex<f64>> = test.iter().map(|&v| Complex::new(v, 0.0)).collect();
        self.planner.plan_fft_forward(n).process(&mut spectrum);
        for (s, h) in spectrum.iter_mut().zip(&h_full) {
            *s *= *h;
        }
        self.planner.plan_fft_inverse(n).process(&mut spectrum);
        Ok(spectrum.iter().map(|c| c.re / n as f64).collect())
    }

    fn fft_estimate(&mut self, input: &[f64], output: &[f64]) -> TransferFunction {
        let n = input.len();
        let x = forward(&mut self.planner, input);
        let y = forward(&mut self.planner, output);
        let epsilon = 1e-10 * x.iter().map(|c| c.norm()).fold(0.0, f64::max);

        let n_positive = n / 2;
        let frequencies = (0..n_positive)
            .map(|k| k as f64 * self.sample_rate / n as f64)
            .collect();
        let response = (0..n_positive).map(|k| y[k] / (x[k] + epsilon)).collect();
        TransferFunction { frequencies, response }
    }

    fn welch_estimate(
        &mut self,
        input: &[f64],
        output: &[f64],
        window: Window,
        nperseg: usize,
    ) -> BenchResult<TransferFunction> {
        let nperseg = nperseg.min(input.len());
        if nperseg < 2 {
            return Err(BenchError::InvalidInput(format!(
                "Welch needs at least 2 samples per segment, got {nperseg}"
            )));
        }
        let (frequencies, pxy) = self.cross_spectral_density(input, output, window, nperseg);
        let (_, pxx) = self.cross_spectral_density(input, input, window, nperseg);

        let epsilon = 1e-10 * pxx.iter().map(|p| p.re).fold(0.0, f64::max);
        let response = pxy
            .iter()
            .zip(&pxx)
            .map(|(xy, xx)| *xy / (xx.re + epsilon))
            .collect();
        Ok(TransferFunction { frequencies, response })
    }

    /// One-sided, density-scaled, mean-averaged `conj(X)·Y`.
    fn cross_spectral_density(
        &mut self,
        x: &[f64],
        y: &[f64],
        window: Window,
        nperseg: usize,
    ) -> (Vec<f64>, Vec<Complex<f64>>) {
        let win = window.coefficients(nperseg);
        let noverlap = nperseg / 2;
        let step = nperseg - noverlap;
        let segments = (x.len() - noverlap) / step;
        let bins = nperseg / 2 + 1;
        let fft = self.planner.plan_fft_forward(nperseg);

        let mut acc = vec![Complex::new(0.0, 0.0); bins];
        for s in 0..segments {
            let start = s * step;
            let xs = prepare_segment(&x[start..start + nperseg], &win);
            let ys = prepare_segment(&y[start..start + nperseg], &win);
            let mut xf = xs;
            let mut yf = ys;
            fft.process(&mut xf);
            fft.process(&mut yf);
            for k in 0..bins {
                acc[k] += xf[k].conj() * yf[k];
            }
        }

        let scale = 1.0 / (self.sample_rate * win.iter().map(|w| w * w).sum::<f64>());
        let last_doubled = if nperseg % 2 == 0 { bins - 1 } else { bins };
        let density = acc
            .iter()
            .enumerate()
            .map(|(k, v)| {
                let one_sided = if k > 0 && k < last_doubled { 2.0 } else { 1.0 };
                *v * (scale * one_sided / segments as f64)
            })
            .collect();
        let frequencies = (0..bins)
            .map(|k| k as f64 * self.sample_rate / nperseg as f64)
            .collect();
        (frequencies, density)
    }
}

fn forward(planner: &mut FftPlanner<f64>, data: &[f64]) -> Vec<Complex<f64>> {
    let mut buffer: Vec<Complex<f64>> = data.iter().map(|&v| Complex::new(v, 0.0)).collect();
    planner.plan_fft_forward(buffer.len()).process(&mut buffer);
    buffer
}

/// Remove the mean and apply the window.
fn prepare_segment(segment: &[f64], window: &[f64]) -> Vec<Complex<f64>> {
    let mean = segment.iter().sum::<f64>() / segment.len() as f64;
    segment
        .iter()
        .zip(window)
        .map(|(v, w)| Complex::new((v - mean) * w, 0.0))
        .collect()
}

/// Linear interpolation over ascending `xs`, clamped outside the range.
pub fn interp(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    let (Some(&first), Some(&last)) = (xs.first(), xs.last()) else {
        return 0.0;
    };
    if x <= first {
        return ys[0];
    }
    if x >= last {
        return ys[ys.len() - 1];
    }
    let upper = xs.partition_point(|&v| v <= x);
    let (x0, x1) = (xs[upper - 1], xs[upper]);
    let (y0, y1) = (ys[upper - 1], ys[upper]);
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn noise(n: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    #[test]
    fn test_requires_signals() {
        let mut tfa = TransferFunctionAnalyzer::new(48_000.0);
        assert!(tfa.compute(Method::Fft).is_err());
        assert!(tfa.magnitude_db().is_err());
        assert!(tfa.apply(&[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_unknown_method_rejected() {
        assert!("periodogram".parse::<Method>().is_err());
        assert_eq!("Welch".parse::<Method>().unwrap(), Method::welch());
        assert!("kaiser".parse::<Window>().is_err());
    }

    #[test]
    fn test_set_signals_truncates() {
        let mut tfa = TransferFunctionAnalyzer::new(1000.0);
        tfa.set_signals(&noise(100, 1), &noise(80, 2));
        let tf = tfa.compute(Method::Fft).unwrap();
        assert_eq!(tf.frequencies.len(), 40);
        assert!((tf.frequencies[1] - 12.5).abs() < 1e-12);
    }

    #[test]
    fn test_fft_recovers_gain() {
        let x = noise(1024, 7);
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v).collect();
        let mut tfa = TransferFunctionAnalyzer::new(48_000.0);
        tfa.set_signals(&x, &y);
        let tf = tfa.compute(Method::Fft).unwrap();
        for h in &tf.response {
            assert!((h.norm() - 2.0).abs() < 1e-6, "|H| = {}", h.norm());
        }

        let mag = tfa.magnitude_db().unwrap();
        assert!((mag.values[10] - 20.0 * 2f64.log10()).abs() < 1e-5);
    }

    #[test]
    fn test_welch_bins_and_gain() {
        let x = noise(4096, 11);
        let y: Vec<f64> = x.iter().map(|v| 0.5 * v).collect();
        let mut tfa = TransferFunctionAnalyzer::new(8000.0);
        tfa.set_signals(&x, &y);
        let tf = tfa.compute(Method::welch()).unwrap();

        // nperseg = 4096 / 8 = 512 -> 257 one-sided bins up to Nyquist
        assert_eq!(tf.frequencies.len(), 257);
        assert!((tf.frequencies[256] - 4000.0).abs() < 1e-9);
        for h in &tf.response[1..] {
            assert!((h.re - 0.5).abs() < 1e-6);
            assert!(h.im.abs() < 1e-6);
        }
    }

    #[test]
    fn test_welch_psd_matches_white_noise_level() {
        // Uniform(-1, 1) has variance 1/3; one-sided density is 2·σ²/fs
        let fs = 1000.0;
        let x = noise(1 << 16, 3);
        let mut tfa = TransferFunctionAnalyzer::new(fs);
        let (_, pxx) = tfa.cross_spectral_density(&x, &x, Window::Hann, 256);
        let mid = &pxx[10..118];
        let mean = mid.iter().map(|p| p.re).sum::<f64>() / mid.len() as f64;
        let expected = 2.0 / 3.0 / fs;
        assert!((mean - expected).abs() / expected < 0.05, "mean PSD {mean}, expected {expected}");
    }

    #[test]
    fn test_inverted_output_phase() {
        let x = noise(512, 5);
        let y: Vec<f64> = x.iter().map(|v| -v).collect();
        let mut tfa = TransferFunctionAnalyzer::new(1000.0);
        tfa.set_signals(&x, &y);
        tfa.compute(Method::Fft).unwrap();
        let phase = tfa.phase_deg().unwrap();
        assert!(phase.values[1..].iter().all(|p| (p.abs() - 180.0).abs() < 1e-6));
    }

    #[test]
    fn test_apply_scales_test_signal() {
        let x = noise(2048, 9);
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v).collect();
        let mut tfa = TransferFunctionAnalyzer::new(1000.0);
        tfa.set_signals(&x, &y);
        tfa.compute(Method::Fft).unwrap();

        let test: Vec<f64> = (0..300)
            .map(|i| (2.0 * PI * 50.0 * i as f64 / 1000.0).sin())
            .collect();
        let out = tfa.apply(&test).unwrap();
        assert_eq!(out.len(), test.len());
        for (o, t) in out.iter().zip(&test) {
            assert!((o - 2.0 * t).abs() < 1e-6);
        }
    }

    #[test]
    fn test_interp_clamps() {
        let xs = [0.0, 10.0, 20.0];
        let ys = [1.0, 3.0, 5.0];
        assert_eq!(interp(-5.0, &xs, &ys), 1.0);
        assert_eq!(interp(5.0, &xs, &ys), 2.0);
        assert_eq!(interp(10.0, &xs, &ys), 3.0);
        assert_eq!(interp(25.0, &xs, &ys), 5.0);
    }

    #[test]
    fn test_hann_is_periodic() {
        let w = Window::Hann.coefficients(4);
        assert_eq!(w.len(), 4);
        assert!(w[0].abs() < 1e-12);
        assert!((w[2] - 1.0).abs() < 1e-12);
    }
}
