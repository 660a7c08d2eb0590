//! Offline analysis of recorded signals.
//!
//! - [`transfer_function`]: FFT and Welch estimates of `H(f)` and applying it
//! - [`gain`]: open-loop gain statistics and gain-bandwidth product
//! - [`arb`]: normalized arbitrary waveform shapes

pub mod arb;
pub mod gain;
pub mod transfer_function;

pub use gain::{GainBandwidthProduct, GainSummary, OpenLoopGain};
pub use transfer_function::{Method, TransferFunctionAnalyzer, Window};
