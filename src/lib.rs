//! # bench_daq
//!
//! Headless automation for an ASIC / analog amplifier validation bench. The
//! crate drives a triple-output supply, two-channel function generators, a
//! source-measure unit, an oscilloscope and a noise analyzer over SCPI, and
//! writes every result as a CSV table for offline plotting.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-loaded bench description: instruments, timing
//!   margins, output directory, logging defaults.
//! - **`error`**: The `BenchError` enum shared by every layer.
//! - **`logging`**: `tracing-subscriber` setup (pretty, compact or JSON).
//! - **`hardware`**: Transports (TCP socket, VISA, mock), the SCPI helper
//!   layer, capability traits and one driver per instrument family.
//! - **`procedures`**: Sweeps, timed outputs, generator pairs, scope capture
//!   and noise measurement, all cancellable.
//! - **`analysis`**: Transfer-function estimation, gain statistics and
//!   arbitrary-waveform shapes.
//! - **`data`**: `Spectrum` plus CSV / WAV storage helpers.

pub mod analysis;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod procedures;
