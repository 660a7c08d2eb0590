//! Bench Procedures
//!
//! Each procedure is a plain async function (or a small struct for the
//! generator pair) over the drivers in [`crate::hardware`]. They share three
//! rules:
//!
//! - every timed wait goes through a [`CancelToken`]
//! - an output a procedure switched on is switched off again on every exit
//!   path, including errors and cancellation
//! - results are returned as values; CSV export is a separate call
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ sweep          stepped / list-mode supply sweeps                 │
//! │ timed_output   supply or SMU on for N seconds                    │
//! │ dual_channel   differential pair from one generator (+ clock)    │
//! │ generator_sync two generators, shared reference, one trigger     │
//! │ scope_capture  stimulus + capture + CSV                          │
//! │ noise          analyzer noise density + CSV                      │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ countdown      CancelHandle / CancelToken / Countdown            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod countdown;
pub mod dual_channel;
pub mod generator_sync;
pub mod noise;
pub mod scope_capture;
pub mod sweep;
pub mod timed_output;

pub use countdown::{CancelHandle, CancelToken, Countdown};
pub use dual_channel::{run_dual_channel, run_signal_and_clock, DualChannelRequest, PhaseMode};
pub use generator_sync::{BurstSettings, DualGeneratorSync, SyncReport};
pub use noise::measure_noise;
pub use scope_capture::{capture_to_csv, ScopeCaptureRequest, Stimulus};
pub use sweep::{run_list_sweep, run_stepped_sweep, SweepSample, SweepTable};
pub use timed_output::{hold_smu_output, hold_supply_output, SmuOutput, SupplyOutput};
