//! Bench Hardware
//!
//! Transports, the SCPI helper layer, capability traits and one driver per
//! instrument family.

pub mod capabilities;
pub mod mock;
pub mod noise_analyzer;
pub mod oscilloscope;
pub mod power_supply;
pub mod registry;
pub mod resource;
pub mod scpi;
pub mod signal_generator;
pub mod smu;
pub mod transport;

#[cfg(feature = "instrument_visa")]
pub mod visa;

pub use registry::InstrumentRegistry;
pub use transport::ScpiTransport;
