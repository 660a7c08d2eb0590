//! Bench Instrument Capabilities
//!
//! Fine-grained capability traits that drivers implement. Procedures are
//! written against these bounds rather than concrete drivers where they can
//! be:
//!
//! - a power supply implements: `Identify + OutputControl`
//! - a function generator implements: `Identify + OutputControl + Triggerable`
//! - a noise analyzer implements: `NoiseAnalyzer`
//!
//! Each capability trait is async, `Send + Sync`, uses `anyhow::Result`, and
//! takes `&self` (drivers keep mutable state behind interior mutability).
//!
//! # Example
//!
//! ```rust,ignore
//! async fn fire_once<T: Triggerable + OutputControl>(device: &T) -> Result<()> {
//!     device.arm().await?;
//!     device.set_output(true).await?;
//!     device.trigger().await
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;

/// Capability: Identification
///
/// Every SCPI instrument answers `*IDN?` and accepts `*RST`/`*CLS`.
#[async_trait]
pub trait Identify: Send + Sync {
    /// Identity string as reported by the instrument.
    async fn identify(&self) -> Result<String>;

    /// Return the instrument to its power-on state and clear status.
    async fn reset(&self) -> Result<()>;
}

/// Capability: Output Enable
///
/// Devices whose output stage can be switched on and off. For multi-channel
/// devices this acts on every channel the driver is responsible for.
#[async_trait]
pub trait OutputControl: Send + Sync {
    /// Switch the output on or off.
    async fn set_output(&self, enabled: bool) -> Result<()>;

    /// Whether the output was last switched on.
    ///
    /// # Default Implementation
    /// Returns an error indicating state query is not supported.
    async fn output_enabled(&self) -> Result<bool> {
        anyhow::bail!("Output state query not supported by this device")
    }
}

/// Capability: External Triggering
///
/// Devices that can be armed and triggered (burst generators, list-mode
/// supplies).
///
/// # Contract
/// - `arm()` prepares the device to respond to a trigger
/// - `trigger()` on an unarmed device returns `Err`
#[async_trait]
pub trait Triggerable: Send + Sync {
    /// Arm device for trigger.
    async fn arm(&self) -> Result<()>;

    /// Send software trigger.
    async fn trigger(&self) -> Result<()>;

    /// Check if device is currently armed.
    ///
    /// # Default Implementation
    /// Returns an error indicating state query is not supported.
    async fn is_armed(&self) -> Result<bool> {
        anyhow::bail!("Armed state query not supported by this device")
    }
}

pub use crate::hardware::noise_analyzer::NoiseAnalyzer;
