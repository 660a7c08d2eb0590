//! Input-referred noise density measurement.

use crate::data::{storage, Spectrum};
use crate::hardware::noise_analyzer::{NoiseAnalyzer, NoiseSetup};
use crate::procedures::countdown::CancelToken;
use anyhow::Result;
use std::path::Path;
use std::time::Duration;

/// Points at or above this frequency are dropped by default, Hz.
pub const DEFAULT_CUTOFF_HZ: f64 = 20_000.0;

/// Configure, run and read back one noise measurement.
///
/// `is_running` is polled every `poll`; the returned spectrum only holds
/// frequencies strictly below `cutoff_hz`.
pub async fn measure_noise(
    analyzer: &dyn NoiseAnalyzer,
    setup: &NoiseSetup,
    cutoff_hz: f64,
    poll: Duration,
    cancel: &CancelToken,
) -> Result<Spectrum> {
    analyzer.configure(setup).await?;
    tracing::info!(
        channel = %setup.channel_name,
        acquisition_s = setup.acquisition_seconds,
        averages = setup.averages,
        "noise measurement started"
    );
    analyzer.start().await?;

    let mut polls = 0u32;
    while analyzer.is_running().await? {
        polls += 1;
        cancel.sleep(poll).await?;
    }
    tracing::debug!(polls, "analyzer finished");

    let spectrum = analyzer.results().await?.below(cutoff_hz);
    tracing::info!(points = spectrum.len(), cutoff_hz, "noise density read");
    Ok(spectrum)
}

/// `Frequency_Hz,Noise_V_per_sqrt_Hz`
pub fn write_noise_csv<P: AsRef<Path>>(path: P, spectrum: &Spectrum) -> Result<()> {
    storage::write_columns(
        path,
        &["Frequency_Hz", "Noise_V_per_sqrt_Hz"],
        &[&spectrum.frequencies, &spectrum.values],
    )?;
    Ok(())
}
