//! Common SCPI communication helpers.
//!
//! [`ScpiInstrument`] is the piece every driver is built on. It owns a
//! transport, logs every exchange, and implements the IEEE 488.2 common
//! commands and the reply parsing the bench instruments need.

use crate::error::BenchError;
use crate::hardware::transport::ScpiTransport;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on `SYST:ERR?` reads when draining the error queue.
pub const MAX_ERROR_QUEUE_READS: usize = 32;

/// An instrument session speaking SCPI.
#[derive(Clone)]
pub struct ScpiInstrument {
    id: String,
    transport: Arc<dyn ScpiTransport>,
}

impl ScpiInstrument {
    pub fn new(id: impl Into<String>, transport: Arc<dyn ScpiTransport>) -> Self {
        Self {
            id: id.into(),
            transport,
        }
    }

    /// Configured instrument id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resource string of the underlying session
    pub fn resource(&self) -> &str {
        self.transport.resource()
    }

    /// Send a command without expecting a response.
    pub async fn write(&self, command: &str) -> Result<()> {
        tracing::debug!(instrument = %self.id, command, "scpi write");
        self.transport
            .write(command)
            .await
            .with_context(|| format!("{}: write '{command}' failed", self.id))
    }

    /// Send several commands in order.
    pub async fn write_all<S: AsRef<str>>(&self, commands: &[S]) -> Result<()> {
        for command in commands {
            self.write(command.as_ref()).await?;
        }
        Ok(())
    }

    /// Send a query and return the trimmed reply.
    pub async fn query(&self, command: &str) -> Result<String> {
        let reply = self
            .transport
            .query(command)
            .await
            .with_context(|| format!("{}: query '{command}' failed", self.id))?;
        tracing::debug!(instrument = %self.id, command, reply = %reply.trim(), "scpi query");
        Ok(reply.trim().to_string())
    }

    /// Query and parse a single floating-point value.
    pub async fn query_f64(&self, command: &str) -> Result<f64> {
        let reply = self.query(command).await?;
        parse_f64_response(&reply)
    }

    /// Query and parse a single integer value (status registers).
    pub async fn query_u32(&self, command: &str) -> Result<u32> {
        let reply = self.query(command).await?;
        let value: f64 = parse_f64_response(&reply)?;
        if value < 0.0 || value > u32::MAX as f64 || value.fract() != 0.0 {
            return Err(BenchError::Instrument(format!(
                "{}: '{reply}' is not a register value",
                self.id
            ))
            .into());
        }
        Ok(value as u32)
    }

    /// Query and parse a list of ASCII values.
    pub async fn query_ascii_values(&self, command: &str) -> Result<Vec<f64>> {
        let reply = self.query(command).await?;
        parse_ascii_values(&reply)
    }

    /// `*IDN?`
    pub async fn identify(&self) -> Result<String> {
        self.query("*IDN?").await
    }

    /// `*RST` then `*CLS`.
    pub async fn reset(&self) -> Result<()> {
        self.write("*RST").await?;
        self.write("*CLS").await
    }

    /// Fire a bus trigger (`*TRG`).
    pub async fn bus_trigger(&self) -> Result<()> {
        self.write("*TRG").await
    }

    /// Read `SYST:ERR?` until the queue is empty and return what was in it.
    pub async fn drain_errors(&self) -> Result<Vec<String>> {
        let mut errors = Vec::new();
        for _ in 0..MAX_ERROR_QUEUE_READS {
            let reply = self.query("SYST:ERR?").await?;
            if is_no_error(&reply) {
                if !errors.is_empty() {
                    tracing::warn!(instrument = %self.id, ?errors, "instrument reported errors");
                }
                return Ok(errors);
            }
            errors.push(reply);
        }
        Err(BenchError::Instrument(format!(
            "{}: error queue did not empty after {MAX_ERROR_QUEUE_READS} reads",
            self.id
        ))
        .into())
    }

    /// Poll an integer status query until all bits in `mask` are set.
    pub async fn poll_until(
        &self,
        command: &str,
        mask: u32,
        attempts: u32,
        interval: Duration,
    ) -> Result<u32> {
        for attempt in 1..=attempts {
            tokio::time::sleep(interval).await;
            let reg = self.query_u32(command).await?;
            tracing::debug!(instrument = %self.id, command, reg = format!("{reg:#x}"), attempt, "status poll");
            if reg & mask == mask {
                return Ok(reg);
            }
        }
        Err(BenchError::Timeout(format!("{}: {command} & {mask:#x}", self.id)).into())
    }

    /// Release the session.
    pub async fn close(&self) -> Result<()> {
        tracing::debug!(instrument = %self.id, "closing session");
        self.transport.close().await
    }
}

/// True for `SYST:ERR?` replies that mean the queue is empty.
pub fn is_no_error(reply: &str) -> bool {
    let reply = reply.trim();
    if reply.to_lowercase().contains("no error") {
        return true;
    }
    reply
        .split(',')
        .next()
        .and_then(|code| code.trim().parse::<i32>().ok())
        == Some(0)
}

/// Parse a floating-point response from a SCPI query.
pub fn parse_f64_response(response: &str) -> Result<f64> {
    response
        .trim()
        .parse::<f64>()
        .with_context(|| format!("Failed to parse SCPI response as f64: '{response}'"))
}

/// Strip an IEEE 488.2 definite-length block header (`#NDDD…`), if present.
///
/// Text after the announced length (usually the terminator) is dropped.
pub fn strip_block_header(data: &str) -> Result<&str> {
    let Some(rest) = data.strip_prefix('#') else {
        return Ok(data);
    };
    let digits = rest
        .chars()
        .next()
        .and_then(|c| c.to_digit(10))
        .ok_or_else(|| BenchError::Instrument(format!("malformed block header in '{:.16}'", data)))?
        as usize;
    if digits == 0 {
        // Indefinite-length block: runs to the terminator
        return Ok(&rest[1..]);
    }
    let len_text = rest.get(1..1 + digits).ok_or_else(|| {
        BenchError::Instrument("block header shorter than its digit count".to_string())
    })?;
    let len: usize = len_text
        .parse()
        .map_err(|_| BenchError::Instrument(format!("bad block length '{len_text}'")))?;
    let body = &rest[1 + digits..];
    Ok(body.get(..len).unwrap_or(body))
}

/// Parse comma- or newline-separated ASCII values, tolerant of a block header.
pub fn parse_ascii_values(data: &str) -> Result<Vec<f64>> {
    strip_block_header(data.trim())?
        .split([',', '\n'])
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(parse_f64_response)
        .collect()
}

/// Comma-separated list for `LIST:*` style commands.
pub fn format_list(values: &[f64]) -> String {
    values
        .iter()
        .map(f64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Channel list suffix, e.g. `(@1)`.
pub fn channel_list(channel: u8) -> String {
    format!("(@{channel})")
}
