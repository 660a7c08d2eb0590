//! SCPI transports.
//!
//! Abstracts the underlying communication mechanism (raw socket, VISA, mock)
//! so that drivers only ever deal in command strings.
//!
//! Transport selection follows the resource string:
//! - `TCPIP…::SOCKET` resources use [`TcpTransport`] and need nothing else.
//! - USB, GPIB, VXI-11/HiSLIP and serial resources go through the system VISA
//!   library and require the `instrument_visa` feature.
//! - `--simulate` replaces every transport with a [`MockTransport`] that
//!   answers like a healthy instrument.

use crate::config::InstrumentDefinition;
use crate::error::BenchError;
use crate::hardware::mock::MockTransport;
use crate::hardware::resource::VisaResource;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Trait for SCPI communication transports.
#[async_trait]
pub trait ScpiTransport: Send + Sync {
    /// Resource string this transport is connected to.
    fn resource(&self) -> &str;

    /// Send a command without expecting a response.
    async fn write(&self, command: &str) -> Result<()>;

    /// Send a query command and return the response line, terminator removed.
    async fn query(&self, command: &str) -> Result<String>;

    /// Read whatever the instrument has queued, up to the response terminator.
    async fn read_raw(&self) -> Result<Vec<u8>>;

    /// Release the session.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Raw TCP SCPI transport (port 5025 convention).
pub struct TcpTransport {
    resource: String,
    stream: Mutex<BufReader<TcpStream>>,
    timeout: Duration,
    write_termination: String,
}

impl TcpTransport {
    /// Connect to `host:port`.
    pub async fn connect(
        resource: impl Into<String>,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Self> {
        let resource = resource.into();
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| BenchError::transport(&resource, "connect timed out"))?
            .with_context(|| format!("Failed to connect to {host}:{port}"))?;
        stream.set_nodelay(true)?;

        tracing::debug!(%resource, "SCPI socket connected");
        Ok(Self {
            resource,
            stream: Mutex::new(BufReader::new(stream)),
            timeout,
            write_termination: "\n".to_string(),
        })
    }

    /// Set line terminator for commands
    pub fn with_write_termination(mut self, terminator: impl Into<String>) -> Self {
        self.write_termination = terminator.into();
        self
    }

    async fn send(&self, stream: &mut BufReader<TcpStream>, command: &str) -> Result<()> {
        let line = format!("{command}{}", self.write_termination);
        tokio::time::timeout(self.timeout, stream.get_mut().write_all(line.as_bytes()))
            .await
            .map_err(|_| BenchError::transport(&self.resource, "write timed out"))?
            .with_context(|| format!("{} write failed", self.resource))
    }

    async fn read_line(&self, stream: &mut BufReader<TcpStream>) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let read = tokio::time::timeout(self.timeout, stream.read_until(b'\n', &mut buf))
            .await
            .map_err(|_| BenchError::transport(&self.resource, "read timed out"))?
            .with_context(|| format!("{} read failed", self.resource))?;
        if read == 0 {
            return Err(BenchError::transport(&self.resource, "connection closed").into());
        }
        Ok(buf)
    }
}

#[async_trait]
impl ScpiTransport for TcpTransport {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn write(&self, command: &str) -> Result<()> {
        let mut stream = self.stream.lock().await;
        self.send(&mut stream, command).await
    }

    async fn query(&self, command: &str) -> Result<String> {
        let mut stream = self.stream.lock().await;
        self.send(&mut stream, command).await?;
        let line = self.read_line(&mut stream).await?;
        Ok(String::from_utf8_lossy(&line).trim_end().to_string())
    }

    async fn read_raw(&self) -> Result<Vec<u8>> {
        let mut stream = self.stream.lock().await;
        self.read_line(&mut stream).await
    }

    async fn close(&self) -> Result<()> {
        let mut stream = self.stream.lock().await;
        // Drain anything left so the instrument's output queue is empty next time
        let mut scratch = [0u8; 256];
        let _ = tokio::time::timeout(Duration::from_millis(10), stream.read(&mut scratch)).await;
        stream.get_mut().shutdown().await.ok();
        Ok(())
    }
}

/// Open the transport for an instrument definition.
pub async fn open_transport(
    definition: &InstrumentDefinition,
    simulate: bool,
) -> Result<Arc<dyn ScpiTransport>> {
    if simulate {
        tracing::info!(id = %definition.id, kind = %definition.kind, "using simulated instrument");
        return Ok(Arc::new(MockTransport::simulating(
            definition.kind,
            &definition.resource,
        )));
    }

    let resource: VisaResource = definition.resource.parse()?;
    tracing::debug!(
        id = %definition.id,
        interface = resource.interface_name(),
        timeout_ms = definition.timeout().as_millis() as u64,
        "opening transport"
    );

    match &resource {
        VisaResource::TcpipSocket { host, port, .. } => {
            let transport = TcpTransport::connect(
                definition.resource.clone(),
                host,
                *port,
                definition.timeout(),
            )
            .await?
            .with_write_termination(definition.write_termination.clone());
            Ok(Arc::new(transport))
        }
        _ => open_visa(definition).await,
    }
}

#[cfg(feature = "instrument_visa")]
async fn open_visa(definition: &InstrumentDefinition) -> Result<Arc<dyn ScpiTransport>> {
    let transport = crate::hardware::visa::VisaTransport::open(
        definition.resource.clone(),
        definition.timeout(),
        definition.write_termination.clone(),
    )
    .await?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "instrument_visa"))]
async fn open_visa(definition: &InstrumentDefinition) -> Result<Arc<dyn ScpiTransport>> {
    tracing::warn!(
        resource = %definition.resource,
        "resource needs a VISA library; only TCPIP::SOCKET resources work without it"
    );
    Err(BenchError::FeatureNotEnabled("instrument_visa".to_string()).into())
}

/// List instrument resources visible to this machine.
///
/// With VISA support this asks the resource manager for `?*INSTR`; without it
/// the configured resources are all that can be known.
pub async fn list_resources(configured: &[InstrumentDefinition]) -> Result<Vec<String>> {
    #[cfg(feature = "instrument_visa")]
    {
        let _ = configured;
        crate::hardware::visa::find_resources().await
    }

    #[cfg(not(feature = "instrument_visa"))]
    {
        Ok(configured.iter().map(|def| def.resource.clone()).collect())
    }
}
