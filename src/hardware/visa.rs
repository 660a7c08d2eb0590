//! VISA transport for USB/GPIB/LAN instruments
//!
//! Wraps `visa-rs` so that any resource the system VISA library understands
//! (`USB0::…::INSTR`, `GPIB0::…::INSTR`, `TCPIP0::…::hislip0::INSTR`) can be
//! used as an [`ScpiTransport`]. VISA calls are blocking, so each operation runs
//! on Tokio's blocking pool.

use crate::error::BenchError;
use crate::hardware::transport::ScpiTransport;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::ffi::CString;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use visa_rs::{flags::AccessMode, DefaultRM, Instrument};

/// Byte stream over an open VISA session.
struct Link(Instrument);

impl Read for Link {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.0).read(buf)
    }
}

impl Write for Link {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.0).flush()
    }
}

struct Session {
    // The resource manager owns the session; keep it alive alongside it.
    _rm: DefaultRM,
    // One reader for the whole session: bytes read past a terminator belong
    // to the next reply.
    link: BufReader<Link>,
}

/// VISA-backed SCPI transport.
pub struct VisaTransport {
    resource: String,
    session: Arc<Mutex<Session>>,
    write_termination: String,
}

impl VisaTransport {
    /// Open `resource` through the default resource manager.
    pub async fn open(resource: String, timeout: Duration, write_termination: String) -> Result<Self> {
        let name = resource.clone();
        let session = tokio::task::spawn_blocking(move || -> Result<Session> {
            let rm = DefaultRM::new().map_err(|e| anyhow!("VISA resource manager unavailable: {e:?}"))?;
            let id = CString::new(name.as_str())?.into();
            let instrument = rm
                .open(&id, AccessMode::NO_LOCK, timeout)
                .map_err(|e| BenchError::transport(&name, format!("open failed: {e:?}")))?;
            Ok(Session {
                _rm: rm,
                link: BufReader::new(Link(instrument)),
            })
        })
        .await
        .context("VISA open task panicked")??;

        tracing::debug!(%resource, "VISA session opened");
        Ok(Self {
            resource,
            session: Arc::new(Mutex::new(session)),
            write_termination,
        })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut BufReader<Link>) -> io::Result<T> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        let resource = self.resource.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = session.lock();
            op(&mut guard.link).map_err(|e| BenchError::transport(&resource, e.to_string()).into())
        })
        .await
        .context("VISA I/O task panicked")?
    }
}

#[async_trait]
impl ScpiTransport for VisaTransport {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn write(&self, command: &str) -> Result<()> {
        let line = format!("{command}{}", self.write_termination);
        self.blocking(move |link| send(link, &line)).await
    }

    async fn query(&self, command: &str) -> Result<String> {
        let line = format!("{command}{}", self.write_termination);
        self.blocking(move |link| exchange(link, &line)).await
    }

    async fn read_raw(&self) -> Result<Vec<u8>> {
        self.blocking(|link| read_line_raw(link)).await
    }
}

fn send<S: Write>(link: &mut BufReader<S>, line: &str) -> io::Result<()> {
    let stream = link.get_mut();
    stream.write_all(line.as_bytes())?;
    stream.flush()
}

/// Write `line` and read one newline-terminated reply.
fn exchange<S: Read + Write>(link: &mut BufReader<S>, line: &str) -> io::Result<String> {
    send(link, line)?;
    let mut reply = String::new();
    if link.read_line(&mut reply)? == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no reply"));
    }
    Ok(reply.trim_end().to_string())
}

fn read_line_raw<S: Read>(link: &mut BufReader<S>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    link.read_until(b'\n', &mut buf)?;
    Ok(buf)
}

/// Enumerate `?*INSTR` resources known to the VISA library.
pub async fn find_resources() -> Result<Vec<String>> {
    tokio::task::spawn_blocking(|| -> Result<Vec<String>> {
        let rm = DefaultRM::new().map_err(|e| anyhow!("VISA resource manager unavailable: {e:?}"))?;
        let expr = CString::new("?*INSTR")?.into();
        let mut list = rm
            .find_res_list(&expr)
            .map_err(|e| anyhow!("VISA resource search failed: {e:?}"))?;
        let mut found = Vec::new();
        while let Some(id) = list
            .find_next()
            .map_err(|e| anyhow!("VISA resource search failed: {e:?}"))?
        {
            found.push(id.to_string());
        }
        Ok(found)
    })
    .await
    .context("VISA search task panicked")?
}
