//! Serial port transport.
//!
//! `serialport` only offers blocking I/O. The port is owned by the transport
//! and lent to one blocking task at a time, either a read bounded by
//! `read_timeout` or a write bounded by `write_timeout`. A read that is still
//! running when `read_chunk` is cancelled is kept and resumed by the next
//! call, so no bytes are lost and the port never has two users.

use std::io::{self, Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio::task::JoinHandle;

use super::{Transport, READ_CHUNK_SIZE};
use crate::error::{Error, Result, TransportError};

/// Serial link parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Enable RTS/CTS hardware flow control.
    #[serde(default)]
    pub flow_control: bool,
    /// How long one blocking read waits for data.
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
    /// How long a write may block before the link fails.
    #[serde(default = "default_write_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,
}

fn default_baud_rate() -> u32 {
    57600
}
fn default_read_timeout() -> Duration {
    Duration::from_millis(50)
}
fn default_write_timeout() -> Duration {
    Duration::from_secs(1)
}

impl SerialConfig {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            flow_control: false,
            read_timeout: default_read_timeout(),
            write_timeout: default_write_timeout(),
        }
    }

    /// Check baud rate and timeouts are non-zero.
    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(Error::InvalidConfig(format!("{}: baud_rate must be positive", self.port_name)));
        }
        if self.read_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(Error::InvalidConfig(format!(
                "{}: serial timeouts must be positive",
                self.port_name
            )));
        }
        Ok(())
    }
}

type Port = Box<dyn SerialPort>;

/// A finished blocking read: the port comes back with whatever it read.
/// An empty chunk means the read timed out.
type ReadOutcome = (Port, io::Result<Bytes>);

/// Serial transport.
pub struct SerialTransport {
    port_name: String,
    read_timeout: Duration,
    write_timeout: Duration,
    /// `None` while a read holds the port.
    port: Option<Port>,
    pending_read: Option<JoinHandle<ReadOutcome>>,
    /// Data a write collected from an in-flight read.
    buffered: Option<io::Result<Bytes>>,
}

impl SerialTransport {
    /// Open the port (8N1).
    pub async fn open(config: &SerialConfig) -> Result<Self> {
        config.validate()?;
        let settings = config.clone();
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&settings.port_name, settings.baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(if settings.flow_control {
                    FlowControl::Hardware
                } else {
                    FlowControl::None
                })
                .timeout(settings.read_timeout)
                .open()
        })
        .await
        .map_err(|e| TransportError::Serial(e.to_string()))?
        .map_err(|e| TransportError::Serial(format!("{}: {e}", config.port_name)))?;

        tracing::info!(
            port = %config.port_name,
            baud = config.baud_rate,
            flow_control = config.flow_control,
            "Opened serial port"
        );

        Ok(Self::from_port(port, config))
    }

    /// Wrap an already open port.
    pub(crate) fn from_port(port: Port, config: &SerialConfig) -> Self {
        Self {
            port_name: config.port_name.clone(),
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            port: Some(port),
            pending_read: None,
            buffered: None,
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn start_read(&self, mut port: Port) -> JoinHandle<ReadOutcome> {
        let timeout = self.read_timeout;
        tokio::task::spawn_blocking(move || {
            let result = port
                .set_timeout(timeout)
                .map_err(io::Error::from)
                .and_then(|()| {
                    let mut buf = vec![0u8; READ_CHUNK_SIZE];
                    match port.read(&mut buf) {
                        Ok(n) => {
                            buf.truncate(n);
                            Ok(Bytes::from(buf))
                        }
                        Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {
                            Ok(Bytes::new())
                        }
                        Err(e) => Err(e),
                    }
                });
            (port, result)
        })
    }

    /// Get the port back, waiting out a read that holds it.
    async fn reclaim_port(&mut self) -> Result<Port> {
        if let Some(pending) = self.pending_read.take() {
            let (port, result) = pending
                .await
                .map_err(|e| TransportError::Serial(format!("{}: {e}", self.port_name)))?;
            if !matches!(&result, Ok(chunk) if chunk.is_empty()) {
                self.buffered = Some(result);
            }
            return Ok(port);
        }
        self.port.take().ok_or_else(|| TransportError::Closed.into())
    }

    fn receive_failed(&self, e: &io::Error) -> Error {
        TransportError::ReceiveFailed(format!("{}: {e}", self.port_name)).into()
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(result) = self.buffered.take() {
                return result.map(Some).map_err(|e| self.receive_failed(&e));
            }

            if self.pending_read.is_none() {
                let port = self.port.take().ok_or(TransportError::Closed)?;
                self.pending_read = Some(self.start_read(port));
            }
            // Cancelling here leaves the read in `pending_read`
            let outcome = match self.pending_read.as_mut() {
                Some(pending) => pending.await,
                None => continue,
            };
            self.pending_read = None;

            let (port, result) =
                outcome.map_err(|e| TransportError::Serial(format!("{}: {e}", self.port_name)))?;
            self.port = Some(port);
            match result {
                Ok(chunk) if chunk.is_empty() => {}
                Ok(chunk) => return Ok(Some(chunk)),
                Err(e) => return Err(self.receive_failed(&e)),
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut port = self.reclaim_port().await?;
        let timeout = self.write_timeout;
        let chunk = Bytes::copy_from_slice(data);

        let (port, result) = tokio::task::spawn_blocking(move || {
            let result = port
                .set_timeout(timeout)
                .map_err(io::Error::from)
                .and_then(|()| port.write_all(&chunk))
                .and_then(|()| port.flush());
            (port, result)
        })
        .await
        .map_err(|e| TransportError::Serial(format!("{}: {e}", self.port_name)))?;
        self.port = Some(port);

        result.map_err(|e| TransportError::SendFailed(format!("{}: {e}", self.port_name)))?;
        Ok(data.len())
    }

    async fn close(&mut self) -> Result<()> {
        if self.pending_read.is_some() {
            self.reclaim_port().await?;
        }
        self.port = None;
        self.buffered = None;
        tracing::debug!(port = %self.port_name, "Closed serial port");
        Ok(())
    }

    fn transport_type(&self) -> &'static str {
        "serial"
    }
}
