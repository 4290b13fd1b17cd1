//! Transport layer for Skylink.
//!
//! Each transport is an opaque duplex byte pipe. A transport instance is
//! created, driven and dropped on the owning link's thread only, which is why
//! the trait takes `&mut self` and does not require `Sync`.

mod log_replay;
mod mock;
mod serial;
mod tcp;
mod udp;

pub use log_replay::{
    encode_record, LogReplayConfig, LogReplayTransport, MAX_PLAYBACK_SPEED, MIN_PLAYBACK_SPEED,
};
pub use mock::{MockConfig, MockTransport, MockWire};
pub use serial::{SerialConfig, SerialTransport};
pub use tcp::{TcpConfig, TcpTransport};
pub use udp::{UdpConfig, UdpTransport};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Size of the scratch buffer used by socket transports.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Byte pipe driven by a link thread.
#[async_trait]
pub trait Transport: Send {
    /// Wait for the next inbound chunk.
    ///
    /// `Ok(None)` means the peer closed the stream. Implementations must be
    /// cancel-safe: dropping the future before completion loses no data.
    async fn read_chunk(&mut self) -> Result<Option<Bytes>>;

    /// Write `data`, returning the number of bytes put on the wire.
    ///
    /// Transports that cannot deliver `data` (read-only, or no known peer)
    /// return `Ok(0)`; the link counts that as a discarded write.
    async fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Release the underlying handle.
    async fn close(&mut self) -> Result<()>;

    /// Get transport type name.
    fn transport_type(&self) -> &'static str;
}

/// Closed set of transports a link can be built on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportKind {
    /// Serial port (telemetry radio, USB autopilot).
    Serial(SerialConfig),
    /// UDP listener that answers every peer it hears from.
    Udp(UdpConfig),
    /// TCP client.
    Tcp(TcpConfig),
    /// Replay of a recorded telemetry log.
    LogReplay(LogReplayConfig),
    /// Simulated vehicles for testing.
    Mock(MockConfig),
}

impl TransportKind {
    /// Number of protocol channels a link on this transport needs.
    pub fn channel_count(&self) -> usize {
        match self {
            Self::Mock(mock) => usize::from(mock.vehicle_count.max(1)),
            _ => 1,
        }
    }

    pub fn is_log_replay(&self) -> bool {
        matches!(self, Self::LogReplay(_))
    }

    pub fn is_mock(&self) -> bool {
        matches!(self, Self::Mock(_))
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serial(c) => write!(f, "serial:{}@{}", c.port_name, c.baud_rate),
            Self::Udp(c) => write!(f, "udp:{}", c.local_port),
            Self::Tcp(c) => write!(f, "tcp:{}", c.address),
            Self::LogReplay(c) => write!(f, "replay:{}", c.path.display()),
            Self::Mock(c) => write!(f, "mock:{}", c.vehicle_count),
        }
    }
}

/// Open the transport described by `kind`.
pub async fn open(kind: &TransportKind) -> Result<Box<dyn Transport>> {
    match kind {
        TransportKind::Serial(config) => {
            let transport = SerialTransport::open(config).await?;
            Ok(Box::new(transport))
        }
        TransportKind::Udp(config) => {
            let transport = UdpTransport::bind(config).await?;
            Ok(Box::new(transport))
        }
        TransportKind::Tcp(config) => {
            let transport = TcpTransport::connect(config).await?;
            Ok(Box::new(transport))
        }
        TransportKind::LogReplay(config) => {
            let transport = LogReplayTransport::open(config).await?;
            Ok(Box::new(transport))
        }
        TransportKind::Mock(config) => {
            let transport = MockTransport::open(config).await?;
            Ok(Box::new(transport))
        }
    }
}
