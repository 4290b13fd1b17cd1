//! UDP transport.
//!
//! Binds a local port and talks to every configured target plus every peer
//! it has heard from, the way ground stations listen on 14550 for vehicles.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket as TokioUdpSocket;

use super::Transport;
use crate::error::{Result, TransportError};

const MAX_DATAGRAM: usize = 65536;

/// UDP link parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpConfig {
    /// Local port to listen on (0 = ephemeral).
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// Local address to bind (defaults to all interfaces).
    #[serde(default)]
    pub bind_addr: Option<IpAddr>,
    /// Hosts to send to before any peer has been heard from.
    #[serde(default)]
    pub target_hosts: Vec<SocketAddr>,
}

fn default_local_port() -> u16 {
    crate::DEFAULT_UDP_PORT
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            local_port: default_local_port(),
            bind_addr: None,
            target_hosts: Vec::new(),
        }
    }
}

/// UDP transport.
pub struct UdpTransport {
    socket: TokioUdpSocket,
    targets: Vec<SocketAddr>,
    buf: Vec<u8>,
}

impl UdpTransport {
    /// Bind the local socket.
    pub async fn bind(config: &UdpConfig) -> Result<Self> {
        let ip = config.bind_addr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let addr = SocketAddr::new(ip, config.local_port);
        let socket = TokioUdpSocket::bind(addr)
            .await
            .map_err(|e| TransportError::Udp(format!("bind {addr} failed: {e}")))?;

        tracing::info!(local = %addr, targets = config.target_hosts.len(), "Bound UDP link");

        Ok(Self {
            socket,
            targets: config.target_hosts.clone(),
            buf: vec![0u8; MAX_DATAGRAM],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| TransportError::Udp(e.to_string()).into())
    }

    /// Current send targets (configured and learned).
    pub fn targets(&self) -> &[SocketAddr] {
        &self.targets
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        let (len, from) = self
            .socket
            .recv_from(&mut self.buf)
            .await
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;

        if !self.targets.contains(&from) {
            tracing::debug!(peer = %from, "Learned UDP peer");
            self.targets.push(from);
        }

        Ok(Some(Bytes::copy_from_slice(&self.buf[..len])))
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.targets.is_empty() {
            tracing::debug!(bytes = data.len(), "No UDP peer yet, dropping write");
            return Ok(0);
        }

        for target in &self.targets {
            self.socket
                .send_to(data, *target)
                .await
                .map_err(|e| TransportError::SendFailed(format!("{target}: {e}")))?;
        }
        Ok(data.len())
    }

    async fn close(&mut self) -> Result<()> {
        // UDP sockets don't need explicit closing
        Ok(())
    }

    fn transport_type(&self) -> &'static str {
        "udp"
    }
}
