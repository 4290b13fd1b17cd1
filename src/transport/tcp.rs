//! TCP client transport.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{Transport, READ_CHUNK_SIZE};
use crate::error::{Result, TransportError};

/// TCP link parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Remote address (e.g., SITL on 127.0.0.1:5760).
    pub address: SocketAddr,
    /// Enable TCP_NODELAY.
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
}

fn default_nodelay() -> bool {
    true
}

/// TCP transport.
pub struct TcpTransport {
    stream: TcpStream,
    remote_addr: SocketAddr,
    buf: Vec<u8>,
}

impl TcpTransport {
    /// Connect to the configured address.
    ///
    /// The caller bounds this with the link's connect timeout.
    pub async fn connect(config: &TcpConfig) -> Result<Self> {
        let stream = TcpStream::connect(config.address)
            .await
            .map_err(|e| TransportError::Tcp(format!("connect {} failed: {e}", config.address)))?;

        if config.nodelay {
            stream
                .set_nodelay(true)
                .map_err(|e| TransportError::Tcp(e.to_string()))?;
        }

        tracing::info!(remote = %config.address, "Connected TCP link");

        Ok(Self {
            stream,
            remote_addr: config.address,
            buf: vec![0u8; READ_CHUNK_SIZE],
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        let n = self
            .stream
            .read(&mut self.buf)
            .await
            .map_err(|e| TransportError::ReceiveFailed(format!("{}: {e}", self.remote_addr)))?;

        if n == 0 {
            tracing::debug!(remote = %self.remote_addr, "TCP peer closed connection");
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(&self.buf[..n])))
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.stream
            .write_all(data)
            .await
            .map_err(|e| TransportError::SendFailed(format!("{}: {e}", self.remote_addr)))?;
        Ok(data.len())
    }

    async fn close(&mut self) -> Result<()> {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!(remote = %self.remote_addr, error = %e, "TCP shutdown failed");
        }
        Ok(())
    }

    fn transport_type(&self) -> &'static str {
        "tcp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpTransport::connect(&TcpConfig { address, nodelay: true }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_echo_and_hangup() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 64];
                if let Ok(n) = stream.read(&mut buf).await {
                    let _ = stream.write_all(&buf[..n]).await;
                }
                // Dropping the stream hangs up
            }
        });

        let mut transport = TcpTransport::connect(&TcpConfig { address, nodelay: true })
            .await
            .unwrap();
        assert_eq!(transport.remote_addr(), address);

        transport.write(b"mavlink").await.unwrap();
        let chunk = transport.read_chunk().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"mavlink");

        assert!(transport.read_chunk().await.unwrap().is_none());
    }
}
