//! Simulated vehicles.
//!
//! A mock link emits HEARTBEATs for `vehicle_count` vehicles (system ids
//! 1..=n) and records everything written to it. Tests hold a [`MockWire`]
//! clone to inject traffic or failures and inspect what the link wrote.

use std::fmt;
use std::future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

use super::Transport;
use crate::error::{Result, TransportError};
use crate::protocol::encode_heartbeat;

/// Mock link parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockConfig {
    /// Number of simulated vehicles.
    #[serde(default = "default_vehicle_count")]
    pub vehicle_count: u8,
    /// Heartbeat period; `None` keeps the simulated vehicles silent.
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Option<Duration>,
    /// Artificial delay before the open completes.
    #[serde(default, with = "humantime_serde")]
    pub open_delay: Duration,
    /// Make every open attempt fail.
    #[serde(default)]
    pub fail_open: bool,
    /// Test handle shared with the transport.
    #[serde(skip)]
    pub wire: MockWire,
}

fn default_vehicle_count() -> u8 {
    1
}
fn default_heartbeat_interval() -> Option<Duration> {
    Some(Duration::from_secs(1))
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            vehicle_count: default_vehicle_count(),
            heartbeat_interval: default_heartbeat_interval(),
            open_delay: Duration::ZERO,
            fail_open: false,
            wire: MockWire::default(),
        }
    }
}

impl MockConfig {
    /// Silent vehicles; traffic only comes from the wire.
    pub fn silent(vehicle_count: u8) -> Self {
        Self {
            vehicle_count,
            heartbeat_interval: None,
            ..Self::default()
        }
    }
}

enum Inbound {
    Data(Bytes),
    Fail(String),
    Panic(String),
    HangUp,
}

struct WireInner {
    written: Mutex<Vec<Bytes>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    opens: AtomicU64,
    closes: AtomicU64,
}

/// Shared test handle to a mock transport.
#[derive(Clone)]
pub struct MockWire {
    inner: Arc<WireInner>,
}

impl Default for MockWire {
    fn default() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(WireInner {
                written: Mutex::new(Vec::new()),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                opens: AtomicU64::new(0),
                closes: AtomicU64::new(0),
            }),
        }
    }
}

impl fmt::Debug for MockWire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockWire")
            .field("writes", &self.inner.written.lock().len())
            .field("opens", &self.open_count())
            .finish()
    }
}

impl MockWire {
    /// Deliver `bytes` as if received from the vehicle side.
    pub fn inject(&self, bytes: impl Into<Bytes>) {
        let _ = self.inner.inbound_tx.send(Inbound::Data(bytes.into()));
    }

    /// Deliver one HEARTBEAT from `system_id`.
    pub fn inject_heartbeat(&self, system_id: u8, sequence: u8) -> Result<()> {
        self.inject(encode_heartbeat(system_id, sequence)?);
        Ok(())
    }

    /// Make the next read fail with an I/O error.
    pub fn inject_error(&self, message: impl Into<String>) {
        let _ = self.inner.inbound_tx.send(Inbound::Fail(message.into()));
    }

    /// Make the next read panic on the link thread.
    pub fn inject_panic(&self, message: impl Into<String>) {
        let _ = self.inner.inbound_tx.send(Inbound::Panic(message.into()));
    }

    /// Make the next read report end of stream.
    pub fn hang_up(&self) {
        let _ = self.inner.inbound_tx.send(Inbound::HangUp);
    }

    /// Every chunk written by the link, in order.
    pub fn written(&self) -> Vec<Bytes> {
        self.inner.written.lock().clone()
    }

    /// All written bytes concatenated.
    pub fn written_bytes(&self) -> Vec<u8> {
        self.inner.written.lock().iter().flat_map(|b| b.iter().copied()).collect()
    }

    pub fn open_count(&self) -> u64 {
        self.inner.opens.load(Ordering::Relaxed)
    }

    pub fn close_count(&self) -> u64 {
        self.inner.closes.load(Ordering::Relaxed)
    }
}

/// Transport with simulated vehicles behind it.
pub struct MockTransport {
    wire: MockWire,
    inbound: Option<mpsc::UnboundedReceiver<Inbound>>,
    heartbeat: Option<Interval>,
    vehicle_count: u8,
    sequence: u8,
}

impl MockTransport {
    /// Open the mock. Only one transport may hold a given wire at a time.
    pub async fn open(config: &MockConfig) -> Result<Self> {
        if !config.open_delay.is_zero() {
            tokio::time::sleep(config.open_delay).await;
        }
        if config.fail_open {
            return Err(TransportError::Mock("simulated open failure".into()).into());
        }

        let inbound = config
            .wire
            .inner
            .inbound_rx
            .lock()
            .take()
            .ok_or_else(|| TransportError::Mock("wire already in use".into()))?;
        config.wire.inner.opens.fetch_add(1, Ordering::Relaxed);

        let heartbeat = config.heartbeat_interval.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        tracing::debug!(vehicles = config.vehicle_count, "Opened mock link");

        Ok(Self {
            wire: config.wire.clone(),
            inbound: Some(inbound),
            heartbeat,
            vehicle_count: config.vehicle_count,
            sequence: 0,
        })
    }

    fn heartbeats(&mut self) -> Result<Bytes> {
        let mut burst = Vec::new();
        for system_id in 1..=self.vehicle_count {
            burst.extend_from_slice(&encode_heartbeat(system_id, self.sequence)?);
        }
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Bytes::from(burst))
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        let inbound = self.inbound.as_mut().ok_or(TransportError::Closed)?;

        let heartbeat = self.heartbeat.as_mut();
        let tick = async move {
            match heartbeat {
                Some(interval) => {
                    interval.tick().await;
                }
                None => future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            message = inbound.recv() => match message {
                Some(Inbound::Data(bytes)) => Ok(Some(bytes)),
                Some(Inbound::Fail(reason)) => Err(TransportError::ReceiveFailed(reason).into()),
                Some(Inbound::Panic(reason)) => panic!("{reason}"),
                Some(Inbound::HangUp) | None => Ok(None),
            },
            () = tick => self.heartbeats().map(Some),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.wire.inner.written.lock().push(Bytes::copy_from_slice(data));
        Ok(data.len())
    }

    async fn close(&mut self) -> Result<()> {
        self.heartbeat = None;
        Ok(())
    }

    fn transport_type(&self) -> &'static str {
        "mock"
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.wire.inner.closes.fetch_add(1, Ordering::Relaxed);
        // Hand the inbound queue back so the wire can be reopened
        if let Some(inbound) = self.inbound.take() {
            *self.wire.inner.inbound_rx.lock() = Some(inbound);
        }
    }
}
