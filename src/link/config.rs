//! Link configuration.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transport::TransportKind;

/// Configuration shared between the manager registry and the links built from it.
pub type SharedLinkConfiguration = Arc<LinkConfiguration>;

/// Immutable description of one link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfiguration {
    /// Human readable name, also used for the link thread name.
    pub name: String,
    /// Transport kind and its parameters.
    pub transport: TransportKind,
    /// Sensor or other high-priority auxiliary transport.
    ///
    /// Auxiliary links carry no vehicle liveness tracking and their frames
    /// are flagged when routed.
    #[serde(default)]
    pub auxiliary: bool,
    /// Keep the link when its last vehicle goes away.
    #[serde(default)]
    pub persistent: bool,
    /// Upper bound for opening the transport.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Silence after which a vehicle is reported lost.
    #[serde(default = "default_liveness_timeout", with = "humantime_serde")]
    pub liveness_timeout: Duration,
    /// Cadence of liveness checks on the link thread.
    #[serde(default = "default_liveness_check_interval", with = "humantime_serde")]
    pub liveness_check_interval: Duration,
    /// Capacity of the link event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_liveness_timeout() -> Duration {
    Duration::from_millis(3500)
}
fn default_liveness_check_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_event_capacity() -> usize {
    1024
}

impl LinkConfiguration {
    pub fn new(name: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            name: name.into(),
            transport,
            auxiliary: false,
            persistent: false,
            connect_timeout: default_connect_timeout(),
            liveness_timeout: default_liveness_timeout(),
            liveness_check_interval: default_liveness_check_interval(),
            event_capacity: default_event_capacity(),
        }
    }

    /// Mark the link as surviving the loss of its last vehicle.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Mark the link as an auxiliary (sensor) transport.
    pub fn auxiliary(mut self) -> Self {
        self.auxiliary = true;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    pub fn with_liveness_check_interval(mut self, interval: Duration) -> Self {
        self.liveness_check_interval = interval;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Freeze the configuration for sharing.
    pub fn shared(self) -> SharedLinkConfiguration {
        Arc::new(self)
    }

    /// Number of protocol channels the link needs while connected.
    pub fn channel_count(&self) -> usize {
        self.transport.channel_count()
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidConfig("link name must not be empty".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::InvalidConfig(format!(
                "link {}: connect_timeout must be positive",
                self.name
            )));
        }
        if self.liveness_timeout.is_zero() || self.liveness_check_interval.is_zero() {
            return Err(Error::InvalidConfig(format!(
                "link {}: liveness durations must be positive",
                self.name
            )));
        }
        if self.event_capacity == 0 {
            return Err(Error::InvalidConfig(format!(
                "link {}: event_capacity must be positive",
                self.name
            )));
        }
        match &self.transport {
            TransportKind::Mock(mock) if mock.vehicle_count == 0 => Err(Error::InvalidConfig(
                format!("link {}: mock links need at least one vehicle", self.name),
            )),
            TransportKind::LogReplay(replay) => replay.validate(),
            TransportKind::Serial(serial) => serial.validate(),
            _ => Ok(()),
        }
    }
}
