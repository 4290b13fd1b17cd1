//! Link manager.
//!
//! Owns the link registry and the shared channel pool, routes validated
//! frames from every link to registered sinks, and tears down
//! non-persistent links once their last vehicle reference is gone.
//!
//! A link's frame router is spawned on the runtime that first connects the
//! link, so links may be registered before any runtime exists.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::channel::{ChannelAllocator, DEFAULT_CHANNEL_POOL_SIZE};
use crate::error::{Error, Result};
use crate::link::{Link, LinkConfiguration, LinkEvent, RouterFactory, SharedLinkConfiguration};
use crate::protocol::{FrameScanner, MavFrame};
use crate::types::{ChannelId, ConnectionState, LinkId, VehicleId};

/// Link manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Number of protocol channels shared by all links.
    #[serde(default = "default_channel_pool_size")]
    pub channel_pool_size: u8,

    /// Maximum number of registered links.
    #[serde(default = "default_max_links")]
    pub max_links: usize,

    /// Capacity of the manager event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// How long `shutdown` waits for each link to stop.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

fn default_channel_pool_size() -> u8 {
    DEFAULT_CHANNEL_POOL_SIZE
}
fn default_max_links() -> usize {
    32
}
fn default_event_capacity() -> usize {
    256
}
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            channel_pool_size: default_channel_pool_size(),
            max_links: default_max_links(),
            event_capacity: default_event_capacity(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl ManagerConfig {
    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.channel_pool_size == 0 {
            return Err(Error::InvalidConfig("channel_pool_size must be positive".into()));
        }
        if self.channel_pool_size == ChannelId::UNSET.as_u8() {
            return Err(Error::InvalidConfig(format!(
                "channel_pool_size must be below {}",
                ChannelId::UNSET.as_u8()
            )));
        }
        if self.max_links == 0 {
            return Err(Error::InvalidConfig("max_links must be positive".into()));
        }
        if self.event_capacity == 0 {
            return Err(Error::InvalidConfig("event_capacity must be positive".into()));
        }
        Ok(())
    }
}

/// A validated frame attributed to the link and channel it arrived on.
#[derive(Debug, Clone)]
pub struct RoutedFrame {
    pub link: LinkId,
    pub channel: ChannelId,
    /// Frame came from an auxiliary (sensor) link.
    pub auxiliary: bool,
    pub frame: MavFrame,
}

/// Consumer of routed frames (a MAVLink decoder, a logger, ...).
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: &RoutedFrame);
}

/// Event types for the link manager.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    LinkCreated(LinkId),
    LinkRemoved(LinkId),
    /// Frame received on any link.
    Frame(RoutedFrame),
}

/// Registry of links sharing one channel pool.
///
/// Unreferenced non-persistent links are only torn down after
/// [`LinkManager::start`]; until then a link whose last vehicle reference
/// goes away emits [`LinkEvent::TeardownRequested`] and stays registered.
pub struct LinkManager {
    config: ManagerConfig,
    allocator: Arc<ChannelAllocator>,
    links: DashMap<LinkId, Arc<Link>>,
    sinks: Arc<RwLock<Vec<Arc<dyn FrameSink>>>>,
    event_tx: broadcast::Sender<ManagerEvent>,
    /// Set by `start`; links created before then are wired up there.
    teardown_tx: Mutex<Option<mpsc::UnboundedSender<LinkId>>>,
    teardown_task: Mutex<Option<JoinHandle<()>>>,
}

impl LinkManager {
    /// Create a manager with its own channel pool.
    pub fn new(config: ManagerConfig) -> Self {
        let allocator = Arc::new(ChannelAllocator::new(config.channel_pool_size));
        Self::with_allocator(config, allocator)
    }

    /// Create a manager on an existing channel pool.
    pub fn with_allocator(config: ManagerConfig, allocator: Arc<ChannelAllocator>) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            config,
            allocator,
            links: DashMap::new(),
            sinks: Arc::new(RwLock::new(Vec::new())),
            event_tx,
            teardown_tx: Mutex::new(None),
            teardown_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Shared channel pool.
    pub fn allocator(&self) -> &Arc<ChannelAllocator> {
        &self.allocator
    }

    /// Subscribe to manager events.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.event_tx.subscribe()
    }

    /// Register a consumer for every routed frame.
    pub fn register_sink(&self, sink: Arc<dyn FrameSink>) {
        self.sinks.write().push(sink);
    }

    /// Start the teardown loop. Must be called inside a tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.teardown_tx.lock();
        if slot.is_some() {
            return Err(Error::Internal("link manager already started".into()));
        }
        let (teardown_tx, mut teardown_rx) = mpsc::unbounded_channel();
        for link in self.links() {
            link.set_teardown_notifier(teardown_tx.clone());
        }
        *slot = Some(teardown_tx);
        drop(slot);

        let manager: Weak<Self> = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            while let Some(id) = teardown_rx.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_teardown(id).await;
            }
        });
        *self.teardown_task.lock() = Some(task);
        Ok(())
    }

    /// Register a new link. The link is not connected.
    ///
    /// Works outside a tokio runtime; frame routing begins on first connect.
    pub fn create_link(&self, config: LinkConfiguration) -> Result<Arc<Link>> {
        config.validate()?;

        if self.links.len() >= self.config.max_links {
            return Err(Error::InvalidConfig(format!(
                "maximum number of links ({}) reached",
                self.config.max_links
            )));
        }
        if self.link_by_name(&config.name).is_some() {
            return Err(Error::InvalidConfig(format!(
                "a link named {} already exists",
                config.name
            )));
        }

        let link = Arc::new(Link::new(config.shared(), Arc::clone(&self.allocator)));
        let id = link.id();
        link.set_router(self.router_factory(&link));

        {
            // Held across the insert so `start` sees every link
            let teardown = self.teardown_tx.lock();
            if let Some(teardown) = teardown.as_ref() {
                link.set_teardown_notifier(teardown.clone());
            }
            self.links.insert(id, Arc::clone(&link));
        }

        tracing::info!(
            link = %link.name(),
            id = %id,
            transport = %link.config().transport,
            "Created link"
        );
        let _ = self.event_tx.send(ManagerEvent::LinkCreated(id));

        Ok(link)
    }

    /// Register a link and connect it; the link is removed again on failure.
    pub async fn create_connected_link(&self, config: LinkConfiguration) -> Result<Arc<Link>> {
        let link = self.create_link(config)?;
        match link.connect().await {
            Ok(_) => Ok(link),
            Err(e) => {
                if let Err(remove_err) = self.remove_link(link.id()) {
                    tracing::debug!(link = %link.name(), error = %remove_err, "Failed link not removed");
                }
                Err(e)
            }
        }
    }

    /// Unregister a disconnected, unreferenced link.
    pub fn remove_link(&self, id: LinkId) -> Result<Arc<Link>> {
        let busy = |link: &Arc<Link>| {
            link.state() != ConnectionState::Disconnected || link.vehicle_reference_count() > 0
        };

        let link = self.link(id).ok_or(Error::LinkNotFound(id))?;
        if busy(&link) {
            return Err(Error::LinkBusy(id));
        }
        let (_, link) = self
            .links
            .remove_if(&id, |_, link| !busy(link))
            .ok_or(Error::LinkBusy(id))?;

        link.stop_router();

        tracing::info!(link = %link.name(), id = %id, "Removed link");
        let _ = self.event_tx.send(ManagerEvent::LinkRemoved(id));
        Ok(link)
    }

    /// Get all links.
    pub fn links(&self) -> Vec<Arc<Link>> {
        self.links.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn link(&self, id: LinkId) -> Option<Arc<Link>> {
        self.links.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn link_by_name(&self, name: &str) -> Option<Arc<Link>> {
        self.links
            .iter()
            .find(|entry| entry.value().name() == name)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Configurations of every registered link.
    pub fn configurations(&self) -> Vec<SharedLinkConfiguration> {
        self.links
            .iter()
            .map(|entry| Arc::clone(entry.value().config()))
            .collect()
    }

    /// Disconnect every link, waiting for each to stop.
    pub async fn disconnect_all(&self) {
        for link in self.links() {
            let stop = tokio::time::timeout(self.config.shutdown_timeout, link.disconnect());
            match stop.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!(link = %link.name(), error = %e, "Failed to disconnect link"),
                Err(_) => tracing::warn!(link = %link.name(), "Timed out disconnecting link"),
            }
        }
    }

    /// Stop background tasks, disconnect and unregister every link.
    pub async fn shutdown(&self) {
        if let Some(task) = self.teardown_task.lock().take() {
            task.abort();
        }
        self.disconnect_all().await;

        for entry in self.links.iter() {
            entry.value().stop_router();
        }
        self.links.clear();
        tracing::info!("Link manager shut down");
    }

    async fn handle_teardown(&self, id: LinkId) {
        let Some(link) = self.link(id) else {
            return;
        };
        // A reference may have been added back since the request
        if link.is_persistent() || link.vehicle_reference_count() > 0 {
            tracing::debug!(link = %link.name(), "Teardown no longer needed");
            return;
        }

        tracing::info!(link = %link.name(), "Tearing down unreferenced link");
        if let Err(e) = link.disconnect().await {
            tracing::warn!(link = %link.name(), error = %e, "Failed to disconnect link");
        }
        if let Err(e) = self.remove_link(id) {
            tracing::debug!(link = %link.name(), error = %e, "Link kept after teardown");
        }
    }

    fn router_factory(&self, link: &Arc<Link>) -> RouterFactory {
        let weak = Arc::downgrade(link);
        let sinks = Arc::clone(&self.sinks);
        let event_tx = self.event_tx.clone();
        let name = link.name().to_string();

        Box::new(move |events: broadcast::Receiver<LinkEvent>| {
            tokio::spawn(route_frames(weak, events, sinks, event_tx, name))
        })
    }
}

/// Scan a link's received bytes and hand every frame to the sinks.
async fn route_frames(
    link: Weak<Link>,
    mut events: broadcast::Receiver<LinkEvent>,
    sinks: Arc<RwLock<Vec<Arc<dyn FrameSink>>>>,
    event_tx: broadcast::Sender<ManagerEvent>,
    name: String,
) {
    let mut scanner = FrameScanner::new();
    loop {
        match events.recv().await {
            Ok(LinkEvent::BytesReceived { bytes, .. }) => {
                let Some(link) = link.upgrade() else {
                    break;
                };
                for frame in scanner.push(&bytes) {
                    link.note_frame(frame.vehicle());
                    let routed = RoutedFrame {
                        link: link.id(),
                        channel: frame_channel(&link, frame.vehicle()),
                        auxiliary: link.is_auxiliary(),
                        frame,
                    };
                    for sink in sinks.read().iter() {
                        sink.on_frame(&routed);
                    }
                    let _ = event_tx.send(ManagerEvent::Frame(routed));
                }
            }
            Ok(LinkEvent::Disconnected) => scanner.reset(),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(link = %name, skipped, "Frame router lagged behind link events");
                scanner.reset();
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    tracing::trace!(link = %name, "Frame router stopped");
}

impl Drop for LinkManager {
    fn drop(&mut self) {
        if let Some(task) = self.teardown_task.get_mut().take() {
            task.abort();
        }
        for entry in self.links.iter() {
            entry.value().stop_router();
        }
    }
}

/// Channel a frame is attributed to. Simulated vehicles each own one
/// channel of their link's batch, in system id order.
fn frame_channel(link: &Link, vehicle: VehicleId) -> ChannelId {
    let channels = link.channels();
    if link.is_mock() {
        if let Some(channel) = usize::from(vehicle.0)
            .checked_sub(1)
            .and_then(|index| channels.get(index))
        {
            return *channel;
        }
    }
    channels.first().copied().unwrap_or(ChannelId::UNSET)
}
