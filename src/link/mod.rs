//! Communication links.
//!
//! A [`Link`] is one vehicle-facing connection. Its transport lives on a
//! dedicated link thread (see `worker`); the `Link` value itself only holds
//! shared state and a command queue into that thread, so every method here
//! is safe to call from any thread.

mod config;
mod liveness;
mod worker;

pub use config::{LinkConfiguration, SharedLinkConfiguration};
pub use liveness::{LivenessEvent, LivenessTimer, LivenessTracker};

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::channel::ChannelAllocator;
use crate::error::{Error, Result};
use crate::types::{ChannelId, ConnectionState, LinkId, TrafficStats, VehicleId};
use worker::{Command, WorkerHandle};

/// Events announced by a link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Raw chunk read from the transport.
    BytesReceived { link: LinkId, bytes: Bytes },
    /// Buffer written to the transport.
    BytesSent { link: LinkId, bytes: Bytes },
    Connected,
    Disconnected,
    /// Failure to connect or an I/O error on an open link.
    CommunicationError { title: String, message: String },
    VehicleLinkLost(VehicleId),
    VehicleLinkRegained(VehicleId),
    /// The last vehicle reference of a non-persistent link went away.
    TeardownRequested,
}

/// Result of a successful `connect()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Transport is open and the link thread is running.
    Connected,
    /// The link was not Disconnected; nothing was done.
    AlreadyActive(ConnectionState),
}

/// Starts the task consuming a link's events. Invoked on the first connect,
/// which always runs inside a tokio runtime.
pub(crate) type RouterFactory =
    Box<dyn FnOnce(broadcast::Receiver<LinkEvent>) -> JoinHandle<()> + Send>;

enum Router {
    Detached,
    Pending(RouterFactory),
    Running(JoinHandle<()>),
}

/// State shared between a link and its thread.
pub(crate) struct Shared {
    pub(crate) id: LinkId,
    pub(crate) config: SharedLinkConfiguration,
    allocator: Arc<ChannelAllocator>,
    state: watch::Sender<ConnectionState>,
    pub(crate) channels: RwLock<Vec<ChannelId>>,
    decoded_first_frame: AtomicBool,
    pub(crate) stats: Mutex<TrafficStats>,
    events: broadcast::Sender<LinkEvent>,
}

impl Shared {
    pub(crate) fn emit(&self, event: LinkEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn communication_error(&self, error: &Error) {
        self.emit(LinkEvent::CommunicationError {
            title: error.title().to_string(),
            message: error.to_string(),
        });
    }

    /// Compare-and-set the connection state.
    pub(crate) fn transition(
        &self,
        from: ConnectionState,
        to: ConnectionState,
    ) -> std::result::Result<(), ConnectionState> {
        let mut current = from;
        let changed = self.state.send_if_modified(|state| {
            current = *state;
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(link = %self.config.name, from = %from, to = %to, "State change");
            Ok(())
        } else {
            Err(current)
        }
    }

    /// Move to Disconnected from wherever the link is.
    pub(crate) fn finish(&self) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                return false;
            }
            if !state.can_transition_to(ConnectionState::Disconnected) {
                tracing::error!(
                    link = %self.config.name,
                    error = %Error::InvalidStateTransition {
                        from: *state,
                        to: ConnectionState::Disconnected,
                    },
                    "Link state machine defect"
                );
            }
            *state = ConnectionState::Disconnected;
            true
        });
    }

    pub(crate) fn release_channels(&self) {
        let channels = std::mem::take(&mut *self.channels.write());
        if channels.is_empty() {
            return;
        }
        if let Err(e) = self.allocator.free_all(&channels) {
            tracing::error!(link = %self.config.name, error = %e, "Failed to release channels");
        } else {
            tracing::debug!(link = %self.config.name, channels = ?channels, "Released channels");
        }
    }
}

/// A vehicle communication link.
///
/// Created by the link manager. Dropping the last `Arc<Link>` stops the
/// link thread without waiting for it; call [`Link::disconnect`] for an
/// orderly shutdown.
pub struct Link {
    shared: Arc<Shared>,
    worker: Mutex<Option<WorkerHandle>>,
    references: Mutex<u32>,
    vehicles: Mutex<BTreeSet<VehicleId>>,
    teardown: Mutex<Option<mpsc::UnboundedSender<LinkId>>>,
    router: Mutex<Router>,
}

impl Link {
    pub(crate) fn new(config: SharedLinkConfiguration, allocator: Arc<ChannelAllocator>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            shared: Arc::new(Shared {
                id: LinkId::new(),
                config,
                allocator,
                state,
                channels: RwLock::new(Vec::new()),
                decoded_first_frame: AtomicBool::new(false),
                stats: Mutex::new(TrafficStats::default()),
                events,
            }),
            worker: Mutex::new(None),
            references: Mutex::new(0),
            vehicles: Mutex::new(BTreeSet::new()),
            teardown: Mutex::new(None),
            router: Mutex::new(Router::Detached),
        }
    }

    /// Open the transport and start the link thread.
    ///
    /// Resolves once the transport is open or the attempt failed. A link
    /// that is not Disconnected is left untouched.
    pub async fn connect(&self) -> Result<ConnectOutcome> {
        let ready = {
            let mut slot = self.worker.lock();

            // Leaving Disconnected only happens here, under the slot lock
            let current = self.state();
            if current != ConnectionState::Disconnected {
                tracing::debug!(link = %self.name(), state = %current, "Link already active");
                return Ok(ConnectOutcome::AlreadyActive(current));
            }

            // A thread that stopped on its own has already released everything
            drop(slot.take());

            let channels = match self.shared.allocator.allocate_batch(self.config().channel_count()) {
                Ok(channels) => channels,
                Err(e) => {
                    tracing::warn!(link = %self.name(), error = %e, "No channel for link");
                    self.shared.communication_error(&e);
                    return Err(e);
                }
            };
            tracing::debug!(link = %self.name(), channels = ?channels, "Allocated channels");
            *self.shared.channels.write() = channels;

            if let Err(current) = self
                .shared
                .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
            {
                self.shared.release_channels();
                return Ok(ConnectOutcome::AlreadyActive(current));
            }
            self.start_router();

            let vehicles = self.vehicles.lock().iter().copied().collect();
            match worker::spawn(Arc::clone(&self.shared), vehicles) {
                Ok((handle, ready)) => {
                    *slot = Some(handle);
                    ready
                }
                Err(e) => {
                    self.shared.release_channels();
                    self.shared.finish();
                    tracing::error!(link = %self.name(), error = %e, "Failed to start link thread");
                    self.shared.communication_error(&e);
                    return Err(e);
                }
            }
        };

        match ready.await {
            Ok(Ok(())) => Ok(ConnectOutcome::Connected),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Internal(format!(
                "link thread for {} exited during connect",
                self.name()
            ))),
        }
    }

    /// Stop the link and wait until its thread has exited.
    ///
    /// Returns `Ok(false)` when this call did not perform the disconnect
    /// (already Disconnected, or another caller is disconnecting).
    pub async fn disconnect(&self) -> Result<bool> {
        let handle = {
            let mut slot = self.worker.lock();
            let mut previous = ConnectionState::Disconnected;
            self.shared.state.send_if_modified(|state| {
                previous = *state;
                if state.is_active() {
                    *state = ConnectionState::Disconnecting;
                    true
                } else {
                    false
                }
            });

            match previous {
                ConnectionState::Disconnected => {
                    drop(slot.take());
                    return Ok(false);
                }
                ConnectionState::Disconnecting => None,
                ConnectionState::Connecting | ConnectionState::Connected => slot.take(),
            }
        };

        match handle {
            Some(handle) => {
                tracing::info!(link = %self.name(), "Disconnecting link");
                handle.shutdown().await;
                Ok(true)
            }
            None => {
                self.wait_for_state(ConnectionState::Disconnected).await?;
                Ok(false)
            }
        }
    }

    /// Queue `bytes` for the link thread and return immediately.
    pub fn write_bytes(&self, bytes: impl Into<Bytes>) -> Result<()> {
        self.send_command(Command::Write(bytes.into()))
    }

    /// Attribute a decoded frame to `vehicle`.
    pub fn note_frame(&self, vehicle: VehicleId) {
        let at = Instant::now();
        if !self.shared.decoded_first_frame.swap(true, Ordering::AcqRel) {
            tracing::debug!(link = %self.name(), vehicle = %vehicle, "First frame decoded");
        }
        let _ = self.send_command(Command::NoteFrame(vehicle, at));
    }

    pub fn add_vehicle_reference(&self) -> u32 {
        let mut references = self.references.lock();
        *references += 1;
        *references
    }

    /// Drop one vehicle reference.
    ///
    /// Reaching zero on a non-persistent link requests a teardown.
    pub fn remove_vehicle_reference(&self) -> Result<u32> {
        let remaining = {
            let mut references = self.references.lock();
            if *references == 0 {
                tracing::error!(link = %self.name(), error = %Error::ReferenceUnderflow, "Vehicle reference defect");
                return Err(Error::ReferenceUnderflow);
            }
            *references -= 1;
            *references
        };

        if remaining == 0 && !self.is_persistent() {
            tracing::info!(link = %self.name(), "Last vehicle reference removed");
            self.shared.emit(LinkEvent::TeardownRequested);
            if let Some(teardown) = self.teardown.lock().as_ref() {
                let _ = teardown.send(self.id());
            }
        }
        Ok(remaining)
    }

    /// Attach a vehicle: one reference plus liveness tracking.
    ///
    /// Attaching a vehicle twice is a no-op.
    pub fn attach_vehicle(&self, vehicle: VehicleId) -> u32 {
        {
            let slot = self.worker.lock();
            if !self.vehicles.lock().insert(vehicle) {
                return self.vehicle_reference_count();
            }
            if let Some(handle) = slot.as_ref() {
                let _ = handle.commands.send(Command::Attach(vehicle));
            }
        }
        tracing::debug!(link = %self.name(), vehicle = %vehicle, "Vehicle attached");
        self.add_vehicle_reference()
    }

    /// Detach a vehicle, dropping its reference and liveness timer.
    pub fn detach_vehicle(&self, vehicle: VehicleId) -> Result<u32> {
        {
            let slot = self.worker.lock();
            if !self.vehicles.lock().remove(&vehicle) {
                tracing::warn!(link = %self.name(), vehicle = %vehicle, "Detach of unknown vehicle");
                return Ok(self.vehicle_reference_count());
            }
            if let Some(handle) = slot.as_ref() {
                let _ = handle.commands.send(Command::Detach(vehicle));
            }
        }
        tracing::debug!(link = %self.name(), vehicle = %vehicle, "Vehicle detached");
        self.remove_vehicle_reference()
    }

    /// Vehicles currently attached.
    pub fn vehicles(&self) -> Vec<VehicleId> {
        self.vehicles.lock().iter().copied().collect()
    }

    pub fn id(&self) -> LinkId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &SharedLinkConfiguration {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Primary channel, if the link holds one.
    pub fn channel(&self) -> Option<ChannelId> {
        self.shared.channels.read().first().copied()
    }

    /// Primary channel or [`ChannelId::UNSET`].
    pub fn channel_or_unset(&self) -> ChannelId {
        self.channel().unwrap_or(ChannelId::UNSET)
    }

    /// Every channel held (mock links hold one per simulated vehicle).
    pub fn channels(&self) -> Vec<ChannelId> {
        self.shared.channels.read().clone()
    }

    pub fn has_channel(&self) -> bool {
        !self.shared.channels.read().is_empty()
    }

    pub fn decoded_first_frame(&self) -> bool {
        self.shared.decoded_first_frame.load(Ordering::Acquire)
    }

    pub fn is_auxiliary(&self) -> bool {
        self.shared.config.auxiliary
    }

    pub fn is_log_replay(&self) -> bool {
        self.shared.config.transport.is_log_replay()
    }

    pub fn is_mock(&self) -> bool {
        self.shared.config.transport.is_mock()
    }

    pub fn is_persistent(&self) -> bool {
        self.shared.config.persistent
    }

    pub fn vehicle_reference_count(&self) -> u32 {
        *self.references.lock()
    }

    pub fn stats(&self) -> TrafficStats {
        *self.shared.stats.lock()
    }

    /// Subscribe to link events.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until the link reaches `state`.
    pub async fn wait_for_state(&self, state: ConnectionState) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        rx.wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| Error::Internal("link state channel closed".into()))
    }

    /// Deliver teardown requests to `notifier` from now on.
    pub(crate) fn set_teardown_notifier(&self, notifier: mpsc::UnboundedSender<LinkId>) {
        *self.teardown.lock() = Some(notifier);
    }

    /// Install the event consumer started on the next connect.
    pub(crate) fn set_router(&self, factory: RouterFactory) {
        *self.router.lock() = Router::Pending(factory);
    }

    /// Abort the event consumer, if any.
    pub(crate) fn stop_router(&self) {
        if let Router::Running(task) = std::mem::replace(&mut *self.router.lock(), Router::Detached) {
            task.abort();
        }
    }

    fn start_router(&self) {
        let mut router = self.router.lock();
        if !matches!(*router, Router::Pending(_)) {
            return;
        }
        if let Router::Pending(factory) = std::mem::replace(&mut *router, Router::Detached) {
            *router = Router::Running(factory(self.subscribe()));
        }
    }

    fn send_command(&self, command: Command) -> Result<()> {
        let slot = self.worker.lock();
        let handle = slot.as_ref().ok_or(Error::NotConnected)?;
        handle
            .commands
            .send(command)
            .map_err(|_| Error::NotConnected)
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().take() {
            handle.cancel();
        }
        if let Router::Running(task) = std::mem::replace(self.router.get_mut(), Router::Detached) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .field("channels", &self.channels())
            .field("references", &self.vehicle_reference_count())
            .finish()
    }
}
