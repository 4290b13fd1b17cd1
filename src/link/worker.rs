//! Link thread.
//!
//! Every connected link owns one OS thread running a current-thread tokio
//! runtime. The transport is opened, driven and closed on that thread only;
//! everything else reaches it through the command queue.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::liveness::{LivenessEvent, LivenessTracker};
use super::{LinkEvent, Shared};
use crate::error::{Error, ErrorContext, Result};
use crate::transport::{self, Transport};
use crate::types::{ConnectionState, VehicleId};

/// Work handed to the link thread.
#[derive(Debug)]
pub(crate) enum Command {
    Write(Bytes),
    NoteFrame(VehicleId, Instant),
    Attach(VehicleId),
    Detach(VehicleId),
}

/// Handle kept by the link while its thread runs.
pub(crate) struct WorkerHandle {
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    thread: Option<thread::JoinHandle<()>>,
    exited: oneshot::Receiver<()>,
}

impl WorkerHandle {
    /// Ask the thread to stop without waiting for it.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop the thread and wait until it has exited.
    pub(crate) async fn shutdown(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.exited).await;

        if let Some(thread) = self.thread.take() {
            let name = thread.thread().name().unwrap_or("link").to_string();
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => tracing::error!(thread = %name, "Link thread panicked"),
                Err(e) => tracing::error!(thread = %name, error = %e, "Failed to join link thread"),
            }
        }
    }
}

/// Why the read/write loop stopped.
enum Exit {
    Requested,
    EndOfStream,
    Failed(Error),
}

/// Spawn the link thread. The returned receiver resolves once the transport
/// is open or the connect attempt has been abandoned.
pub(crate) fn spawn(
    shared: Arc<Shared>,
    vehicles: Vec<VehicleId>,
) -> Result<(WorkerHandle, oneshot::Receiver<Result<()>>)> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let (commands_tx, commands) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    let (exited_tx, exited) = oneshot::channel();
    let cancel = CancellationToken::new();

    let mut tracker = LivenessTracker::new(shared.config.liveness_timeout);
    if !shared.config.auxiliary {
        let now = Instant::now();
        for vehicle in vehicles {
            tracker.attach(vehicle, now);
        }
    }

    let recovery = Arc::clone(&shared);
    let worker = Worker {
        shared: Arc::clone(&shared),
        commands,
        cancel: cancel.clone(),
        tracker,
    };

    let thread = thread::Builder::new()
        .name(format!("link-{}", shared.config.name))
        .spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(worker.run(ready_tx))));
            if let Err(payload) = outcome {
                recover_from_panic(&recovery, payload.as_ref());
            }
            drop(runtime);
            let _ = exited_tx.send(());
        })?;

    Ok((
        WorkerHandle {
            commands: commands_tx,
            cancel,
            thread: Some(thread),
            exited,
        },
        ready_rx,
    ))
}

/// Put a link whose thread panicked back into Disconnected. The transport
/// and queued commands were dropped while unwinding.
fn recover_from_panic(shared: &Shared, payload: &(dyn Any + Send)) {
    let reason = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    let error = Error::Internal(format!("link thread panicked: {reason}"));
    tracing::error!(link = %shared.config.name, error = %error, "Link thread panicked");

    shared.communication_error(&error);
    let _ = shared.transition(ConnectionState::Connected, ConnectionState::Disconnecting);
    shared.release_channels();
    shared.finish();
    shared.emit(LinkEvent::Disconnected);
}

struct Worker {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    tracker: LivenessTracker,
}

impl Worker {
    async fn run(mut self, ready: oneshot::Sender<Result<()>>) {
        let mut transport = match self.open().await {
            Ok(transport) => transport,
            Err(e) => {
                self.abandon(e, ready);
                return;
            }
        };

        if self
            .shared
            .transition(ConnectionState::Connecting, ConnectionState::Connected)
            .is_err()
        {
            // disconnect() won the race against the open
            if let Err(e) = transport.close().await {
                tracing::debug!(link = %self.shared.config.name, error = %e, "Close after aborted connect failed");
            }
            drop(transport);
            self.abandon(Error::ConnectionAborted, ready);
            return;
        }

        tracing::info!(
            link = %self.shared.config.name,
            transport = transport.transport_type(),
            channels = ?self.shared.channels.read().as_slice(),
            "Link connected"
        );
        self.shared.emit(LinkEvent::Connected);
        let _ = ready.send(Ok(()));

        let exit = self.drive(transport.as_mut()).await;
        self.teardown(transport, exit).await;
    }

    async fn open(&self) -> Result<Box<dyn Transport>> {
        let config = &self.shared.config;
        tracing::debug!(link = %config.name, transport = %config.transport, "Opening transport");

        tokio::select! {
            biased;

            () = self.cancel.cancelled() => Err(Error::ConnectionAborted),
            result = tokio::time::timeout(config.connect_timeout, transport::open(&config.transport)) => {
                match result {
                    Ok(Ok(transport)) => Ok(transport),
                    Ok(Err(e)) => Err(Error::TransportOpenFailed {
                        link: config.name.clone(),
                        reason: e.to_string(),
                    }),
                    Err(_) => Err(Error::ConnectionTimeout),
                }
            }
        }
    }

    /// Roll back a connect attempt that never reached Connected.
    fn abandon(&mut self, error: Error, ready: oneshot::Sender<Result<()>>) {
        self.discard_queued();
        self.shared.release_channels();
        self.shared.finish();

        if matches!(error, Error::ConnectionAborted) {
            tracing::info!(link = %self.shared.config.name, "Connect aborted");
            self.shared.emit(LinkEvent::Disconnected);
        } else {
            tracing::warn!(
                link = %self.shared.config.name,
                error = %error,
                context = %ErrorContext::new("connect").with_link(&self.shared.config.name),
                "Failed to connect link"
            );
            self.shared.communication_error(&error);
        }
        let _ = ready.send(Err(error));
    }

    async fn drive(&mut self, transport: &mut dyn Transport) -> Exit {
        let mut liveness = tokio::time::interval(self.shared.config.liveness_check_interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => return Exit::Requested,

                command = self.commands.recv() => match command {
                    Some(Command::Write(bytes)) => {
                        if let Err(e) = self.write(transport, bytes).await {
                            return Exit::Failed(e);
                        }
                    }
                    Some(Command::NoteFrame(vehicle, at)) => self.note_frame(vehicle, at),
                    Some(Command::Attach(vehicle)) => self.attach(vehicle),
                    Some(Command::Detach(vehicle)) => {
                        self.tracker.detach(vehicle);
                    }
                    // The link itself was dropped
                    None => return Exit::Requested,
                },

                chunk = transport.read_chunk() => match chunk {
                    Ok(Some(bytes)) => self.received(bytes),
                    Ok(None) => return Exit::EndOfStream,
                    Err(e) => return Exit::Failed(e),
                },

                _ = liveness.tick() => self.check_liveness(),
            }
        }
    }

    async fn write(&mut self, transport: &mut dyn Transport, bytes: Bytes) -> Result<()> {
        let written = transport.write(&bytes).await?;
        if written == 0 && !bytes.is_empty() {
            self.shared.stats.lock().writes_discarded += 1;
            tracing::debug!(link = %self.shared.config.name, bytes = bytes.len(), "Transport dropped write");
        } else if written > 0 {
            self.shared.stats.lock().record_sent(written);
            tracing::trace!(link = %self.shared.config.name, bytes = written, "Wrote chunk");
            self.shared.emit(LinkEvent::BytesSent {
                link: self.shared.id,
                bytes,
            });
        }
        Ok(())
    }

    fn received(&mut self, bytes: Bytes) {
        self.shared.stats.lock().record_received(bytes.len());
        tracing::trace!(link = %self.shared.config.name, bytes = bytes.len(), "Read chunk");
        self.shared.emit(LinkEvent::BytesReceived {
            link: self.shared.id,
            bytes,
        });
    }

    fn note_frame(&mut self, vehicle: VehicleId, at: Instant) {
        self.shared.stats.lock().frames_attributed += 1;
        if let Some(LivenessEvent::Regained(vehicle)) = self.tracker.note_frame(vehicle, at) {
            tracing::info!(link = %self.shared.config.name, vehicle = %vehicle, "Vehicle link regained");
            self.shared.emit(LinkEvent::VehicleLinkRegained(vehicle));
        }
    }

    fn attach(&mut self, vehicle: VehicleId) {
        if !self.shared.config.auxiliary && self.tracker.attach(vehicle, Instant::now()) {
            tracing::debug!(link = %self.shared.config.name, vehicle = %vehicle, "Tracking vehicle liveness");
        }
    }

    fn check_liveness(&mut self) {
        for event in self.tracker.check_all(Instant::now()) {
            if let LivenessEvent::Lost(vehicle) = event {
                tracing::warn!(
                    link = %self.shared.config.name,
                    vehicle = %vehicle,
                    timeout = ?self.shared.config.liveness_timeout,
                    "Vehicle link lost"
                );
                self.shared.emit(LinkEvent::VehicleLinkLost(vehicle));
            }
        }
    }

    /// Close the queue and drop whatever is still in it.
    fn discard_queued(&mut self) {
        self.commands.close();
        let mut discarded = 0u64;
        while let Ok(command) = self.commands.try_recv() {
            if matches!(command, Command::Write(_)) {
                discarded += 1;
            }
        }
        if discarded > 0 {
            self.shared.stats.lock().writes_discarded += discarded;
            tracing::debug!(link = %self.shared.config.name, writes = discarded, "Discarded queued writes");
        }
    }

    async fn teardown(&mut self, mut transport: Box<dyn Transport>, exit: Exit) {
        let shared = Arc::clone(&self.shared);
        let name = &shared.config.name;
        match &exit {
            Exit::Failed(e) => {
                tracing::warn!(link = %name, error = %e, "Link I/O failed");
                shared.communication_error(e);
            }
            Exit::EndOfStream => tracing::info!(link = %name, "Link closed by peer"),
            Exit::Requested => tracing::debug!(link = %name, "Link shutdown requested"),
        }

        // Already Disconnecting when disconnect() asked for this
        let _ = shared.transition(ConnectionState::Connected, ConnectionState::Disconnecting);

        self.discard_queued();
        if let Err(e) = transport.close().await {
            tracing::warn!(link = %name, error = %e, "Failed to close transport");
        }
        drop(transport);

        self.tracker.clear();
        shared.release_channels();
        shared.finish();
        shared.emit(LinkEvent::Disconnected);
        tracing::info!(link = %name, "Link disconnected");
    }
}
