//! Per-vehicle liveness tracking.
//!
//! A timer is edge-triggered: a vehicle is reported lost once when its
//! silence first exceeds the timeout, and regained once on the first frame
//! after that. Timers live on the link thread only.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::types::VehicleId;

/// Edge of a vehicle's liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    Lost(VehicleId),
    Regained(VehicleId),
}

/// Liveness timer for one vehicle on one link.
#[derive(Debug, Clone)]
pub struct LivenessTimer {
    vehicle: VehicleId,
    timeout: Duration,
    last_seen: Instant,
    lost: bool,
}

impl LivenessTimer {
    pub fn new(vehicle: VehicleId, timeout: Duration, now: Instant) -> Self {
        Self {
            vehicle,
            timeout,
            last_seen: now,
            lost: false,
        }
    }

    pub fn vehicle(&self) -> VehicleId {
        self.vehicle
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn is_lost(&self) -> bool {
        self.lost
    }

    /// Record a frame from the vehicle.
    pub fn note_frame(&mut self, now: Instant) -> Option<LivenessEvent> {
        // Frames can be stamped on another thread slightly before a check ran.
        if now > self.last_seen {
            self.last_seen = now;
        }
        if self.lost {
            self.lost = false;
            return Some(LivenessEvent::Regained(self.vehicle));
        }
        None
    }

    /// Evaluate the timer at `now`.
    pub fn check(&mut self, now: Instant) -> Option<LivenessEvent> {
        if self.lost {
            return None;
        }
        if now.saturating_duration_since(self.last_seen) > self.timeout {
            self.lost = true;
            return Some(LivenessEvent::Lost(self.vehicle));
        }
        None
    }
}

/// Liveness timers of every vehicle attached to a link.
#[derive(Debug)]
pub struct LivenessTracker {
    timeout: Duration,
    timers: HashMap<VehicleId, LivenessTimer>,
}

impl LivenessTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            timers: HashMap::new(),
        }
    }

    /// Start tracking `vehicle`. Returns false if it was already tracked.
    pub fn attach(&mut self, vehicle: VehicleId, now: Instant) -> bool {
        if self.timers.contains_key(&vehicle) {
            return false;
        }
        self.timers
            .insert(vehicle, LivenessTimer::new(vehicle, self.timeout, now));
        true
    }

    pub fn detach(&mut self, vehicle: VehicleId) -> bool {
        self.timers.remove(&vehicle).is_some()
    }

    /// Record a frame; frames from untracked vehicles are ignored.
    pub fn note_frame(&mut self, vehicle: VehicleId, now: Instant) -> Option<LivenessEvent> {
        self.timers.get_mut(&vehicle)?.note_frame(now)
    }

    /// Check every timer, returning the edges crossed at `now`.
    pub fn check_all(&mut self, now: Instant) -> Vec<LivenessEvent> {
        let mut events: Vec<_> = self
            .timers
            .values_mut()
            .filter_map(|timer| timer.check(now))
            .collect();
        events.sort_by_key(|event| match event {
            LivenessEvent::Lost(v) | LivenessEvent::Regained(v) => *v,
        });
        events
    }

    /// Tracked vehicles in ascending order.
    pub fn vehicles(&self) -> Vec<VehicleId> {
        let mut vehicles: Vec<_> = self.timers.keys().copied().collect();
        vehicles.sort();
        vehicles
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }
}
