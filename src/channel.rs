//! Protocol channel pool.
//!
//! MAVLink decoders keep per-channel parse state, so every live link needs its
//! own channel id. The pool is small and fixed; ids are handed out lowest first
//! and every id is either free or assigned, never both.

use std::collections::BTreeSet;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::types::ChannelId;

/// Default number of channels in the pool.
pub const DEFAULT_CHANNEL_POOL_SIZE: u8 = 16;

#[derive(Debug)]
struct Pool {
    free: BTreeSet<ChannelId>,
    assigned: BTreeSet<ChannelId>,
}

/// Thread-safe allocator for protocol channel ids.
#[derive(Debug)]
pub struct ChannelAllocator {
    capacity: u8,
    pool: Mutex<Pool>,
}

impl ChannelAllocator {
    /// Create a pool with ids `0..capacity`.
    ///
    /// `ChannelId::UNSET` is reserved, so the capacity is capped at 255.
    pub fn new(capacity: u8) -> Self {
        let capacity = capacity.min(ChannelId::UNSET.0);
        Self {
            capacity,
            pool: Mutex::new(Pool {
                free: (0..capacity).map(ChannelId).collect(),
                assigned: BTreeSet::new(),
            }),
        }
    }

    /// Total number of channels in the pool.
    pub fn capacity(&self) -> usize {
        usize::from(self.capacity)
    }

    /// Number of free channels.
    pub fn available(&self) -> usize {
        self.pool.lock().free.len()
    }

    /// Snapshot of the currently assigned channels.
    pub fn assigned(&self) -> Vec<ChannelId> {
        self.pool.lock().assigned.iter().copied().collect()
    }

    pub fn is_assigned(&self, id: ChannelId) -> bool {
        self.pool.lock().assigned.contains(&id)
    }

    /// Take the lowest free channel.
    pub fn allocate(&self) -> Result<ChannelId> {
        let mut pool = self.pool.lock();
        let Some(id) = pool.free.pop_first() else {
            tracing::warn!(capacity = self.capacity, "Channel pool exhausted");
            return Err(Error::ChannelExhausted {
                requested: 1,
                available: 0,
            });
        };
        pool.assigned.insert(id);
        tracing::debug!(channel = %id, free = pool.free.len(), "Allocated channel");
        Ok(id)
    }

    /// Take the `count` lowest free channels, or none at all.
    pub fn allocate_batch(&self, count: usize) -> Result<Vec<ChannelId>> {
        let mut pool = self.pool.lock();
        if pool.free.len() < count {
            tracing::warn!(
                requested = count,
                available = pool.free.len(),
                "Channel pool cannot satisfy batch"
            );
            return Err(Error::ChannelExhausted {
                requested: count,
                available: pool.free.len(),
            });
        }

        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(id) = pool.free.pop_first() {
                pool.assigned.insert(id);
                ids.push(id);
            }
        }
        tracing::debug!(channels = ?ids, free = pool.free.len(), "Allocated channel batch");
        Ok(ids)
    }

    /// Return a channel to the pool.
    ///
    /// Freeing an id that is not assigned is a caller bug and is reported as such.
    pub fn free(&self, id: ChannelId) -> Result<()> {
        let mut pool = self.pool.lock();
        if !pool.assigned.remove(&id) {
            tracing::error!(channel = %id, "Freeing channel that is not assigned");
            return Err(Error::ChannelNotAssigned(id));
        }
        pool.free.insert(id);
        tracing::debug!(channel = %id, free = pool.free.len(), "Freed channel");
        Ok(())
    }

    /// Free every id in `ids`, continuing past defects. Returns the first defect.
    pub fn free_all(&self, ids: &[ChannelId]) -> Result<()> {
        let mut first_err = None;
        for &id in ids {
            if let Err(e) = self.free(id) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Default for ChannelAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_POOL_SIZE)
    }
}
