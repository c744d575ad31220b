//! Debounced status sync
//!
//! A device-control frame schedules one read-device-list after
//! [`SYNC_DEBOUNCE`]. Further control frames while a sync is pending leave the
//! deadline alone, so a burst of traffic cannot postpone the sync forever.

use tokio::time::{Duration, Instant};

pub const SYNC_DEBOUNCE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SyncScheduler {
    debounce: Duration,
    pending: Option<Instant>,
}

impl Default for SyncScheduler {
    fn default() -> Self {
        Self::new(SYNC_DEBOUNCE)
    }
}

impl SyncScheduler {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            pending: None,
        }
    }

    /// Schedule a sync unless one is already pending. Returns true when a new
    /// sync was scheduled.
    pub fn on_device_control(&mut self, now: Instant) -> bool {
        if self.pending.is_some() {
            return false;
        }
        self.pending = Some(now + self.debounce);
        true
    }

    /// Drop the pending sync, e.g. after a full device list arrived
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// True exactly once when the pending sync is due. The pending state is
    /// cleared whether or not the caller's send succeeds.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.pending {
            Some(deadline) if now >= deadline => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }
}
