//! Discovery session state
//!
//! While a session is active the gateway accepts new devices. The session
//! expires [`SCAN_TIMEOUT`] after it started; discovery frames are counted
//! but never move the deadline.

use serde::Serialize;
use tokio::time::{Duration, Instant};

pub const SCAN_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy)]
struct ActiveSession {
    started: Instant,
    discovered: usize,
}

/// Read-only view of the session for snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub scanning: bool,
    pub remaining_secs: u64,
    pub elapsed_secs: u64,
    pub discovered: usize,
}

#[derive(Debug, Clone)]
pub struct DiscoverySession {
    timeout: Duration,
    active: Option<ActiveSession>,
}

impl Default for DiscoverySession {
    fn default() -> Self {
        Self::new(SCAN_TIMEOUT)
    }
}

impl DiscoverySession {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            active: None,
        }
    }

    /// Begin a session. Restarting an active session resets its clock.
    pub fn start(&mut self, now: Instant) {
        self.active = Some(ActiveSession {
            started: now,
            discovered: 0,
        });
    }

    /// Record a discovery frame. Ignored when no session is active.
    pub fn on_discovery(&mut self) {
        if let Some(session) = self.active.as_mut() {
            session.discovered += 1;
        }
    }

    /// End the session. Returns true if one was active.
    pub fn stop(&mut self) -> bool {
        self.active.take().is_some()
    }

    pub fn is_scanning(&self) -> bool {
        self.active.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.active.map(|s| s.started + self.timeout)
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or_default()
    }

    /// Clear the session once it is past its deadline. Returns true on the
    /// poll that expired it.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.active = None;
                true
            }
            _ => false,
        }
    }

    pub fn status(&self, now: Instant) -> SessionStatus {
        SessionStatus {
            scanning: self.is_scanning(),
            remaining_secs: self.remaining(now).as_secs(),
            elapsed_secs: self
                .active
                .map(|s| now.saturating_duration_since(s.started).as_secs())
                .unwrap_or(0),
            discovered: self.active.map(|s| s.discovered).unwrap_or(0),
        }
    }
}
