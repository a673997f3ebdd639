//! Wall-clock time in unix milliseconds.
//!
//! Storage expiry reads [`now_millis`] directly. Sessions stamp their
//! operations through a [`SiteClock`], which never goes backwards even when
//! the wall clock does or a caller supplies its own timestamp.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Strictly increasing per-site timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SiteClock {
    last: u64,
}

impl SiteClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp from the wall clock.
    pub fn tick(&mut self) -> u64 {
        self.advance_to(now_millis())
    }

    /// `requested` if it is later than every timestamp handed out so far,
    /// otherwise the next one after them.
    pub fn advance_to(&mut self, requested: u64) -> u64 {
        self.last = requested.max(self.last.saturating_add(1));
        self.last
    }

    /// Most recent timestamp handed out, 0 before the first.
    pub fn last(&self) -> u64 {
        self.last
    }
}
