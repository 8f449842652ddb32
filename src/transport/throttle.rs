//! Rolling windows used by sockets.
//!
//! - [`SendThrottle`] caps outbound frames in any trailing one-second window.
//! - [`ThroughputWindow`] measures inbound bytes over the last three seconds.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

// ============================================================================
// Constants
// ============================================================================

/// Window over which outbound frames are counted.
const SEND_WINDOW: Duration = Duration::from_secs(1);

/// Window over which inbound throughput is measured.
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(3);

// ============================================================================
// SendThrottle
// ============================================================================

/// Outbound frame limiter.
#[derive(Debug, Default)]
pub struct SendThrottle {
    sent: VecDeque<Instant>,
}

impl SendThrottle {
    /// Creates an empty throttle.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how long to wait before another frame may be sent, or `None`
    /// if one may be sent at `now`.
    pub fn delay(&mut self, now: Instant, limit: u32) -> Option<Duration> {
        self.evict(now);

        if self.sent.len() < limit as usize {
            return None;
        }

        self.sent
            .front()
            .map(|oldest| (*oldest + SEND_WINDOW).saturating_duration_since(now))
    }

    /// Records a frame sent at `now`.
    pub fn record(&mut self, now: Instant) {
        self.sent.push_back(now);
    }

    /// Number of frames in the current window.
    #[must_use]
    pub fn in_window(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.sent.len()
    }

    fn evict(&mut self, now: Instant) {
        while let Some(oldest) = self.sent.front() {
            if now.saturating_duration_since(*oldest) >= SEND_WINDOW {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }
}

// ============================================================================
// ThroughputWindow
// ============================================================================

/// Inbound byte counter over a trailing window.
#[derive(Debug, Default)]
pub struct ThroughputWindow {
    samples: VecDeque<(Instant, usize)>,
    total: usize,
}

impl ThroughputWindow {
    /// Creates an empty window.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `bytes` received at `now`.
    pub fn record(&mut self, now: Instant, bytes: usize) {
        self.evict(now);
        self.samples.push_back((now, bytes));
        self.total += bytes;
    }

    /// Kilobytes per second over the window ending at `now`.
    #[must_use]
    pub fn kbps(&mut self, now: Instant) -> f64 {
        self.evict(now);
        if self.samples.is_empty() {
            return 0.0;
        }
        self.total as f64 / 1000.0 / THROUGHPUT_WINDOW.as_secs_f64()
    }

    fn evict(&mut self, now: Instant) {
        while let Some((at, bytes)) = self.samples.front() {
            if now.saturating_duration_since(*at) > THROUGHPUT_WINDOW {
                self.total -= *bytes;
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
