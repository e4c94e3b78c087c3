//! Sliding-window quota meter.
//!
//! Records the timestamp of every RPC call in a bounded ring and converts
//! the window usage into a pacing mode and a recommended request rate.
//! The meter never hibernates: even fully saturated, the recommendation
//! keeps a heartbeat allocation so the chain head can still be polled.
//!
//! The mode is a pure function of the ring contents, the injected clock
//! and the threshold constants, so call patterns replay deterministically
//! in tests.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

use crate::ports::Clock;

// ═══════════════════════════════════════════════════════════════════════════════
// QUOTA MODE
// ═══════════════════════════════════════════════════════════════════════════════

/// Pacing mode derived from window usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaMode {
    /// Usage below the balanced threshold: full rate.
    Aggressive,
    /// Usage between the thresholds: rate scales linearly down to 10%.
    Balanced,
    /// Usage at or above the eco threshold: 10% of the full rate.
    Eco,
}

impl std::fmt::Display for QuotaMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aggressive => f.write_str("aggressive"),
            Self::Balanced => f.write_str("balanced"),
            Self::Eco => f.write_str("eco"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QUOTA METER
// ═══════════════════════════════════════════════════════════════════════════════

/// Minimum rate any recommendation can fall to, in requests per second.
/// Keeps head polling alive regardless of saturation.
const HEARTBEAT_FLOOR_RPS: f64 = 0.5;

/// Fraction of the full rate granted in Eco mode.
const ECO_FRACTION: f64 = 0.1;

/// Sliding-window request counter and mode signaller.
pub struct QuotaMeter {
    clock: Arc<dyn Clock>,
    /// Request quota per window; also the ring capacity.
    limit: usize,
    window: ChronoDuration,
    balanced_threshold: f64,
    eco_threshold: f64,
    ring: Mutex<VecDeque<DateTime<Utc>>>,
}

impl std::fmt::Debug for QuotaMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaMeter")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("balanced_threshold", &self.balanced_threshold)
            .field("eco_threshold", &self.eco_threshold)
            .finish_non_exhaustive()
    }
}

impl QuotaMeter {
    /// Create a meter for `limit` calls per `window`.
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        limit: usize,
        window: std::time::Duration,
        balanced_threshold: f64,
        eco_threshold: f64,
    ) -> Self {
        Self {
            clock,
            limit: limit.max(1),
            window: ChronoDuration::from_std(window).unwrap_or(ChronoDuration::seconds(60)),
            balanced_threshold,
            eco_threshold,
            ring: Mutex::new(VecDeque::with_capacity(limit.max(1))),
        }
    }

    /// Record one outbound RPC call.
    pub fn record(&self) {
        let now = self.clock.now();
        let mut ring = self.ring.lock();
        if ring.len() == self.limit {
            ring.pop_front();
        }
        ring.push_back(now);
    }

    /// Fraction of the window quota consumed, in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn usage_fraction(&self) -> f64 {
        let cutoff = self.clock.now() - self.window;
        let mut ring = self.ring.lock();
        while ring.front().is_some_and(|t| *t < cutoff) {
            ring.pop_front();
        }
        (ring.len() as f64 / self.limit as f64).min(1.0)
    }

    /// Current pacing mode.
    #[must_use]
    pub fn current_mode(&self) -> QuotaMode {
        let usage = self.usage_fraction();
        if usage < self.balanced_threshold {
            QuotaMode::Aggressive
        } else if usage < self.eco_threshold {
            QuotaMode::Balanced
        } else {
            QuotaMode::Eco
        }
    }

    /// Recommended request rate given the configured maximum.
    ///
    /// Aggressive returns `max_rps`; Balanced scales linearly from 100%
    /// at the balanced threshold down to 10% at the eco threshold; Eco
    /// returns 10%. The result never drops below the heartbeat floor.
    #[must_use]
    pub fn recommended_rps(&self, max_rps: f64) -> f64 {
        let usage = self.usage_fraction();
        let fraction = if usage < self.balanced_threshold {
            1.0
        } else if usage < self.eco_threshold {
            let span = self.eco_threshold - self.balanced_threshold;
            1.0 - (1.0 - ECO_FRACTION) * ((usage - self.balanced_threshold) / span)
        } else {
            ECO_FRACTION
        };
        (max_rps * fraction).max(HEARTBEAT_FLOOR_RPS.min(max_rps))
    }

    /// Number of calls currently inside the window.
    #[must_use]
    pub fn calls_in_window(&self) -> usize {
        let cutoff = self.clock.now() - self.window;
        let ring = self.ring.lock();
        ring.iter().filter(|t| **t >= cutoff).count()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
