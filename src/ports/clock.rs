//! Time port.
//!
//! The pacing components are all functions of elapsed time: the quota
//! meter counts calls inside a sliding window, the lazy manager compares
//! silence against an idle timeout, the watchdog measures stalls. To make
//! those decisions replayable in tests, they read time through this trait
//! instead of calling `Utc::now()` directly — and because quota windows
//! are measured in requests per *second*, the fake keeps millisecond
//! resolution so a test can place several calls inside one second.

use chrono::{DateTime, Utc};

// ═══════════════════════════════════════════════════════════════════════════════
// CLOCK
// ═══════════════════════════════════════════════════════════════════════════════

/// Port for time operations.
///
/// Allows injecting fake time in tests while using real time in production.
pub trait Clock: Send + Sync {
    /// Get current UTC time.
    fn now(&self) -> DateTime<Utc>;

    /// Get current Unix timestamp (seconds since epoch).
    fn timestamp(&self) -> i64 {
        self.now().timestamp()
    }

    /// Get current Unix timestamp in milliseconds.
    fn timestamp_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SYSTEM CLOCK (Production)
// ═══════════════════════════════════════════════════════════════════════════════

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FAKE CLOCK (Testing)
// ═══════════════════════════════════════════════════════════════════════════════

/// Fake clock for testing with controllable time.
///
/// Stores milliseconds so sub-second pacing behavior (quota windows,
/// stall thresholds) can be replayed deterministically.
///
/// # Thread Safety
///
/// Uses atomic operations for thread-safe time manipulation.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug)]
pub struct FakeClock {
    /// Current time as Unix milliseconds (atomic for thread safety).
    millis: std::sync::atomic::AtomicI64,
}

#[cfg(any(test, feature = "test-utils"))]
impl FakeClock {
    /// Create a fake clock at the specified time.
    #[must_use]
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            millis: std::sync::atomic::AtomicI64::new(time.timestamp_millis()),
        }
    }

    /// Create a fake clock at Unix epoch (1970-01-01 00:00:00 UTC).
    #[must_use]
    pub const fn epoch() -> Self {
        Self {
            millis: std::sync::atomic::AtomicI64::new(0),
        }
    }

    /// Advance time by the given duration.
    pub fn advance(&self, duration: chrono::Duration) {
        self.millis.fetch_add(
            duration.num_milliseconds(),
            std::sync::atomic::Ordering::SeqCst,
        );
    }

    /// Set time to a specific value.
    pub fn set(&self, time: DateTime<Utc>) {
        self.millis
            .store(time.timestamp_millis(), std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(std::sync::atomic::Ordering::SeqCst))
            .unwrap_or_default()
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Default for FakeClock {
    fn default() -> Self {
        Self::epoch()
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Clone for FakeClock {
    fn clone(&self) -> Self {
        Self {
            millis: std::sync::atomic::AtomicI64::new(
                self.millis.load(std::sync::atomic::Ordering::SeqCst),
            ),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
