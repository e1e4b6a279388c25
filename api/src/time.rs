//! Clock shared by every component that stamps records or checks token
//! expiry. With the `mock-time` feature the clock only moves when told to.

use jiff::{Span, Timestamp};
#[cfg(feature = "mock-time")]
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct TimeSource {
    #[cfg(feature = "mock-time")]
    time: Arc<Mutex<Timestamp>>,
}

/// The system clock. With `mock-time`, a mock clock starting now.
impl Default for TimeSource {
    #[cfg(not(feature = "mock-time"))]
    fn default() -> Self {
        Self::new()
    }

    #[cfg(feature = "mock-time")]
    fn default() -> Self {
        Self::new(Timestamp::now())
    }
}

impl TimeSource {
    #[allow(clippy::new_without_default)]
    #[cfg(not(feature = "mock-time"))]
    pub fn new() -> Self {
        Self {}
    }

    #[cfg(feature = "mock-time")]
    pub fn new(initial_time: Timestamp) -> Self {
        Self {
            time: Arc::new(Mutex::new(initial_time)),
        }
    }

    #[cfg(not(feature = "mock-time"))]
    pub fn now(&self) -> Timestamp {
        Timestamp::now()
    }

    #[cfg(feature = "mock-time")]
    pub fn now(&self) -> Timestamp {
        *self.time.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The instant `span` from now, saturating at the maximum timestamp.
    pub fn after(&self, span: Span) -> Timestamp {
        let now = self.now();
        now.checked_add(span).unwrap_or(Timestamp::MAX)
    }

    #[cfg(feature = "mock-time")]
    pub fn advance(&self, span: Span) {
        let mut time = self.time.lock().unwrap_or_else(|e| e.into_inner());
        *time = time.checked_add(span).unwrap_or(Timestamp::MAX);
    }

    #[cfg(feature = "mock-time")]
    pub fn set(&self, time: Timestamp) {
        *self.time.lock().unwrap_or_else(|e| e.into_inner()) = time;
    }
}
