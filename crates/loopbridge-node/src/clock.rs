//! Process-wide synchronized clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Wall clock in milliseconds since the Unix epoch, shifted by a drift
/// correction shared by every clone.
#[derive(Debug, Clone, Default)]
pub struct SyncClock {
    offset_ms: Arc<AtomicI64>,
}

impl SyncClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_offset(offset_ms: i64) -> Self {
        let clock = Self::new();
        clock.set_offset(offset_ms);
        clock
    }

    pub fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() + self.offset_ms.load(Ordering::Relaxed)
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    pub fn set_offset(&self, offset_ms: i64) {
        self.offset_ms.store(offset_ms, Ordering::Relaxed);
    }
}
