use std::sync::atomic::{AtomicU64, Ordering};

use crate::model::UnixTimeMs;

/// Wall-clock source. Injected so backoff and expiry can be tested deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimeMs;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }
}

#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start: UnixTimeMs) -> Self {
        Self {
            now_ms: AtomicU64::new(start.as_millis()),
        }
    }

    pub fn set(&self, now: UnixTimeMs) {
        self.now_ms.store(now.as_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs(self.now_ms.load(Ordering::SeqCst))
    }
}
