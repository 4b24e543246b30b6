#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sitevisit_kernel_contracts::WallTimeNs;

pub trait Clock: Send + Sync {
    fn now(&self) -> WallTimeNs;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> WallTimeNs {
        let ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        WallTimeNs(ns)
    }
}

/// Hand-driven clock for deterministic runs.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    pub fn new(start: WallTimeNs) -> Self {
        Self {
            now_ns: AtomicU64::new(start.0),
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now_ns
            .fetch_add(ms.saturating_mul(1_000_000), Ordering::SeqCst);
    }

    pub fn set(&self, t: WallTimeNs) {
        self.now_ns.store(t.0, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> WallTimeNs {
        WallTimeNs(self.now_ns.load(Ordering::SeqCst))
    }
}
