//! Wall-clock access for delivery decisions.
//!
//! Every TTL, cooldown, rate window and delivery-hour decision reads time
//! through [`DeliveryClock`] so boundaries can be pinned in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns true when `expires_unix_ms` is no longer in the future.
pub fn is_expired_at(expires_unix_ms: u64, now_unix_ms: u64) -> bool {
    expires_unix_ms <= now_unix_ms
}

/// Trait contract for `DeliveryClock` behavior.
pub trait DeliveryClock: Send + Sync {
    fn now_unix_ms(&self) -> u64;
}

pub type SharedDeliveryClock = Arc<dyn DeliveryClock>;

#[derive(Debug, Clone, Copy, Default)]
/// Reads the host system clock.
pub struct SystemDeliveryClock;

impl DeliveryClock for SystemDeliveryClock {
    fn now_unix_ms(&self) -> u64 {
        current_unix_timestamp_ms()
    }
}

#[derive(Debug, Default)]
/// Manually driven clock for deterministic boundary checks.
pub struct ManualDeliveryClock {
    now_unix_ms: AtomicU64,
}

impl ManualDeliveryClock {
    pub fn new(now_unix_ms: u64) -> Self {
        Self {
            now_unix_ms: AtomicU64::new(now_unix_ms),
        }
    }

    pub fn set(&self, now_unix_ms: u64) {
        self.now_unix_ms.store(now_unix_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) -> u64 {
        let previous = self.now_unix_ms.fetch_add(delta_ms, Ordering::SeqCst);
        previous.saturating_add(delta_ms)
    }
}

impl DeliveryClock for ManualDeliveryClock {
    fn now_unix_ms(&self) -> u64 {
        self.now_unix_ms.load(Ordering::SeqCst)
    }
}

pub fn system_delivery_clock() -> SharedDeliveryClock {
    Arc::new(SystemDeliveryClock)
}
