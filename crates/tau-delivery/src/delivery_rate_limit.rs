//! Fixed-window send counters for the admission gate.
//!
//! Windows are created on first use and reset lazily on rollover. Every counter
//! lives behind one mutex so a recorded send bumps all of them together.
//!
//! An admitted candidate holds a [`RateLimitReservation`] while it is paced and
//! handed to the transport. Reserved slots count against every limit, so a
//! second candidate racing the first is denied, but only a committed
//! reservation moves the send counters.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::delivery_config::AdmissionGateConfig;
use crate::delivery_connection::lock_unpoisoned;

const HOUR_MS: u64 = 60 * 60 * 1_000;
const DAY_MS: u64 = 24 * HOUR_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Caps and intervals enforced by [`DeliveryRateLimiter`].
pub struct RateLimitPolicy {
    pub global_hourly_cap: u32,
    pub global_daily_cap: u32,
    pub per_destination_min_interval_ms: u64,
    pub per_destination_hourly_cap: u32,
    pub bucket_idle_gc_ms: u64,
}

impl RateLimitPolicy {
    pub fn from_gate_config(config: &AdmissionGateConfig) -> Self {
        Self {
            global_hourly_cap: config.global_hourly_cap,
            global_daily_cap: config.global_daily_cap,
            per_destination_min_interval_ms: config.per_destination_min_interval_ms,
            per_destination_hourly_cap: config.per_destination_hourly_cap,
            bucket_idle_gc_ms: config.bucket_idle_gc_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `RateLimitScope` values, in check order.
pub enum RateLimitScope {
    GlobalHourly,
    GlobalDaily,
    DestinationInterval,
    DestinationHourly,
}

impl RateLimitScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GlobalHourly => "global_hourly",
            Self::GlobalDaily => "global_daily",
            Self::DestinationInterval => "destination_interval",
            Self::DestinationHourly => "destination_hourly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
/// First failing rate-limit check with the time until it clears.
pub struct RateLimitDenial {
    pub scope: RateLimitScope,
    pub retry_after_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `RateLimitCheck` values.
pub enum RateLimitCheck {
    Allowed,
    Limited(RateLimitDenial),
}

impl RateLimitCheck {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
/// Per-destination counter window.
pub struct RateLimitBucket {
    pub count: u32,
    pub window_reset_at_unix_ms: u64,
    pub last_send_at_unix_ms: u64,
    pub reserved: u32,
}

impl RateLimitBucket {
    fn current_count(&self, now_unix_ms: u64) -> u32 {
        if now_unix_ms >= self.window_reset_at_unix_ms {
            0
        } else {
            self.count
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
/// Process-wide counter window for one horizon.
pub struct GlobalRateLimit {
    pub count: u32,
    pub window_reset_at_unix_ms: u64,
}

impl GlobalRateLimit {
    fn current_count(&self, now_unix_ms: u64) -> u32 {
        if now_unix_ms >= self.window_reset_at_unix_ms {
            0
        } else {
            self.count
        }
    }

    fn increment(&mut self, now_unix_ms: u64, window_ms: u64) {
        if now_unix_ms >= self.window_reset_at_unix_ms {
            self.count = 0;
            self.window_reset_at_unix_ms = now_unix_ms.saturating_add(window_ms);
        }
        self.count = self.count.saturating_add(1);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Public struct `RateLimiterStats` used across Tau components.
pub struct RateLimiterStats {
    pub global_hourly_count: u32,
    pub global_hourly_cap: u32,
    pub global_hourly_resets_at_unix_ms: Option<u64>,
    pub global_daily_count: u32,
    pub global_daily_cap: u32,
    pub global_daily_resets_at_unix_ms: Option<u64>,
    pub tracked_destinations: usize,
    pub in_flight: u32,
    pub globally_saturated: bool,
}

#[derive(Debug, Default)]
struct RateLimitState {
    hourly: GlobalRateLimit,
    daily: GlobalRateLimit,
    reserved: u32,
    buckets: HashMap<String, RateLimitBucket>,
}

/// Slot held by an admitted candidate until its send resolves.
///
/// Dropping the reservation without [`commit`](Self::commit) releases the slot
/// and leaves the counters untouched, so a failed, cancelled or abandoned send
/// never counts.
#[derive(Debug)]
#[must_use = "dropping a reservation releases the slot"]
pub struct RateLimitReservation<'a> {
    limiter: &'a DeliveryRateLimiter,
    destination_key: String,
    settled: bool,
}

impl RateLimitReservation<'_> {
    pub fn destination_key(&self) -> &str {
        &self.destination_key
    }

    /// Converts the slot into one counted send at `sent_at_unix_ms`.
    pub fn commit(mut self, sent_at_unix_ms: u64) {
        self.settled = true;
        let mut state = lock_unpoisoned(&self.limiter.state);
        release_slot(&mut state, &self.destination_key);
        record_into(&mut state, &self.destination_key, sent_at_unix_ms);
    }
}

impl Drop for RateLimitReservation<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = lock_unpoisoned(&self.limiter.state);
        release_slot(&mut state, &self.destination_key);
    }
}

#[derive(Debug)]
/// Global hourly/daily caps plus per-destination interval and hourly caps.
pub struct DeliveryRateLimiter {
    policy: RateLimitPolicy,
    state: Mutex<RateLimitState>,
}

impl DeliveryRateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(RateLimitState::default()),
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Runs the checks in order (global hourly, global daily, destination
    /// interval, destination hourly) and reports the first one that fails.
    /// In-flight reservations count as sends.
    pub fn check(&self, destination_key: &str, now_unix_ms: u64) -> RateLimitCheck {
        let state = lock_unpoisoned(&self.state);
        match self.denial(&state, destination_key, now_unix_ms) {
            Some(denial) => RateLimitCheck::Limited(denial),
            None => RateLimitCheck::Allowed,
        }
    }

    /// Checks and, when allowed, reserves a slot in the same critical section.
    pub fn try_reserve(
        &self,
        destination_key: &str,
        now_unix_ms: u64,
    ) -> Result<RateLimitReservation<'_>, RateLimitDenial> {
        let mut state = lock_unpoisoned(&self.state);
        if let Some(denial) = self.denial(&state, destination_key, now_unix_ms) {
            return Err(denial);
        }
        state.reserved = state.reserved.saturating_add(1);
        let bucket = state
            .buckets
            .entry(destination_key.to_string())
            .or_default();
        bucket.reserved = bucket.reserved.saturating_add(1);
        Ok(RateLimitReservation {
            limiter: self,
            destination_key: destination_key.to_string(),
            settled: false,
        })
    }

    /// Global caps only; the follow-up scheduler uses this to back off before
    /// attempting a send.
    pub fn global_block(&self, now_unix_ms: u64) -> Option<RateLimitDenial> {
        let state = lock_unpoisoned(&self.state);
        self.global_denial(&state, now_unix_ms)
    }

    /// Counts one completed send that bypassed reservation.
    pub fn record_send(&self, destination_key: &str, now_unix_ms: u64) {
        let mut state = lock_unpoisoned(&self.state);
        record_into(&mut state, destination_key, now_unix_ms);
    }

    /// Drops buckets idle for longer than the configured GC horizon.
    pub fn collect_idle(&self, now_unix_ms: u64) -> usize {
        let idle_after_ms = self.policy.bucket_idle_gc_ms;
        let mut state = lock_unpoisoned(&self.state);
        let before = state.buckets.len();
        state.buckets.retain(|_, bucket| {
            bucket.reserved > 0
                || now_unix_ms.saturating_sub(bucket.last_send_at_unix_ms) < idle_after_ms
        });
        before - state.buckets.len()
    }

    pub fn bucket(&self, destination_key: &str) -> Option<RateLimitBucket> {
        lock_unpoisoned(&self.state)
            .buckets
            .get(destination_key)
            .copied()
    }

    pub fn stats(&self, now_unix_ms: u64) -> RateLimiterStats {
        let state = lock_unpoisoned(&self.state);
        let active_reset = |limit: &GlobalRateLimit| {
            (now_unix_ms < limit.window_reset_at_unix_ms).then_some(limit.window_reset_at_unix_ms)
        };
        RateLimiterStats {
            global_hourly_count: state.hourly.current_count(now_unix_ms),
            global_hourly_cap: self.policy.global_hourly_cap,
            global_hourly_resets_at_unix_ms: active_reset(&state.hourly),
            global_daily_count: state.daily.current_count(now_unix_ms),
            global_daily_cap: self.policy.global_daily_cap,
            global_daily_resets_at_unix_ms: active_reset(&state.daily),
            tracked_destinations: state.buckets.len(),
            in_flight: state.reserved,
            globally_saturated: self.global_denial(&state, now_unix_ms).is_some(),
        }
    }

    fn denial(
        &self,
        state: &RateLimitState,
        destination_key: &str,
        now_unix_ms: u64,
    ) -> Option<RateLimitDenial> {
        if let Some(denial) = self.global_denial(state, now_unix_ms) {
            return Some(denial);
        }
        let bucket = state.buckets.get(destination_key)?;
        let min_interval_ms = self.policy.per_destination_min_interval_ms;
        if bucket.reserved > 0 && min_interval_ms > 0 {
            return Some(RateLimitDenial {
                scope: RateLimitScope::DestinationInterval,
                retry_after_ms: min_interval_ms,
            });
        }
        let interval_clears_at = bucket.last_send_at_unix_ms.saturating_add(min_interval_ms);
        if bucket.count > 0 && now_unix_ms < interval_clears_at {
            return Some(RateLimitDenial {
                scope: RateLimitScope::DestinationInterval,
                retry_after_ms: interval_clears_at - now_unix_ms,
            });
        }
        let used = bucket
            .current_count(now_unix_ms)
            .saturating_add(bucket.reserved);
        if used >= self.policy.per_destination_hourly_cap {
            return Some(RateLimitDenial {
                scope: RateLimitScope::DestinationHourly,
                retry_after_ms: window_retry_after(bucket.window_reset_at_unix_ms, now_unix_ms),
            });
        }
        None
    }

    fn global_denial(&self, state: &RateLimitState, now_unix_ms: u64) -> Option<RateLimitDenial> {
        for (scope, limit, cap, window_ms) in [
            (
                RateLimitScope::GlobalHourly,
                &state.hourly,
                self.policy.global_hourly_cap,
                HOUR_MS,
            ),
            (
                RateLimitScope::GlobalDaily,
                &state.daily,
                self.policy.global_daily_cap,
                DAY_MS,
            ),
        ] {
            let used = limit
                .current_count(now_unix_ms)
                .saturating_add(state.reserved);
            if used >= cap {
                let retry_after_ms = if now_unix_ms < limit.window_reset_at_unix_ms {
                    limit.window_reset_at_unix_ms - now_unix_ms
                } else {
                    window_ms
                };
                return Some(RateLimitDenial {
                    scope,
                    retry_after_ms,
                });
            }
        }
        None
    }
}

/// A window that has not started yet opens on the next send and lasts an hour.
fn window_retry_after(window_reset_at_unix_ms: u64, now_unix_ms: u64) -> u64 {
    if now_unix_ms < window_reset_at_unix_ms {
        window_reset_at_unix_ms - now_unix_ms
    } else {
        HOUR_MS
    }
}

fn release_slot(state: &mut RateLimitState, destination_key: &str) {
    state.reserved = state.reserved.saturating_sub(1);
    let Some(bucket) = state.buckets.get_mut(destination_key) else {
        return;
    };
    bucket.reserved = bucket.reserved.saturating_sub(1);
    if bucket.reserved == 0 && bucket.count == 0 {
        state.buckets.remove(destination_key);
    }
}

fn record_into(state: &mut RateLimitState, destination_key: &str, now_unix_ms: u64) {
    state.hourly.increment(now_unix_ms, HOUR_MS);
    state.daily.increment(now_unix_ms, DAY_MS);
    let bucket = state
        .buckets
        .entry(destination_key.to_string())
        .or_default();
    if now_unix_ms >= bucket.window_reset_at_unix_ms {
        bucket.count = 0;
        bucket.window_reset_at_unix_ms = now_unix_ms.saturating_add(HOUR_MS);
    }
    bucket.count = bucket.count.saturating_add(1);
    bucket.last_send_at_unix_ms = now_unix_ms;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RateLimitPolicy {
        RateLimitPolicy {
            global_hourly_cap: 3,
            global_daily_cap: 5,
            per_destination_min_interval_ms: 60_000,
            per_destination_hourly_cap: 2,
            bucket_idle_gc_ms: DAY_MS,
        }
    }

    #[test]
    fn unit_fresh_limiter_allows_and_records_exactly_once() {
        let limiter = DeliveryRateLimiter::new(policy());
        assert!(limiter.check("dst_a", 0).is_allowed());
        limiter.record_send("dst_a", 0);
        let bucket = limiter.bucket("dst_a").expect("bucket");
        assert_eq!(bucket.count, 1);
        assert_eq!(bucket.window_reset_at_unix_ms, HOUR_MS);
        let stats = limiter.stats(0);
        assert_eq!(stats.global_hourly_count, 1);
        assert_eq!(stats.global_daily_count, 1);
    }

    #[test]
    fn functional_destination_interval_then_hourly_cap() {
        let limiter = DeliveryRateLimiter::new(policy());
        limiter.record_send("dst_a", 0);
        assert_eq!(
            limiter.check("dst_a", 10_000),
            RateLimitCheck::Limited(RateLimitDenial {
                scope: RateLimitScope::DestinationInterval,
                retry_after_ms: 50_000,
            })
        );
        assert!(limiter.check("dst_a", 60_000).is_allowed());
        limiter.record_send("dst_a", 60_000);
        assert_eq!(
            limiter.check("dst_a", 200_000),
            RateLimitCheck::Limited(RateLimitDenial {
                scope: RateLimitScope::DestinationHourly,
                retry_after_ms: HOUR_MS - 200_000,
            })
        );
        assert!(limiter.check("dst_a", HOUR_MS).is_allowed());
        assert!(limiter.check("dst_b", 200_000).is_allowed());
    }

    #[test]
    fn functional_global_hourly_checked_before_destination_limits() {
        let limiter = DeliveryRateLimiter::new(policy());
        limiter.record_send("dst_a", 0);
        limiter.record_send("dst_b", 0);
        limiter.record_send("dst_c", 0);
        let check = limiter.check("dst_a", 1_000);
        assert_eq!(
            check,
            RateLimitCheck::Limited(RateLimitDenial {
                scope: RateLimitScope::GlobalHourly,
                retry_after_ms: HOUR_MS - 1_000,
            })
        );
        assert!(limiter.global_block(1_000).is_some());
        assert!(limiter.global_block(HOUR_MS).is_none());
        assert!(limiter.stats(1_000).globally_saturated);
    }

    #[test]
    fn functional_global_daily_cap_survives_hourly_rollover() {
        let limiter = DeliveryRateLimiter::new(policy());
        for index in 0..5u64 {
            limiter.record_send(&format!("dst_{index}"), index * HOUR_MS);
        }
        let denial = limiter.global_block(5 * HOUR_MS).expect("daily cap");
        assert_eq!(denial.scope, RateLimitScope::GlobalDaily);
        assert_eq!(denial.retry_after_ms, DAY_MS - 5 * HOUR_MS);
        assert!(limiter.global_block(DAY_MS).is_none());
    }

    #[test]
    fn regression_idle_buckets_are_collected_after_horizon() {
        let limiter = DeliveryRateLimiter::new(policy());
        limiter.record_send("dst_old", 0);
        limiter.record_send("dst_new", DAY_MS - 1);
        assert_eq!(limiter.collect_idle(DAY_MS), 1);
        assert!(limiter.bucket("dst_old").is_none());
        assert!(limiter.bucket("dst_new").is_some());
        assert_eq!(limiter.stats(DAY_MS).tracked_destinations, 1);
    }

    #[test]
    fn functional_reservation_blocks_second_candidate_until_released() {
        let limiter = DeliveryRateLimiter::new(policy());
        let first = limiter.try_reserve("dst_a", 0).expect("first slot");
        assert_eq!(
            limiter.try_reserve("dst_a", 0).expect_err("in flight"),
            RateLimitDenial {
                scope: RateLimitScope::DestinationInterval,
                retry_after_ms: 60_000,
            }
        );
        assert_eq!(limiter.stats(0).in_flight, 1);
        assert_eq!(limiter.stats(0).global_hourly_count, 0);

        drop(first);
        assert_eq!(limiter.stats(0).in_flight, 0);
        assert_eq!(limiter.stats(0).global_hourly_count, 0);
        let second = limiter.try_reserve("dst_a", 0).expect("released slot");
        second.commit(5);
        let bucket = limiter.bucket("dst_a").expect("bucket");
        assert_eq!(bucket.count, 1);
        assert_eq!(bucket.reserved, 0);
        assert_eq!(bucket.last_send_at_unix_ms, 5);
        assert_eq!(limiter.stats(5).global_hourly_count, 1);
    }

    #[test]
    fn regression_in_flight_reservations_count_against_global_cap() {
        let limiter = DeliveryRateLimiter::new(RateLimitPolicy {
            global_hourly_cap: 2,
            ..policy()
        });
        limiter.record_send("dst_a", 0);
        let in_flight = limiter.try_reserve("dst_b", 1_000).expect("slot");
        let denial = limiter.try_reserve("dst_c", 1_000).expect_err("cap");
        assert_eq!(denial.scope, RateLimitScope::GlobalHourly);
        assert_eq!(denial.retry_after_ms, HOUR_MS - 1_000);
        assert!(limiter.global_block(1_000).is_some());
        drop(in_flight);
        assert!(limiter.try_reserve("dst_c", 1_000).is_ok());
    }

    #[test]
    fn regression_zero_interval_still_caps_concurrent_reservations_per_hour() {
        let limiter = DeliveryRateLimiter::new(RateLimitPolicy {
            per_destination_min_interval_ms: 0,
            ..policy()
        });
        let first = limiter.try_reserve("dst_a", 0).expect("first");
        let second = limiter.try_reserve("dst_a", 0).expect("second");
        let denial = limiter.try_reserve("dst_a", 0).expect_err("hourly cap");
        assert_eq!(denial.scope, RateLimitScope::DestinationHourly);
        assert_eq!(denial.retry_after_ms, HOUR_MS);
        first.commit(0);
        second.commit(0);
        assert_eq!(limiter.bucket("dst_a").expect("bucket").count, 2);
    }

    #[test]
    fn regression_reserved_buckets_survive_idle_collection() {
        let limiter = DeliveryRateLimiter::new(policy());
        let reservation = limiter.try_reserve("dst_pending", DAY_MS).expect("slot");
        assert_eq!(limiter.collect_idle(2 * DAY_MS), 0);
        assert_eq!(reservation.destination_key(), "dst_pending");
        drop(reservation);
        assert!(limiter.bucket("dst_pending").is_none());
        assert_eq!(limiter.collect_idle(2 * DAY_MS), 0);
    }
}
