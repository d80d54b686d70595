//! Canonical allowed-hours window in the operator's timezone.
//!
//! The admission gate blocks sends outside the window and the follow-up
//! scheduler reschedules to the next opening, both from this one definition.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::delivery_config::DeliveryWindowConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Hours `[start_hour, end_hour)` in `timezone`; wraps past midnight when
/// `start_hour > end_hour`.
pub struct DeliveryWindow {
    timezone: Tz,
    start_hour: u32,
    end_hour: u32,
}

impl DeliveryWindow {
    pub fn new(timezone: Tz, start_hour: u32, end_hour: u32) -> Result<Self> {
        if start_hour > 23 || end_hour > 23 {
            bail!("delivery window hours must be within 0..=23");
        }
        if start_hour == end_hour {
            bail!("delivery window must not be empty");
        }
        Ok(Self {
            timezone,
            start_hour,
            end_hour,
        })
    }

    pub fn from_config(config: &DeliveryWindowConfig) -> Result<Self> {
        let timezone = config
            .timezone
            .parse::<Tz>()
            .map_err(|_| anyhow!("invalid delivery window timezone '{}'", config.timezone))?;
        Self::new(timezone, config.start_hour, config.end_hour)
    }

    pub fn start_hour(&self) -> u32 {
        self.start_hour
    }

    pub fn end_hour(&self) -> u32 {
        self.end_hour
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn is_open_at(&self, unix_ms: u64) -> bool {
        let hour = self.local_time(unix_ms).hour();
        if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }

    /// Returns `unix_ms` when the window is open, otherwise the next opening.
    pub fn next_open_at(&self, unix_ms: u64) -> u64 {
        if self.is_open_at(unix_ms) {
            return unix_ms;
        }
        let local = self.local_time(unix_ms);
        let today = local.date_naive();
        let mut candidate_date = today;
        for _ in 0..3 {
            if let Some(opening) = self.opening_on(candidate_date) {
                if opening > unix_ms {
                    return opening;
                }
            }
            match candidate_date.succ_opt() {
                Some(next) => candidate_date = next,
                None => break,
            }
        }
        unix_ms
    }

    fn opening_on(&self, date: NaiveDate) -> Option<u64> {
        // A DST gap can swallow the opening hour; fall forward one hour then.
        let resolved = (self.start_hour..=self.start_hour.saturating_add(1).min(23))
            .filter_map(|hour| date.and_hms_opt(hour, 0, 0))
            .find_map(|naive| self.timezone.from_local_datetime(&naive).earliest())?;
        u64::try_from(resolved.timestamp_millis()).ok()
    }

    fn local_time(&self, unix_ms: u64) -> DateTime<Tz> {
        let millis = i64::try_from(unix_ms).unwrap_or(i64::MAX);
        let utc = DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default();
        utc.with_timezone(&self.timezone)
    }
}
