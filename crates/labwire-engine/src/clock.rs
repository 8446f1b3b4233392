/*!
 * Onboard wall clock.
 *
 * Controllers have no battery-backed clock, so the host sets the time with the
 * `set_time` command and the firmware keeps it running from a monotonic
 * instant.
 */
use std::time::Instant;

use chrono::{DateTime, Duration, FixedOffset, Offset, Utc};
use tracing::warn;

use labwire_core::types::Value;

use crate::error::{Error, Result};

/// Wall clock set from an epoch timestamp
#[derive(Debug, Clone)]
pub struct Clock {
    offset: FixedOffset,
    anchor: Option<(DateTime<Utc>, Instant)>,
}

impl Clock {
    /// Create an unset clock reporting local time at `offset_hours` from UTC
    pub fn new(offset_hours: i32) -> Self {
        let offset = offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| {
                warn!("Ignoring out-of-range timezone offset {}h", offset_hours);
                Utc.fix()
            });
        Self { offset, anchor: None }
    }

    /// Set the clock from seconds since the Unix epoch
    pub fn set_epoch(&mut self, epoch: f64) -> Result<DateTime<FixedOffset>> {
        if !epoch.is_finite() || epoch < 0.0 {
            return Err(Error::command(format!("invalid epoch {}", epoch)));
        }
        let secs = epoch.trunc() as i64;
        let nanos = (epoch.fract() * 1e9) as u32;
        let utc = DateTime::<Utc>::from_timestamp(secs, nanos)
            .ok_or_else(|| Error::command(format!("epoch {} is out of range", epoch)))?;
        self.anchor = Some((utc, Instant::now()));
        Ok(utc.with_timezone(&self.offset))
    }

    /// Whether the time has been set
    pub fn is_set(&self) -> bool {
        self.anchor.is_some()
    }

    /// Current time in UTC, if set
    pub fn now_utc(&self) -> Option<DateTime<Utc>> {
        self.anchor.map(|(utc, at)| {
            let elapsed = Duration::from_std(at.elapsed()).unwrap_or_else(|_| Duration::zero());
            utc + elapsed
        })
    }

    /// Current local time, if set
    pub fn now(&self) -> Option<DateTime<FixedOffset>> {
        self.now_utc().map(|utc| utc.with_timezone(&self.offset))
    }

    /// Configured offset from UTC
    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Local time as an RFC 3339 string, or `null` when unset
    pub fn to_value(&self) -> Value {
        self.now()
            .map(|now| Value::String(now.to_rfc3339()))
            .unwrap_or(Value::Null)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new(0)
    }
}
