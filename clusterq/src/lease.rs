use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

/// Longest lease a store grants: one day.
pub const MAX_LEASE_MS: u64 = 24 * 60 * 60 * 1000;

/// Lease timing shared by claim, heartbeat and the renewal loop.
///
/// The lease is a liveness signal, not a payload deadline: a job may run
/// for any number of lease periods as long as heartbeats keep landing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// How long a claim or heartbeat keeps ownership alive, in milliseconds.
    pub duration_ms: u64,
    /// Interval between heartbeats, in milliseconds.
    pub heartbeat_interval_ms: u64,
}

impl LeaseConfig {
    /// Lease of `duration_ms`, renewed every third of its length.
    pub fn new(duration_ms: u64) -> Self {
        Self {
            duration_ms,
            heartbeat_interval_ms: default_heartbeat_interval_ms(duration_ms),
        }
    }

    pub fn with_heartbeat_interval(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    /// Lease length as a store-side duration.
    pub fn duration(&self) -> Duration {
        Duration::try_milliseconds(self.duration_ms.min(i64::MAX as u64) as i64)
            .unwrap_or(Duration::MAX)
    }

    pub fn heartbeat_interval(&self) -> StdDuration {
        StdDuration::from_millis(self.heartbeat_interval_ms)
    }

    /// Expiry instant of a lease granted or renewed at `now`.
    pub fn deadline(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        lease_deadline(now, self.duration())
    }

    pub fn validate(&self) -> Result<()> {
        if self.duration_ms == 0 || self.duration_ms > MAX_LEASE_MS {
            return Err(QueueError::Config(format!(
                "lease duration {}ms must be between 1ms and {MAX_LEASE_MS}ms",
                self.duration_ms
            )));
        }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_interval_ms >= self.duration_ms {
            return Err(QueueError::Config(format!(
                "heartbeat interval {}ms must be positive and shorter than the lease {}ms",
                self.heartbeat_interval_ms, self.duration_ms
            )));
        }
        Ok(())
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self::new(30_000)
    }
}

/// Rejects a lease a store cannot grant.
pub fn check_lease(lease: Duration) -> Result<Duration> {
    let max = Duration::milliseconds(MAX_LEASE_MS as i64);
    if lease <= Duration::zero() || lease > max {
        return Err(QueueError::Config(format!(
            "lease of {}ms outside 1ms..={MAX_LEASE_MS}ms",
            lease.num_milliseconds()
        )));
    }
    Ok(lease)
}

/// Expiry instant of a lease granted at `now`.
pub fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> Result<DateTime<Utc>> {
    let lease = check_lease(lease)?;
    now.checked_add_signed(lease)
        .ok_or_else(|| QueueError::Config(format!("lease deadline past {now} overflows")))
}

/// One third of the lease, never below one millisecond.
pub fn default_heartbeat_interval_ms(duration_ms: u64) -> u64 {
    (duration_ms / 3).max(1)
}
