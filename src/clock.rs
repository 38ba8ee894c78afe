//! Trusted time source shared by the codec, the reconciler and the service.
//!
//! Timers in the scheduler run on `tokio::time::Instant`, which is monotonic.
//! Wall-clock timestamps that end up on the wire (Date, DateTime, boundary
//! tokens) come from a [`Clock`] so tests can freeze them.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Frozen clock for tests.
#[cfg(test)]
#[derive(Debug)]
pub struct FixedClock(pub DateTime<Utc>);

#[cfg(test)]
impl FixedClock {
    pub fn at(secs: i64) -> Self {
        Self(Utc.timestamp_opt(secs, 0).single().unwrap_or_default())
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Convert epoch seconds from the store back into a timestamp.
pub fn from_epoch_secs(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}
