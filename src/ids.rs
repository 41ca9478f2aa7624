//! Clock and order-number generation, injected into the services.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use rand::Rng;

/// Source of the current UTC time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_secs(&self) -> i64 {
        self.now().timestamp()
    }

    /// Nanoseconds since the epoch; saturates outside chrono's nanosecond range.
    fn now_nanos(&self) -> i64 {
        self.now().timestamp_nanos_opt().unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(Mutex::new(at))
    }

    pub fn advance(&self, by: TimeDelta) {
        *self.0.lock() += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.0.lock() = at;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}

/// Produces order numbers: `ORD` + `YYYYMMDDhhmmss` (UTC) + 6 digits.
pub trait IdGen: Send + Sync {
    fn order_no(&self, now: DateTime<Utc>) -> String;
}

pub const ORDER_NO_PREFIX: &str = "ORD";
pub const ORDER_NO_LEN: usize = 23;

fn format_order_no(now: DateTime<Utc>, suffix: u32) -> String {
    format!(
        "{ORDER_NO_PREFIX}{}{:06}",
        now.format("%Y%m%d%H%M%S"),
        suffix % 1_000_000
    )
}

/// Random 6-digit suffix in `0..=999999`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIdGen;

impl IdGen for RandomIdGen {
    fn order_no(&self, now: DateTime<Utc>) -> String {
        format_order_no(now, rand::thread_rng().gen_range(0..1_000_000))
    }
}

/// Counter-based suffix; deterministic output for tests.
#[derive(Debug, Default)]
pub struct SequenceIdGen(AtomicU32);

impl SequenceIdGen {
    pub fn starting_at(first: u32) -> Self {
        Self(AtomicU32::new(first))
    }
}

impl IdGen for SequenceIdGen {
    fn order_no(&self, now: DateTime<Utc>) -> String {
        format_order_no(now, self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// True if `s` has the order-number shape.
pub fn is_order_no(s: &str) -> bool {
    s.len() == ORDER_NO_LEN
        && s.starts_with(ORDER_NO_PREFIX)
        && s[ORDER_NO_PREFIX.len()..].bytes().all(|b| b.is_ascii_digit())
}
