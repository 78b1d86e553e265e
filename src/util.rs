//! Utility helpers for qgate.
//!
//! This module exposes the shared pattern-matcher cache, the clock
//! abstraction every time-dependent service is built on, and the small
//! calendar helpers used for quota reset times.

use ahash::AHasher;
use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use chrono::{DateTime, Duration, FixedOffset, SecondsFormat, TimeZone, Timelike, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

/// Source of the current time.  Services take an `Arc<dyn Clock>` so tests
/// can move time forward without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.  Used by tests and benchmarks.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Canonical persisted timestamp: RFC 3339, UTC, millisecond precision.
/// Fixed width, so string order equals time order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Seconds from `now` until the top of the next hour in `offset`.
pub fn seconds_until_next_hour(now: DateTime<Utc>, offset: FixedOffset) -> i64 {
    let local = now.with_timezone(&offset);
    let floored = local
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(local);
    let next = floored + Duration::hours(1);
    (next - local).num_seconds().max(1)
}

/// Seconds from `now` until the next midnight in `offset`.
pub fn seconds_until_midnight(now: DateTime<Utc>, offset: FixedOffset) -> i64 {
    let local = now.with_timezone(&offset);
    let tomorrow = local.date_naive() + Duration::days(1);
    let midnight = tomorrow
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| offset.from_local_datetime(&naive).single());
    match midnight {
        Some(m) => (m - local).num_seconds().max(1),
        None => 86_400,
    }
}

/// A memoising wrapper around `AhoCorasick::new` to avoid recompiling
/// automata for repeated lists.  The cache key is a hash of the pattern list.
static AC_CACHE: Lazy<DashMap<u64, Arc<AhoCorasick>>> = Lazy::new(DashMap::new);

/// Given a list of literal patterns, return a shared case-insensitive
/// `AhoCorasick` matcher.  Matchers are cached by the hash of the list, so
/// a given list is only compiled once per process.
pub fn ac_for(list: &[&str]) -> Arc<AhoCorasick> {
    let mut hasher = AHasher::default();
    for pat in list {
        pat.hash(&mut hasher);
    }
    let key = hasher.finish();
    if let Some(existing) = AC_CACHE.get(&key) {
        return existing.clone();
    }
    let lower: Vec<String> = list.iter().map(|p| p.to_lowercase()).collect();
    let ac = AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .build(lower)
        .expect("literal pattern lists always compile");
    let arc = Arc::new(ac);
    AC_CACHE.insert(key, arc.clone());
    arc
}
