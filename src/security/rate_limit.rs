//! Per-actor hourly/daily quotas and a per-IP request ceiling.
//!
//! Actor quotas count persisted `user` messages in the trailing hour/day.
//! An in-memory counter per window is kept alongside and only consulted when
//! the ledger cannot be read.  The IP ceiling is a fixed one-minute window
//! held entirely in memory.  Both in-memory maps drop expired entries on the
//! request path once either grows past [`SWEEP_THRESHOLD`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::ledger::Ledger;
use crate::util::{seconds_until_midnight, seconds_until_next_hour, Clock};

/// Map size above which expired in-memory counters are swept on write.
pub const SWEEP_THRESHOLD: usize = 4096;

pub const IP_LIMIT_MESSAGE: &str = "Too many requests. Please slow down and try again shortly.";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitPolicy {
    /// Messages per trailing hour, `0` = unlimited.
    pub hourly_limit: u64,
    /// Messages per trailing day, `0` = unlimited.
    pub daily_limit: u64,
    /// Requests per minute per client IP, `0` = unlimited.
    pub ip_limit_per_minute: u64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            hourly_limit: 50,
            daily_limit: 250,
            ip_limit_per_minute: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub retry_after_secs: i64,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            message: None,
            retry_after_secs: 0,
        }
    }

    fn deny(message: String, retry_after_secs: i64) -> Self {
        Self {
            allowed: false,
            message: Some(message),
            retry_after_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowStatus {
    pub count: u64,
    pub limit: u64,
    /// `None` when the window is unlimited.
    pub remaining: Option<u64>,
    pub reset_in: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub hourly: WindowStatus,
    pub daily: WindowStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Window {
    Hour,
    Day,
}

impl Window {
    fn span(self) -> Duration {
        match self {
            Window::Hour => Duration::hours(1),
            Window::Day => Duration::days(1),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FastCounter {
    count: u64,
    expires_at: DateTime<Utc>,
}

impl FastCounter {
    fn live(&self, now: DateTime<Utc>) -> u64 {
        if now < self.expires_at {
            self.count
        } else {
            0
        }
    }
}

pub struct RateLimiter {
    policy: RateLimitPolicy,
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
    fast: DashMap<(Window, Option<u64>), FastCounter>,
    ip: DashMap<String, FastCounter>,
    /// Unix seconds of the last request-path sweep.
    last_sweep: AtomicI64,
}

impl RateLimiter {
    pub fn new(
        policy: RateLimitPolicy,
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
        offset: FixedOffset,
    ) -> Self {
        Self {
            policy,
            ledger,
            clock,
            offset,
            fast: DashMap::new(),
            ip: DashMap::new(),
            last_sweep: AtomicI64::new(i64::MIN),
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    async fn count(&self, actor: Option<u64>, window: Window, now: DateTime<Utc>) -> u64 {
        match self.ledger.count_user_messages_since(actor, now - window.span()).await {
            Ok(count) => count,
            Err(err) => {
                let fallback = self
                    .fast
                    .get(&(window, actor))
                    .map(|c| c.live(now))
                    .unwrap_or(0);
                tracing::warn!(
                    actor = ?actor,
                    window = ?window,
                    fallback,
                    error = %err,
                    "ledger count unavailable, using in-memory counter"
                );
                fallback
            }
        }
    }

    /// Hourly ceiling first, then daily.
    pub async fn check(&self, actor: Option<u64>) -> RateDecision {
        let now = self.clock.now();
        let hourly = self.policy.hourly_limit;
        if hourly > 0 && self.count(actor, Window::Hour, now).await >= hourly {
            return RateDecision::deny(
                format!(
                    "You have exceeded the hourly limit of {} messages. Please try again later.",
                    hourly
                ),
                seconds_until_next_hour(now, self.offset),
            );
        }
        let daily = self.policy.daily_limit;
        if daily > 0 && self.count(actor, Window::Day, now).await >= daily {
            return RateDecision::deny(
                format!(
                    "You have exceeded the daily limit of {} messages. Please try again tomorrow.",
                    daily
                ),
                seconds_until_midnight(now, self.offset),
            );
        }
        RateDecision::allow()
    }

    /// Count one delivered message in the in-memory windows.
    pub fn record(&self, actor: Option<u64>) {
        let now = self.clock.now();
        self.sweep_if_crowded(now);
        for window in [Window::Hour, Window::Day] {
            let mut entry = self.fast.entry((window, actor)).or_insert(FastCounter {
                count: 0,
                expires_at: now + window.span(),
            });
            if now >= entry.expires_at {
                *entry = FastCounter {
                    count: 0,
                    expires_at: now + window.span(),
                };
            }
            entry.count += 1;
        }
    }

    pub async fn status(&self, actor: Option<u64>) -> RateLimitStatus {
        let now = self.clock.now();
        let window_status = |count: u64, limit: u64, reset_in: i64| WindowStatus {
            count,
            limit,
            remaining: (limit > 0).then(|| limit.saturating_sub(count)),
            reset_in,
        };
        let hourly = self.count(actor, Window::Hour, now).await;
        let daily = self.count(actor, Window::Day, now).await;
        RateLimitStatus {
            hourly: window_status(
                hourly,
                self.policy.hourly_limit,
                seconds_until_next_hour(now, self.offset),
            ),
            daily: window_status(
                daily,
                self.policy.daily_limit,
                seconds_until_midnight(now, self.offset),
            ),
        }
    }

    /// Count one request from `ip` and decide whether it may proceed.
    pub fn check_ip(&self, ip: &str) -> RateDecision {
        let limit = self.policy.ip_limit_per_minute;
        if limit == 0 {
            return RateDecision::allow();
        }
        let now = self.clock.now();
        self.sweep_if_crowded(now);
        let mut entry = self.ip.entry(ip.to_string()).or_insert(FastCounter {
            count: 0,
            expires_at: now + Duration::minutes(1),
        });
        if now >= entry.expires_at {
            *entry = FastCounter {
                count: 0,
                expires_at: now + Duration::minutes(1),
            };
        }
        if entry.count >= limit {
            let retry = (entry.expires_at - now).num_seconds().max(1);
            return RateDecision::deny(IP_LIMIT_MESSAGE.to_string(), retry);
        }
        entry.count += 1;
        RateDecision::allow()
    }

    /// Drop expired counters once a map passes [`SWEEP_THRESHOLD`], at most
    /// once per minute.
    fn sweep_if_crowded(&self, now: DateTime<Utc>) {
        if self.ip.len() <= SWEEP_THRESHOLD && self.fast.len() <= SWEEP_THRESHOLD {
            return;
        }
        let stamp = now.timestamp();
        let last = self.last_sweep.load(Ordering::Relaxed);
        if stamp.saturating_sub(last) < 60 {
            return;
        }
        if self
            .last_sweep
            .compare_exchange(last, stamp, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.prune();
        }
    }

    /// Number of client IPs currently holding a counter.
    pub fn tracked_ips(&self) -> usize {
        self.ip.len()
    }

    /// Drop expired in-memory counters.
    pub fn prune(&self) {
        let now = self.clock.now();
        self.fast.retain(|_, c| now < c.expires_at);
        self.ip.retain(|_, c| now < c.expires_at);
    }
}
