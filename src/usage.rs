use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::UsageStore;
use crate::window::{
    HOURLY_WINDOW_MINUTES, hour_window_start, minute_of, month_start, next_month_start,
};

// 每隔多少次写入顺带做一轮闲置淘汰
const EVICT_SWEEP_EVERY: u64 = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    pub principal_id: String,
    pub timestamp: DateTime<Utc>,
    pub weight: u64,
    pub endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Granted { monthly_used: u64 },
    MonthlyExhausted { monthly_used: u64 },
    HourlyExhausted { hourly_used: u64 },
}

// 单个主体的窗口计数：月度累计 + 按分钟分桶的滑动小时窗口。
// external 记录持久层刷新时比本进程多出的量（其他实例写入的部分），
// 挂在窗口最旧的分钟上，随窗口滑动最早过期。
#[derive(Debug)]
struct PrincipalUsage {
    month_start: DateTime<Utc>,
    monthly: u64,
    buckets: VecDeque<(i64, u64)>,
    external_minute: i64,
    external: u64,
    monthly_refreshed_at: Option<DateTime<Utc>>,
    hourly_refreshed_at: Option<DateTime<Utc>>,
    touched_at: DateTime<Utc>,
}

impl PrincipalUsage {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            month_start: month_start(now),
            monthly: 0,
            buckets: VecDeque::new(),
            external_minute: i64::MIN,
            external: 0,
            monthly_refreshed_at: None,
            hourly_refreshed_at: None,
            touched_at: now,
        }
    }

    fn roll_month(&mut self, now: DateTime<Utc>) {
        let current = month_start(now);
        if current != self.month_start {
            self.month_start = current;
            self.monthly = 0;
            self.monthly_refreshed_at = None;
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = minute_of(now) - HOURLY_WINDOW_MINUTES - 1;
        while let Some(&(minute, _)) = self.buckets.front() {
            if minute >= cutoff {
                break;
            }
            self.buckets.pop_front();
        }
        if self.external_minute < cutoff {
            self.external = 0;
            self.external_minute = i64::MIN;
        }
    }

    fn push_bucket(&mut self, minute: i64, weight: u64) {
        match self.buckets.back_mut() {
            Some((m, w)) if *m == minute => *w += weight,
            _ => self.buckets.push_back((minute, weight)),
        }
    }

    // 不含 external 的分桶和
    fn bucket_sum(&self, cutoff_minute: i64) -> u64 {
        self.buckets
            .iter()
            .filter(|(m, _)| *m >= cutoff_minute)
            .map(|(_, w)| *w)
            .sum()
    }

    fn hourly_sum(&self, cutoff_minute: i64) -> u64 {
        let external = if self.external_minute >= cutoff_minute {
            self.external
        } else {
            0
        };
        self.bucket_sum(cutoff_minute) + external
    }

    fn is_stale(refreshed_at: Option<DateTime<Utc>>, now: DateTime<Utc>, ttl: Duration) -> bool {
        match refreshed_at {
            Some(t) => now - t >= ttl,
            None => true,
        }
    }
}

enum WindowMode {
    Monthly,
    Hourly,
    Historical,
}

/// Usage tracking with a process-wide write-through cache in front of the
/// durable event log. The cache answers window queries while fresh; past the
/// TTL the count is recomputed from durable storage and merged back with a
/// monotone `max` so a fixed window never observes a decreasing value.
pub struct UsageTracker {
    store: Arc<dyn UsageStore>,
    cache: DashMap<String, PrincipalUsage>,
    ttl: Duration,
    write_ops: AtomicU64,
}

impl UsageTracker {
    pub fn new(store: Arc<dyn UsageStore>, ttl_secs: u64) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            ttl: Duration::seconds(ttl_secs as i64),
            write_ops: AtomicU64::new(0),
        }
    }

    fn with_entry<R>(
        &self,
        principal_id: &str,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut PrincipalUsage) -> R,
    ) -> R {
        let mut entry = self
            .cache
            .entry(principal_id.to_string())
            .or_insert_with(|| PrincipalUsage::new(now));
        entry.touched_at = now;
        f(&mut entry)
    }

    pub async fn record_usage(&self, principal_id: &str, weight: u64, endpoint: &str) {
        self.record_usage_at(principal_id, weight, endpoint, Utc::now())
            .await;
    }

    // 先更新内存计数（后续 get_usage 立即可见），再落持久层；
    // 持久层写入失败只记日志，刷新时靠 max 合并对账
    pub async fn record_usage_at(
        &self,
        principal_id: &str,
        weight: u64,
        endpoint: &str,
        now: DateTime<Utc>,
    ) {
        self.with_entry(principal_id, now, |e| {
            e.roll_month(now);
            e.prune(now);
            e.monthly += weight;
            e.push_bucket(minute_of(now), weight);
        });
        self.maybe_sweep(now);
        self.persist_event(principal_id, weight, endpoint, now).await;
    }

    pub(crate) async fn persist_event(
        &self,
        principal_id: &str,
        weight: u64,
        endpoint: &str,
        now: DateTime<Utc>,
    ) {
        let event = UsageEvent {
            principal_id: principal_id.to_string(),
            timestamp: now,
            weight,
            endpoint: endpoint.to_string(),
        };
        if let Err(e) = self.store.append_usage(&event).await {
            tracing::error!("Failed to persist usage event for {}: {}", principal_id, e);
        }
    }

    pub async fn get_usage(&self, principal_id: &str, window_start: DateTime<Utc>) -> Result<u64> {
        self.get_usage_at(principal_id, window_start, Utc::now())
            .await
    }

    /// Sum of usage weights since `window_start`. The current-month and
    /// sliding-hour windows are served from the cache while fresh; any other
    /// window is a historical query answered straight from durable storage.
    pub async fn get_usage_at(
        &self,
        principal_id: &str,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mode = if window_start == month_start(now) {
            WindowMode::Monthly
        } else if window_start <= now && window_start >= hour_window_start(now) {
            WindowMode::Hourly
        } else {
            WindowMode::Historical
        };

        if let WindowMode::Historical = mode {
            // 历史自然月窗口按 [月初, 下月初) 闭合，其余历史窗口开到当前
            let until = if window_start == month_start(window_start)
                && window_start < month_start(now)
            {
                Some(next_month_start(window_start))
            } else {
                None
            };
            return self.store.sum_usage(principal_id, window_start, until).await;
        }

        let cutoff = minute_of(window_start);
        let (cached, stale) = self.with_entry(principal_id, now, |e| {
            e.roll_month(now);
            e.prune(now);
            match mode {
                WindowMode::Monthly => (
                    e.monthly,
                    PrincipalUsage::is_stale(e.monthly_refreshed_at, now, self.ttl),
                ),
                WindowMode::Hourly => (
                    e.hourly_sum(cutoff),
                    PrincipalUsage::is_stale(e.hourly_refreshed_at, now, self.ttl),
                ),
                WindowMode::Historical => unreachable!(),
            }
        });

        if !stale {
            return Ok(cached);
        }

        // 不持锁跨 await：先放锁查持久层，回来再合并
        let durable = self.store.sum_usage(principal_id, window_start, None).await?;

        Ok(self.with_entry(principal_id, now, |e| {
            e.roll_month(now);
            e.prune(now);
            match mode {
                WindowMode::Monthly => {
                    e.monthly = e.monthly.max(durable);
                    e.monthly_refreshed_at = Some(now);
                    e.monthly
                }
                WindowMode::Hourly => {
                    let raw = e.bucket_sum(cutoff);
                    e.external = durable.saturating_sub(raw);
                    e.external_minute = cutoff;
                    e.hourly_refreshed_at = Some(now);
                    raw + e.external
                }
                WindowMode::Historical => unreachable!(),
            }
        }))
    }

    /// Atomic reserve-if-available: the check and the increment happen under
    /// one exclusive cache entry, so concurrent reservations can never exceed
    /// the limit. Monthly ceiling is evaluated before hourly.
    pub fn try_add_within(
        &self,
        principal_id: &str,
        weight: u64,
        monthly_limit: u64,
        hourly_limit: u64,
        now: DateTime<Utc>,
    ) -> ReserveOutcome {
        self.with_entry(principal_id, now, |e| {
            e.roll_month(now);
            e.prune(now);
            let cutoff = minute_of(hour_window_start(now));
            let monthly_used = e.monthly;
            let hourly_used = e.hourly_sum(cutoff);

            if monthly_used.saturating_add(weight) > monthly_limit {
                return ReserveOutcome::MonthlyExhausted { monthly_used };
            }
            if hourly_used.saturating_add(weight) > hourly_limit {
                return ReserveOutcome::HourlyExhausted { hourly_used };
            }

            e.monthly += weight;
            e.push_bucket(minute_of(now), weight);
            ReserveOutcome::Granted {
                monthly_used: e.monthly,
            }
        })
    }

    /// Drop cache entries untouched for longer than the TTL. Purely a memory
    /// bound; durable storage stays authoritative for anything evicted.
    pub fn evict_idle(&self, now: DateTime<Utc>) {
        self.cache.retain(|_, e| now - e.touched_at < self.ttl);
    }

    fn maybe_sweep(&self, now: DateTime<Utc>) {
        let ops = self.write_ops.fetch_add(1, Ordering::Relaxed) + 1;
        if ops % EVICT_SWEEP_EVERY == 0 {
            self.evict_idle(now);
        }
    }

    pub fn cached_principals(&self) -> usize {
        self.cache.len()
    }
}
