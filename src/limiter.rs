use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::audit::{DecisionKind, GateAuditLog, GateDecision};
use crate::catalog::PlanCatalog;
use crate::config::FailPolicy;
use crate::gate::ReasonCode;
use crate::usage::{ReserveOutcome, UsageTracker};
use crate::window::{hour_window_start, month_start, next_month_start};

/// Remaining quota reported on a degraded (fail-open) response. Deliberately
/// smaller than any real plan limit so degraded verdicts stay recognizable
/// and callers that want to be conservative can throttle themselves.
pub const FAIL_OPEN_REMAINING: u64 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitVerdict {
    pub allowed: bool,
    pub reason: ReasonCode,
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_time: Option<DateTime<Utc>>,
    pub degraded: bool,
}

impl LimitVerdict {
    fn allowed(limit: u64, remaining: u64) -> Self {
        Self {
            allowed: true,
            reason: ReasonCode::Allowed,
            limit: Some(limit),
            remaining: Some(remaining),
            reset_time: None,
            degraded: false,
        }
    }

    fn denied(reason: ReasonCode, limit: u64, reset_time: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            reason,
            limit: Some(limit),
            remaining: Some(0),
            reset_time: Some(reset_time),
            degraded: false,
        }
    }

    fn misconfigured() -> Self {
        Self {
            allowed: false,
            reason: ReasonCode::Misconfigured,
            limit: None,
            remaining: None,
            reset_time: None,
            degraded: false,
        }
    }

    fn degraded(policy: FailPolicy, limit: Option<u64>) -> Self {
        match policy {
            FailPolicy::Open => Self {
                allowed: true,
                reason: ReasonCode::StoreUnavailable,
                limit,
                remaining: Some(FAIL_OPEN_REMAINING),
                reset_time: None,
                degraded: true,
            },
            FailPolicy::Closed => Self {
                allowed: false,
                reason: ReasonCode::StoreUnavailable,
                limit,
                remaining: None,
                reset_time: None,
                degraded: true,
            },
        }
    }
}

/// Dual-window admission control: the monthly budget is checked before the
/// hourly burst ceiling, so a caller who has exhausted the month never sees a
/// misleading "try again in an hour".
pub struct RateLimiter {
    catalog: Arc<PlanCatalog>,
    tracker: Arc<UsageTracker>,
    audit: GateAuditLog,
    fail_policy: FailPolicy,
    store_timeout: std::time::Duration,
}

impl RateLimiter {
    pub fn new(
        catalog: Arc<PlanCatalog>,
        tracker: Arc<UsageTracker>,
        audit: GateAuditLog,
        fail_policy: FailPolicy,
        store_timeout: std::time::Duration,
    ) -> Self {
        Self {
            catalog,
            tracker,
            audit,
            fail_policy,
            store_timeout,
        }
    }

    // 持久层读取超时与读取失败同样走降级策略，不上抛给调用方
    async fn usage_with_timeout(
        &self,
        principal_id: &str,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> crate::error::Result<u64> {
        match tokio::time::timeout(
            self.store_timeout,
            self.tracker.get_usage_at(principal_id, window_start, now),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(crate::error::GateError::Storage(
                "usage store read timed out".into(),
            )),
        }
    }

    pub async fn check_limit(&self, principal_id: &str, plan_id: &str) -> LimitVerdict {
        self.check_limit_at(principal_id, plan_id, Utc::now()).await
    }

    // 参考实现：check 与 record 分离的两步模式，高并发下可能少量超发；
    // 并发敏感路径请走 try_reserve
    pub async fn check_limit_at(
        &self,
        principal_id: &str,
        plan_id: &str,
        now: DateTime<Utc>,
    ) -> LimitVerdict {
        let Some(plan) = self.catalog.get(plan_id) else {
            tracing::warn!("check_limit against unknown plan '{}'", plan_id);
            let verdict = LimitVerdict::misconfigured();
            self.audit(principal_id, plan_id, &verdict, "check_limit").await;
            return verdict;
        };
        let limits = &plan.limits;

        let monthly = self
            .usage_with_timeout(principal_id, month_start(now), now)
            .await;
        let hourly = self
            .usage_with_timeout(principal_id, hour_window_start(now), now)
            .await;

        let verdict = match (monthly, hourly) {
            (Ok(monthly_used), Ok(hourly_used)) => {
                if monthly_used >= limits.monthly_calls {
                    LimitVerdict::denied(
                        ReasonCode::QuotaExceeded,
                        limits.monthly_calls,
                        next_month_start(now),
                    )
                } else if hourly_used >= limits.hourly_calls {
                    LimitVerdict::denied(
                        ReasonCode::RateLimited,
                        limits.hourly_calls,
                        now + Duration::hours(1),
                    )
                } else {
                    LimitVerdict::allowed(
                        limits.monthly_calls,
                        limits.monthly_calls - monthly_used,
                    )
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(
                    "usage store unreachable for {}, applying {:?} policy: {}",
                    principal_id,
                    self.fail_policy,
                    e
                );
                LimitVerdict::degraded(self.fail_policy, Some(limits.monthly_calls))
            }
        };

        self.audit(principal_id, plan_id, &verdict, "check_limit").await;
        verdict
    }

    pub async fn try_reserve(
        &self,
        principal_id: &str,
        plan_id: &str,
        weight: u64,
        endpoint: &str,
    ) -> LimitVerdict {
        self.try_reserve_at(principal_id, plan_id, weight, endpoint, Utc::now())
            .await
    }

    /// Atomic reserve-if-available. At most `limit` weight worth of concurrent
    /// reservations can succeed in a window; granted reservations are
    /// persisted as usage events.
    pub async fn try_reserve_at(
        &self,
        principal_id: &str,
        plan_id: &str,
        weight: u64,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> LimitVerdict {
        let Some(plan) = self.catalog.get(plan_id) else {
            tracing::warn!("try_reserve against unknown plan '{}'", plan_id);
            let verdict = LimitVerdict::misconfigured();
            self.audit(principal_id, plan_id, &verdict, endpoint).await;
            return verdict;
        };
        let limits = &plan.limits;

        // 先把两个窗口刷新到位（拉入其他实例的用量），原子检查在内存上进行
        let freshen_monthly = self
            .usage_with_timeout(principal_id, month_start(now), now)
            .await;
        let freshen_hourly = self
            .usage_with_timeout(principal_id, hour_window_start(now), now)
            .await;

        if let Err(e) = freshen_monthly.and(freshen_hourly) {
            tracing::warn!(
                "usage store unreachable for {}, applying {:?} policy: {}",
                principal_id,
                self.fail_policy,
                e
            );
            let verdict = LimitVerdict::degraded(self.fail_policy, Some(limits.monthly_calls));
            if verdict.allowed {
                // 放行时仍然记账：内存立即可见，持久化尽力而为
                self.tracker
                    .record_usage_at(principal_id, weight, endpoint, now)
                    .await;
            }
            self.audit(principal_id, plan_id, &verdict, endpoint).await;
            return verdict;
        }

        let outcome = self.tracker.try_add_within(
            principal_id,
            weight,
            limits.monthly_calls,
            limits.hourly_calls,
            now,
        );

        let verdict = match outcome {
            ReserveOutcome::Granted { monthly_used } => {
                self.tracker
                    .persist_event(principal_id, weight, endpoint, now)
                    .await;
                LimitVerdict::allowed(
                    limits.monthly_calls,
                    limits.monthly_calls.saturating_sub(monthly_used),
                )
            }
            ReserveOutcome::MonthlyExhausted { .. } => LimitVerdict::denied(
                ReasonCode::QuotaExceeded,
                limits.monthly_calls,
                next_month_start(now),
            ),
            ReserveOutcome::HourlyExhausted { .. } => LimitVerdict::denied(
                ReasonCode::RateLimited,
                limits.hourly_calls,
                now + Duration::hours(1),
            ),
        };

        self.audit(principal_id, plan_id, &verdict, endpoint).await;
        verdict
    }

    async fn audit(
        &self,
        principal_id: &str,
        plan_id: &str,
        verdict: &LimitVerdict,
        endpoint: &str,
    ) {
        self.audit
            .record(GateDecision::new(
                DecisionKind::Quota,
                verdict.allowed,
                verdict.reason,
                principal_id,
                plan_id,
                serde_json::json!({
                    "endpoint": endpoint,
                    "remaining": verdict.remaining,
                    "degraded": verdict.degraded,
                }),
            ))
            .await;
    }
}
