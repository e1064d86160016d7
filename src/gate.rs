use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::GateAuditLog;
use crate::catalog::{Feature, PlanCatalog};
use crate::config::{GateConfig, Settings, StorageBackend};
use crate::error::{GateError, Result};
use crate::evaluator::EntitlementEvaluator;
use crate::limiter::RateLimiter;
use crate::storage::{AuditStore, PgStore, SqliteStore, UsageStore};
use crate::subscription::SubscriptionStore;
use crate::usage::UsageTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Allowed,
    InsufficientPlan,
    QuotaExceeded,
    RateLimited,
    Misconfigured,
    StoreUnavailable,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::Allowed => "allowed",
            ReasonCode::InsufficientPlan => "insufficient_plan",
            ReasonCode::QuotaExceeded => "quota_exceeded",
            ReasonCode::RateLimited => "rate_limited",
            ReasonCode::Misconfigured => "misconfigured",
            ReasonCode::StoreUnavailable => "store_unavailable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allowed" => Some(ReasonCode::Allowed),
            "insufficient_plan" => Some(ReasonCode::InsufficientPlan),
            "quota_exceeded" => Some(ReasonCode::QuotaExceeded),
            "rate_limited" => Some(ReasonCode::RateLimited),
            "misconfigured" => Some(ReasonCode::Misconfigured),
            "store_unavailable" => Some(ReasonCode::StoreUnavailable),
            _ => None,
        }
    }
}

// 请求处理方提交的闸门评估请求；plan_id 缺省时由订阅状态解析
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateRequest {
    pub principal_id: String,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub feature: Option<Feature>,
    #[serde(default)]
    pub module_id: Option<String>,
    #[serde(default)]
    pub weight: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateResponse {
    pub allowed: bool,
    pub reason: ReasonCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_plan: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<DateTime<Utc>>,
    pub degraded: bool,
}

/// The admission gate: static entitlement first, then quota reservation,
/// every decision audited. One instance per process, passed through
/// request-scoped context; all collaborators are injected.
pub struct Gate {
    catalog: Arc<PlanCatalog>,
    evaluator: EntitlementEvaluator,
    limiter: RateLimiter,
    tracker: Arc<UsageTracker>,
    audit: GateAuditLog,
    subscriptions: Arc<dyn SubscriptionStore>,
}

impl Gate {
    /// Wire the gate from configuration, choosing the storage backend the way
    /// the settings ask for it.
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        let catalog = Arc::new(settings.catalog()?);
        match settings.storage.backend {
            StorageBackend::Sqlite => {
                let store = Arc::new(SqliteStore::new(&settings.storage.database_path).await?);
                Ok(Self::with_stores(
                    catalog,
                    store.clone(),
                    store.clone(),
                    store,
                    settings.cache.ttl_secs,
                    settings.gate.clone(),
                ))
            }
            StorageBackend::Postgres => {
                let pg_url = settings.storage.pg_url.as_ref().ok_or_else(|| {
                    GateError::Config("postgres backend requires storage.pg_url".into())
                })?;
                let store = Arc::new(
                    PgStore::connect(
                        pg_url,
                        &settings.storage.pg_schema,
                        settings.storage.pg_pool_size.unwrap_or(4),
                    )
                    .await?,
                );
                Ok(Self::with_stores(
                    catalog,
                    store.clone(),
                    store.clone(),
                    store,
                    settings.cache.ttl_secs,
                    settings.gate.clone(),
                ))
            }
        }
    }

    pub fn with_stores(
        catalog: Arc<PlanCatalog>,
        usage_store: Arc<dyn UsageStore>,
        audit_store: Arc<dyn AuditStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        cache_ttl_secs: u64,
        gate_config: GateConfig,
    ) -> Self {
        let audit = GateAuditLog::new(audit_store);
        let tracker = Arc::new(UsageTracker::new(usage_store, cache_ttl_secs));
        let evaluator = EntitlementEvaluator::new(catalog.clone(), audit.clone());
        let limiter = RateLimiter::new(
            catalog.clone(),
            tracker.clone(),
            audit.clone(),
            gate_config.fail_policy,
            std::time::Duration::from_millis(gate_config.store_timeout_ms),
        );
        Self {
            catalog,
            evaluator,
            limiter,
            tracker,
            audit,
            subscriptions,
        }
    }

    pub async fn evaluate(&self, request: GateRequest) -> Result<GateResponse> {
        self.evaluate_at(request, Utc::now()).await
    }

    pub async fn evaluate_at(
        &self,
        request: GateRequest,
        now: DateTime<Utc>,
    ) -> Result<GateResponse> {
        if request.principal_id.trim().is_empty() {
            return Err(GateError::InvalidInput("principal id is required".into()));
        }

        let mut degraded = false;
        let plan_id = match &request.plan_id {
            Some(plan_id) => plan_id.clone(),
            None => match self
                .subscriptions
                .get_active_subscription(&request.principal_id)
                .await
            {
                Ok(Some(sub)) => sub.plan_id,
                // 无有效订阅按最低档位评估，不是错误
                Ok(None) => self.catalog.lowest_tier().id.clone(),
                Err(e) => {
                    tracing::warn!(
                        "subscription lookup failed for {}, falling back to lowest tier: {}",
                        request.principal_id,
                        e
                    );
                    degraded = true;
                    self.catalog.lowest_tier().id.clone()
                }
            },
        };

        if let Some(feature) = request.feature {
            let verdict = self
                .evaluator
                .check_feature(&request.principal_id, &plan_id, feature)
                .await;
            if !verdict.allowed {
                return Ok(GateResponse {
                    allowed: false,
                    reason: verdict.reason,
                    required_plan: verdict.required_plan,
                    remaining: None,
                    reset_time: None,
                    degraded,
                });
            }
        }

        if let Some(module_id) = &request.module_id {
            let allowed = self
                .evaluator
                .can_access_module(&request.principal_id, &plan_id, module_id)
                .await;
            if !allowed {
                let reason = if self.catalog.get(&plan_id).is_none() {
                    ReasonCode::Misconfigured
                } else {
                    ReasonCode::InsufficientPlan
                };
                let required_plan = self
                    .catalog
                    .plans()
                    .find(|p| p.module_access.permits(module_id))
                    .map(|p| p.id.clone());
                return Ok(GateResponse {
                    allowed: false,
                    reason,
                    required_plan,
                    remaining: None,
                    reset_time: None,
                    degraded,
                });
            }
        }

        let endpoint = request
            .feature
            .map(|f| f.as_str().to_string())
            .or_else(|| request.module_id.clone())
            .unwrap_or_else(|| "evaluate".to_string());
        let weight = request.weight.unwrap_or(1);

        let verdict = self
            .limiter
            .try_reserve_at(&request.principal_id, &plan_id, weight, &endpoint, now)
            .await;

        Ok(GateResponse {
            allowed: verdict.allowed,
            reason: verdict.reason,
            required_plan: None,
            remaining: verdict.remaining,
            reset_time: verdict.reset_time,
            degraded: degraded || verdict.degraded,
        })
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    pub fn evaluator(&self) -> &EntitlementEvaluator {
        &self.evaluator
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.tracker
    }

    pub fn audit_log(&self) -> &GateAuditLog {
        &self.audit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ModuleAccess, Plan, UsageLimits};
    use crate::subscription::{Subscription, SubscriptionStatus};
    use chrono::{Duration, TimeZone};
    use std::collections::HashSet;

    async fn sqlite_gate() -> (Arc<SqliteStore>, Gate) {
        let store = Arc::new(SqliteStore::new_in_memory().await.unwrap());
        let gate = Gate::with_stores(
            Arc::new(PlanCatalog::default_catalog()),
            store.clone(),
            store.clone(),
            store.clone(),
            300,
            GateConfig::default(),
        );
        (store, gate)
    }

    fn quota_plan(monthly: u64, hourly: u64) -> PlanCatalog {
        PlanCatalog::new(vec![Plan {
            id: "pro".into(),
            tier_rank: 2,
            features: [Feature::ExportPdf].into_iter().collect(),
            module_access: ModuleAccess::all(),
            limits: UsageLimits {
                monthly_calls: monthly,
                hourly_calls: hourly,
                export_formats: HashSet::new(),
            },
        }])
        .unwrap()
    }

    async fn quota_gate(monthly: u64, hourly: u64) -> Gate {
        let store = Arc::new(SqliteStore::new_in_memory().await.unwrap());
        Gate::with_stores(
            Arc::new(quota_plan(monthly, hourly)),
            store.clone(),
            store.clone(),
            store,
            300,
            GateConfig::default(),
        )
    }

    fn request(principal: &str, plan: Option<&str>, feature: Option<Feature>) -> GateRequest {
        GateRequest {
            principal_id: principal.into(),
            plan_id: plan.map(str::to_string),
            feature,
            module_id: None,
            weight: None,
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn reason_code_roundtrip() {
        for r in [
            ReasonCode::Allowed,
            ReasonCode::InsufficientPlan,
            ReasonCode::QuotaExceeded,
            ReasonCode::RateLimited,
            ReasonCode::Misconfigured,
            ReasonCode::StoreUnavailable,
        ] {
            assert_eq!(ReasonCode::parse(r.as_str()), Some(r));
        }
        assert!(ReasonCode::parse("nope").is_none());
    }

    #[tokio::test]
    async fn empty_principal_is_the_only_input_error() {
        let (_, gate) = sqlite_gate().await;
        let err = gate
            .evaluate_at(request("  ", None, None), noon())
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn principal_without_subscription_evaluates_as_lowest_tier() {
        let (_, gate) = sqlite_gate().await;
        let response = gate
            .evaluate_at(request("org-1", None, Some(Feature::ExportPdf)), noon())
            .await
            .unwrap();
        assert!(!response.allowed);
        assert_eq!(response.reason, ReasonCode::InsufficientPlan);
        assert_eq!(response.required_plan.as_deref(), Some("pro"));
    }

    #[tokio::test]
    async fn active_subscription_resolves_the_plan() {
        let (store, gate) = sqlite_gate().await;
        let now = noon();
        store
            .upsert_subscription(&Subscription {
                principal_id: "org-1".into(),
                plan_id: "pro".into(),
                status: SubscriptionStatus::Active,
                period_start: now - Duration::days(10),
                period_end: now + Duration::days(20),
            })
            .await
            .unwrap();

        let response = gate
            .evaluate_at(request("org-1", None, Some(Feature::ExportPdf)), now)
            .await
            .unwrap();
        assert!(response.allowed);
        assert_eq!(response.reason, ReasonCode::Allowed);
        assert!(response.remaining.is_some());
    }

    #[tokio::test]
    async fn request_plan_overrides_subscription_lookup() {
        let (_, gate) = sqlite_gate().await;
        let response = gate
            .evaluate_at(request("org-1", Some("pro"), Some(Feature::ExportPdf)), noon())
            .await
            .unwrap();
        assert!(response.allowed);
    }

    #[tokio::test]
    async fn module_denial_points_at_cheapest_granting_plan() {
        let (_, gate) = sqlite_gate().await;
        let mut req = request("org-1", Some("free"), None);
        req.module_id = Some("reports".into());
        let response = gate.evaluate_at(req, noon()).await.unwrap();
        assert!(!response.allowed);
        assert_eq!(response.reason, ReasonCode::InsufficientPlan);
        assert_eq!(response.required_plan.as_deref(), Some("starter"));
    }

    #[tokio::test]
    async fn monthly_quota_exhaustion_reports_month_reset() {
        let gate = quota_gate(5, 1_000).await;
        let now = noon();

        for _ in 0..5 {
            let r = gate
                .evaluate_at(request("org-1", Some("pro"), None), now)
                .await
                .unwrap();
            assert!(r.allowed);
        }
        let r = gate
            .evaluate_at(request("org-1", Some("pro"), None), now)
            .await
            .unwrap();
        assert!(!r.allowed);
        assert_eq!(r.reason, ReasonCode::QuotaExceeded);
        assert_eq!(
            r.reset_time,
            Some(Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn hourly_burst_reports_hour_reset() {
        let gate = quota_gate(1_000, 3).await;
        let now = noon();

        for _ in 0..3 {
            let r = gate
                .evaluate_at(request("org-1", Some("pro"), None), now)
                .await
                .unwrap();
            assert!(r.allowed);
        }
        let r = gate
            .evaluate_at(request("org-1", Some("pro"), None), now)
            .await
            .unwrap();
        assert!(!r.allowed);
        assert_eq!(r.reason, ReasonCode::RateLimited);
        assert_eq!(r.reset_time, Some(now + Duration::hours(1)));
    }

    #[tokio::test]
    async fn weight_draws_down_remaining() {
        let gate = quota_gate(100, 1_000).await;
        let mut req = request("org-1", Some("pro"), None);
        req.weight = Some(30);
        let r = gate.evaluate_at(req, noon()).await.unwrap();
        assert!(r.allowed);
        assert_eq!(r.remaining, Some(70));
    }

    #[tokio::test]
    async fn denied_entitlement_skips_quota_and_is_audited() {
        let (_, gate) = sqlite_gate().await;
        let now = noon();
        gate.evaluate_at(request("org-1", Some("free"), Some(Feature::ExportPdf)), now)
            .await
            .unwrap();

        // entitlement denial recorded, no quota decision and no usage drawn
        let recent = gate.audit_log().recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, crate::audit::DecisionKind::Entitlement);
        assert_eq!(
            gate.usage()
                .get_usage_at("org-1", crate::window::month_start(now), now)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn allowed_evaluation_audits_both_gates() {
        let (_, gate) = sqlite_gate().await;
        gate.evaluate_at(request("org-1", Some("pro"), Some(Feature::ExportPdf)), noon())
            .await
            .unwrap();

        let recent = gate.audit_log().recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|d| d.passed));
    }

    #[tokio::test]
    async fn response_serializes_to_the_wire_contract() {
        let gate = quota_gate(100, 10).await;
        let r = gate
            .evaluate_at(request("org-1", Some("pro"), None), noon())
            .await
            .unwrap();
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["allowed"], true);
        assert_eq!(json["reason"], "allowed");
        assert_eq!(json["remaining"], 99);
        assert!(json.get("resetTime").is_none());
    }
}
