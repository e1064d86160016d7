use std::cmp::Ordering;
use std::sync::Arc;

use crate::audit::{DecisionKind, GateAuditLog, GateDecision};
use crate::catalog::{Feature, PlanCatalog};
use crate::gate::ReasonCode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureVerdict {
    pub allowed: bool,
    pub reason: ReasonCode,
    pub current_plan: String,
    pub required_plan: Option<String>,
}

/// Static entitlement checks against the plan catalog. Unknown plan ids are
/// never an error at this layer: the caller presented a plan we do not know,
/// so the verdict degrades to a denial flagged `Misconfigured` for operators.
pub struct EntitlementEvaluator {
    catalog: Arc<PlanCatalog>,
    audit: GateAuditLog,
}

impl EntitlementEvaluator {
    pub fn new(catalog: Arc<PlanCatalog>, audit: GateAuditLog) -> Self {
        Self { catalog, audit }
    }

    pub async fn check_feature(
        &self,
        principal_id: &str,
        plan_id: &str,
        feature: Feature,
    ) -> FeatureVerdict {
        let required_plan = self
            .catalog
            .required_plan(feature)
            .map(|p| p.id.clone());

        let verdict = match self.catalog.get(plan_id) {
            None => {
                tracing::warn!(
                    "entitlement check against unknown plan '{}' (feature {})",
                    plan_id,
                    feature.as_str()
                );
                FeatureVerdict {
                    allowed: false,
                    reason: ReasonCode::Misconfigured,
                    current_plan: plan_id.to_string(),
                    required_plan,
                }
            }
            Some(current) => match self.catalog.required_plan(feature) {
                // 没有任何档位开放该特性：按套餐不足拒绝
                None => FeatureVerdict {
                    allowed: false,
                    reason: ReasonCode::InsufficientPlan,
                    current_plan: current.id.clone(),
                    required_plan: None,
                },
                Some(required) => {
                    let allowed =
                        self.catalog.compare_tier(current, required) != Ordering::Less;
                    FeatureVerdict {
                        allowed,
                        reason: if allowed {
                            ReasonCode::Allowed
                        } else {
                            ReasonCode::InsufficientPlan
                        },
                        current_plan: current.id.clone(),
                        required_plan,
                    }
                }
            },
        };

        self.audit
            .record(GateDecision::new(
                DecisionKind::Entitlement,
                verdict.allowed,
                verdict.reason,
                principal_id,
                plan_id,
                serde_json::json!({ "feature": feature.as_str() }),
            ))
            .await;

        verdict
    }

    pub async fn can_access_module(
        &self,
        principal_id: &str,
        plan_id: &str,
        module_id: &str,
    ) -> bool {
        let (allowed, reason) = match self.catalog.get(plan_id) {
            None => {
                tracing::warn!(
                    "module check against unknown plan '{}' (module {})",
                    plan_id,
                    module_id
                );
                (false, ReasonCode::Misconfigured)
            }
            Some(plan) => {
                let allowed = plan.module_access.permits(module_id);
                (
                    allowed,
                    if allowed {
                        ReasonCode::Allowed
                    } else {
                        ReasonCode::InsufficientPlan
                    },
                )
            }
        };

        self.audit
            .record(GateDecision::new(
                DecisionKind::Entitlement,
                allowed,
                reason,
                principal_id,
                plan_id,
                serde_json::json!({ "module": module_id }),
            ))
            .await;

        allowed
    }
}
