use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GateError;
use crate::gate::ReasonCode;
use crate::storage::AuditStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    Entitlement,
    Quota,
}

impl DecisionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionKind::Entitlement => "entitlement",
            DecisionKind::Quota => "quota",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entitlement" => Some(DecisionKind::Entitlement),
            "quota" => Some(DecisionKind::Quota),
            _ => None,
        }
    }
}

// 每次闸门评估产生一条，放行与拒绝都入账；只追加，从不更新
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateDecision {
    pub gate_id: String,
    pub kind: DecisionKind,
    pub passed: bool,
    pub reason: ReasonCode,
    pub principal_id: String,
    pub plan_id: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl GateDecision {
    pub fn new(
        kind: DecisionKind,
        passed: bool,
        reason: ReasonCode,
        principal_id: &str,
        plan_id: &str,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            gate_id: Uuid::new_v4().to_string(),
            kind,
            passed,
            reason,
            principal_id: principal_id.to_string(),
            plan_id: plan_id.to_string(),
            timestamp: Utc::now(),
            metadata,
        }
    }
}

/// Append-only audit trail of gate decisions. Write failures are reported to
/// the operational log and never alter the gate outcome; the trail is never
/// consulted when making entitlement or quota decisions.
#[derive(Clone)]
pub struct GateAuditLog {
    store: Arc<dyn AuditStore>,
}

impl GateAuditLog {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, decision: GateDecision) {
        if let Err(e) = self.store.append_decision(&decision).await {
            tracing::error!("Failed to record gate decision {}: {}", decision.gate_id, e);
        }
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<GateDecision>, GateError> {
        self.store.recent_decisions(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemAudit {
        decisions: Mutex<Vec<GateDecision>>,
        fail: bool,
    }

    #[async_trait]
    impl AuditStore for MemAudit {
        async fn append_decision(&self, decision: &GateDecision) -> Result<(), GateError> {
            if self.fail {
                return Err(GateError::Storage("audit sink down".into()));
            }
            self.decisions.lock().unwrap().push(decision.clone());
            Ok(())
        }

        async fn recent_decisions(&self, limit: i64) -> Result<Vec<GateDecision>, GateError> {
            let guard = self.decisions.lock().unwrap();
            Ok(guard.iter().rev().take(limit as usize).cloned().collect())
        }
    }

    #[test]
    fn decision_kind_roundtrip() {
        for k in [DecisionKind::Entitlement, DecisionKind::Quota] {
            assert_eq!(DecisionKind::parse(k.as_str()), Some(k));
        }
        assert!(DecisionKind::parse("nope").is_none());
    }

    #[tokio::test]
    async fn record_appends_and_recent_reads_back() {
        let store = Arc::new(MemAudit::default());
        let audit = GateAuditLog::new(store.clone());
        audit
            .record(GateDecision::new(
                DecisionKind::Entitlement,
                false,
                ReasonCode::InsufficientPlan,
                "org-1",
                "free",
                serde_json::json!({ "feature": "export_pdf" }),
            ))
            .await;

        let recent = audit.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].principal_id, "org-1");
        assert!(!recent[0].passed);
    }

    #[tokio::test]
    async fn record_swallows_sink_failures() {
        let audit = GateAuditLog::new(Arc::new(MemAudit {
            decisions: Mutex::new(Vec::new()),
            fail: true,
        }));
        // must not panic or surface the error
        audit
            .record(GateDecision::new(
                DecisionKind::Quota,
                true,
                ReasonCode::Allowed,
                "org-1",
                "pro",
                serde_json::Value::Null,
            ))
            .await;
    }
}
