use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use criterion::{Criterion, criterion_group, criterion_main};

use entitlement_gate::audit::GateDecision;
use entitlement_gate::catalog::{Feature, PlanCatalog};
use entitlement_gate::config::GateConfig;
use entitlement_gate::error::GateError;
use entitlement_gate::gate::{Gate, GateRequest};
use entitlement_gate::storage::{AuditStore, UsageStore};
use entitlement_gate::subscription::{Subscription, SubscriptionStore};
use entitlement_gate::usage::UsageEvent;

// --------------------- In-memory stores for benchmarking ---------------------

#[derive(Default)]
struct MemStore {
    events: Mutex<Vec<UsageEvent>>,
    decisions: Mutex<Vec<GateDecision>>,
}

#[async_trait]
impl UsageStore for MemStore {
    async fn append_usage(&self, event: &UsageEvent) -> Result<(), GateError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn sum_usage(
        &self,
        principal_id: &str,
        since: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<u64, GateError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| {
                e.principal_id == principal_id
                    && e.timestamp >= since
                    && until.is_none_or(|u| e.timestamp < u)
            })
            .map(|e| e.weight)
            .sum())
    }
}

#[async_trait]
impl AuditStore for MemStore {
    async fn append_decision(&self, decision: &GateDecision) -> Result<(), GateError> {
        self.decisions.lock().unwrap().push(decision.clone());
        Ok(())
    }

    async fn recent_decisions(&self, limit: i64) -> Result<Vec<GateDecision>, GateError> {
        let guard = self.decisions.lock().unwrap();
        Ok(guard.iter().rev().take(limit as usize).cloned().collect())
    }
}

#[async_trait]
impl SubscriptionStore for MemStore {
    async fn get_active_subscription(
        &self,
        _principal_id: &str,
    ) -> Result<Option<Subscription>, GateError> {
        Ok(None)
    }
}

fn bench_evaluate(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let store = Arc::new(MemStore::default());
    let gate = Gate::with_stores(
        Arc::new(PlanCatalog::default_catalog()),
        store.clone(),
        store.clone(),
        store,
        300,
        GateConfig::default(),
    );

    c.bench_function("evaluate_feature_and_quota", |b| {
        b.iter(|| {
            rt.block_on(async {
                gate.evaluate(GateRequest {
                    principal_id: "org-bench".into(),
                    plan_id: Some("enterprise".into()),
                    feature: Some(Feature::ApiAccess),
                    module_id: None,
                    weight: Some(1),
                })
                .await
                .unwrap()
            })
        })
    });

    c.bench_function("evaluate_entitlement_denial", |b| {
        b.iter(|| {
            rt.block_on(async {
                gate.evaluate(GateRequest {
                    principal_id: "org-bench".into(),
                    plan_id: Some("free".into()),
                    feature: Some(Feature::ExportPdf),
                    module_id: None,
                    weight: None,
                })
                .await
                .unwrap()
            })
        })
    });
}

criterion_group!(benches, bench_evaluate);
criterion_main!(benches);
