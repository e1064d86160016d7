use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, NoTls};

use crate::audit::{DecisionKind, GateDecision};
use crate::error::GateError;
use crate::gate::ReasonCode;
use crate::storage::{AuditStore, UsageStore};
use crate::subscription::{Subscription, SubscriptionStatus, SubscriptionStore};
use crate::usage::UsageEvent;

fn pg_err<E: std::fmt::Display>(e: E) -> GateError {
    GateError::Storage(format!("{}", e))
}

pub struct PgPool {
    clients: Vec<Arc<Client>>,
    next: AtomicUsize,
}

impl PgPool {
    async fn connect_many(
        pg_url: &str,
        schema: &Option<String>,
        size: usize,
    ) -> Result<Self, GateError> {
        let mut clients = Vec::with_capacity(size.max(1));
        for _ in 0..size.max(1) {
            let (client, connection) = tokio_postgres::connect(pg_url, NoTls)
                .await
                .map_err(|e| GateError::Config(format!("Failed to connect postgres: {}", e)))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!("postgres connection error: {}", e);
                }
            });
            if let Some(s) = schema {
                client
                    .execute(&format!("SET search_path TO {}", s), &[])
                    .await
                    .map_err(|e| {
                        GateError::Config(format!("Failed to set search_path: {}", e))
                    })?;
            }
            clients.push(Arc::new(client));
        }
        Ok(Self {
            clients,
            next: AtomicUsize::new(0),
        })
    }

    pub fn pick(&self) -> Arc<Client> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        Arc::clone(&self.clients[idx])
    }
}

pub struct PgStore {
    pub pool: PgPool,
}

impl PgStore {
    pub async fn connect(
        pg_url: &str,
        schema: &Option<String>,
        pool_size: usize,
    ) -> Result<Self, GateError> {
        let pool = PgPool::connect_many(pg_url, schema, pool_size).await?;
        let store = Self { pool };
        store.create_tables().await?;
        tracing::info!("Using PostgreSQL for usage events and gate decisions");
        Ok(store)
    }

    async fn create_tables(&self) -> Result<(), GateError> {
        let client = self.pool.pick();
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS usage_events (
                    id BIGSERIAL PRIMARY KEY,
                    principal_id TEXT NOT NULL,
                    event_timestamp TIMESTAMPTZ NOT NULL,
                    weight BIGINT NOT NULL,
                    endpoint TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_usage_events_principal_ts
                    ON usage_events (principal_id, event_timestamp);
                CREATE TABLE IF NOT EXISTS gate_decisions (
                    gate_id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL,
                    passed BOOLEAN NOT NULL,
                    reason TEXT NOT NULL,
                    principal_id TEXT NOT NULL,
                    plan_id TEXT NOT NULL,
                    timestamp TIMESTAMPTZ NOT NULL,
                    metadata TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS subscriptions (
                    principal_id TEXT PRIMARY KEY,
                    plan_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    period_start TIMESTAMPTZ NOT NULL,
                    period_end TIMESTAMPTZ NOT NULL
                );",
            )
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    // 写入口供计费协作方使用；核心侧只经由 SubscriptionStore 读取
    pub async fn upsert_subscription(&self, sub: &Subscription) -> Result<(), GateError> {
        let client = self.pool.pick();
        client
            .execute(
                "INSERT INTO subscriptions (principal_id, plan_id, status, period_start, period_end)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (principal_id) DO UPDATE SET
                    plan_id = EXCLUDED.plan_id,
                    status = EXCLUDED.status,
                    period_start = EXCLUDED.period_start,
                    period_end = EXCLUDED.period_end",
                &[
                    &sub.principal_id,
                    &sub.plan_id,
                    &sub.status.as_str(),
                    &sub.period_start,
                    &sub.period_end,
                ],
            )
            .await
            .map_err(pg_err)?;
        Ok(())
    }
}

#[async_trait]
impl UsageStore for PgStore {
    async fn append_usage(&self, event: &UsageEvent) -> Result<(), GateError> {
        let client = self.pool.pick();
        client
            .execute(
                "INSERT INTO usage_events (principal_id, event_timestamp, weight, endpoint)
                 VALUES ($1, $2, $3, $4)",
                &[
                    &event.principal_id,
                    &event.timestamp,
                    &(event.weight as i64),
                    &event.endpoint,
                ],
            )
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    async fn sum_usage(
        &self,
        principal_id: &str,
        since: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<u64, GateError> {
        let client = self.pool.pick();
        let row = match until {
            Some(until) => client
                .query_one(
                    "SELECT COALESCE(SUM(weight), 0)::BIGINT FROM usage_events
                     WHERE principal_id = $1
                       AND event_timestamp >= $2 AND event_timestamp < $3",
                    &[&principal_id, &since, &until],
                )
                .await
                .map_err(pg_err)?,
            None => client
                .query_one(
                    "SELECT COALESCE(SUM(weight), 0)::BIGINT FROM usage_events
                     WHERE principal_id = $1 AND event_timestamp >= $2",
                    &[&principal_id, &since],
                )
                .await
                .map_err(pg_err)?,
        };
        let sum: i64 = row.get(0);
        Ok(sum.max(0) as u64)
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn append_decision(&self, decision: &GateDecision) -> Result<(), GateError> {
        let metadata = serde_json::to_string(&decision.metadata)?;
        let client = self.pool.pick();
        client
            .execute(
                "INSERT INTO gate_decisions (
                    gate_id, kind, passed, reason, principal_id, plan_id, timestamp, metadata
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &decision.gate_id,
                    &decision.kind.as_str(),
                    &decision.passed,
                    &decision.reason.as_str(),
                    &decision.principal_id,
                    &decision.plan_id,
                    &decision.timestamp,
                    &metadata,
                ],
            )
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    async fn recent_decisions(&self, limit: i64) -> Result<Vec<GateDecision>, GateError> {
        let client = self.pool.pick();
        let rows = client
            .query(
                "SELECT gate_id, kind, passed, reason, principal_id, plan_id, timestamp, metadata
                 FROM gate_decisions
                 ORDER BY timestamp DESC
                 LIMIT $1",
                &[&limit],
            )
            .await
            .map_err(pg_err)?;

        let mut decisions = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.get(1);
            let reason: String = row.get(3);
            let metadata: String = row.get(7);
            decisions.push(GateDecision {
                gate_id: row.get(0),
                kind: DecisionKind::parse(&kind).unwrap_or(DecisionKind::Entitlement),
                passed: row.get(2),
                reason: ReasonCode::parse(&reason).unwrap_or(ReasonCode::Misconfigured),
                principal_id: row.get(4),
                plan_id: row.get(5),
                timestamp: row.get(6),
                metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
            });
        }
        Ok(decisions)
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn get_active_subscription(
        &self,
        principal_id: &str,
    ) -> Result<Option<Subscription>, GateError> {
        let client = self.pool.pick();
        let row_opt = client
            .query_opt(
                "SELECT principal_id, plan_id, status, period_start, period_end
                 FROM subscriptions WHERE principal_id = $1",
                &[&principal_id],
            )
            .await
            .map_err(pg_err)?;

        let Some(row) = row_opt else {
            return Ok(None);
        };

        let status_raw: String = row.get(2);
        let Some(status) = SubscriptionStatus::parse(&status_raw) else {
            return Err(GateError::Config(format!(
                "unknown subscription status '{}' for principal {}",
                status_raw, principal_id
            )));
        };
        if !status.is_evaluable() {
            return Ok(None);
        }

        Ok(Some(Subscription {
            principal_id: row.get(0),
            plan_id: row.get(1),
            status,
            period_start: row.get(3),
            period_end: row.get(4),
        }))
    }
}
