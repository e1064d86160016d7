use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::audit::{DecisionKind, GateDecision};
use crate::error::GateError;
use crate::gate::ReasonCode;
use crate::storage::{AuditStore, UsageStore};
use crate::subscription::{Subscription, SubscriptionStatus, SubscriptionStore};
use crate::usage::UsageEvent;

// 统一使用微秒精度的 RFC3339（Z 后缀），保证字符串比较与时间序一致
fn ts_str(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Clone)]
pub struct SqliteStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub async fn new(database_path: &str) -> rusqlite::Result<Self> {
        // 确保数据库文件的目录存在
        if let Some(parent) = std::path::Path::new(database_path).parent() {
            if !parent.exists() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return Err(rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                        Some(format!("Failed to create directory: {}", e)),
                    ));
                }
                tracing::info!("Created database directory: {}", parent.display());
            }
        }

        let conn = Connection::open(database_path)?;
        tracing::info!("Gate database initialized at: {}", database_path);
        Self::create_tables(&conn)?;

        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn new_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::create_tables(&conn)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS usage_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                principal_id TEXT NOT NULL,
                event_timestamp TEXT NOT NULL,
                weight INTEGER NOT NULL,
                endpoint TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_usage_events_principal_ts
             ON usage_events (principal_id, event_timestamp)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS gate_decisions (
                gate_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                passed INTEGER NOT NULL,
                reason TEXT NOT NULL,
                principal_id TEXT NOT NULL,
                plan_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                metadata TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS subscriptions (
                principal_id TEXT PRIMARY KEY,
                plan_id TEXT NOT NULL,
                status TEXT NOT NULL,
                period_start TEXT NOT NULL,
                period_end TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    // 订阅行由计费 webhook 协作方写入；核心侧只读，此入口供协作方与测试使用
    pub async fn upsert_subscription(&self, sub: &Subscription) -> rusqlite::Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO subscriptions (principal_id, plan_id, status, period_start, period_end)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (principal_id) DO UPDATE SET
                plan_id = excluded.plan_id,
                status = excluded.status,
                period_start = excluded.period_start,
                period_end = excluded.period_end",
            (
                &sub.principal_id,
                &sub.plan_id,
                sub.status.as_str(),
                ts_str(&sub.period_start),
                ts_str(&sub.period_end),
            ),
        )?;
        Ok(())
    }
}

#[async_trait]
impl UsageStore for SqliteStore {
    async fn append_usage(&self, event: &UsageEvent) -> Result<(), GateError> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO usage_events (principal_id, event_timestamp, weight, endpoint)
             VALUES (?1, ?2, ?3, ?4)",
            (
                &event.principal_id,
                ts_str(&event.timestamp),
                event.weight as i64,
                &event.endpoint,
            ),
        )?;
        Ok(())
    }

    async fn sum_usage(
        &self,
        principal_id: &str,
        since: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<u64, GateError> {
        let conn = self.connection.lock().await;
        let sum: i64 = match until {
            Some(until) => conn
                .query_row(
                    "SELECT COALESCE(SUM(weight), 0) FROM usage_events
                     WHERE principal_id = ?1
                       AND event_timestamp >= ?2 AND event_timestamp < ?3",
                    (principal_id, ts_str(&since), ts_str(&until)),
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0),
            None => conn
                .query_row(
                    "SELECT COALESCE(SUM(weight), 0) FROM usage_events
                     WHERE principal_id = ?1 AND event_timestamp >= ?2",
                    (principal_id, ts_str(&since)),
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0),
        };
        Ok(sum.max(0) as u64)
    }
}

#[async_trait]
impl AuditStore for SqliteStore {
    async fn append_decision(&self, decision: &GateDecision) -> Result<(), GateError> {
        let metadata = serde_json::to_string(&decision.metadata)?;
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO gate_decisions (
                gate_id, kind, passed, reason, principal_id, plan_id, timestamp, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            (
                &decision.gate_id,
                decision.kind.as_str(),
                decision.passed as i64,
                decision.reason.as_str(),
                &decision.principal_id,
                &decision.plan_id,
                ts_str(&decision.timestamp),
                metadata,
            ),
        )?;
        Ok(())
    }

    async fn recent_decisions(&self, limit: i64) -> Result<Vec<GateDecision>, GateError> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT gate_id, kind, passed, reason, principal_id, plan_id, timestamp, metadata
             FROM gate_decisions
             ORDER BY timestamp DESC
             LIMIT ?1",
        )?;

        let decision_iter = stmt.query_map([limit], |row| {
            Ok(GateDecision {
                gate_id: row.get(0)?,
                kind: DecisionKind::parse(&row.get::<_, String>(1)?)
                    .unwrap_or(DecisionKind::Entitlement),
                passed: row.get::<_, i64>(2)? != 0,
                reason: ReasonCode::parse(&row.get::<_, String>(3)?)
                    .unwrap_or(ReasonCode::Misconfigured),
                principal_id: row.get(4)?,
                plan_id: row.get(5)?,
                timestamp: DateTime::parse_from_rfc3339(&row.get::<_, String>(6)?)
                    .unwrap()
                    .with_timezone(&Utc),
                metadata: serde_json::from_str(&row.get::<_, String>(7)?)
                    .unwrap_or(serde_json::Value::Null),
            })
        })?;

        let mut decisions = Vec::new();
        for decision in decision_iter {
            decisions.push(decision?);
        }

        Ok(decisions)
    }
}

#[async_trait]
impl SubscriptionStore for SqliteStore {
    async fn get_active_subscription(
        &self,
        principal_id: &str,
    ) -> Result<Option<Subscription>, GateError> {
        let conn = self.connection.lock().await;
        let row = conn
            .query_row(
                "SELECT principal_id, plan_id, status, period_start, period_end
                 FROM subscriptions WHERE principal_id = ?1",
                [principal_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((principal_id, plan_id, status, period_start, period_end)) = row else {
            return Ok(None);
        };

        let Some(status) = SubscriptionStatus::parse(&status) else {
            return Err(GateError::Config(format!(
                "unknown subscription status '{}' for principal {}",
                status, principal_id
            )));
        };

        // 历史记录（已取消/逾期）保留在表中但不参与评估
        if !status.is_evaluable() {
            return Ok(None);
        }

        Ok(Some(Subscription {
            principal_id,
            plan_id,
            status,
            period_start: crate::window::parse_rfc3339_utc(&period_start)?,
            period_end: crate::window::parse_rfc3339_utc(&period_end)?,
        }))
    }
}
