pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::audit::GateDecision;
use crate::error::GateError;
use crate::usage::UsageEvent;

// 用量事件存储抽象（SQLite、Postgres 均有实现）；只追加，无更新/删除路径
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn append_usage(&self, event: &UsageEvent) -> Result<(), GateError>;
    /// Sum of event weights with `since <= timestamp` (and `timestamp < until`
    /// when an upper bound is given, for closed historical windows).
    async fn sum_usage(
        &self,
        principal_id: &str,
        since: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<u64, GateError>;
}

// 审计决策存储抽象；同样只追加
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_decision(&self, decision: &GateDecision) -> Result<(), GateError>;
    async fn recent_decisions(&self, limit: i64) -> Result<Vec<GateDecision>, GateError>;
}

pub use postgres::PgStore;
pub use sqlite::SqliteStore;
