use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::catalog::{Plan, PlanCatalog};
use crate::error::{GateError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub gate: GateConfig,
    // 省略时使用内置默认套餐目录
    #[serde(default)]
    pub plans: Option<Vec<Plan>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Postgres,
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::Sqlite
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    pub database_path: String,
    #[serde(default)]
    pub pg_url: Option<String>,
    #[serde(default)]
    pub pg_schema: Option<String>,
    #[serde(default)]
    pub pg_pool_size: Option<usize>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            database_path: "data/gate.db".to_string(),
            pg_url: None,
            pg_schema: None,
            pg_pool_size: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Seconds a usage-cache entry may serve reads before a durable refresh.
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 300 }
    }
}

// 存储不可达时的策略：open 放行（默认，保持可用性），closed 拒绝
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailPolicy {
    Open,
    Closed,
}

impl Default for FailPolicy {
    fn default() -> Self {
        Self::Open
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub fail_policy: FailPolicy,
    /// Budget for a single durable-storage read; past it the limiter applies
    /// the fail policy instead of surfacing an error.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

fn default_store_timeout_ms() -> u64 {
    1_000
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            fail_policy: FailPolicy::default(),
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        let config_path = Self::find_config_file()?;
        let config_content = std::fs::read_to_string(&config_path)?;
        let settings: Settings = toml::from_str(&config_content)
            .map_err(|e| GateError::Config(format!("{}: {}", config_path, e)))?;
        Ok(settings)
    }

    /// Build the plan catalog from the `[[plans]]` section, falling back to
    /// the built-in tiers. Catalog validation errors surface here, at boot.
    pub fn catalog(&self) -> Result<PlanCatalog> {
        match &self.plans {
            Some(plans) => PlanCatalog::new(plans.clone()),
            None => Ok(PlanCatalog::default_catalog()),
        }
    }

    fn find_config_file() -> Result<String> {
        let possible_names = ["custom-config.toml", "config.toml"];

        for name in &possible_names {
            if Path::new(name).exists() {
                return Ok(name.to_string());
            }
        }

        Err(GateError::Config(
            "Configuration file not found. Please create custom-config.toml or config.toml".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sqlite_fail_open() {
        let s = Settings::default();
        assert!(matches!(s.storage.backend, StorageBackend::Sqlite));
        assert_eq!(s.storage.database_path, "data/gate.db");
        assert_eq!(s.cache.ttl_secs, 300);
        assert_eq!(s.gate.fail_policy, FailPolicy::Open);
        assert_eq!(s.catalog().unwrap().lowest_tier().id, "free");
    }

    #[test]
    fn parses_full_toml() {
        let s: Settings = toml::from_str(
            r#"
            [storage]
            backend = "postgres"
            database_path = "data/custom.db"
            pg_url = "postgres://localhost/gate"
            pg_pool_size = 4

            [cache]
            ttl_secs = 60

            [gate]
            fail_policy = "closed"

            [[plans]]
            id = "free"
            tier_rank = 0
            features = []
            module_access = ["core"]
            [plans.limits]
            monthly_calls = 100
            hourly_calls = 10
            export_formats = ["json"]

            [[plans]]
            id = "pro"
            tier_rank = 1
            features = ["export_pdf"]
            module_access = "all"
            [plans.limits]
            monthly_calls = 1000
            hourly_calls = 100
            export_formats = ["json", "pdf"]
            "#,
        )
        .unwrap();

        assert!(matches!(s.storage.backend, StorageBackend::Postgres));
        assert_eq!(s.gate.fail_policy, FailPolicy::Closed);
        let catalog = s.catalog().unwrap();
        assert_eq!(catalog.get("pro").unwrap().limits.monthly_calls, 1000);
        assert!(catalog.get("pro").unwrap().module_access.permits("x"));
        assert!(!catalog.get("free").unwrap().module_access.permits("x"));
    }

    #[test]
    fn non_monotone_plans_fail_at_catalog_build() {
        let s: Settings = toml::from_str(
            r#"
            [[plans]]
            id = "free"
            tier_rank = 0
            features = ["export_pdf"]
            module_access = "all"
            [plans.limits]
            monthly_calls = 100
            hourly_calls = 10

            [[plans]]
            id = "pro"
            tier_rank = 1
            features = []
            module_access = "all"
            [plans.limits]
            monthly_calls = 1000
            hourly_calls = 100
            "#,
        )
        .unwrap();
        assert!(matches!(s.catalog(), Err(GateError::Config(_))));
    }
}
