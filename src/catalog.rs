use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{GateError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    ApiAccess,
    ExportPdf,
    ExportCsv,
    AdvancedAnalytics,
    CustomBranding,
    PrioritySupport,
}

impl Feature {
    pub fn as_str(self) -> &'static str {
        match self {
            Feature::ApiAccess => "api_access",
            Feature::ExportPdf => "export_pdf",
            Feature::ExportCsv => "export_csv",
            Feature::AdvancedAnalytics => "advanced_analytics",
            Feature::CustomBranding => "custom_branding",
            Feature::PrioritySupport => "priority_support",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "api_access" => Some(Feature::ApiAccess),
            "export_pdf" => Some(Feature::ExportPdf),
            "export_csv" => Some(Feature::ExportCsv),
            "advanced_analytics" => Some(Feature::AdvancedAnalytics),
            "custom_branding" => Some(Feature::CustomBranding),
            "priority_support" => Some(Feature::PrioritySupport),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
    Pdf,
    Xlsx,
}

// 模块白名单："all" 表示全量开放，否则逐个列出模块 id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModuleAccess {
    All(AllTag),
    Allowlist(HashSet<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllTag {
    All,
}

impl ModuleAccess {
    pub fn all() -> Self {
        ModuleAccess::All(AllTag::All)
    }

    pub fn permits(&self, module_id: &str) -> bool {
        match self {
            ModuleAccess::All(_) => true,
            ModuleAccess::Allowlist(set) => set.contains(module_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLimits {
    pub monthly_calls: u64,
    pub hourly_calls: u64,
    #[serde(default)]
    pub export_formats: HashSet<ExportFormat>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub tier_rank: u32,
    #[serde(default)]
    pub features: HashSet<Feature>,
    pub module_access: ModuleAccess,
    pub limits: UsageLimits,
}

impl Plan {
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }
}

/// 套餐目录：发布后不可变，按 tier_rank 形成全序
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    by_id: BTreeMap<String, Plan>,
    // plan ids ordered by ascending tier_rank
    by_rank: Vec<String>,
}

impl PlanCatalog {
    /// Build a catalog and validate it. A catalog whose feature sets are not
    /// monotone across tiers, or whose ids/ranks collide, is a configuration
    /// error the evaluator must never mask at runtime.
    pub fn new(plans: Vec<Plan>) -> Result<Self> {
        if plans.is_empty() {
            return Err(GateError::Config("plan catalog is empty".into()));
        }

        let mut by_id = BTreeMap::new();
        let mut ranked: Vec<(u32, String)> = Vec::with_capacity(plans.len());
        for plan in plans {
            if plan.id.trim().is_empty() {
                return Err(GateError::Config("plan id cannot be empty".into()));
            }
            let id = plan.id.clone();
            ranked.push((plan.tier_rank, id.clone()));
            if by_id.insert(id.clone(), plan).is_some() {
                return Err(GateError::Config(format!("duplicate plan id: {}", id)));
            }
        }

        ranked.sort();
        for pair in ranked.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(GateError::Config(format!(
                    "plans '{}' and '{}' share tier_rank {}",
                    pair[0].1, pair[1].1, pair[0].0
                )));
            }
        }

        let by_rank: Vec<String> = ranked.into_iter().map(|(_, id)| id).collect();

        // 单调性：低档位开启的特性必须在所有更高档位同样开启
        for pair in by_rank.windows(2) {
            let lower = &by_id[&pair[0]];
            let higher = &by_id[&pair[1]];
            for feature in &lower.features {
                if !higher.features.contains(feature) {
                    return Err(GateError::Config(format!(
                        "feature '{}' enabled in '{}' but missing in higher tier '{}'",
                        feature.as_str(),
                        lower.id,
                        higher.id
                    )));
                }
            }
        }

        Ok(Self { by_id, by_rank })
    }

    pub fn get(&self, plan_id: &str) -> Option<&Plan> {
        self.by_id.get(plan_id)
    }

    pub fn compare_tier(&self, a: &Plan, b: &Plan) -> Ordering {
        a.tier_rank.cmp(&b.tier_rank)
    }

    // 无有效订阅的主体一律按最低档位评估
    pub fn lowest_tier(&self) -> &Plan {
        &self.by_id[&self.by_rank[0]]
    }

    /// Lowest-ranked plan that grants the feature, if any tier does.
    pub fn required_plan(&self, feature: Feature) -> Option<&Plan> {
        self.by_rank
            .iter()
            .map(|id| &self.by_id[id])
            .find(|p| p.has_feature(feature))
    }

    pub fn plans(&self) -> impl Iterator<Item = &Plan> {
        self.by_rank.iter().map(|id| &self.by_id[id])
    }

    /// Built-in default tiers, used when no `[plans]` section is configured.
    pub fn default_catalog() -> Self {
        let plans = vec![
            Plan {
                id: "free".into(),
                tier_rank: 0,
                features: HashSet::new(),
                module_access: ModuleAccess::Allowlist(
                    ["core".to_string()].into_iter().collect(),
                ),
                limits: UsageLimits {
                    monthly_calls: 1_000,
                    hourly_calls: 50,
                    export_formats: [ExportFormat::Json].into_iter().collect(),
                },
            },
            Plan {
                id: "starter".into(),
                tier_rank: 1,
                features: [Feature::ExportCsv].into_iter().collect(),
                module_access: ModuleAccess::Allowlist(
                    ["core".to_string(), "reports".to_string()]
                        .into_iter()
                        .collect(),
                ),
                limits: UsageLimits {
                    monthly_calls: 10_000,
                    hourly_calls: 500,
                    export_formats: [ExportFormat::Json, ExportFormat::Csv]
                        .into_iter()
                        .collect(),
                },
            },
            Plan {
                id: "pro".into(),
                tier_rank: 2,
                features: [
                    Feature::ExportCsv,
                    Feature::ExportPdf,
                    Feature::ApiAccess,
                    Feature::AdvancedAnalytics,
                ]
                .into_iter()
                .collect(),
                module_access: ModuleAccess::all(),
                limits: UsageLimits {
                    monthly_calls: 100_000,
                    hourly_calls: 5_000,
                    export_formats: [
                        ExportFormat::Json,
                        ExportFormat::Csv,
                        ExportFormat::Pdf,
                        ExportFormat::Xlsx,
                    ]
                    .into_iter()
                    .collect(),
                },
            },
            Plan {
                id: "enterprise".into(),
                tier_rank: 3,
                features: [
                    Feature::ExportCsv,
                    Feature::ExportPdf,
                    Feature::ApiAccess,
                    Feature::AdvancedAnalytics,
                    Feature::CustomBranding,
                    Feature::PrioritySupport,
                ]
                .into_iter()
                .collect(),
                module_access: ModuleAccess::all(),
                limits: UsageLimits {
                    monthly_calls: 1_000_000,
                    hourly_calls: 50_000,
                    export_formats: [
                        ExportFormat::Json,
                        ExportFormat::Csv,
                        ExportFormat::Pdf,
                        ExportFormat::Xlsx,
                    ]
                    .into_iter()
                    .collect(),
                },
            },
        ];
        Self::new(plans).expect("built-in default catalog is valid")
    }
}
