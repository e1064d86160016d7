pub mod audit;
pub mod catalog;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod gate;
pub mod limiter;
pub mod storage;
pub mod subscription;
pub mod usage;
pub mod window;

pub use audit::{DecisionKind, GateAuditLog, GateDecision};
pub use catalog::{ExportFormat, Feature, ModuleAccess, Plan, PlanCatalog, UsageLimits};
pub use config::{FailPolicy, Settings};
pub use error::{GateError, Result};
pub use evaluator::{EntitlementEvaluator, FeatureVerdict};
pub use gate::{Gate, GateRequest, GateResponse, ReasonCode};
pub use limiter::{FAIL_OPEN_REMAINING, LimitVerdict, RateLimiter};
pub use subscription::{Subscription, SubscriptionStatus, SubscriptionStore};
pub use usage::{ReserveOutcome, UsageEvent, UsageTracker};
