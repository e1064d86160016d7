pub mod settings;

pub use settings::{CacheConfig, FailPolicy, GateConfig, Settings, StorageBackend, StorageConfig};
