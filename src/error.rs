use thiserror::Error;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Time parse error: {0}")]
    TimeParse(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl GateError {
    // 存储不可达类错误走限流器的降级路径，其余照常上抛
    pub fn is_store_unavailable(&self) -> bool {
        matches!(
            self,
            GateError::Db(_) | GateError::Storage(_) | GateError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GateError>;
