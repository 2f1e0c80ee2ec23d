use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Template store error: {0}")]
    Store(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Translator error: {0}")]
    Translator(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Forbidden SQL: {0}")]
    ForbiddenSql(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CacheError {
    /// True for the outcomes that must reach the end user as "access denied".
    pub fn is_security_rejection(&self) -> bool {
        matches!(self, CacheError::AccessDenied(_) | CacheError::ForbiddenSql(_))
    }
}

impl From<rusqlite::Error> for CacheError {
    fn from(err: rusqlite::Error) -> Self {
        CacheError::Store(err.to_string())
    }
}

impl From<sqlx::Error> for CacheError {
    fn from(err: sqlx::Error) -> Self {
        CacheError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
