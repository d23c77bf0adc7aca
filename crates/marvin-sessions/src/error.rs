use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid session key: {0}")]
    InvalidKey(String),

    #[error("Invalid role: {0}")]
    InvalidRole(String),

    #[error("Invalid plan status: {0}")]
    InvalidPlanStatus(String),

    #[error("Session not found: {key}")]
    NotFound { key: String },

    #[error("Plan not found: {id}")]
    PlanNotFound { id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
