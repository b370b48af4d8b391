/// Request-level failures of the orchestration engine.
///
/// Validation and not-found errors are raised before any external call is made.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no backend available: {0}")]
    BackendUnavailable(String),

    #[error("backend failure: {0}")]
    BackendFailure(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Store(e.into())
    }
}

/// A secondary write that failed without aborting the turn.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PersistenceWarning {
    pub step: String,
    pub detail: String,
}

impl PersistenceWarning {
    pub fn new(step: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Self {
            step: step.into(),
            detail: detail.to_string(),
        }
    }
}
