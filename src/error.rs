use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("unsupported interval label: {label:?}")]
    UnsupportedInterval { label: String },
    #[error("invalid interval: {minutes} minutes")]
    InvalidInterval { minutes: u32 },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl EvaluatorError {
    pub fn code(&self) -> &'static str {
        match self {
            EvaluatorError::UnsupportedInterval { .. } => "unsupported_interval",
            EvaluatorError::InvalidInterval { .. } => "invalid_interval",
            EvaluatorError::Store(_) => "store_error",
        }
    }

    /// Configuration errors are rejected immediately; retrying cannot help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EvaluatorError::Store(_))
    }
}

pub type EvaluatorResult<T> = Result<T, EvaluatorError>;
