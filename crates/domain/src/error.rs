use thiserror::Error;

/// Typed outcomes surfaced by domain services. `Rejected` is the
/// business-level channel: an expected steady state of the polling protocol,
/// delivered over a success transport status so clients keep retrying.
/// `Store` is the fatal channel for genuinely unanticipated store or service
/// failures.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("{message}")]
    Rejected {
        code: &'static str,
        message: String,
    },
    #[error("store error: {0}")]
    Store(String),
}

impl DomainError {
    pub fn rejected(code: &'static str, message: impl Into<String>) -> Self {
        DomainError::Rejected {
            code,
            message: message.into(),
        }
    }
}
