use std::fmt;

/// Structured error shared by every layer, including the AI crate and the
/// CLI. Codes are stable machine-readable families (`DB_*`, `INGEST_*`,
/// `AI_*`, ...); free-form context goes in `details`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppError {
    pub code: String,
    pub message: String,
    /// Optional context for operators (offending value, row, upstream error).
    pub details: Option<String>,
    /// Transient failures worth retrying: unreachable local endpoints, a
    /// busy database. Callers that loop check this before giving up.
    pub retryable: bool,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: false,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}
