use thiserror::Error;

/// Errors raised by an exchange adapter
#[derive(Error, Debug, Clone)]
pub enum ExchangeError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Exchange API error {code}: {msg}")]
    Api { code: i64, msg: String },

    #[error("Authentication rejected ({code}): {msg}")]
    Auth { code: i64, msg: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Circuit breaker '{name}' open, retry in {retry_after_ms}ms")]
    CircuitOpen { name: String, retry_after_ms: u64 },

    #[error("Exchange credentials degraded; authenticated calls suspended")]
    CredentialsDegraded,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ExchangeError {
    /// Failures that say something about the exchange's health rather than
    /// about the request itself. Only these should trip a breaker.
    pub fn is_transient(&self) -> bool {
        match self {
            ExchangeError::Network(_) => true,
            ExchangeError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ExchangeError::Auth { .. })
    }
}

/// Errors raised by the persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown {kind}: '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

impl From<ParseEnumError> for StoreError {
    fn from(e: ParseEnumError) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;
pub type StoreResult<T> = Result<T, StoreError>;
