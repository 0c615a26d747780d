//! Top-level error types for the constituent hub.

use crate::Provider;
use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// How a failure should be handled by callers. Mirrors the four buckets the
/// ingestion and classification paths act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Missing or expired credentials. Needs the operator to reconnect.
    Auth,
    /// Rejected input: bad signature, malformed classifier output.
    Validation,
    /// Rate limit, timeout, network blip. Eligible for retry with backoff.
    Transient,
    /// Anything else. Logged, item marked failed, siblings continue.
    Permanent,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Provider(error) => error.class(),
            Error::Validation(_) => ErrorClass::Validation,
            Error::Llm(error) => error.class(),
            Error::Sqlx(sqlx::Error::PoolTimedOut) => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Machine-readable code surfaced to API callers.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Provider(ProviderError::NotConnected { .. }) => "NOT_CONNECTED",
            Error::Provider(ProviderError::AuthExpired { .. }) => "AUTH_EXPIRED",
            Error::Pipeline(PipelineError::NotFound { .. }) => "NOT_FOUND",
            _ => match self.class() {
                ErrorClass::Auth => "AUTH_EXPIRED",
                ErrorClass::Validation => "VALIDATION",
                ErrorClass::Transient => "TRANSIENT",
                ErrorClass::Permanent => "PERMANENT",
            },
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),
}

/// Database connection and operation errors.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("failed to connect to SQLite: {0}")]
    SqliteConnect(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("stored value is invalid: {0}")]
    Corrupt(String),
}

/// Errors from the mail and telephony provider APIs.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} is not connected")]
    NotConnected { provider: Provider },

    #[error("{provider} credentials expired or revoked: {message}")]
    AuthExpired { provider: Provider, message: String },

    #[error("{provider} request failed transiently: {message}")]
    Transient {
        provider: Provider,
        message: String,
        /// Delay requested by the provider, if it sent one.
        retry_after_secs: Option<u64>,
    },

    #[error("{provider} request failed: {message}")]
    Permanent { provider: Provider, message: String },
}

impl ProviderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::NotConnected { .. } | ProviderError::AuthExpired { .. } => {
                ErrorClass::Auth
            }
            ProviderError::Transient { .. } => ErrorClass::Transient,
            ProviderError::Permanent { .. } => ErrorClass::Permanent,
        }
    }

    /// Classify an HTTP status returned by a provider API.
    pub fn from_status(provider: Provider, status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => ProviderError::AuthExpired { provider, message },
            408 | 429 | 500..=599 => ProviderError::Transient {
                provider,
                message: format!("HTTP {status}: {message}"),
                retry_after_secs: None,
            },
            _ => ProviderError::Permanent {
                provider,
                message: format!("HTTP {status}: {message}"),
            },
        }
    }

    pub fn from_reqwest(provider: Provider, error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() || error.is_request() {
            ProviderError::Transient {
                provider,
                message: error.to_string(),
                retry_after_secs: None,
            }
        } else if error.is_decode() {
            ProviderError::Permanent {
                provider,
                message: format!("unexpected response shape: {error}"),
            }
        } else {
            ProviderError::Permanent {
                provider,
                message: error.to_string(),
            }
        }
    }
}

/// Input that was rejected rather than coerced.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("webhook signature verification failed")]
    InvalidSignature,

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("classifier output is malformed: {0}")]
    MalformedClassifierOutput(String),

    #[error("strategic analysis output is malformed: {0}")]
    MalformedRollupOutput(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("OAuth state mismatch")]
    OAuthStateMismatch,

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("invalid value for {name}: {value}")]
    InvalidParameter { name: &'static str, value: String },
}

/// LLM completion errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("missing API key for LLM provider")]
    MissingApiKey,

    #[error("LLM call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("LLM request failed: {0}")]
    ProviderRequest(String),

    #[error("LLM API error ({status}): {message}")]
    Status { status: u16, message: String },

    #[error("LLM returned an empty response")]
    EmptyResponse,
}

impl LlmError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LlmError::MissingApiKey => ErrorClass::Auth,
            LlmError::Timeout { .. } | LlmError::ProviderRequest(_) | LlmError::EmptyResponse => {
                ErrorClass::Transient
            }
            LlmError::Status { status, .. } => match status {
                401 | 403 => ErrorClass::Auth,
                408 | 429 | 500..=599 => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            },
        }
    }
}

/// Classification and rollup pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("communication {id} not found")]
    NotFound { id: String },

    #[error("failed to persist analysis for {id}: {reason}")]
    PersistFailed { id: String, reason: String },

    #[error("background task failed: {0}")]
    Join(String),
}
