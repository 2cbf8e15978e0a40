//! Crate-level error taxonomy.

use thiserror::Error;

/// The agent error catalogue detected from claude CLI output (§4.B / §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentErrorCode {
    CreditExhausted,
    RateLimited,
    AuthFailed,
    CliNotFound,
    ModelUnavailable,
    ContextExceeded,
    NetworkError,
    PermissionDenied,
    Unknown,
}

impl std::fmt::Display for AgentErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentErrorCode::CreditExhausted => "CREDIT_EXHAUSTED",
            AgentErrorCode::RateLimited => "RATE_LIMITED",
            AgentErrorCode::AuthFailed => "AUTH_FAILED",
            AgentErrorCode::CliNotFound => "CLI_NOT_FOUND",
            AgentErrorCode::ModelUnavailable => "MODEL_UNAVAILABLE",
            AgentErrorCode::ContextExceeded => "CONTEXT_EXCEEDED",
            AgentErrorCode::NetworkError => "NETWORK_ERROR",
            AgentErrorCode::PermissionDenied => "PERMISSION_DENIED",
            AgentErrorCode::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Structured detail attached to an `AgentError` (§4.B, §7).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AgentErrorDetail {
    pub code: AgentErrorCode,
    pub message: String,
    pub recoverable: bool,
    pub suggestion: Option<String>,
    pub retry_after_ms: Option<u64>,
}

/// Crate-level error type. Every fallible operation returns `Result<T, Error>`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("agent error: {detail:?}")]
    Agent { detail: AgentErrorDetail },

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("aborted: {0}")]
    Abort(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("command error: {0}")]
    Command(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Error::Validation(msg.into())
    }

    pub fn git<S: Into<String>>(msg: S) -> Self {
        Error::Git(msg.into())
    }

    pub fn agent(detail: AgentErrorDetail) -> Self {
        Error::Agent { detail }
    }
}
