use thiserror::Error;

#[derive(Debug, Error)]
pub enum AriaError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Secret '{key}' found in config file — secrets are environment-only")]
    SecretInConfigFile { key: String },

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Account locked until {until}")]
    AccountLocked { until: String },

    #[error("Rate limited: {limit} per {window_s}s, retry after {retry_after_s}s")]
    RateLimited {
        limit: u64,
        window_s: u64,
        retry_after_s: u64,
    },

    #[error("Server overloaded, retry later")]
    Overloaded,

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("LLM provider error: {0}")]
    LlmProvider(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AriaError {
    /// Short error code string sent to clients in WS error frames.
    pub fn code(&self) -> &'static str {
        match self {
            AriaError::Config(_) => "CONFIG_ERROR",
            AriaError::SecretInConfigFile { .. } => "CONFIG_ERROR",
            AriaError::Unauthorized(_) => "UNAUTHORIZED",
            AriaError::AccountLocked { .. } => "ACCOUNT_LOCKED",
            AriaError::RateLimited { .. } => "RATE_LIMITED",
            AriaError::Overloaded => "OVERLOADED",
            AriaError::FrameTooLarge { .. } => "FRAME_TOO_LARGE",
            AriaError::Protocol(_) => "PROTOCOL_ERROR",
            AriaError::Database(_) => "DATABASE_ERROR",
            AriaError::LlmProvider(_) => "LLM_PROVIDER_ERROR",
            AriaError::Serialization(_) => "SERIALIZATION_ERROR",
            AriaError::Io(_) => "IO_ERROR",
            AriaError::Timeout { .. } => "TIMEOUT",
            AriaError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, AriaError>;
