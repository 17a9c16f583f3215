use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("invalid plugin name: {name}")]
    InvalidName { name: String },

    #[error("plugin not whitelisted: {name}")]
    NotWhitelisted { name: String },

    #[error("plugin already registered: {name}")]
    DuplicatePlugin { name: String },

    #[error("function name already registered: {function} (by plugin {plugin})")]
    DuplicateFunction { function: String, plugin: String },

    #[error("unknown function: {function}")]
    UnknownFunction { function: String },

    #[error("plugin not found: {name}")]
    NotFound { name: String },

    #[error("plugin {plugin} requires the paid tier")]
    PremiumRequired { plugin: String },

    #[error("plugin {plugin} is not enabled for this user")]
    NotEnabled { plugin: String },

    #[error("invalid tool arguments for {function}: {detail}")]
    InvalidToolArguments { function: String, detail: String },

    #[error("tool {function} timed out after {timeout_s}s")]
    ToolTimeout { function: String, timeout_s: u64 },

    #[error("tool {name} failed (plugin {plugin}): {message}")]
    ToolFailed {
        plugin: String,
        name: String,
        message: String,
    },

    #[error("tool call cancelled")]
    Cancelled,

    #[error("plugin load failure: {reason}")]
    LoadFailure { reason: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl PluginError {
    /// Short kind tag reflected back to the model in tool-error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            PluginError::InvalidToolArguments { .. } => "InvalidToolArguments",
            PluginError::ToolTimeout { .. } => "ToolTimeout",
            PluginError::ToolFailed { .. } => "ToolFailed",
            PluginError::UnknownFunction { .. } => "UnknownFunction",
            PluginError::PremiumRequired { .. } => "PremiumRequired",
            PluginError::NotEnabled { .. } => "NotEnabled",
            PluginError::Cancelled => "Cancelled",
            _ => "PluginError",
        }
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;
