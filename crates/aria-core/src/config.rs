use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18900;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Hard cap per WebSocket frame.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;
/// Heartbeat ping cadence on an open WebSocket.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;
/// Connections with no traffic for this long are closed.
pub const IDLE_TIMEOUT_SECS: u64 = 120;
/// Overall per-query deadline propagated into every suspending operation.
pub const QUERY_DEADLINE_SECS: u64 = 60;

/// Config keys that must never appear in the config file. Secrets are
/// supplied via environment variables only (`ARIA_OPENAI_API_KEY`,
/// `ARIA_ANTHROPIC_API_KEY`, `ARIA_DB_ENCRYPTION_KEY`).
const FORBIDDEN_FILE_KEYS: &[&str] = &[
    "ai.api_key",
    "ai.openai_api_key",
    "ai.anthropic_api_key",
    "database.encryption_key",
];

/// Top-level config (aria.toml + ARIA_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AriaConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub rate_limiting: RateLimitConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Idle sessions expire after this many seconds (default 24 h).
    #[serde(default = "default_session_ttl")]
    pub session_ttl_s: u64,
    /// Oldest session is evicted when a user exceeds this many.
    #[serde(default = "default_max_sessions")]
    pub max_sessions_per_user: usize,
    /// After a WebSocket drops, the session stays resumable for this long
    /// before in-flight queries are cancelled.
    #[serde(default = "default_session_grace")]
    pub session_grace_s: u64,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            session_ttl_s: default_session_ttl(),
            max_sessions_per_user: default_max_sessions(),
            session_grace_s: default_session_grace(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    /// Provider id: "openai" or "anthropic".
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Per-request output token ceiling for free-tier users.
    #[serde(default = "default_max_tokens_free")]
    pub max_tokens_free: u32,
    #[serde(default = "default_max_tokens_paid")]
    pub max_tokens_paid: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_s: u64,
    /// Retry attempts on transient provider errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Outstanding-call pool size; excess callers queue briefly, then
    /// the request is rejected as overloaded.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    /// Whether free-tier users get the graceful fallback reply when the
    /// provider is unreachable.
    #[serde(default = "bool_true")]
    pub fallback_for_free_tier: bool,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            max_tokens_free: default_max_tokens_free(),
            max_tokens_paid: default_max_tokens_paid(),
            request_timeout_s: default_request_timeout(),
            max_retries: default_max_retries(),
            max_inflight: default_max_inflight(),
            fallback_for_free_tier: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Directory of plugin manifests to discover at boot. None disables
    /// external discovery; builtins register either way.
    #[serde(default)]
    pub dir: Option<String>,
    /// When non-empty, only these plugin names may register.
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default = "default_plugin_file_cap")]
    pub max_file_size_bytes: u64,
    /// Handler deadline per invocation.
    #[serde(default = "default_plugin_timeout")]
    pub timeout_s: u64,
    /// Deadline for the whole discovery pass.
    #[serde(default = "default_plugin_load_timeout")]
    pub load_timeout_s: u64,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            whitelist: Vec::new(),
            max_file_size_bytes: default_plugin_file_cap(),
            timeout_s: default_plugin_timeout(),
            load_timeout_s: default_plugin_load_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Short-term window: turns older than this move out of the tail.
    #[serde(default = "default_short_term_minutes")]
    pub short_term_minutes: i64,
    /// Short-term token ceiling — the tighter of the two bounds wins.
    #[serde(default = "default_short_term_tokens")]
    pub short_term_tokens: u32,
    /// Model context budget available for memory composition.
    #[serde(default = "default_context_budget")]
    pub context_budget_tokens: u32,
    #[serde(default = "default_reserved_reply")]
    pub reserved_reply_tokens: u32,
    /// Top-k long-term facts considered per query.
    #[serde(default = "default_fact_k")]
    pub fact_search_k: usize,
    /// Minutes east of UTC at which the mid-term day boundary rolls over.
    #[serde(default)]
    pub day_boundary_offset_min: i32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_minutes: default_short_term_minutes(),
            short_term_tokens: default_short_term_tokens(),
            context_budget_tokens: default_context_budget(),
            reserved_reply_tokens: default_reserved_reply(),
            fact_search_k: default_fact_k(),
            day_boundary_offset_min: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_free_requests")]
    pub free_requests_per_month: u64,
    #[serde(default = "default_paid_requests")]
    pub paid_requests_per_month: u64,
    /// Sliding window length in seconds (default: 30 days).
    #[serde(default = "default_window_s")]
    pub window_s: u64,
    #[serde(default = "default_free_tokens")]
    pub free_tokens_per_month: u64,
    #[serde(default = "default_paid_tokens")]
    pub paid_tokens_per_month: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            free_requests_per_month: default_free_requests(),
            paid_requests_per_month: default_paid_requests(),
            window_s: default_window_s(),
            free_tokens_per_month: default_free_tokens(),
            paid_tokens_per_month: default_paid_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Hard cap on tool-loop iterations.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Per-step concurrent tool execution cap.
    #[serde(default = "default_fanout")]
    pub fanout: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            fanout: default_fanout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_session_ttl() -> u64 {
    24 * 60 * 60
}
fn default_max_sessions() -> usize {
    5
}
fn default_session_grace() -> u64 {
    60
}
fn default_provider() -> String {
    "openai".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_tokens_free() -> u32 {
    150
}
fn default_max_tokens_paid() -> u32 {
    4096
}
fn default_request_timeout() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_max_inflight() -> usize {
    64
}
fn default_plugin_file_cap() -> u64 {
    1024 * 1024
}
fn default_plugin_timeout() -> u64 {
    3
}
fn default_plugin_load_timeout() -> u64 {
    10
}
fn default_short_term_minutes() -> i64 {
    20
}
fn default_short_term_tokens() -> u32 {
    4000
}
fn default_context_budget() -> u32 {
    8192
}
fn default_reserved_reply() -> u32 {
    1024
}
fn default_fact_k() -> usize {
    5
}
fn default_free_requests() -> u64 {
    500
}
fn default_paid_requests() -> u64 {
    50_000
}
fn default_window_s() -> u64 {
    30 * 24 * 60 * 60
}
fn default_free_tokens() -> u64 {
    100_000
}
fn default_paid_tokens() -> u64 {
    10_000_000
}
fn default_max_depth() -> usize {
    5
}
fn default_fanout() -> usize {
    4
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.aria/aria.db", home)
}
fn default_log_level() -> String {
    "info".to_string()
}

impl AriaConfig {
    /// Load config from a TOML file with ARIA_* env var overrides.
    ///
    /// Env keys use double underscore as the section separator, e.g.
    /// `ARIA_SERVER__PORT=8080` overrides `server.port`.
    ///
    /// Fails with `SecretInConfigFile` when an API key or encryption key is
    /// found in the file — those come from the environment only.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        reject_file_secrets(&path)?;

        let config: AriaConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("ARIA_").split("__"))
            .extract()
            .map_err(|e| crate::error::AriaError::Config(e.to_string()))?;

        Ok(config)
    }
}

/// Scan the raw file for forbidden secret keys before deserializing.
fn reject_file_secrets(path: &str) -> crate::error::Result<()> {
    let figment = Figment::new().merge(Toml::file(path));
    for key in FORBIDDEN_FILE_KEYS {
        if figment.find_value(key).is_ok() {
            return Err(crate::error::AriaError::SecretInConfigFile {
                key: key.to_string(),
            });
        }
    }
    Ok(())
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.aria/aria.toml", home)
}
