use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{get, post},
    Router,
};
use dashmap::DashMap;
use rusqlite::Connection;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use aria_agent::orchestrator::{Orchestrator, OrchestratorSettings};
use aria_agent::provider::ChatProvider;
use aria_agent::LlmGateway;
use aria_core::config::AriaConfig;
use aria_limits::RateLimiter;
use aria_memory::MemoryStore;
use aria_plugins::PluginRegistry;
use aria_sessions::SessionManager;
use aria_users::UserStore;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: AriaConfig,
    pub started_at: Instant,
    pub users: UserStore,
    pub sessions: SessionManager,
    pub memory: Arc<MemoryStore>,
    pub plugins: Arc<PluginRegistry>,
    pub limits: Arc<RateLimiter>,
    pub orchestrator: Orchestrator,
    /// Active WS connections: conn_id → outbound frame sender.
    pub ws_clients: DashMap<String, mpsc::Sender<String>>,
    /// Cancellation root per session id; child tokens cover individual
    /// queries so a disconnect (after the grace window) aborts them all.
    pub session_tasks: DashMap<String, CancellationToken>,
    /// Sessions currently attached to a live WebSocket.
    pub ws_attached: DashMap<String, String>,
    /// Set when the last provider call fell back; drives /health "degraded".
    pub provider_degraded: AtomicBool,
    /// Dedicated connection for rate-counter snapshots.
    limits_conn: std::sync::Mutex<Connection>,
}

impl AppState {
    /// Open storage, run schema init, wire every subsystem.
    ///
    /// Each store gets its own connection to the same database file (WAL
    /// mode) — the same layout the schema expects regardless of process
    /// count per store.
    pub fn build(config: AriaConfig) -> anyhow::Result<Self> {
        let users_conn = open_db(&config.database.path)?;
        aria_users::db::init_db(&users_conn)?;
        let users = UserStore::new(users_conn);

        let sessions_conn = open_db(&config.database.path)?;
        aria_sessions::db::init_db(&sessions_conn)?;
        let sessions = SessionManager::new(
            sessions_conn,
            config.security.session_ttl_s,
            config.security.max_sessions_per_user,
        );

        let memory_conn = open_db(&config.database.path)?;
        aria_memory::db::init_db(&memory_conn)?;
        let memory = Arc::new(MemoryStore::new(memory_conn, config.memory.clone()));

        let plugins_conn = open_db(&config.database.path)?;
        aria_plugins::enablement::EnablementStore::init_db(&plugins_conn)?;
        let plugins = Arc::new(PluginRegistry::new(config.plugins.clone(), plugins_conn));
        register_builtins(&plugins, &memory, &config);

        let limits_conn = open_db(&config.database.path)?;
        RateLimiter::init_db(&limits_conn)?;
        let limits = Arc::new(RateLimiter::new(config.rate_limiting.clone()));
        limits.load(&limits_conn);

        let provider = build_provider(&config)?;
        let gateway = LlmGateway::new(provider, config.ai.clone());
        let orchestrator = Orchestrator::new(
            gateway,
            plugins.clone(),
            memory.clone(),
            limits.clone(),
            OrchestratorSettings {
                memory: config.memory.clone(),
                dispatcher: config.dispatcher.clone(),
                fallback_for_free_tier: config.ai.fallback_for_free_tier,
            },
        );

        Ok(Self {
            config,
            started_at: Instant::now(),
            users,
            sessions,
            memory,
            plugins,
            limits,
            orchestrator,
            ws_clients: DashMap::new(),
            session_tasks: DashMap::new(),
            ws_attached: DashMap::new(),
            provider_degraded: AtomicBool::new(false),
            limits_conn: std::sync::Mutex::new(limits_conn),
        })
    }

    /// Cancellation root for a session, created on first use.
    pub fn session_token(&self, session_id: &str) -> CancellationToken {
        self.session_tasks
            .entry(session_id.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Cancel every in-flight query for a session and drop its root.
    pub fn cancel_session_tasks(&self, session_id: &str) {
        if let Some((_, token)) = self.session_tasks.remove(session_id) {
            token.cancel();
        }
    }

    pub fn snapshot_rate_counters(&self) {
        let conn = self.limits_conn.lock().unwrap();
        self.limits.save(&conn);
    }
}

fn open_db(path: &str) -> anyhow::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

fn register_builtins(plugins: &PluginRegistry, memory: &Arc<MemoryStore>, config: &AriaConfig) {
    use aria_plugins::builtin;
    use aria_plugins::PluginHandler;

    let registrations = [
        plugins.register(
            builtin::weather::descriptor(),
            Arc::new(builtin::weather::WeatherHandler),
        ),
        plugins.register(
            builtin::memory::descriptor(),
            Arc::new(builtin::memory::MemoryHandler::new(memory.clone())),
        ),
        plugins.register(builtin::time::descriptor(), Arc::new(builtin::time::TimeHandler)),
    ];
    for result in registrations {
        if let Err(e) = result {
            // PluginLoadFailure is logged, never fatal to boot.
            tracing::warn!(error = %e, "builtin plugin skipped");
        }
    }

    // External manifests bind to builtin handler implementations by ref.
    if let Some(dir) = &config.plugins.dir {
        let mut factories: std::collections::HashMap<String, Arc<dyn PluginHandler>> =
            std::collections::HashMap::new();
        factories.insert("weather".to_string(), Arc::new(builtin::weather::WeatherHandler));
        factories.insert("time".to_string(), Arc::new(builtin::time::TimeHandler));
        factories.insert(
            "memory".to_string(),
            Arc::new(builtin::memory::MemoryHandler::new(memory.clone())),
        );
        let loaded = plugins.discover_dir(std::path::Path::new(dir), &factories);
        tracing::info!(dir = %dir, loaded, "external plugin discovery complete");
    }
}

/// Resolve the configured provider. API keys come from the environment
/// only; the config loader rejects keys found in the file.
fn build_provider(config: &AriaConfig) -> anyhow::Result<Box<dyn ChatProvider>> {
    match config.ai.provider.as_str() {
        "openai" => {
            let key = std::env::var("ARIA_OPENAI_API_KEY")
                .map_err(|_| anyhow::anyhow!("ARIA_OPENAI_API_KEY is not set"))?;
            Ok(Box::new(aria_agent::openai::OpenAiProvider::new(key, None)))
        }
        "anthropic" => {
            let key = std::env::var("ARIA_ANTHROPIC_API_KEY")
                .map_err(|_| anyhow::anyhow!("ARIA_ANTHROPIC_API_KEY is not set"))?;
            Ok(Box::new(aria_agent::anthropic::AnthropicProvider::new(
                key, None,
            )))
        }
        other => Err(anyhow::anyhow!("unknown ai.provider '{other}'")),
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = if state.config.security.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_headers(Any)
            .allow_methods(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = state
            .config
            .security
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(tower_http::cors::AllowOrigin::list(origins))
            .allow_headers(Any)
            .allow_methods(Any)
    };

    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/register", post(crate::http::login::register_handler))
        .route("/login", post(crate::http::login::login_handler))
        .route("/logout", post(crate::http::login::logout_handler))
        .route(
            "/api/change_password",
            post(crate::http::login::change_password_handler),
        )
        .route("/api/ai_query", post(crate::http::query::ai_query_handler))
        .route(
            "/api/get_user_history",
            post(crate::http::history::history_handler),
        )
        .route("/plugins", get(crate::http::plugins::list_handler))
        .route(
            "/plugins/{name}/enable",
            post(crate::http::plugins::enable_handler),
        )
        .route(
            "/plugins/{name}/disable",
            post(crate::http::plugins::disable_handler),
        )
        .route("/ws/{client_id}", get(crate::ws::connection::ws_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(cors)
}
