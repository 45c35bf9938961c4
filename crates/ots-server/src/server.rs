use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use directories::ProjectDirs;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    clock::{Clock, SystemClock},
    handlers::{create_secret, health, reveal_secret, secret_status},
    lifecycle::{Lifecycle, LifecycleConfig},
    rate_limit::{RateLimitPolicy, RateLimiter},
    store::{crypto::DEFAULT_PBKDF2_ITERATIONS, CryptoEngine, RedbStore},
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Master key; resolved from `OTS_MASTER_KEY_FILE` / `OTS_MASTER_KEY` when unset.
    pub master_key: Option<String>,
    pub data_dir: Option<PathBuf>,
    /// Public base URL share links are built on ($OTS_BASE_URL).
    pub base_url: String,
    pub cors_origins: Option<String>,
    pub store_timeout: Duration,
    pub sweep_interval: Duration,
    pub pbkdf2_iterations: u32,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("OTS_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_or("OTS_PORT", 8080),
            master_key: None,
            data_dir: std::env::var("OTS_DATA_DIR").ok().map(PathBuf::from),
            base_url: std::env::var("OTS_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".into()),
            cors_origins: std::env::var("OTS_CORS_ORIGINS").ok(),
            store_timeout: Duration::from_millis(env_or("OTS_STORE_TIMEOUT_MS", 5000)),
            sweep_interval: Duration::from_secs(env_or("OTS_SWEEP_INTERVAL_SECS", 300)),
            pbkdf2_iterations: env_or("OTS_PBKDF2_ITERATIONS", DEFAULT_PBKDF2_ITERATIONS),
        }
    }
}

/// Read a master key from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_key_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read key file: {}", path.display()))?;
    let key = content.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("key file is empty: {}", path.display());
    }
    Ok(key)
}

/// Resolve the master key from `OTS_MASTER_KEY_FILE` (preferred) or `OTS_MASTER_KEY`.
pub fn resolve_master_key() -> Result<String> {
    if let Ok(path) = std::env::var("OTS_MASTER_KEY_FILE") {
        let key = read_key_file(Path::new(&path))?;
        if std::env::var("OTS_MASTER_KEY").is_ok() {
            warn!("both OTS_MASTER_KEY and OTS_MASTER_KEY_FILE are set; using file");
        }
        return Ok(key);
    }
    let key = std::env::var("OTS_MASTER_KEY")
        .context("OTS_MASTER_KEY or OTS_MASTER_KEY_FILE environment variable is required")?;
    if key.is_empty() {
        anyhow::bail!("OTS_MASTER_KEY must not be empty");
    }
    Ok(key)
}

/// Create and return the data directory holding `ots.db`: the configured one
/// (`OTS_DATA_DIR` via [`ServerConfig`]) or the platform data dir
/// (`~/.local/share/ots/`, etc.).
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    let dir = match data_dir {
        Some(d) => d.clone(),
        None => ProjectDirs::from("", "", "ots")
            .context("could not determine platform data directory")?
            .data_dir()
            .to_owned(),
    };
    std::fs::create_dir_all(&dir).with_context(|| format!("create data dir: {}", dir.display()))?;
    Ok(dir)
}

/// All routes with CORS and request tracing applied.
pub fn router(state: AppState, cors_origins: Option<&str>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/secrets", post(create_secret))
        .route("/secrets/{key}", get(secret_status).post(reveal_secret))
        .with_state(state)
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let master_key = match cfg.master_key {
        Some(k) => k,
        None => resolve_master_key()?,
    };
    let crypto = CryptoEngine::new(&master_key)
        .context("initialise crypto engine")?
        .with_iterations(cfg.pbkdf2_iterations);
    drop(master_key);

    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let db_path = data_dir.join("ots.db");
    let store = RedbStore::open(&db_path).context("open store")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let lifecycle = Lifecycle::new(
        Arc::new(store),
        Arc::new(crypto),
        clock.clone(),
        LifecycleConfig {
            base_url: cfg.base_url,
            store_timeout: cfg.store_timeout,
        },
    );
    let rate_limiter = RateLimiter::new(clock);

    lifecycle.clone().spawn_sweep(cfg.sweep_interval);
    rate_limiter.clone().spawn_sweep(cfg.sweep_interval);

    let state = AppState {
        lifecycle,
        rate_limiter,
        create_limit: RateLimitPolicy::create(),
        access_limit: RateLimitPolicy::access(),
    };

    let app = router(state, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "ots server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any)
        .expose_headers([
            http::HeaderName::from_static("x-ratelimit-remaining"),
            http::HeaderName::from_static("x-ratelimit-reset"),
        ]);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
