pub mod clock;
pub mod handlers;
pub mod lifecycle;
pub mod rate_limit;
pub mod server;
pub mod store;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: lifecycle::Lifecycle,
    pub rate_limiter: rate_limit::RateLimiter,
    /// Budget for `POST /secrets`.
    pub create_limit: rate_limit::RateLimitPolicy,
    /// Budget shared by status checks and reveals.
    pub access_limit: rate_limit::RateLimitPolicy,
}

pub use server::{read_key_file, resolve_data_dir, resolve_master_key, router, run, ServerConfig};
