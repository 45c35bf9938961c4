use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, warn};

use crate::{
    lifecycle::{LifecycleError, NewSecret, DEFAULT_MAX_VIEWS, DEFAULT_TTL_SECONDS},
    rate_limit::RateLimitDecision,
    AppState,
};

/// One message for every "gone" cause, so callers cannot probe which applied.
const NOT_FOUND_MESSAGE: &str = "Secret not found or has expired";

// ── Errors ────────────────────────────────────────────────────────────────────

/// Everything a handler can fail with, rendered as `{success: false, error}`.
#[derive(Debug)]
pub enum ApiError {
    /// Body was not valid JSON or did not match the expected shape.
    InvalidBody,
    RateLimited(RateLimitDecision),
    Lifecycle(LifecycleError),
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        Self::Lifecycle(e)
    }
}

fn envelope(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"success": false, "error": message}))).into_response()
}

fn passphrase_error(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"success": false, "error": message, "needsPassphrase": true})),
    )
        .into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::InvalidBody => envelope(StatusCode::BAD_REQUEST, "Invalid request data"),
            ApiError::RateLimited(decision) => {
                let mut response = envelope(
                    StatusCode::TOO_MANY_REQUESTS,
                    "Rate limit exceeded. Please try again later.",
                );
                set_rate_limit_headers(&mut response, &decision, true);
                response
            }
            ApiError::Lifecycle(e) => match e {
                LifecycleError::Validation { message, .. } => {
                    envelope(StatusCode::BAD_REQUEST, &message)
                }
                LifecycleError::NotFound
                | LifecycleError::Expired
                | LifecycleError::AlreadyViewed => {
                    envelope(StatusCode::NOT_FOUND, NOT_FOUND_MESSAGE)
                }
                LifecycleError::PassphraseRequired => passphrase_error("Passphrase required"),
                LifecycleError::InvalidPassphrase => passphrase_error("Invalid passphrase"),
                LifecycleError::Decryption => {
                    envelope(StatusCode::INTERNAL_SERVER_ERROR, "Failed to decrypt secret")
                }
                LifecycleError::StoreUnavailable => {
                    warn!("store unavailable");
                    envelope(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Service temporarily unavailable",
                    )
                }
                LifecycleError::Internal(e) => {
                    error!(error = %format!("{e:#}"), "internal error");
                    envelope(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "An unexpected error occurred",
                    )
                }
            },
        }
    }
}

fn set_rate_limit_headers(response: &mut Response, decision: &RateLimitDecision, with_reset: bool) {
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    if with_reset {
        let reset = decision.reset_at.to_rfc3339_opts(SecondsFormat::Millis, true);
        if let Ok(value) = HeaderValue::from_str(&reset) {
            headers.insert("x-ratelimit-reset", value);
        }
    }
}

// ── Client identifier ────────────────────────────────────────────────────────

/// First `X-Forwarded-For` entry, else `X-Real-IP`, else `"unknown"`.
pub fn extract_ip(headers: &HeaderMap) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_owned();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_owned();
        }
    }
    "unknown".to_owned()
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    pub secret: String,
    pub passphrase: Option<String>,
    pub ttl: Option<i64>,
    pub max_views: Option<i64>,
    pub recipient_email: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResponse {
    pub success: bool,
    pub key: String,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

pub async fn create_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CreateRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let ip = extract_ip(&headers);
    let limit = state.rate_limiter.check(&ip, &state.create_limit).await;
    if !limit.allowed {
        return Err(ApiError::RateLimited(limit));
    }

    let Json(body) = body.map_err(|e| {
        debug!(error = %e, "rejected create body");
        ApiError::InvalidBody
    })?;

    let created = state
        .lifecycle
        .create(NewSecret {
            plaintext: body.secret,
            passphrase: body.passphrase,
            ttl_seconds: body.ttl.unwrap_or(DEFAULT_TTL_SECONDS),
            max_views: body.max_views.unwrap_or(DEFAULT_MAX_VIEWS),
            recipient_email: body.recipient_email,
            client_ip: Some(ip),
        })
        .await?;

    let mut response = (
        StatusCode::CREATED,
        Json(CreateResponse {
            success: true,
            key: created.key,
            url: created.url,
            expires_at: created.expires_at,
        }),
    )
        .into_response();
    set_rate_limit_headers(&mut response, &limit, false);
    Ok(response)
}

// ── Status ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub exists: bool,
    pub needs_passphrase: bool,
    pub expires_at: DateTime<Utc>,
    pub views_remaining: u32,
}

pub async fn secret_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let ip = extract_ip(&headers);
    let limit = state.rate_limiter.check(&ip, &state.access_limit).await;
    if !limit.allowed {
        return Err(ApiError::RateLimited(limit));
    }

    let status = state.lifecycle.status(&key).await?;
    Ok(Json(StatusResponse {
        exists: true,
        needs_passphrase: status.needs_passphrase,
        expires_at: status.expires_at,
        views_remaining: status.views_remaining,
    }))
}

// ── Reveal ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct RevealRequest {
    pub passphrase: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealResponse {
    pub success: bool,
    pub secret: String,
    pub expires_at: DateTime<Utc>,
    pub views_remaining: u32,
}

pub async fn reveal_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<Json<RevealResponse>, ApiError> {
    let ip = extract_ip(&headers);
    let limit = state.rate_limiter.check(&ip, &state.access_limit).await;
    if !limit.allowed {
        return Err(ApiError::RateLimited(limit));
    }

    // An empty body is the same as `{}`.
    let request: RevealRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RevealRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            debug!(error = %e, "rejected reveal body");
            ApiError::InvalidBody
        })?
    };

    let revealed = state
        .lifecycle
        .reveal(&key, request.passphrase.as_deref(), Some(&ip))
        .await?;
    Ok(Json(RevealResponse {
        success: true,
        secret: revealed.secret,
        expires_at: revealed.expires_at,
        views_remaining: revealed.views_remaining,
    }))
}
