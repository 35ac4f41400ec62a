//! Axum-based HTTP gateway for the identity service.
//!
//! - Proper HTTP/1.1 parsing and compliance (hyper)
//! - Request body size limits (64KB max)
//! - Request timeouts to prevent slow-loris abuse
//! - Per-client rate limiting on the credential endpoints
//! - Identity resolution middleware feeding route-level guards
//!
//! Handlers return `Result<_, ApiError>`; the taxonomy-to-status mapping
//! lives in exactly one `IntoResponse` impl.

pub mod admin;
pub mod identity;

use crate::auth::store::{Role, StoreError, UserDirectory};
use crate::auth::{AuthError, SessionService, SqliteAuthStore, TokenCodec, TokenPair};
use crate::config::Config;
use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, patch, post};
use axum::{Extension, Router};
use identity::AuthContext;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB), prevents memory exhaustion.
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout. Argon2 verification is the slowest legitimate step;
/// anything that takes longer is abuse.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Sliding window used by gateway rate limiting.
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Password length bounds (characters), enforced at registration and
/// password change.
const PASSWORD_MIN_CHARS: usize = 8;
const PASSWORD_MAX_CHARS: usize = 128;

// ── Error mapping ───────────────────────────────────────────────

/// Gateway-level failure. Every handler funnels into this enum so the
/// taxonomy maps to fixed statuses and stable, non-leaking messages in one
/// place.
#[derive(Debug)]
pub enum ApiError {
    /// Malformed input, surfaced with a field-level message.
    Validation(String),
    /// Typed failure raised by the session service.
    Auth(AuthError),
    /// A protected route saw no usable identity.
    Unauthorized,
    /// Identity present but lacking the required capability.
    Forbidden,
    /// An admin route referenced an unknown user id.
    NotFound,
    /// Sliding-window rate limit tripped.
    RateLimited,
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self::Auth(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Auth(AuthError::Store(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Validation(message) => (StatusCode::BAD_REQUEST, message),
            Self::Auth(err) => match err {
                AuthError::InvalidCredentials
                | AuthError::AlreadyRegistered
                | AuthError::UserNotFound => (StatusCode::BAD_REQUEST, err.to_string()),
                AuthError::Store(_) | AuthError::Internal(_) => {
                    tracing::error!("request failed: {err}");
                    (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".into())
                }
            },
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "Authentication required".into()),
            Self::Forbidden => (StatusCode::FORBIDDEN, "Insufficient privileges".into()),
            Self::NotFound => (StatusCode::NOT_FOUND, "User not found".into()),
            Self::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "Too many requests".into()),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

// ── Rate limiting ───────────────────────────────────────────────

/// How often the rate limiter sweeps stale client entries from its map.
const RATE_LIMITER_SWEEP_INTERVAL_SECS: u64 = 300; // 5 minutes

/// Per-client sliding-window limiter for the credential endpoints.
/// A limit of 0 disables it.
#[derive(Debug)]
pub struct SlidingWindowRateLimiter {
    limit_per_window: u32,
    window: Duration,
    requests: Mutex<(HashMap<String, Vec<Instant>>, Instant)>,
}

impl SlidingWindowRateLimiter {
    pub fn new(limit_per_window: u32, window: Duration) -> Self {
        Self {
            limit_per_window,
            window,
            requests: Mutex::new((HashMap::new(), Instant::now())),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        if self.limit_per_window == 0 {
            return true;
        }

        let now = Instant::now();
        let cutoff = now.checked_sub(self.window).unwrap_or_else(Instant::now);

        let mut guard = self.requests.lock();
        let (requests, last_sweep) = &mut *guard;

        // Periodic sweep: drop clients with no recent requests
        if last_sweep.elapsed() >= Duration::from_secs(RATE_LIMITER_SWEEP_INTERVAL_SECS) {
            requests.retain(|_, timestamps| {
                timestamps.retain(|t| *t > cutoff);
                !timestamps.is_empty()
            });
            *last_sweep = now;
        }

        let entry = requests.entry(key.to_owned()).or_default();
        entry.retain(|instant| *instant > cutoff);

        if entry.len() >= self.limit_per_window as usize {
            return false;
        }

        entry.push(now);
        true
    }
}

fn client_key_from_headers(headers: &HeaderMap) -> String {
    for header_name in ["X-Forwarded-For", "X-Real-IP"] {
        if let Some(value) = headers.get(header_name).and_then(|v| v.to_str().ok()) {
            let first = value.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return first.to_owned();
            }
        }
    }
    "unknown".into()
}

/// Per-client limit on the endpoints that grind Argon2 or mint tokens.
fn enforce_credential_rate_limit(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let key = client_key_from_headers(headers);
    if !state.rate_limiter.allow(&key) {
        tracing::warn!(client = %key, "rate limit exceeded");
        return Err(ApiError::RateLimited);
    }
    Ok(())
}

// ── Shared state and serve loop ─────────────────────────────────

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionService>,
    pub users: Arc<dyn UserDirectory>,
    pub codec: Arc<TokenCodec>,
    pub rate_limiter: Arc<SlidingWindowRateLimiter>,
    /// Accept `X-User-Id`/`X-User-Role` from an upstream proxy as a second
    /// identity source. Off unless explicitly configured.
    pub trust_proxy_identity: bool,
}

/// True when the bind address would expose the gateway beyond loopback.
fn is_public_bind(host: &str) -> bool {
    match host.parse::<std::net::IpAddr>() {
        Ok(addr) => !addr.is_loopback(),
        Err(_) => host != "localhost",
    }
}

/// Run the HTTP gateway using axum with proper HTTP/1.1 compliance.
pub async fn run_gateway(
    host: &str,
    port: u16,
    config: &Config,
    store: Arc<SqliteAuthStore>,
) -> Result<()> {
    // ── Security: refuse public bind without explicit opt-in ──
    if is_public_bind(host) && !config.server.allow_public_bind {
        anyhow::bail!(
            "🛑 Refusing to bind to {host} — the service would be exposed to the internet.\n\
             Fix: use --host 127.0.0.1 (default), or set\n\
             [server] allow_public_bind = true in the config file (NOT recommended)."
        );
    }

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_port = listener.local_addr()?.port();

    let codec = Arc::new(TokenCodec::new(
        &config.tokens.signing_secret,
        config.tokens.access_ttl_secs,
    ));
    let sessions = Arc::new(SessionService::new(
        store.clone(),
        store.clone(),
        codec.clone(),
        config.tokens.refresh_ttl_secs,
    ));
    let state = AppState {
        sessions,
        users: store,
        codec,
        rate_limiter: Arc::new(SlidingWindowRateLimiter::new(
            config.server.auth_requests_per_minute,
            Duration::from_secs(RATE_LIMIT_WINDOW_SECS),
        )),
        trust_proxy_identity: config.server.trust_proxy_identity,
    };

    let app = router(state);
    tracing::info!("keygate listening on {host}:{actual_port}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
            }
        })
        .await?;

    Ok(())
}

/// Build the full route table with identity middleware and hardening layers.
fn router(state: AppState) -> Router {
    // ── CORS: browser clients call the API from any origin ──
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route("/auth/register", post(handle_register))
        .route("/auth/login", post(handle_login))
        .route("/auth/refresh", post(handle_refresh))
        .route("/auth/logout", post(handle_logout))
        .route("/auth/logout-all", post(handle_logout_all))
        .route("/me", get(handle_me))
        .route("/me/password", post(handle_change_password))
        .route("/admin/users", get(admin::handle_list_users))
        .route("/admin/users/{id}/role", patch(admin::handle_set_role))
        .route("/admin/users/{id}/active", patch(admin::handle_set_active))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            identity::attach_identity,
        ))
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

// ── Wire formats ────────────────────────────────────────────────

/// Request body for register and login.
#[derive(Debug, Deserialize)]
struct CredentialsBody {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshBody {
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PasswordChangeBody {
    old_password: String,
    new_password: String,
}

/// Token pair as surfaced on the wire.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenPairBody {
    access_token: String,
    refresh_token: String,
    token_type: &'static str,
}

impl From<TokenPair> for TokenPairBody {
    fn from(pair: TokenPair) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            token_type: "Bearer",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MeBody {
    user_id: String,
    email: String,
    role: Role,
}

/// Unwrap an optional JSON body, turning axum's rejection into the uniform
/// validation error.
fn required_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(e) => Err(ApiError::Validation(format!("Invalid request: {e}"))),
    }
}

fn validate_email(email: &str) -> Result<(), ApiError> {
    let email = email.trim();
    let well_formed = !email.is_empty()
        && email.len() <= 254
        && !email.contains(char::is_whitespace)
        && email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if !well_formed {
        return Err(ApiError::Validation("email is not a valid address".into()));
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<(), ApiError> {
    let chars = password.chars().count();
    if !(PASSWORD_MIN_CHARS..=PASSWORD_MAX_CHARS).contains(&chars) {
        return Err(ApiError::Validation(format!(
            "password must be {PASSWORD_MIN_CHARS} to {PASSWORD_MAX_CHARS} characters"
        )));
    }
    Ok(())
}

// ── Handlers ────────────────────────────────────────────────────

/// GET /health: liveness only, no secrets.
async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /auth/register: create an account and issue its first token pair.
async fn handle_register(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CredentialsBody>, JsonRejection>,
) -> Result<Json<TokenPairBody>, ApiError> {
    enforce_credential_rate_limit(&state, &headers)?;
    let body = required_body(body)?;
    validate_email(&body.email)?;
    validate_password(&body.password)?;

    let pair = state.sessions.register(&body.email, &body.password)?;
    Ok(Json(pair.into()))
}

/// POST /auth/login: verify credentials and issue a token pair. Every
/// failure mode surfaces as the same undifferentiated 400.
async fn handle_login(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CredentialsBody>, JsonRejection>,
) -> Result<Json<TokenPairBody>, ApiError> {
    enforce_credential_rate_limit(&state, &headers)?;
    let body = required_body(body)?;

    let pair = state.sessions.login(&body.email, &body.password)?;
    Ok(Json(pair.into()))
}

/// POST /auth/refresh: rotate a refresh token for a new pair.
async fn handle_refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<RefreshBody>, JsonRejection>,
) -> Result<Json<TokenPairBody>, ApiError> {
    enforce_credential_rate_limit(&state, &headers)?;
    let body = required_body(body)?;

    let pair = state.sessions.refresh(&body.refresh_token)?;
    Ok(Json(pair.into()))
}

/// POST /auth/logout: revoke one refresh token. Idempotent, 204 always.
async fn handle_logout(
    State(state): State<AppState>,
    body: Result<Json<RefreshBody>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let body = required_body(body)?;
    state.sessions.logout(&body.refresh_token)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /auth/logout-all: revoke every refresh token of the presented
/// token's owner. 204 always.
async fn handle_logout_all(
    State(state): State<AppState>,
    body: Result<Json<RefreshBody>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let body = required_body(body)?;
    state.sessions.logout_all(&body.refresh_token)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /me: the authenticated caller's identity.
async fn handle_me(Extension(ctx): Extension<AuthContext>) -> Result<Json<MeBody>, ApiError> {
    let identity = ctx.require()?;
    Ok(Json(MeBody {
        user_id: identity.user_id.clone(),
        email: identity.email.clone(),
        role: identity.role,
    }))
}

/// POST /me/password: replace the caller's password and revoke all of
/// their refresh tokens.
async fn handle_change_password(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    body: Result<Json<PasswordChangeBody>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let user_id = ctx.require()?.user_id.clone();
    let body = required_body(body)?;
    validate_password(&body.new_password)?;

    state
        .sessions
        .change_password(&user_id, &body.old_password, &body.new_password)?;
    Ok(StatusCode::NO_CONTENT)
}
