//! Request identity resolution.
//!
//! Every request passes through [`attach_identity`], which runs an ordered
//! list of identity sources (bearer token first, trusted proxy headers
//! second) and stores the outcome in the request extensions as an
//! [`AuthContext`]. Resolution is fail-open: a missing, malformed, expired
//! or otherwise unusable credential yields an anonymous context instead of
//! a rejection. Routes that need identity enforce it themselves, so the 401
//! surfaces exactly where authorization is actually required.

use super::{ApiError, AppState};
use crate::auth::store::Role;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::Response;

/// The authenticated caller, as established by one identity source.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    /// Empty when the identity came from proxy headers.
    pub email: String,
    pub role: Role,
    pub is_root: bool,
}

/// Per-request identity slot. `None` means the request is anonymous.
#[derive(Debug, Clone, Default)]
pub struct AuthContext(pub Option<Identity>);

impl AuthContext {
    /// The resolved identity, or `Unauthorized` at routes that require one.
    pub fn require(&self) -> Result<&Identity, ApiError> {
        self.0.as_ref().ok_or(ApiError::Unauthorized)
    }
}

/// The capability check shared by every role-guarded route: exact role
/// match, with root satisfying any requirement.
pub fn authorize(identity: &Identity, required: Role) -> bool {
    identity.is_root || identity.role == required
}

/// Admin guard. Beyond holding a root identity, the actor is re-loaded from
/// the store so a stale access token of a since-deactivated account cannot
/// reach admin mutations.
pub fn require_root(state: &AppState, ctx: &AuthContext) -> Result<Identity, ApiError> {
    let identity = ctx.require()?;
    let Some(actor) = state.users.find_by_id(&identity.user_id)? else {
        tracing::warn!(user_id = %identity.user_id, "admin access denied: unknown actor");
        return Err(ApiError::Forbidden);
    };
    if !actor.is_root || !actor.is_active {
        tracing::warn!(user_id = %actor.id, "admin access denied: not a live root account");
        return Err(ApiError::Forbidden);
    }
    Ok(identity.clone())
}

/// Middleware: resolve the caller's identity and attach it to the request.
/// Never rejects; downstream guards decide.
pub async fn attach_identity(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let identity = resolve_identity(&state, request.headers());
    request.extensions_mut().insert(AuthContext(identity));
    next.run(request).await
}

/// Ordered identity sources, first success wins.
fn resolve_identity(state: &AppState, headers: &HeaderMap) -> Option<Identity> {
    if let Some(identity) = bearer_identity(state, headers) {
        return Some(identity);
    }
    if state.trust_proxy_identity {
        return proxy_identity(headers);
    }
    None
}

/// Extract bearer token from the Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Primary source: a locally signed access token whose subject still maps
/// to an active account.
fn bearer_identity(state: &AppState, headers: &HeaderMap) -> Option<Identity> {
    let token = extract_bearer_token(headers)?;
    let claims = match state.codec.parse_claims(token) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::debug!("bearer token rejected: {e}");
            return None;
        }
    };
    let user = match state.users.find_by_id(&claims.sub) {
        Ok(Some(user)) => user,
        Ok(None) => {
            tracing::debug!(user_id = %claims.sub, "bearer subject no longer exists");
            return None;
        }
        Err(e) => {
            tracing::error!("identity lookup failed: {e}");
            return None;
        }
    };
    if !user.is_active {
        tracing::debug!(user_id = %user.id, "bearer subject is inactive");
        return None;
    }
    Some(Identity {
        user_id: user.id,
        email: user.email,
        role: user.role,
        is_root: user.is_root,
    })
}

/// Secondary source: `X-User-Id` / `X-User-Role` set by an upstream proxy
/// that already verified the caller. Carries no email and never grants root.
fn proxy_identity(headers: &HeaderMap) -> Option<Identity> {
    let user_id = headers
        .get("X-User-Id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())?;
    let role = headers
        .get("X-User-Role")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Role::parse(v.trim()))?;
    Some(Identity {
        user_id: user_id.to_owned(),
        email: String::new(),
        role,
        is_root: false,
    })
}
