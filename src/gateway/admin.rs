//! Root-only user administration.
//!
//! Listing with an email filter and pagination, role changes, and
//! activation toggles. Every handler re-validates the actor against the
//! store via [`identity::require_root`]; deactivating an account also
//! revokes its refresh tokens so its open sessions die with it.

use super::identity::{self, AuthContext};
use super::{required_body, ApiError, AppState};
use crate::auth::store::{Role, User, UserQuery};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::Extension;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rows per page when the request does not say.
const DEFAULT_PAGE_SIZE: u32 = 20;
/// Upper bound on rows per page.
const MAX_PAGE_SIZE: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct ListUsersParams {
    /// Case-insensitive email substring filter.
    q: Option<String>,
    page: Option<u32>,
    size: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AdminUserBody {
    user_id: String,
    email: String,
    role: Role,
    is_root: bool,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl From<User> for AdminUserBody {
    fn from(user: User) -> Self {
        Self {
            user_id: user.id,
            email: user.email,
            role: user.role,
            is_root: user.is_root,
            is_active: user.is_active,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UserListBody {
    users: Vec<AdminUserBody>,
    page: u32,
    size: u32,
    total: u64,
}

#[derive(Debug, Deserialize)]
pub struct RoleChangeBody {
    role: String,
}

#[derive(Debug, Deserialize)]
pub struct ActiveChangeBody {
    active: bool,
}

/// GET /admin/users: paginated listing, optionally filtered by email
/// substring.
pub async fn handle_list_users(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(params): Query<ListUsersParams>,
) -> Result<Json<UserListBody>, ApiError> {
    identity::require_root(&state, &ctx)?;

    let page = params.page.unwrap_or(0);
    let size = params
        .size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let query = UserQuery {
        email_contains: params
            .q
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_owned),
        page,
        size,
    };

    let result = state.users.search(&query)?;
    Ok(Json(UserListBody {
        users: result.users.into_iter().map(AdminUserBody::from).collect(),
        page,
        size,
        total: result.total,
    }))
}

/// PATCH /admin/users/{id}/role: change a user's role. The root account's
/// role is immutable.
pub async fn handle_set_role(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    body: Result<Json<RoleChangeBody>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let actor = identity::require_root(&state, &ctx)?;
    let body = required_body(body)?;

    let Some(role) = Role::parse(body.role.trim()) else {
        return Err(ApiError::Validation(format!("unknown role {:?}", body.role)));
    };
    let Some(target) = state.users.find_by_id(&id)? else {
        return Err(ApiError::NotFound);
    };
    if target.is_root {
        return Err(ApiError::Validation(
            "the root account's role cannot be changed".into(),
        ));
    }

    state.users.set_role(&target.id, role)?;
    tracing::info!(
        actor = %actor.user_id,
        target = %target.id,
        role = role.as_str(),
        "admin changed role"
    );
    Ok(StatusCode::NO_CONTENT)
}

/// PATCH /admin/users/{id}/active: activate or deactivate a user.
/// Deactivation revokes every refresh token of the target in the same
/// request, so no open session survives it.
pub async fn handle_set_active(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    body: Result<Json<ActiveChangeBody>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let actor = identity::require_root(&state, &ctx)?;
    let body = required_body(body)?;

    let Some(target) = state.users.find_by_id(&id)? else {
        return Err(ApiError::NotFound);
    };
    if target.is_root && !body.active {
        return Err(ApiError::Validation(
            "the root account cannot be deactivated".into(),
        ));
    }

    state.users.set_active(&target.id, body.active)?;
    if !body.active {
        state.sessions.revoke_sessions(&target.id)?;
    }
    tracing::info!(
        actor = %actor.user_id,
        target = %target.id,
        active = body.active,
        "admin changed active flag"
    );
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::{SqliteAuthStore, UserDirectory};
    use crate::auth::{AuthError, SessionService, TokenCodec};
    use crate::gateway::identity::Identity;
    use crate::gateway::SlidingWindowRateLimiter;
    use std::sync::Arc;
    use std::time::Duration;

    fn state_with_store() -> (AppState, Arc<SqliteAuthStore>) {
        let store = Arc::new(SqliteAuthStore::in_memory().unwrap());
        let codec = Arc::new(TokenCodec::new("admin-test-secret", 3600));
        let sessions = Arc::new(SessionService::new(
            store.clone(),
            store.clone(),
            codec.clone(),
            3600,
        ));
        let state = AppState {
            sessions,
            users: store.clone(),
            codec,
            rate_limiter: Arc::new(SlidingWindowRateLimiter::new(0, Duration::from_secs(60))),
            trust_proxy_identity: false,
        };
        (state, store)
    }

    fn seed_user(store: &SqliteAuthStore, email: &str, role: Role, is_root: bool) -> User {
        let mut user = User::new(email.into(), "unused-digest".into(), role);
        user.is_root = is_root;
        store.create(&user).unwrap();
        user
    }

    fn ctx_for(user: &User) -> AuthContext {
        AuthContext(Some(Identity {
            user_id: user.id.clone(),
            email: user.email.clone(),
            role: user.role,
            is_root: user.is_root,
        }))
    }

    fn list_params(q: Option<&str>, page: Option<u32>, size: Option<u32>) -> Query<ListUsersParams> {
        Query(ListUsersParams {
            q: q.map(str::to_owned),
            page,
            size,
        })
    }

    #[tokio::test]
    async fn admin_routes_refuse_non_root_callers() {
        let (state, store) = state_with_store();
        seed_user(&store, "root@example.com", Role::Teacher, true);
        let student = seed_user(&store, "s@example.com", Role::Student, false);

        let err = handle_list_users(
            State(state.clone()),
            Extension(AuthContext(None)),
            list_params(None, None, None),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));

        let err = handle_list_users(
            State(state),
            Extension(ctx_for(&student)),
            list_params(None, None, None),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden));
    }

    #[tokio::test]
    async fn listing_filters_and_paginates() {
        let (state, store) = state_with_store();
        let root = seed_user(&store, "root@example.com", Role::Teacher, true);
        seed_user(&store, "alice@example.com", Role::Student, false);
        seed_user(&store, "bob@sample.org", Role::Student, false);

        // unfiltered: everyone, root included
        let Json(all) = handle_list_users(
            State(state.clone()),
            Extension(ctx_for(&root)),
            list_params(None, None, None),
        )
        .await
        .unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.users.len(), 3);
        assert_eq!(all.page, 0);
        assert_eq!(all.size, 20);

        // filtered by substring, one row per page
        let Json(first) = handle_list_users(
            State(state.clone()),
            Extension(ctx_for(&root)),
            list_params(Some("example"), Some(0), Some(1)),
        )
        .await
        .unwrap();
        assert_eq!(first.total, 2);
        assert_eq!(first.users.len(), 1);
        assert_eq!(first.users[0].email, "root@example.com");

        let Json(second) = handle_list_users(
            State(state.clone()),
            Extension(ctx_for(&root)),
            list_params(Some("example"), Some(1), Some(1)),
        )
        .await
        .unwrap();
        assert_eq!(second.users.len(), 1);
        assert_eq!(second.users[0].email, "alice@example.com");

        // size is clamped to the allowed range
        let Json(clamped) = handle_list_users(
            State(state),
            Extension(ctx_for(&root)),
            list_params(None, None, Some(0)),
        )
        .await
        .unwrap();
        assert_eq!(clamped.size, 1);
    }

    #[tokio::test]
    async fn role_change_validates_target_and_role() {
        let (state, store) = state_with_store();
        let root = seed_user(&store, "root@example.com", Role::Teacher, true);
        let student = seed_user(&store, "s@example.com", Role::Student, false);

        // unknown target
        let err = handle_set_role(
            State(state.clone()),
            Extension(ctx_for(&root)),
            Path("no-such-id".into()),
            Ok(Json(RoleChangeBody {
                role: "TEACHER".into(),
            })),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::NotFound));

        // unknown role string
        let err = handle_set_role(
            State(state.clone()),
            Extension(ctx_for(&root)),
            Path(student.id.clone()),
            Ok(Json(RoleChangeBody {
                role: "WIZARD".into(),
            })),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        // root's own role is immutable
        let err = handle_set_role(
            State(state.clone()),
            Extension(ctx_for(&root)),
            Path(root.id.clone()),
            Ok(Json(RoleChangeBody {
                role: "STUDENT".into(),
            })),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        // the happy path sticks
        let status = handle_set_role(
            State(state),
            Extension(ctx_for(&root)),
            Path(student.id.clone()),
            Ok(Json(RoleChangeBody {
                role: "TEACHER".into(),
            })),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        let reloaded = store.find_by_id(&student.id).unwrap().unwrap();
        assert_eq!(reloaded.role, Role::Teacher);
    }

    #[tokio::test]
    async fn deactivation_revokes_the_targets_sessions() {
        let (state, store) = state_with_store();
        let root = seed_user(&store, "root@example.com", Role::Teacher, true);
        let pair = state
            .sessions
            .register("victim@example.com", "password123")
            .unwrap();
        let victim = store.find_by_email("victim@example.com").unwrap().unwrap();

        let status = handle_set_active(
            State(state.clone()),
            Extension(ctx_for(&root)),
            Path(victim.id.clone()),
            Ok(Json(ActiveChangeBody { active: false })),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let reloaded = store.find_by_id(&victim.id).unwrap().unwrap();
        assert!(!reloaded.is_active);
        let err = state.sessions.refresh(&pair.refresh_token).unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));

        // reactivation restores password login
        let status = handle_set_active(
            State(state.clone()),
            Extension(ctx_for(&root)),
            Path(victim.id.clone()),
            Ok(Json(ActiveChangeBody { active: true })),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(state
            .sessions
            .login("victim@example.com", "password123")
            .is_ok());
    }

    #[tokio::test]
    async fn root_cannot_be_deactivated() {
        let (state, store) = state_with_store();
        let root = seed_user(&store, "root@example.com", Role::Teacher, true);

        let err = handle_set_active(
            State(state.clone()),
            Extension(ctx_for(&root)),
            Path(root.id.clone()),
            Ok(Json(ActiveChangeBody { active: false })),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        // unknown target is 404, not 400
        let err = handle_set_active(
            State(state),
            Extension(ctx_for(&root)),
            Path("no-such-id".into()),
            Ok(Json(ActiveChangeBody { active: false })),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::NotFound));
    }
}
