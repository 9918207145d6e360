use axum::extract::{FromRef, State};
use axum::http::request::Parts;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};

use crate::error::ApiError;
use crate::events::{EventBus, Topic};
use crate::services::auth as auth_service;
use crate::snowflake::Id;
use crate::state::AppState;
use crate::types::entities::{LoginRequest, RefreshRequest, RegisterRequest};
use crate::types::events::{SessionRevokedEvent, SessionsRevokedAllEvent};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/refresh", post(refresh))
        .route("/logout", post(logout))
        .route("/logout-all", post(logout_all))
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response =
        auth_service::register(&state.db, &state.config, &state.ids, &body.username, &body.email, &body.password)
            .await?;
    Ok(Json(response))
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = auth_service::login(&state.db, &state.config, &state.ids, &body.email, &body.password).await?;
    Ok(Json(response))
}

async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = auth_service::refresh(&state.db, &state.config, &state.ids, &body.refresh_token).await?;
    Ok(Json(response))
}

async fn logout(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session_id = auth_service::logout(&state.db, &body.refresh_token).await?;
    let _ = state
        .bus
        .publish(Topic::Sessions, "session.revoked", session_id, SessionRevokedEvent { session_id })
        .await;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

/// Revokes every session for the caller — "log out everywhere". Gateway
/// instances learn of it off the bus and force-close the affected
/// connections.
async fn logout_all(State(state): State<AppState>, AuthUser { user_id }: AuthUser) -> Result<impl IntoResponse, ApiError> {
    auth_service::logout_all(&state.db, user_id).await?;
    let _ = state
        .bus
        .publish(Topic::Sessions, "sessions.revoked_all", user_id, SessionsRevokedAllEvent { user_id })
        .await;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

// ── Auth extractor ──────────────────────────────────────

pub struct AuthUser {
    pub user_id: Id,
}

impl<S> axum::extract::FromRequestParts<S> for AuthUser
where
    AppState: axum::extract::FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        async move {
            let app_state = <AppState as FromRef<S>>::from_ref(state);

            let auth_header = parts
                .headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .ok_or(ApiError::Unauthorized)?;

            let token = auth_header.strip_prefix("Bearer ").ok_or(ApiError::Unauthorized)?;

            let user_id = auth_service::validate_access_token(&app_state.config, token)?;

            Ok(AuthUser { user_id })
        }
    }
}
