use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::permissions::Permission;

/// Error taxonomy for the core. Each variant maps to exactly one HTTP
/// status on the REST boundary and, where noted, one gateway close code.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // ── Validation (400) ────────────────────────────────
    #[error("content must not be empty")]
    EmptyMessage,
    #[error("content exceeds the maximum length")]
    MessageTooLong,
    #[error("{0}")]
    InvalidInput(String),

    // ── Authorization (403) ─────────────────────────────
    #[error("missing permission: {0:?}")]
    MissingPermission(Permission),
    #[error("only the message author may edit this message")]
    NotMessageAuthor,
    #[error("only the guild owner may perform this action")]
    NotGuildOwner,
    #[error("user is banned from this guild")]
    UserBanned,

    // ── Not found / gone (404 / 410) ─────────────────────
    #[error("guild not found")]
    GuildNotFound,
    #[error("channel not found")]
    ChannelNotFound,
    #[error("message not found")]
    MessageNotFound,
    #[error("message has been deleted")]
    MessageDeleted,
    #[error("invite has expired")]
    InviteExpired,
    #[error("{0} not found")]
    NotFound(&'static str),

    // ── Conflict (409) ───────────────────────────────────
    #[error("email already registered")]
    EmailAlreadyExists,
    #[error("already a member of this guild")]
    AlreadyMember,
    #[error("the @everyone role cannot be modified this way")]
    CannotModifyEveryone,

    // ── Authentication (401) ─────────────────────────────
    #[error("authentication token expired")]
    TokenExpired,
    #[error("authentication token invalid")]
    TokenInvalid,
    #[error("session has been revoked")]
    SessionRevoked,
    #[error("refresh token invalid")]
    RefreshTokenInvalid,
    #[error("authentication required")]
    Unauthorized,

    // ── Rate / backpressure (429) ────────────────────────
    #[error("rate limited")]
    RateLimited,

    // ── Transient (503) ──────────────────────────────────
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("event bus unavailable: {0}")]
    BusUnavailable(String),

    // ── Fatal ────────────────────────────────────────────
    #[error(transparent)]
    ClockWentBackward(#[from] crate::snowflake::SnowflakeError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Maps to the `4001`..`4005` close codes used by the Gateway.
    pub fn gateway_close_code(&self) -> Option<u16> {
        match self {
            ApiError::TokenExpired
            | ApiError::TokenInvalid
            | ApiError::Unauthorized
            | ApiError::RefreshTokenInvalid => Some(4001),
            ApiError::SessionRevoked => Some(4002),
            ApiError::RateLimited => Some(4005),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::EmptyMessage | ApiError::MessageTooLong | ApiError::InvalidInput(_) => {
                (StatusCode::BAD_REQUEST, "VALIDATION")
            }

            ApiError::MissingPermission(_)
            | ApiError::NotMessageAuthor
            | ApiError::NotGuildOwner
            | ApiError::UserBanned => (StatusCode::FORBIDDEN, "FORBIDDEN"),

            ApiError::GuildNotFound
            | ApiError::ChannelNotFound
            | ApiError::MessageNotFound
            | ApiError::MessageDeleted
            | ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::InviteExpired => (StatusCode::GONE, "INVITE_EXPIRED"),

            ApiError::EmailAlreadyExists => (StatusCode::CONFLICT, "EMAIL_ALREADY_EXISTS"),
            ApiError::AlreadyMember => (StatusCode::CONFLICT, "ALREADY_MEMBER"),
            ApiError::CannotModifyEveryone => (StatusCode::CONFLICT, "CANNOT_MODIFY_EVERYONE"),

            ApiError::TokenExpired => (StatusCode::UNAUTHORIZED, "TOKEN_EXPIRED"),
            ApiError::TokenInvalid => (StatusCode::UNAUTHORIZED, "TOKEN_INVALID"),
            ApiError::SessionRevoked => (StatusCode::UNAUTHORIZED, "SESSION_REVOKED"),
            ApiError::RefreshTokenInvalid => (StatusCode::UNAUTHORIZED, "REFRESH_TOKEN_INVALID"),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),

            ApiError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),

            ApiError::Database(e) => {
                tracing::error!(error = %e, "database error");
                (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_UNAVAILABLE")
            }
            ApiError::BusUnavailable(reason) => {
                tracing::error!(%reason, "event bus unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, "BUS_UNAVAILABLE")
            }

            ApiError::ClockWentBackward(e) => {
                tracing::error!(error = %e, "fatal: snowflake clock went backward");
                (StatusCode::INTERNAL_SERVER_ERROR, "CLOCK_WENT_BACKWARD")
            }
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL")
            }
        };

        let body = json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        });

        (status, Json(body)).into_response()
    }
}
