//! Minimal auth: register / login / refresh / validate.
//!
//! Tokens are opaque bearer JWTs (HMAC, local validation) per the open
//! question decision recorded in DESIGN.md. Access tokens carry no session
//! id, so revoking a session can't be enforced by an identify-time DB
//! lookup — instead `logout`/`logout_all` publish to the sessions topic and
//! every gateway instance force-closes the affected connections directly.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::db::queries;
use crate::error::ApiError;
use crate::snowflake::{Id, Snowflake};
use crate::types::entities::{AuthResponse, PublicUser, TokenResponse};

#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: Id,
    pub iat: i64,
    pub exp: i64,
}

pub async fn register(
    pool: &PgPool,
    config: &AppConfig,
    ids: &Snowflake,
    username: &str,
    email: &str,
    password: &str,
) -> Result<AuthResponse, ApiError> {
    if username.trim().len() < 2 || username.len() > 32 {
        return Err(ApiError::InvalidInput("username must be 2-32 characters".into()));
    }
    if password.len() < 8 {
        return Err(ApiError::InvalidInput("password must be at least 8 characters".into()));
    }
    if queries::get_user_by_email(pool, email).await?.is_some() {
        return Err(ApiError::EmailAlreadyExists);
    }

    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("failed to hash password: {e}"))?
        .to_string();

    let user_id = ids.generate()?;
    let user = queries::create_user(pool, user_id, username, email, &password_hash).await?;

    let (access_token, refresh_token) = create_tokens(pool, config, ids, user.id).await?;

    Ok(AuthResponse {
        access_token,
        refresh_token,
        user: PublicUser::from(user),
    })
}

pub async fn login(
    pool: &PgPool,
    config: &AppConfig,
    ids: &Snowflake,
    email: &str,
    password: &str,
) -> Result<AuthResponse, ApiError> {
    let user = queries::get_user_by_email(pool, email).await?.ok_or(ApiError::Unauthorized)?;

    let parsed_hash = PasswordHash::new(&user.password_hash)
        .map_err(|e| anyhow::anyhow!("stored password hash is invalid: {e}"))?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .map_err(|_| ApiError::Unauthorized)?;

    let (access_token, refresh_token) = create_tokens(pool, config, ids, user.id).await?;

    Ok(AuthResponse {
        access_token,
        refresh_token,
        user: PublicUser::from(user),
    })
}

pub async fn refresh(
    pool: &PgPool,
    config: &AppConfig,
    ids: &Snowflake,
    refresh_token: &str,
) -> Result<TokenResponse, ApiError> {
    let token_hash = hash_token(refresh_token);
    let session = queries::get_session_by_token_hash(pool, &token_hash)
        .await?
        .ok_or(ApiError::RefreshTokenInvalid)?;

    if session.expires_at < Utc::now() {
        return Err(ApiError::RefreshTokenInvalid);
    }

    queries::delete_session(pool, session.id).await?;
    let (access_token, new_refresh_token) = create_tokens(pool, config, ids, session.user_id).await?;

    Ok(TokenResponse { access_token, refresh_token: new_refresh_token })
}

/// Returns the revoked session's id, for the caller to publish
/// `session.revoked` on.
pub async fn logout(pool: &PgPool, refresh_token: &str) -> Result<Id, ApiError> {
    let token_hash = hash_token(refresh_token);
    let session = queries::get_session_by_token_hash(pool, &token_hash)
        .await?
        .ok_or(ApiError::RefreshTokenInvalid)?;
    queries::revoke_session(pool, session.id).await?;
    Ok(session.id)
}

/// Revokes every session belonging to `user_id`, for the caller to publish
/// `sessions.revoked_all` on.
pub async fn logout_all(pool: &PgPool, user_id: Id) -> Result<(), ApiError> {
    queries::revoke_all_sessions(pool, user_id).await?;
    Ok(())
}

/// Decodes and verifies the JWT only; does not check the backing session
/// row. Callers that need revocation semantics (the Gateway) must also
/// consult `queries::get_session_by_id`.
pub fn validate_access_token(config: &AppConfig, token: &str) -> Result<Id, ApiError> {
    let data = decode::<JwtClaims>(
        token,
        &DecodingKey::from_secret(config.auth.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => ApiError::TokenExpired,
        _ => ApiError::TokenInvalid,
    })?;
    Ok(data.claims.sub)
}

async fn create_tokens(
    pool: &PgPool,
    config: &AppConfig,
    ids: &Snowflake,
    user_id: Id,
) -> Result<(String, String), ApiError> {
    let now = Utc::now().timestamp();
    let claims = JwtClaims { sub: user_id, iat: now, exp: now + config.auth.access_token_ttl_secs };
    let access_token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.auth.jwt_secret.as_bytes()),
    )
    .map_err(|e| anyhow::anyhow!("failed to encode jwt: {e}"))?;

    let session_id = ids.generate()?;
    let refresh_token = session_id.to_string() + "." + &ids.generate()?.to_string();
    let token_hash = hash_token(&refresh_token);
    let expires_at = Utc::now() + chrono::Duration::seconds(config.auth.refresh_token_ttl_secs);

    queries::create_session(pool, session_id, user_id, &token_hash, expires_at).await?;

    Ok((access_token, refresh_token))
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_token_is_deterministic() {
        assert_eq!(hash_token("abc"), hash_token("abc"));
        assert_ne!(hash_token("abc"), hash_token("abd"));
    }
}
