use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Duration, Utc};
use rand::Rng;

use crate::api::auth::AuthUser;
use crate::db::queries;
use crate::error::ApiError;
use crate::events::{EventBus, Topic};
use crate::permissions::{Permission, Scope};
use crate::snowflake::Id;
use crate::state::AppState;
use crate::types::entities::{CreateInviteRequest, PublicUser};
use crate::types::events::GuildMemberAddEvent;

const INVITE_CODE_ALPHABET: &[u8] =
    b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz23456789";
const INVITE_CODE_LEN: usize = 10;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/:guild_id/invites", get(list_invites).post(create_invite))
        .route("/:guild_id/invites/:code", axum::routing::delete(delete_invite))
}

/// Mounted outside `/guilds` — resolving an invite code doesn't require
/// membership, only that it exists and hasn't expired.
pub fn resolve_routes() -> Router<AppState> {
    Router::new()
        .route("/invites/:code", get(get_invite).post(use_invite))
}

fn generate_code() -> String {
    let mut rng = rand::rng();
    (0..INVITE_CODE_LEN)
        .map(|_| INVITE_CODE_ALPHABET[rng.random_range(0..INVITE_CODE_ALPHABET.len())] as char)
        .collect()
}

async fn list_invites(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(guild_id): Path<Id>,
) -> Result<impl IntoResponse, ApiError> {
    state.permissions.require(Scope { guild_id, channel_id: None, user_id }, Permission::ManageGuild).await?;
    let invites = queries::get_guild_invites(&state.db, guild_id).await?;
    Ok(Json(invites))
}

async fn create_invite(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(guild_id): Path<Id>,
    Json(body): Json<CreateInviteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.permissions.require(Scope { guild_id, channel_id: None, user_id }, Permission::CreateInvites).await?;

    let guild = queries::get_guild_by_id(&state.db, guild_id).await?.ok_or(ApiError::GuildNotFound)?;
    let channel_id = guild.default_channel_id.ok_or(ApiError::InvalidInput("guild has no default channel".into()))?;

    let expires_at = body.max_age_secs.map(|secs| Utc::now() + Duration::seconds(secs));

    let id = state.ids.generate()?;
    let code = generate_code();
    let invite =
        queries::create_invite(&state.db, id, guild_id, channel_id, user_id, &code, body.max_uses, expires_at).await?;

    Ok(Json(invite))
}

async fn delete_invite(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path((guild_id, code)): Path<(Id, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state.permissions.require(Scope { guild_id, channel_id: None, user_id }, Permission::ManageGuild).await?;
    queries::delete_invite(&state.db, &code).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn get_invite(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let invite = resolve_live_invite(&state, &code).await?;
    Ok(Json(invite))
}

async fn use_invite(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let invite = resolve_live_invite(&state, &code).await?;

    if let Some(ban) = queries::get_ban(&state.db, invite.guild_id, user_id).await? {
        let _ = ban;
        return Err(ApiError::UserBanned);
    }

    if queries::get_guild_member(&state.db, invite.guild_id, user_id).await?.is_some() {
        return Err(ApiError::AlreadyMember);
    }

    let member = queries::add_guild_member(&state.db, invite.guild_id, user_id).await?;
    queries::increment_invite_uses(&state.db, &code).await?;

    let guild = queries::get_guild_by_id(&state.db, invite.guild_id).await?.ok_or(ApiError::GuildNotFound)?;
    let user = queries::get_user_by_id(&state.db, user_id).await?.ok_or(ApiError::TokenInvalid)?;

    let _ = state
        .bus
        .publish(
            Topic::Members,
            "member.joined",
            user_id,
            GuildMemberAddEvent { guild_id: invite.guild_id, member, user: PublicUser::from(user) },
        )
        .await;

    Ok(Json(guild))
}

async fn resolve_live_invite(
    state: &AppState,
    code: &str,
) -> Result<crate::types::entities::Invite, ApiError> {
    let invite = queries::get_invite_by_code(&state.db, code).await?.ok_or(ApiError::NotFound("Invite"))?;

    if let Some(expires_at) = invite.expires_at {
        if expires_at <= Utc::now() {
            return Err(ApiError::InviteExpired);
        }
    }
    if let Some(max_uses) = invite.max_uses {
        if invite.uses >= max_uses {
            return Err(ApiError::InviteExpired);
        }
    }

    Ok(invite)
}
