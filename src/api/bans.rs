use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::api::auth::AuthUser;
use crate::db::queries;
use crate::error::ApiError;
use crate::events::{EventBus, Topic};
use crate::permissions::{Permission, Scope};
use crate::snowflake::Id;
use crate::state::AppState;
use crate::types::entities::{BanWithUser, CreateBanRequest, PublicUser};
use crate::types::events::{BanCreateEvent, BanDeleteEvent, GuildMemberRemoveEvent};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/:guild_id/bans", get(list_bans))
        .route("/:guild_id/bans/:user_id", axum::routing::put(ban_member).delete(unban_member))
        .route("/:guild_id/members/:user_id", axum::routing::delete(kick_member))
}

async fn list_bans(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(guild_id): Path<Id>,
) -> Result<impl IntoResponse, ApiError> {
    state.permissions.require(Scope { guild_id, channel_id: None, user_id }, Permission::BanMembers).await?;

    let bans = queries::get_guild_bans(&state.db, guild_id).await?;
    let mut out = Vec::with_capacity(bans.len());
    for ban in bans {
        let Some(user) = queries::get_user_by_id(&state.db, ban.user_id).await? else { continue };
        out.push(BanWithUser { ban, user: PublicUser::from(user) });
    }
    Ok(Json(out))
}

async fn ban_member(
    State(state): State<AppState>,
    AuthUser { user_id: actor_id }: AuthUser,
    Path((guild_id, target_user_id)): Path<(Id, Id)>,
    Json(body): Json<CreateBanRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.permissions.require(Scope { guild_id, channel_id: None, user_id: actor_id }, Permission::BanMembers).await?;

    let owner_id = queries::get_guild_owner_id(&state.db, guild_id).await?.ok_or(ApiError::GuildNotFound)?;
    if target_user_id == owner_id {
        return Err(ApiError::NotGuildOwner);
    }

    let ban = queries::create_ban(&state.db, guild_id, target_user_id, actor_id, body.reason.as_deref()).await?;
    queries::remove_guild_member(&state.db, guild_id, target_user_id).await?;

    state.permissions.invalidate(Some(guild_id), None, Some(target_user_id)).await;
    state.gateway.force_close_user(target_user_id, crate::types::events::close_code::SESSION_INVALIDATED);

    let _ = state.bus.publish(Topic::Members, "member.banned", target_user_id, BanCreateEvent { guild_id, ban: ban.clone() }).await;
    let _ = state
        .bus
        .publish(
            Topic::Members,
            "member.removed",
            target_user_id,
            GuildMemberRemoveEvent { guild_id, user_id: target_user_id },
        )
        .await;

    Ok(Json(ban))
}

async fn unban_member(
    State(state): State<AppState>,
    AuthUser { user_id: actor_id }: AuthUser,
    Path((guild_id, target_user_id)): Path<(Id, Id)>,
) -> Result<impl IntoResponse, ApiError> {
    state.permissions.require(Scope { guild_id, channel_id: None, user_id: actor_id }, Permission::BanMembers).await?;

    queries::delete_ban(&state.db, guild_id, target_user_id).await?;

    let _ = state
        .bus
        .publish(Topic::Members, "member.unbanned", target_user_id, BanDeleteEvent { guild_id, user_id: target_user_id })
        .await;

    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn kick_member(
    State(state): State<AppState>,
    AuthUser { user_id: actor_id }: AuthUser,
    Path((guild_id, target_user_id)): Path<(Id, Id)>,
) -> Result<impl IntoResponse, ApiError> {
    state.permissions.require(Scope { guild_id, channel_id: None, user_id: actor_id }, Permission::KickMembers).await?;

    let owner_id = queries::get_guild_owner_id(&state.db, guild_id).await?.ok_or(ApiError::GuildNotFound)?;
    if target_user_id == owner_id {
        return Err(ApiError::NotGuildOwner);
    }

    queries::get_guild_member(&state.db, guild_id, target_user_id).await?.ok_or(ApiError::NotFound("Member"))?;
    queries::remove_guild_member(&state.db, guild_id, target_user_id).await?;

    state.permissions.invalidate(Some(guild_id), None, Some(target_user_id)).await;
    state.gateway.force_close_user(target_user_id, crate::types::events::close_code::SESSION_INVALIDATED);

    let _ = state
        .bus
        .publish(
            Topic::Members,
            "member.removed",
            target_user_id,
            GuildMemberRemoveEvent { guild_id, user_id: target_user_id },
        )
        .await;

    Ok(axum::http::StatusCode::NO_CONTENT)
}
