use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::api::auth::AuthUser;
use crate::db::queries;
use crate::error::ApiError;
use crate::events::{EventBus, Topic};
use crate::permissions::{Permission, Permissions, Scope};
use crate::snowflake::Id;
use crate::state::AppState;
use crate::types::entities::{
    ChannelType, CreateChannelRequest, CreateGuildRequest, Guild, GuildMemberWithUser, PublicUser,
    UpdateGuildRequest,
};
use crate::types::events::{
    ChannelCreateEvent, GuildCreateEvent, GuildDeleteEvent, GuildMemberRemoveEvent, GuildUpdateEvent,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", axum::routing::post(create_guild))
        .route("/:guild_id", get(get_guild).patch(update_guild).delete(delete_guild))
        .route("/:guild_id/channels", get(list_channels).post(create_channel))
        .route("/:guild_id/members", get(list_members))
        .route("/:guild_id/members/me", axum::routing::delete(leave_guild))
}

async fn require_member(state: &AppState, guild_id: Id, user_id: Id) -> Result<(), ApiError> {
    queries::get_guild_member(&state.db, guild_id, user_id).await?.ok_or(ApiError::GuildNotFound)?;
    Ok(())
}

async fn create_guild(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Json(body): Json<CreateGuildRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(ApiError::InvalidInput("guild name must not be empty".into()));
    }

    let guild_id = state.ids.generate()?;
    let guild = queries::create_guild(&state.db, guild_id, name, user_id).await?;
    queries::add_guild_member(&state.db, guild_id, user_id).await?;

    let everyone_id = state.ids.generate()?;
    queries::create_role(
        &state.db,
        everyone_id,
        guild_id,
        "@everyone",
        crate::permissions::PermissionBits(Permissions::default().bits() as i64),
        true,
        0,
    )
    .await?;

    let default_channel_id = state.ids.generate()?;
    let channel = queries::create_channel(
        &state.db,
        default_channel_id,
        guild_id,
        ChannelType::Text,
        "general",
        None,
        None,
        0,
    )
    .await?;
    queries::update_guild_default_channel(&state.db, guild_id, default_channel_id).await?;
    let guild = Guild { default_channel_id: Some(default_channel_id), ..guild };

    let _ = state
        .bus
        .publish(Topic::Guilds, "guild.created", guild.id, GuildCreateEvent { guild: guild.clone() })
        .await;
    let _ = state
        .bus
        .publish(Topic::Channels, "channel.created", channel.id, ChannelCreateEvent { channel: channel.clone() })
        .await;

    Ok(Json(guild))
}

async fn get_guild(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(guild_id): Path<Id>,
) -> Result<impl IntoResponse, ApiError> {
    require_member(&state, guild_id, user_id).await?;
    let guild = queries::get_guild_by_id(&state.db, guild_id).await?.ok_or(ApiError::GuildNotFound)?;
    Ok(Json(guild))
}

async fn update_guild(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(guild_id): Path<Id>,
    Json(body): Json<UpdateGuildRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.permissions.require(Scope { guild_id, channel_id: None, user_id }, Permission::ManageGuild).await?;
    queries::get_guild_by_id(&state.db, guild_id).await?.ok_or(ApiError::GuildNotFound)?;

    let name = body.name.as_deref().map(str::trim);
    if matches!(name, Some("")) {
        return Err(ApiError::InvalidInput("guild name must not be empty".into()));
    }

    let guild = queries::update_guild(&state.db, guild_id, name).await?;

    let _ = state
        .bus
        .publish(Topic::Guilds, "guild.updated", guild.id, GuildUpdateEvent { guild: guild.clone() })
        .await;

    Ok(Json(guild))
}

async fn delete_guild(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(guild_id): Path<Id>,
) -> Result<impl IntoResponse, ApiError> {
    let owner_id = queries::get_guild_owner_id(&state.db, guild_id).await?.ok_or(ApiError::GuildNotFound)?;
    if owner_id != user_id {
        return Err(ApiError::NotGuildOwner);
    }

    queries::delete_guild(&state.db, guild_id).await?;

    let _ = state.bus.publish(Topic::Guilds, "guild.deleted", guild_id, GuildDeleteEvent { id: guild_id }).await;

    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn list_channels(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(guild_id): Path<Id>,
) -> Result<impl IntoResponse, ApiError> {
    require_member(&state, guild_id, user_id).await?;
    let channels = queries::get_guild_channels(&state.db, guild_id).await?;
    Ok(Json(channels))
}

async fn create_channel(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(guild_id): Path<Id>,
    Json(body): Json<CreateChannelRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.permissions.require(Scope { guild_id, channel_id: None, user_id }, Permission::ManageChannels).await?;

    let name = body.name.trim();
    if name.is_empty() {
        return Err(ApiError::InvalidInput("channel name must not be empty".into()));
    }

    if let Some(parent_id) = body.parent_id {
        let parent = queries::get_channel_by_id(&state.db, parent_id).await?.ok_or(ApiError::ChannelNotFound)?;
        if parent.guild_id != guild_id || parent.channel_type != ChannelType::Category {
            return Err(ApiError::InvalidInput("parent_id must reference a category in the same guild".into()));
        }
    }

    let channel_type = body.channel_type.unwrap_or(ChannelType::Text);
    let siblings = queries::get_guild_channels(&state.db, guild_id).await?;
    let position = siblings.len() as i32;

    let channel_id = state.ids.generate()?;
    let channel = queries::create_channel(
        &state.db,
        channel_id,
        guild_id,
        channel_type,
        name,
        body.topic.as_deref(),
        body.parent_id,
        position,
    )
    .await?;

    let _ = state
        .bus
        .publish(Topic::Channels, "channel.created", channel.id, ChannelCreateEvent { channel: channel.clone() })
        .await;

    Ok(Json(channel))
}

async fn list_members(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(guild_id): Path<Id>,
) -> Result<impl IntoResponse, ApiError> {
    require_member(&state, guild_id, user_id).await?;

    let members = queries::get_guild_members(&state.db, guild_id).await?;
    let mut out = Vec::with_capacity(members.len());
    for member in members {
        let Some(user) = queries::get_user_by_id(&state.db, member.user_id).await? else { continue };
        let role_ids = queries::get_member_role_ids(&state.db, guild_id, member.user_id).await?;
        out.push(GuildMemberWithUser {
            guild_id: member.guild_id,
            user_id: member.user_id,
            nickname: member.nickname,
            joined_at: member.joined_at,
            user: PublicUser::from(user),
            role_ids,
        });
    }

    Ok(Json(out))
}

async fn leave_guild(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(guild_id): Path<Id>,
) -> Result<impl IntoResponse, ApiError> {
    let owner_id = queries::get_guild_owner_id(&state.db, guild_id).await?.ok_or(ApiError::GuildNotFound)?;
    if owner_id == user_id {
        return Err(ApiError::InvalidInput("the guild owner cannot leave; delete the guild instead".into()));
    }

    require_member(&state, guild_id, user_id).await?;
    queries::remove_guild_member(&state.db, guild_id, user_id).await?;

    let _ = state
        .bus
        .publish(Topic::Members, "member.left", guild_id, GuildMemberRemoveEvent { guild_id, user_id })
        .await;

    Ok(axum::http::StatusCode::NO_CONTENT)
}
