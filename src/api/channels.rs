use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::api::auth::AuthUser;
use crate::db::queries;
use crate::error::ApiError;
use crate::events::{EventBus, Topic};
use crate::permissions::{Permission, Permissions, Scope};
use crate::snowflake::Id;
use crate::state::AppState;
use crate::types::entities::{
    Channel, CreateMessageRequest, MessagePageQuery, PutChannelOverwriteRequest,
    UpdateChannelRequest, UpdateMessageRequest,
};
use crate::types::events::{ChannelDeleteEvent, ChannelOverwriteUpdateEvent, ChannelUpdateEvent};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/:channel_id", get(get_channel).patch(update_channel).delete(delete_channel))
        .route("/:channel_id/overwrites", post(put_overwrite))
        .route("/:channel_id/overwrites/:target_type/:target_id", axum::routing::delete(delete_overwrite))
        .route("/:channel_id/messages", get(list_messages).post(create_message))
        .route(
            "/:channel_id/messages/:message_id",
            axum::routing::patch(update_message).delete(delete_message),
        )
}

/// Resolves the channel and verifies the caller can at least see it, per the
/// teacher's resolve-then-check pattern (`resolve_channel_with_perm`).
async fn resolve_channel(state: &AppState, channel_id: Id, user_id: Id) -> Result<Channel, ApiError> {
    let channel = queries::get_channel_by_id(&state.db, channel_id).await?.ok_or(ApiError::ChannelNotFound)?;
    queries::get_guild_member(&state.db, channel.guild_id, user_id).await?.ok_or(ApiError::ChannelNotFound)?;
    state
        .permissions
        .require(Scope { guild_id: channel.guild_id, channel_id: Some(channel_id), user_id }, Permission::ViewChannel)
        .await?;
    Ok(channel)
}

async fn get_channel(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(channel_id): Path<Id>,
) -> Result<impl IntoResponse, ApiError> {
    let channel = resolve_channel(&state, channel_id, user_id).await?;
    Ok(Json(channel))
}

async fn update_channel(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(channel_id): Path<Id>,
    Json(body): Json<UpdateChannelRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let channel = queries::get_channel_by_id(&state.db, channel_id).await?.ok_or(ApiError::ChannelNotFound)?;
    state
        .permissions
        .require(Scope { guild_id: channel.guild_id, channel_id: Some(channel_id), user_id }, Permission::ManageChannels)
        .await?;

    let name = body.name.as_deref().map(str::trim);
    if matches!(name, Some("")) {
        return Err(ApiError::InvalidInput("channel name must not be empty".into()));
    }

    let updated = queries::update_channel(&state.db, channel_id, name, body.topic.as_deref(), body.position).await?;

    let _ = state
        .bus
        .publish(Topic::Channels, "channel.updated", updated.id, ChannelUpdateEvent { channel: updated.clone() })
        .await;

    Ok(Json(updated))
}

async fn delete_channel(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(channel_id): Path<Id>,
) -> Result<impl IntoResponse, ApiError> {
    let channel = queries::get_channel_by_id(&state.db, channel_id).await?.ok_or(ApiError::ChannelNotFound)?;
    state
        .permissions
        .require(Scope { guild_id: channel.guild_id, channel_id: Some(channel_id), user_id }, Permission::ManageChannels)
        .await?;

    queries::delete_channel(&state.db, channel_id).await?;

    let _ = state
        .bus
        .publish(
            Topic::Channels,
            "channel.deleted",
            channel_id,
            ChannelDeleteEvent { id: channel_id, guild_id: channel.guild_id },
        )
        .await;

    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn put_overwrite(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(channel_id): Path<Id>,
    Json(body): Json<PutChannelOverwriteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let channel = queries::get_channel_by_id(&state.db, channel_id).await?.ok_or(ApiError::ChannelNotFound)?;
    state
        .permissions
        .require(Scope { guild_id: channel.guild_id, channel_id: Some(channel_id), user_id }, Permission::ManageRoles)
        .await?;

    if !matches!(body.target_type.as_str(), "role" | "member") {
        return Err(ApiError::InvalidInput("target_type must be 'role' or 'member'".into()));
    }
    if (body.allow.as_permissions() & body.deny.as_permissions()) != Permissions::empty() {
        return Err(ApiError::InvalidInput("allow and deny must not overlap".into()));
    }

    let id = state.ids.generate()?;
    let overwrite = queries::put_channel_overwrite(
        &state.db,
        id,
        channel_id,
        &body.target_type,
        body.target_id,
        body.allow,
        body.deny,
    )
    .await?;

    state.permissions.invalidate(Some(channel.guild_id), Some(channel_id), None).await;

    let _ = state
        .bus
        .publish(
            Topic::Channels,
            "channel.overwrite_updated",
            channel_id,
            ChannelOverwriteUpdateEvent { channel_id, overwrite: overwrite.clone() },
        )
        .await;

    Ok(Json(overwrite))
}

async fn delete_overwrite(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path((channel_id, target_type, target_id)): Path<(Id, String, Id)>,
) -> Result<impl IntoResponse, ApiError> {
    let channel = queries::get_channel_by_id(&state.db, channel_id).await?.ok_or(ApiError::ChannelNotFound)?;
    state
        .permissions
        .require(Scope { guild_id: channel.guild_id, channel_id: Some(channel_id), user_id }, Permission::ManageRoles)
        .await?;

    queries::delete_channel_overwrite(&state.db, channel_id, &target_type, target_id).await?;
    state.permissions.invalidate(Some(channel.guild_id), Some(channel_id), None).await;

    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn list_messages(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(channel_id): Path<Id>,
    Query(query): Query<MessagePageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let channel = queries::get_channel_by_id(&state.db, channel_id).await?.ok_or(ApiError::ChannelNotFound)?;
    let messages = state.messages.list(channel.guild_id, channel_id, user_id, query).await?;
    Ok(Json(messages))
}

async fn create_message(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(channel_id): Path<Id>,
    Json(body): Json<CreateMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let channel = queries::get_channel_by_id(&state.db, channel_id).await?.ok_or(ApiError::ChannelNotFound)?;
    let message = state.messages.create(channel.guild_id, channel_id, user_id, &body.content, body.id).await?;
    Ok(Json(message))
}

async fn update_message(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path((channel_id, message_id)): Path<(Id, Id)>,
    Json(body): Json<UpdateMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let channel = queries::get_channel_by_id(&state.db, channel_id).await?.ok_or(ApiError::ChannelNotFound)?;
    let message = state.messages.update(channel.guild_id, channel_id, message_id, user_id, &body.content).await?;
    Ok(Json(message))
}

async fn delete_message(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path((channel_id, message_id)): Path<(Id, Id)>,
) -> Result<impl IntoResponse, ApiError> {
    let channel = queries::get_channel_by_id(&state.db, channel_id).await?.ok_or(ApiError::ChannelNotFound)?;
    state.messages.delete(channel.guild_id, channel_id, message_id, user_id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}
