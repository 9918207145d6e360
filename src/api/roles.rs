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
use crate::types::entities::{CreateRoleRequest, UpdateRoleRequest};
use crate::types::events::{MemberRoleUpdateEvent, RoleCreateEvent, RoleDeleteEvent, RoleUpdateEvent};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/:guild_id/roles", get(list_roles).post(create_role))
        .route("/:guild_id/roles/:role_id", axum::routing::patch(update_role).delete(delete_role))
        .route(
            "/:guild_id/members/:user_id/roles/:role_id",
            axum::routing::put(assign_role).delete(remove_role),
        )
}

async fn list_roles(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(guild_id): Path<Id>,
) -> Result<impl IntoResponse, ApiError> {
    queries::get_guild_member(&state.db, guild_id, user_id).await?.ok_or(ApiError::GuildNotFound)?;
    let roles = queries::get_guild_roles(&state.db, guild_id).await?;
    Ok(Json(roles))
}

async fn create_role(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path(guild_id): Path<Id>,
    Json(body): Json<CreateRoleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.permissions.require(Scope { guild_id, channel_id: None, user_id }, Permission::ManageRoles).await?;

    let name = body.name.trim();
    if name.is_empty() {
        return Err(ApiError::InvalidInput("role name must not be empty".into()));
    }

    let existing = queries::get_guild_roles(&state.db, guild_id).await?;
    let position = existing.len() as i32;

    let role_id = state.ids.generate()?;
    let role = queries::create_role(
        &state.db,
        role_id,
        guild_id,
        name,
        body.permissions.unwrap_or_default(),
        false,
        position,
    )
    .await?;
    // `create_role`'s COALESCE-free insert doesn't take a color, so a
    // non-default color is a follow-up update.
    let role = if let Some(color) = body.color {
        queries::update_role(&state.db, role.id, None, Some(color), None, None, None).await?
    } else {
        role
    };

    let _ = state
        .bus
        .publish(Topic::Guilds, "role.created", role.id, RoleCreateEvent { guild_id, role: role.clone() })
        .await;

    Ok(Json(role))
}

async fn update_role(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path((guild_id, role_id)): Path<(Id, Id)>,
    Json(body): Json<UpdateRoleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.permissions.require(Scope { guild_id, channel_id: None, user_id }, Permission::ManageRoles).await?;

    let existing = queries::get_role_by_id(&state.db, role_id).await?.ok_or(ApiError::NotFound("Role"))?;
    if existing.guild_id != guild_id {
        return Err(ApiError::NotFound("Role"));
    }
    if existing.is_default && (body.name.is_some() || body.permissions.is_some()) {
        return Err(ApiError::CannotModifyEveryone);
    }

    let name = body.name.as_deref().map(str::trim);
    if matches!(name, Some("")) {
        return Err(ApiError::InvalidInput("role name must not be empty".into()));
    }

    let role =
        queries::update_role(&state.db, role_id, name, body.color, body.position, body.permissions, body.mentionable)
            .await?;

    state.permissions.invalidate(Some(guild_id), None, None).await;

    let _ = state
        .bus
        .publish(Topic::Guilds, "role.updated", role.id, RoleUpdateEvent { guild_id, role: role.clone() })
        .await;

    Ok(Json(role))
}

async fn delete_role(
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
    Path((guild_id, role_id)): Path<(Id, Id)>,
) -> Result<impl IntoResponse, ApiError> {
    state.permissions.require(Scope { guild_id, channel_id: None, user_id }, Permission::ManageRoles).await?;

    let existing = queries::get_role_by_id(&state.db, role_id).await?.ok_or(ApiError::NotFound("Role"))?;
    if existing.guild_id != guild_id {
        return Err(ApiError::NotFound("Role"));
    }
    if existing.is_default {
        return Err(ApiError::CannotModifyEveryone);
    }

    queries::delete_role(&state.db, role_id).await?;
    state.permissions.invalidate(Some(guild_id), None, None).await;

    let _ =
        state.bus.publish(Topic::Guilds, "role.deleted", role_id, RoleDeleteEvent { guild_id, role_id }).await;

    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn assign_role(
    State(state): State<AppState>,
    AuthUser { user_id: actor_id }: AuthUser,
    Path((guild_id, target_user_id, role_id)): Path<(Id, Id, Id)>,
) -> Result<impl IntoResponse, ApiError> {
    state.permissions.require(Scope { guild_id, channel_id: None, user_id: actor_id }, Permission::ManageRoles).await?;

    let role = queries::get_role_by_id(&state.db, role_id).await?.ok_or(ApiError::NotFound("Role"))?;
    if role.guild_id != guild_id {
        return Err(ApiError::NotFound("Role"));
    }
    queries::get_guild_member(&state.db, guild_id, target_user_id).await?.ok_or(ApiError::NotFound("Member"))?;

    let mut role_ids = queries::get_member_role_ids(&state.db, guild_id, target_user_id).await?;
    if !role_ids.contains(&role_id) {
        role_ids.push(role_id);
        queries::set_member_roles(&state.db, guild_id, target_user_id, &role_ids).await?;
        state.permissions.invalidate(Some(guild_id), None, Some(target_user_id)).await;

        let _ = state
            .bus
            .publish(
                Topic::Members,
                "member_roles.updated",
                target_user_id,
                MemberRoleUpdateEvent { guild_id, user_id: target_user_id, role_ids: role_ids.clone() },
            )
            .await;
    }

    Ok(Json(role_ids))
}

async fn remove_role(
    State(state): State<AppState>,
    AuthUser { user_id: actor_id }: AuthUser,
    Path((guild_id, target_user_id, role_id)): Path<(Id, Id, Id)>,
) -> Result<impl IntoResponse, ApiError> {
    state.permissions.require(Scope { guild_id, channel_id: None, user_id: actor_id }, Permission::ManageRoles).await?;

    let mut role_ids = queries::get_member_role_ids(&state.db, guild_id, target_user_id).await?;
    let before = role_ids.len();
    role_ids.retain(|id| *id != role_id);
    if role_ids.len() != before {
        queries::set_member_roles(&state.db, guild_id, target_user_id, &role_ids).await?;
        state.permissions.invalidate(Some(guild_id), None, Some(target_user_id)).await;

        let _ = state
            .bus
            .publish(
                Topic::Members,
                "member_roles.updated",
                target_user_id,
                MemberRoleUpdateEvent { guild_id, user_id: target_user_id, role_ids: role_ids.clone() },
            )
            .await;
    }

    Ok(Json(role_ids))
}
