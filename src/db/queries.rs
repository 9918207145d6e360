use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::permissions::PermissionBits;
use crate::snowflake::Id;
use crate::types::entities::{
    Ban, Channel, ChannelOverwrite, ChannelType, Guild, GuildMember, Invite, Message, Role,
    Session, User,
};

// ── Users ──────────────────────────────────────────────

pub async fn count_users(pool: &PgPool) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users").fetch_one(pool).await?;
    Ok(row.0)
}

pub async fn create_user(
    pool: &PgPool,
    id: Id,
    username: &str,
    email: &str,
    password_hash: &str,
) -> Result<User, sqlx::Error> {
    sqlx::query_as::<_, User>(
        "INSERT INTO users (id, username, email, password_hash) VALUES ($1, $2, $3, $4) RETURNING *",
    )
    .bind(id)
    .bind(username)
    .bind(email)
    .bind(password_hash)
    .fetch_one(pool)
    .await
}

pub async fn get_user_by_id(pool: &PgPool, id: Id) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_user_by_email(pool: &PgPool, email: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
        .bind(email)
        .fetch_optional(pool)
        .await
}

// ── Sessions ───────────────────────────────────────────

pub async fn create_session(
    pool: &PgPool,
    id: Id,
    user_id: Id,
    token_hash: &str,
    expires_at: DateTime<Utc>,
) -> Result<Session, sqlx::Error> {
    sqlx::query_as::<_, Session>(
        "INSERT INTO sessions (id, user_id, token_hash, revoked, expires_at) VALUES ($1, $2, $3, false, $4) RETURNING *",
    )
    .bind(id)
    .bind(user_id)
    .bind(token_hash)
    .bind(expires_at)
    .fetch_one(pool)
    .await
}

pub async fn get_session_by_id(pool: &PgPool, id: Id) -> Result<Option<Session>, sqlx::Error> {
    sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_session_by_token_hash(pool: &PgPool, token_hash: &str) -> Result<Option<Session>, sqlx::Error> {
    sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE token_hash = $1 AND NOT revoked")
        .bind(token_hash)
        .fetch_optional(pool)
        .await
}

pub async fn revoke_session(pool: &PgPool, id: Id) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE sessions SET revoked = true WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn revoke_all_sessions(pool: &PgPool, user_id: Id) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE sessions SET revoked = true WHERE user_id = $1")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_session(pool: &PgPool, id: Id) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM sessions WHERE id = $1").bind(id).execute(pool).await?;
    Ok(())
}

// ── Guilds ───────────────────────────────────────────────

pub async fn create_guild(pool: &PgPool, id: Id, name: &str, owner_id: Id) -> Result<Guild, sqlx::Error> {
    sqlx::query_as::<_, Guild>(
        "INSERT INTO guilds (id, name, owner_id) VALUES ($1, $2, $3) RETURNING *",
    )
    .bind(id)
    .bind(name)
    .bind(owner_id)
    .fetch_one(pool)
    .await
}

pub async fn get_guild_by_id(pool: &PgPool, id: Id) -> Result<Option<Guild>, sqlx::Error> {
    sqlx::query_as::<_, Guild>("SELECT * FROM guilds WHERE id = $1 AND deleted_at IS NULL")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_guild_owner_id(pool: &PgPool, guild_id: Id) -> Result<Option<Id>, sqlx::Error> {
    let row: Option<(Id,)> = sqlx::query_as("SELECT owner_id FROM guilds WHERE id = $1 AND deleted_at IS NULL")
        .bind(guild_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.0))
}

pub async fn update_guild_default_channel(pool: &PgPool, guild_id: Id, channel_id: Id) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE guilds SET default_channel_id = $2, updated_at = now() WHERE id = $1")
        .bind(guild_id)
        .bind(channel_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_guild(
    pool: &PgPool,
    guild_id: Id,
    name: Option<&str>,
) -> Result<Guild, sqlx::Error> {
    sqlx::query_as::<_, Guild>(
        "UPDATE guilds SET name = COALESCE($2, name), updated_at = now()
         WHERE id = $1 AND deleted_at IS NULL RETURNING *",
    )
    .bind(guild_id)
    .bind(name)
    .fetch_one(pool)
    .await
}

/// Soft-delete: the row stays (channels/messages keep their foreign keys
/// intact) but every read filters `deleted_at IS NULL`.
pub async fn delete_guild(pool: &PgPool, guild_id: Id) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE guilds SET deleted_at = now() WHERE id = $1")
        .bind(guild_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_user_guilds(pool: &PgPool, user_id: Id) -> Result<Vec<Guild>, sqlx::Error> {
    sqlx::query_as::<_, Guild>(
        "SELECT g.* FROM guilds g JOIN guild_members m ON m.guild_id = g.id
         WHERE m.user_id = $1 AND g.deleted_at IS NULL",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
}

// ── Guild members ────────────────────────────────────────

pub async fn add_guild_member(pool: &PgPool, guild_id: Id, user_id: Id) -> Result<GuildMember, sqlx::Error> {
    sqlx::query_as::<_, GuildMember>(
        "INSERT INTO guild_members (guild_id, user_id) VALUES ($1, $2) RETURNING *",
    )
    .bind(guild_id)
    .bind(user_id)
    .fetch_one(pool)
    .await
}

pub async fn get_guild_member(pool: &PgPool, guild_id: Id, user_id: Id) -> Result<Option<GuildMember>, sqlx::Error> {
    sqlx::query_as::<_, GuildMember>("SELECT * FROM guild_members WHERE guild_id = $1 AND user_id = $2")
        .bind(guild_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await
}

pub async fn get_guild_members(pool: &PgPool, guild_id: Id) -> Result<Vec<GuildMember>, sqlx::Error> {
    sqlx::query_as::<_, GuildMember>("SELECT * FROM guild_members WHERE guild_id = $1")
        .bind(guild_id)
        .fetch_all(pool)
        .await
}

pub async fn remove_guild_member(pool: &PgPool, guild_id: Id, user_id: Id) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM guild_members WHERE guild_id = $1 AND user_id = $2")
        .bind(guild_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ── Roles ────────────────────────────────────────────────

pub async fn create_role(
    pool: &PgPool,
    id: Id,
    guild_id: Id,
    name: &str,
    permissions: PermissionBits,
    is_default: bool,
    position: i32,
) -> Result<Role, sqlx::Error> {
    sqlx::query_as::<_, Role>(
        "INSERT INTO roles (id, guild_id, name, color, hoist, position, permissions, mentionable, is_default)
         VALUES ($1, $2, $3, 0, false, $4, $5, false, $6) RETURNING *",
    )
    .bind(id)
    .bind(guild_id)
    .bind(name)
    .bind(position)
    .bind(permissions)
    .bind(is_default)
    .fetch_one(pool)
    .await
}

pub async fn get_guild_roles(pool: &PgPool, guild_id: Id) -> Result<Vec<Role>, sqlx::Error> {
    sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE guild_id = $1 ORDER BY position")
        .bind(guild_id)
        .fetch_all(pool)
        .await
}

pub async fn get_role_by_id(pool: &PgPool, role_id: Id) -> Result<Option<Role>, sqlx::Error> {
    sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE id = $1")
        .bind(role_id)
        .fetch_optional(pool)
        .await
}

pub async fn update_role(
    pool: &PgPool,
    role_id: Id,
    name: Option<&str>,
    color: Option<i32>,
    position: Option<i32>,
    permissions: Option<PermissionBits>,
    mentionable: Option<bool>,
) -> Result<Role, sqlx::Error> {
    sqlx::query_as::<_, Role>(
        "UPDATE roles SET
            name = COALESCE($2, name),
            color = COALESCE($3, color),
            position = COALESCE($4, position),
            permissions = COALESCE($5, permissions),
            mentionable = COALESCE($6, mentionable)
         WHERE id = $1 RETURNING *",
    )
    .bind(role_id)
    .bind(name)
    .bind(color)
    .bind(position)
    .bind(permissions)
    .bind(mentionable)
    .fetch_one(pool)
    .await
}

pub async fn delete_role(pool: &PgPool, role_id: Id) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM roles WHERE id = $1").bind(role_id).execute(pool).await?;
    Ok(())
}

pub async fn get_member_role_ids(pool: &PgPool, guild_id: Id, user_id: Id) -> Result<Vec<Id>, sqlx::Error> {
    let rows: Vec<(Id,)> = sqlx::query_as(
        "SELECT role_id FROM member_roles WHERE guild_id = $1 AND user_id = $2",
    )
    .bind(guild_id)
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn set_member_roles(pool: &PgPool, guild_id: Id, user_id: Id, role_ids: &[Id]) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM member_roles WHERE guild_id = $1 AND user_id = $2")
        .bind(guild_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    for role_id in role_ids {
        sqlx::query("INSERT INTO member_roles (guild_id, user_id, role_id) VALUES ($1, $2, $3)")
            .bind(guild_id)
            .bind(user_id)
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

// ── Channels ───────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub async fn create_channel(
    pool: &PgPool,
    id: Id,
    guild_id: Id,
    channel_type: ChannelType,
    name: &str,
    topic: Option<&str>,
    parent_id: Option<Id>,
    position: i32,
) -> Result<Channel, sqlx::Error> {
    sqlx::query_as::<_, Channel>(
        "INSERT INTO channels (id, guild_id, parent_id, channel_type, name, topic, position)
         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING *",
    )
    .bind(id)
    .bind(guild_id)
    .bind(parent_id)
    .bind(channel_type)
    .bind(name)
    .bind(topic)
    .bind(position)
    .fetch_one(pool)
    .await
}

/// A soft-deleted guild's channels are invisible to every caller: the join
/// excludes them so callers see a plain 404 instead of having to check the
/// parent guild separately.
pub async fn get_channel_by_id(pool: &PgPool, channel_id: Id) -> Result<Option<Channel>, sqlx::Error> {
    sqlx::query_as::<_, Channel>(
        "SELECT c.* FROM channels c
         JOIN guilds g ON g.id = c.guild_id
         WHERE c.id = $1 AND g.deleted_at IS NULL",
    )
    .bind(channel_id)
    .fetch_optional(pool)
    .await
}

pub async fn get_guild_channels(pool: &PgPool, guild_id: Id) -> Result<Vec<Channel>, sqlx::Error> {
    sqlx::query_as::<_, Channel>("SELECT * FROM channels WHERE guild_id = $1 ORDER BY position")
        .bind(guild_id)
        .fetch_all(pool)
        .await
}

pub async fn update_channel(
    pool: &PgPool,
    channel_id: Id,
    name: Option<&str>,
    topic: Option<&str>,
    position: Option<i32>,
) -> Result<Channel, sqlx::Error> {
    sqlx::query_as::<_, Channel>(
        "UPDATE channels SET
            name = COALESCE($2, name),
            topic = COALESCE($3, topic),
            position = COALESCE($4, position),
            updated_at = now()
         WHERE id = $1 RETURNING *",
    )
    .bind(channel_id)
    .bind(name)
    .bind(topic)
    .bind(position)
    .fetch_one(pool)
    .await
}

pub async fn delete_channel(pool: &PgPool, channel_id: Id) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM channels WHERE id = $1").bind(channel_id).execute(pool).await?;
    Ok(())
}

// ── Channel overwrites ──────────────────────────────────

pub async fn get_channel_overwrites(pool: &PgPool, channel_id: Id) -> Result<Vec<ChannelOverwrite>, sqlx::Error> {
    sqlx::query_as::<_, ChannelOverwrite>("SELECT * FROM channel_overwrites WHERE channel_id = $1")
        .bind(channel_id)
        .fetch_all(pool)
        .await
}

pub async fn put_channel_overwrite(
    pool: &PgPool,
    id: Id,
    channel_id: Id,
    target_type: &str,
    target_id: Id,
    allow: PermissionBits,
    deny: PermissionBits,
) -> Result<ChannelOverwrite, sqlx::Error> {
    sqlx::query_as::<_, ChannelOverwrite>(
        "INSERT INTO channel_overwrites (id, channel_id, target_type, target_id, allow, deny)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (channel_id, target_type, target_id)
         DO UPDATE SET allow = EXCLUDED.allow, deny = EXCLUDED.deny
         RETURNING *",
    )
    .bind(id)
    .bind(channel_id)
    .bind(target_type)
    .bind(target_id)
    .bind(allow)
    .bind(deny)
    .fetch_one(pool)
    .await
}

pub async fn delete_channel_overwrite(pool: &PgPool, channel_id: Id, target_type: &str, target_id: Id) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM channel_overwrites WHERE channel_id = $1 AND target_type = $2 AND target_id = $3")
        .bind(channel_id)
        .bind(target_type)
        .bind(target_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ── Messages ───────────────────────────────────────────

/// Idempotent on `id`: a retried create with the same id is a no-op
/// (`ON CONFLICT (id) DO NOTHING`) and returns `None` so the caller can
/// distinguish a fresh insert (publish the event) from a replay (don't).
#[allow(clippy::too_many_arguments)]
pub async fn create_message(
    pool: &PgPool,
    id: Id,
    channel_id: Id,
    author_id: Id,
    content: &str,
    mentions: &[Id],
    mention_roles: &[Id],
) -> Result<Option<Message>, sqlx::Error> {
    sqlx::query_as::<_, Message>(
        "INSERT INTO messages (id, channel_id, author_id, content, mentions, mention_roles)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (id) DO NOTHING
         RETURNING *",
    )
    .bind(id)
    .bind(channel_id)
    .bind(author_id)
    .bind(content)
    .bind(mentions)
    .bind(mention_roles)
    .fetch_optional(pool)
    .await
}

pub async fn get_message_by_id(pool: &PgPool, message_id: Id) -> Result<Option<Message>, sqlx::Error> {
    sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = $1 AND deleted_at IS NULL")
        .bind(message_id)
        .fetch_optional(pool)
        .await
}

/// Same lookup, but visible regardless of `deleted_at` — used to resolve a
/// `create_message` conflict, where the original row could in principle
/// already be soft-deleted by the time a retry lands.
pub async fn get_message_by_id_any(pool: &PgPool, message_id: Id) -> Result<Option<Message>, sqlx::Error> {
    sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = $1")
        .bind(message_id)
        .fetch_optional(pool)
        .await
}

/// Cursors compare `(created_at, id)` as a composite key, not `id` alone —
/// the log is expected to sit behind partitioning where only `created_at`
/// is guaranteed monotonic per partition, so ordering must follow both.
/// The cursor message's own `created_at` is looked up regardless of its
/// `deleted_at` status; a soft-deleted message still anchors a stable page.
pub async fn list_messages_before(pool: &PgPool, channel_id: Id, before: Id, limit: i64) -> Result<Vec<Message>, sqlx::Error> {
    sqlx::query_as::<_, Message>(
        "SELECT * FROM messages
         WHERE channel_id = $1 AND deleted_at IS NULL
           AND (created_at, id) < (SELECT created_at, id FROM messages WHERE id = $2)
         ORDER BY created_at DESC, id DESC LIMIT $3",
    )
    .bind(channel_id)
    .bind(before)
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn list_messages_after(pool: &PgPool, channel_id: Id, after: Id, limit: i64) -> Result<Vec<Message>, sqlx::Error> {
    sqlx::query_as::<_, Message>(
        "SELECT * FROM messages
         WHERE channel_id = $1 AND deleted_at IS NULL
           AND (created_at, id) > (SELECT created_at, id FROM messages WHERE id = $2)
         ORDER BY created_at ASC, id ASC LIMIT $3",
    )
    .bind(channel_id)
    .bind(after)
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn list_messages_latest(pool: &PgPool, channel_id: Id, limit: i64) -> Result<Vec<Message>, sqlx::Error> {
    sqlx::query_as::<_, Message>(
        "SELECT * FROM messages WHERE channel_id = $1 AND deleted_at IS NULL
         ORDER BY created_at DESC, id DESC LIMIT $2",
    )
    .bind(channel_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Optimistic update: only applies if the row hasn't changed since
/// `expected_edited_at` was last observed by the caller.
pub async fn update_message(
    pool: &PgPool,
    message_id: Id,
    content: &str,
    mentions: &[Id],
    mention_roles: &[Id],
    expected_edited_at: Option<DateTime<Utc>>,
) -> Result<Option<Message>, sqlx::Error> {
    sqlx::query_as::<_, Message>(
        "UPDATE messages SET content = $2, mentions = $3, mention_roles = $4, edited_at = now()
         WHERE id = $1 AND deleted_at IS NULL
           AND edited_at IS NOT DISTINCT FROM $5
         RETURNING *",
    )
    .bind(message_id)
    .bind(content)
    .bind(mentions)
    .bind(mention_roles)
    .bind(expected_edited_at)
    .fetch_optional(pool)
    .await
}

pub async fn soft_delete_message(pool: &PgPool, message_id: Id) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE messages SET deleted_at = now() WHERE id = $1")
        .bind(message_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ── Invites ─────────────────────────────────────────────

pub async fn create_invite(
    pool: &PgPool,
    id: Id,
    guild_id: Id,
    channel_id: Id,
    creator_id: Id,
    code: &str,
    max_uses: Option<i32>,
    expires_at: Option<DateTime<Utc>>,
) -> Result<Invite, sqlx::Error> {
    sqlx::query_as::<_, Invite>(
        "INSERT INTO invites (id, guild_id, channel_id, creator_id, code, max_uses, uses, expires_at)
         VALUES ($1, $2, $3, $4, $5, $6, 0, $7) RETURNING *",
    )
    .bind(id)
    .bind(guild_id)
    .bind(channel_id)
    .bind(creator_id)
    .bind(code)
    .bind(max_uses)
    .bind(expires_at)
    .fetch_one(pool)
    .await
}

pub async fn get_invite_by_code(pool: &PgPool, code: &str) -> Result<Option<Invite>, sqlx::Error> {
    sqlx::query_as::<_, Invite>("SELECT * FROM invites WHERE code = $1")
        .bind(code)
        .fetch_optional(pool)
        .await
}

pub async fn increment_invite_uses(pool: &PgPool, code: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE invites SET uses = uses + 1 WHERE code = $1")
        .bind(code)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_invite(pool: &PgPool, code: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM invites WHERE code = $1").bind(code).execute(pool).await?;
    Ok(())
}

pub async fn get_guild_invites(pool: &PgPool, guild_id: Id) -> Result<Vec<Invite>, sqlx::Error> {
    sqlx::query_as::<_, Invite>("SELECT * FROM invites WHERE guild_id = $1")
        .bind(guild_id)
        .fetch_all(pool)
        .await
}

// ── Bans ────────────────────────────────────────────────

pub async fn create_ban(pool: &PgPool, guild_id: Id, user_id: Id, moderator_id: Id, reason: Option<&str>) -> Result<Ban, sqlx::Error> {
    sqlx::query_as::<_, Ban>(
        "INSERT INTO guild_bans (guild_id, user_id, moderator_id, reason) VALUES ($1, $2, $3, $4) RETURNING *",
    )
    .bind(guild_id)
    .bind(user_id)
    .bind(moderator_id)
    .bind(reason)
    .fetch_one(pool)
    .await
}

pub async fn get_ban(pool: &PgPool, guild_id: Id, user_id: Id) -> Result<Option<Ban>, sqlx::Error> {
    sqlx::query_as::<_, Ban>("SELECT * FROM guild_bans WHERE guild_id = $1 AND user_id = $2")
        .bind(guild_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await
}

pub async fn get_guild_bans(pool: &PgPool, guild_id: Id) -> Result<Vec<Ban>, sqlx::Error> {
    sqlx::query_as::<_, Ban>("SELECT * FROM guild_bans WHERE guild_id = $1")
        .bind(guild_id)
        .fetch_all(pool)
        .await
}

pub async fn delete_ban(pool: &PgPool, guild_id: Id, user_id: Id) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM guild_bans WHERE guild_id = $1 AND user_id = $2")
        .bind(guild_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}
