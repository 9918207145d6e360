use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::permissions::{PermissionBits, Permissions};
use crate::snowflake::Id;

// ── Users ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Id,
    pub username: String,
    pub display_name: Option<String>,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub user: PublicUser,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
}

/// User data safe to send to other users (no email, no password hash).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicUser {
    pub id: Id,
    pub username: String,
    pub display_name: Option<String>,
}

impl From<User> for PublicUser {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            username: u.username,
            display_name: u.display_name,
        }
    }
}

// ── Sessions ───────────────────────────────────────────

#[derive(Debug, Clone, FromRow)]
pub struct Session {
    pub id: Id,
    pub user_id: Id,
    pub token_hash: String,
    pub revoked: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ── Guilds ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Guild {
    pub id: Id,
    pub name: String,
    pub owner_id: Id,
    pub default_channel_id: Option<Id>,
    #[serde(skip_serializing)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateGuildRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateGuildRequest {
    pub name: Option<String>,
}

// ── Channels ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "channel_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Text,
    Category,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Channel {
    pub id: Id,
    pub guild_id: Id,
    pub parent_id: Option<Id>,
    pub channel_type: ChannelType,
    pub name: String,
    pub topic: Option<String>,
    pub position: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Channel overwrites ──────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChannelOverwrite {
    pub id: Id,
    pub channel_id: Id,
    pub target_type: String,
    pub target_id: Id,
    pub allow: PermissionBits,
    pub deny: PermissionBits,
}

impl ChannelOverwrite {
    pub fn is_role(&self) -> bool {
        self.target_type == "role"
    }

    pub fn allow(&self) -> Permissions {
        self.allow.as_permissions()
    }

    pub fn deny(&self) -> Permissions {
        self.deny.as_permissions()
    }
}

#[derive(Debug, Deserialize)]
pub struct PutChannelOverwriteRequest {
    pub target_type: String,
    pub target_id: Id,
    pub allow: PermissionBits,
    pub deny: PermissionBits,
}

#[derive(Debug, Deserialize)]
pub struct CreateChannelRequest {
    pub name: String,
    pub channel_type: Option<ChannelType>,
    pub topic: Option<String>,
    pub parent_id: Option<Id>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateChannelRequest {
    pub name: Option<String>,
    pub topic: Option<String>,
    pub position: Option<i32>,
}

// ── Guild members ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GuildMember {
    pub guild_id: Id,
    pub user_id: Id,
    pub nickname: Option<String>,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuildMemberWithUser {
    pub guild_id: Id,
    pub user_id: Id,
    pub nickname: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub user: PublicUser,
    pub role_ids: Vec<Id>,
}

// ── Roles ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub id: Id,
    pub guild_id: Id,
    pub name: String,
    pub color: i32,
    pub hoist: bool,
    pub position: i32,
    pub permissions: PermissionBits,
    pub mentionable: bool,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

impl Role {
    pub fn permissions(&self) -> Permissions {
        self.permissions.as_permissions()
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateRoleRequest {
    pub name: String,
    pub color: Option<i32>,
    pub permissions: Option<PermissionBits>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoleRequest {
    pub name: Option<String>,
    pub color: Option<i32>,
    pub position: Option<i32>,
    pub permissions: Option<PermissionBits>,
    pub mentionable: Option<bool>,
}

// ── Messages ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: Id,
    pub channel_id: Id,
    pub author_id: Id,
    pub content: String,
    pub mentions: Vec<Id>,
    pub mention_roles: Vec<Id>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateMessageRequest {
    pub content: String,
    /// Client-supplied message id for idempotent retries; when omitted the
    /// server mints one. A retry must reuse the id from the first attempt.
    pub id: Option<Id>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMessageRequest {
    pub content: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct MessagePageQuery {
    pub before: Option<Id>,
    pub after: Option<Id>,
    pub limit: Option<i64>,
}

// ── Invites ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invite {
    pub id: Id,
    pub guild_id: Id,
    pub channel_id: Id,
    pub creator_id: Id,
    pub code: String,
    pub max_uses: Option<i32>,
    pub uses: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateInviteRequest {
    pub max_uses: Option<i32>,
    pub max_age_secs: Option<i64>,
}

// ── Bans ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Ban {
    pub guild_id: Id,
    pub user_id: Id,
    pub moderator_id: Id,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BanWithUser {
    #[serde(flatten)]
    pub ban: Ban,
    pub user: PublicUser,
}

#[derive(Debug, Deserialize)]
pub struct CreateBanRequest {
    pub reason: Option<String>,
}
