//! Permission algebra and caching.
//!
//! `Permissions` is the 64-bit bitset; `PermissionEngine` computes effective
//! permissions for a `(guild, channel, user)` scope, layering overwrites in
//! the fixed order @everyone → role union → member override, and caches the
//! result in Redis with TTL + event-driven invalidation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use redis::AsyncCommands;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::PgPool;

use crate::db::queries;
use crate::error::ApiError;
use crate::snowflake::Id;
use crate::types::entities::{ChannelOverwrite, Role};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Permissions: u64 {
        const VIEW_CHANNEL          = 1 << 0;
        const SEND_MESSAGES         = 1 << 1;
        const READ_MESSAGE_HISTORY  = 1 << 2;
        const MANAGE_MESSAGES       = 1 << 3;
        const MANAGE_CHANNELS       = 1 << 4;
        const MANAGE_GUILD          = 1 << 5;
        const MANAGE_ROLES          = 1 << 6;
        const KICK_MEMBERS          = 1 << 7;
        const BAN_MEMBERS           = 1 << 8;
        const CREATE_INVITES        = 1 << 9;
        const ADMINISTRATOR         = 1 << 10;
        // bits 11..63 reserved for future extension.
    }
}

impl Default for Permissions {
    /// Default grant for the @everyone role in a newly created guild.
    fn default() -> Self {
        Self::VIEW_CHANNEL | Self::SEND_MESSAGES | Self::READ_MESSAGE_HISTORY | Self::CREATE_INVITES
    }
}

/// A stored permission bitset. Serializes to/from a decimal string at every
/// external boundary, the same discipline `snowflake::Id` uses, so a high
/// permission bit never loses precision to JSON's f64 number range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PermissionBits(pub i64);

impl PermissionBits {
    pub fn as_permissions(self) -> Permissions {
        Permissions::from_bits_truncate(self.0 as u64)
    }
}

impl From<Permissions> for PermissionBits {
    fn from(perms: Permissions) -> Self {
        PermissionBits(perms.bits() as i64)
    }
}

impl From<i64> for PermissionBits {
    fn from(value: i64) -> Self {
        PermissionBits(value)
    }
}

impl From<PermissionBits> for i64 {
    fn from(value: PermissionBits) -> Self {
        value.0
    }
}

impl Serialize for PermissionBits {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PermissionBits {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PermissionBitsVisitor;

        impl Visitor<'_> for PermissionBitsVisitor {
            type Value = PermissionBits;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a decimal-string-encoded 64-bit permission bitset")
            }

            fn visit_str<E>(self, v: &str) -> Result<PermissionBits, E>
            where
                E: de::Error,
            {
                v.parse::<i64>().map(PermissionBits).map_err(de::Error::custom)
            }

            fn visit_i64<E>(self, v: i64) -> Result<PermissionBits, E>
            where
                E: de::Error,
            {
                Ok(PermissionBits(v))
            }

            fn visit_u64<E>(self, v: u64) -> Result<PermissionBits, E>
            where
                E: de::Error,
            {
                Ok(PermissionBits(v as i64))
            }
        }

        deserializer.deserialize_any(PermissionBitsVisitor)
    }
}

/// `sqlx` stores permission bitsets as `BIGINT`; this keeps the bit pattern
/// and reinterprets at the boundary instead of truncating the keyspace.
impl sqlx::Type<sqlx::Postgres> for PermissionBits {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <i64 as sqlx::Type<sqlx::Postgres>>::type_info()
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for PermissionBits {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        <i64 as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for PermissionBits {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let raw = <i64 as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Ok(PermissionBits(raw))
    }
}

/// Single-bit identity of a permission, used where an error needs to name
/// exactly which permission was missing without holding a whole bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ViewChannel,
    SendMessages,
    ReadMessageHistory,
    ManageMessages,
    ManageChannels,
    ManageGuild,
    ManageRoles,
    KickMembers,
    BanMembers,
    CreateInvites,
    Administrator,
}

impl Permission {
    pub fn bit(self) -> Permissions {
        match self {
            Permission::ViewChannel => Permissions::VIEW_CHANNEL,
            Permission::SendMessages => Permissions::SEND_MESSAGES,
            Permission::ReadMessageHistory => Permissions::READ_MESSAGE_HISTORY,
            Permission::ManageMessages => Permissions::MANAGE_MESSAGES,
            Permission::ManageChannels => Permissions::MANAGE_CHANNELS,
            Permission::ManageGuild => Permissions::MANAGE_GUILD,
            Permission::ManageRoles => Permissions::MANAGE_ROLES,
            Permission::KickMembers => Permissions::KICK_MEMBERS,
            Permission::BanMembers => Permissions::BAN_MEMBERS,
            Permission::CreateInvites => Permissions::CREATE_INVITES,
            Permission::Administrator => Permissions::ADMINISTRATOR,
        }
    }
}

/// `(guild_id, channel_id, user_id)` — `channel_id` is `None` for a
/// guild-level (no-overwrite) computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Scope {
    pub guild_id: Id,
    pub channel_id: Option<Id>,
    pub user_id: Id,
}

impl Scope {
    fn cache_key(&self) -> String {
        match self.channel_id {
            Some(channel_id) => format!("perm:{}:{}:{}", self.guild_id, channel_id, self.user_id),
            None => format!("perm:{}:-:{}", self.guild_id, self.user_id),
        }
    }

    /// Index keys whose members list every cache key that must be dropped
    /// when something in this scope's ancestry changes.
    fn index_keys(&self) -> Vec<String> {
        let mut keys = vec![format!("permidx:guild:{}", self.guild_id)];
        if let Some(channel_id) = self.channel_id {
            keys.push(format!("permidx:channel:{}", channel_id));
        }
        keys.push(format!("permidx:user:{}", self.user_id));
        keys
    }
}

#[derive(Clone)]
pub struct PermissionEngine {
    db: PgPool,
    redis: redis::aio::ConnectionManager,
    ttl: Duration,
}

impl PermissionEngine {
    pub fn new(db: PgPool, redis: redis::aio::ConnectionManager, ttl_secs: u64) -> Self {
        Self {
            db,
            redis,
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    /// Effective permissions for `scope`, populated from cache when present.
    pub async fn compute(&self, scope: Scope) -> Result<Permissions, ApiError> {
        if let Some(cached) = self.read_cache(&scope).await {
            return Ok(cached);
        }

        let owner_id = queries::get_guild_owner_id(&self.db, scope.guild_id).await?.ok_or(ApiError::GuildNotFound)?;
        if scope.user_id == owner_id {
            let perms = Permissions::all();
            self.populate_cache(&scope, perms).await;
            return Ok(perms);
        }

        let roles = queries::get_guild_roles(&self.db, scope.guild_id).await?;
        let member_role_ids = queries::get_member_role_ids(&self.db, scope.guild_id, scope.user_id).await?;
        let mut perms = base_permissions(&roles, &member_role_ids);

        if let Some(channel_id) = scope.channel_id {
            if !perms.contains(Permissions::ADMINISTRATOR) {
                let overwrites = queries::get_channel_overwrites(&self.db, channel_id).await?;
                perms = apply_overwrites(perms, &roles, &member_role_ids, &overwrites, scope.user_id);
            }
        }

        if perms.contains(Permissions::ADMINISTRATOR) {
            perms = Permissions::all();
        }

        self.populate_cache(&scope, perms).await;
        Ok(perms)
    }

    pub async fn has(&self, scope: Scope, permission: Permission) -> Result<bool, ApiError> {
        Ok(self.compute(scope).await?.contains(permission.bit()))
    }

    pub async fn require(&self, scope: Scope, permission: Permission) -> Result<(), ApiError> {
        if self.has(scope, permission).await? {
            Ok(())
        } else {
            Err(ApiError::MissingPermission(permission))
        }
    }

    /// Drop every cached computation touching `guild_id`, `channel_id`, or
    /// `user_id`. Called inline from the same request that changed a role,
    /// overwrite, or member-role assignment, since the cache is shared
    /// across instances and needs no separate propagation step.
    pub async fn invalidate(&self, guild_id: Option<Id>, channel_id: Option<Id>, user_id: Option<Id>) {
        let mut conn = self.redis.clone();
        let mut index_keys = Vec::new();
        if let Some(guild_id) = guild_id {
            index_keys.push(format!("permidx:guild:{guild_id}"));
        }
        if let Some(channel_id) = channel_id {
            index_keys.push(format!("permidx:channel:{channel_id}"));
        }
        if let Some(user_id) = user_id {
            index_keys.push(format!("permidx:user:{user_id}"));
        }

        for index_key in index_keys {
            let members: Vec<String> = match conn.smembers(&index_key).await {
                Ok(members) => members,
                Err(e) => {
                    tracing::warn!(error = %e, %index_key, "failed to read permission cache index");
                    continue;
                }
            };
            if members.is_empty() {
                continue;
            }
            if let Err(e) = conn.del::<_, ()>(&members).await {
                tracing::warn!(error = %e, "failed to delete cached permission entries");
            }
            if let Err(e) = conn.del::<_, ()>(&index_key).await {
                tracing::warn!(error = %e, %index_key, "failed to clear permission cache index");
            }
        }
    }

    async fn read_cache(&self, scope: &Scope) -> Option<Permissions> {
        let mut conn = self.redis.clone();
        let raw: Option<u64> = conn.get(scope.cache_key()).await.ok()?;
        raw.map(Permissions::from_bits_truncate)
    }

    async fn populate_cache(&self, scope: &Scope, perms: Permissions) {
        let mut conn = self.redis.clone();
        let key = scope.cache_key();
        if let Err(e) = conn
            .set_ex::<_, _, ()>(&key, perms.bits(), self.ttl.as_secs())
            .await
        {
            tracing::warn!(error = %e, "failed to populate permission cache");
            return;
        }
        for index_key in scope.index_keys() {
            if let Err(e) = conn.sadd::<_, _, ()>(&index_key, &key).await {
                tracing::warn!(error = %e, %index_key, "failed to index permission cache entry");
            }
        }
    }
}

/// @everyone permissions unioned with every role the member holds.
/// Administrator short-circuits to the full bitset.
fn base_permissions(roles: &[Role], member_role_ids: &[Id]) -> Permissions {
    let everyone = roles
        .iter()
        .find(|r| r.is_default)
        .map(|r| r.permissions())
        .unwrap_or(Permissions::empty());

    let mut perms = everyone;
    for role in roles {
        if member_role_ids.contains(&role.id) {
            perms |= role.permissions();
        }
    }

    if perms.contains(Permissions::ADMINISTRATOR) {
        return Permissions::all();
    }
    perms
}

/// Layers channel overwrites onto `base` in order: @everyone, then the
/// union of the member's role overwrites, then the member-specific one.
fn apply_overwrites(
    base: Permissions,
    roles: &[Role],
    member_role_ids: &[Id],
    overwrites: &[ChannelOverwrite],
    user_id: Id,
) -> Permissions {
    let mut perms = base;
    let everyone_role_id = roles.iter().find(|r| r.is_default).map(|r| r.id);

    if let Some(everyone_id) = everyone_role_id {
        if let Some(ov) = overwrites.iter().find(|o| o.is_role() && o.target_id == everyone_id) {
            perms = (perms & !ov.deny()) | ov.allow();
        }
    }

    let mut role_allow = Permissions::empty();
    let mut role_deny = Permissions::empty();
    for ov in overwrites {
        if ov.is_role() && Some(ov.target_id) != everyone_role_id && member_role_ids.contains(&ov.target_id) {
            role_allow |= ov.allow();
            role_deny |= ov.deny();
        }
    }
    perms = (perms & !role_deny) | role_allow;

    if let Some(ov) = overwrites.iter().find(|o| !o.is_role() && o.target_id == user_id) {
        perms = (perms & !ov.deny()) | ov.allow();
    }

    perms
}

pub type SharedPermissionEngine = Arc<PermissionEngine>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn role(id: u64, permissions: Permissions, is_default: bool) -> Role {
        Role {
            id: Id(id),
            guild_id: Id(1),
            name: "test".into(),
            color: 0,
            hoist: false,
            position: 0,
            permissions: permissions.into(),
            mentionable: false,
            is_default,
            created_at: Utc::now(),
        }
    }

    fn overwrite(id: u64, is_role: bool, target_id: Id, allow: Permissions, deny: Permissions) -> ChannelOverwrite {
        ChannelOverwrite {
            id: Id(id),
            channel_id: Id(900),
            target_type: if is_role { "role".into() } else { "member".into() },
            target_id,
            allow: allow.into(),
            deny: deny.into(),
        }
    }

    #[test]
    fn base_permissions_is_everyone_only_with_no_extra_roles() {
        let everyone = Id(1);
        let roles = vec![role(1, Permissions::VIEW_CHANNEL, true)];
        let perms = base_permissions(&roles, &[]);
        assert!(perms.contains(Permissions::VIEW_CHANNEL));
        assert!(!perms.contains(Permissions::SEND_MESSAGES));
        let _ = everyone;
    }

    #[test]
    fn extra_role_is_unioned_with_everyone() {
        let roles = vec![
            role(1, Permissions::VIEW_CHANNEL, true),
            role(2, Permissions::MANAGE_MESSAGES, false),
        ];
        let perms = base_permissions(&roles, &[Id(2)]);
        assert!(perms.contains(Permissions::VIEW_CHANNEL));
        assert!(perms.contains(Permissions::MANAGE_MESSAGES));
    }

    #[test]
    fn administrator_role_grants_everything() {
        let roles = vec![
            role(1, Permissions::VIEW_CHANNEL, true),
            role(2, Permissions::ADMINISTRATOR, false),
        ];
        let perms = base_permissions(&roles, &[Id(2)]);
        assert_eq!(perms, Permissions::all());
    }

    #[test]
    fn everyone_channel_overwrite_denies() {
        let everyone_id = Id(1);
        let roles = vec![role(1, Permissions::VIEW_CHANNEL | Permissions::SEND_MESSAGES, true)];
        let overwrites = vec![overwrite(1, true, everyone_id, Permissions::empty(), Permissions::SEND_MESSAGES)];
        let base = base_permissions(&roles, &[]);
        let perms = apply_overwrites(base, &roles, &[], &overwrites, Id(42));
        assert!(perms.contains(Permissions::VIEW_CHANNEL));
        assert!(!perms.contains(Permissions::SEND_MESSAGES));
    }

    #[test]
    fn member_overwrite_trumps_role_and_everyone_overwrites() {
        let everyone_id = Id(1);
        let user_id = Id(42);
        let roles = vec![role(1, Permissions::VIEW_CHANNEL | Permissions::SEND_MESSAGES, true)];
        let overwrites = vec![
            overwrite(1, true, everyone_id, Permissions::empty(), Permissions::SEND_MESSAGES),
            overwrite(2, false, user_id, Permissions::SEND_MESSAGES, Permissions::empty()),
        ];
        let base = base_permissions(&roles, &[]);
        let perms = apply_overwrites(base, &roles, &[], &overwrites, user_id);
        assert!(perms.contains(Permissions::SEND_MESSAGES));
    }

    #[test]
    fn cache_key_differs_between_guild_scope_and_channel_scope() {
        let guild_scope = Scope { guild_id: Id(1), channel_id: None, user_id: Id(2) };
        let channel_scope = Scope { guild_id: Id(1), channel_id: Some(Id(3)), user_id: Id(2) };
        assert_ne!(guild_scope.cache_key(), channel_scope.cache_key());
    }
}
