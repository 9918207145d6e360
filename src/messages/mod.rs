//! Message pipeline: create / list / update / delete, with idempotent
//! insert, cursor pagination, and an optimistic CAS update.
//!
//! Every write here follows an outbox discipline: the storage write happens
//! first and commits regardless of whether the follow-up publish to the
//! [`EventBus`] succeeds, so a transient bus outage never loses data — only
//! delays fan-out, which the bus's own redelivery will eventually fix.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use sqlx::PgPool;

use crate::db::queries;
use crate::error::ApiError;
use crate::events::{EventBus, RedisStreamBus, Topic};
use crate::permissions::{Permission, Scope, SharedPermissionEngine};
use crate::snowflake::{Id, Snowflake};
use crate::types::entities::{Message, MessagePageQuery};
use crate::types::events::{MessageCreateEvent, MessageDeleteEvent, MessageUpdateEvent};

static RE_MENTION_USER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<@(\d+)>").unwrap());
static RE_MENTION_ROLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<@&(\d+)>").unwrap());

#[derive(Clone)]
pub struct MessagePipeline {
    db: PgPool,
    bus: std::sync::Arc<RedisStreamBus>,
    permissions: SharedPermissionEngine,
    ids: Snowflake,
    max_content_length: usize,
    default_page_size: i64,
    max_page_size: i64,
}

impl MessagePipeline {
    pub fn new(
        db: PgPool,
        bus: std::sync::Arc<RedisStreamBus>,
        permissions: SharedPermissionEngine,
        ids: Snowflake,
        max_content_length: usize,
        default_page_size: i64,
        max_page_size: i64,
    ) -> Self {
        Self { db, bus, permissions, ids, max_content_length, default_page_size, max_page_size }
    }

    pub async fn create(
        &self,
        guild_id: Id,
        channel_id: Id,
        author_id: Id,
        content: &str,
        client_message_id: Option<Id>,
    ) -> Result<Message, ApiError> {
        self.permissions
            .require(Scope { guild_id, channel_id: Some(channel_id), user_id: author_id }, Permission::SendMessages)
            .await?;

        let content = validate_content(content, self.max_content_length)?;
        let (mentions, mention_roles) = self.parse_mentions(guild_id, content).await?;

        let id = match client_message_id {
            Some(id) => id,
            None => self.ids.generate()?,
        };

        let inserted =
            queries::create_message(&self.db, id, channel_id, author_id, content, &mentions, &mention_roles).await?;

        // A retried create with the same id conflicts on the primary key and
        // comes back `None`; only a fresh insert gets a MESSAGE_CREATE.
        let message = match inserted {
            Some(message) => {
                let _ = self
                    .bus
                    .publish(Topic::Messages, "message.created", message.id, MessageCreateEvent { message: message.clone() })
                    .await;
                message
            }
            None => queries::get_message_by_id_any(&self.db, id)
                .await?
                .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("message {id} missing after insert conflict")))?,
        };

        Ok(message)
    }

    pub async fn list(
        &self,
        guild_id: Id,
        channel_id: Id,
        user_id: Id,
        query: MessagePageQuery,
    ) -> Result<Vec<Message>, ApiError> {
        self.permissions
            .require(Scope { guild_id, channel_id: Some(channel_id), user_id }, Permission::ReadMessageHistory)
            .await?;

        let limit = query
            .limit
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size);

        let messages = match (query.before, query.after) {
            (Some(before), _) => {
                let mut page = queries::list_messages_before(&self.db, channel_id, before, limit).await?;
                page.reverse();
                page
            }
            (None, Some(after)) => queries::list_messages_after(&self.db, channel_id, after, limit).await?,
            (None, None) => {
                let mut page = queries::list_messages_latest(&self.db, channel_id, limit).await?;
                page.reverse();
                page
            }
        };

        Ok(messages)
    }

    pub async fn update(
        &self,
        guild_id: Id,
        channel_id: Id,
        message_id: Id,
        user_id: Id,
        new_content: &str,
    ) -> Result<Message, ApiError> {
        let existing = queries::get_message_by_id(&self.db, message_id)
            .await?
            .ok_or(ApiError::MessageDeleted)?;

        if existing.author_id != user_id {
            self.permissions
                .require(Scope { guild_id, channel_id: Some(channel_id), user_id }, Permission::ManageMessages)
                .await?;
            return Err(ApiError::NotMessageAuthor);
        }

        let content = validate_content(new_content, self.max_content_length)?;
        let (mentions, mention_roles) = self.parse_mentions(guild_id, content).await?;

        let updated = queries::update_message(
            &self.db,
            message_id,
            content,
            &mentions,
            &mention_roles,
            existing.edited_at,
        )
        .await?
        .ok_or(ApiError::MessageDeleted)?;

        let _ = self
            .bus
            .publish(Topic::Messages, "message.updated", updated.id, MessageUpdateEvent { message: updated.clone() })
            .await;

        Ok(updated)
    }

    pub async fn delete(&self, guild_id: Id, channel_id: Id, message_id: Id, user_id: Id) -> Result<(), ApiError> {
        let Some(existing) = queries::get_message_by_id(&self.db, message_id).await? else {
            return Ok(());
        };
        if existing.deleted_at.is_some() {
            return Ok(());
        }

        if existing.author_id != user_id {
            self.permissions
                .require(Scope { guild_id, channel_id: Some(channel_id), user_id }, Permission::ManageMessages)
                .await?;
        }

        queries::soft_delete_message(&self.db, message_id).await?;

        let _ = self
            .bus
            .publish(
                Topic::Messages,
                "message.deleted",
                message_id,
                MessageDeleteEvent { id: message_id, channel_id },
            )
            .await;

        Ok(())
    }

    /// Parses `<@ID>` user mentions and `<@&ID>` role mentions, deduplicating
    /// and preserving order of first occurrence, then drops any id that does
    /// not resolve to an actual guild member or role.
    async fn parse_mentions(&self, guild_id: Id, content: &str) -> Result<(Vec<Id>, Vec<Id>), ApiError> {
        let mut user_ids = Vec::new();
        let mut seen_users = HashSet::new();
        for cap in RE_MENTION_USER.captures_iter(content) {
            if let Ok(raw) = cap[1].parse::<u64>() {
                let id = Id(raw);
                if seen_users.insert(id) {
                    user_ids.push(id);
                }
            }
        }

        let mut role_ids = Vec::new();
        let mut seen_roles = HashSet::new();
        for cap in RE_MENTION_ROLE.captures_iter(content) {
            if let Ok(raw) = cap[1].parse::<u64>() {
                let id = Id(raw);
                if seen_roles.insert(id) {
                    role_ids.push(id);
                }
            }
        }

        if user_ids.is_empty() && role_ids.is_empty() {
            return Ok((user_ids, role_ids));
        }

        let members = queries::get_guild_members(&self.db, guild_id).await?;
        let member_ids: HashSet<Id> = members.iter().map(|m| m.user_id).collect();
        user_ids.retain(|id| member_ids.contains(id));

        let roles = queries::get_guild_roles(&self.db, guild_id).await?;
        let role_id_set: HashSet<Id> = roles.iter().map(|r| r.id).collect();
        role_ids.retain(|id| role_id_set.contains(id));

        Ok((user_ids, role_ids))
    }
}

fn validate_content(content: &str, max_len: usize) -> Result<&str, ApiError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ApiError::EmptyMessage);
    }
    if trimmed.len() > max_len {
        return Err(ApiError::MessageTooLong);
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_content_rejects_empty_after_trim() {
        assert!(matches!(validate_content("   ", 4000), Err(ApiError::EmptyMessage)));
    }

    #[test]
    fn validate_content_rejects_too_long() {
        let content = "a".repeat(4001);
        assert!(matches!(validate_content(&content, 4000), Err(ApiError::MessageTooLong)));
    }

    #[test]
    fn validate_content_trims_surrounding_whitespace() {
        assert_eq!(validate_content("  hello  ", 4000).unwrap(), "hello");
    }

    #[test]
    fn mention_regex_dedupes_and_preserves_first_occurrence_order() {
        let content = "hey <@123> and <@456> again <@123>";
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for cap in RE_MENTION_USER.captures_iter(content) {
            let id: u64 = cap[1].parse().unwrap();
            if seen.insert(id) {
                ids.push(id);
            }
        }
        assert_eq!(ids, vec![123, 456]);
    }

    #[test]
    fn role_mention_regex_is_distinct_from_user_mention() {
        let content = "<@&999> and <@111>";
        let role_ids: Vec<u64> = RE_MENTION_ROLE
            .captures_iter(content)
            .map(|c| c[1].parse().unwrap())
            .collect();
        let user_ids: Vec<u64> = RE_MENTION_USER
            .captures_iter(content)
            .map(|c| c[1].parse().unwrap())
            .collect();
        assert_eq!(role_ids, vec![999]);
        assert_eq!(user_ids, vec![111]);
    }
}
