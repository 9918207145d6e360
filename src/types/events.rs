use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::snowflake::Id;
use crate::types::entities::{
    Ban, Channel, ChannelOverwrite, Guild, GuildMember, Message, PublicUser, Role,
};

// ── Gateway opcodes ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum GatewayOpcode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    Resume = 6,
    Reconnect = 7,
    InvalidSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
    Subscribe = 12,
    Unsubscribe = 13,
    ResyncRequired = 14,
}

/// Gateway close codes.
pub mod close_code {
    pub const AUTH_FAILED: u16 = 4001;
    pub const SESSION_INVALIDATED: u16 = 4002;
    pub const HEARTBEAT_TIMEOUT: u16 = 4003;
    pub const INVALID_PAYLOAD: u16 = 4004;
    pub const RATE_LIMITED: u16 = 4005;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn hello(heartbeat_interval_ms: u64) -> Self {
        Self {
            op: GatewayOpcode::Hello as u8,
            d: Some(serde_json::json!({ "heartbeat_interval_ms": heartbeat_interval_ms })),
            s: None,
            t: None,
        }
    }

    pub fn heartbeat_ack() -> Self {
        Self { op: GatewayOpcode::HeartbeatAck as u8, d: None, s: None, t: None }
    }

    pub fn ready(data: ReadyPayload, seq: u64) -> Self {
        Self {
            op: GatewayOpcode::Dispatch as u8,
            d: Some(serde_json::to_value(data).unwrap()),
            s: Some(seq),
            t: Some("READY".into()),
        }
    }

    pub fn dispatch(event: &str, data: impl Serialize, seq: u64) -> Self {
        Self {
            op: GatewayOpcode::Dispatch as u8,
            d: Some(serde_json::to_value(data).unwrap()),
            s: Some(seq),
            t: Some(event.into()),
        }
    }

    pub fn invalid_session(resumable: bool) -> Self {
        Self {
            op: GatewayOpcode::InvalidSession as u8,
            d: Some(serde_json::json!({ "resumable": resumable })),
            s: None,
            t: None,
        }
    }

    pub fn resync_required(scope: &str) -> Self {
        Self {
            op: GatewayOpcode::ResyncRequired as u8,
            d: Some(serde_json::json!({ "scope": scope })),
            s: None,
            t: None,
        }
    }
}

// ── Client -> server payloads ───────────────────────────

#[derive(Debug, Deserialize)]
pub struct IdentifyPayload {
    pub token: String,
    pub last_event_id: Option<Id>,
}

/// Equivalent to `IDENTIFY` for this protocol; kept as a distinct opcode so
/// a future version can require different fields (e.g. dropping the token)
/// without touching `IDENTIFY` itself.
#[derive(Debug, Deserialize)]
pub struct ResumePayload {
    pub token: String,
    pub session_id: Id,
    pub last_event_id: Id,
}

#[derive(Debug, Deserialize)]
pub struct SubscribePayload {
    pub channel_id: Id,
}

// ── Server -> client payloads ───────────────────────────

#[derive(Debug, Serialize)]
pub struct ReadyPayload {
    pub session_id: Id,
    pub user: PublicUser,
    pub guilds: Vec<Guild>,
    /// The newest event id observed before or during this identify/resume —
    /// the client's baseline for its next `last_event_id` on reconnect.
    pub last_event_id: Option<Id>,
}

// ── Dispatch events ──────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct MessageCreateEvent {
    #[serde(flatten)]
    pub message: Message,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageUpdateEvent {
    #[serde(flatten)]
    pub message: Message,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageDeleteEvent {
    pub id: Id,
    pub channel_id: Id,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelCreateEvent {
    #[serde(flatten)]
    pub channel: Channel,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelUpdateEvent {
    #[serde(flatten)]
    pub channel: Channel,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelDeleteEvent {
    pub id: Id,
    pub guild_id: Id,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelOverwriteUpdateEvent {
    pub channel_id: Id,
    pub overwrite: ChannelOverwrite,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuildCreateEvent {
    #[serde(flatten)]
    pub guild: Guild,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuildUpdateEvent {
    #[serde(flatten)]
    pub guild: Guild,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuildDeleteEvent {
    pub id: Id,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuildMemberAddEvent {
    pub guild_id: Id,
    pub member: GuildMember,
    pub user: PublicUser,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuildMemberRemoveEvent {
    pub guild_id: Id,
    pub user_id: Id,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoleCreateEvent {
    pub guild_id: Id,
    #[serde(flatten)]
    pub role: Role,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoleUpdateEvent {
    pub guild_id: Id,
    #[serde(flatten)]
    pub role: Role,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoleDeleteEvent {
    pub guild_id: Id,
    pub role_id: Id,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberRoleUpdateEvent {
    pub guild_id: Id,
    pub user_id: Id,
    pub role_ids: Vec<Id>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BanCreateEvent {
    pub guild_id: Id,
    pub ban: Ban,
}

#[derive(Debug, Clone, Serialize)]
pub struct BanDeleteEvent {
    pub guild_id: Id,
    pub user_id: Id,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRevokedEvent {
    pub session_id: Id,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionsRevokedAllEvent {
    pub user_id: Id,
}

/// The envelope every event takes on the bus: a stable id for dedup, a
/// dotted type, a timestamp, and the event-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Id,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp_ms: u64,
    pub data: Value,
}
