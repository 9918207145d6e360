//! Background tasks that keep a single gateway instance's local connection
//! table in sync with the durable bus, plus the heartbeat-timeout sweep.
//!
//! Every instance runs one consumer per topic under its own consumer group
//! (`{consumer_group_prefix}-{topic}`) so each instance sees every event —
//! Streams consumer groups give at-least-once delivery *within* a group,
//! and a distinct group per instance is how a plain broadcast-to-everyone
//! fan-out is reproduced on top of a durable log.

use std::time::Duration;

use serde_json::Value;

use crate::events::{Delivery, EventBus, Topic};
use crate::gateway::GatewayState;
use crate::snowflake::Id;
use crate::state::AppState;
use crate::types::events::close_code;

const TOPICS: [Topic; 5] = [Topic::Messages, Topic::Channels, Topic::Guilds, Topic::Members, Topic::Sessions];
const RECLAIM_MIN_IDLE_MS: i64 = 30_000;

pub fn spawn_all(state: AppState) {
    let consumer_id = format!("{}-{}", state.config.bus.consumer_group_prefix, state.config.instance.worker_id);

    for topic in TOPICS {
        let state = state.clone();
        let consumer_id = consumer_id.clone();
        let group = format!("{}-{}", state.config.bus.consumer_group_prefix, topic_name(topic));
        tokio::spawn(async move {
            if let Err(e) = state.bus.ensure_group(topic, &group).await {
                tracing::error!(error = %e, ?topic, "failed to create consumer group");
                return;
            }
            run_topic_consumer(state, topic, group, consumer_id).await;
        });
    }

    tokio::spawn(heartbeat_timeout_loop(state));
}

fn topic_name(topic: Topic) -> &'static str {
    match topic {
        Topic::Messages => "messages",
        Topic::Channels => "channels",
        Topic::Guilds => "guilds",
        Topic::Members => "members",
        Topic::Sessions => "sessions",
    }
}

async fn run_topic_consumer(state: AppState, topic: Topic, group: String, consumer_id: String) {
    let mut reclaim_tick = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            result = state.bus.poll(topic, &group, &consumer_id, 64) => {
                match result {
                    Ok(deliveries) => {
                        for delivery in deliveries {
                            handle_delivery(&state, &group, &delivery).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, ?topic, "bus poll failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            _ = reclaim_tick.tick() => {
                match state.bus.reclaim_stale(topic, &group, &consumer_id, RECLAIM_MIN_IDLE_MS).await {
                    Ok(reclaimed) => {
                        for delivery in reclaimed {
                            handle_delivery(&state, &group, &delivery).await;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, ?topic, "stale reclaim failed"),
                }
            }
        }
    }
}

/// `reclaim_stale` can hand back an entry this same consumer already routed
/// but crashed before acking — that redelivery is not suppressed here.
/// `route_and_dispatch` must tolerate seeing the same envelope twice:
/// closing an already-closed session is a no-op, and a duplicate dispatch
/// to a still-open one is harmless because the client dedupes on the
/// envelope/sequence id it carries, the same discipline `messages::create`
/// already relies on for duplicate `MESSAGE_CREATE` publishes.
async fn handle_delivery(state: &AppState, group: &str, delivery: &Delivery) {
    route_and_dispatch(&state.gateway, delivery);
    if let Err(e) = state.bus.ack(delivery.topic, group, &delivery.stream_id).await {
        tracing::warn!(error = %e, "failed to ack delivered event");
    }
}

/// Fans a bus envelope out to the local connection table. Scoping is by
/// whichever entity id the payload carries — channel-scoped for messages
/// and overwrites (on-demand `SUBSCRIBE`), guild-scoped for everything
/// else a member auto-subscribes to on `IDENTIFY`, and direct session/user
/// targeting for revocation.
fn route_and_dispatch(gateway: &GatewayState, delivery: &Delivery) {
    let event_type = delivery.envelope.event_type.as_str();
    let data = &delivery.envelope.data;

    if event_type == "session.revoked" {
        if let Some(session_id) = field_id(data, "session_id") {
            gateway.force_close(session_id, close_code::SESSION_INVALIDATED);
        }
        return;
    }
    if event_type == "sessions.revoked_all" {
        if let Some(user_id) = field_id(data, "user_id") {
            gateway.force_close_user(user_id, close_code::SESSION_INVALIDATED);
        }
        return;
    }

    if (event_type.starts_with("message.") || event_type == "channel.overwrite_updated")
        && let Some(channel_id) = field_id(data, "channel_id")
    {
        close_overloaded(gateway, gateway.dispatch_to_channel(channel_id, event_type, data));
        return;
    }

    // A kick or ban removes membership before the target's own connections
    // necessarily live on this instance; force-close alongside the broadcast
    // so the removal takes effect everywhere, not just on the instance that
    // handled the REST call.
    if event_type == "member.removed"
        && let Some(user_id) = field_id(data, "user_id")
    {
        gateway.force_close_user(user_id, close_code::SESSION_INVALIDATED);
    }

    let guild_id = field_id(data, "guild_id").or_else(|| field_id(data, "id"));
    if let Some(guild_id) = guild_id {
        close_overloaded(gateway, gateway.dispatch_to_guild(guild_id, event_type, data));
    }
}

/// A session that can't keep up with its queue or rate ceiling gets dropped
/// rather than silently falling behind forever.
fn close_overloaded(gateway: &GatewayState, overloaded: Vec<Id>) {
    for session_id in overloaded {
        gateway.force_close(session_id, close_code::RATE_LIMITED);
    }
}

fn field_id(data: &Value, field: &str) -> Option<Id> {
    data.get(field)?.as_str()?.parse().ok()
}

async fn heartbeat_timeout_loop(state: AppState) {
    let mut tick = tokio::time::interval(Duration::from_secs(5));
    loop {
        tick.tick().await;
        for session_id in state.gateway.timed_out_sessions() {
            state.gateway.force_close(session_id, close_code::HEARTBEAT_TIMEOUT);
        }
    }
}
