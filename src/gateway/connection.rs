use std::collections::HashSet;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::db::queries;
use crate::error::ApiError;
use crate::events::Topic;
use crate::services::auth;
use crate::snowflake::Id;
use crate::state::AppState;
use crate::types::entities::PublicUser;
use crate::types::events::{
    close_code, GatewayOpcode, GatewayPayload, IdentifyPayload, ReadyPayload, ResumePayload,
    SubscribePayload,
};

const REPLAY_TOPICS: [Topic; 5] =
    [Topic::Messages, Topic::Channels, Topic::Guilds, Topic::Members, Topic::Sessions];

pub async fn handle_connection(state: AppState, socket: WebSocket) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<GatewayPayload>(state.config.gateway.outgoing_queue_size);
    let (close_tx, mut close_rx) = mpsc::channel::<u16>(1);

    let hello = GatewayPayload::hello(state.gateway.heartbeat_interval_ms());
    if ws_sender.send(Message::Text(serde_json::to_string(&hello).unwrap().into())).await.is_err() {
        return;
    }

    let sender_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                payload = rx.recv() => {
                    let Some(payload) = payload else { break };
                    let Ok(text) = serde_json::to_string(&payload) else { continue };
                    if ws_sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                code = close_rx.recv() => {
                    let Some(code) = code else { break };
                    let _ = ws_sender.send(close_frame(code)).await;
                    break;
                }
            }
        }
    });

    let session_id = match state.ids.generate() {
        Ok(id) => id,
        Err(_) => {
            sender_task.abort();
            return;
        }
    };
    let mut identified = false;
    let mut user_id: Option<Id> = None;

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let payload: GatewayPayload = match serde_json::from_str(&text) {
            Ok(p) => p,
            Err(_) => {
                let _ = close_tx.try_send(close_code::INVALID_PAYLOAD);
                break;
            }
        };

        state.gateway.touch_heartbeat(session_id);

        match payload.op {
            op if op == GatewayOpcode::Identify as u8 => {
                if identified {
                    continue;
                }
                let Some(identify) = payload.d.and_then(|d| serde_json::from_value::<IdentifyPayload>(d).ok())
                else {
                    let _ = close_tx.try_send(close_code::INVALID_PAYLOAD);
                    break;
                };

                match handle_identify(&state, session_id, &identify.token, identify.last_event_id, &tx, &close_tx)
                    .await
                {
                    Ok(uid) => {
                        identified = true;
                        user_id = Some(uid);
                    }
                    Err(e) => {
                        tracing::info!(error = %e, "identify rejected");
                        let _ = close_tx.try_send(close_code::INVALID_PAYLOAD);
                        break;
                    }
                }
            }

            op if op == GatewayOpcode::Resume as u8 => {
                if identified {
                    continue;
                }
                let Some(resume) = payload.d.and_then(|d| serde_json::from_value::<ResumePayload>(d).ok()) else {
                    let _ = close_tx.try_send(close_code::INVALID_PAYLOAD);
                    break;
                };

                match handle_identify(
                    &state,
                    session_id,
                    &resume.token,
                    Some(resume.last_event_id),
                    &tx,
                    &close_tx,
                )
                .await
                {
                    Ok(uid) => {
                        identified = true;
                        user_id = Some(uid);
                    }
                    Err(e) => {
                        tracing::info!(error = %e, "resume rejected");
                        let _ = close_tx.try_send(close_code::INVALID_PAYLOAD);
                        break;
                    }
                }
            }

            op if op == GatewayOpcode::Heartbeat as u8 => {
                let _ = tx.try_send(GatewayPayload::heartbeat_ack());
            }

            op if op == GatewayOpcode::Subscribe as u8 => {
                if !identified {
                    continue;
                }
                if let Some(sub) = payload.d.and_then(|d| serde_json::from_value::<SubscribePayload>(d).ok()) {
                    state.gateway.subscribe_channel(session_id, sub.channel_id);
                }
            }

            op if op == GatewayOpcode::Unsubscribe as u8 => {
                if !identified {
                    continue;
                }
                if let Some(sub) = payload.d.and_then(|d| serde_json::from_value::<SubscribePayload>(d).ok()) {
                    state.gateway.unsubscribe_channel(session_id, sub.channel_id);
                }
            }

            _ => {
                let _ = close_tx.try_send(close_code::INVALID_PAYLOAD);
                break;
            }
        }
    }

    state.gateway.remove_connection(session_id);
    sender_task.abort();

    if let Some(uid) = user_id {
        tracing::info!(user_id = %uid, session_id = %session_id, "client disconnected");
    }
}

async fn handle_identify(
    state: &AppState,
    session_id: Id,
    token: &str,
    resume_last_event_id: Option<Id>,
    tx: &mpsc::Sender<GatewayPayload>,
    close_tx: &mpsc::Sender<u16>,
) -> Result<Id, ApiError> {
    let uid = auth::validate_access_token(&state.config, token)?;

    let user = queries::get_user_by_id(&state.db, uid).await?.ok_or(ApiError::TokenInvalid)?;

    let guilds = queries::get_user_guilds(&state.db, uid).await?;
    let guild_ids: Vec<Id> = guilds.iter().map(|g| g.id).collect();

    state.gateway.add_connection(session_id, uid, tx.clone(), close_tx.clone());
    state.gateway.subscribe_guilds(session_id, &guild_ids);

    let mut last_event_id = resume_last_event_id;
    if let Some(since) = resume_last_event_id {
        if let Some(newest) = replay_after(state, session_id, &guild_ids, since).await {
            last_event_id = Some(newest);
        }
    }

    let ready = ReadyPayload { session_id, user: PublicUser::from(user), guilds, last_event_id };
    state.gateway.send_ready(session_id, ready);

    tracing::info!(user_id = %uid, session_id = %session_id, "client identified");
    Ok(uid)
}

/// Replays durable-bus events newer than `last_event_id` that belong to a
/// guild/channel the session is now subscribed to, within the configured
/// bounded window. Sends `RESYNC_REQUIRED` instead if the window is
/// exceeded.
async fn replay_after(
    state: &AppState,
    session_id: Id,
    guild_ids: &[Id],
    last_event_id: Id,
) -> Option<Id> {
    use crate::events::EventBus;

    let (window_secs, max_events) = state.gateway.replay_window();
    let mut all_envelopes = Vec::new();

    for topic in REPLAY_TOPICS {
        match state.bus.replay_since(topic, last_event_id, window_secs, max_events).await {
            Ok(Some(envelopes)) => all_envelopes.extend(envelopes),
            Ok(None) => {
                state.gateway.send_raw(session_id, GatewayPayload::resync_required("replay_window_exceeded"));
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "replay query failed");
            }
        }
    }

    if all_envelopes.len() > max_events {
        state.gateway.send_raw(session_id, GatewayPayload::resync_required("replay_window_exceeded"));
        return None;
    }

    all_envelopes.sort_by_key(|e| e.id);

    // Message-family events carry only `channel_id`, never `guild_id`, so
    // scoping by guild alone would leak every channel in every guild the
    // session belongs to. Resolve the actual set of channel ids the member
    // can see across those guilds up front instead.
    let mut channel_ids = HashSet::new();
    for guild_id in guild_ids {
        match queries::get_guild_channels(&state.db, *guild_id).await {
            Ok(channels) => channel_ids.extend(channels.into_iter().map(|c| c.id)),
            Err(e) => tracing::warn!(error = %e, "failed to resolve guild channels for replay scoping"),
        }
    }

    let mut newest = None;
    for envelope in all_envelopes {
        if belongs_to_subscribed_scope(&envelope.data, guild_ids, &channel_ids) {
            state.gateway.send_dispatch_at_seq(session_id, &envelope.event_type, &envelope.data);
        }
        newest = Some(envelope.id);
    }
    newest
}

fn belongs_to_subscribed_scope(data: &serde_json::Value, guild_ids: &[Id], channel_ids: &HashSet<Id>) -> bool {
    if let Some(guild_id) = data.get("guild_id").and_then(|v| v.as_str()).and_then(|s| s.parse::<u64>().ok()) {
        return guild_ids.iter().any(|g| g.as_u64() == guild_id);
    }
    if let Some(channel_id) = data.get("channel_id").and_then(|v| v.as_str()).and_then(|s| s.parse::<u64>().ok()) {
        return channel_ids.iter().any(|c| c.as_u64() == channel_id);
    }
    // Events with neither field (e.g. session events) are always delivered.
    true
}

pub fn close_frame(code: u16) -> Message {
    Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: match code {
            close_code::AUTH_FAILED => "auth failed".into(),
            close_code::SESSION_INVALIDATED => "session invalidated".into(),
            close_code::HEARTBEAT_TIMEOUT => "heartbeat timeout".into(),
            close_code::INVALID_PAYLOAD => "invalid payload".into(),
            close_code::RATE_LIMITED => "rate limited".into(),
            _ => "closed".into(),
        },
    }))
}
