//! Connection registry and fan-out.
//!
//! Each connection is a pair of tasks (reader in [`connection::handle_connection`],
//! writer implicit in the bounded `mpsc` channel here) — the channel is the
//! single serialization point for a connection's outbound frames and its
//! sequence number, backed by a bounded queue with a per-second rate
//! ceiling rather than unbounded best-effort fan-out. Resume replay is
//! sourced from the durable bus itself (see
//! [`crate::events::RedisStreamBus::replay_since`]), not from connection-
//! local state, since the whole point of resume is to survive the old
//! connection being gone.

pub mod connection;

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::GatewayConfig;
use crate::snowflake::Id;
use crate::types::events::GatewayPayload;

struct ConnectionHandle {
    user_id: Id,
    sender: mpsc::Sender<GatewayPayload>,
    close: mpsc::Sender<u16>,
    sequence: AtomicU64,
    last_heartbeat_ms: AtomicI64,
    rate_window_start_ms: AtomicI64,
    rate_count: AtomicU32,
}

pub struct GatewayState {
    connections: DashMap<Id, ConnectionHandle>,
    user_sessions: DashMap<Id, HashSet<Id>>,
    guild_subscriptions: DashMap<Id, HashSet<Id>>,
    channel_subscriptions: DashMap<Id, HashSet<Id>>,
    config: GatewayConfig,
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            connections: DashMap::new(),
            user_sessions: DashMap::new(),
            guild_subscriptions: DashMap::new(),
            channel_subscriptions: DashMap::new(),
            config,
        }
    }

    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.config.heartbeat_interval_ms
    }

    pub fn add_connection(
        &self,
        session_id: Id,
        user_id: Id,
        sender: mpsc::Sender<GatewayPayload>,
        close: mpsc::Sender<u16>,
    ) {
        self.connections.insert(
            session_id,
            ConnectionHandle {
                user_id,
                sender,
                close,
                sequence: AtomicU64::new(0),
                last_heartbeat_ms: AtomicI64::new(now_ms()),
                rate_window_start_ms: AtomicI64::new(now_ms()),
                rate_count: AtomicU32::new(0),
            },
        );
        self.user_sessions.entry(user_id).or_default().insert(session_id);
    }

    /// Requests that `session_id`'s writer task send a close frame with
    /// `code` and tear down. A no-op if the session is already gone.
    pub fn force_close(&self, session_id: Id, code: u16) {
        if let Some(handle) = self.connections.get(&session_id) {
            let _ = handle.close.try_send(code);
        }
    }

    /// Force-closes every local session belonging to `user_id` — called on
    /// `sessions.revoked_all`.
    pub fn force_close_user(&self, user_id: Id, code: u16) {
        for session_id in self.sessions_for_user(user_id) {
            self.force_close(session_id, code);
        }
    }

    pub fn remove_connection(&self, session_id: Id) {
        if let Some((_, handle)) = self.connections.remove(&session_id) {
            if let Some(mut sessions) = self.user_sessions.get_mut(&handle.user_id) {
                sessions.remove(&session_id);
                if sessions.is_empty() {
                    drop(sessions);
                    self.user_sessions.remove(&handle.user_id);
                }
            }
            for mut entry in self.guild_subscriptions.iter_mut() {
                entry.value_mut().remove(&session_id);
            }
            for mut entry in self.channel_subscriptions.iter_mut() {
                entry.value_mut().remove(&session_id);
            }
        }
    }

    pub fn subscribe_guilds(&self, session_id: Id, guild_ids: &[Id]) {
        for guild_id in guild_ids {
            self.guild_subscriptions.entry(*guild_id).or_default().insert(session_id);
        }
    }

    pub fn subscribe_channel(&self, session_id: Id, channel_id: Id) {
        self.channel_subscriptions.entry(channel_id).or_default().insert(session_id);
    }

    pub fn unsubscribe_channel(&self, session_id: Id, channel_id: Id) {
        if let Some(mut sessions) = self.channel_subscriptions.get_mut(&channel_id) {
            sessions.remove(&session_id);
        }
    }

    pub fn touch_heartbeat(&self, session_id: Id) {
        if let Some(handle) = self.connections.get(&session_id) {
            handle.last_heartbeat_ms.store(now_ms(), Ordering::Relaxed);
        }
    }

    /// Sessions silent past `heartbeat_timeout_ms`; caller closes them with `4003`.
    pub fn timed_out_sessions(&self) -> Vec<Id> {
        let now = now_ms();
        let timeout = self.config.heartbeat_timeout_ms as i64;
        self.connections
            .iter()
            .filter(|entry| now - entry.value().last_heartbeat_ms.load(Ordering::Relaxed) > timeout)
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn sessions_for_user(&self, user_id: Id) -> Vec<Id> {
        self.user_sessions.get(&user_id).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    pub fn guild_ids_for_session(&self, session_id: Id) -> Vec<Id> {
        self.guild_subscriptions
            .iter()
            .filter(|entry| entry.value().contains(&session_id))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Appends to `session_id`'s outbound queue. Returns `false` when the
    /// bounded queue is full or the connection is sending too fast — the
    /// caller should then close it with `4005`.
    fn send(&self, session_id: Id, payload: GatewayPayload) -> bool {
        let Some(handle) = self.connections.get(&session_id) else { return true };

        let now = now_ms();
        let window_start = handle.rate_window_start_ms.load(Ordering::Relaxed);
        if now - window_start >= 1000 {
            handle.rate_window_start_ms.store(now, Ordering::Relaxed);
            handle.rate_count.store(0, Ordering::Relaxed);
        }
        let count = handle.rate_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count > self.config.events_per_second {
            return false;
        }

        handle.sender.try_send(payload).is_ok()
    }

    fn next_seq(&self, session_id: Id) -> Option<u64> {
        self.connections.get(&session_id).map(|h| h.sequence.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn dispatch_one(&self, session_id: Id, event: &str, data: &impl Serialize) -> bool {
        let Some(seq) = self.next_seq(session_id) else { return true };
        self.send(session_id, GatewayPayload::dispatch(event, data, seq))
    }

    pub fn dispatch_to_guild(&self, guild_id: Id, event: &str, data: &impl Serialize) -> Vec<Id> {
        let mut overloaded = Vec::new();
        if let Some(sessions) = self.guild_subscriptions.get(&guild_id) {
            for session_id in sessions.iter() {
                if !self.dispatch_one(*session_id, event, data) {
                    overloaded.push(*session_id);
                }
            }
        }
        overloaded
    }

    pub fn dispatch_to_channel(&self, channel_id: Id, event: &str, data: &impl Serialize) -> Vec<Id> {
        let mut overloaded = Vec::new();
        if let Some(sessions) = self.channel_subscriptions.get(&channel_id) {
            for session_id in sessions.iter() {
                if !self.dispatch_one(*session_id, event, data) {
                    overloaded.push(*session_id);
                }
            }
        }
        overloaded
    }

    pub fn dispatch_to_user(&self, user_id: Id, event: &str, data: &impl Serialize) -> Vec<Id> {
        let mut overloaded = Vec::new();
        for session_id in self.sessions_for_user(user_id) {
            if !self.dispatch_one(session_id, event, data) {
                overloaded.push(session_id);
            }
        }
        overloaded
    }

    pub fn send_ready(&self, session_id: Id, ready: crate::types::events::ReadyPayload) {
        let seq = self.next_seq(session_id).unwrap_or(1);
        self.send(session_id, GatewayPayload::ready(ready, seq));
    }

    /// Sends an already-sequenced dispatch built during resume replay.
    pub fn send_dispatch_at_seq(&self, session_id: Id, event: &str, data: &impl Serialize) -> bool {
        self.dispatch_one(session_id, event, data)
    }

    pub fn send_raw(&self, session_id: Id, payload: GatewayPayload) {
        self.send(session_id, payload);
    }

    pub fn is_session_connected(&self, session_id: Id) -> bool {
        self.connections.contains_key(&session_id)
    }

    pub fn replay_window(&self) -> (i64, usize) {
        (self.config.replay_window_secs, self.config.replay_window_max_events)
    }
}
