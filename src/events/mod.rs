//! Durable event bus, backed by Redis Streams.
//!
//! Each [`Topic`] is one Redis stream (`events:<topic>`); `XADD` gives
//! per-subject FIFO for free since every event for a given topic is
//! appended to the same stream in publish order. Consumers join a
//! consumer group (one per gateway instance, or per background worker)
//! and explicitly `ack`/`nack` — an unacked entry is redelivered to
//! another consumer in the group once it has been idle past the retry
//! floor, via `reclaim_stale`.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::Serialize;
use serde_json::Value;

use crate::error::ApiError;
use crate::snowflake::{Id, Snowflake};
use crate::types::events::EventEnvelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Messages,
    Channels,
    Guilds,
    Members,
    Sessions,
}

impl Topic {
    fn stream_key(self) -> &'static str {
        match self {
            Topic::Messages => "events:messages",
            Topic::Channels => "events:channels",
            Topic::Guilds => "events:guilds",
            Topic::Members => "events:members",
            Topic::Sessions => "events:sessions",
        }
    }
}

/// One delivered entry, pending ack/nack.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: Topic,
    pub stream_id: String,
    pub envelope: EventEnvelope,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(
        &self,
        topic: Topic,
        event_type: &str,
        entity_id: Id,
        data: impl Serialize + Send + Sync,
    ) -> Result<Id, ApiError>
    where
        Self: Sized;

    async fn poll(&self, topic: Topic, group: &str, consumer: &str, max: usize) -> Result<Vec<Delivery>, ApiError>;
    async fn ack(&self, topic: Topic, group: &str, stream_id: &str) -> Result<(), ApiError>;
    async fn nack(&self, topic: Topic, group: &str, stream_id: &str) -> Result<(), ApiError>;
    async fn ensure_group(&self, topic: Topic, group: &str) -> Result<(), ApiError>;
    async fn reclaim_stale(&self, topic: Topic, group: &str, consumer: &str, min_idle_ms: i64) -> Result<Vec<Delivery>, ApiError>;

    /// Resume replay: events on `topic` with envelope id greater
    /// than `after`, published within the last `window_secs`, capped at
    /// `max_events`. Returns `None` when the cap is hit before the window is
    /// exhausted — the caller sends `RESYNC_REQUIRED` instead of a partial
    /// replay.
    async fn replay_since(
        &self,
        topic: Topic,
        after: Id,
        window_secs: i64,
        max_events: usize,
    ) -> Result<Option<Vec<EventEnvelope>>, ApiError>;
}

#[derive(Clone)]
pub struct RedisStreamBus {
    redis: redis::aio::ConnectionManager,
    ids: Snowflake,
}

impl RedisStreamBus {
    pub fn new(redis: redis::aio::ConnectionManager, ids: Snowflake) -> Self {
        Self { redis, ids }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn parse_entry(stream_id: String, topic: Topic, fields: Vec<(String, String)>) -> Option<Delivery> {
    let mut id = None;
    let mut event_type = None;
    let mut timestamp_ms = None;
    let mut data = None;
    for (key, value) in fields {
        match key.as_str() {
            "id" => id = value.parse::<u64>().ok().map(Id),
            "type" => event_type = Some(value),
            "timestamp_ms" => timestamp_ms = value.parse::<u64>().ok(),
            "data" => data = serde_json::from_str::<Value>(&value).ok(),
            _ => {}
        }
    }
    Some(Delivery {
        topic,
        stream_id,
        envelope: EventEnvelope {
            id: id?,
            event_type: event_type?,
            timestamp_ms: timestamp_ms?,
            data: data?,
        },
    })
}

#[async_trait]
impl EventBus for RedisStreamBus {
    async fn publish(
        &self,
        topic: Topic,
        event_type: &str,
        entity_id: Id,
        data: impl Serialize + Send + Sync,
    ) -> Result<Id, ApiError> {
        let envelope_id = self.ids.generate()?;
        let payload = serde_json::to_string(&data).map_err(|e| ApiError::Internal(e.into()))?;
        let subject = format!("{}.{event_type}.{entity_id}", topic.stream_key());

        let mut conn = self.redis.clone();
        let _: String = redis::cmd("XADD")
            .arg(topic.stream_key())
            .arg("*")
            .arg("id")
            .arg(envelope_id.to_string())
            .arg("type")
            .arg(event_type)
            .arg("subject")
            .arg(subject)
            .arg("timestamp_ms")
            .arg(now_ms())
            .arg("data")
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| ApiError::BusUnavailable(e.to_string()))?;

        Ok(envelope_id)
    }

    async fn ensure_group(&self, topic: Topic, group: &str) -> Result<(), ApiError> {
        let mut conn = self.redis.clone();
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic.stream_key())
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            // BUSYGROUP: the group already exists, which is the common case.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(ApiError::BusUnavailable(e.to_string())),
        }
    }

    async fn poll(&self, topic: Topic, group: &str, consumer: &str, max: usize) -> Result<Vec<Delivery>, ApiError> {
        let mut conn = self.redis.clone();
        let reply: redis::streams::StreamReadReply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(max)
            .arg("BLOCK")
            .arg(1000)
            .arg("STREAMS")
            .arg(topic.stream_key())
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(|e| ApiError::BusUnavailable(e.to_string()))?;

        let mut out = Vec::new();
        for stream_key in reply.keys {
            for entry in stream_key.ids {
                let fields: Vec<(String, String)> = entry
                    .map
                    .into_iter()
                    .filter_map(|(k, v)| match v {
                        redis::Value::BulkString(bytes) => {
                            Some((k, String::from_utf8_lossy(&bytes).into_owned()))
                        }
                        redis::Value::SimpleString(s) => Some((k, s)),
                        _ => None,
                    })
                    .collect();
                if let Some(delivery) = parse_entry(entry.id, topic, fields) {
                    out.push(delivery);
                }
            }
        }
        Ok(out)
    }

    async fn ack(&self, topic: Topic, group: &str, stream_id: &str) -> Result<(), ApiError> {
        let mut conn = self.redis.clone();
        let _: i64 = conn
            .xack(topic.stream_key(), group, &[stream_id])
            .await
            .map_err(|e| ApiError::BusUnavailable(e.to_string()))?;
        Ok(())
    }

    /// A nack is a no-op on the wire: we simply leave the entry pending so
    /// `reclaim_stale` redelivers it once the idle floor elapses.
    async fn nack(&self, _topic: Topic, _group: &str, _stream_id: &str) -> Result<(), ApiError> {
        Ok(())
    }

    async fn replay_since(
        &self,
        topic: Topic,
        after: Id,
        window_secs: i64,
        max_events: usize,
    ) -> Result<Option<Vec<EventEnvelope>>, ApiError> {
        let mut conn = self.redis.clone();
        let window_start_ms = now_ms().saturating_sub((window_secs * 1000) as u64);

        let reply: redis::streams::StreamRangeReply = redis::cmd("XRANGE")
            .arg(topic.stream_key())
            .arg(format!("{window_start_ms}-0"))
            .arg("+")
            .arg("COUNT")
            .arg(max_events + 1)
            .query_async(&mut conn)
            .await
            .map_err(|e| ApiError::BusUnavailable(e.to_string()))?;

        if reply.ids.len() > max_events {
            return Ok(None);
        }

        let mut out = Vec::new();
        for entry in reply.ids {
            let fields: Vec<(String, String)> = entry
                .map
                .into_iter()
                .filter_map(|(k, v)| match v {
                    redis::Value::BulkString(bytes) => Some((k, String::from_utf8_lossy(&bytes).into_owned())),
                    redis::Value::SimpleString(s) => Some((k, s)),
                    _ => None,
                })
                .collect();
            if let Some(delivery) = parse_entry(entry.id, topic, fields) {
                if delivery.envelope.id > after {
                    out.push(delivery.envelope);
                }
            }
        }
        Ok(Some(out))
    }

    async fn reclaim_stale(&self, topic: Topic, group: &str, consumer: &str, min_idle_ms: i64) -> Result<Vec<Delivery>, ApiError> {
        let mut conn = self.redis.clone();
        let pending: redis::streams::StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(topic.stream_key())
            .arg(group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(100)
            .query_async(&mut conn)
            .await
            .map_err(|e| ApiError::BusUnavailable(e.to_string()))?;

        let stale_ids: Vec<String> = pending.ids.into_iter().map(|p| p.id).collect();
        if stale_ids.is_empty() {
            return Ok(Vec::new());
        }

        let reply: redis::streams::StreamClaimReply = redis::cmd("XCLAIM")
            .arg(topic.stream_key())
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg(stale_ids)
            .query_async(&mut conn)
            .await
            .map_err(|e| ApiError::BusUnavailable(e.to_string()))?;

        let mut out = Vec::new();
        for entry in reply.ids {
            let fields: Vec<(String, String)> = entry
                .map
                .into_iter()
                .filter_map(|(k, v)| match v {
                    redis::Value::BulkString(bytes) => Some((k, String::from_utf8_lossy(&bytes).into_owned())),
                    redis::Value::SimpleString(s) => Some((k, s)),
                    _ => None,
                })
                .collect();
            if let Some(delivery) = parse_entry(entry.id, topic, fields) {
                out.push(delivery);
            }
        }
        Ok(out)
    }
}

