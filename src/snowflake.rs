//! Time-sortable 64-bit ids used for every persisted entity, pagination
//! cursor, and ordering guarantee in the system.
//!
//! Layout, high bit to low bit:
//! `42 bits timestamp_ms (since EPOCH_MS) | 10 bits worker_id | 12 bits sequence`

use std::fmt;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// 2024-01-01T00:00:00Z in milliseconds since the Unix epoch.
pub const EPOCH_MS: u64 = 1_704_067_200_000;

const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_WORKER_ID: u16 = (1 << WORKER_BITS) - 1;
const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;

#[derive(Debug, thiserror::Error)]
pub enum SnowflakeError {
    #[error("worker id {0} exceeds the maximum of {MAX_WORKER_ID}")]
    WorkerIdOutOfRange(u16),
    #[error("system clock moved backward by {millis}ms; refusing to generate ids")]
    ClockWentBackward { millis: u64 },
    #[error("system clock is before the snowflake epoch")]
    ClockBeforeEpoch,
}

struct GeneratorState {
    last_timestamp_ms: u64,
    sequence: u16,
}

/// Generates strictly-increasing 64-bit ids for a single worker.
///
/// Cheap to clone (shares the inner mutex); one instance should be created
/// per process and reused for every id allocation.
#[derive(Clone)]
pub struct Snowflake {
    worker_id: u16,
    state: std::sync::Arc<Mutex<GeneratorState>>,
}

impl Snowflake {
    pub fn new(worker_id: u16) -> Result<Self, SnowflakeError> {
        if worker_id > MAX_WORKER_ID {
            return Err(SnowflakeError::WorkerIdOutOfRange(worker_id));
        }
        Ok(Self {
            worker_id,
            state: std::sync::Arc::new(Mutex::new(GeneratorState {
                last_timestamp_ms: 0,
                sequence: 0,
            })),
        })
    }

    pub fn worker_id(&self) -> u16 {
        self.worker_id
    }

    /// Produces the next id for this worker. Blocks (via a short spin/yield
    /// loop) if the per-millisecond sequence space is exhausted before the
    /// clock advances.
    pub fn generate(&self) -> Result<Id, SnowflakeError> {
        let mut state = self.state.lock().unwrap();
        loop {
            let now = current_millis()?;

            if now < state.last_timestamp_ms {
                return Err(SnowflakeError::ClockWentBackward {
                    millis: state.last_timestamp_ms - now,
                });
            }

            if now == state.last_timestamp_ms {
                if state.sequence >= MAX_SEQUENCE {
                    // Sequence exhausted within this millisecond: wait for the
                    // clock to tick over before issuing the next id.
                    std::thread::yield_now();
                    continue;
                }
                state.sequence += 1;
            } else {
                state.sequence = 0;
            }

            state.last_timestamp_ms = now;
            let elapsed = now - EPOCH_MS;
            let raw = (elapsed << (WORKER_BITS + SEQUENCE_BITS))
                | ((self.worker_id as u64) << SEQUENCE_BITS)
                | state.sequence as u64;
            return Ok(Id(raw));
        }
    }

    /// Decompose an id into its constituent parts without needing a
    /// generator instance.
    pub fn parse(id: Id) -> (u64, u16, u16) {
        let raw = id.0;
        let sequence = (raw & MAX_SEQUENCE as u64) as u16;
        let worker_id = ((raw >> SEQUENCE_BITS) & MAX_WORKER_ID as u64) as u16;
        let timestamp_ms = (raw >> (WORKER_BITS + SEQUENCE_BITS)) + EPOCH_MS;
        (timestamp_ms, worker_id, sequence)
    }
}

fn current_millis() -> Result<u64, SnowflakeError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| SnowflakeError::ClockBeforeEpoch)?
        .as_millis() as u64;
    if now < EPOCH_MS {
        return Err(SnowflakeError::ClockBeforeEpoch);
    }
    Ok(now)
}

/// A generated 64-bit id. Serializes to/from a decimal string at every
/// external boundary so JSON number precision loss never bites consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(pub u64);

impl Id {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn timestamp_ms(self) -> u64 {
        Snowflake::parse(self).0
    }

    pub fn timestamp(self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(self.timestamp_ms() as i64)
            .unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Id {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Id(s.parse()?))
    }
}

impl From<u64> for Id {
    fn from(value: u64) -> Self {
        Id(value)
    }
}

impl Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct IdVisitor;

        impl Visitor<'_> for IdVisitor {
            type Value = Id;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a decimal-string-encoded 64-bit id")
            }

            fn visit_str<E>(self, v: &str) -> Result<Id, E>
            where
                E: de::Error,
            {
                v.parse::<u64>().map(Id).map_err(de::Error::custom)
            }

            fn visit_u64<E>(self, v: u64) -> Result<Id, E>
            where
                E: de::Error,
            {
                Ok(Id(v))
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

/// `sqlx` stores ids as `BIGINT` (signed 64-bit); we keep the bit pattern
/// and reinterpret at the boundary instead of truncating the keyspace.
impl sqlx::Type<sqlx::Postgres> for Id {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <i64 as sqlx::Type<sqlx::Postgres>>::type_info()
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for Id {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        <i64 as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&(self.0 as i64), buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for Id {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let raw = <i64 as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Ok(Id(raw as u64))
    }
}

impl sqlx::postgres::PgHasArrayType for Id {
    fn array_type_info() -> sqlx::postgres::PgTypeInfo {
        <i64 as sqlx::postgres::PgHasArrayType>::array_type_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_is_monotonic_within_a_worker() {
        let r#gen = Snowflake::new(1).unwrap();
        let mut last = r#gen.generate().unwrap();
        for _ in 0..5_000 {
            let next = r#gen.generate().unwrap();
            assert!(next > last, "ids must strictly increase within a worker");
            last = next;
        }
    }

    #[test]
    fn generate_is_unique_across_many_calls() {
        let r#gen = Snowflake::new(2).unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            let id = r#gen.generate().unwrap();
            assert!(seen.insert(id.as_u64()), "id {} generated twice", id);
        }
    }

    #[test]
    fn distinct_workers_produce_distinct_ids() {
        let a = Snowflake::new(3).unwrap();
        let b = Snowflake::new(4).unwrap();
        let ida = a.generate().unwrap();
        let idb = b.generate().unwrap();
        assert_ne!(ida, idb);
        let (_, worker_a, _) = Snowflake::parse(ida);
        let (_, worker_b, _) = Snowflake::parse(idb);
        assert_eq!(worker_a, 3);
        assert_eq!(worker_b, 4);
    }

    #[test]
    fn parse_roundtrips_worker_id() {
        let r#gen = Snowflake::new(777).unwrap();
        let id = r#gen.generate().unwrap();
        let (_, worker_id, _) = Snowflake::parse(id);
        assert_eq!(worker_id, 777);
    }

    #[test]
    fn rejects_worker_id_out_of_range() {
        assert!(matches!(
            Snowflake::new(1024),
            Err(SnowflakeError::WorkerIdOutOfRange(1024))
        ));
    }

    #[test]
    fn id_serializes_as_decimal_string() {
        let id = Id(123456789012345);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"123456789012345\"");
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn timestamp_of_matches_generation_time() {
        let r#gen = Snowflake::new(5).unwrap();
        let before = current_millis().unwrap();
        let id = r#gen.generate().unwrap();
        let after = current_millis().unwrap();
        let ts = id.timestamp_ms();
        assert!(ts >= before && ts <= after);
    }
}
