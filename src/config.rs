use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub bus: BusConfig,
    pub auth: AuthConfig,
    pub instance: InstanceConfig,
    pub gateway: GatewayConfig,
    pub permissions: PermissionsConfig,
    pub messages: MessagesConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Connection info for the durable event bus (Redis Streams) and the
/// permission cache, which share the same Redis instance.
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    pub url: String,
    /// Must be unique per running gateway process so each instance gets its
    /// own consumer group and receives every broadcast event.
    pub consumer_group_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub access_token_ttl_secs: i64,
    pub refresh_token_ttl_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub domain: String,
    pub name: String,
    /// Snowflake worker id (0-1023). Must be unique per process.
    pub worker_id: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub outgoing_queue_size: usize,
    pub events_per_second: u32,
    pub replay_window_secs: i64,
    pub replay_window_max_events: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PermissionsConfig {
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagesConfig {
    pub max_content_length: usize,
    pub default_page_size: i64,
    pub max_page_size: i64,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(
                config::Environment::with_prefix("GREATHALL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
