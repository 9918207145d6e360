use std::sync::Arc;

use sqlx::PgPool;

use crate::config::AppConfig;
use crate::events::RedisStreamBus;
use crate::gateway::GatewayState;
use crate::messages::MessagePipeline;
use crate::permissions::SharedPermissionEngine;
use crate::snowflake::Snowflake;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub redis: redis::aio::ConnectionManager,
    pub config: Arc<AppConfig>,
    pub gateway: Arc<GatewayState>,
    pub bus: Arc<RedisStreamBus>,
    pub permissions: SharedPermissionEngine,
    pub ids: Snowflake,
    pub messages: MessagePipeline,
}
