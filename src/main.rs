mod api;
mod config;
mod db;
mod error;
mod events;
mod gateway;
mod messages;
mod permissions;
mod services;
mod snowflake;
mod state;
mod types;
mod workers;

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::events::RedisStreamBus;
use crate::gateway::GatewayState;
use crate::messages::MessagePipeline;
use crate::permissions::PermissionEngine;
use crate::snowflake::Snowflake;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::load()?;
    tracing::info!(domain = %config.instance.domain, "starting server");

    let db = db::create_pool(&config.database.url, config.database.max_connections).await?;
    tracing::info!("database connected and migrations applied");

    let redis_client = redis::Client::open(config.bus.url.as_str())?;
    let redis = redis::aio::ConnectionManager::new(redis_client).await?;
    tracing::info!("redis connected");

    let ids = Snowflake::new(config.instance.worker_id)?;
    let bus = Arc::new(RedisStreamBus::new(redis.clone(), ids.clone()));
    let permissions = Arc::new(PermissionEngine::new(db.clone(), redis.clone(), config.permissions.cache_ttl_secs));
    let gateway = Arc::new(GatewayState::new(config.gateway.clone()));
    let messages = MessagePipeline::new(
        db.clone(),
        bus.clone(),
        permissions.clone(),
        ids.clone(),
        config.messages.max_content_length,
        config.messages.default_page_size,
        config.messages.max_page_size,
    );

    let state = AppState { db, redis, config: Arc::new(config.clone()), gateway, bus, permissions, ids, messages };

    workers::spawn_all(state.clone());

    let app = api::router().layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive()).with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install CTRL+C handler");
    tracing::info!("shutting down");
}
