pub mod auth;
pub mod bans;
pub mod channels;
pub mod guilds;
pub mod invites;
pub mod roles;

use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use crate::gateway::connection::handle_connection;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .nest("/api/v1", api_routes())
        .route("/gateway", get(gateway_upgrade))
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .nest("/auth", auth::routes())
        .nest(
            "/guilds",
            guilds::routes().merge(roles::routes()).merge(invites::routes()).merge(bans::routes()),
        )
        .nest("/channels", channels::routes())
        .merge(invites::resolve_routes())
}

async fn health_check() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

async fn gateway_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(state, socket))
}
