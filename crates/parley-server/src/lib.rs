//! Parley server library logic.

pub mod api_chats;
pub mod api_ws;
pub mod config;
pub mod connection;
pub mod gateway;
pub mod hub;
pub mod middleware;
pub mod notify;
pub mod session;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use connection::ConnectionSettings;
use gateway::PersistenceGateway;
use hub::HubHandle;
use notify::NotificationSink;
use parley_db::DbPool;
use serde_json::{json, Value};
use session::SessionCodec;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Storage seen by the hub and the upgrade handler.
    pub gateway: Arc<dyn PersistenceGateway>,
    /// Session token codec.
    pub sessions: Arc<SessionCodec>,
    /// Name of the session cookie.
    pub cookie_name: String,
    /// Handle to the running dispatch loop.
    pub hub: HubHandle,
    /// Notification entry point for HTTP handlers.
    pub notifier: NotificationSink,
    /// Settings applied to each new socket.
    pub connection_settings: ConnectionSettings,
}

/// Maximum request body size (1 MiB).
const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route(
            "/api/chats",
            post(api_chats::create_chat_handler).get(api_chats::list_chats_handler),
        )
        .route("/api/chats/{chatId}", delete(api_chats::delete_chat_handler))
        .route(
            "/api/chats/{chatId}/participants",
            get(api_chats::list_participants_handler),
        )
        .route("/api/users/search", get(api_chats::search_users_handler))
        .route(
            "/api/chats/{chatId}/messages",
            get(api_chats::get_chat_history_handler),
        )
        .route(
            "/api/chats/{chatId}/invite",
            post(api_chats::invite_handler),
        )
        .route(
            "/api/chats/{chatId}/participants/{userId}",
            delete(api_chats::remove_participant_handler),
        )
        .layer(axum::middleware::from_fn(middleware::auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(api_ws::ws_handler))
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
