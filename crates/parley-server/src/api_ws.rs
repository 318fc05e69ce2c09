//! WebSocket upgrade endpoint.
//!
//! Authentication happens before the upgrade: the session token comes from
//! the session cookie or, for clients that cannot set cookies on a socket
//! request, a `token` query parameter. The cookie is tried first and the
//! query token second. A request that fails verification never reaches the
//! hub.

use crate::connection;
use crate::middleware::{authenticate, session_cookie};
use crate::AppState;
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Extension, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct WsConnectParams {
    pub token: Option<String>,
}

/// GET /ws
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<WsConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let candidates: Vec<String> = session_cookie(&headers, &state.cookie_name)
        .map(str::to_string)
        .into_iter()
        .chain(params.token.filter(|t| !t.is_empty()))
        .collect();

    if candidates.is_empty() {
        tracing::warn!(remote_addr = %addr, "websocket connect missing session token");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    // The cookie wins when it verifies; a stale one falls through to the
    // query token.
    let mut status = StatusCode::UNAUTHORIZED;
    let mut authenticated = None;
    for token in &candidates {
        match authenticate(&state, token).await {
            Ok(user) => {
                authenticated = Some(user);
                break;
            }
            Err(code) => status = code,
        }
    }

    let Some(user) = authenticated else {
        tracing::warn!(remote_addr = %addr, status = %status, "websocket auth failed");
        return status.into_response();
    };

    tracing::info!(user_id = user.id, remote_addr = %addr, "websocket auth success");

    let hub = state.hub.clone();
    let settings = state.connection_settings;
    ws.on_upgrade(move |socket| connection::serve(socket, hub, user.id, settings))
}
