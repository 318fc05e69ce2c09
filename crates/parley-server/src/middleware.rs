use axum::{
    body::Body,
    http::{header, HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use parley_types::User;
use std::sync::Arc;

use crate::gateway::PersistenceError;
use crate::session::cookie_value;
use crate::AppState;

/// The authenticated user, stored in request extensions.
#[derive(Clone, Debug)]
pub struct SessionUser(pub User);

/// Reads the session cookie out of `headers`.
pub fn session_cookie<'a>(headers: &'a HeaderMap, cookie_name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| cookie_value(value, cookie_name))
}

/// Verifies a session token and loads the user it names.
///
/// Token failures and unknown users are `401`; storage failures are `500`.
pub async fn authenticate(state: &AppState, token: &str) -> Result<User, StatusCode> {
    let user_id = state.sessions.verify_user(token).map_err(|e| {
        tracing::warn!(error = %e, "session token verification failed");
        StatusCode::UNAUTHORIZED
    })?;

    let gateway = state.gateway.clone();
    tokio::task::spawn_blocking(move || gateway.get_user_by_id(user_id))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map_err(|e| match e {
            PersistenceError::NotFound(_) => {
                tracing::warn!(user_id, "session names an unknown user");
                StatusCode::UNAUTHORIZED
            }
            err => {
                tracing::error!(user_id, error = %err, "failed to load session user");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })
}

/// Middleware to authenticate requests via the session cookie.
pub async fn auth_middleware(mut req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    let token = session_cookie(req.headers(), &state.cookie_name)
        .ok_or(StatusCode::UNAUTHORIZED)?
        .to_string();

    let user = authenticate(&state, &token).await?;
    req.extensions_mut().insert(SessionUser(user));

    Ok(next.run(req).await)
}
