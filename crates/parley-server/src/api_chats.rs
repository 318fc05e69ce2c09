//! Chat management endpoints.
//!
//! These sit beside the real-time core: they mutate participation through
//! `parley-chats` and tell affected users about it through the notification
//! sink. The hub observes the new participation on its next broadcast.

use crate::middleware::SessionUser;
use crate::AppState;
use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::Json,
};
use parley_chats::{
    add_participant, create_chat, delete_chat, get_chat, is_participant, list_messages,
    list_participants, list_user_chats, remove_participant, search_users, ChatError,
};
use parley_types::{Chat, ChatEvent, ChatId, ChatMessage, Participant, UserId, UserSummary};
use serde::Deserialize;
use std::sync::Arc;

/// Maximum length for a chat name.
const MAX_CHAT_NAME_LEN: usize = 256;

/// Maximum number of users returned by one directory search.
const USER_SEARCH_LIMIT: u32 = 10;

/// Maps a [`ChatError`] to a status code, logging storage failures.
fn chat_err_to_status(e: ChatError) -> StatusCode {
    match e {
        ChatError::NotFound(_) => StatusCode::NOT_FOUND,
        err => {
            tracing::error!(error = %err, "chat operation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Runs a storage closure on the blocking pool with a pooled connection.
async fn with_conn<T, F>(state: &AppState, f: F) -> Result<T, StatusCode>
where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Connection) -> Result<T, StatusCode> + Send + 'static,
{
    let pool = state.pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|e| {
            tracing::error!(error = %e, "failed to check out database connection");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
        f(&conn)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
}

#[derive(Deserialize)]
pub struct CreateChatRequest {
    pub name: String,
    pub encrypted_key: String,
}

#[derive(Deserialize)]
pub struct InviteRequest {
    pub user_id: UserId,
    pub encrypted_key: String,
}

#[derive(Deserialize)]
pub struct HistoryParams {
    pub limit: Option<u32>,
}

#[derive(Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
}

/// POST /api/chats
pub async fn create_chat_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(SessionUser(user)): Extension<SessionUser>,
    Json(payload): Json<CreateChatRequest>,
) -> Result<(StatusCode, Json<Chat>), StatusCode> {
    let name = payload.name.trim().to_string();
    if name.is_empty() || name.len() > MAX_CHAT_NAME_LEN {
        return Err(StatusCode::BAD_REQUEST);
    }

    let owner_id = user.id;
    let chat = with_conn(&state, move |conn| {
        create_chat(conn, &name, owner_id, &payload.encrypted_key).map_err(chat_err_to_status)
    })
    .await?;

    tracing::info!(chat_id = chat.id, owner_id, "chat created");
    Ok((StatusCode::CREATED, Json(chat)))
}

/// GET /api/chats
pub async fn list_chats_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(SessionUser(user)): Extension<SessionUser>,
) -> Result<Json<Vec<Chat>>, StatusCode> {
    let chats = with_conn(&state, move |conn| {
        list_user_chats(conn, user.id).map_err(chat_err_to_status)
    })
    .await?;
    Ok(Json(chats))
}

/// GET /api/chats/{chatId}/messages
pub async fn get_chat_history_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(SessionUser(user)): Extension<SessionUser>,
    Path(chat_id): Path<ChatId>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<ChatMessage>>, StatusCode> {
    let messages = with_conn(&state, move |conn| {
        if !is_participant(conn, chat_id, user.id).map_err(chat_err_to_status)? {
            return Err(StatusCode::FORBIDDEN);
        }
        list_messages(conn, chat_id, params.limit).map_err(chat_err_to_status)
    })
    .await?;
    Ok(Json(messages))
}

/// POST /api/chats/{chatId}/invite
///
/// The inviter must already participate. The invitee is told about the chat
/// on every live connection.
pub async fn invite_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(SessionUser(user)): Extension<SessionUser>,
    Path(chat_id): Path<ChatId>,
    Json(payload): Json<InviteRequest>,
) -> Result<StatusCode, StatusCode> {
    let inviter_id = user.id;
    let invitee_id = payload.user_id;

    with_conn(&state, move |conn| {
        get_chat(conn, chat_id).map_err(chat_err_to_status)?;
        if !is_participant(conn, chat_id, inviter_id).map_err(chat_err_to_status)? {
            return Err(StatusCode::FORBIDDEN);
        }
        add_participant(conn, chat_id, invitee_id, &payload.encrypted_key)
            .map_err(chat_err_to_status)
    })
    .await?;

    tracing::info!(chat_id, inviter_id, invitee_id, "participant invited");
    state
        .notifier
        .notify_or_log(invitee_id, &ChatEvent::NewChat { chat_id })
        .await;

    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/chats/{chatId}/participants/{userId}
///
/// Allowed for the chat owner, or for a participant removing themselves.
pub async fn remove_participant_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(SessionUser(user)): Extension<SessionUser>,
    Path((chat_id, target_id)): Path<(ChatId, UserId)>,
) -> Result<StatusCode, StatusCode> {
    let actor_id = user.id;

    with_conn(&state, move |conn| {
        let chat = get_chat(conn, chat_id).map_err(chat_err_to_status)?;
        if actor_id != chat.owner_id && actor_id != target_id {
            return Err(StatusCode::FORBIDDEN);
        }
        if remove_participant(conn, chat_id, target_id).map_err(chat_err_to_status)? {
            Ok(())
        } else {
            Err(StatusCode::NOT_FOUND)
        }
    })
    .await?;

    tracing::info!(chat_id, actor_id, user_id = target_id, "participant removed");
    state
        .notifier
        .notify_or_log(target_id, &ChatEvent::RemovedFromChat { chat_id })
        .await;

    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/chats/{chatId}/participants
pub async fn list_participants_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(SessionUser(user)): Extension<SessionUser>,
    Path(chat_id): Path<ChatId>,
) -> Result<Json<Vec<Participant>>, StatusCode> {
    let participants = with_conn(&state, move |conn| {
        get_chat(conn, chat_id).map_err(chat_err_to_status)?;
        if !is_participant(conn, chat_id, user.id).map_err(chat_err_to_status)? {
            return Err(StatusCode::FORBIDDEN);
        }
        list_participants(conn, chat_id).map_err(chat_err_to_status)
    })
    .await?;
    Ok(Json(participants))
}

/// DELETE /api/chats/{chatId}
///
/// Owner only. Every former participant is told the chat is gone.
pub async fn delete_chat_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(SessionUser(user)): Extension<SessionUser>,
    Path(chat_id): Path<ChatId>,
) -> Result<StatusCode, StatusCode> {
    let actor_id = user.id;

    let members = with_conn(&state, move |conn| {
        let chat = get_chat(conn, chat_id).map_err(chat_err_to_status)?;
        if chat.owner_id != actor_id {
            return Err(StatusCode::FORBIDDEN);
        }
        let members = list_participants(conn, chat_id).map_err(chat_err_to_status)?;
        if !delete_chat(conn, chat_id).map_err(chat_err_to_status)? {
            return Err(StatusCode::NOT_FOUND);
        }
        Ok(members)
    })
    .await?;

    tracing::info!(chat_id, owner_id = actor_id, members = members.len(), "chat deleted");
    let event = ChatEvent::ChatDeleted { chat_id };
    for member in members {
        state.notifier.notify_or_log(member.user_id, &event).await;
    }

    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/users/search?q=
pub async fn search_users_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(SessionUser(_)): Extension<SessionUser>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<UserSummary>>, StatusCode> {
    let users = with_conn(&state, move |conn| {
        search_users(conn, &params.q, USER_SEARCH_LIMIT).map_err(chat_err_to_status)
    })
    .await?;
    Ok(Json(users))
}
