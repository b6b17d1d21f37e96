use application::ApplicationError;
use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{HeaderMap, StatusCode, Uri},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use domain::{ChatMessage, DomainError, MeetingId};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::ApiError,
    state::AppState,
    ws_connection::ChatConnection,
};

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct PingResponse {
    message: &'static str,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ping", get(ping))
        .route("/ws/meetings/{meeting_id}", get(websocket_upgrade))
        .route("/meetings/{meeting_id}/chats", get(get_chat_history))
        .route("/meetings/{meeting_id}/join", post(join_meeting))
        .route("/meetings/{meeting_id}/leave", post(leave_meeting))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn ping() -> Json<PingResponse> {
    Json(PingResponse {
        message: "meeting chat server is running!",
    })
}

async fn get_chat_history(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(meeting_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(state.chat_config.history_default_limit)
        .clamp(1, state.chat_config.history_max_limit);

    let history = state
        .chat_service
        .get_chat_history(MeetingId::from(meeting_id), user_id, limit)
        .await?;

    Ok(Json(history))
}

async fn join_meeting(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(meeting_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .meeting_service
        .join_meeting(MeetingId::from(meeting_id), user_id)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

async fn leave_meeting(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(meeting_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .meeting_service
        .leave_meeting(MeetingId::from(meeting_id), user_id)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// 认证和参与关系校验都在升级之前完成，失败时返回普通 HTTP 错误
async fn websocket_upgrade(
    State(state): State<AppState>,
    Path(meeting_id): Path<Uuid>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let user_id = state.jwt_service.authenticate(&headers, uri.query())?;
    let meeting_id = MeetingId::from(meeting_id);

    state
        .meeting_service
        .verify_participation(meeting_id, user_id)
        .await?;

    let identity = state
        .user_repository
        .find_identity(user_id)
        .await
        .map_err(ApplicationError::from)?
        .ok_or(ApplicationError::Domain(DomainError::UserNotFound))?;

    let deps = state.connection_deps();
    Ok(ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        match ChatConnection::admit(sink, stream, meeting_id, identity, deps).await {
            Ok(connection) => connection.closed().await,
            Err(err) => {
                tracing::warn!(meeting_id = %meeting_id, error = %err, "failed to admit chat connection");
            }
        }
    }))
}
