use axum::{
    extract::{FromRequestParts, Path, Query, State, WebSocketUpgrade},
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use application::{MessagePayload, VerifyError};
use domain::{ConversationId, UserId};

use crate::{
    auth::bearer_token,
    dto::{ConversationDto, CreateConversationPayload, HistoryQuery, OpenRoomPayload},
    error::ApiError,
    state::AppState,
    ws_connection::WebSocketConnection,
};

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// 通过 bearer 凭证认证的调用方
pub struct AuthUser(pub UserId);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(&parts.headers) else {
            tracing::debug!(path = %parts.uri.path(), "request without credential");
            return Err(ApiError::unauthorized("missing bearer token"));
        };
        match state.verifier.verify(token).await {
            Ok(identity) => Ok(AuthUser(identity.user_id)),
            Err(err) => {
                tracing::debug!(path = %parts.uri.path(), error = %err, "request credential rejected");
                Err(ApiError::unauthorized("invalid bearer token"))
            }
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/rooms", post(open_room))
        .route("/conversations/{conversation_id}/messages", get(get_history))
        .route("/ws", get(websocket_upgrade))
}

/// 存活检查，顺带报告当前在线人数和连接数
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let registry = state.chat_service.registry();
    Json(serde_json::json!({
        "status": "ok",
        "onlineUsers": registry.online_users().await.len(),
        "connections": registry.connection_count().await,
    }))
}

async fn list_conversations(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Vec<ConversationDto>>, ApiError> {
    let summaries = state.chat_service.list_conversations(user_id).await?;
    Ok(Json(summaries.into_iter().map(ConversationDto::from).collect()))
}

async fn create_conversation(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<CreateConversationPayload>,
) -> Result<Json<ConversationDto>, ApiError> {
    let view = state
        .chat_service
        .get_or_create_direct(
            user_id,
            payload.participant_id,
            payload.title,
            payload.description,
        )
        .await?;
    Ok(Json(view.into()))
}

async fn open_room(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<OpenRoomPayload>,
) -> Result<(StatusCode, Json<ConversationDto>), ApiError> {
    let view = state
        .chat_service
        .open_room(
            user_id,
            payload.participant_id,
            payload.title,
            payload.description,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(view.into())))
}

async fn get_history(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<ConversationId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<MessagePayload>>, ApiError> {
    let messages = state
        .chat_service
        .history(user_id, conversation_id, query.limit)
        .await?;
    Ok(Json(messages))
}

/// 握手时带了凭证就先校验，失败直接拒绝升级；没带则升级后等待 `authenticate` 事件
async fn websocket_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> Response {
    let presented = bearer_token(&headers)
        .map(str::to_owned)
        .or(query.token)
        .filter(|token| !token.trim().is_empty());

    let identity = match presented {
        Some(token) => match state.verifier.verify(&token).await {
            Ok(identity) => Some(identity),
            Err(VerifyError::Missing) => {
                tracing::warn!("websocket upgrade rejected: credential missing");
                return ApiError::unauthorized("missing credential").into_response();
            }
            Err(VerifyError::Invalid(reason)) => {
                tracing::warn!(reason = %reason, "websocket upgrade rejected: credential rejected");
                return ApiError::unauthorized("invalid credential").into_response();
            }
        },
        None => None,
    };

    ws.on_upgrade(move |socket| WebSocketConnection::new(socket, state).run(identity))
}
