//! Web API 层。
//!
//! 提供 Axum 路由和 WebSocket 网关，将 HTTP / WebSocket 请求委托给应用层的 `ChatService`。

mod auth;
mod dto;
mod error;
mod protocol;
mod routes;
mod state;
mod ws_connection;

pub use auth::{bearer_token, Claims, JwtIdentityVerifier};
pub use dto::{ConversationDto, ParticipantDto};
pub use error::ApiError;
pub use protocol::ClientEvent;
pub use routes::{router, AuthUser};
pub use state::AppState;
