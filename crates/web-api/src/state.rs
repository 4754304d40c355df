use std::sync::Arc;
use std::time::Duration;

use application::{ChatService, IdentityVerifier};

#[derive(Clone)]
pub struct AppState {
    pub chat_service: Arc<ChatService>,
    pub verifier: Arc<dyn IdentityVerifier>,
    /// 未认证连接的最长等待时间
    pub auth_timeout: Duration,
}

impl AppState {
    pub fn new(
        chat_service: Arc<ChatService>,
        verifier: Arc<dyn IdentityVerifier>,
        auth_timeout: Duration,
    ) -> Self {
        Self {
            chat_service,
            verifier,
            auth_timeout,
        }
    }
}
