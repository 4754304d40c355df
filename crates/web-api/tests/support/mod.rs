#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use application::{
    ChatService, ChatServiceDependencies, ConnectionRegistry, InMemoryProfileDirectory,
    InMemoryStore, SystemClock,
};
use config::{AuthConfig, RealtimeConfig};
use domain::{DisplayProfile, UserId};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::Value;
use tokio::{net::TcpListener, net::TcpStream, sync::oneshot, time::timeout};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;
use web_api::{router, AppState, Claims, JwtIdentityVerifier};

pub const TEST_SECRET: &str = "integration-test-secret-0123456789abcdef";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub profiles: InMemoryProfileDirectory,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with_timeout(Duration::from_secs(5)).await
    }

    pub async fn start_with_timeout(auth_timeout: Duration) -> Self {
        let store = Arc::new(InMemoryStore::default());
        let profiles = InMemoryProfileDirectory::default();
        let (registry, presence_changes) = ConnectionRegistry::new();

        let chat_service = Arc::new(ChatService::new(ChatServiceDependencies {
            conversations: store.clone(),
            messages: store,
            profiles: Arc::new(profiles.clone()),
            clock: Arc::new(SystemClock),
            registry: Arc::new(registry),
            settings: RealtimeConfig::default(),
        }));
        Arc::clone(chat_service.presence()).spawn(presence_changes);

        let verifier = Arc::new(JwtIdentityVerifier::new(&AuthConfig {
            jwt_secret: TEST_SECRET.to_string(),
            issuer: None,
            timeout_secs: auth_timeout.as_secs(),
        }));
        let state = AppState::new(chat_service, verifier, auth_timeout);
        let app = router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            profiles,
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/api/v1/ws", self.addr)
    }

    /// 注册一个带展示资料的用户，返回 id 和凭证
    pub async fn user(&self, username: &str) -> (UserId, String) {
        let user_id = UserId::from(Uuid::new_v4());
        self.profiles
            .insert(DisplayProfile {
                user_id,
                username: username.to_string(),
                name: Some(username.to_uppercase()),
                role: Some("candidate".to_string()),
            })
            .await;
        (user_id, token_for(user_id))
    }

    /// 用 query 凭证建立连接，并等到 `authenticated`
    pub async fn connect(&self, token: &str) -> WsClient {
        let (mut client, _) = connect_async(format!("{}?token={}", self.ws_url(), token))
            .await
            .expect("connect websocket");
        let event = next_event(&mut client, "authenticated").await;
        assert_eq!(event["event"], "authenticated");
        client
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub fn token_for(user_id: UserId) -> String {
    let claims = Claims {
        sub: user_id.into(),
        exp: chrono::Utc::now().timestamp() + 3600,
        iss: None,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .expect("encode token")
}

pub async fn send_event(client: &mut WsClient, event: Value) {
    client
        .send(WsMessage::Text(event.to_string().into()))
        .await
        .expect("send event");
}

/// 读取下一个指定名称的事件，跳过其他事件
pub async fn next_event(client: &mut WsClient, name: &str) -> Value {
    timeout(Duration::from_secs(3), async {
        loop {
            let frame = client
                .next()
                .await
                .expect("stream ended")
                .expect("websocket error");
            if let WsMessage::Text(text) = frame {
                let value: Value = serde_json::from_str(text.as_str()).expect("json event");
                if value["event"] == name {
                    return value;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
}

/// 在给定时间内没有收到指定事件
pub async fn assert_no_event(client: &mut WsClient, name: &str, within: Duration) {
    let result = timeout(within, async {
        loop {
            match client.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let value: Value = serde_json::from_str(text.as_str()).expect("json event");
                    if value["event"] == name {
                        return value;
                    }
                }
                Some(Ok(_)) => continue,
                _ => futures_util::future::pending::<()>().await,
            }
        }
    })
    .await;
    if let Ok(value) = result {
        panic!("unexpected {name} event: {value}");
    }
}
