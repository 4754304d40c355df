//! 主应用程序入口
//!
//! 加载配置，装配存储、实时消息核心和 Axum 路由，然后启动服务。

use std::sync::Arc;

use application::{
    ChatService, ChatServiceDependencies, ConnectionRegistry, InMemoryProfileDirectory,
    InMemoryStore, SystemClock,
};
use config::{AppConfig, StorageBackend};
use domain::{ConversationRepository, MessageRepository};
use infrastructure::Infrastructure;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtIdentityVerifier};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    // RUST_LOG 优先，其次是配置文件里的过滤规则
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.filter.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if config.uses_development_secret() {
        tracing::warn!("using the development jwt secret, override HIRECHAT_AUTH__JWT_SECRET in production");
    }

    let (conversations, messages, profiles): (
        Arc<dyn ConversationRepository>,
        Arc<dyn MessageRepository>,
        Arc<dyn application::ProfileDirectory>,
    ) = match config.database.backend {
        StorageBackend::Postgres => {
            let infrastructure = Infrastructure::connect(&config.database).await?;
            (
                infrastructure.conversations(),
                infrastructure.messages(),
                infrastructure.profiles(),
            )
        }
        StorageBackend::Memory => {
            tracing::warn!("memory backend selected, conversations are lost on restart");
            let store = Arc::new(InMemoryStore::default());
            (
                store.clone(),
                store,
                Arc::new(InMemoryProfileDirectory::default()),
            )
        }
    };

    let (registry, presence_changes) = ConnectionRegistry::new();
    let chat_service = Arc::new(ChatService::new(ChatServiceDependencies {
        conversations,
        messages,
        profiles,
        clock: Arc::new(SystemClock),
        registry: Arc::new(registry),
        settings: config.realtime.clone(),
    }));
    let presence_task = Arc::clone(chat_service.presence()).spawn(presence_changes);

    let verifier = Arc::new(JwtIdentityVerifier::new(&config.auth));
    let state = AppState::new(chat_service, verifier, config.auth.timeout());
    let app = router(state);

    let address = config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(%address, backend = ?config.database.backend, "hirechat listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    presence_task.abort();
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
