//! 主应用程序入口
//!
//! 加载配置，准备存储，启动聊天广播中心和会议事件工作者，然后提供 HTTP / WebSocket 服务。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use application::{
    meeting_event_channel, ChatService, ChatServiceDependencies, Clock, Hub, MeetingEventWorker,
    MeetingService, MeetingServiceDependencies, SystemClock,
};
use config::AppConfig;
use infrastructure::Infrastructure;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService};

const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load().context("failed to load configuration")?;

    let infrastructure = Infrastructure::connect(&config.database)
        .await
        .context("failed to prepare storage")?;

    let (hub, _hub_task) = Hub::spawn(config.chat.hub_queue_capacity);
    let (publisher, events) = meeting_event_channel(config.chat.event_channel_capacity);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let chat_service = Arc::new(ChatService::new(ChatServiceDependencies {
        message_repository: infrastructure.message_repository.clone(),
        meeting_repository: infrastructure.meeting_repository.clone(),
        user_repository: infrastructure.user_repository.clone(),
        clock,
    }));
    let meeting_service = Arc::new(MeetingService::new(MeetingServiceDependencies {
        meeting_repository: infrastructure.meeting_repository.clone(),
        publisher,
    }));

    let worker_task =
        tokio::spawn(MeetingEventWorker::new(events, chat_service.clone(), hub.clone()).run());

    let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));
    let state = AppState::new(
        chat_service,
        meeting_service,
        infrastructure.user_repository.clone(),
        hub,
        jwt_service,
        config.chat.clone(),
    );

    let app = router(state);
    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;

    tracing::info!(address = %address, "meeting chat server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 路由释放后事件发布者随之丢弃，工作者处理完剩余事件后退出
    match tokio::time::timeout(WORKER_DRAIN_TIMEOUT, worker_task).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(error = %err, "meeting event worker ended abnormally"),
        Err(_) => tracing::warn!("meeting event worker did not drain in time"),
    }

    tracing::info!("meeting chat server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
