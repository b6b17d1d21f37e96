use std::sync::Arc;

use application::{ChatService, HubHandle, MeetingService, UserRepository};
use config::ChatConfig;

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub chat_service: Arc<ChatService>,
    pub meeting_service: Arc<MeetingService>,
    pub user_repository: Arc<dyn UserRepository>,
    pub hub: HubHandle,
    pub jwt_service: Arc<JwtService>,
    pub chat_config: Arc<ChatConfig>,
}

impl AppState {
    pub fn new(
        chat_service: Arc<ChatService>,
        meeting_service: Arc<MeetingService>,
        user_repository: Arc<dyn UserRepository>,
        hub: HubHandle,
        jwt_service: Arc<JwtService>,
        chat_config: ChatConfig,
    ) -> Self {
        Self {
            chat_service,
            meeting_service,
            user_repository,
            hub,
            jwt_service,
            chat_config: Arc::new(chat_config),
        }
    }

    /// 广播中心和持久化依赖的集合，交给每个 WebSocket 连接
    pub fn connection_deps(&self) -> crate::ws_connection::ConnectionDeps {
        crate::ws_connection::ConnectionDeps {
            hub: self.hub.clone(),
            chat_service: Arc::clone(&self.chat_service),
            mailbox_capacity: self.chat_config.mailbox_capacity,
        }
    }
}
