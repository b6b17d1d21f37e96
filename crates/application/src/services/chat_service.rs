use std::sync::Arc;

use domain::{
    ChatIdentity, ChatMessage, DomainError, MeetingEventKind, MeetingId, MessageContent,
    MessageId, UserId,
};
use tracing::debug;

use crate::{
    clock::Clock,
    error::ApplicationError,
    repository::{ChatMessageRepository, MeetingRepository, UserRepository},
};

pub struct ChatServiceDependencies {
    pub message_repository: Arc<dyn ChatMessageRepository>,
    pub meeting_repository: Arc<dyn MeetingRepository>,
    pub user_repository: Arc<dyn UserRepository>,
    pub clock: Arc<dyn Clock>,
}

/// 聊天消息用例：保存普通消息、生成系统消息、查询历史
pub struct ChatService {
    deps: ChatServiceDependencies,
}

impl ChatService {
    pub fn new(deps: ChatServiceDependencies) -> Self {
        Self { deps }
    }

    /// 校验并持久化一条普通聊天消息，返回存储后的消息
    pub async fn save_message(
        &self,
        meeting_id: MeetingId,
        sender: &ChatIdentity,
        content: String,
    ) -> Result<ChatMessage, ApplicationError> {
        let content = MessageContent::new(content)?;
        let message = ChatMessage::talk(
            MessageId::generate(),
            meeting_id,
            sender,
            content,
            self.deps.clock.now(),
        );

        let stored = self.deps.message_repository.save(message).await?;
        debug!(meeting_id = %meeting_id, message_id = %stored.id, "chat message persisted");
        Ok(stored)
    }

    /// 为加入/离开事件生成并持久化系统消息
    pub async fn save_system_message(
        &self,
        meeting_id: MeetingId,
        user_id: UserId,
        kind: MeetingEventKind,
    ) -> Result<ChatMessage, ApplicationError> {
        let subject = self
            .deps
            .user_repository
            .find_identity(user_id)
            .await?
            .ok_or(DomainError::UserNotFound)?;

        let message = ChatMessage::system(
            MessageId::generate(),
            meeting_id,
            &subject,
            kind,
            self.deps.clock.now(),
        );

        Ok(self.deps.message_repository.save(message).await?)
    }

    /// 会议参与者查询最近的聊天记录，按时间倒序
    pub async fn get_chat_history(
        &self,
        meeting_id: MeetingId,
        user_id: UserId,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, ApplicationError> {
        let meeting = self
            .deps
            .meeting_repository
            .find_by_id(meeting_id)
            .await?
            .ok_or(DomainError::MeetingNotFound)?;

        if !meeting.is_participant(user_id) {
            return Err(DomainError::NotParticipant.into());
        }

        Ok(self.deps.message_repository.recent(meeting_id, limit).await?)
    }
}
