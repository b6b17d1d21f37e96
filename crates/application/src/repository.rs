//! 持久化网关端口
//!
//! 聊天核心只消费这些接口，具体实现位于 infrastructure。

use async_trait::async_trait;
use domain::{ChatIdentity, ChatMessage, Meeting, MeetingId, RepositoryError, UserId};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatMessageRepository: Send + Sync {
    // 保存消息并返回存储后的表示，广播前必须先落库
    async fn save(&self, message: ChatMessage) -> Result<ChatMessage, RepositoryError>;

    // 房间最近的消息，按创建时间倒序
    async fn recent(
        &self,
        meeting_id: MeetingId,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MeetingRepository: Send + Sync {
    async fn find_by_id(&self, id: MeetingId) -> Result<Option<Meeting>, RepositoryError>;

    /// 会议未满且用户尚未加入时添加参与者，返回是否添加成功
    async fn add_participant(
        &self,
        meeting_id: MeetingId,
        user_id: UserId,
        max_participants: u32,
    ) -> Result<bool, RepositoryError>;

    /// 返回用户是否确实被移除
    async fn remove_participant(
        &self,
        meeting_id: MeetingId,
        user_id: UserId,
    ) -> Result<bool, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// 查询用户的聊天身份（昵称、头像）
    async fn find_identity(&self, id: UserId) -> Result<Option<ChatIdentity>, RepositoryError>;
}
