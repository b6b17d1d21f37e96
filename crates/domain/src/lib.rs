//! 会议聊天核心领域模型
//!
//! 包含会议、聊天消息、会议事件以及聊天身份等实体和值对象。

pub mod chat_message;
pub mod errors;
pub mod identity;
pub mod meeting;
pub mod meeting_event;
pub mod value_objects;

// 重新导出常用类型
pub use chat_message::{ChatKind, ChatMessage};
pub use errors::{DomainError, RepositoryError};
pub use identity::ChatIdentity;
pub use meeting::Meeting;
pub use meeting_event::{MeetingEvent, MeetingEventKind};
pub use value_objects::{
    MeetingId, MessageContent, MessageId, Timestamp, UserId, MAX_MESSAGE_CHARS,
};
