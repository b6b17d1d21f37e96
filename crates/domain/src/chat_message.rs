//! 聊天消息
//!
//! 持久化之后的消息就是客户端收到的广播帧，字段命名沿用客户端已有的 JSON 格式。

use serde::{Deserialize, Serialize};

use crate::identity::ChatIdentity;
use crate::meeting_event::MeetingEventKind;
use crate::value_objects::{MeetingId, MessageContent, MessageId, Timestamp, UserId};

/// 消息类型：普通聊天、加入通知、离开通知。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChatKind {
    Talk,
    Join,
    Leave,
    /// 无法识别的类型，兼容旧数据
    #[serde(other)]
    Unknown,
}

impl ChatKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatKind::Talk => "TALK",
            ChatKind::Join => "JOIN",
            ChatKind::Leave => "LEAVE",
            ChatKind::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "TALK" => ChatKind::Talk,
            "JOIN" => ChatKind::Join,
            "LEAVE" => ChatKind::Leave,
            _ => ChatKind::Unknown,
        }
    }

    pub fn is_system(self) -> bool {
        matches!(self, ChatKind::Join | ChatKind::Leave)
    }
}

/// 已持久化的聊天消息，创建后不可变。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    #[serde(rename = "meetingID")]
    pub meeting_id: MeetingId,
    #[serde(rename = "senderID")]
    pub sender_id: UserId,
    #[serde(rename = "senderName")]
    pub sender_name: String,
    #[serde(rename = "senderProfileUri")]
    pub sender_profile_uri: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    #[serde(rename = "createdAt")]
    pub created_at: Timestamp,
}

impl ChatMessage {
    /// 用户发送的普通聊天消息
    pub fn talk(
        id: MessageId,
        meeting_id: MeetingId,
        sender: &ChatIdentity,
        content: MessageContent,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            meeting_id,
            sender_id: sender.user_id,
            sender_name: sender.nickname.clone(),
            sender_profile_uri: sender.profile_uri.clone(),
            content: content.into_inner(),
            kind: ChatKind::Talk,
            created_at,
        }
    }

    /// 加入/离开会议时生成的系统消息，发送者就是触发事件的用户
    pub fn system(
        id: MessageId,
        meeting_id: MeetingId,
        subject: &ChatIdentity,
        event: MeetingEventKind,
        created_at: Timestamp,
    ) -> Self {
        let content = match event {
            MeetingEventKind::Join => format!("{} joined the meeting.", subject.nickname),
            MeetingEventKind::Leave => format!("{} left the meeting.", subject.nickname),
        };

        Self {
            id,
            meeting_id,
            sender_id: subject.user_id,
            sender_name: subject.nickname.clone(),
            sender_profile_uri: subject.profile_uri.clone(),
            content,
            kind: event.chat_kind(),
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn identity() -> ChatIdentity {
        ChatIdentity::new(UserId::from(Uuid::new_v4()), "momo", "https://cdn.example.com/momo.png")
    }

    #[test]
    fn test_message_serializes_with_client_field_names() {
        let message = ChatMessage::talk(
            MessageId::generate(),
            MeetingId::from(Uuid::new_v4()),
            &identity(),
            MessageContent::new("hello").unwrap(),
            Utc::now(),
        );

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "TALK");
        assert_eq!(json["content"], "hello");
        assert_eq!(json["senderName"], "momo");
        assert_eq!(json["senderProfileUri"], "https://cdn.example.com/momo.png");
        assert_eq!(json["meetingID"], message.meeting_id.to_string());
        assert_eq!(json["senderID"], message.sender_id.to_string());
        assert!(json["createdAt"].is_string());
    }

    #[test]
    fn test_unknown_kind_is_tolerated() {
        let kind: ChatKind = serde_json::from_str("\"POLL\"").unwrap();
        assert_eq!(kind, ChatKind::Unknown);
        assert_eq!(serde_json::to_string(&ChatKind::Unknown).unwrap(), "\"UNKNOWN\"");
        assert_eq!(ChatKind::parse("LEAVE"), ChatKind::Leave);
    }

    #[test]
    fn test_system_message_mentions_nickname() {
        let subject = identity();
        let message = ChatMessage::system(
            MessageId::generate(),
            MeetingId::from(Uuid::new_v4()),
            &subject,
            MeetingEventKind::Join,
            Utc::now(),
        );

        assert_eq!(message.kind, ChatKind::Join);
        assert!(message.kind.is_system());
        assert_eq!(message.content, "momo joined the meeting.");
        assert_eq!(message.sender_id, subject.user_id);
    }
}
