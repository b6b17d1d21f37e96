//! 会议生命周期事件
//!
//! 由会议服务在参与关系持久化之后发出，由事件工作者消费一次。

use serde::{Deserialize, Serialize};

use crate::chat_message::ChatKind;
use crate::value_objects::{MeetingId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MeetingEventKind {
    Join,
    Leave,
}

impl MeetingEventKind {
    /// 事件对应的系统消息类型
    pub fn chat_kind(self) -> ChatKind {
        match self {
            MeetingEventKind::Join => ChatKind::Join,
            MeetingEventKind::Leave => ChatKind::Leave,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingEvent {
    pub kind: MeetingEventKind,
    pub meeting_id: MeetingId,
    pub user_id: UserId,
}

impl MeetingEvent {
    pub fn joined(meeting_id: MeetingId, user_id: UserId) -> Self {
        Self {
            kind: MeetingEventKind::Join,
            meeting_id,
            user_id,
        }
    }

    pub fn left(meeting_id: MeetingId, user_id: UserId) -> Self {
        Self {
            kind: MeetingEventKind::Leave,
            meeting_id,
            user_id,
        }
    }
}
