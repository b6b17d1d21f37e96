use serde::{Deserialize, Serialize};

use crate::value_objects::{MeetingId, UserId};

/// 聊天侧关心的会议信息：主持人、容量以及当前参与者。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meeting {
    pub id: MeetingId,
    pub host_id: UserId,
    pub max_participants: u32,
    pub participant_ids: Vec<UserId>,
}

impl Meeting {
    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.participant_ids.contains(&user_id)
    }

    pub fn is_host(&self, user_id: UserId) -> bool {
        self.host_id == user_id
    }

    pub fn is_full(&self) -> bool {
        self.participant_ids.len() >= self.max_participants as usize
    }
}
