use std::sync::Arc;

use domain::{DomainError, Meeting, MeetingEvent, MeetingId, UserId};
use tracing::info;

use crate::{error::ApplicationError, events::MeetingEventPublisher, repository::MeetingRepository};

pub struct MeetingServiceDependencies {
    pub meeting_repository: Arc<dyn MeetingRepository>,
    pub publisher: MeetingEventPublisher,
}

/// 会议参与关系用例。参与关系变更落库后发布会议事件，由事件工作者生成系统消息。
pub struct MeetingService {
    deps: MeetingServiceDependencies,
}

impl MeetingService {
    pub fn new(deps: MeetingServiceDependencies) -> Self {
        Self { deps }
    }

    async fn load_meeting(&self, meeting_id: MeetingId) -> Result<Meeting, ApplicationError> {
        let meeting = self
            .deps
            .meeting_repository
            .find_by_id(meeting_id)
            .await?
            .ok_or(DomainError::MeetingNotFound)?;
        Ok(meeting)
    }

    /// 会议必须存在且用户是参与者
    pub async fn verify_participation(
        &self,
        meeting_id: MeetingId,
        user_id: UserId,
    ) -> Result<Meeting, ApplicationError> {
        let meeting = self.load_meeting(meeting_id).await?;
        if !meeting.is_participant(user_id) {
            return Err(DomainError::NotParticipant.into());
        }
        Ok(meeting)
    }

    pub async fn join_meeting(
        &self,
        meeting_id: MeetingId,
        user_id: UserId,
    ) -> Result<(), ApplicationError> {
        let meeting = self.load_meeting(meeting_id).await?;
        // 快速拒绝；并发加入时的最终判断由仓储完成
        if meeting.is_participant(user_id) || meeting.is_full() {
            return Err(DomainError::JoinRejected.into());
        }

        let added = self
            .deps
            .meeting_repository
            .add_participant(meeting_id, user_id, meeting.max_participants)
            .await?;
        if !added {
            return Err(DomainError::JoinRejected.into());
        }

        info!(meeting_id = %meeting_id, user_id = %user_id, "user joined meeting");
        self.deps.publisher.publish(MeetingEvent::joined(meeting_id, user_id));
        Ok(())
    }

    pub async fn leave_meeting(
        &self,
        meeting_id: MeetingId,
        user_id: UserId,
    ) -> Result<(), ApplicationError> {
        let meeting = self.load_meeting(meeting_id).await?;
        if meeting.is_host(user_id) {
            return Err(DomainError::HostCannotLeave.into());
        }

        let removed = self
            .deps
            .meeting_repository
            .remove_participant(meeting_id, user_id)
            .await?;
        if !removed {
            return Err(DomainError::NotParticipant.into());
        }

        info!(meeting_id = %meeting_id, user_id = %user_id, "user left meeting");
        self.deps.publisher.publish(MeetingEvent::left(meeting_id, user_id));
        Ok(())
    }
}
