//! 会议事件队列与事件工作者
//!
//! 会议服务在参与关系落库后发布加入/离开事件；工作者逐个取出事件，
//! 每个事件在独立任务中生成系统消息、持久化并广播到对应房间。
//! 事件发布不会阻塞 HTTP 请求，队列写满时事件被丢弃并记录日志。

use std::sync::Arc;

use domain::MeetingEvent;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::{error::ApplicationError, hub::HubHandle, services::ChatService, wire};

/// 创建有界的会议事件队列
pub fn meeting_event_channel(
    capacity: usize,
) -> (MeetingEventPublisher, mpsc::Receiver<MeetingEvent>) {
    let (sender, receiver) = mpsc::channel(capacity);
    (MeetingEventPublisher { sender }, receiver)
}

#[derive(Clone, Debug)]
pub struct MeetingEventPublisher {
    sender: mpsc::Sender<MeetingEvent>,
}

impl MeetingEventPublisher {
    /// 非阻塞发布；返回事件是否进入队列
    pub fn publish(&self, event: MeetingEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(
                    meeting_id = %event.meeting_id,
                    user_id = %event.user_id,
                    kind = ?event.kind,
                    "meeting event queue full, dropping event"
                );
                false
            }
            Err(TrySendError::Closed(event)) => {
                warn!(
                    meeting_id = %event.meeting_id,
                    user_id = %event.user_id,
                    kind = ?event.kind,
                    "meeting event worker stopped, dropping event"
                );
                false
            }
        }
    }
}

pub struct MeetingEventWorker {
    receiver: mpsc::Receiver<MeetingEvent>,
    chat_service: Arc<ChatService>,
    hub: HubHandle,
}

impl MeetingEventWorker {
    pub fn new(
        receiver: mpsc::Receiver<MeetingEvent>,
        chat_service: Arc<ChatService>,
        hub: HubHandle,
    ) -> Self {
        Self {
            receiver,
            chat_service,
            hub,
        }
    }

    /// 持续消费事件，直到所有发布者都被丢弃
    pub async fn run(mut self) {
        info!("meeting event worker started");
        while let Some(event) = self.receiver.recv().await {
            let chat_service = Arc::clone(&self.chat_service);
            let hub = self.hub.clone();
            tokio::spawn(async move {
                if let Err(err) = process_event(&chat_service, &hub, &event).await {
                    warn!(
                        meeting_id = %event.meeting_id,
                        user_id = %event.user_id,
                        kind = ?event.kind,
                        error = %err,
                        "failed to process meeting event"
                    );
                }
            });
        }
        info!("meeting event worker stopped");
    }
}

/// 生成系统消息，持久化成功后才广播
pub async fn process_event(
    chat_service: &ChatService,
    hub: &HubHandle,
    event: &MeetingEvent,
) -> Result<(), ApplicationError> {
    let message = chat_service
        .save_system_message(event.meeting_id, event.user_id, event.kind)
        .await?;
    let payload = wire::encode_message(&message)?;
    hub.broadcast(event.meeting_id, payload).await?;

    debug!(meeting_id = %event.meeting_id, kind = ?event.kind, "system message broadcast");
    Ok(())
}
