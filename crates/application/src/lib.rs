//! 应用层实现。
//!
//! 这里提供会议聊天的用例服务、进程内的聊天广播中心以及会议事件工作者，
//! 并定义持久化网关端口，由 infrastructure 提供具体实现。

pub mod clock;
pub mod error;
pub mod events;
pub mod hub;
pub mod repository;
pub mod services;
pub mod wire;

pub use clock::{Clock, SystemClock};
pub use error::ApplicationError;
pub use events::{meeting_event_channel, MeetingEventPublisher, MeetingEventWorker};
pub use hub::{ClientHandle, ConnectionId, Hub, HubError, HubHandle, Mailbox, Payload};
pub use repository::{ChatMessageRepository, MeetingRepository, UserRepository};
pub use services::{
    ChatService, ChatServiceDependencies, MeetingService, MeetingServiceDependencies,
};
