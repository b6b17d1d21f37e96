mod chat_service;
mod meeting_service;

pub use chat_service::{ChatService, ChatServiceDependencies};
pub use meeting_service::{MeetingService, MeetingServiceDependencies};
