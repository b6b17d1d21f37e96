//! 领域模型错误定义
//!
//! 定义了会议聊天中所有可能的业务错误以及存储层错误。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// 参数校验失败
    #[error("invalid argument {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    #[error("meeting not found")]
    MeetingNotFound,

    #[error("user not found")]
    UserNotFound,

    /// 用户不是会议参与者
    #[error("user is not a participant of the meeting")]
    NotParticipant,

    /// 会议已满或用户已经加入
    #[error("meeting may be full or user already joined")]
    JoinRejected,

    /// 主持人不能退出会议
    #[error("host cannot leave the meeting")]
    HostCannotLeave,
}

impl DomainError {
    /// 创建参数校验错误
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// 存储层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("record not found")]
    NotFound,
    #[error("record conflict")]
    Conflict,
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}
