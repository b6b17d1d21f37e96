use serde::{Deserialize, Serialize};

use crate::value_objects::UserId;

/// 已认证用户在聊天中的身份。
///
/// 由认证边界（JWT 校验 + 用户资料查询）一次性构造，然后显式传给连接，
/// 聊天消息上的发送者展示信息都来自这里。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatIdentity {
    pub user_id: UserId,
    pub nickname: String,
    pub profile_uri: String,
}

impl ChatIdentity {
    pub fn new(user_id: UserId, nickname: impl Into<String>, profile_uri: impl Into<String>) -> Self {
        Self {
            user_id,
            nickname: nickname.into(),
            profile_uri: profile_uri.into(),
        }
    }
}
