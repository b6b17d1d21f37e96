//! WebSocket 帧编码
//!
//! 广播帧就是持久化后的 `ChatMessage` 的 JSON；错误帧只发给出错的连接。

use domain::ChatMessage;
use serde_json::json;

use crate::hub::Payload;

/// 编码一条已持久化的消息
pub fn encode_message(message: &ChatMessage) -> Result<Payload, serde_json::Error> {
    let text = serde_json::to_string(message)?;
    Ok(Payload::from(text))
}

/// 私有错误帧：`{"type":"error","message":"..."}`
pub fn encode_error(message: &str) -> Payload {
    let frame = json!({
        "type": "error",
        "message": message,
    });
    Payload::from(frame.to_string())
}
