use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

use crate::utils::success_to_api_response;

pub mod chat;
pub mod cost;
pub mod policy;

/// Ping响应
#[derive(Serialize)]
pub struct PingResponse {
    /// 服务状态
    pub status: String,
    /// 服务器时间
    pub timestamp: i64,
}

/// 健康检查接口
pub async fn ping() -> impl IntoResponse {
    let now = chrono::Utc::now();

    (
        StatusCode::OK,
        success_to_api_response(PingResponse {
            status: "ok".to_string(),
            timestamp: now.timestamp(),
        }),
    )
}

/// 解析机器人标识
///
/// 仅本地草稿会出现非 UUID 标识，对这类机器人所有治理操作
/// 都降级为空操作而不是报错。
pub(crate) fn parse_chatbot_id(raw: &str) -> Option<uuid::Uuid> {
    uuid::Uuid::parse_str(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::parse_chatbot_id;

    #[test]
    fn draft_ids_are_not_uuids() {
        assert!(parse_chatbot_id("550e8400-e29b-41d4-a716-446655440000").is_some());
        assert!(parse_chatbot_id("draft-12345").is_none());
        assert!(parse_chatbot_id("").is_none());
    }
}
