use serde::{Deserialize, Serialize};

/// 聊天请求体
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequestBody {
    pub message: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
}

/// 聊天应答体
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponseBody {
    pub response: serde_json::Value,
    /// 是否由响应缓存直接返回
    pub cached: bool,
    /// 上游尝试次数，缓存命中为 0
    pub attempts: u32,
}
