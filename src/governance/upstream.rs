// 上游调用能力
//
// 引擎适配层（OpenAI / Dify / 自定义 HTTP 等）以单个不透明的
// call 能力注入，治理层自身从不构造 HTTP 请求。

use futures_util::future::BoxFuture;
use uuid::Uuid;

/// 发往上游引擎的请求
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub chatbot_id: Uuid,
    pub message: String,
    pub context: Option<String>,
    pub user_id: Option<String>,
    pub thread_id: Option<String>,
}

/// 上游引擎的应答，携带计费所需的模型与金额
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub payload: serde_json::Value,
    pub model: String,
    pub cost: f64,
}

/// 上游调用失败，status 为 None 表示传输层错误（无状态码）
#[derive(Debug, Clone)]
pub struct UpstreamError {
    pub status: Option<u16>,
    pub message: String,
}

pub trait UpstreamCaller: Send + Sync {
    fn call<'a>(
        &'a self,
        req: &'a UpstreamRequest,
    ) -> BoxFuture<'a, Result<UpstreamResponse, UpstreamError>>;
}

/// 开发环境的回声适配器，真实部署由引擎适配层替换
pub struct EchoUpstream {
    pub model: String,
    pub unit_cost: f64,
}

impl Default for EchoUpstream {
    fn default() -> Self {
        Self {
            model: "echo".to_string(),
            unit_cost: 0.0001,
        }
    }
}

impl UpstreamCaller for EchoUpstream {
    fn call<'a>(
        &'a self,
        req: &'a UpstreamRequest,
    ) -> BoxFuture<'a, Result<UpstreamResponse, UpstreamError>> {
        let response = UpstreamResponse {
            payload: serde_json::json!({ "reply": format!("echo: {}", req.message) }),
            model: self.model.clone(),
            cost: self.unit_cost,
        };
        Box::pin(async move { Ok(response) })
    }
}
