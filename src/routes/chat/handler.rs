use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, Json, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};

use super::model::{ChatRequestBody, ChatResponseBody};
use crate::governance::governor::ChatRequest;
use crate::governance::upstream::UpstreamRequest;
use crate::routes::parse_chatbot_id;
use crate::utils::{error_codes, error_to_api_response, success_to_api_response};
use crate::AppState;

/// 确定限流主体：显式头优先，然后是代理转发的IP，最后降级使用连接IP
fn subject_id(headers: &HeaderMap, remote_ip: Option<IpAddr>) -> String {
    if let Some(subject) = headers.get("x-subject-id").and_then(|h| h.to_str().ok()) {
        let subject = subject.trim();
        if !subject.is_empty() {
            return subject.to_string();
        }
    }
    headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .or_else(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.split(',').find(|ip| !ip.trim().is_empty()))
        })
        .map(|s| s.trim().to_string())
        .or_else(|| remote_ip.map(|ip| ip.to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

#[axum::debug_handler]
pub async fn chat(
    State(state): State<AppState>,
    Path(chatbot_id): Path<String>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<ChatRequestBody>,
) -> impl IntoResponse {
    if body.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            error_to_api_response::<()>(
                error_codes::VALIDATION_ERROR,
                "message must not be empty".to_string(),
            ),
        )
            .into_response();
    }

    let subject = subject_id(&headers, Some(addr.ip()));

    // 草稿机器人不走治理管道，直接透传上游
    let Some(id) = parse_chatbot_id(&chatbot_id) else {
        tracing::debug!(chatbot_id = %chatbot_id, "draft chatbot, bypassing governance");
        let upstream_req = UpstreamRequest {
            chatbot_id: uuid::Uuid::nil(),
            message: body.message.clone(),
            context: body.context.clone(),
            user_id: body.user_id.clone(),
            thread_id: body.thread_id.clone(),
        };
        return match state.upstream.call(&upstream_req).await {
            Ok(resp) => (
                StatusCode::OK,
                success_to_api_response(ChatResponseBody {
                    response: resp.payload,
                    cached: false,
                    attempts: 1,
                }),
            )
                .into_response(),
            Err(e) => {
                tracing::error!(error = %e.message, "ungoverned upstream call failed");
                (
                    StatusCode::BAD_GATEWAY,
                    error_to_api_response::<()>(
                        error_codes::UPSTREAM_FAILED,
                        e.message,
                    ),
                )
                    .into_response()
            }
        };
    };

    let policies = state.policies.snapshot(id);
    let request = ChatRequest {
        subject_id: subject,
        message: body.message,
        context: body.context,
        user_id: body.user_id,
        thread_id: body.thread_id,
    };

    match state
        .governor
        .handle(id, &request, &policies, state.upstream.as_ref())
        .await
    {
        Ok(outcome) => (
            StatusCode::OK,
            success_to_api_response(ChatResponseBody {
                response: outcome.response,
                cached: outcome.cached,
                attempts: outcome.attempts,
            }),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_prefers_explicit_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-subject-id", "user-42".parse().unwrap());
        headers.insert("x-real-ip", "10.0.0.1".parse().unwrap());
        assert_eq!(subject_id(&headers, None), "user-42");
    }

    #[test]
    fn subject_falls_back_to_forwarded_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.9, 10.0.0.1".parse().unwrap());
        assert_eq!(subject_id(&headers, None), "10.0.0.9");
    }

    #[test]
    fn subject_defaults_to_unknown() {
        let headers = HeaderMap::new();
        assert_eq!(subject_id(&headers, None), "unknown");
    }
}
