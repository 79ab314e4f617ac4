use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use super::model::FlushCacheResponse;
use crate::api::schema::common::EmptyResponse;
use crate::policy::{CachePolicy, CostBudget, RateLimitPolicy, RetryPolicy};
use crate::routes::parse_chatbot_id;
use crate::utils::success_to_api_response;
use crate::AppState;

#[axum::debug_handler]
pub async fn get_rate_limit(
    State(state): State<AppState>,
    Path(chatbot_id): Path<String>,
) -> impl IntoResponse {
    let policy = match parse_chatbot_id(&chatbot_id) {
        Some(id) => state.policies.snapshot(id).rate_limit.clone(),
        // 草稿机器人返回默认策略
        None => RateLimitPolicy::default(),
    };
    (StatusCode::OK, success_to_api_response(policy))
}

#[axum::debug_handler]
pub async fn set_rate_limit(
    State(state): State<AppState>,
    Path(chatbot_id): Path<String>,
    Json(policy): Json<RateLimitPolicy>,
) -> impl IntoResponse {
    let Some(id) = parse_chatbot_id(&chatbot_id) else {
        tracing::debug!(chatbot_id = %chatbot_id, "draft chatbot, rate limit config dropped");
        return (StatusCode::OK, success_to_api_response(EmptyResponse {})).into_response();
    };
    match state.policies.set_rate_limit(id, policy) {
        Ok(()) => (StatusCode::OK, success_to_api_response(EmptyResponse {})).into_response(),
        Err(e) => e.into_response(),
    }
}

#[axum::debug_handler]
pub async fn get_cache_config(
    State(state): State<AppState>,
    Path(chatbot_id): Path<String>,
) -> impl IntoResponse {
    let policy = match parse_chatbot_id(&chatbot_id) {
        Some(id) => state.policies.snapshot(id).cache.clone(),
        None => CachePolicy::default(),
    };
    (StatusCode::OK, success_to_api_response(policy))
}

#[axum::debug_handler]
pub async fn set_cache_config(
    State(state): State<AppState>,
    Path(chatbot_id): Path<String>,
    Json(policy): Json<CachePolicy>,
) -> impl IntoResponse {
    let Some(id) = parse_chatbot_id(&chatbot_id) else {
        tracing::debug!(chatbot_id = %chatbot_id, "draft chatbot, cache config dropped");
        return (StatusCode::OK, success_to_api_response(EmptyResponse {})).into_response();
    };
    match state.policies.set_cache(id, policy) {
        Ok(()) => (StatusCode::OK, success_to_api_response(EmptyResponse {})).into_response(),
        Err(e) => e.into_response(),
    }
}

/// 清空单个机器人的响应缓存
#[axum::debug_handler]
pub async fn flush_cache(
    State(state): State<AppState>,
    Path(chatbot_id): Path<String>,
) -> impl IntoResponse {
    let flushed = match parse_chatbot_id(&chatbot_id) {
        Some(id) => {
            let n = state.governor.cache().flush(id);
            tracing::info!(chatbot_id = %id, flushed_entries = n, "response cache flushed");
            n
        }
        None => 0,
    };
    (
        StatusCode::OK,
        success_to_api_response(FlushCacheResponse {
            flushed_entries: flushed,
        }),
    )
}

#[axum::debug_handler]
pub async fn get_retry_config(
    State(state): State<AppState>,
    Path(chatbot_id): Path<String>,
) -> impl IntoResponse {
    let policy = match parse_chatbot_id(&chatbot_id) {
        Some(id) => state.policies.snapshot(id).retry.clone(),
        None => RetryPolicy::default(),
    };
    (StatusCode::OK, success_to_api_response(policy))
}

#[axum::debug_handler]
pub async fn set_retry_config(
    State(state): State<AppState>,
    Path(chatbot_id): Path<String>,
    Json(policy): Json<RetryPolicy>,
) -> impl IntoResponse {
    let Some(id) = parse_chatbot_id(&chatbot_id) else {
        tracing::debug!(chatbot_id = %chatbot_id, "draft chatbot, retry config dropped");
        return (StatusCode::OK, success_to_api_response(EmptyResponse {})).into_response();
    };
    match state.policies.set_retry(id, policy) {
        Ok(()) => (StatusCode::OK, success_to_api_response(EmptyResponse {})).into_response(),
        Err(e) => e.into_response(),
    }
}

#[axum::debug_handler]
pub async fn get_cost_budget(
    State(state): State<AppState>,
    Path(chatbot_id): Path<String>,
) -> impl IntoResponse {
    let policy = match parse_chatbot_id(&chatbot_id) {
        Some(id) => state.policies.snapshot(id).cost.clone(),
        None => CostBudget::default(),
    };
    (StatusCode::OK, success_to_api_response(policy))
}

#[axum::debug_handler]
pub async fn set_cost_budget(
    State(state): State<AppState>,
    Path(chatbot_id): Path<String>,
    Json(policy): Json<CostBudget>,
) -> impl IntoResponse {
    let Some(id) = parse_chatbot_id(&chatbot_id) else {
        tracing::debug!(chatbot_id = %chatbot_id, "draft chatbot, cost budget dropped");
        return (StatusCode::OK, success_to_api_response(EmptyResponse {})).into_response();
    };
    match state.policies.set_cost_budget(id, policy) {
        Ok(()) => (StatusCode::OK, success_to_api_response(EmptyResponse {})).into_response(),
        Err(e) => e.into_response(),
    }
}

/// 机器人删除后的运行时状态清理钩子
#[axum::debug_handler]
pub async fn purge_runtime(
    State(state): State<AppState>,
    Path(chatbot_id): Path<String>,
) -> impl IntoResponse {
    if let Some(id) = parse_chatbot_id(&chatbot_id) {
        state.governor.purge_chatbot(id);
        state.policies.remove(id);
    }
    (StatusCode::OK, success_to_api_response(EmptyResponse {}))
}
