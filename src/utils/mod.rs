use axum::Json;
use serde::Serialize;

use crate::api::schema::common::ApiResponse;

// 所有 handler 统一返回 Json<ApiResponse<T>>
pub fn success_to_api_response<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        code: 0,
        msg: "success".into(),
        resp_data: Some(data),
    })
}

pub fn error_to_api_response<T>(code: i32, msg: String) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        code,
        msg,
        resp_data: None,
    })
}

/// 错误响应同时携带结构化数据（如 retry_after），调用方无需再次查询
pub fn error_with_data_to_api_response<T: Serialize>(
    code: i32,
    msg: String,
    data: T,
) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        code,
        msg,
        resp_data: Some(data),
    })
}

pub mod error_codes {
    pub const SUCCESS: i32 = 0;
    pub const VALIDATION_ERROR: i32 = 1000;
    pub const NOT_FOUND: i32 = 1004;
    pub const RATE_LIMITED: i32 = 1005;
    pub const BUDGET_EXCEEDED: i32 = 1006;
    pub const UPSTREAM_FAILED: i32 = 1007;
    pub const CONFIG_INVALID: i32 = 1008;
    pub const NOT_ENOUGH_DATA: i32 = 1009;
    pub const INTERNAL_ERROR: i32 = 5000;
}
