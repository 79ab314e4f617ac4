use std::fmt;
use std::time::Duration;

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::governance::cost::SpendPeriod;
use crate::utils::{error_codes, error_with_data_to_api_response};

/// 治理层的请求级错误
///
/// RateLimited / BudgetExceeded 对调用方是可恢复的，携带足够的
/// 数据（retry_after、当前用量与上限）让调用方无需二次查询即可处理。
#[derive(Debug)]
pub enum GovernorError {
    RateLimited {
        retry_after: Duration,
        reason: String,
    },
    BudgetExceeded {
        period: SpendPeriod,
        limit: f64,
        current: f64,
    },
    UpstreamFailed {
        attempts: u32,
        last_status: Option<u16>,
    },
    ConfigInvalid {
        field: &'static str,
    },
}

impl fmt::Display for GovernorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GovernorError::RateLimited {
                retry_after,
                reason,
            } => write!(
                f,
                "rate limited ({}), retry after {}s",
                reason,
                retry_after.as_secs()
            ),
            GovernorError::BudgetExceeded {
                period,
                limit,
                current,
            } => write!(
                f,
                "{} budget exceeded: {:.4} of {:.4}",
                period, current, limit
            ),
            GovernorError::UpstreamFailed {
                attempts,
                last_status,
            } => match last_status {
                Some(s) => write!(f, "upstream failed after {} attempts, last status {}", attempts, s),
                None => write!(f, "upstream failed after {} attempts", attempts),
            },
            GovernorError::ConfigInvalid { field } => write!(f, "invalid config field: {}", field),
        }
    }
}

impl std::error::Error for GovernorError {}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitedBody {
    retry_after_secs: u64,
    reason: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BudgetExceededBody {
    period: SpendPeriod,
    limit: f64,
    current: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpstreamFailedBody {
    attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_status: Option<u16>,
}

#[derive(Serialize)]
struct ConfigInvalidBody {
    field: &'static str,
}

impl IntoResponse for GovernorError {
    fn into_response(self) -> Response {
        let msg = self.to_string();
        match self {
            GovernorError::RateLimited {
                retry_after,
                reason,
            } => {
                let mut headers = HeaderMap::new();
                if let Ok(v) = HeaderValue::from_str(&retry_after.as_secs().to_string()) {
                    headers.insert(header::RETRY_AFTER, v);
                }
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    headers,
                    error_with_data_to_api_response(
                        error_codes::RATE_LIMITED,
                        msg,
                        RateLimitedBody {
                            retry_after_secs: retry_after.as_secs(),
                            reason,
                        },
                    ),
                )
                    .into_response()
            }
            GovernorError::BudgetExceeded {
                period,
                limit,
                current,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                error_with_data_to_api_response(
                    error_codes::BUDGET_EXCEEDED,
                    msg,
                    BudgetExceededBody {
                        period,
                        limit,
                        current,
                    },
                ),
            )
                .into_response(),
            GovernorError::UpstreamFailed {
                attempts,
                last_status,
            } => (
                StatusCode::BAD_GATEWAY,
                error_with_data_to_api_response(
                    error_codes::UPSTREAM_FAILED,
                    msg,
                    UpstreamFailedBody {
                        attempts,
                        last_status,
                    },
                ),
            )
                .into_response(),
            GovernorError::ConfigInvalid { field } => (
                StatusCode::BAD_REQUEST,
                error_with_data_to_api_response(
                    error_codes::CONFIG_INVALID,
                    msg,
                    ConfigInvalidBody { field },
                ),
            )
                .into_response(),
        }
    }
}
