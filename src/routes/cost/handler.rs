use axum::{
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use chrono::Utc;

use super::model::{CostStatsResponse, ExportQuery, ForecastQuery};
use crate::governance::cost::{CostRecord, SpendPeriod};
use crate::routes::parse_chatbot_id;
use crate::utils::{error_codes, error_to_api_response, success_to_api_response};
use crate::AppState;

#[axum::debug_handler]
pub async fn cost_stats(
    State(state): State<AppState>,
    Path(chatbot_id): Path<String>,
) -> impl IntoResponse {
    let Some(id) = parse_chatbot_id(&chatbot_id) else {
        return (
            StatusCode::OK,
            success_to_api_response(CostStatsResponse::empty()),
        );
    };

    let tracker = state.governor.cost();
    let policy = state.policies.snapshot(id);
    let now = Utc::now();
    let (by_user, by_thread) = tracker.spend_breakdown_at(
        id,
        now,
        policy.cost.track_per_user,
        policy.cost.track_per_thread,
    );

    (
        StatusCode::OK,
        success_to_api_response(CostStatsResponse {
            today: tracker.current_spend_at(id, SpendPeriod::Day, now),
            this_month: tracker.current_spend_at(id, SpendPeriod::Month, now),
            record_count: tracker.record_count(id),
            by_user,
            by_thread,
        }),
    )
}

#[axum::debug_handler]
pub async fn cost_forecast(
    State(state): State<AppState>,
    Path(chatbot_id): Path<String>,
    Query(query): Query<ForecastQuery>,
) -> impl IntoResponse {
    let days = query.days.unwrap_or(state.config.forecast_default_days);
    if days == 0 {
        return (
            StatusCode::BAD_REQUEST,
            error_to_api_response::<()>(
                error_codes::VALIDATION_ERROR,
                "forecast horizon must be at least 1 day".to_string(),
            ),
        )
            .into_response();
    }

    let Some(id) = parse_chatbot_id(&chatbot_id) else {
        return (
            StatusCode::OK,
            success_to_api_response(serde_json::Value::Null),
        )
            .into_response();
    };

    match state.governor.cost().forecast(id, days) {
        Ok(forecast) => (StatusCode::OK, success_to_api_response(forecast)).into_response(),
        Err(_) => (
            StatusCode::OK,
            error_to_api_response::<()>(
                error_codes::NOT_ENOUGH_DATA,
                "at least two days of cost history are required".to_string(),
            ),
        )
            .into_response(),
    }
}

#[axum::debug_handler]
pub async fn cost_export(
    State(state): State<AppState>,
    Path(chatbot_id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> impl IntoResponse {
    let records = match parse_chatbot_id(&chatbot_id) {
        Some(id) => state.governor.cost().export(id),
        None => Vec::new(),
    };

    match query.format.as_deref().unwrap_or("json") {
        "csv" => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
            to_csv(&records),
        )
            .into_response(),
        "json" => (StatusCode::OK, axum::Json(records)).into_response(),
        other => (
            StatusCode::BAD_REQUEST,
            error_to_api_response::<()>(
                error_codes::VALIDATION_ERROR,
                format!("unsupported export format: {}", other),
            ),
        )
            .into_response(),
    }
}

/// 含分隔符/引号/换行的字段加引号转义，内部引号翻倍
fn csv_field(value: &str) -> String {
    if value.contains(['"', ',', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn to_csv(records: &[CostRecord]) -> String {
    let mut out = String::from("date,model,userId,threadId,amount\n");
    for r in records {
        out.push_str(&format!(
            "{},{},{},{},{}\n",
            r.timestamp.format("%Y-%m-%d"),
            csv_field(&r.model),
            csv_field(r.user_id.as_deref().unwrap_or("")),
            csv_field(r.thread_id.as_deref().unwrap_or("")),
            r.amount,
        ));
    }
    out
}
