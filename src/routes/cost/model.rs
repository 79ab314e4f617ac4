use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// 成本统计
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostStatsResponse {
    /// 今日花费
    pub today: f64,
    /// 本月花费
    pub this_month: f64,
    /// 原始记录条数
    pub record_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by_user: Option<HashMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by_thread: Option<HashMap<String, f64>>,
}

impl CostStatsResponse {
    pub fn empty() -> Self {
        Self {
            today: 0.0,
            this_month: 0.0,
            record_count: 0,
            by_user: None,
            by_thread: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ForecastQuery {
    /// 预测天数，缺省使用服务配置
    pub days: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    /// csv 或 json，缺省 json
    pub format: Option<String>,
}
