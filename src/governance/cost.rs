// 成本计量：按机器人追加成本记录，读取时聚合，预算告警为边沿触发
//
// 记录只追加不修改，日/月聚合随时可从原始记录重算，不存在
// 会被悄悄丢失的聚合状态。

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::policy::CostBudget;

/// 单次调用的成本记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostRecord {
    pub timestamp: DateTime<Utc>,
    pub amount: f64,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpendPeriod {
    Day,
    Month,
}

impl fmt::Display for SpendPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpendPeriod::Day => f.write_str("daily"),
            SpendPeriod::Month => f.write_str("monthly"),
        }
    }
}

/// 预算检查结果
#[derive(Debug, Clone)]
pub struct BudgetCheck {
    pub within_budget: bool,
    /// 各配置预算中用量比例的最大值
    pub fraction_used: f64,
    /// 本次检查是否应发出告警（阈值上穿时恰好一次）
    pub should_alert: bool,
    pub breach: Option<BudgetBreach>,
}

#[derive(Debug, Clone)]
pub struct BudgetBreach {
    pub period: SpendPeriod,
    pub limit: f64,
    pub current: f64,
}

/// 趋势方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

/// 成本预测（派生值，不落存储）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Forecast {
    pub forecasted_cost: f64,
    pub forecasted_daily_average: f64,
    pub trend: Trend,
    pub confidence: f64,
}

/// 预测至少需要 2 个不同日期的聚合数据
#[derive(Debug, PartialEq, Eq)]
pub struct NotEnoughData;

/// 斜率小于该值视为平稳
const TREND_EPSILON: f64 = 1e-6;
/// 日均值取最近多少天
const RECENT_WINDOW_DAYS: usize = 7;

/// 告警的边沿触发状态，按周期键重置
#[derive(Debug, Default, Clone)]
struct PeriodAlert {
    period_key: String,
    above: bool,
}

impl PeriodAlert {
    /// 返回是否处于阈值上穿沿
    fn update(&mut self, period_key: String, fraction: f64, threshold: f64) -> bool {
        if self.period_key != period_key {
            self.period_key = period_key;
            self.above = false;
        }
        let above = fraction >= threshold;
        let rising_edge = above && !self.above;
        self.above = above;
        rising_edge
    }
}

#[derive(Debug, Default)]
struct AlertState {
    daily: PeriodAlert,
    monthly: PeriodAlert,
}

pub struct CostBudgetTracker {
    records: DashMap<Uuid, Vec<CostRecord>>,
    alerts: DashMap<Uuid, AlertState>,
}

impl Default for CostBudgetTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CostBudgetTracker {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            alerts: DashMap::new(),
        }
    }

    /// 追加一条成本记录（只在上游调用成功后调用，失败不计费）
    pub fn record(&self, chatbot_id: Uuid, record: CostRecord) {
        self.records.entry(chatbot_id).or_default().push(record);
    }

    /// 指定周期内的累计花费
    pub fn current_spend(&self, chatbot_id: Uuid, period: SpendPeriod) -> f64 {
        self.current_spend_at(chatbot_id, period, Utc::now())
    }

    pub fn current_spend_at(
        &self,
        chatbot_id: Uuid,
        period: SpendPeriod,
        now: DateTime<Utc>,
    ) -> f64 {
        let Some(records) = self.records.get(&chatbot_id) else {
            return 0.0;
        };
        records
            .iter()
            .filter(|r| match period {
                SpendPeriod::Day => r.timestamp.date_naive() == now.date_naive(),
                SpendPeriod::Month => {
                    r.timestamp.year() == now.year() && r.timestamp.month() == now.month()
                }
            })
            .map(|r| r.amount)
            .sum()
    }

    pub fn check_budget(&self, chatbot_id: Uuid, policy: &CostBudget) -> BudgetCheck {
        self.check_budget_at(chatbot_id, policy, Utc::now())
    }

    /// 预算检查
    ///
    /// 告警是边沿触发：用量比例上穿阈值的那次检查返回 should_alert，
    /// 之后保持在阈值之上不再重复告警；周期翻转后重新武装。
    pub fn check_budget_at(
        &self,
        chatbot_id: Uuid,
        policy: &CostBudget,
        now: DateTime<Utc>,
    ) -> BudgetCheck {
        if !policy.enabled {
            return BudgetCheck {
                within_budget: true,
                fraction_used: 0.0,
                should_alert: false,
                breach: None,
            };
        }

        let mut fraction_used: f64 = 0.0;
        let mut breach = None;
        let mut should_alert = false;
        let mut alerts = self.alerts.entry(chatbot_id).or_default();

        if let Some(limit) = policy.daily_budget {
            let current = self.current_spend_at(chatbot_id, SpendPeriod::Day, now);
            let fraction = if limit > 0.0 { current / limit } else { 1.0 };
            fraction_used = fraction_used.max(fraction);
            if fraction >= 1.0 && breach.is_none() {
                breach = Some(BudgetBreach {
                    period: SpendPeriod::Day,
                    limit,
                    current,
                });
            }
            let day_key = now.date_naive().to_string();
            if alerts
                .daily
                .update(day_key, fraction, policy.alert_threshold)
            {
                should_alert = true;
            }
        }

        if let Some(limit) = policy.monthly_budget {
            let current = self.current_spend_at(chatbot_id, SpendPeriod::Month, now);
            let fraction = if limit > 0.0 { current / limit } else { 1.0 };
            fraction_used = fraction_used.max(fraction);
            if fraction >= 1.0 && breach.is_none() {
                breach = Some(BudgetBreach {
                    period: SpendPeriod::Month,
                    limit,
                    current,
                });
            }
            let month_key = format!("{}-{:02}", now.year(), now.month());
            if alerts
                .monthly
                .update(month_key, fraction, policy.alert_threshold)
            {
                should_alert = true;
            }
        }

        BudgetCheck {
            within_budget: breach.is_none(),
            fraction_used,
            should_alert,
            breach,
        }
    }

    /// 按日聚合（幂等，可随时从原始记录重算）
    pub fn daily_totals(&self, chatbot_id: Uuid) -> BTreeMap<NaiveDate, f64> {
        let mut totals = BTreeMap::new();
        if let Some(records) = self.records.get(&chatbot_id) {
            for r in records.iter() {
                *totals.entry(r.timestamp.date_naive()).or_insert(0.0) += r.amount;
            }
        }
        totals
    }

    /// 成本预测：日总额的普通最小二乘趋势外推
    pub fn forecast(&self, chatbot_id: Uuid, horizon_days: u32) -> Result<Forecast, NotEnoughData> {
        let totals = self.daily_totals(chatbot_id);
        let n = totals.len();
        if n < 2 {
            return Err(NotEnoughData);
        }

        let first = *totals.keys().next().expect("non-empty totals");
        let points: Vec<(f64, f64)> = totals
            .iter()
            .map(|(date, total)| (((*date - first).num_days()) as f64, *total))
            .collect();

        let count = points.len() as f64;
        let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / count;
        let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / count;
        let sxx: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
        let sxy: f64 = points
            .iter()
            .map(|(x, y)| (x - mean_x) * (y - mean_y))
            .sum();
        let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };

        let trend = if slope > TREND_EPSILON {
            Trend::Increasing
        } else if slope < -TREND_EPSILON {
            Trend::Decreasing
        } else {
            Trend::Stable
        };

        // 最近窗口均值按趋势斜率外推半个窗口
        let recent: Vec<f64> = points
            .iter()
            .rev()
            .take(RECENT_WINDOW_DAYS.min(n))
            .map(|(_, y)| *y)
            .collect();
        let recent_mean = recent.iter().sum::<f64>() / recent.len() as f64;
        let forecasted_daily_average =
            (recent_mean + slope * (recent.len() as f64 / 2.0)).max(0.0);
        let forecasted_cost = forecasted_daily_average * horizon_days as f64;

        // 样本越多越可信，日总额波动越大越不可信；两点趋势不可证伪，置信度必须偏低
        let variance =
            points.iter().map(|(_, y)| (y - mean_y).powi(2)).sum::<f64>() / count;
        let cv = if mean_y > 0.0 {
            variance.sqrt() / mean_y
        } else {
            0.0
        };
        let confidence = ((1.0 - 1.0 / count) / (1.0 + cv)).clamp(0.0, 1.0);

        Ok(Forecast {
            forecasted_cost,
            forecasted_daily_average,
            trend,
            confidence,
        })
    }

    /// 当月按用户 / 会话的花费分解
    pub fn spend_breakdown_at(
        &self,
        chatbot_id: Uuid,
        now: DateTime<Utc>,
        per_user: bool,
        per_thread: bool,
    ) -> (Option<HashMap<String, f64>>, Option<HashMap<String, f64>>) {
        if !per_user && !per_thread {
            return (None, None);
        }
        let mut by_user: HashMap<String, f64> = HashMap::new();
        let mut by_thread: HashMap<String, f64> = HashMap::new();
        if let Some(records) = self.records.get(&chatbot_id) {
            for r in records
                .iter()
                .filter(|r| r.timestamp.year() == now.year() && r.timestamp.month() == now.month())
            {
                if per_user {
                    if let Some(u) = &r.user_id {
                        *by_user.entry(u.clone()).or_insert(0.0) += r.amount;
                    }
                }
                if per_thread {
                    if let Some(t) = &r.thread_id {
                        *by_thread.entry(t.clone()).or_insert(0.0) += r.amount;
                    }
                }
            }
        }
        (
            per_user.then_some(by_user),
            per_thread.then_some(by_thread),
        )
    }

    /// 导出全部原始记录
    pub fn export(&self, chatbot_id: Uuid) -> Vec<CostRecord> {
        self.records
            .get(&chatbot_id)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn record_count(&self, chatbot_id: Uuid) -> usize {
        self.records.get(&chatbot_id).map(|r| r.len()).unwrap_or(0)
    }

    /// 机器人删除时清空其成本记录与告警状态
    pub fn purge_chatbot(&self, chatbot_id: Uuid) {
        self.records.remove(&chatbot_id);
        self.alerts.remove(&chatbot_id);
    }
}
