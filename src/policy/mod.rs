// 治理策略模块
// 策略对象是不可变快照：写入时整体校验、整体替换，请求侧只读取 Arc 克隆

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GovernorError;

/// 限流策略
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitPolicy {
    pub enabled: bool,
    /// 各时间窗的上限，None 表示不限制
    pub max_per_minute: Option<u32>,
    pub max_per_hour: Option<u32>,
    pub max_per_day: Option<u32>,
    pub max_per_month: Option<u32>,
    /// 分钟窗之上的短时突发额度（令牌桶）
    pub burst_limit: Option<u32>,
    /// 分钟窗长度，同时也是突发令牌的补充周期
    pub window_size_seconds: u64,
    /// 触发限流后的封禁时长，0 表示不封禁
    pub block_duration_seconds: u64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_per_minute: None,
            max_per_hour: None,
            max_per_day: None,
            max_per_month: None,
            burst_limit: None,
            window_size_seconds: 60,
            block_duration_seconds: 0,
        }
    }
}

impl RateLimitPolicy {
    pub fn validate(&self) -> Result<(), GovernorError> {
        if self.window_size_seconds == 0 {
            return Err(GovernorError::ConfigInvalid {
                field: "windowSizeSeconds",
            });
        }
        if self.max_per_minute == Some(0) {
            return Err(GovernorError::ConfigInvalid {
                field: "maxPerMinute",
            });
        }
        if self.max_per_hour == Some(0) {
            return Err(GovernorError::ConfigInvalid {
                field: "maxPerHour",
            });
        }
        if self.max_per_day == Some(0) {
            return Err(GovernorError::ConfigInvalid { field: "maxPerDay" });
        }
        if self.max_per_month == Some(0) {
            return Err(GovernorError::ConfigInvalid {
                field: "maxPerMonth",
            });
        }
        if self.burst_limit == Some(0) {
            return Err(GovernorError::ConfigInvalid {
                field: "burstLimit",
            });
        }
        Ok(())
    }
}

/// 响应缓存的键匹配策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    /// 原文哈希，大小写/空白差异视为不同键
    Exact,
    /// 归一化（折叠大小写与空白）后哈希
    Semantic,
    /// 归一化后只取前若干词，有意放宽碰撞换取命中率
    Fuzzy,
}

/// 响应缓存策略
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CachePolicy {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub max_entries: usize,
    pub strategy: CacheStrategy,
    /// 是否将会话上下文混入缓存键
    pub include_context: bool,
    pub key_prefix: String,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_seconds: 3600,
            max_entries: 1000,
            strategy: CacheStrategy::Exact,
            include_context: false,
            key_prefix: "resp".to_string(),
        }
    }
}

impl CachePolicy {
    pub fn validate(&self) -> Result<(), GovernorError> {
        if self.ttl_seconds == 0 {
            return Err(GovernorError::ConfigInvalid {
                field: "ttlSeconds",
            });
        }
        if self.max_entries == 0 {
            return Err(GovernorError::ConfigInvalid {
                field: "maxEntries",
            });
        }
        Ok(())
    }
}

/// 上游调用重试策略
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub retryable_status_codes: BTreeSet<u16>,
    /// 全抖动：退避时延替换为 [0, delay] 内的均匀随机值
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            retryable_status_codes: [429, 500, 502, 503, 504].into_iter().collect(),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), GovernorError> {
        if self.initial_delay_ms == 0 {
            return Err(GovernorError::ConfigInvalid {
                field: "initialDelayMs",
            });
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(GovernorError::ConfigInvalid {
                field: "maxDelayMs",
            });
        }
        if self.backoff_multiplier < 1.0 {
            return Err(GovernorError::ConfigInvalid {
                field: "backoffMultiplier",
            });
        }
        if self.enabled && self.max_retries > 0 && self.retryable_status_codes.is_empty() {
            return Err(GovernorError::ConfigInvalid {
                field: "retryableStatusCodes",
            });
        }
        Ok(())
    }
}

/// 成本预算策略
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CostBudget {
    pub enabled: bool,
    pub monthly_budget: Option<f64>,
    pub daily_budget: Option<f64>,
    /// 告警阈值，预算使用率达到该比例时触发一次告警
    pub alert_threshold: f64,
    pub alert_email: Option<String>,
    pub track_per_user: bool,
    pub track_per_thread: bool,
}

impl Default for CostBudget {
    fn default() -> Self {
        Self {
            enabled: false,
            monthly_budget: None,
            daily_budget: None,
            alert_threshold: 0.8,
            alert_email: None,
            track_per_user: false,
            track_per_thread: false,
        }
    }
}

impl CostBudget {
    pub fn validate(&self) -> Result<(), GovernorError> {
        // 0 不是合法阈值：告警要么有明确的触发比例，要么整体禁用
        if !(self.alert_threshold > 0.0 && self.alert_threshold <= 1.0) {
            return Err(GovernorError::ConfigInvalid {
                field: "alertThreshold",
            });
        }
        if matches!(self.monthly_budget, Some(v) if v < 0.0) {
            return Err(GovernorError::ConfigInvalid {
                field: "monthlyBudget",
            });
        }
        if matches!(self.daily_budget, Some(v) if v < 0.0) {
            return Err(GovernorError::ConfigInvalid {
                field: "dailyBudget",
            });
        }
        Ok(())
    }
}

/// 单个机器人的全部治理策略
#[derive(Debug, Clone, Default)]
pub struct ChatbotPolicies {
    pub rate_limit: RateLimitPolicy,
    pub cache: CachePolicy,
    pub retry: RetryPolicy,
    pub cost: CostBudget,
}

/// 策略存储
///
/// 配置写入在此处整体校验（ConfigInvalid 只会出现在写入时，
/// 不会在请求路径上出现），写入成功后以新的 Arc 快照整体替换。
#[derive(Default)]
pub struct PolicyStore {
    inner: DashMap<Uuid, Arc<ChatbotPolicies>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取当前快照，未配置的机器人返回默认策略
    pub fn snapshot(&self, chatbot_id: Uuid) -> Arc<ChatbotPolicies> {
        self.inner
            .get(&chatbot_id)
            .map(|e| Arc::clone(e.value()))
            .unwrap_or_default()
    }

    pub fn set_rate_limit(
        &self,
        chatbot_id: Uuid,
        policy: RateLimitPolicy,
    ) -> Result<(), GovernorError> {
        policy.validate()?;
        self.replace(chatbot_id, |p| p.rate_limit = policy);
        Ok(())
    }

    pub fn set_cache(&self, chatbot_id: Uuid, policy: CachePolicy) -> Result<(), GovernorError> {
        policy.validate()?;
        self.replace(chatbot_id, |p| p.cache = policy);
        Ok(())
    }

    pub fn set_retry(&self, chatbot_id: Uuid, policy: RetryPolicy) -> Result<(), GovernorError> {
        policy.validate()?;
        self.replace(chatbot_id, |p| p.retry = policy);
        Ok(())
    }

    pub fn set_cost_budget(
        &self,
        chatbot_id: Uuid,
        policy: CostBudget,
    ) -> Result<(), GovernorError> {
        policy.validate()?;
        self.replace(chatbot_id, |p| p.cost = policy);
        Ok(())
    }

    /// 机器人删除时同步清除其策略
    pub fn remove(&self, chatbot_id: Uuid) {
        self.inner.remove(&chatbot_id);
    }

    fn replace(&self, chatbot_id: Uuid, apply: impl FnOnce(&mut ChatbotPolicies)) {
        let mut next = (*self.snapshot(chatbot_id)).clone();
        apply(&mut next);
        self.inner.insert(chatbot_id, Arc::new(next));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_time_validation_rejects_bad_fields() {
        let p = RateLimitPolicy {
            window_size_seconds: 0,
            ..Default::default()
        };
        assert!(matches!(
            p.validate(),
            Err(GovernorError::ConfigInvalid {
                field: "windowSizeSeconds"
            })
        ));

        let p = CachePolicy {
            ttl_seconds: 0,
            ..Default::default()
        };
        assert!(matches!(
            p.validate(),
            Err(GovernorError::ConfigInvalid { field: "ttlSeconds" })
        ));

        let p = RetryPolicy {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(matches!(
            p.validate(),
            Err(GovernorError::ConfigInvalid {
                field: "backoffMultiplier"
            })
        ));

        let p = CostBudget {
            alert_threshold: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            p.validate(),
            Err(GovernorError::ConfigInvalid {
                field: "alertThreshold"
            })
        ));

        // 阈值为 0 会让告警形同虚设，同样在写入时拒绝
        let p = CostBudget {
            alert_threshold: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            p.validate(),
            Err(GovernorError::ConfigInvalid {
                field: "alertThreshold"
            })
        ));
    }

    #[test]
    fn invalid_write_leaves_previous_snapshot_intact() {
        let store = PolicyStore::new();
        let id = Uuid::new_v4();

        let good = RateLimitPolicy {
            enabled: true,
            max_per_minute: Some(10),
            ..Default::default()
        };
        store.set_rate_limit(id, good).unwrap();

        let bad = RateLimitPolicy {
            enabled: true,
            max_per_minute: Some(0),
            ..Default::default()
        };
        assert!(store.set_rate_limit(id, bad).is_err());

        assert_eq!(store.snapshot(id).rate_limit.max_per_minute, Some(10));
    }

    #[test]
    fn snapshot_for_unknown_chatbot_is_default() {
        let store = PolicyStore::new();
        let snap = store.snapshot(Uuid::new_v4());
        assert!(!snap.rate_limit.enabled);
        assert!(!snap.cache.enabled);
    }
}
