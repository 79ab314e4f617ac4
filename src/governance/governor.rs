// 请求治理编排
//
// 单个请求的生命周期：准入 → 缓存查找 → 预算检查 → 带重试的
// 上游调用 → 记账 → 缓存写入。任何一级拒绝都直接返回类型化
// 错误，不触碰上游，也不污染缓存与账本。

use chrono::Utc;
use uuid::Uuid;

use super::cache::{self, ResponseCache};
use super::cost::{CostBudgetTracker, CostRecord};
use super::rate_limit::{AdmitDecision, RateLimiter};
use super::retry;
use super::upstream::{UpstreamCaller, UpstreamRequest};
use crate::error::GovernorError;
use crate::policy::ChatbotPolicies;

/// 入站聊天请求
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// 调用方身份（限流主体）
    pub subject_id: String,
    pub message: String,
    pub context: Option<String>,
    pub user_id: Option<String>,
    pub thread_id: Option<String>,
}

/// 治理后的应答
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub response: serde_json::Value,
    pub cached: bool,
    /// 上游尝试次数，缓存命中时为 0
    pub attempts: u32,
}

pub struct RequestGovernor {
    rate_limiter: RateLimiter,
    cache: ResponseCache,
    cost: CostBudgetTracker,
    /// 限流存储故障时放行还是拒绝（默认拒绝）
    rate_limit_fail_open: bool,
}

impl RequestGovernor {
    pub fn new(rate_limit_fail_open: bool) -> Self {
        Self {
            rate_limiter: RateLimiter::new(),
            cache: ResponseCache::new(),
            cost: CostBudgetTracker::new(),
            rate_limit_fail_open,
        }
    }

    pub fn cost(&self) -> &CostBudgetTracker {
        &self.cost
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// 治理一次聊天请求
    pub async fn handle(
        &self,
        chatbot_id: Uuid,
        req: &ChatRequest,
        policies: &ChatbotPolicies,
        caller: &dyn UpstreamCaller,
    ) -> Result<ChatOutcome, GovernorError> {
        // 1. 准入
        match self
            .rate_limiter
            .admit(chatbot_id, &req.subject_id, &policies.rate_limit)
        {
            Ok(AdmitDecision::Allowed) => {}
            Ok(AdmitDecision::Rejected {
                retry_after,
                reason,
            }) => {
                return Err(GovernorError::RateLimited {
                    retry_after,
                    reason: reason.to_string(),
                });
            }
            Err(e) => {
                if self.rate_limit_fail_open {
                    tracing::warn!(chatbot_id = %chatbot_id, error = %e, "rate limit store error, failing open");
                } else {
                    tracing::error!(chatbot_id = %chatbot_id, error = %e, "rate limit store error, failing closed");
                    return Err(GovernorError::RateLimited {
                        retry_after: std::time::Duration::from_secs(
                            policies.rate_limit.window_size_seconds,
                        ),
                        reason: "rate limit store unavailable".to_string(),
                    });
                }
            }
        }

        // 2. 缓存查找（存储故障一律降级为未命中）
        let cache_key = policies.cache.enabled.then(|| {
            cache::derive_key(
                chatbot_id,
                &req.message,
                req.context.as_deref(),
                &policies.cache,
            )
        });
        if let Some(key) = &cache_key {
            match self.cache.lookup(chatbot_id, key) {
                Ok(Some(response)) => {
                    tracing::debug!(chatbot_id = %chatbot_id, "cache hit");
                    return Ok(ChatOutcome {
                        response,
                        cached: true,
                        attempts: 0,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(chatbot_id = %chatbot_id, error = %e, "cache lookup failed, treating as miss");
                }
            }
        }

        // 3. 预算检查，超限时在调用上游之前拒绝
        if policies.cost.enabled {
            let check = self.cost.check_budget(chatbot_id, &policies.cost);
            if check.should_alert {
                tracing::warn!(
                    chatbot_id = %chatbot_id,
                    fraction_used = check.fraction_used,
                    alert_email = policies.cost.alert_email.as_deref().unwrap_or("-"),
                    "cost budget alert threshold crossed"
                );
            }
            if let Some(breach) = check.breach {
                return Err(GovernorError::BudgetExceeded {
                    period: breach.period,
                    limit: breach.limit,
                    current: breach.current,
                });
            }
        }

        // 4. 带重试的上游调用
        let upstream_req = UpstreamRequest {
            chatbot_id,
            message: req.message.clone(),
            context: req.context.clone(),
            user_id: req.user_id.clone(),
            thread_id: req.thread_id.clone(),
        };
        let (response, attempts) = retry::execute(caller, &upstream_req, &policies.retry)
            .await
            .map_err(|f| {
                tracing::warn!(
                    chatbot_id = %chatbot_id,
                    attempts = f.attempts,
                    last_status = ?f.last_status,
                    "upstream call failed terminally: {}",
                    f.message
                );
                // 失败调用不记账、不写缓存
                GovernorError::UpstreamFailed {
                    attempts: f.attempts,
                    last_status: f.last_status,
                }
            })?;

        // 5. 记账（仅成功调用）
        self.cost.record(
            chatbot_id,
            CostRecord {
                timestamp: Utc::now(),
                amount: response.cost,
                model: response.model.clone(),
                user_id: policies.cost.track_per_user.then(|| req.user_id.clone()).flatten(),
                thread_id: policies
                    .cost
                    .track_per_thread
                    .then(|| req.thread_id.clone())
                    .flatten(),
            },
        );

        // 6. 缓存写入（存储故障不阻塞应答）
        if let Some(key) = cache_key {
            if let Err(e) =
                self.cache
                    .store(chatbot_id, key, response.payload.clone(), &policies.cache)
            {
                tracing::warn!(chatbot_id = %chatbot_id, error = %e, "cache store failed");
            }
        }

        Ok(ChatOutcome {
            response: response.payload,
            cached: false,
            attempts,
        })
    }

    /// 机器人删除时清空其全部运行时状态
    pub fn purge_chatbot(&self, chatbot_id: Uuid) {
        self.rate_limiter.purge_chatbot(chatbot_id);
        self.cache.flush(chatbot_id);
        self.cost.purge_chatbot(chatbot_id);
        tracing::info!(chatbot_id = %chatbot_id, "runtime governance state purged");
    }
}

#[cfg(test)]
mod tests {
    use super::super::cost::SpendPeriod;
    use super::super::test_support::{ScriptedUpstream, err_status, ok_response};
    use super::*;
    use crate::policy::{CachePolicy, CostBudget, RateLimitPolicy, RetryPolicy};

    fn chat_req(message: &str) -> ChatRequest {
        ChatRequest {
            subject_id: "subject-1".to_string(),
            message: message.to_string(),
            context: None,
            user_id: Some("alice".to_string()),
            thread_id: None,
        }
    }

    fn governed_policies() -> ChatbotPolicies {
        ChatbotPolicies {
            rate_limit: RateLimitPolicy {
                enabled: true,
                max_per_minute: Some(2),
                ..Default::default()
            },
            cache: CachePolicy {
                enabled: true,
                ..Default::default()
            },
            retry: RetryPolicy {
                enabled: true,
                max_retries: 2,
                initial_delay_ms: 10,
                max_delay_ms: 100,
                jitter: false,
                ..Default::default()
            },
            cost: CostBudget {
                enabled: true,
                daily_budget: Some(1.0),
                track_per_user: true,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn cache_hit_short_circuits_upstream() {
        let governor = RequestGovernor::new(false);
        let id = Uuid::new_v4();
        let policies = governed_policies();
        let upstream = ScriptedUpstream::new([ok_response("first", 0.01)]);

        let first = governor
            .handle(id, &chat_req("hello"), &policies, &upstream)
            .await
            .unwrap();
        assert!(!first.cached);
        assert_eq!(first.attempts, 1);

        let second = governor
            .handle(id, &chat_req("hello"), &policies, &upstream)
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(second.attempts, 0);
        assert_eq!(second.response, first.response);
        // 上游只被调用一次
        assert_eq!(upstream.call_count(), 1);
    }

    #[tokio::test]
    async fn rate_limit_rejection_is_typed_and_skips_upstream() {
        let governor = RequestGovernor::new(false);
        let id = Uuid::new_v4();
        let mut policies = governed_policies();
        policies.cache.enabled = false;

        let upstream = ScriptedUpstream::new([
            ok_response("a", 0.01),
            ok_response("b", 0.01),
            ok_response("c", 0.01),
        ]);

        for _ in 0..2 {
            governor
                .handle(id, &chat_req("hi"), &policies, &upstream)
                .await
                .unwrap();
        }
        let err = governor
            .handle(id, &chat_req("hi"), &policies, &upstream)
            .await
            .unwrap_err();
        match err {
            GovernorError::RateLimited { retry_after, .. } => {
                assert!(retry_after.as_secs() > 0)
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
        assert_eq!(upstream.call_count(), 2);
    }

    #[tokio::test]
    async fn budget_exceeded_blocks_before_upstream() {
        let governor = RequestGovernor::new(false);
        let id = Uuid::new_v4();
        let mut policies = governed_policies();
        policies.cache.enabled = false;
        policies.rate_limit.enabled = false;

        // 单次 0.6：第一次在预算内，之后 1.2 >= 1.0 触发拒绝
        let upstream = ScriptedUpstream::new([
            ok_response("a", 0.6),
            ok_response("b", 0.6),
            ok_response("c", 0.6),
        ]);

        governor
            .handle(id, &chat_req("q1"), &policies, &upstream)
            .await
            .unwrap();
        governor
            .handle(id, &chat_req("q2"), &policies, &upstream)
            .await
            .unwrap();

        let err = governor
            .handle(id, &chat_req("q3"), &policies, &upstream)
            .await
            .unwrap_err();
        match err {
            GovernorError::BudgetExceeded {
                period,
                limit,
                current,
            } => {
                assert_eq!(period, SpendPeriod::Day);
                assert_eq!(limit, 1.0);
                assert!(current >= limit);
            }
            other => panic!("expected BudgetExceeded, got {:?}", other),
        }
        // 第三次调用未到达上游
        assert_eq!(upstream.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_upstream_records_no_cost_and_no_cache() {
        let governor = RequestGovernor::new(false);
        let id = Uuid::new_v4();
        let policies = governed_policies();

        let upstream =
            ScriptedUpstream::new([err_status(500), err_status(500), err_status(500)]);

        let err = governor
            .handle(id, &chat_req("hello"), &policies, &upstream)
            .await
            .unwrap_err();
        match err {
            GovernorError::UpstreamFailed {
                attempts,
                last_status,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_status, Some(500));
            }
            other => panic!("expected UpstreamFailed, got {:?}", other),
        }

        assert_eq!(governor.cost().record_count(id), 0);
        assert_eq!(governor.cache().entry_count(id), 0);
    }

    #[tokio::test]
    async fn successful_call_is_metered() {
        let governor = RequestGovernor::new(false);
        let id = Uuid::new_v4();
        let policies = governed_policies();
        let upstream = ScriptedUpstream::new([ok_response("a", 0.25)]);

        governor
            .handle(id, &chat_req("hello"), &policies, &upstream)
            .await
            .unwrap();

        assert_eq!(governor.cost().record_count(id), 1);
        assert_eq!(
            governor.cost().current_spend(id, SpendPeriod::Day),
            0.25
        );
        let (by_user, _) =
            governor
                .cost()
                .spend_breakdown_at(id, Utc::now(), true, false);
        assert_eq!(by_user.unwrap().get("alice"), Some(&0.25));
    }

    #[tokio::test]
    async fn purge_chatbot_drops_all_runtime_state() {
        let governor = RequestGovernor::new(false);
        let id = Uuid::new_v4();
        let policies = governed_policies();
        let upstream = ScriptedUpstream::new([ok_response("a", 0.1)]);

        governor
            .handle(id, &chat_req("hello"), &policies, &upstream)
            .await
            .unwrap();
        assert_eq!(governor.cache().entry_count(id), 1);

        governor.purge_chatbot(id);
        assert_eq!(governor.cache().entry_count(id), 0);
        assert_eq!(governor.cost().record_count(id), 0);
        assert_eq!(governor.rate_limiter().subject_count(), 0);
    }
}
