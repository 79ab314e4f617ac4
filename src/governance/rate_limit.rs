// 限流器：分层固定窗口 + 可选突发令牌桶 + 违规封禁
//
// 状态按 (chatbot_id, subject_id) 惰性创建，DashMap 的分片锁保证
// 同一主体的计数检查与递增是原子的（要么全部递增，要么全不递增）。

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::StoreError;
use crate::policy::RateLimitPolicy;

const HOUR_SECS: i64 = 3_600;
const DAY_SECS: i64 = 86_400;
// 月窗按固定 30 天计算，窗口起点必须是 floor(now, window) 对齐的
const MONTH_SECS: i64 = 30 * DAY_SECS;

/// 准入结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitDecision {
    Allowed,
    Rejected {
        retry_after: Duration,
        reason: RejectReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// 处于违规封禁期
    Blocked,
    MinuteCap,
    HourCap,
    DayCap,
    MonthCap,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::Blocked => "blocked",
            RejectReason::MinuteCap => "minute limit",
            RejectReason::HourCap => "hour limit",
            RejectReason::DayCap => "day limit",
            RejectReason::MonthCap => "month limit",
        };
        f.write_str(s)
    }
}

/// 单个固定窗口的计数器，窗口起点为 floor(ts / len) * len（UTC 秒）
#[derive(Debug, Clone, Copy, Default)]
struct WindowCounter {
    window_start: i64,
    count: u32,
}

impl WindowCounter {
    fn current(&self, ts: i64, window_len: i64) -> u32 {
        if self.window_start == align(ts, window_len) {
            self.count
        } else {
            0
        }
    }

    fn increment(&mut self, ts: i64, window_len: i64) {
        let start = align(ts, window_len);
        if self.window_start != start {
            self.window_start = start;
            self.count = 0;
        }
        self.count += 1;
    }
}

fn align(ts: i64, window_len: i64) -> i64 {
    (ts / window_len) * window_len
}

/// 距当前窗口边界的剩余秒数
fn secs_to_boundary(ts: i64, window_len: i64) -> i64 {
    align(ts, window_len) + window_len - ts
}

/// 单个主体的限流状态
#[derive(Debug, Default)]
struct SubjectState {
    minute: WindowCounter,
    hour: WindowCounter,
    day: WindowCounter,
    month: WindowCounter,
    burst_tokens: f64,
    burst_updated: i64,
    burst_primed: bool,
    /// 0 表示未封禁
    blocked_until: i64,
    last_seen: i64,
    /// 闲置多久后可回收 = max(配置窗口) + 封禁时长
    idle_expiry: i64,
}

pub struct RateLimiter {
    states: DashMap<(Uuid, String), SubjectState>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
        }
    }

    /// 准入检查
    pub fn admit(
        &self,
        chatbot_id: Uuid,
        subject_id: &str,
        policy: &RateLimitPolicy,
    ) -> Result<AdmitDecision, StoreError> {
        self.admit_at(chatbot_id, subject_id, policy, Utc::now())
    }

    /// 准入检查（显式时钟，窗口运算全部基于 UTC 秒）
    pub fn admit_at(
        &self,
        chatbot_id: Uuid,
        subject_id: &str,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<AdmitDecision, StoreError> {
        // 策略关闭时无条件放行，并且不触碰任何状态
        if !policy.enabled {
            return Ok(AdmitDecision::Allowed);
        }

        let ts = now.timestamp();
        let minute_len = policy.window_size_seconds as i64;

        let key = (chatbot_id, subject_id.to_string());
        let mut state = self.states.entry(key).or_default();

        // 封禁期内直接拒绝，不做计数运算（滥用期间的快速路径）
        if state.blocked_until > ts {
            let retry_after = Duration::from_secs((state.blocked_until - ts) as u64);
            return Ok(AdmitDecision::Rejected {
                retry_after,
                reason: RejectReason::Blocked,
            });
        }

        let windows: [(Option<u32>, &WindowCounter, i64, RejectReason); 4] = [
            (
                policy.max_per_minute,
                &state.minute,
                minute_len,
                RejectReason::MinuteCap,
            ),
            (
                policy.max_per_hour,
                &state.hour,
                HOUR_SECS,
                RejectReason::HourCap,
            ),
            (
                policy.max_per_day,
                &state.day,
                DAY_SECS,
                RejectReason::DayCap,
            ),
            (
                policy.max_per_month,
                &state.month,
                MONTH_SECS,
                RejectReason::MonthCap,
            ),
        ];

        let mut violations: Vec<(i64, RejectReason)> = Vec::new();
        for (cap, counter, len, reason) in &windows {
            if let Some(cap) = cap {
                if counter.current(ts, *len) + 1 > *cap {
                    violations.push((*len, *reason));
                }
            }
        }

        // 只有分钟窗超限时，突发令牌可以临时放行（小时/日/月上限不受突发影响）
        if violations.len() == 1 && violations[0].1 == RejectReason::MinuteCap {
            if let Some(burst) = policy.burst_limit {
                let burst = burst as f64;
                if !state.burst_primed {
                    // 首次使用时桶是满的
                    state.burst_tokens = burst;
                    state.burst_primed = true;
                } else {
                    let elapsed = (ts - state.burst_updated).max(0) as f64;
                    let refill_rate = burst / minute_len as f64;
                    state.burst_tokens = (state.burst_tokens + elapsed * refill_rate).min(burst);
                }
                state.burst_updated = ts;
                if state.burst_tokens >= 1.0 {
                    state.burst_tokens -= 1.0;
                    violations.clear();
                }
            }
        }

        if !violations.is_empty() {
            // retry_after 取最远的违规窗口边界（真正卡住请求的那一个，
            // 更近的边界翻转后依然会被它拒绝）；拒绝不递增任何计数
            let retry_secs = violations
                .iter()
                .map(|(len, _)| secs_to_boundary(ts, *len))
                .max()
                .unwrap_or(minute_len);
            let reason = violations
                .iter()
                .max_by_key(|(len, _)| secs_to_boundary(ts, *len))
                .map(|(_, r)| *r)
                .unwrap_or(RejectReason::MinuteCap);

            let mut retry_after = Duration::from_secs(retry_secs.max(1) as u64);
            if policy.block_duration_seconds > 0 {
                state.blocked_until = ts + policy.block_duration_seconds as i64;
                retry_after = Duration::from_secs(policy.block_duration_seconds);
            }
            state.last_seen = ts;
            state.idle_expiry = idle_expiry(policy, minute_len);

            tracing::debug!(
                chatbot_id = %chatbot_id,
                subject_id = %subject_id,
                reason = %reason,
                retry_after_secs = retry_after.as_secs(),
                "request rejected by rate limiter"
            );
            return Ok(AdmitDecision::Rejected {
                retry_after,
                reason,
            });
        }

        // 全部窗口都有余量，一次性递增所有配置了上限的计数器
        if policy.max_per_minute.is_some() {
            state.minute.increment(ts, minute_len);
        }
        if policy.max_per_hour.is_some() {
            state.hour.increment(ts, HOUR_SECS);
        }
        if policy.max_per_day.is_some() {
            state.day.increment(ts, DAY_SECS);
        }
        if policy.max_per_month.is_some() {
            state.month.increment(ts, MONTH_SECS);
        }
        state.last_seen = ts;
        state.idle_expiry = idle_expiry(policy, minute_len);

        Ok(AdmitDecision::Allowed)
    }

    /// 回收闲置主体的状态
    pub fn purge_idle_at(&self, now: DateTime<Utc>) {
        let ts = now.timestamp();
        self.states
            .retain(|_, s| ts - s.last_seen <= s.idle_expiry);
    }

    /// 机器人删除时清空其全部限流状态
    pub fn purge_chatbot(&self, chatbot_id: Uuid) {
        self.states.retain(|(id, _), _| *id != chatbot_id);
    }

    pub fn subject_count(&self) -> usize {
        self.states.len()
    }
}

fn idle_expiry(policy: &RateLimitPolicy, minute_len: i64) -> i64 {
    let mut max_window = minute_len;
    if policy.max_per_hour.is_some() {
        max_window = max_window.max(HOUR_SECS);
    }
    if policy.max_per_day.is_some() {
        max_window = max_window.max(DAY_SECS);
    }
    if policy.max_per_month.is_some() {
        max_window = max_window.max(MONTH_SECS);
    }
    max_window + policy.block_duration_seconds as i64
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn minute_policy(cap: u32) -> RateLimitPolicy {
        RateLimitPolicy {
            enabled: true,
            max_per_minute: Some(cap),
            ..Default::default()
        }
    }

    #[test]
    fn disabled_policy_always_admits_without_state() {
        let limiter = RateLimiter::new();
        let policy = RateLimitPolicy::default();
        let id = Uuid::new_v4();

        for _ in 0..100 {
            let d = limiter.admit_at(id, "u1", &policy, at(1_000)).unwrap();
            assert_eq!(d, AdmitDecision::Allowed);
        }
        assert_eq!(limiter.subject_count(), 0);
    }

    #[test]
    fn two_allowed_then_rejected_within_same_minute() {
        let limiter = RateLimiter::new();
        let policy = minute_policy(2);
        let id = Uuid::new_v4();

        let results: Vec<_> = (0..3)
            .map(|i| limiter.admit_at(id, "u1", &policy, at(600 + i)).unwrap())
            .collect();

        assert_eq!(results[0], AdmitDecision::Allowed);
        assert_eq!(results[1], AdmitDecision::Allowed);
        match &results[2] {
            AdmitDecision::Rejected {
                retry_after,
                reason,
            } => {
                assert!(retry_after.as_secs() > 0);
                assert_eq!(*reason, RejectReason::MinuteCap);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn counter_resets_at_window_boundary() {
        let limiter = RateLimiter::new();
        let policy = minute_policy(1);
        let id = Uuid::new_v4();

        assert_eq!(
            limiter.admit_at(id, "u1", &policy, at(30)).unwrap(),
            AdmitDecision::Allowed
        );
        assert!(matches!(
            limiter.admit_at(id, "u1", &policy, at(31)).unwrap(),
            AdmitDecision::Rejected { .. }
        ));
        // 下一个分钟窗重新放行
        assert_eq!(
            limiter.admit_at(id, "u1", &policy, at(60)).unwrap(),
            AdmitDecision::Allowed
        );
    }

    #[test]
    fn rejection_does_not_consume_counters() {
        let limiter = RateLimiter::new();
        let policy = minute_policy(2);
        let id = Uuid::new_v4();

        limiter.admit_at(id, "u1", &policy, at(0)).unwrap();
        limiter.admit_at(id, "u1", &policy, at(1)).unwrap();
        // 连续拒绝若递增计数，会把小时/日窗也算脏；这里验证下个窗口立即恢复
        for i in 2..10 {
            assert!(matches!(
                limiter.admit_at(id, "u1", &policy, at(i)).unwrap(),
                AdmitDecision::Rejected { .. }
            ));
        }
        assert_eq!(
            limiter.admit_at(id, "u1", &policy, at(60)).unwrap(),
            AdmitDecision::Allowed
        );
    }

    #[test]
    fn subjects_are_isolated() {
        let limiter = RateLimiter::new();
        let policy = minute_policy(1);
        let id = Uuid::new_v4();

        assert_eq!(
            limiter.admit_at(id, "u1", &policy, at(0)).unwrap(),
            AdmitDecision::Allowed
        );
        assert!(matches!(
            limiter.admit_at(id, "u1", &policy, at(1)).unwrap(),
            AdmitDecision::Rejected { .. }
        ));
        // 另一个主体不受影响
        assert_eq!(
            limiter.admit_at(id, "u2", &policy, at(1)).unwrap(),
            AdmitDecision::Allowed
        );
    }

    #[test]
    fn hour_cap_applies_across_minutes() {
        let limiter = RateLimiter::new();
        let policy = RateLimitPolicy {
            enabled: true,
            max_per_minute: Some(10),
            max_per_hour: Some(3),
            ..Default::default()
        };
        let id = Uuid::new_v4();

        for i in 0..3 {
            assert_eq!(
                limiter
                    .admit_at(id, "u1", &policy, at(i * 60))
                    .unwrap(),
                AdmitDecision::Allowed
            );
        }
        match limiter.admit_at(id, "u1", &policy, at(200)).unwrap() {
            AdmitDecision::Rejected { reason, .. } => {
                assert_eq!(reason, RejectReason::HourCap)
            }
            other => panic!("expected hour cap rejection, got {:?}", other),
        }
    }

    #[test]
    fn burst_allows_short_overflow_above_minute_cap() {
        let limiter = RateLimiter::new();
        let policy = RateLimitPolicy {
            enabled: true,
            max_per_minute: Some(2),
            burst_limit: Some(2),
            ..Default::default()
        };
        let id = Uuid::new_v4();

        // 2 个常规 + 2 个突发令牌
        for i in 0..4 {
            assert_eq!(
                limiter.admit_at(id, "u1", &policy, at(i)).unwrap(),
                AdmitDecision::Allowed,
                "request {} should pass",
                i
            );
        }
        assert!(matches!(
            limiter.admit_at(id, "u1", &policy, at(4)).unwrap(),
            AdmitDecision::Rejected { .. }
        ));
    }

    #[test]
    fn burst_does_not_bypass_hour_cap() {
        let limiter = RateLimiter::new();
        let policy = RateLimitPolicy {
            enabled: true,
            max_per_minute: Some(1),
            max_per_hour: Some(1),
            burst_limit: Some(5),
            ..Default::default()
        };
        let id = Uuid::new_v4();

        assert_eq!(
            limiter.admit_at(id, "u1", &policy, at(0)).unwrap(),
            AdmitDecision::Allowed
        );
        match limiter.admit_at(id, "u1", &policy, at(1)).unwrap() {
            AdmitDecision::Rejected { reason, .. } => {
                assert_eq!(reason, RejectReason::HourCap)
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn retry_after_points_at_the_binding_window() {
        let limiter = RateLimiter::new();
        let policy = RateLimitPolicy {
            enabled: true,
            max_per_minute: Some(1),
            max_per_hour: Some(1),
            ..Default::default()
        };
        let id = Uuid::new_v4();

        limiter.admit_at(id, "u1", &policy, at(0)).unwrap();
        // 分钟窗和小时窗同时超限：按分钟边界重试仍会被小时窗拒绝，
        // 必须通告最远的边界
        match limiter.admit_at(id, "u1", &policy, at(1)).unwrap() {
            AdmitDecision::Rejected {
                reason,
                retry_after,
            } => {
                assert_eq!(reason, RejectReason::HourCap);
                assert_eq!(retry_after.as_secs(), 3_599);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn violation_blocks_subject_for_configured_duration() {
        let limiter = RateLimiter::new();
        let policy = RateLimitPolicy {
            enabled: true,
            max_per_minute: Some(1),
            block_duration_seconds: 300,
            ..Default::default()
        };
        let id = Uuid::new_v4();

        limiter.admit_at(id, "u1", &policy, at(0)).unwrap();
        assert!(matches!(
            limiter.admit_at(id, "u1", &policy, at(1)).unwrap(),
            AdmitDecision::Rejected { .. }
        ));
        // 新的分钟窗本来有余量，但封禁期内直接拒绝
        match limiter.admit_at(id, "u1", &policy, at(100)).unwrap() {
            AdmitDecision::Rejected {
                reason,
                retry_after,
            } => {
                assert_eq!(reason, RejectReason::Blocked);
                assert_eq!(retry_after.as_secs(), 201);
            }
            other => panic!("expected blocked rejection, got {:?}", other),
        }
        // 封禁到期后恢复
        assert_eq!(
            limiter.admit_at(id, "u1", &policy, at(302)).unwrap(),
            AdmitDecision::Allowed
        );
    }

    #[test]
    fn idle_states_are_purged() {
        let limiter = RateLimiter::new();
        let policy = minute_policy(5);
        let id = Uuid::new_v4();

        limiter.admit_at(id, "u1", &policy, at(0)).unwrap();
        assert_eq!(limiter.subject_count(), 1);

        limiter.purge_idle_at(at(30));
        assert_eq!(limiter.subject_count(), 1);

        // 超过 max(窗口) + 封禁时长之后回收
        limiter.purge_idle_at(at(120));
        assert_eq!(limiter.subject_count(), 0);
    }

    #[test]
    fn purge_chatbot_removes_only_that_tenant() {
        let limiter = RateLimiter::new();
        let policy = minute_policy(5);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        limiter.admit_at(a, "u1", &policy, at(0)).unwrap();
        limiter.admit_at(b, "u1", &policy, at(0)).unwrap();
        limiter.purge_chatbot(a);
        assert_eq!(limiter.subject_count(), 1);
    }
}
