// 重试执行器：有界指数退避，可选全抖动
//
// 退避等待用 tokio::time::sleep 挂起而不占用工作线程；调用方的
// 请求被取消时，上层 future 被 drop，等待立即中止并随之取消。

use std::time::Duration;

use rand::Rng;

use super::upstream::{UpstreamCaller, UpstreamRequest, UpstreamResponse};
use crate::policy::RetryPolicy;

/// 重试耗尽或遇到不可重试错误后的终态
#[derive(Debug)]
pub struct UpstreamFailure {
    pub attempts: u32,
    pub last_status: Option<u16>,
    pub message: String,
}

/// 第 attempt 次重试前的退避时延（attempt 从 0 起）
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let factor = policy.backoff_multiplier.powi(attempt as i32);
    let ms = (policy.initial_delay_ms as f64 * factor).min(policy.max_delay_ms as f64);
    Duration::from_millis(ms as u64)
}

fn with_jitter(delay: Duration) -> Duration {
    let ms = delay.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=ms))
}

/// 执行上游调用，按策略重试
///
/// 策略关闭时只尝试一次；只有状态码命中 retryable_status_codes
/// 的失败才会重试，其余失败立即作为终态错误返回。
pub async fn execute(
    caller: &dyn UpstreamCaller,
    req: &UpstreamRequest,
    policy: &RetryPolicy,
) -> Result<(UpstreamResponse, u32), UpstreamFailure> {
    let max_retries = if policy.enabled { policy.max_retries } else { 0 };
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        match caller.call(req).await {
            Ok(response) => return Ok((response, attempts)),
            Err(err) => {
                let retryable = err
                    .status
                    .map(|s| policy.retryable_status_codes.contains(&s))
                    .unwrap_or(false);

                if !retryable || attempts > max_retries {
                    return Err(UpstreamFailure {
                        attempts,
                        last_status: err.status,
                        message: err.message,
                    });
                }

                let mut delay = backoff_delay(policy, attempts - 1);
                if policy.jitter {
                    delay = with_jitter(delay);
                }
                tracing::debug!(
                    attempt = attempts,
                    status = ?err.status,
                    delay_ms = delay.as_millis() as u64,
                    "retrying upstream call after backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::super::test_support::{ScriptedUpstream, err_status, ok_response};
    use super::*;
    use crate::governance::upstream::UpstreamRequest;

    fn req() -> UpstreamRequest {
        UpstreamRequest {
            chatbot_id: uuid::Uuid::new_v4(),
            message: "hi".into(),
            context: None,
            user_id: None,
            thread_id: None,
        }
    }

    fn retry_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            enabled: true,
            max_retries,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
            retryable_status_codes: BTreeSet::from([500, 503]),
            jitter: false,
        }
    }

    #[test]
    fn backoff_delays_are_exact_without_jitter() {
        let p = retry_policy(2);
        // 第 2、3 次尝试前的时延
        assert_eq!(backoff_delay(&p, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&p, 1), Duration::from_millis(200));
        // 上限截断
        assert_eq!(backoff_delay(&p, 5), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_within_full_range() {
        let base = Duration::from_millis(500);
        for _ in 0..200 {
            let d = with_jitter(base);
            assert!(d <= base);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_after_max_retries_reports_total_attempts() {
        let upstream = ScriptedUpstream::new([
            err_status(500),
            err_status(500),
            err_status(500),
            err_status(500),
        ]);
        let p = retry_policy(3);

        let err = execute(&upstream, &req(), &p).await.unwrap_err();
        // 3 次重试 = 4 次总尝试
        assert_eq!(err.attempts, 4);
        assert_eq!(err.last_status, Some(500));
        assert_eq!(upstream.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let upstream =
            ScriptedUpstream::new([err_status(503), err_status(503), ok_response("ok", 0.01)]);
        let p = retry_policy(3);

        let (resp, attempts) = execute(&upstream, &req(), &p).await.unwrap();
        assert_eq!(attempts, 3);
        assert_eq!(resp.payload, serde_json::json!({ "reply": "ok" }));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_status_fails_immediately() {
        let upstream = ScriptedUpstream::new([err_status(400), ok_response("ok", 0.01)]);
        let p = retry_policy(3);

        let err = execute(&upstream, &req(), &p).await.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(err.last_status, Some(400));
        assert_eq!(upstream.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_policy_makes_exactly_one_attempt() {
        let upstream = ScriptedUpstream::new([err_status(500), ok_response("ok", 0.01)]);
        let p = RetryPolicy {
            enabled: false,
            ..retry_policy(3)
        };

        let err = execute(&upstream, &req(), &p).await.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(upstream.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_waits_are_applied_between_attempts() {
        let upstream = ScriptedUpstream::new([err_status(500), err_status(500), ok_response("ok", 0.0)]);
        let p = retry_policy(2);

        let started = tokio::time::Instant::now();
        let (_, attempts) = execute(&upstream, &req(), &p).await.unwrap();
        assert_eq!(attempts, 3);
        // 100ms + 200ms 的虚拟时钟推进
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }
}
