// 请求治理模块
// 限流、响应缓存、重试、成本预算四个部件，由 governor 按请求编排

pub mod cache;
pub mod cost;
pub mod governor;
pub mod rate_limit;
pub mod retry;
pub mod upstream;

use std::fmt;

/// 运行时存储错误
///
/// 内存实现本身不会失败，但存储层是可替换的（共享的 KV 存储）；
/// 限流按配置决定放行或拒绝，缓存一律降级为未命中。
#[derive(Debug)]
pub struct StoreError(pub String);

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runtime store error: {}", self.0)
    }
}

impl std::error::Error for StoreError {}
