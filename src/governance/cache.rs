// 响应缓存：按策略派生键，TTL 惰性过期，满载时按 LRU 逐出
//
// 每个机器人一张独立的键表（租户之间互不争锁），同键并发写入
// 按 created_at 的 last-write-wins 规则裁决，旧写入不会覆盖新写入。

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::StoreError;
use crate::policy::{CachePolicy, CacheStrategy};

/// fuzzy 策略取归一化后前多少个词（策略无关的固定常数）
const FUZZY_PREFIX_WORDS: usize = 8;

/// 缓存条目
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub response: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hits: u64,
    last_used: DateTime<Utc>,
}

pub struct ResponseCache {
    tenants: DashMap<Uuid, DashMap<String, CacheEntry>>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

/// 大小写折叠并压缩空白
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

fn fuzzy_prefix(text: &str) -> String {
    text.split_whitespace()
        .take(FUZZY_PREFIX_WORDS)
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// 按策略派生缓存键（SHA-256 十六进制）
///
/// 字段之间以 0x1f 分隔，避免前缀拼接歧义。
pub fn derive_key(
    chatbot_id: Uuid,
    message: &str,
    context: Option<&str>,
    policy: &CachePolicy,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(policy.key_prefix.as_bytes());
    hasher.update([0x1f]);
    hasher.update(chatbot_id.as_bytes());
    hasher.update([0x1f]);

    match policy.strategy {
        CacheStrategy::Exact => {
            hasher.update(message.as_bytes());
            if policy.include_context {
                if let Some(ctx) = context {
                    hasher.update([0x1f]);
                    hasher.update(ctx.as_bytes());
                }
            }
        }
        CacheStrategy::Semantic => {
            hasher.update(normalize(message).as_bytes());
            if policy.include_context {
                if let Some(ctx) = context {
                    hasher.update([0x1f]);
                    hasher.update(normalize(ctx).as_bytes());
                }
            }
        }
        // fuzzy 有意忽略上下文：共享前缀即碰撞，换取命中率
        CacheStrategy::Fuzzy => {
            hasher.update(fuzzy_prefix(message).as_bytes());
        }
    }

    format!("{:x}", hasher.finalize())
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            tenants: DashMap::new(),
        }
    }

    pub fn lookup(
        &self,
        chatbot_id: Uuid,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        self.lookup_at(chatbot_id, key, Utc::now())
    }

    /// 查找；过期条目视为未命中并顺手清除
    pub fn lookup_at(
        &self,
        chatbot_id: Uuid,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let Some(tenant) = self.tenants.get(&chatbot_id) else {
            return Ok(None);
        };

        let expired = match tenant.get_mut(key) {
            Some(mut entry) => {
                if entry.expires_at <= now {
                    true
                } else {
                    entry.hits += 1;
                    entry.last_used = now;
                    return Ok(Some(entry.response.clone()));
                }
            }
            None => return Ok(None),
        };

        if expired {
            tenant.remove(key);
        }
        Ok(None)
    }

    pub fn store(
        &self,
        chatbot_id: Uuid,
        key: String,
        response: serde_json::Value,
        policy: &CachePolicy,
    ) -> Result<(), StoreError> {
        self.store_at(chatbot_id, key, response, policy, Utc::now())
    }

    /// 写入；容量到达 max_entries 时先逐出最久未用的条目
    pub fn store_at(
        &self,
        chatbot_id: Uuid,
        key: String,
        response: serde_json::Value,
        policy: &CachePolicy,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let tenant = self.tenants.entry(chatbot_id).or_default();

        // 逐出循环直到容量有余量：max_entries 被调低后表可能已经超限，
        // 单次逐出会让超出的部分永久滞留
        let headroom = if tenant.contains_key(&key) {
            policy.max_entries
        } else {
            policy.max_entries.saturating_sub(1)
        };
        while tenant.len() > headroom {
            let lru = tenant
                .iter()
                .filter(|e| e.key() != &key)
                .min_by_key(|e| e.value().last_used)
                .map(|e| e.key().clone());
            match lru {
                Some(lru_key) => {
                    tenant.remove(&lru_key);
                }
                None => break,
            }
        }

        let entry = CacheEntry {
            response,
            created_at: now,
            expires_at: now + ChronoDuration::seconds(policy.ttl_seconds as i64),
            hits: 0,
            last_used: now,
        };

        match tenant.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut o) => {
                // last-write-wins：已有更新的写入时丢弃本次
                if o.get().created_at <= entry.created_at {
                    o.insert(entry);
                }
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(entry);
            }
        }
        Ok(())
    }

    /// 清空单个机器人的全部缓存
    pub fn flush(&self, chatbot_id: Uuid) -> usize {
        match self.tenants.remove(&chatbot_id) {
            Some((_, tenant)) => tenant.len(),
            None => 0,
        }
    }

    pub fn entry_count(&self, chatbot_id: Uuid) -> usize {
        self.tenants.get(&chatbot_id).map(|t| t.len()).unwrap_or(0)
    }
}
