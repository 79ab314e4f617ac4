use serde::Serialize;

/// 缓存清空结果
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushCacheResponse {
    /// 被清除的条目数
    pub flushed_entries: usize,
}
