//! 缓存条目与完整性校验

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// 缓存条目
///
/// 持久化布局：`{"payload": ..., "storedAt": <epoch-ms>, "ttlMs": <int>, "hash": "<hex>"}`，
/// 键本身由持久层保存，不写入值中。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    #[serde(skip)]
    pub key: String,
    pub payload: Value,
    pub stored_at: i64,
    pub ttl_ms: u64,
    pub hash: String,
}

impl CacheEntry {
    /// 创建条目并计算校验和
    pub fn new(key: impl Into<String>, payload: Value, stored_at: i64, ttl_ms: u64) -> Self {
        let hash = compute_hash(&payload);
        Self {
            key: key.into(),
            payload,
            stored_at,
            ttl_ms,
            hash,
        }
    }

    /// 是否已过期：`now - storedAt >= ttlMs`
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.stored_at) >= i64::try_from(self.ttl_ms).unwrap_or(i64::MAX)
    }

    /// 校验和是否与内容一致
    pub fn is_intact(&self) -> bool {
        compute_hash(&self.payload) == self.hash
    }

    /// 近似占用字节数（键 + 序列化内容）
    pub fn size_bytes(&self) -> u64 {
        let payload_len = serde_json::to_vec(&self.payload)
            .map(|bytes| bytes.len())
            .unwrap_or(0);
        (self.key.len() + payload_len + self.hash.len()) as u64
    }
}

/// 计算内容的 SHA-256 校验和（十六进制）
///
/// `serde_json` 默认按键排序序列化对象，同一内容的编码是确定的。
pub fn compute_hash(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_is_stable() {
        let payload = json!({"b": [1, 2, 3], "a": {"nested": true}});
        let h1 = compute_hash(&payload);
        let h2 = compute_hash(&payload.clone());
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_ignores_key_insertion_order() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y": 2, "x": 1}"#).unwrap();
        assert_eq!(compute_hash(&a), compute_hash(&b));
    }

    #[test]
    fn test_hash_detects_any_change() {
        let base = json!({"title": "hello", "count": 1});
        let variants = [
            json!({"title": "hellp", "count": 1}),
            json!({"title": "hello", "count": 2}),
            json!({"title": "hello", "count": 1, "extra": null}),
            json!({"title": "hello"}),
        ];
        let base_hash = compute_hash(&base);
        for variant in variants {
            assert_ne!(base_hash, compute_hash(&variant), "{variant}");
        }
    }

    #[test]
    fn test_expiry_boundary() {
        let entry = CacheEntry::new("k", json!(1), 1_000, 500);
        assert!(!entry.is_expired(1_499));
        assert!(entry.is_expired(1_500));
        assert!(entry.is_expired(9_999));
    }

    #[test]
    fn test_max_ttl_does_not_wrap() {
        let entry = CacheEntry::new("k", json!(1), 0, u64::MAX);
        assert!(!entry.is_expired(i64::MAX - 1));
    }

    #[test]
    fn test_tampered_entry_is_not_intact() {
        let mut entry = CacheEntry::new("k", json!({"v": 1}), 0, 10);
        assert!(entry.is_intact());
        entry.payload = json!({"v": 2});
        assert!(!entry.is_intact());
    }

    #[test]
    fn test_persisted_layout() {
        let entry = CacheEntry::new("k", json!({"v": 1}), 42, 1000);
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["storedAt"], 42);
        assert_eq!(v["ttlMs"], 1000);
        assert_eq!(v["hash"], entry.hash.as_str());
        assert!(v.get("key").is_none());
    }
}
