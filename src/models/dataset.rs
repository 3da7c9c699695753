//! 数据集模型：拉取描述 + 合并结果

use super::document::{Document, QuerySpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

/// 数据集的一个来源：集合 + 查询
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceQuery {
    pub collection: String,
    #[serde(default)]
    pub query: QuerySpec,
}

impl SourceQuery {
    pub fn new(collection: impl Into<String>, query: QuerySpec) -> Self {
        Self {
            collection: collection.into(),
            query,
        }
    }
}

/// 派生分组索引的规则
///
/// 从类路径字段（如 `"projects/alpha/notes/1"`）中截取前 `depth` 段作为分组键。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub field: String,
    #[serde(default = "default_depth")]
    pub depth: usize,
    #[serde(default = "default_separator")]
    pub separator: char,
}

fn default_depth() -> usize {
    1
}

fn default_separator() -> char {
    '/'
}

impl IndexSpec {
    pub fn new(field: impl Into<String>, depth: usize) -> Self {
        Self {
            field: field.into(),
            depth,
            separator: default_separator(),
        }
    }

    /// 计算文档的分组键；字段缺失、非字符串或为空时返回 None
    pub fn group_key(&self, document: &Document) -> Option<String> {
        let raw = document.field(&self.field)?.as_str()?;
        let segments: Vec<&str> = raw
            .split(self.separator)
            .filter(|segment| !segment.is_empty())
            .take(self.depth.max(1))
            .collect();
        if segments.is_empty() {
            return None;
        }
        Some(segments.join(&self.separator.to_string()))
    }
}

/// 数据集描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub name: String,
    pub sources: Vec<SourceQuery>,
    #[serde(default)]
    pub index: Option<IndexSpec>,
    /// 覆盖默认 TTL
    #[serde(default)]
    pub ttl: Option<Duration>,
}

impl DatasetSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sources: Vec::new(),
            index: None,
            ttl: None,
        }
    }

    pub fn source(mut self, collection: impl Into<String>, query: QuerySpec) -> Self {
        self.sources.push(SourceQuery::new(collection, query));
        self
    }

    pub fn with_index(mut self, index: IndexSpec) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// 组合缓存键：`dataset:<name>:<collection,...>#<查询摘要>`
    ///
    /// 摘要取所有来源查询序列化结果的 SHA-256 前 12 位，
    /// 同名但过滤条件不同的数据集不会共用缓存条目。
    pub fn cache_key(&self) -> String {
        let collections: Vec<&str> = self.sources.iter().map(|s| s.collection.as_str()).collect();
        format!(
            "dataset:{}:{}#{}",
            self.name,
            collections.join(","),
            self.query_digest()
        )
    }

    fn query_digest(&self) -> String {
        let queries: Vec<&QuerySpec> = self.sources.iter().map(|s| &s.query).collect();
        let bytes = serde_json::to_value(&queries)
            .and_then(|value| serde_json::to_vec(&value))
            .unwrap_or_default();
        let digest = format!("{:x}", Sha256::digest(&bytes));
        digest[..12].to_string()
    }

    /// 数据集是否读取了该集合
    pub fn reads_collection(&self, collection: &str) -> bool {
        self.sources.iter().any(|s| s.collection == collection)
    }
}

/// 数据集来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatasetOrigin {
    /// 命中有效缓存
    Cache,
    /// 远程拉取
    #[default]
    Remote,
    /// 远程失败后回退到过期缓存
    StaleFallback,
}

/// 合并后的数据集
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub records: Vec<Document>,
    /// 分组键 -> 文档 ID 列表（保持记录顺序）
    pub derived_index: BTreeMap<String, Vec<String>>,
    pub last_updated: DateTime<Utc>,
    #[serde(skip)]
    pub origin: DatasetOrigin,
}

impl Dataset {
    /// 按来源顺序合并各集合的查询结果并构建分组索引
    pub fn assemble(parts: Vec<Vec<Document>>, index: Option<&IndexSpec>) -> Self {
        let records: Vec<Document> = parts.into_iter().flatten().collect();
        let mut derived_index: BTreeMap<String, Vec<String>> = BTreeMap::new();
        if let Some(index) = index {
            for record in &records {
                if let Some(group) = index.group_key(record) {
                    derived_index.entry(group).or_default().push(record.id.clone());
                }
            }
        }
        Self {
            records,
            derived_index,
            last_updated: Utc::now(),
            origin: DatasetOrigin::Remote,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn with_origin(mut self, origin: DatasetOrigin) -> Self {
        self.origin = origin;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::document::Direction;
    use serde_json::json;

    #[test]
    fn test_group_key_depth() {
        let index = IndexSpec::new("path", 2);
        let d = Document::new("notes", "1", json!({"path": "/projects/alpha/notes/1"}));
        assert_eq!(index.group_key(&d), Some("projects/alpha".to_string()));

        let shallow = Document::new("notes", "2", json!({"path": "inbox"}));
        assert_eq!(index.group_key(&shallow), Some("inbox".to_string()));

        let missing = Document::new("notes", "3", json!({"title": "x"}));
        assert_eq!(index.group_key(&missing), None);
    }

    #[test]
    fn test_assemble_keeps_source_order() {
        let a = vec![
            Document::new("drafts", "a1", json!({"path": "x/1"})),
            Document::new("drafts", "a2", json!({"path": "y/1"})),
        ];
        let b = vec![Document::new("published", "b1", json!({"path": "x/2"}))];
        let ds = Dataset::assemble(vec![a, b], Some(&IndexSpec::new("path", 1)));

        let ids: Vec<_> = ds.records.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2", "b1"]);
        assert_eq!(ds.derived_index["x"], vec!["a1", "b1"]);
        assert_eq!(ds.derived_index["y"], vec!["a2"]);
        assert_eq!(ds.origin, DatasetOrigin::Remote);
    }

    #[test]
    fn test_cache_key_is_composite() {
        let spec = DatasetSpec::new("library")
            .source("drafts", QuerySpec::new())
            .source("published", QuerySpec::new());
        assert!(spec
            .cache_key()
            .starts_with("dataset:library:drafts,published#"));
        assert!(spec.reads_collection("drafts"));
        assert!(!spec.reads_collection("users"));
    }

    #[test]
    fn test_cache_key_depends_on_queries() {
        let open = DatasetSpec::new("library").source("drafts", QuerySpec::new());
        let filtered = DatasetSpec::new("library").source(
            "drafts",
            QuerySpec::new().order_by("path", Direction::Desc),
        );
        assert_ne!(open.cache_key(), filtered.cache_key());
        assert_eq!(open.cache_key(), open.clone().cache_key());
    }

    #[test]
    fn test_origin_not_persisted() {
        let ds = Dataset::assemble(vec![], None).with_origin(DatasetOrigin::Cache);
        let back: Dataset = serde_json::from_value(serde_json::to_value(&ds).unwrap()).unwrap();
        assert_eq!(back.origin, DatasetOrigin::Remote);
        assert!(back.is_empty());
    }
}
