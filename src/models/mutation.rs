//! 写入请求模型

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// 写入请求标识，用于区分批量结果中的成功/失败项
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(String);

impl MutationId {
    /// 生成随机 ID（UUID v4）
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MutationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MutationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 写入操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "payload", rename_all = "lowercase")]
pub enum MutationOp {
    /// 整体写入（覆盖或创建）
    Set(Value),
    /// 合并顶层字段，文档必须已存在
    Update(Value),
    Delete,
}

impl MutationOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Set(_) => "set",
            Self::Update(_) => "update",
            Self::Delete => "delete",
        }
    }
}

/// 单条写入请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub id: MutationId,
    pub collection: String,
    pub document_id: String,
    pub op: MutationOp,
}

impl MutationRequest {
    pub fn new(collection: impl Into<String>, document_id: impl Into<String>, op: MutationOp) -> Self {
        Self {
            id: MutationId::random(),
            collection: collection.into(),
            document_id: document_id.into(),
            op,
        }
    }

    pub fn set(collection: impl Into<String>, document_id: impl Into<String>, payload: Value) -> Self {
        Self::new(collection, document_id, MutationOp::Set(payload))
    }

    pub fn update(
        collection: impl Into<String>,
        document_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::new(collection, document_id, MutationOp::Update(payload))
    }

    pub fn delete(collection: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self::new(collection, document_id, MutationOp::Delete)
    }

    /// 指定调用方自己的 ID（便于重试时对账）
    pub fn with_id(mut self, id: impl Into<MutationId>) -> Self {
        self.id = id.into();
        self
    }
}
