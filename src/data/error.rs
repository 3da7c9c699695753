//! 统一错误类型定义
//!
//! 使用 `thiserror` 定义缓存同步层的所有错误类型：
//! - `RemoteError`: 远程文档存储契约返回的错误（可克隆，便于在共享的拉取任务间传递）
//! - `DataError`: 面向调用方的统一错误，携带操作名、受影响的键/作用域和根因

use std::path::PathBuf;
use thiserror::Error;

/// 远程文档存储错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// 远程服务不可达或暂时不可用
    #[error("远程存储不可用: {0}")]
    Unavailable(String),

    /// 权限不足
    #[error("权限不足: {0}")]
    PermissionDenied(String),

    /// 目标文档不存在（例如对不存在的文档执行 update）
    #[error("文档不存在: {collection}/{document_id}")]
    NotFound {
        collection: String,
        document_id: String,
    },

    /// 单次批量写入超过提供方限制
    #[error("批量写入超出限制: {len} > {limit}")]
    BatchTooLarge { len: usize, limit: usize },

    /// 订阅流中断
    #[error("订阅中断: {0}")]
    SubscriptionClosed(String),

    /// 其他远程错误
    #[error("远程存储错误: {0}")]
    Other(String),
}

/// 缓存同步层的统一错误类型
#[derive(Error, Debug)]
pub enum DataError {
    /// 文件 I/O 错误
    #[error("文件 I/O 错误: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON 序列化/反序列化错误
    #[error("JSON 序列化错误: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    /// TOML 反序列化错误
    #[error("TOML 反序列化错误: {0}")]
    TomlDeserialization(#[from] toml::de::Error),

    /// 数据库错误
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    /// 并发错误
    #[error("并发错误: {0}")]
    Concurrency(String),

    /// 无效的缓存键
    #[error("无效的缓存键: {0}")]
    InvalidKey(String),

    /// 配置无效
    #[error("配置无效: {0}")]
    InvalidConfig(String),

    /// 远程读取失败且没有可用的过期缓存
    #[error("数据不可用: {operation} [{key}] 读取集合 {collection} 失败: {cause}")]
    DataUnavailable {
        operation: &'static str,
        key: String,
        collection: String,
        #[source]
        cause: RemoteError,
    },

    /// 订阅失败（建立或运行期间）
    #[error("订阅失败: [{scope}]: {cause}")]
    Subscription {
        scope: String,
        #[source]
        cause: RemoteError,
    },

    /// 操作已被取消
    #[error("操作已取消: {operation} [{key}]")]
    Cancelled { operation: &'static str, key: String },
}

/// 便于与现有代码集成的类型别名
pub type Result<T> = std::result::Result<T, DataError>;

impl DataError {
    /// 从 `std::io::Error` 和路径创建 I/O 错误
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// 返回远程根因（如果有）
    pub fn remote_cause(&self) -> Option<&RemoteError> {
        match self {
            Self::DataUnavailable { cause, .. } | Self::Subscription { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DataError::InvalidKey("".to_string());
        assert_eq!(err.to_string(), "无效的缓存键: ");
    }

    #[test]
    fn test_io_error_construction() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = DataError::io("/path/to/cache", io_err);
        assert!(err.to_string().contains("/path/to/cache"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{invalid json").unwrap_err();
        let err: DataError = json_err.into();
        assert!(matches!(err, DataError::JsonSerialization(_)));
    }

    #[test]
    fn test_data_unavailable_carries_context() {
        let err = DataError::DataUnavailable {
            operation: "fetch_dataset",
            key: "dataset:notes:drafts".to_string(),
            collection: "drafts".to_string(),
            cause: RemoteError::Unavailable("offline".to_string()),
        };
        let text = err.to_string();
        assert!(text.contains("fetch_dataset"));
        assert!(text.contains("dataset:notes:drafts"));
        assert!(text.contains("drafts"));
        assert!(text.contains("offline"));
        assert_eq!(
            err.remote_cause(),
            Some(&RemoteError::Unavailable("offline".to_string()))
        );
    }

    #[test]
    fn test_anyhow_conversion() {
        let err = DataError::Cancelled {
            operation: "fetch_dataset",
            key: "k".to_string(),
        };
        let anyhow_err: anyhow::Error = err.into();
        assert!(anyhow_err.to_string().contains("操作已取消"));
    }

    #[test]
    fn test_batch_too_large_message() {
        let err = RemoteError::BatchTooLarge {
            len: 501,
            limit: 500,
        };
        assert_eq!(err.to_string(), "批量写入超出限制: 501 > 500");
    }
}
