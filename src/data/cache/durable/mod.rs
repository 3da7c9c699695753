//! 缓存持久层
//!
//! 内存层之下的键值存储，进程重启后缓存仍可复用：
//! - `json_dir`: 每个键一个 JSON 文件
//! - `sqlite`: SQLite 单表
//!
//! 持久层只负责读写，TTL 与校验和判断统一由 `CacheStore` 完成。

pub mod json_dir;
pub mod sqlite;

pub use json_dir::JsonDirLayer;
pub use sqlite::SqliteLayer;

use super::entry::CacheEntry;
use crate::data::Result;

/// 持久层接口
///
/// 实现需线程安全；`load` 遇到无法解析的内容时应返回 `DataError::JsonSerialization`，
/// 由调用方按损坏处理。
pub trait DurableLayer: Send + Sync {
    /// 读取条目（返回的条目 `key` 字段已填充）
    fn load(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// 写入或覆盖条目
    fn store(&self, entry: &CacheEntry) -> Result<()>;

    /// 删除条目，不存在时不报错
    fn remove(&self, key: &str) -> Result<()>;

    /// 列出所有键
    fn keys(&self) -> Result<Vec<String>>;

    /// 当前占用字节数
    fn usage_bytes(&self) -> Result<u64>;

    /// 清空所有条目
    fn clear(&self) -> Result<()>;

    /// 用于日志的描述
    fn describe(&self) -> String;
}
