//! 缓存与同步层
//!
//! 客户端与远程文档存储之间的读写路径。
//!
//! # 模块组织
//!
//! - `error`: 统一错误类型定义
//! - `cache`: TTL + 校验和缓存（内存层 + 可选持久层）
//! - `remote`: 远程文档存储契约与内存实现
//! - `batch`: 分批写入
//! - `subscriber`: 实时变更订阅
//! - `manager`: 数据集统一入口 `DataManager`

pub mod batch;
pub mod cache;
pub mod error;
pub mod manager;
pub mod remote;
pub mod subscriber;


pub use batch::{split_into_chunks, BatchResult, BatchWriter, Chunk, FailedMutation};
pub use cache::{CacheLookup, CacheStats, CacheStore};
pub use error::{DataError, RemoteError, Result};
pub use manager::DataManager;
pub use remote::{ChangeStream, MemoryRemoteStore, RemoteStore};
pub use subscriber::{ChangeSubscriber, SubscriptionHandle, SubscriptionScope};
