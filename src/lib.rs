// lib.rs - 文档存储客户端缓存与同步层

pub mod core;
pub mod data;
pub mod models;
pub mod utils;

pub use models::*;

// 重新导出常用类型
pub use crate::core::{init_logger, update_log_level};
pub use data::{
    BatchResult, BatchWriter, CacheLookup, CacheStats, CacheStore, ChangeStream, ChangeSubscriber,
    DataError, DataManager, FailedMutation, MemoryRemoteStore, RemoteError, RemoteStore, Result,
    SubscriptionHandle, SubscriptionScope,
};
pub use utils::{Debouncer, Throttler};
