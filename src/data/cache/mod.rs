//! 缓存层实现
//!
//! - `entry`: 缓存条目（TTL + SHA-256 校验和）
//! - `clock`: 时间源（系统时钟 / 手动时钟）
//! - `durable`: 持久层（JSON 目录 / SQLite）
//! - `store`: 统一入口 `CacheStore`

pub mod clock;
pub mod durable;
pub mod entry;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use durable::{DurableLayer, JsonDirLayer, SqliteLayer};
pub use entry::{compute_hash, CacheEntry};
pub use store::{CacheLookup, CacheStats, CacheStore};
