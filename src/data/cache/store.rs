//! TTL + 校验和双重校验的缓存存储
//!
//! `CacheStore` 是同步层中唯一的进程级共享可变状态：
//! - 内存层：`HashMap<String, CacheEntry>`
//! - 持久层：可选的 `DurableLayer`（JSON 目录 / SQLite）
//!
//! 所有操作在同一把锁内串行执行，同一键上不会出现交错的读-改-写。
//! 每个键维护一个代数（generation），`invalidate` 时递增；`clear` 与 `invalidate_prefix`
//! 另外递增全局纪元（epoch），覆盖尚未写入过条目的键。
//! `set_if_generation` 只在代数未变时写入，用来丢弃失效后才返回的旧拉取结果。
//!
//! # 条目状态
//!
//! `Empty → Fresh`（set）`→ Stale`（TTL 到期，`get` 不再返回）`→ Empty`（下一次未命中读取、
//! 清扫或失效）。校验和不匹配时直接 `Fresh → Empty`，不经过 Stale。

use super::clock::{Clock, SystemClock};
use super::durable::{DurableLayer, JsonDirLayer, SqliteLayer};
use super::entry::CacheEntry;
use crate::data::{DataError, Result};
use crate::models::config::{CacheBackend, CacheSettings};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// `lookup` 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// 有效（TTL 与校验和均通过）
    Fresh(Value),
    /// 已过期但内容完整，条目仍保留
    Stale(Value),
    Miss,
}

/// 缓存统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// 读到过期条目的次数
    pub stale_reads: u64,
    /// 校验和不匹配或内容无法解析的次数
    pub corruptions: u64,
    pub sweeps: u64,
    /// 内存层条目数
    pub entry_count: u64,
    /// 当前占用字节数（有持久层时以持久层为准）
    pub usage_bytes: u64,
}

impl CacheStats {
    /// 命中率（0.0 ~ 1.0）
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    generations: HashMap<String, u64>,
    epoch: u64,
    memory_bytes: u64,
    stats: CacheStats,
}

impl CacheState {
    fn insert(&mut self, entry: CacheEntry) {
        let size = entry.size_bytes();
        if let Some(old) = self.entries.insert(entry.key.clone(), entry) {
            self.memory_bytes = self.memory_bytes.saturating_sub(old.size_bytes());
        }
        self.memory_bytes += size;
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let removed = self.entries.remove(key);
        if let Some(old) = &removed {
            self.memory_bytes = self.memory_bytes.saturating_sub(old.size_bytes());
        }
        removed
    }

    fn bump_generation(&mut self, key: &str) {
        *self.generations.entry(key.to_string()).or_insert(0) += 1;
    }

    /// 键代数与全局纪元之和，二者只增不减，任一递增都会改变结果
    fn generation(&self, key: &str) -> u64 {
        self.epoch + self.generations.get(key).copied().unwrap_or(0)
    }
}

/// 缓存存储
pub struct CacheStore {
    state: Mutex<CacheState>,
    durable: Option<Box<dyn DurableLayer>>,
    clock: Arc<dyn Clock>,
    settings: CacheSettings,
}

impl CacheStore {
    /// 创建仅内存的缓存
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            durable: None,
            clock: Arc::new(SystemClock),
            settings,
        }
    }

    /// 按配置创建缓存并挂载对应的持久层
    pub fn open(settings: CacheSettings) -> Result<Self> {
        let durable: Option<Box<dyn DurableLayer>> = match settings.backend {
            CacheBackend::Memory => None,
            CacheBackend::JsonDir => {
                Some(Box::new(JsonDirLayer::open(settings.effective_path())?))
            }
            CacheBackend::Sqlite => Some(Box::new(SqliteLayer::open(&settings.effective_path())?)),
        };
        let store = Self::new(settings);
        Ok(match durable {
            Some(layer) => store.with_durable(layer),
            None => store,
        })
    }

    /// 挂载持久层
    pub fn with_durable(mut self, layer: Box<dyn DurableLayer>) -> Self {
        tracing::debug!(layer = %layer.describe(), "缓存挂载持久层");
        self.durable = Some(layer);
        self
    }

    /// 替换时间源
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// 默认 TTL
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.settings.default_ttl_ms)
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // 锁中毒时继续使用内部状态：缓存内容都经过校验，不会因此返回脏数据
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 获取有效条目
    ///
    /// TTL 与校验和都通过才返回；过期条目会被移除，损坏条目会被清除并记录日志。
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut state = self.lock();
        match self.lookup_locked(&mut state, key) {
            CacheLookup::Fresh(payload) => Some(payload),
            CacheLookup::Stale(_) => {
                self.purge_locked(&mut state, key);
                None
            }
            CacheLookup::Miss => None,
        }
    }

    /// 获取有效条目并反序列化
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let payload = self.get(key)?;
        self.decode(key, payload)
    }

    /// 查询条目状态，过期条目保留在原处
    pub fn lookup(&self, key: &str) -> CacheLookup {
        let mut state = self.lock();
        self.lookup_locked(&mut state, key)
    }

    /// 读取完整但可能已过期的内容（仅用于远程失败后的回退）
    pub fn get_stale(&self, key: &str) -> Option<Value> {
        match self.lookup(key) {
            CacheLookup::Fresh(payload) | CacheLookup::Stale(payload) => Some(payload),
            CacheLookup::Miss => None,
        }
    }

    fn lookup_locked(&self, state: &mut CacheState, key: &str) -> CacheLookup {
        let entry = match state.entries.get(key) {
            Some(entry) => Some(entry.clone()),
            None => self.load_durable_locked(state, key),
        };

        let Some(entry) = entry else {
            state.stats.misses += 1;
            return CacheLookup::Miss;
        };

        if !entry.is_intact() {
            tracing::warn!(
                key = %key,
                stored_at = entry.stored_at,
                "缓存校验和不匹配，条目已清除"
            );
            state.stats.corruptions += 1;
            state.stats.misses += 1;
            self.purge_locked(state, key);
            return CacheLookup::Miss;
        }

        if entry.is_expired(self.clock.now_ms()) {
            state.stats.stale_reads += 1;
            state.stats.misses += 1;
            return CacheLookup::Stale(entry.payload);
        }

        state.stats.hits += 1;
        CacheLookup::Fresh(entry.payload)
    }

    /// 从持久层加载到内存层；内容无法解析视为损坏并清除
    fn load_durable_locked(&self, state: &mut CacheState, key: &str) -> Option<CacheEntry> {
        let durable = self.durable.as_ref()?;
        match durable.load(key) {
            Ok(Some(entry)) => {
                state.insert(entry.clone());
                Some(entry)
            }
            Ok(None) => None,
            Err(DataError::JsonSerialization(e)) => {
                tracing::warn!(key = %key, error = %e, "持久化缓存内容无法解析，条目已清除");
                state.stats.corruptions += 1;
                if let Err(e) = durable.remove(key) {
                    tracing::warn!(key = %key, error = %e, "清除损坏的持久化条目失败");
                }
                None
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "读取持久化缓存失败，按未命中处理");
                None
            }
        }
    }

    fn purge_locked(&self, state: &mut CacheState, key: &str) {
        state.remove(key);
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.remove(key) {
                tracing::warn!(key = %key, error = %e, "删除持久化缓存条目失败");
            }
        }
    }

    /// 写入条目（`storedAt = now`）
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, payload: &T, ttl: Duration) -> Result<()> {
        let value = serde_json::to_value(payload)?;
        let mut state = self.lock();
        self.store_locked(&mut state, key, value, ttl)
    }

    /// 仅在键自 `generation` 之后未被失效时写入
    ///
    /// 返回 `Ok(false)` 表示写入被丢弃。
    pub fn set_if_generation<T: Serialize + ?Sized>(
        &self,
        key: &str,
        payload: &T,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool> {
        let value = serde_json::to_value(payload)?;
        let mut state = self.lock();
        let current = state.generation(key);
        if current != generation {
            tracing::debug!(
                key = %key,
                expected = generation,
                current,
                "键已失效，丢弃过时写入"
            );
            return Ok(false);
        }
        self.store_locked(&mut state, key, value, ttl)?;
        Ok(true)
    }

    fn store_locked(
        &self,
        state: &mut CacheState,
        key: &str,
        value: Value,
        ttl: Duration,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(DataError::InvalidKey(key.to_string()));
        }
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let entry = CacheEntry::new(key, value, self.clock.now_ms(), ttl_ms);

        if let Some(durable) = &self.durable {
            if let Err(e) = durable.store(&entry) {
                tracing::warn!(key = %key, error = %e, "写入持久化缓存失败，仅保留内存条目");
            }
        }
        state.insert(entry);

        let usage = self.usage_locked(state);
        if usage > self.settings.sweep_trigger_bytes() {
            tracing::info!(
                usage_bytes = usage,
                soft_cap_bytes = self.settings.soft_cap_bytes,
                "缓存占用超过阈值，开始清扫"
            );
            let removed = self.sweep_locked(state);
            let after = self.usage_locked(state);
            if after > self.settings.soft_cap_bytes {
                tracing::warn!(
                    usage_bytes = after,
                    removed,
                    "清扫后缓存占用仍超过软上限"
                );
            }
        }
        Ok(())
    }

    /// 当前键的代数
    pub fn generation(&self, key: &str) -> u64 {
        self.lock().generation(key)
    }

    /// 无条件删除条目
    pub fn invalidate(&self, key: &str) {
        let mut state = self.lock();
        state.bump_generation(key);
        self.purge_locked(&mut state, key);
        tracing::debug!(key = %key, "缓存条目已失效");
    }

    /// 删除所有以 `prefix` 开头的条目，返回删除数量
    ///
    /// 同时递增全局纪元：尚无条目的键上进行中的拉取也不会再写入。
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut state = self.lock();
        state.epoch += 1;
        let mut keys: Vec<String> = state
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        if let Some(durable) = &self.durable {
            match durable.keys() {
                Ok(durable_keys) => keys.extend(
                    durable_keys
                        .into_iter()
                        .filter(|key| key.starts_with(prefix)),
                ),
                Err(e) => tracing::warn!(prefix = %prefix, error = %e, "列出持久化缓存键失败"),
            }
        }
        keys.sort();
        keys.dedup();

        for key in &keys {
            state.bump_generation(key);
            self.purge_locked(&mut state, key);
        }
        tracing::debug!(prefix = %prefix, removed = keys.len(), "按前缀失效缓存");
        keys.len()
    }

    /// 清除所有过期条目，返回清除数量
    pub fn sweep(&self) -> usize {
        let mut state = self.lock();
        self.sweep_locked(&mut state)
    }

    fn sweep_locked(&self, state: &mut CacheState) -> usize {
        let now = self.clock.now_ms();
        let mut expired: Vec<String> = state
            .entries
            .values()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key.clone())
            .collect();

        if let Some(durable) = &self.durable {
            match durable.keys() {
                Ok(keys) => {
                    for key in keys {
                        if state.entries.contains_key(&key) {
                            continue;
                        }
                        match durable.load(&key) {
                            Ok(Some(entry)) if entry.is_expired(now) => expired.push(key),
                            Ok(_) => {}
                            // 无法解析的条目同样清除
                            Err(DataError::JsonSerialization(_)) => expired.push(key),
                            Err(e) => {
                                tracing::warn!(key = %key, error = %e, "清扫时读取持久化条目失败")
                            }
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "清扫时列出持久化缓存键失败"),
            }
        }

        for key in &expired {
            self.purge_locked(state, key);
        }
        state.stats.sweeps += 1;
        tracing::debug!(removed = expired.len(), "缓存清扫完成");
        expired.len()
    }

    /// 清空所有条目
    pub fn clear(&self) {
        let mut state = self.lock();
        state.epoch += 1;
        state.entries.clear();
        state.memory_bytes = 0;
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.clear() {
                tracing::warn!(error = %e, "清空持久化缓存失败");
            }
        }
    }

    /// 当前占用字节数
    pub fn usage_bytes(&self) -> u64 {
        let state = self.lock();
        self.usage_locked(&state)
    }

    fn usage_locked(&self, state: &CacheState) -> u64 {
        match &self.durable {
            Some(durable) => durable.usage_bytes().unwrap_or(state.memory_bytes),
            None => state.memory_bytes,
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            entry_count: state.entries.len() as u64,
            usage_bytes: self.usage_locked(&state),
            ..state.stats.clone()
        }
    }

    /// 反序列化缓存内容；结构不匹配时删除条目
    pub(crate) fn decode<T: DeserializeOwned>(&self, key: &str, payload: Value) -> Option<T> {
        match serde_json::from_value(payload) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "缓存内容结构不匹配，条目已清除");
                self.invalidate(key);
                None
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn tamper(&self, key: &str, payload: Value) {
        let mut state = self.lock();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.payload = payload;
        }
    }
}
