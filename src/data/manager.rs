//! 数据集管理入口
//!
//! `DataManager` 负责一个数据集（多个集合的查询结果合并 + 分组索引）的完整读写路径：
//! - 读取：有效缓存直接返回，否则并行查询各来源、合并、写回缓存
//! - 去重：同一时刻对同一数据集的多个拉取共享一次远程往返
//! - 回退：远程失败时使用过期但完整的缓存，否则返回 `DataUnavailable`
//! - 写入：委托 `BatchWriter` 分批提交，成功写入涉及本数据集的集合时使缓存失效
//!
//! # 使用示例
//!
//! ```rust
//! let remote: Arc<dyn RemoteStore> = Arc::new(MemoryRemoteStore::new());
//! let spec = DatasetSpec::new("library")
//!     .source("drafts", QuerySpec::new())
//!     .source("published", QuerySpec::new())
//!     .with_index(IndexSpec::new("path", 1));
//!
//! let manager = DataManager::from_config(&SyncConfig::default(), remote, spec)?;
//! let dataset = manager.fetch_dataset(false).await?;
//! ```

use crate::data::batch::{BatchResult, BatchWriter};
use crate::data::cache::{CacheLookup, CacheStore};
use crate::data::error::RemoteError;
use crate::data::remote::RemoteStore;
use crate::data::{DataError, Result};
use crate::models::config::SyncConfig;
use crate::models::dataset::{Dataset, DatasetOrigin, DatasetSpec};
use crate::models::mutation::MutationRequest;
use futures_util::future::{try_join_all, BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const OPERATION_FETCH: &str = "fetch_dataset";

/// 共享拉取任务的失败原因（需可克隆，以便所有等待者拿到同一结果）
#[derive(Debug, Clone)]
enum FetchError {
    Remote {
        collection: String,
        error: RemoteError,
    },
    Cancelled,
}

type SharedFetch = Shared<BoxFuture<'static, std::result::Result<Dataset, FetchError>>>;

/// 进行中的拉取
struct InFlight {
    id: u64,
    /// 启动时缓存键的代数；键被失效后不再复用
    generation: u64,
    token: CancellationToken,
    future: SharedFetch,
}

/// 数据集管理器
pub struct DataManager {
    cache: Arc<CacheStore>,
    remote: Arc<dyn RemoteStore>,
    writer: BatchWriter,
    spec: Arc<DatasetSpec>,
    cache_key: String,
    ttl: Duration,
    in_flight: Mutex<Option<InFlight>>,
    next_fetch_id: AtomicU64,
}

impl DataManager {
    /// 使用调用方提供的缓存创建管理器
    ///
    /// 多个管理器可以共享同一个 `CacheStore`。
    pub fn new(
        cache: Arc<CacheStore>,
        remote: Arc<dyn RemoteStore>,
        spec: DatasetSpec,
        config: &SyncConfig,
    ) -> Self {
        let ttl = spec.ttl.unwrap_or_else(|| cache.default_ttl());
        let cache_key = spec.cache_key();
        let writer = BatchWriter::new(remote.clone(), &config.batch);
        Self {
            cache,
            remote,
            writer,
            spec: Arc::new(spec),
            cache_key,
            ttl,
            in_flight: Mutex::new(None),
            next_fetch_id: AtomicU64::new(1),
        }
    }

    /// 按配置创建缓存（内存 / JSON 目录 / SQLite）并创建管理器
    pub fn from_config(
        config: &SyncConfig,
        remote: Arc<dyn RemoteStore>,
        spec: DatasetSpec,
    ) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(CacheStore::open(config.cache.clone())?);
        tracing::info!(
            dataset = %spec.name,
            backend = ?config.cache.backend,
            "创建数据集管理器"
        );
        Ok(Self::new(cache, remote, spec, config))
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn spec(&self) -> &DatasetSpec {
        &self.spec
    }

    /// 数据集的组合缓存键
    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 获取数据集
    ///
    /// `force_refresh = false` 且缓存有效时不发起任何远程请求。
    /// 远程失败时优先回退到过期缓存（`origin = StaleFallback`）。
    pub async fn fetch_dataset(&self, force_refresh: bool) -> Result<Dataset> {
        let key = self.cache_key.as_str();

        if !force_refresh {
            if let CacheLookup::Fresh(payload) = self.cache.lookup(key) {
                if let Some(dataset) = self.cache.decode::<Dataset>(key, payload) {
                    tracing::debug!(key = %key, records = dataset.len(), "数据集命中缓存");
                    return Ok(dataset.with_origin(DatasetOrigin::Cache));
                }
            }
        }

        let (fetch_id, future) = self.join_or_start();
        let outcome = future.await;
        self.finish(fetch_id);

        match outcome {
            Ok(dataset) => Ok(dataset),
            Err(FetchError::Cancelled) => Err(DataError::Cancelled {
                operation: OPERATION_FETCH,
                key: key.to_string(),
            }),
            Err(FetchError::Remote { collection, error }) => {
                if let Some(payload) = self.cache.get_stale(key) {
                    if let Some(dataset) = self.cache.decode::<Dataset>(key, payload) {
                        tracing::warn!(
                            key = %key,
                            collection = %collection,
                            error = %error,
                            "远程读取失败，使用过期缓存"
                        );
                        return Ok(dataset.with_origin(DatasetOrigin::StaleFallback));
                    }
                }
                tracing::warn!(
                    key = %key,
                    collection = %collection,
                    error = %error,
                    "远程读取失败且没有可用缓存"
                );
                Err(DataError::DataUnavailable {
                    operation: OPERATION_FETCH,
                    key: key.to_string(),
                    collection,
                    cause: error,
                })
            }
        }
    }

    /// 复用代数一致且未取消的拉取，否则启动新的拉取
    fn join_or_start(&self) -> (u64, SharedFetch) {
        let mut slot = self.lock_in_flight();
        let generation = self.cache.generation(&self.cache_key);

        if let Some(existing) = slot.as_ref() {
            if existing.generation == generation && !existing.token.is_cancelled() {
                tracing::debug!(key = %self.cache_key, fetch_id = existing.id, "复用进行中的拉取");
                return (existing.id, existing.future.clone());
            }
        }

        let id = self.next_fetch_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let future = run_fetch(
            self.cache.clone(),
            self.remote.clone(),
            self.spec.clone(),
            self.cache_key.clone(),
            self.ttl,
            generation,
            token.clone(),
        )
        .boxed()
        .shared();

        tracing::debug!(key = %self.cache_key, fetch_id = id, generation, "启动远程拉取");
        *slot = Some(InFlight {
            id,
            generation,
            token,
            future: future.clone(),
        });
        (id, future)
    }

    /// 拉取结束后移除登记（仅当仍是同一次拉取）
    fn finish(&self, fetch_id: u64) {
        let mut slot = self.lock_in_flight();
        if slot.as_ref().map(|f| f.id) == Some(fetch_id) {
            *slot = None;
        }
    }

    /// 批量保存
    ///
    /// 只要有一条成功写入涉及本数据集读取的集合，就使数据集缓存失效。
    pub async fn batch_save(&self, mutations: Vec<MutationRequest>) -> BatchResult {
        let result = self.writer.commit(mutations).await;

        let touches_dataset = result
            .touched_collections
            .iter()
            .any(|collection| self.spec.reads_collection(collection));
        if touches_dataset {
            tracing::debug!(key = %self.cache_key, "写入涉及数据集，缓存已失效");
            self.invalidate();
        }
        result
    }

    /// 使数据集缓存失效，进行中的拉取不会再写回缓存
    pub fn invalidate(&self) {
        self.cache.invalidate(&self.cache_key);
        self.lock_in_flight().take();
    }

    /// 失效后强制拉取
    ///
    /// 因为先失效，远程失败时不会回退到过期缓存。
    pub async fn refresh(&self) -> Result<Dataset> {
        self.invalidate();
        self.fetch_dataset(true).await
    }

    /// 取消进行中的拉取，返回是否有拉取被取消
    ///
    /// 等待中的调用方收到 `DataError::Cancelled`，被取消的拉取不会写入缓存。
    pub fn cancel_pending(&self) -> bool {
        match self.lock_in_flight().take() {
            Some(in_flight) => {
                in_flight.token.cancel();
                tracing::info!(key = %self.cache_key, fetch_id = in_flight.id, "已取消进行中的拉取");
                true
            }
            None => false,
        }
    }
}

/// 并行查询所有来源，合并后按代数写回缓存
async fn run_fetch(
    cache: Arc<CacheStore>,
    remote: Arc<dyn RemoteStore>,
    spec: Arc<DatasetSpec>,
    key: String,
    ttl: Duration,
    generation: u64,
    token: CancellationToken,
) -> std::result::Result<Dataset, FetchError> {
    let queries = spec.sources.iter().map(|source| {
        let remote = remote.clone();
        async move {
            remote
                .query(&source.collection, &source.query)
                .await
                .map_err(|error| FetchError::Remote {
                    collection: source.collection.clone(),
                    error,
                })
        }
    });

    let parts = tokio::select! {
        _ = token.cancelled() => return Err(FetchError::Cancelled),
        parts = try_join_all(queries) => parts?,
    };
    if token.is_cancelled() {
        return Err(FetchError::Cancelled);
    }

    let dataset = Dataset::assemble(parts, spec.index.as_ref());
    match cache.set_if_generation(&key, &dataset, ttl, generation) {
        Ok(true) => {}
        Ok(false) => tracing::debug!(key = %key, "数据集已失效，拉取结果未写入缓存"),
        Err(e) => tracing::warn!(key = %key, error = %e, "写入数据集缓存失败"),
    }

    tracing::info!(
        key = %key,
        records = dataset.len(),
        groups = dataset.derived_index.len(),
        "数据集拉取完成"
    );
    Ok(dataset)
}
