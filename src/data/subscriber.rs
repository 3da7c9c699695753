//! 实时变更订阅
//!
//! 每个作用域键（scope key）最多对应一个活动订阅：
//! - 同一作用域再次订阅时，先取消旧订阅并等待其任务退出，再建立新的远程订阅
//! - 每个变更批次经谓词过滤，非空时同步调用回调，然后使作用域关联的缓存键失效
//! - 远程流出错时记录 `error` 日志、标记为非活动并调用错误回调，不自动重试
//!
//! 同一作用域内的批次按提交顺序投递；不同作用域之间不保证顺序。

use crate::data::cache::CacheStore;
use crate::data::remote::{ChangeStream, RemoteStore};
use crate::data::{DataError, Result};
use crate::models::dataset::DatasetSpec;
use crate::models::document::{DocumentChange, QuerySpec};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 变更过滤谓词
pub type ChangePredicate = Box<dyn Fn(&DocumentChange) -> bool + Send + Sync>;
/// 变更回调
pub type ChangeCallback = Box<dyn Fn(&[DocumentChange]) + Send + Sync>;
/// 错误回调
pub type ErrorCallback = Box<dyn Fn(&DataError) + Send + Sync>;

/// 订阅作用域
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionScope {
    /// 作用域键，同一键最多一个活动订阅
    pub key: String,
    pub collection: String,
    pub query: QuerySpec,
    /// 收到变更后需要失效的缓存键
    pub invalidates: Vec<String>,
}

impl SubscriptionScope {
    pub fn new(key: impl Into<String>, collection: impl Into<String>, query: QuerySpec) -> Self {
        Self {
            key: key.into(),
            collection: collection.into(),
            query,
            invalidates: Vec::new(),
        }
    }

    /// 收到变更时使该缓存键失效
    pub fn invalidating(mut self, cache_key: impl Into<String>) -> Self {
        self.invalidates.push(cache_key.into());
        self
    }

    /// 收到变更时使数据集缓存失效
    pub fn invalidating_dataset(self, spec: &DatasetSpec) -> Self {
        self.invalidating(spec.cache_key())
    }
}

struct Subscription {
    id: u64,
    token: CancellationToken,
    task: JoinHandle<()>,
    active: Arc<AtomicBool>,
}

type Registry = Arc<Mutex<HashMap<String, Subscription>>>;

/// 取消订阅并等待任务退出
async fn stop(scope_key: &str, subscription: Subscription) {
    subscription.token.cancel();
    subscription.active.store(false, Ordering::SeqCst);
    if let Err(e) = subscription.task.await {
        if !e.is_cancelled() {
            tracing::warn!(scope = %scope_key, error = %e, "订阅任务异常退出");
        }
    }
    tracing::debug!(scope = %scope_key, subscription_id = subscription.id, "订阅已取消");
}

/// 订阅句柄
///
/// `cancel` 幂等；作用域已被新的订阅替换时，旧句柄的 `cancel` 不做任何事。
pub struct SubscriptionHandle {
    scope_key: String,
    id: u64,
    active: Arc<AtomicBool>,
    registry: Registry,
}

impl SubscriptionHandle {
    pub fn scope_key(&self) -> &str {
        &self.scope_key
    }

    /// 该订阅是否仍在接收变更
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// 取消订阅并等待任务退出
    pub async fn cancel(&self) {
        let mut registry = self.registry.lock().await;
        let owned = registry
            .get(&self.scope_key)
            .is_some_and(|subscription| subscription.id == self.id);
        if !owned {
            return;
        }
        if let Some(subscription) = registry.remove(&self.scope_key) {
            stop(&self.scope_key, subscription).await;
        }
    }
}

/// 变更订阅管理器
pub struct ChangeSubscriber {
    remote: Arc<dyn RemoteStore>,
    cache: Arc<CacheStore>,
    registry: Registry,
    next_id: AtomicU64,
}

impl ChangeSubscriber {
    pub fn new(remote: Arc<dyn RemoteStore>, cache: Arc<CacheStore>) -> Self {
        Self {
            remote,
            cache,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// 订阅作用域的变更
    pub async fn subscribe<P, C>(
        &self,
        scope: SubscriptionScope,
        predicate: P,
        callback: C,
    ) -> Result<SubscriptionHandle>
    where
        P: Fn(&DocumentChange) -> bool + Send + Sync + 'static,
        C: Fn(&[DocumentChange]) + Send + Sync + 'static,
    {
        self.attach(scope, Box::new(predicate), Box::new(callback), None)
            .await
    }

    /// 订阅作用域的变更，远程流出错时调用 `on_error`
    pub async fn subscribe_with_errors<P, C, E>(
        &self,
        scope: SubscriptionScope,
        predicate: P,
        callback: C,
        on_error: E,
    ) -> Result<SubscriptionHandle>
    where
        P: Fn(&DocumentChange) -> bool + Send + Sync + 'static,
        C: Fn(&[DocumentChange]) + Send + Sync + 'static,
        E: Fn(&DataError) + Send + Sync + 'static,
    {
        self.attach(
            scope,
            Box::new(predicate),
            Box::new(callback),
            Some(Box::new(on_error)),
        )
        .await
    }

    async fn attach(
        &self,
        scope: SubscriptionScope,
        predicate: ChangePredicate,
        callback: ChangeCallback,
        on_error: Option<ErrorCallback>,
    ) -> Result<SubscriptionHandle> {
        // 持锁完成替换，同一作用域的并发订阅按顺序生效
        let mut registry = self.registry.lock().await;

        if let Some(previous) = registry.remove(&scope.key) {
            tracing::debug!(scope = %scope.key, subscription_id = previous.id, "替换已有订阅");
            stop(&scope.key, previous).await;
        }

        let stream = self
            .remote
            .subscribe(&scope.collection, &scope.query)
            .await
            .map_err(|cause| {
                tracing::error!(scope = %scope.key, error = %cause, "建立订阅失败");
                DataError::Subscription {
                    scope: scope.key.clone(),
                    cause,
                }
            })?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let active = Arc::new(AtomicBool::new(true));
        let scope_key = scope.key.clone();

        let task = tokio::spawn(run_subscription(
            scope,
            stream,
            SubscriptionCallbacks {
                predicate,
                callback,
                on_error,
            },
            self.cache.clone(),
            token.clone(),
            active.clone(),
        ));

        tracing::info!(scope = %scope_key, subscription_id = id, "订阅已建立");
        registry.insert(
            scope_key.clone(),
            Subscription {
                id,
                token,
                task,
                active: active.clone(),
            },
        );

        Ok(SubscriptionHandle {
            scope_key,
            id,
            active,
            registry: self.registry.clone(),
        })
    }

    /// 取消所有订阅，返回取消数量
    pub async fn unsubscribe_all(&self) -> usize {
        let mut registry = self.registry.lock().await;
        let drained: Vec<(String, Subscription)> = registry.drain().collect();
        let count = drained.len();
        for (scope_key, subscription) in drained {
            stop(&scope_key, subscription).await;
        }
        if count > 0 {
            tracing::info!(count, "已取消所有订阅");
        }
        count
    }

    /// 作用域是否有活动订阅
    pub async fn is_active(&self, scope_key: &str) -> bool {
        self.registry
            .lock()
            .await
            .get(scope_key)
            .is_some_and(|subscription| subscription.active.load(Ordering::SeqCst))
    }

    /// 活动订阅数量
    pub async fn active_count(&self) -> usize {
        self.registry
            .lock()
            .await
            .values()
            .filter(|subscription| subscription.active.load(Ordering::SeqCst))
            .count()
    }
}

impl Drop for ChangeSubscriber {
    fn drop(&mut self) {
        // 无法在 Drop 中等待任务，只发出取消信号
        if let Ok(registry) = self.registry.try_lock() {
            for subscription in registry.values() {
                subscription.token.cancel();
            }
        }
    }
}

struct SubscriptionCallbacks {
    predicate: ChangePredicate,
    callback: ChangeCallback,
    on_error: Option<ErrorCallback>,
}

async fn run_subscription(
    scope: SubscriptionScope,
    mut stream: ChangeStream,
    callbacks: SubscriptionCallbacks,
    cache: Arc<CacheStore>,
    token: CancellationToken,
    active: Arc<AtomicBool>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(changes)) => {
                let matched: Vec<DocumentChange> = changes
                    .into_iter()
                    .filter(|change| (callbacks.predicate)(change))
                    .collect();
                if matched.is_empty() {
                    continue;
                }
                tracing::debug!(scope = %scope.key, changes = matched.len(), "收到变更");
                (callbacks.callback)(&matched);
                for key in &scope.invalidates {
                    cache.invalidate(key);
                }
            }
            Some(Err(cause)) => {
                tracing::error!(scope = %scope.key, error = %cause, "订阅流出错，订阅已停止");
                active.store(false, Ordering::SeqCst);
                if let Some(on_error) = &callbacks.on_error {
                    on_error(&DataError::Subscription {
                        scope: scope.key.clone(),
                        cause,
                    });
                }
                break;
            }
            None => {
                tracing::info!(scope = %scope.key, "订阅流已结束");
                active.store(false, Ordering::SeqCst);
                break;
            }
        }
    }
}
