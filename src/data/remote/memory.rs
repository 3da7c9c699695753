//! 内存版远程文档存储
//!
//! 用于测试和本地运行：
//! - 集合按文档 ID 有序存放
//! - 批量写入先整体校验再应用，任何一条失败则整批不生效
//! - 每次提交后按订阅者的查询条件推送 added / modified / removed 变更（不推送初始快照）
//! - 支持故障注入、调用计数和人为的查询延迟

use super::{ChangeSender, ChangeStream, RemoteStore};
use crate::data::error::RemoteError;
use crate::models::document::{ChangeKind, Document, DocumentChange, QuerySpec};
use crate::models::mutation::{MutationOp, MutationRequest};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const DEFAULT_BATCH_LIMIT: usize = 500;

type Collection = BTreeMap<String, Value>;

struct Subscriber {
    collection: String,
    query: QuerySpec,
    tx: ChangeSender,
}

#[derive(Default)]
struct RemoteState {
    collections: HashMap<String, Collection>,
    subscribers: Vec<Subscriber>,
    failing_queries: HashMap<String, RemoteError>,
    failing_documents: HashSet<String>,
}

/// 一次提交中单个文档的前后状态
struct AppliedWrite {
    collection: String,
    document_id: String,
    before: Option<Value>,
    after: Option<Value>,
}

/// 内存远程存储
pub struct MemoryRemoteStore {
    state: Mutex<RemoteState>,
    batch_limit: usize,
    query_delay: Option<Duration>,
    query_calls: AtomicUsize,
    commit_calls: AtomicUsize,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RemoteState::default()),
            batch_limit: DEFAULT_BATCH_LIMIT,
            query_delay: None,
            query_calls: AtomicUsize::new(0),
            commit_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit.max(1);
        self
    }

    /// 每次查询前等待的时间
    pub fn with_query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = Some(delay);
        self
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 直接写入文档（不计入提交次数，不推送变更）
    pub fn insert(&self, collection: &str, document_id: &str, data: Value) {
        self.lock()
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(document_id.to_string(), data);
    }

    /// 读取单个文档
    pub fn document(&self, collection: &str, document_id: &str) -> Option<Document> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(document_id))
            .map(|data| Document::new(collection, document_id, data.clone()))
    }

    /// 集合中的文档数
    pub fn len(&self, collection: &str) -> usize {
        self.lock()
            .collections
            .get(collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    /// 让该集合的查询和订阅返回指定错误
    pub fn fail_queries_for(&self, collection: &str, error: RemoteError) {
        self.lock()
            .failing_queries
            .insert(collection.to_string(), error);
    }

    /// 让包含该文档 ID 的批次整体失败
    pub fn fail_commits_containing(&self, document_id: &str) {
        self.lock()
            .failing_documents
            .insert(document_id.to_string());
    }

    /// 清除所有注入的故障
    pub fn heal(&self) {
        let mut state = self.lock();
        state.failing_queries.clear();
        state.failing_documents.clear();
    }

    /// 向该集合的所有订阅者推送一个错误
    pub fn inject_subscription_error(&self, collection: &str, error: RemoteError) {
        let mut state = self.lock();
        state.subscribers.retain(|subscriber| {
            if subscriber.collection != collection {
                return !subscriber.tx.is_closed();
            }
            subscriber.tx.send(Err(error.clone())).is_ok()
        });
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn commit_calls(&self) -> usize {
        self.commit_calls.load(Ordering::SeqCst)
    }

    /// 仍在监听的订阅者数量
    pub fn active_subscribers(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|subscriber| !subscriber.tx.is_closed());
        state.subscribers.len()
    }

    /// 在工作副本上应用整批写入；任何一条失败都不修改原集合
    fn apply_batch(
        collections: &HashMap<String, Collection>,
        mutations: &[MutationRequest],
    ) -> Result<(HashMap<String, Collection>, Vec<AppliedWrite>), RemoteError> {
        let mut working = collections.clone();
        let mut writes = Vec::with_capacity(mutations.len());

        for mutation in mutations {
            let docs = working.entry(mutation.collection.clone()).or_default();
            let before = docs.get(&mutation.document_id).cloned();
            let after = match &mutation.op {
                MutationOp::Set(payload) => Some(payload.clone()),
                MutationOp::Update(patch) => {
                    let Some(existing) = before.clone() else {
                        return Err(RemoteError::NotFound {
                            collection: mutation.collection.clone(),
                            document_id: mutation.document_id.clone(),
                        });
                    };
                    Some(merge_fields(existing, patch))
                }
                MutationOp::Delete => None,
            };

            match &after {
                Some(data) => {
                    docs.insert(mutation.document_id.clone(), data.clone());
                }
                None => {
                    docs.remove(&mutation.document_id);
                }
            }
            writes.push(AppliedWrite {
                collection: mutation.collection.clone(),
                document_id: mutation.document_id.clone(),
                before,
                after,
            });
        }
        Ok((working, writes))
    }

    /// 按订阅者的查询条件推送变更，并清理已关闭的订阅者
    fn fan_out(state: &mut RemoteState, writes: &[AppliedWrite]) {
        state.subscribers.retain(|subscriber| {
            let changes: Vec<DocumentChange> = writes
                .iter()
                .filter(|write| write.collection == subscriber.collection)
                .filter_map(|write| change_for(subscriber, write))
                .collect();
            if changes.is_empty() {
                return !subscriber.tx.is_closed();
            }
            subscriber.tx.send(Ok(changes)).is_ok()
        });
    }
}

/// 顶层字段合并；任一方不是对象时整体替换
fn merge_fields(existing: Value, patch: &Value) -> Value {
    match (existing, patch) {
        (Value::Object(mut base), Value::Object(fields)) => {
            for (key, value) in fields {
                base.insert(key.clone(), value.clone());
            }
            Value::Object(base)
        }
        (_, patch) => patch.clone(),
    }
}

fn change_for(subscriber: &Subscriber, write: &AppliedWrite) -> Option<DocumentChange> {
    let to_doc =
        |data: &Value| Document::new(&write.collection, &write.document_id, data.clone());
    let before = write.before.as_ref().map(to_doc);
    let after = write.after.as_ref().map(to_doc);
    let matched_before = before.filter(|doc| subscriber.query.matches(doc));
    let matched_after = after.filter(|doc| subscriber.query.matches(doc));

    match (matched_before, matched_after) {
        (None, Some(doc)) => Some(DocumentChange::new(ChangeKind::Added, doc)),
        (Some(_), Some(doc)) => Some(DocumentChange::new(ChangeKind::Modified, doc)),
        (Some(doc), None) => Some(DocumentChange::new(ChangeKind::Removed, doc)),
        (None, None) => None,
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn query(
        &self,
        collection: &str,
        query: &QuerySpec,
    ) -> Result<Vec<Document>, RemoteError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.query_delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.lock();
        if let Some(error) = state.failing_queries.get(collection) {
            return Err(error.clone());
        }
        let mut documents: Vec<Document> = state
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, data)| Document::new(collection, id, data.clone()))
                    .filter(|doc| query.matches(doc))
                    .collect()
            })
            .unwrap_or_default();
        drop(state);

        query.arrange(&mut documents);
        Ok(documents)
    }

    async fn commit_batch(&self, mutations: &[MutationRequest]) -> Result<(), RemoteError> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        if mutations.len() > self.batch_limit {
            return Err(RemoteError::BatchTooLarge {
                len: mutations.len(),
                limit: self.batch_limit,
            });
        }

        let mut state = self.lock();
        if let Some(mutation) = mutations
            .iter()
            .find(|m| state.failing_documents.contains(&m.document_id))
        {
            return Err(RemoteError::Unavailable(format!(
                "提交被拒绝: {}/{}",
                mutation.collection, mutation.document_id
            )));
        }

        let (collections, writes) = Self::apply_batch(&state.collections, mutations)?;
        state.collections = collections;
        Self::fan_out(&mut state, &writes);
        Ok(())
    }

    async fn subscribe(
        &self,
        collection: &str,
        query: &QuerySpec,
    ) -> Result<ChangeStream, RemoteError> {
        let mut state = self.lock();
        if let Some(error) = state.failing_queries.get(collection) {
            return Err(error.clone());
        }
        let (tx, stream) = ChangeStream::channel();
        state.subscribers.push(Subscriber {
            collection: collection.to_string(),
            query: query.clone(),
            tx,
        });
        Ok(stream)
    }

    fn batch_limit(&self) -> usize {
        self.batch_limit
    }
}
