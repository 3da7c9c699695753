//! 分批写入
//!
//! 将任意数量的写入请求按提供方上限切分为有序批次，每批原子提交，
//! 同时在途的批次数受 `max_concurrent_chunks` 限制。
//! 某一批失败不影响其他批次，结果按原始顺序汇总为成功 / 失败两部分。

use crate::data::error::RemoteError;
use crate::data::remote::RemoteStore;
use crate::models::config::BatchSettings;
use crate::models::mutation::{MutationId, MutationRequest};
use futures_util::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;

/// 单个批次
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// 批次序号（从 0 开始）
    pub index: usize,
    pub mutations: Vec<MutationRequest>,
}

/// 失败的写入
#[derive(Debug, Clone, PartialEq)]
pub struct FailedMutation {
    pub mutation_id: MutationId,
    /// 所在批次序号
    pub chunk_index: usize,
    pub cause: RemoteError,
    /// 原始请求，便于重试
    pub mutation: MutationRequest,
}

/// 批量写入结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    pub succeeded: Vec<MutationId>,
    pub failed: Vec<FailedMutation>,
    pub chunk_count: usize,
    /// 成功写入涉及的集合
    pub touched_collections: BTreeSet<String>,
}

impl BatchResult {
    /// 是否全部成功
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// 需要重新提交的请求（保持原始顺序）
    pub fn retry_set(&self) -> Vec<MutationRequest> {
        self.failed.iter().map(|f| f.mutation.clone()).collect()
    }

    /// 写入总数
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// 按上限切分为有序批次；上限至少为 1
pub fn split_into_chunks(mutations: Vec<MutationRequest>, limit: usize) -> Vec<Chunk> {
    let limit = limit.max(1);
    let mut chunks = Vec::with_capacity(mutations.len().div_ceil(limit));
    let mut iter = mutations.into_iter().peekable();
    while iter.peek().is_some() {
        let batch: Vec<MutationRequest> = iter.by_ref().take(limit).collect();
        chunks.push(Chunk {
            index: chunks.len(),
            mutations: batch,
        });
    }
    chunks
}

/// 分批写入器
pub struct BatchWriter {
    remote: Arc<dyn RemoteStore>,
    chunk_limit: usize,
    max_concurrency: usize,
}

impl BatchWriter {
    /// 批次上限取配置值与远程存储上限中的较小者
    pub fn new(remote: Arc<dyn RemoteStore>, settings: &BatchSettings) -> Self {
        let chunk_limit = settings
            .provider_batch_limit
            .min(remote.batch_limit())
            .max(1);
        Self {
            remote,
            chunk_limit,
            max_concurrency: settings.max_concurrent_chunks.max(1),
        }
    }

    pub fn chunk_limit(&self) -> usize {
        self.chunk_limit
    }

    /// 提交所有写入
    ///
    /// 不会因为某一批失败而返回错误：失败的批次原样体现在 `BatchResult::failed` 中。
    pub async fn commit(&self, mutations: Vec<MutationRequest>) -> BatchResult {
        if mutations.is_empty() {
            return BatchResult::default();
        }

        let total = mutations.len();
        let chunks = split_into_chunks(mutations, self.chunk_limit);
        let chunk_count = chunks.len();
        tracing::debug!(
            total,
            chunk_count,
            chunk_limit = self.chunk_limit,
            "开始分批写入"
        );

        // buffered 保持批次顺序，汇总结果无需再排序
        let outcomes: Vec<(Chunk, Result<(), RemoteError>)> = stream::iter(chunks)
            .map(|chunk| {
                let remote = self.remote.clone();
                async move {
                    let outcome = remote.commit_batch(&chunk.mutations).await;
                    (chunk, outcome)
                }
            })
            .buffered(self.max_concurrency)
            .collect()
            .await;

        let mut result = BatchResult {
            chunk_count,
            ..Default::default()
        };
        for (chunk, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    tracing::debug!(
                        chunk_index = chunk.index,
                        size = chunk.mutations.len(),
                        "批次提交成功"
                    );
                    for mutation in chunk.mutations {
                        result.touched_collections.insert(mutation.collection);
                        result.succeeded.push(mutation.id);
                    }
                }
                Err(cause) => {
                    tracing::warn!(
                        chunk_index = chunk.index,
                        size = chunk.mutations.len(),
                        error = %cause,
                        "批次提交失败"
                    );
                    result
                        .failed
                        .extend(chunk.mutations.into_iter().map(|mutation| FailedMutation {
                            mutation_id: mutation.id.clone(),
                            chunk_index: chunk.index,
                            cause: cause.clone(),
                            mutation,
                        }));
                }
            }
        }

        if !result.is_success() {
            tracing::warn!(
                succeeded = result.succeeded.len(),
                failed = result.failed.len(),
                "分批写入部分失败"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::remote::MemoryRemoteStore;
    use serde_json::json;

    fn mutations(n: usize) -> Vec<MutationRequest> {
        (0..n)
            .map(|i| MutationRequest::set("notes", format!("n{i}"), json!({"i": i})))
            .collect()
    }

    #[test]
    fn test_split_sizes() {
        let chunks = split_into_chunks(mutations(1200), 500);
        let sizes: Vec<usize> = chunks.iter().map(|c| c.mutations.len()).collect();
        assert_eq!(sizes, vec![500, 500, 200]);
        assert_eq!(
            chunks.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_split_edge_cases() {
        assert!(split_into_chunks(Vec::new(), 500).is_empty());
        assert_eq!(split_into_chunks(mutations(500), 500).len(), 1);
        // 上限为 0 时按 1 处理
        assert_eq!(split_into_chunks(mutations(3), 0).len(), 3);
    }

    #[tokio::test]
    async fn test_empty_commit_makes_no_calls() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let writer = BatchWriter::new(remote.clone(), &BatchSettings::default());

        let result = writer.commit(Vec::new()).await;
        assert!(result.is_success());
        assert_eq!(result.chunk_count, 0);
        assert_eq!(remote.commit_calls(), 0);
    }

    #[tokio::test]
    async fn test_limit_capped_by_remote() {
        let remote = Arc::new(MemoryRemoteStore::new().with_batch_limit(100));
        let writer = BatchWriter::new(remote.clone(), &BatchSettings::default());
        assert_eq!(writer.chunk_limit(), 100);

        let result = writer.commit(mutations(250)).await;
        assert!(result.is_success());
        assert_eq!(result.chunk_count, 3);
        assert_eq!(remote.commit_calls(), 3);
        assert_eq!(remote.len("notes"), 250);
    }

    #[tokio::test]
    async fn test_partial_failure_preserves_order() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let settings = BatchSettings {
            provider_batch_limit: 2,
            max_concurrent_chunks: 2,
        };
        let writer = BatchWriter::new(remote.clone(), &settings);
        let input = mutations(5);
        remote.fail_commits_containing("n2");

        let result = writer.commit(input.clone()).await;

        let expected_ok: Vec<MutationId> = [0, 1, 4].iter().map(|&i| input[i].id.clone()).collect();
        assert_eq!(result.succeeded, expected_ok);
        assert_eq!(result.failed.len(), 2);
        assert!(result.failed.iter().all(|f| f.chunk_index == 1));
        assert_eq!(result.retry_set(), vec![input[2].clone(), input[3].clone()]);
        assert_eq!(result.total(), 5);
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn test_touched_collections_only_from_succeeded_chunks() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let settings = BatchSettings {
            provider_batch_limit: 1,
            max_concurrent_chunks: 1,
        };
        let writer = BatchWriter::new(remote.clone(), &settings);
        remote.fail_commits_containing("p1");

        let result = writer
            .commit(vec![
                MutationRequest::set("drafts", "d1", json!({})).with_id("same"),
                MutationRequest::set("audit", "a1", json!({})).with_id("same"),
                MutationRequest::set("published", "p1", json!({})),
            ])
            .await;

        let touched: Vec<&str> = result.touched_collections.iter().map(String::as_str).collect();
        assert_eq!(touched, vec!["audit", "drafts"]);
        assert_eq!(result.succeeded.len(), 2);
    }
}
