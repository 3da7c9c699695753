//! 远程文档存储契约
//!
//! 同步层只依赖 `RemoteStore` trait，具体后端（托管文档数据库、内存实现等）
//! 在构造 `DataManager` / `ChangeSubscriber` 时注入。

pub mod memory;

pub use memory::MemoryRemoteStore;

use crate::data::error::RemoteError;
use crate::models::document::{Document, DocumentChange, QuerySpec};
use crate::models::mutation::MutationRequest;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// 变更批次（远程推送的一组文档变更，或推送错误）
pub type ChangeBatch = std::result::Result<Vec<DocumentChange>, RemoteError>;

/// 远程订阅的推送端
pub type ChangeSender = mpsc::UnboundedSender<ChangeBatch>;

/// 远程订阅的接收端
///
/// 丢弃该流即视为退订，推送端在下次发送时感知并清理。
#[derive(Debug)]
pub struct ChangeStream {
    rx: mpsc::UnboundedReceiver<ChangeBatch>,
}

impl ChangeStream {
    /// 创建一对推送端 / 接收端
    pub fn channel() -> (ChangeSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// 等待下一个变更批次；推送端全部关闭后返回 None
    pub async fn next(&mut self) -> Option<ChangeBatch> {
        self.rx.recv().await
    }
}

/// 远程文档存储
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 查询集合
    async fn query(
        &self,
        collection: &str,
        query: &QuerySpec,
    ) -> std::result::Result<Vec<Document>, RemoteError>;

    /// 原子提交一批写入；超过 `batch_limit()` 时必须拒绝
    async fn commit_batch(
        &self,
        mutations: &[MutationRequest],
    ) -> std::result::Result<(), RemoteError>;

    /// 订阅集合变更
    async fn subscribe(
        &self,
        collection: &str,
        query: &QuerySpec,
    ) -> std::result::Result<ChangeStream, RemoteError>;

    /// 单批写入上限
    fn batch_limit(&self) -> usize;
}
