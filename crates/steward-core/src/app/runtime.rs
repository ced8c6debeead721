//! Runtime - payload handler と実行コンテキスト

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::app::dispatcher::Dispatcher;
use crate::domain::{
    GroupId, PayloadKind, PayloadRef, ResourceTag, TaskFailure, TaskId, TaskOutput,
};
use crate::error::{Result, StewardError};
use crate::ports::{TaskStore, task_update};

/// TaskHandler は 1 種類の payload を実行
///
/// 長い handler はステップの合間に `ctx.cancellation()` を確認すること。
/// revoke 後に猶予期間内に止まらないタスクは drop される。
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(
        &self,
        payload: PayloadRef,
        ctx: TaskContext,
    ) -> std::result::Result<TaskOutput, TaskFailure>;
}

/// HandlerRegistry は payload kind -> handler の対応表
///
/// builder が一度だけ構築し、以後は読み取り専用で共有する。
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<PayloadKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: PayloadKind, handler: Arc<dyn TaskHandler>) -> Result<()> {
        if self.handlers.contains_key(&kind) {
            return Err(StewardError::DuplicateHandler(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn get(&self, kind: PayloadKind) -> Result<Arc<dyn TaskHandler>> {
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or(StewardError::HandlerNotFound(kind))
    }

    pub fn contains(&self, kind: PayloadKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<PayloadKind> {
        let mut kinds: Vec<PayloadKind> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// TaskContext は実行中の handler が触れてよいものすべて
#[derive(Clone)]
pub struct TaskContext {
    task_id: TaskId,
    worker_name: String,
    group_id: Option<GroupId>,
    cancel: CancellationToken,
    tasks: Arc<dyn TaskStore>,
    dispatcher: Arc<Dispatcher>,
}

impl TaskContext {
    pub fn new(
        task_id: TaskId,
        worker_name: impl Into<String>,
        group_id: Option<GroupId>,
        cancel: CancellationToken,
        tasks: Arc<dyn TaskStore>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            task_id,
            worker_name: worker_name.into(),
            group_id,
            cancel,
            tasks,
            dispatcher,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn group_id(&self) -> Option<GroupId> {
        self.group_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 進捗レポートを上書き
    pub async fn report_progress(&self, report: serde_json::Value) -> Result<()> {
        self.tasks
            .update(
                self.task_id,
                task_update(move |record| {
                    record.set_progress(report);
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }

    /// 子タスクを投入し、このタスクの `spawned_tasks` に記録
    ///
    /// 子は独立している。このタスクをキャンセルしても子はキャンセルされない。
    pub async fn spawn(
        &self,
        payload: PayloadRef,
        resource_tags: Vec<ResourceTag>,
    ) -> Result<TaskId> {
        let child = self
            .dispatcher
            .submit(payload, resource_tags, self.group_id)
            .await?;
        self.tasks
            .update(
                self.task_id,
                task_update(move |record| {
                    record.add_spawned(child);
                    Ok(())
                }),
            )
            .await?;
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OkHandler;

    #[async_trait]
    impl TaskHandler for OkHandler {
        async fn handle(
            &self,
            _payload: PayloadRef,
            _ctx: TaskContext,
        ) -> std::result::Result<TaskOutput, TaskFailure> {
            Ok(TaskOutput::default())
        }
    }

    #[test]
    fn registry_rejects_duplicates() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(PayloadKind::RepositorySync, Arc::new(OkHandler))
            .unwrap();
        let err = registry
            .register(PayloadKind::RepositorySync, Arc::new(OkHandler))
            .unwrap_err();
        assert!(matches!(err, StewardError::DuplicateHandler(PayloadKind::RepositorySync)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn missing_handler_is_reported_by_kind() {
        let registry = HandlerRegistry::new();
        let err = registry.get(PayloadKind::ConsumerBind).err().unwrap();
        assert!(err.to_string().contains("bind"));
        assert!(registry.is_empty());
    }

    #[test]
    fn kinds_are_sorted() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(PayloadKind::ReapHistory, Arc::new(OkHandler))
            .unwrap();
        registry
            .register(PayloadKind::RepositorySync, Arc::new(OkHandler))
            .unwrap();
        assert_eq!(
            registry.kinds(),
            vec![PayloadKind::RepositorySync, PayloadKind::ReapHistory]
        );
        assert!(registry.contains(PayloadKind::ReapHistory));
    }
}
