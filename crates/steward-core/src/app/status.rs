//! StatusService - 参照と制御の API
//!
//! タスク・worker の REST リソースに相当する型付き API です。
//! フィルタ付き一覧、取得、キャンセル、保留時の 202 レスポンス本体を提供します。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::app::dispatcher::{CancelOutcome, Dispatcher};
use crate::domain::{TaskId, TaskRecord, WorkerRecord};
use crate::error::{Result, StewardError};
use crate::observability::TaskCounts;
use crate::ports::{Clock, TaskFilter, TaskStore, WorkerStore};

/// ControlResponse は制御操作の応答と HTTP ステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControlResponse {
    NoContent,
    NotFound,
}

impl ControlResponse {
    pub fn status_code(self) -> u16 {
        match self {
            ControlResponse::NoContent => 204,
            ControlResponse::NotFound => 404,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLink {
    #[serde(rename = "_href")]
    pub href: String,
    pub task_id: TaskId,
}

/// Postponed は 202 Accepted。呼び出し側はリンク先のタスクをポーリングする
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostponedResponse {
    pub status: u16,
    pub tasks: Vec<TaskLink>,
}

impl PostponedResponse {
    pub const STATUS: u16 = 202;

    /// レスポンス本体: `[{"_href": ..., "task_id": ...}]`
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.tasks).unwrap_or_default()
    }
}

pub struct StatusService {
    tasks: Arc<dyn TaskStore>,
    workers: Arc<dyn WorkerStore>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    liveness_timeout: chrono::Duration,
    api_prefix: String,
}

impl StatusService {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        workers: Arc<dyn WorkerStore>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        liveness_timeout: chrono::Duration,
        api_prefix: impl Into<String>,
    ) -> Self {
        Self {
            tasks,
            workers,
            dispatcher,
            clock,
            liveness_timeout,
            api_prefix: api_prefix.into(),
        }
    }

    /// `filter` に合うタスクを投入順で
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>> {
        self.tasks.list(filter).await
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<TaskRecord> {
        self.tasks
            .get(task_id)
            .await?
            .ok_or(StewardError::TaskNotFound(task_id))
    }

    /// キャンセル。存在するタスクなら状態によらず 204
    pub async fn cancel(&self, task_id: TaskId) -> Result<ControlResponse> {
        match self.dispatcher.cancel(task_id).await {
            Ok(CancelOutcome::Canceled | CancelOutcome::Revoking | CancelOutcome::AlreadyTerminal(_)) => {
                Ok(ControlResponse::NoContent)
            }
            Err(StewardError::TaskNotFound(_)) => Ok(ControlResponse::NotFound),
            Err(err) => Err(err),
        }
    }

    /// heartbeat が新しい worker
    pub async fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        self.workers
            .live_workers(self.clock.now(), self.liveness_timeout)
            .await
    }

    pub async fn counts(&self) -> Result<TaskCounts> {
        let records = self.tasks.list(&TaskFilter::new()).await?;
        Ok(TaskCounts::tally(&records))
    }

    pub fn postponed(&self, task_ids: &[TaskId]) -> PostponedResponse {
        let prefix = self.api_prefix.trim_end_matches('/');
        let links = task_ids
            .iter()
            .map(|id| TaskLink {
                href: format!("{prefix}/tasks/{id}/"),
                task_id: *id,
            })
            .collect();
        PostponedResponse {
            status: PostponedResponse::STATUS,
            tasks: links,
        }
    }
}
