//! TaskStore port - タスク履歴の正本（source of truth）
//!
//! # 設計原則
//! - 状態変更は必ず `update` を通す
//! - `update` はストアのロック下でクロージャを適用し、成功したときだけコミットする
//! - 実行中の worker と、観測・キャンセルする側とが同期する唯一の地点

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{GroupId, TaskId, TaskRecord, TaskState};
use crate::error::Result;

pub type TaskUpdate = Box<dyn FnOnce(&mut TaskRecord) -> Result<()> + Send>;

/// クロージャを `TaskUpdate` に box 化
pub fn task_update<F>(apply: F) -> TaskUpdate
where
    F: FnOnce(&mut TaskRecord) -> Result<()> + Send + 'static,
{
    Box::new(apply)
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, record: TaskRecord) -> Result<()>;

    async fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>>;

    /// `apply` を原子的に適用。エラーならレコードは変わらない
    async fn update(&self, task_id: TaskId, apply: TaskUpdate) -> Result<TaskRecord>;

    async fn delete(&self, task_id: TaskId) -> Result<bool>;

    /// 条件に合うレコードを ID（投入）順で
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>>;

    /// `cutoff` より前に作られた終端レコードを削除し、件数を返す
    async fn reap_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// TaskFilter はタスク検索条件。空のフィールドは全件一致、`tags` は OR
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub states: Vec<TaskState>,
    pub worker_name: Option<String>,
    pub tags: Vec<String>,
    pub group_id: Option<GroupId>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_states(mut self, states: &[TaskState]) -> Self {
        self.states = states.to_vec();
        self
    }

    pub fn with_worker(mut self, worker_name: impl Into<String>) -> Self {
        self.worker_name = Some(worker_name.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_group(mut self, group_id: GroupId) -> Self {
        self.group_id = Some(group_id);
        self
    }

    /// クエリ文字列形式 `tags=a,b,c` を受け付ける
    pub fn with_tag_list(self, csv: &str) -> Self {
        let tags = csv
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        self.with_tags(tags)
    }

    pub fn incomplete_on(worker_name: impl Into<String>) -> Self {
        Self::new()
            .with_states(&[TaskState::Waiting, TaskState::Running])
            .with_worker(worker_name)
    }

    pub fn matches(&self, record: &TaskRecord) -> bool {
        if !self.states.is_empty() && !self.states.contains(&record.state) {
            return false;
        }
        if let Some(worker) = &self.worker_name
            && record.worker_name.as_deref() != Some(worker.as_str())
        {
            return false;
        }
        if !self.tags.is_empty() && !record.has_any_tag(&self.tags) {
            return false;
        }
        if let Some(group_id) = self.group_id
            && record.group_id != Some(group_id)
        {
            return false;
        }
        true
    }
}
