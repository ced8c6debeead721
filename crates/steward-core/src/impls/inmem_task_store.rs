//! In-memory task store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{TaskId, TaskRecord};
use crate::error::{Result, StewardError};
use crate::ports::{TaskFilter, TaskStore, TaskUpdate};

/// ID をキーにしたタスクレコード。`BTreeMap` なので投入順に並び、
/// それが reaper にとっての作成時刻順にもなる
#[derive(Default)]
pub struct InMemoryTaskStore {
    records: Mutex<BTreeMap<TaskId, TaskRecord>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.task_id) {
            return Err(StewardError::Other(format!(
                "task {} already exists",
                record.task_id
            )));
        }
        records.insert(record.task_id, record);
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>> {
        Ok(self.records.lock().await.get(&task_id).cloned())
    }

    async fn update(&self, task_id: TaskId, apply: TaskUpdate) -> Result<TaskRecord> {
        let mut records = self.records.lock().await;
        let current = records
            .get_mut(&task_id)
            .ok_or(StewardError::TaskNotFound(task_id))?;

        // コピー上で適用し、拒否された遷移が中途半端な書き込みを残さないようにする
        let mut next = current.clone();
        apply(&mut next)?;
        *current = next.clone();
        Ok(next)
    }

    async fn delete(&self, task_id: TaskId) -> Result<bool> {
        Ok(self.records.lock().await.remove(&task_id).is_some())
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn reap_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let bound = TaskId::lower_bound_at(cutoff);
        let mut records = self.records.lock().await;
        let expired: Vec<TaskId> = records
            .range(..bound)
            .filter(|(_, r)| r.state.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            records.remove(id);
        }
        Ok(expired.len())
    }
}
