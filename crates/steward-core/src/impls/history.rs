//! In-memory history - 削除可能な履歴コレクションのメモリ実装

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::RecordId;
use crate::error::Result;
use crate::ports::{ReapableCollection, TaskStore};

/// HistoryCollection は `RecordId` をキーにした追記専用の履歴
/// （consumer 履歴、sync / publish 結果など）。中身は不透明な JSON
pub struct HistoryCollection {
    name: String,
    entries: Mutex<BTreeMap<RecordId, serde_json::Value>>,
}

impl HistoryCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn append(&self, id: RecordId, entry: serde_json::Value) {
        self.entries.lock().await.insert(id, entry);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<RecordId> {
        self.entries.lock().await.keys().copied().collect()
    }
}

#[async_trait]
impl ReapableCollection for HistoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn reap_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let bound = RecordId::lower_bound_at(cutoff);
        let mut entries = self.entries.lock().await;
        let kept = entries.split_off(&bound);
        let removed = entries.len();
        *entries = kept;
        Ok(removed)
    }
}

/// TaskStatusHistory は終端タスクを `task_status` コレクションとして見せる
pub struct TaskStatusHistory {
    tasks: Arc<dyn TaskStore>,
}

impl TaskStatusHistory {
    pub const NAME: &'static str = "task_status";

    pub fn new(tasks: Arc<dyn TaskStore>) -> Self {
        Self { tasks }
    }
}

#[async_trait]
impl ReapableCollection for TaskStatusHistory {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn reap_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.tasks.reap_terminal_before(cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::record_id_at;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;

    #[rstest]
    #[case::keeps_everything(16, 3)]
    #[case::drops_oldest(10, 2)]
    #[case::boundary_is_kept(5, 2)]
    #[case::keeps_only_today(3, 1)]
    #[tokio::test]
    async fn reap_removes_only_older_entries(
        #[case] retention_days: i64,
        #[case] expected_left: usize,
    ) {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let history = HistoryCollection::new("repo_sync_results");
        for age in [0, 5, 15] {
            history
                .append(
                    record_id_at(now - Duration::days(age)),
                    serde_json::json!({"age": age}),
                )
                .await;
        }

        let cutoff = now - Duration::days(retention_days);
        history.reap_before(cutoff).await.unwrap();
        assert_eq!(history.len().await, expected_left);

        // 冪等
        assert_eq!(history.reap_before(cutoff).await.unwrap(), 0);
    }
}
