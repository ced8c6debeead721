//! HistoryReaper - 履歴の定期削除
//!
//! # フロー
//! 1. scheduled call が `reaper.interval_secs` ごとに `ReapHistory` タスクを投入
//! 2. worker が `ReapHistoryHandler` で実行
//! 3. `HistoryReaper::run_once` が各コレクションを保持期間で削除

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::app::runtime::{TaskContext, TaskHandler};
use crate::config::ReaperConfig;
use crate::domain::{PayloadRef, TaskFailure, TaskOutput};
use crate::ports::{Clock, ReapableCollection};

/// ReapReport はコレクションごとの削除件数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub removed: BTreeMap<String, usize>,
}

impl ReapReport {
    pub fn total(&self) -> usize {
        self.removed.values().sum()
    }
}

pub struct HistoryReaper {
    collections: Vec<Arc<dyn ReapableCollection>>,
    config: ReaperConfig,
    clock: Arc<dyn Clock>,
}

impl HistoryReaper {
    pub fn new(
        collections: Vec<Arc<dyn ReapableCollection>>,
        config: ReaperConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            collections,
            config,
            clock,
        }
    }

    pub fn collection_names(&self) -> Vec<&str> {
        self.collections.iter().map(|c| c.name()).collect()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// 保持期間が設定された全コレクションを削除
    ///
    /// 失敗したコレクションはログに残して 0 件と報告し、
    /// 残りは続行する。
    pub async fn run_once(&self, now: DateTime<Utc>) -> ReapReport {
        let mut report = ReapReport::default();
        for collection in &self.collections {
            let name = collection.name();
            let Some(retention) = self.config.retention(name) else {
                debug!(collection = name, "no retention configured; skipped");
                continue;
            };
            let Some(cutoff) = now.checked_sub_signed(retention) else {
                debug!(collection = name, "retention reaches past the earliest time; nothing to reap");
                report.removed.insert(name.to_string(), 0);
                continue;
            };
            let removed = match collection.reap_before(cutoff).await {
                Ok(removed) => removed,
                Err(err) => {
                    error!(collection = name, error = %err, "reaping collection failed");
                    0
                }
            };
            if removed > 0 {
                info!(collection = name, removed, cutoff = %cutoff, "history reaped");
            }
            report.removed.insert(name.to_string(), removed);
        }
        report
    }
}

/// `PayloadRef::ReapHistory` の組み込み handler
pub struct ReapHistoryHandler {
    reaper: Arc<HistoryReaper>,
}

impl ReapHistoryHandler {
    pub fn new(reaper: Arc<HistoryReaper>) -> Self {
        Self { reaper }
    }
}

#[async_trait]
impl TaskHandler for ReapHistoryHandler {
    async fn handle(
        &self,
        payload: PayloadRef,
        _ctx: TaskContext,
    ) -> std::result::Result<TaskOutput, TaskFailure> {
        if !matches!(payload, PayloadRef::ReapHistory) {
            return Err(TaskFailure::new(
                "unexpected_payload",
                format!("reap handler got {}", payload.kind()),
            ));
        }
        let report = self.reaper.run_once(self.reaper.now()).await;
        let result = serde_json::to_value(&report)
            .map_err(|e| TaskFailure::new("serialization", e.to_string()))?;
        Ok(TaskOutput::with_result(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, StewardError};
    use crate::impls::HistoryCollection;
    use crate::ports::{FixedClock, record_id_at};
    use chrono::TimeZone;

    struct Broken;

    #[async_trait]
    impl ReapableCollection for Broken {
        fn name(&self) -> &str {
            "repo_sync_results"
        }

        async fn reap_before(&self, _cutoff: DateTime<Utc>) -> Result<usize> {
            Err(StewardError::Other("disk gone".into()))
        }
    }

    fn config(entries: &[(&str, f64)]) -> ReaperConfig {
        ReaperConfig {
            interval_secs: 60,
            retention_days: entries
                .iter()
                .map(|(name, days)| (name.to_string(), *days))
                .collect(),
        }
    }

    #[tokio::test]
    async fn prunes_by_per_collection_retention() {
        let now = Utc.with_ymd_and_hms(2024, 3, 20, 0, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(now));
        let consumers = Arc::new(HistoryCollection::new("consumer_history"));
        let syncs = Arc::new(HistoryCollection::new("repo_publish_results"));
        let unmanaged = Arc::new(HistoryCollection::new("audit"));
        for age in [0, 5, 15] {
            let at = now - chrono::Duration::days(age);
            consumers.append(record_id_at(at), serde_json::json!({"age": age})).await;
            syncs.append(record_id_at(at), serde_json::json!({"age": age})).await;
            unmanaged.append(record_id_at(at), serde_json::json!({"age": age})).await;
        }

        let collections: Vec<Arc<dyn ReapableCollection>> =
            vec![consumers.clone(), syncs.clone(), unmanaged.clone()];
        let reaper = HistoryReaper::new(
            collections,
            config(&[("consumer_history", 10.0), ("repo_publish_results", 1.0)]),
            clock,
        );
        let report = reaper.run_once(now).await;

        assert_eq!(report.removed["consumer_history"], 1);
        assert_eq!(report.removed["repo_publish_results"], 2);
        assert!(!report.removed.contains_key("audit"));
        assert_eq!(report.total(), 3);
        assert_eq!(unmanaged.len().await, 3);

        let again = reaper.run_once(now).await;
        assert_eq!(again.total(), 0);
    }

    #[tokio::test]
    async fn retention_past_the_earliest_time_reaps_nothing() {
        let now = Utc.with_ymd_and_hms(2024, 3, 20, 0, 0, 0).unwrap();
        let consumers = Arc::new(HistoryCollection::new("consumer_history"));
        consumers
            .append(record_id_at(now - chrono::Duration::days(400)), serde_json::json!({}))
            .await;

        let collections: Vec<Arc<dyn ReapableCollection>> = vec![consumers.clone()];
        let reaper = HistoryReaper::new(
            collections,
            config(&[("consumer_history", 1e9)]),
            Arc::new(FixedClock::new(now)),
        );
        let report = reaper.run_once(now).await;
        assert_eq!(report.removed["consumer_history"], 0);
        assert_eq!(consumers.len().await, 1);
    }

    #[tokio::test]
    async fn failing_collection_does_not_stop_the_others() {
        let now = Utc.with_ymd_and_hms(2024, 3, 20, 0, 0, 0).unwrap();
        let consumers = Arc::new(HistoryCollection::new("consumer_history"));
        consumers
            .append(record_id_at(now - chrono::Duration::days(90)), serde_json::json!({}))
            .await;

        let collections: Vec<Arc<dyn ReapableCollection>> =
            vec![Arc::new(Broken), consumers.clone()];
        let reaper = HistoryReaper::new(
            collections,
            config(&[("consumer_history", 60.0), ("repo_sync_results", 60.0)]),
            Arc::new(FixedClock::new(now)),
        );
        let report = reaper.run_once(now).await;
        assert_eq!(report.removed["repo_sync_results"], 0);
        assert_eq!(report.removed["consumer_history"], 1);
        assert!(consumers.is_empty().await);
    }
}
