//! WorkerStore port - worker プールの生存記録

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::domain::WorkerRecord;
use crate::error::Result;

#[async_trait]
pub trait WorkerStore: Send + Sync {
    /// 初回は worker を作成、以降は更新
    async fn heartbeat(&self, name: &str, at: DateTime<Utc>) -> Result<()>;

    async fn get(&self, name: &str) -> Result<Option<WorkerRecord>>;

    /// 全 worker を名前順で
    async fn list(&self) -> Result<Vec<WorkerRecord>>;

    async fn delete(&self, name: &str) -> Result<bool>;

    async fn live_workers(&self, now: DateTime<Utc>, timeout: Duration) -> Result<Vec<WorkerRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|w| w.is_alive(now, timeout))
            .collect())
    }
}
