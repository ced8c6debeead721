//! In-memory worker store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::WorkerRecord;
use crate::error::Result;
use crate::ports::WorkerStore;

#[derive(Default)]
pub struct InMemoryWorkerStore {
    workers: Mutex<BTreeMap<String, WorkerRecord>>,
}

impl InMemoryWorkerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerStore for InMemoryWorkerStore {
    async fn heartbeat(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        let mut workers = self.workers.lock().await;
        workers
            .entry(name.to_string())
            .and_modify(|w| w.refresh(at))
            .or_insert_with(|| WorkerRecord::new(name, at));
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<WorkerRecord>> {
        Ok(self.workers.lock().await.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<WorkerRecord>> {
        Ok(self.workers.lock().await.values().cloned().collect())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.workers.lock().await.remove(name).is_some())
    }
}
