//! LivenessMonitor - worker の生存監視
//!
//! heartbeat がタイムアウトより古い worker は消失扱いです。
//! 実行中のタスクは取り消し、予約は解放し、レコードは削除します。
//! 判断は一方的で、戻ってきた worker は次の heartbeat で再登録されます。
//!
//! 各 sweep の最後に保留中タスクの再配置も試みるので、
//! 生存 worker がいなかったタスクも worker が現れれば配置されます。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::domain::TaskId;
use crate::error::{Result, StewardError};
use crate::ports::{Clock, TaskFilter, TaskStore, WorkerStore, task_update};
use crate::reservation::ReservationHandle;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LivenessReport {
    pub lost_workers: Vec<String>,
    pub canceled: Vec<TaskId>,
    /// この sweep で配置できた保留タスク数
    pub deferred_placed: usize,
}

pub struct LivenessMonitor {
    tasks: Arc<dyn TaskStore>,
    workers: Arc<dyn WorkerStore>,
    reservations: ReservationHandle,
    clock: Arc<dyn Clock>,
    timeout: chrono::Duration,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        workers: Arc<dyn WorkerStore>,
        reservations: ReservationHandle,
        clock: Arc<dyn Clock>,
        timeout: chrono::Duration,
        interval: Duration,
    ) -> Self {
        Self {
            tasks,
            workers,
            reservations,
            clock,
            timeout,
            interval,
        }
    }

    /// worker レコードを 1 回走査
    ///
    /// 1 worker の失敗はログに残し、残りは続行する。
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<LivenessReport> {
        let mut report = LivenessReport::default();
        for worker in self.workers.list().await? {
            if worker.is_alive(now, self.timeout) {
                continue;
            }
            error!(
                worker_name = %worker.name,
                last_heartbeat = %worker.last_heartbeat,
                "worker missed its heartbeat deadline; canceling its tasks"
            );
            match self.reclaim(&worker.name, now).await {
                Ok(canceled) => {
                    report.canceled.extend(canceled);
                    report.lost_workers.push(worker.name);
                }
                Err(err) => {
                    error!(worker_name = %worker.name, error = %err, "cleaning up lost worker failed");
                }
            }
        }

        match self.reservations.retry_parked().await {
            Ok(placed) => report.deferred_placed = placed,
            Err(err) => error!(error = %err, "retrying deferred tasks failed"),
        }
        Ok(report)
    }

    async fn reclaim(&self, worker_name: &str, now: DateTime<Utc>) -> Result<Vec<TaskId>> {
        let mut canceled = Vec::new();

        for record in self.tasks.list(&TaskFilter::incomplete_on(worker_name)).await? {
            if self.cancel(record.task_id, now).await? {
                canceled.push(record.task_id);
            }
        }

        for task_id in self.reservations.reassign(worker_name).await? {
            if self.cancel(task_id, now).await? {
                canceled.push(task_id);
            }
        }

        self.workers.delete(worker_name).await?;
        info!(worker_name, canceled = canceled.len(), "lost worker removed");
        Ok(canceled)
    }

    async fn cancel(&self, task_id: TaskId, now: DateTime<Utc>) -> Result<bool> {
        match self.tasks.update(task_id, task_update(move |r| r.cancel(now))).await {
            Ok(_) => Ok(true),
            Err(StewardError::InvalidTransition { .. } | StewardError::TaskNotFound(_)) => {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.run_once(self.clock.now()).await {
                        Ok(report) if !report.lost_workers.is_empty() || report.deferred_placed > 0 => {
                            info!(
                                lost = ?report.lost_workers,
                                canceled = report.canceled.len(),
                                deferred_placed = report.deferred_placed,
                                "liveness sweep"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => error!(error = %err, "liveness sweep failed"),
                    }
                }
            }
        }
        debug!("liveness monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PayloadRef, ResourceTag, TaskRecord, TaskState};
    use crate::impls::{InMemoryDeliveryQueue, InMemoryTaskStore, InMemoryWorkerStore};
    use crate::ports::{DeliveryQueue, FixedClock, IdGenerator, UlidGenerator};
    use crate::reservation::{ReservationManager, Routing};
    use chrono::TimeZone;

    struct Fixture {
        clock: Arc<FixedClock>,
        tasks: Arc<InMemoryTaskStore>,
        workers: Arc<InMemoryWorkerStore>,
        queue: Arc<InMemoryDeliveryQueue>,
        ids: Arc<dyn IdGenerator>,
        reservations: ReservationHandle,
        monitor: LivenessMonitor,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));
        let tasks = Arc::new(InMemoryTaskStore::new());
        let workers = Arc::new(InMemoryWorkerStore::new());
        let queue = Arc::new(InMemoryDeliveryQueue::new());
        let timeout = chrono::Duration::seconds(300);
        let (reservations, _) = ReservationManager::spawn(
            queue.clone(),
            workers.clone(),
            ids.clone(),
            clock.clone(),
            timeout,
        );
        let monitor = LivenessMonitor::new(
            tasks.clone(),
            workers.clone(),
            reservations.clone(),
            clock.clone(),
            timeout,
            Duration::from_secs(60),
        );
        Fixture {
            clock,
            tasks,
            workers,
            queue,
            ids,
            reservations,
            monitor,
        }
    }

    async fn reserved_task(fx: &Fixture, repo: &str) -> TaskId {
        let task_id = fx.ids.generate_task_id();
        let tag = ResourceTag::repository(repo);
        fx.tasks
            .insert(TaskRecord::new(
                task_id,
                PayloadRef::RepositorySync {
                    repo_id: repo.into(),
                    override_config: None,
                },
                vec![tag.clone()],
                None,
            ))
            .await
            .unwrap();
        let routing = fx
            .reservations
            .acquire(task_id, vec![tag.reservation_key()])
            .await
            .unwrap();
        assert!(matches!(routing, Routing::Routed { .. }));
        task_id
    }

    #[tokio::test]
    async fn live_workers_are_left_alone() {
        let fx = fixture();
        fx.workers.heartbeat("w-0", fx.clock.now()).await.unwrap();
        fx.clock.advance(chrono::Duration::seconds(299));

        let report = fx.monitor.run_once(fx.clock.now()).await.unwrap();
        assert_eq!(report, LivenessReport::default());
        assert!(fx.workers.get("w-0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn lost_worker_tasks_are_canceled_and_reservations_dropped() {
        let fx = fixture();
        fx.workers.heartbeat("ghost", fx.clock.now()).await.unwrap();

        let running = reserved_task(&fx, "foo").await;
        let queued = reserved_task(&fx, "foo").await;
        let popped = fx
            .queue
            .pop("ghost", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.task_id, running);
        let now = fx.clock.now();
        fx.tasks
            .update(running, task_update(move |r| r.start("ghost", now)))
            .await
            .unwrap();

        fx.clock.advance(chrono::Duration::seconds(301));
        let report = fx.monitor.run_once(fx.clock.now()).await.unwrap();

        assert_eq!(report.lost_workers, vec!["ghost".to_string()]);
        assert_eq!(report.canceled.len(), 2);
        for id in [running, queued] {
            let record = fx.tasks.get(id).await.unwrap().unwrap();
            assert_eq!(record.state, TaskState::Canceled);
        }
        assert!(fx.workers.get("ghost").await.unwrap().is_none());
        assert!(fx.reservations.snapshot().await.unwrap().reservations.is_empty());

        // 2 回目の sweep では何もしない
        let again = fx.monitor.run_once(fx.clock.now()).await.unwrap();
        assert_eq!(again, LivenessReport::default());
    }

    #[tokio::test]
    async fn finished_tasks_of_lost_worker_keep_their_state() {
        let fx = fixture();
        fx.workers.heartbeat("ghost", fx.clock.now()).await.unwrap();
        let done = reserved_task(&fx, "bar").await;
        let now = fx.clock.now();
        fx.tasks
            .update(
                done,
                task_update(move |r| {
                    r.start("ghost", now)?;
                    r.finish(Default::default(), now)
                }),
            )
            .await
            .unwrap();

        fx.clock.advance(chrono::Duration::minutes(10));
        let report = fx.monitor.run_once(fx.clock.now()).await.unwrap();
        assert_eq!(report.lost_workers.len(), 1);
        assert!(report.canceled.is_empty());
        let record = fx.tasks.get(done).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Finished);
    }
}
