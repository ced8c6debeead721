//! Reservation manager - リソース予約
//!
//! 1 つの tokio タスクが [`ReservationTable`] を所有し、単一チャネルのコマンドを順に処理します。
//! acquire / release / reassign が交錯することはありません。
//! ルーティングしたタスクのレーンへの push もこのタスク内で行うので、各レーンは投入順を保ちます。
//!
//! 呼び出し側は clone 可能な [`ReservationHandle`] を使います。すべての handle が drop されるとタスクは終了します。
//!
//! # 学習ポイント
//! - mpsc + oneshot による actor パターン
//! - 配送失敗時の予約ロールバック

mod table;

use std::sync::Arc;

use chrono::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use self::table::{
    ParkedRetry, Placement, Plan, Reassignment, Reservation, ReservationEntry,
    ReservationSnapshot, ReservationTable,
};
use crate::domain::{LaneId, ReservationKey, TaskId};
use crate::error::{Result, StewardError};
use crate::ports::{Clock, DeliveryQueue, IdGenerator, WorkerStore};

/// Routing は `acquire` の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    Routed { lane: LaneId, worker_name: String },
    /// 競合する予約がはけるまで保留
    Deferred,
}

enum Command {
    Acquire {
        task_id: TaskId,
        keys: Vec<ReservationKey>,
        reply: oneshot::Sender<Result<Routing>>,
    },
    Release {
        task_id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },
    Withdraw {
        task_id: TaskId,
        reply: oneshot::Sender<Result<bool>>,
    },
    Reassign {
        worker_name: String,
        reply: oneshot::Sender<Result<Vec<TaskId>>>,
    },
    RetryParked {
        reply: oneshot::Sender<Result<usize>>,
    },
    Snapshot {
        reply: oneshot::Sender<ReservationSnapshot>,
    },
}

#[derive(Clone)]
pub struct ReservationHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ReservationHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| StewardError::ReservationClosed)?;
        rx.await.map_err(|_| StewardError::ReservationClosed)
    }

    /// `task_id` のために `keys` を予約し、選んだレーンへ push
    pub async fn acquire(&self, task_id: TaskId, keys: Vec<ReservationKey>) -> Result<Routing> {
        self.call(|reply| Command::Acquire {
            task_id,
            keys,
            reply,
        })
        .await?
    }

    /// タスクの予約を返す。何度呼んでもよい
    pub async fn release(&self, task_id: TaskId) -> Result<()> {
        self.call(|reply| Command::Release { task_id, reply }).await?
    }

    /// 未 pop のタスクを引き戻す。worker が取得済みなら `false`
    pub async fn withdraw(&self, task_id: TaskId) -> Result<bool> {
        self.call(|reply| Command::Withdraw { task_id, reply })
            .await?
    }

    /// 消失した worker の予約をすべて破棄し、捨てたタスクを返す
    pub async fn reassign(&self, worker_name: &str) -> Result<Vec<TaskId>> {
        let worker_name = worker_name.to_string();
        self.call(|reply| Command::Reassign { worker_name, reply })
            .await?
    }

    /// 配置可能になった保留タスクを配置し、件数を返す
    pub async fn retry_parked(&self) -> Result<usize> {
        self.call(|reply| Command::RetryParked { reply }).await?
    }

    pub async fn snapshot(&self) -> Result<ReservationSnapshot> {
        self.call(|reply| Command::Snapshot { reply }).await
    }
}

pub struct ReservationManager {
    table: ReservationTable,
    queue: Arc<dyn DeliveryQueue>,
    workers: Arc<dyn WorkerStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    liveness_timeout: Duration,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl ReservationManager {
    pub fn spawn(
        queue: Arc<dyn DeliveryQueue>,
        workers: Arc<dyn WorkerStore>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        liveness_timeout: Duration,
    ) -> (ReservationHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            table: ReservationTable::new(),
            queue,
            workers,
            ids,
            clock,
            liveness_timeout,
            rx,
        };
        let join = tokio::spawn(manager.run());
        (ReservationHandle { tx }, join)
    }

    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Acquire {
                    task_id,
                    keys,
                    reply,
                } => {
                    let _ = reply.send(self.acquire(task_id, keys).await);
                }
                Command::Release { task_id, reply } => {
                    let _ = reply.send(self.release(task_id).await);
                }
                Command::Withdraw { task_id, reply } => {
                    let _ = reply.send(self.withdraw(task_id).await);
                }
                Command::Reassign { worker_name, reply } => {
                    let _ = reply.send(self.reassign(&worker_name).await);
                }
                Command::RetryParked { reply } => {
                    let _ = reply.send(self.retry_parked().await);
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.table.snapshot());
                }
            }
        }
        debug!("reservation manager stopped");
    }

    async fn live_worker_names(&self) -> Result<Vec<String>> {
        Ok(self
            .workers
            .live_workers(self.clock.now(), self.liveness_timeout)
            .await?
            .into_iter()
            .map(|w| w.name)
            .collect())
    }

    async fn acquire(&mut self, task_id: TaskId, keys: Vec<ReservationKey>) -> Result<Routing> {
        let live = self.live_worker_names().await?;
        let ids = Arc::clone(&self.ids);
        let plan = self
            .table
            .acquire(task_id, keys, &live, || ids.generate_lane_id())?;

        match plan {
            Plan::Place(placement) => {
                let routing = Routing::Routed {
                    lane: placement.lane,
                    worker_name: placement.worker_name.clone(),
                };
                if let Err(err) = self.deliver(placement).await {
                    warn!(task_id = %task_id, error = %err, "delivery failed; reservation rolled back");
                    if let Err(undo) = self.release(task_id).await {
                        warn!(task_id = %task_id, error = %undo, "rolling back reservation failed");
                    }
                    return Err(err);
                }
                Ok(routing)
            }
            Plan::Park => {
                info!(task_id = %task_id, "task deferred behind conflicting reservations");
                Ok(Routing::Deferred)
            }
        }
    }

    async fn deliver(&self, placement: Placement) -> Result<()> {
        for lane in &placement.opened {
            self.queue.open_lane(*lane, &placement.worker_name).await?;
        }
        self.queue.push(placement.lane, placement.task_id).await?;
        debug!(
            task_id = %placement.task_id,
            lane = %placement.lane,
            worker_name = %placement.worker_name,
            "task routed to reserved lane"
        );
        Ok(())
    }

    async fn close_lanes(&self, lanes: Vec<LaneId>) -> Result<()> {
        for lane in lanes {
            let leftovers = self.queue.close_lane(lane).await?;
            if !leftovers.is_empty() {
                warn!(lane = %lane, count = leftovers.len(), "closed lane still had tasks");
            }
        }
        Ok(())
    }

    async fn retry_parked(&mut self) -> Result<usize> {
        if !self.table.has_parked() {
            return Ok(0);
        }
        let live = self.live_worker_names().await?;
        let ids = Arc::clone(&self.ids);
        let ParkedRetry { placed, stranded } = self
            .table
            .retry_parked(&live, || ids.generate_lane_id());
        if !stranded.is_empty() {
            warn!(
                tasks = ?stranded,
                live_workers = live.len(),
                "deferred tasks are free to run but no live worker can take them"
            );
        }
        let count = placed.len();
        for placement in placed {
            info!(task_id = %placement.task_id, "deferred task routed");
            self.deliver(placement).await?;
        }
        Ok(count)
    }

    async fn release(&mut self, task_id: TaskId) -> Result<()> {
        let closed = self.table.release(task_id);
        self.close_lanes(closed).await?;
        self.retry_parked().await.map(|_| ())
    }

    async fn withdraw(&mut self, task_id: TaskId) -> Result<bool> {
        if self.table.unpark(task_id) {
            return Ok(true);
        }
        let Some(lane) = self.table.lane_of(task_id) else {
            return Ok(false);
        };
        if !self.queue.remove(Some(lane), task_id).await? {
            // pop 済み。worker が終わったときに解放する
            return Ok(false);
        }
        self.release(task_id).await?;
        Ok(true)
    }

    async fn reassign(&mut self, worker_name: &str) -> Result<Vec<TaskId>> {
        let Reassignment { closed, discarded } = self.table.reassign(worker_name);
        if !closed.is_empty() {
            info!(
                worker_name,
                lanes = closed.len(),
                tasks = discarded.len(),
                "reservations of lost worker dropped"
            );
        }
        for lane in closed {
            self.queue.close_lane(lane).await?;
        }
        self.retry_parked().await?;
        Ok(discarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ResourceTag;
    use crate::impls::{InMemoryDeliveryQueue, InMemoryWorkerStore};
    use crate::ports::{Delivery, SystemClock, UlidGenerator};
    use async_trait::async_trait;
    use std::time::Duration as StdDuration;
    use ulid::Ulid;

    /// レーンは開くが push はすべて拒否する
    struct RejectingPush(InMemoryDeliveryQueue);

    #[async_trait]
    impl DeliveryQueue for RejectingPush {
        async fn push_general(&self, task_id: TaskId) -> Result<()> {
            self.0.push_general(task_id).await
        }

        async fn open_lane(&self, lane: LaneId, owner: &str) -> Result<()> {
            self.0.open_lane(lane, owner).await
        }

        async fn push(&self, _lane: LaneId, _task_id: TaskId) -> Result<()> {
            Err(StewardError::Other("lane store offline".into()))
        }

        async fn pop(&self, worker: &str, timeout: StdDuration) -> Result<Option<Delivery>> {
            self.0.pop(worker, timeout).await
        }

        async fn remove(&self, lane: Option<LaneId>, task_id: TaskId) -> Result<bool> {
            self.0.remove(lane, task_id).await
        }

        async fn close_lane(&self, lane: LaneId) -> Result<Vec<TaskId>> {
            self.0.close_lane(lane).await
        }

        async fn depth(&self, lane: Option<LaneId>) -> Result<usize> {
            self.0.depth(lane).await
        }
    }

    struct Fixture {
        queue: Arc<InMemoryDeliveryQueue>,
        workers: Arc<InMemoryWorkerStore>,
        handle: ReservationHandle,
    }

    async fn fixture(worker_names: &[&str]) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let queue = Arc::new(InMemoryDeliveryQueue::new());
        let workers = Arc::new(InMemoryWorkerStore::new());
        for name in worker_names {
            workers.heartbeat(name, clock.now()).await.unwrap();
        }
        let (handle, _join) = ReservationManager::spawn(
            queue.clone(),
            workers.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            clock,
            Duration::seconds(300),
        );
        Fixture {
            queue,
            workers,
            handle,
        }
    }

    fn key(repo: &str) -> ReservationKey {
        ResourceTag::repository(repo).reservation_key()
    }

    fn task() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    /// 作成順が固定された ID
    fn task_at(ms: u64) -> TaskId {
        TaskId::from_ulid(Ulid::from_parts(ms, 0))
    }

    async fn pop(queue: &InMemoryDeliveryQueue, worker: &str) -> Option<Delivery> {
        queue.pop(worker, StdDuration::from_millis(20)).await.unwrap()
    }

    #[tokio::test]
    async fn acquire_pushes_onto_owner_lane_in_order() {
        let fx = fixture(&["w-1", "w-2"]).await;
        let (a, b) = (task(), task());

        let ra = fx.handle.acquire(a, vec![key("foo")]).await.unwrap();
        let rb = fx.handle.acquire(b, vec![key("foo")]).await.unwrap();
        assert_eq!(ra, rb);
        let Routing::Routed { worker_name, .. } = ra else {
            panic!("expected routed");
        };

        assert_eq!(pop(&fx.queue, &worker_name).await.unwrap().task_id, a);
        assert_eq!(pop(&fx.queue, &worker_name).await.unwrap().task_id, b);
    }

    #[tokio::test]
    async fn acquire_without_live_workers_fails() {
        let fx = fixture(&[]).await;
        let err = fx.handle.acquire(task(), vec![key("foo")]).await.unwrap_err();
        assert!(matches!(err, StewardError::NoAvailableWorker));
        assert!(fx.handle.snapshot().await.unwrap().reservations.is_empty());
    }

    #[tokio::test]
    async fn release_of_last_holder_closes_lane() {
        let fx = fixture(&["w-1"]).await;
        let a = task();
        let Routing::Routed { lane, .. } = fx.handle.acquire(a, vec![key("foo")]).await.unwrap()
        else {
            panic!("expected routed");
        };
        pop(&fx.queue, "w-1").await.unwrap();

        fx.handle.release(a).await.unwrap();
        fx.handle.release(a).await.unwrap();

        assert!(fx.handle.snapshot().await.unwrap().reservations.is_empty());
        assert!(fx.queue.push(lane, task()).await.is_err());
    }

    #[tokio::test]
    async fn withdraw_before_and_after_pop() {
        let fx = fixture(&["w-1"]).await;
        let (a, b) = (task(), task());
        fx.handle.acquire(a, vec![key("foo")]).await.unwrap();
        fx.handle.acquire(b, vec![key("foo")]).await.unwrap();

        assert_eq!(pop(&fx.queue, "w-1").await.unwrap().task_id, a);
        assert!(!fx.handle.withdraw(a).await.unwrap());
        assert!(fx.handle.withdraw(b).await.unwrap());

        // `a` は worker が解放するまで保持されたまま
        let snapshot = fx.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.get(&key("foo")).unwrap().num_reservations, 1);
        fx.handle.release(a).await.unwrap();
        assert!(fx.handle.snapshot().await.unwrap().reservations.is_empty());
    }

    #[tokio::test]
    async fn deferred_task_is_delivered_after_release() {
        let fx = fixture(&["w-1", "w-2"]).await;
        let (on_foo, on_bar, both) = (task_at(1), task_at(2), task_at(3));
        fx.handle.acquire(on_foo, vec![key("foo")]).await.unwrap();
        fx.handle.acquire(on_bar, vec![key("bar")]).await.unwrap();

        let routing = fx
            .handle
            .acquire(both, vec![key("foo"), key("bar")])
            .await
            .unwrap();
        assert_eq!(routing, Routing::Deferred);

        assert_eq!(pop(&fx.queue, "w-2").await.unwrap().task_id, on_bar);
        fx.handle.release(on_bar).await.unwrap();

        assert_eq!(pop(&fx.queue, "w-1").await.unwrap().task_id, on_foo);
        assert_eq!(pop(&fx.queue, "w-1").await.unwrap().task_id, both);
    }

    #[tokio::test]
    async fn reassign_returns_discarded_tasks_and_frees_keys() {
        let fx = fixture(&["w-1", "w-2"]).await;
        let (a, b) = (task(), task());
        fx.handle.acquire(a, vec![key("foo")]).await.unwrap();
        fx.handle.acquire(b, vec![key("foo")]).await.unwrap();

        fx.workers.delete("w-1").await.unwrap();
        let mut discarded = fx.handle.reassign("w-1").await.unwrap();
        discarded.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(discarded, expected);

        // リソースが空き、残った worker に載る
        let routing = fx.handle.acquire(task(), vec![key("foo")]).await.unwrap();
        assert!(matches!(routing, Routing::Routed { worker_name, .. } if worker_name == "w-2"));
    }

    #[tokio::test]
    async fn failed_delivery_rolls_back_the_reservation() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let workers = Arc::new(InMemoryWorkerStore::new());
        workers.heartbeat("w-1", clock.now()).await.unwrap();
        let (handle, _join) = ReservationManager::spawn(
            Arc::new(RejectingPush(InMemoryDeliveryQueue::new())),
            workers,
            Arc::new(UlidGenerator::new(clock.clone())),
            clock,
            Duration::seconds(300),
        );

        let err = handle.acquire(task(), vec![key("foo")]).await.unwrap_err();
        assert!(matches!(err, StewardError::Other(_)));

        let snapshot = handle.snapshot().await.unwrap();
        assert!(snapshot.reservations.is_empty());
        assert!(snapshot.parked.is_empty());
        assert_eq!(handle.retry_parked().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn calls_fail_once_manager_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel::<Command>();
        drop(rx);
        let orphan = ReservationHandle { tx };

        let err = orphan.snapshot().await.unwrap_err();
        assert!(matches!(err, StewardError::ReservationClosed));
    }
}
