//! In-memory lanes.
//!
//! # 実装
//! - tokio の `Mutex` で全レーンを守り、`Notify` でブロック中の pop を起こす
//! - push のたびに全 waiter を起こす。予約レーンは持ち主しか取り出せないので、任意の 1 worker だけを起こすと ID が取り残されうる

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::domain::{LaneId, TaskId};
use crate::error::{Result, StewardError};
use crate::ports::{Delivery, DeliveryQueue};

struct ReservedLane {
    owner: String,
    queue: VecDeque<TaskId>,
}

#[derive(Default)]
struct Lanes {
    general: VecDeque<TaskId>,
    reserved: HashMap<LaneId, ReservedLane>,
}

impl Lanes {
    fn try_pop(&mut self, worker: &str) -> Option<Delivery> {
        let oldest = self
            .reserved
            .iter()
            .filter(|(_, lane)| lane.owner == worker)
            .filter_map(|(id, lane)| lane.queue.front().map(|head| (*head, *id)))
            .min();

        if let Some((_, lane_id)) = oldest {
            let lane = self.reserved.get_mut(&lane_id)?;
            return lane.queue.pop_front().map(|task_id| Delivery {
                task_id,
                lane: Some(lane_id),
            });
        }

        self.general
            .pop_front()
            .map(|task_id| Delivery { task_id, lane: None })
    }
}

#[derive(Default)]
pub struct InMemoryDeliveryQueue {
    lanes: Mutex<Lanes>,
    notify: Notify,
}

impl InMemoryDeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

fn remove_id(queue: &mut VecDeque<TaskId>, task_id: TaskId) -> bool {
    match queue.iter().position(|id| *id == task_id) {
        Some(pos) => queue.remove(pos).is_some(),
        None => false,
    }
}

#[async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    async fn push_general(&self, task_id: TaskId) -> Result<()> {
        self.lanes.lock().await.general.push_back(task_id);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn open_lane(&self, lane: LaneId, owner: &str) -> Result<()> {
        let mut lanes = self.lanes.lock().await;
        lanes.reserved.entry(lane).or_insert_with(|| ReservedLane {
            owner: owner.to_string(),
            queue: VecDeque::new(),
        });
        Ok(())
    }

    async fn push(&self, lane: LaneId, task_id: TaskId) -> Result<()> {
        {
            let mut lanes = self.lanes.lock().await;
            let reserved = lanes
                .reserved
                .get_mut(&lane)
                .ok_or_else(|| StewardError::Other(format!("lane {lane} is not open")))?;
            reserved.queue.push_back(task_id);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop(&self, worker: &str, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        loop {
            // 見る前に待ち受けを登録し、その間の push を取りこぼさない
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.lanes.lock().await.try_pop(worker) {
                return Ok(Some(delivery));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn remove(&self, lane: Option<LaneId>, task_id: TaskId) -> Result<bool> {
        let mut lanes = self.lanes.lock().await;
        Ok(match lane {
            None => remove_id(&mut lanes.general, task_id),
            Some(lane) => lanes
                .reserved
                .get_mut(&lane)
                .is_some_and(|reserved| remove_id(&mut reserved.queue, task_id)),
        })
    }

    async fn close_lane(&self, lane: LaneId) -> Result<Vec<TaskId>> {
        let mut lanes = self.lanes.lock().await;
        Ok(lanes
            .reserved
            .remove(&lane)
            .map(|reserved| reserved.queue.into_iter().collect())
            .unwrap_or_default())
    }

    async fn depth(&self, lane: Option<LaneId>) -> Result<usize> {
        let lanes = self.lanes.lock().await;
        Ok(match lane {
            None => lanes.general.len(),
            Some(lane) => lanes.reserved.get(&lane).map_or(0, |r| r.queue.len()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use ulid::Ulid;

    fn task_id() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    fn lane_id() -> LaneId {
        LaneId::from_ulid(Ulid::new())
    }

    #[tokio::test]
    async fn general_lane_is_fifo() {
        let queue = InMemoryDeliveryQueue::new();
        let first = task_id();
        let second = task_id();
        queue.push_general(first).await.unwrap();
        queue.push_general(second).await.unwrap();

        let a = queue.pop("w-1", Duration::from_millis(10)).await.unwrap();
        let b = queue.pop("w-2", Duration::from_millis(10)).await.unwrap();
        assert_eq!(a, Some(Delivery { task_id: first, lane: None }));
        assert_eq!(b, Some(Delivery { task_id: second, lane: None }));
    }

    #[tokio::test]
    async fn pop_times_out_when_empty() {
        let queue = InMemoryDeliveryQueue::new();
        let start = Instant::now();
        let popped = queue.pop("w-1", Duration::from_millis(100)).await.unwrap();
        assert_eq!(popped, None);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn reserved_lane_is_only_visible_to_its_owner() {
        let queue = InMemoryDeliveryQueue::new();
        let lane = lane_id();
        let id = task_id();
        queue.open_lane(lane, "w-1").await.unwrap();
        queue.push(lane, id).await.unwrap();

        let other = queue.pop("w-2", Duration::from_millis(20)).await.unwrap();
        assert_eq!(other, None);

        let owner = queue.pop("w-1", Duration::from_millis(20)).await.unwrap();
        assert_eq!(owner, Some(Delivery { task_id: id, lane: Some(lane) }));
    }

    #[tokio::test]
    async fn owned_lanes_take_priority_and_yield_oldest_head() {
        let queue = InMemoryDeliveryQueue::new();
        let (lane_a, lane_b) = (lane_id(), lane_id());
        queue.open_lane(lane_a, "w-1").await.unwrap();
        queue.open_lane(lane_b, "w-1").await.unwrap();

        let general = TaskId::from_ulid(Ulid::from_parts(1, 0));
        let older = TaskId::from_ulid(Ulid::from_parts(2, 0));
        let newer = TaskId::from_ulid(Ulid::from_parts(3, 0));
        queue.push_general(general).await.unwrap();
        queue.push(lane_b, older).await.unwrap();
        queue.push(lane_a, newer).await.unwrap();

        let timeout = Duration::from_millis(10);
        let order: Vec<TaskId> = vec![
            queue.pop("w-1", timeout).await.unwrap().unwrap().task_id,
            queue.pop("w-1", timeout).await.unwrap().unwrap().task_id,
            queue.pop("w-1", timeout).await.unwrap().unwrap().task_id,
        ];
        assert_eq!(order, vec![older, newer, general]);
    }

    #[tokio::test]
    async fn push_wakes_blocked_owner() {
        let queue = Arc::new(InMemoryDeliveryQueue::new());
        let lane = lane_id();
        let id = task_id();
        queue.open_lane(lane, "w-1").await.unwrap();

        // 所有者でない worker が待っていても通知を横取りしない
        let bystander = tokio::spawn({
            let queue = queue.clone();
            async move { queue.pop("w-2", Duration::from_millis(300)).await.unwrap() }
        });
        let owner = tokio::spawn({
            let queue = queue.clone();
            async move { queue.pop("w-1", Duration::from_secs(5)).await.unwrap() }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.push(lane, id).await.unwrap();

        assert_eq!(owner.await.unwrap().map(|d| d.task_id), Some(id));
        assert_eq!(bystander.await.unwrap(), None);
    }

    #[tokio::test]
    async fn remove_only_succeeds_while_queued() {
        let queue = InMemoryDeliveryQueue::new();
        let lane = lane_id();
        let (a, b) = (task_id(), task_id());
        queue.open_lane(lane, "w-1").await.unwrap();
        queue.push(lane, a).await.unwrap();
        queue.push(lane, b).await.unwrap();

        assert!(queue.remove(Some(lane), b).await.unwrap());
        assert!(!queue.remove(Some(lane), b).await.unwrap());

        queue.pop("w-1", Duration::from_millis(10)).await.unwrap();
        assert!(!queue.remove(Some(lane), a).await.unwrap());
        assert_eq!(queue.depth(Some(lane)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn close_lane_returns_leftovers_and_rejects_pushes() {
        let queue = InMemoryDeliveryQueue::new();
        let lane = lane_id();
        let id = task_id();
        queue.open_lane(lane, "w-1").await.unwrap();
        queue.push(lane, id).await.unwrap();

        assert_eq!(queue.close_lane(lane).await.unwrap(), vec![id]);
        assert!(queue.push(lane, task_id()).await.is_err());
        assert!(queue.close_lane(lane).await.unwrap().is_empty());
    }
}
