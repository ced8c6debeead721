//! DeliveryQueue port - 配送レーン
//!
//! レーンが運ぶのはタスク ID だけです。状態と payload は TaskStore にあります。
//!
//! # 設計原則
//! - general レーンは 1 本で、どの worker も pop できる
//! - 予約レーンは任意の数、それぞれちょうど 1 つの worker が所有する
//! - 予約レーンの開閉は reservation manager だけが行う

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{LaneId, TaskId};
use crate::error::Result;

/// Delivery は worker に渡したタスク ID と取り出し元
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub task_id: TaskId,
    /// general レーンなら `None`
    pub lane: Option<LaneId>,
}

#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    async fn push_general(&self, task_id: TaskId) -> Result<()>;

    async fn open_lane(&self, lane: LaneId, owner: &str) -> Result<()>;

    /// 予約レーンに追加。レーンが開いていなければ失敗
    async fn push(&self, lane: LaneId, task_id: TaskId) -> Result<()>;

    /// `worker` の次のタスク。自分のレーンの先頭のうち最古のものを優先し、
    /// なければ general レーン。最大 `timeout` 待つ
    async fn pop(&self, worker: &str, timeout: Duration) -> Result<Option<Delivery>>;

    /// キュー中の ID を取り除く。pop 済みなら `false`
    async fn remove(&self, lane: Option<LaneId>, task_id: TaskId) -> Result<bool>;

    /// レーンを閉じ、残っていた ID を返す
    async fn close_lane(&self, lane: LaneId) -> Result<Vec<TaskId>>;

    /// レーン上の ID 数（`None` は general レーン）
    async fn depth(&self, lane: Option<LaneId>) -> Result<usize>;
}
