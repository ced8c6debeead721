//! Dispatcher - タスクの投入と制御
//!
//! # フロー
//! 1. payload とタグを検証
//! 2. WAITING のレコードを保存
//! 3. ルーティング: タグなしは general レーン、タグ付きは reservation manager 経由
//!
//! キュー投入（または保留）した時点で返ります。実行完了は待ちません。
//!
//! # 実装
//! - `submit_group` は途中でルーティングに失敗すると、投入済みのメンバーを取り消してからエラーを返す
//! - cancel は `TaskStore::update` の中で状態遷移を判定する

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::domain::tags::normalize_tags;
use crate::domain::{
    GroupId, PayloadRef, ResourceTag, TaskId, TaskRecord, TaskState,
};
use crate::error::{Result, StewardError};
use crate::ports::{Clock, DeliveryQueue, IdGenerator, TaskStore, task_update};
use crate::reservation::{ReservationHandle, Routing};

const REVOKE_CHANNEL_CAPACITY: usize = 256;

/// Submission はグループ投入の 1 要素
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub payload: PayloadRef,
    pub resource_tags: Vec<ResourceTag>,
}

impl Submission {
    pub fn new(payload: PayloadRef, resource_tags: Vec<ResourceTag>) -> Self {
        Self {
            payload,
            resource_tags,
        }
    }

    /// payload の必須タグだけを付けた Submission
    pub fn with_required_tags(payload: PayloadRef) -> Self {
        let resource_tags = payload.required_tags();
        Self::new(payload, resource_tags)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "state", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// WAITING だった。CANCELED にした
    Canceled,
    /// RUNNING だった。実行中の worker に通知済み
    Revoking,
    /// すでに終端状態。何も変えていない
    AlreadyTerminal(TaskState),
}

pub struct Dispatcher {
    tasks: Arc<dyn TaskStore>,
    queue: Arc<dyn DeliveryQueue>,
    reservations: ReservationHandle,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    revoke_tx: broadcast::Sender<TaskId>,
}

impl Dispatcher {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        queue: Arc<dyn DeliveryQueue>,
        reservations: ReservationHandle,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (revoke_tx, _) = broadcast::channel(REVOKE_CHANNEL_CAPACITY);
        Self {
            tasks,
            queue,
            reservations,
            ids,
            clock,
            revoke_tx,
        }
    }

    /// 実行を止めるべきタスク ID のストリーム
    pub fn subscribe_revocations(&self) -> broadcast::Receiver<TaskId> {
        self.revoke_tx.subscribe()
    }

    pub(crate) fn validate(payload: &PayloadRef, tags: &[ResourceTag]) -> Result<()> {
        for tag in tags {
            tag.validate()?;
        }
        let missing: Vec<String> = payload
            .required_tags()
            .into_iter()
            .filter(|required| !tags.contains(required))
            .map(|required| required.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(StewardError::Validation(format!(
                "{} requires tags: {}",
                payload.kind(),
                missing.join(", ")
            )));
        }
        Ok(())
    }

    pub async fn submit(
        &self,
        payload: PayloadRef,
        resource_tags: Vec<ResourceTag>,
        group_id: Option<GroupId>,
    ) -> Result<TaskId> {
        Self::validate(&payload, &resource_tags)?;
        self.insert_and_route(payload, normalize_tags(resource_tags), group_id)
            .await
    }

    /// 新しい group id の下で複数タスクを投入
    ///
    /// 保存前に全要素を検証するので、不正な要素が 1 つでもあれば
    /// グループ全体を拒否する。ルーティングが途中で失敗したら、
    /// 投入済みのメンバーをキャンセルしてからエラーを返す。
    pub async fn submit_group(&self, items: Vec<Submission>) -> Result<(GroupId, Vec<TaskId>)> {
        for item in &items {
            Self::validate(&item.payload, &item.resource_tags)?;
        }

        let group_id = self.ids.generate_group_id();
        let mut task_ids = Vec::with_capacity(items.len());
        for item in items {
            let routed = self
                .insert_and_route(item.payload, normalize_tags(item.resource_tags), Some(group_id))
                .await;
            match routed {
                Ok(task_id) => task_ids.push(task_id),
                Err(err) => {
                    warn!(
                        group_id = %group_id,
                        submitted = task_ids.len(),
                        error = %err,
                        "group submission failed; canceling members already submitted"
                    );
                    for task_id in &task_ids {
                        if let Err(cancel_err) = self.cancel(*task_id).await {
                            warn!(task_id = %task_id, error = %cancel_err, "canceling group member failed");
                        }
                    }
                    return Err(err);
                }
            }
        }
        info!(group_id = %group_id, tasks = task_ids.len(), "group submitted");
        Ok((group_id, task_ids))
    }

    async fn insert_and_route(
        &self,
        payload: PayloadRef,
        resource_tags: Vec<ResourceTag>,
        group_id: Option<GroupId>,
    ) -> Result<TaskId> {
        let task_id = self.ids.generate_task_id();
        let kind = payload.kind();
        let keys: Vec<_> = resource_tags
            .iter()
            .map(ResourceTag::reservation_key)
            .collect();

        self.tasks
            .insert(TaskRecord::new(task_id, payload, resource_tags, group_id))
            .await?;

        let routed = if keys.is_empty() {
            self.queue.push_general(task_id).await.map(|_| None)
        } else {
            self.reservations.acquire(task_id, keys).await.map(Some)
        };

        match routed {
            Ok(None) => debug!(task_id = %task_id, kind = %kind, "task queued on general lane"),
            Ok(Some(Routing::Routed { worker_name, .. })) => {
                debug!(task_id = %task_id, kind = %kind, worker_name = %worker_name, "task queued on reserved lane")
            }
            Ok(Some(Routing::Deferred)) => {
                debug!(task_id = %task_id, kind = %kind, "task deferred")
            }
            Err(err) => {
                warn!(task_id = %task_id, kind = %kind, error = %err, "routing failed; dropping task");
                self.tasks.delete(task_id).await?;
                return Err(err);
            }
        }
        Ok(task_id)
    }

    /// タスクをキャンセル
    ///
    /// `spawned_tasks` には波及しない。
    pub async fn cancel(&self, task_id: TaskId) -> Result<CancelOutcome> {
        let record = self
            .tasks
            .get(task_id)
            .await?
            .ok_or(StewardError::TaskNotFound(task_id))?;

        match record.state {
            TaskState::Waiting => {
                let now = self.clock.now();
                let attempt = self
                    .tasks
                    .update(
                        task_id,
                        task_update(move |r| {
                            expect_waiting(r, TaskState::Canceled)?;
                            r.cancel(now)
                        }),
                    )
                    .await;
                match attempt {
                    Ok(_) => {
                        self.withdraw(&record).await?;
                        info!(task_id = %task_id, "waiting task canceled");
                        Ok(CancelOutcome::Canceled)
                    }
                    // その間に worker が取得した
                    Err(StewardError::InvalidTransition {
                        from: TaskState::Running,
                        ..
                    }) => Ok(self.revoke(task_id)),
                    Err(StewardError::InvalidTransition { from, .. }) => {
                        Ok(CancelOutcome::AlreadyTerminal(from))
                    }
                    Err(err) => Err(err),
                }
            }
            TaskState::Running => Ok(self.revoke(task_id)),
            state => {
                debug!(task_id = %task_id, state = %state, "cancel of finished task ignored");
                Ok(CancelOutcome::AlreadyTerminal(state))
            }
        }
    }

    /// WAITING のタスクを不要（superseded）として SKIPPED にする。
    /// すでに WAITING でなければ `false`。
    pub async fn skip(&self, task_id: TaskId) -> Result<bool> {
        let now = self.clock.now();
        let attempt = self
            .tasks
            .update(
                task_id,
                task_update(move |r| {
                    expect_waiting(r, TaskState::Skipped)?;
                    r.skip(now)
                }),
            )
            .await;
        match attempt {
            Ok(record) => {
                self.withdraw(&record).await?;
                info!(task_id = %task_id, "task skipped");
                Ok(true)
            }
            Err(StewardError::InvalidTransition { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn revoke(&self, task_id: TaskId) -> CancelOutcome {
        // 受信側がいないのは、今は何も実行していないというだけ
        let _ = self.revoke_tx.send(task_id);
        info!(task_id = %task_id, "revoke sent for running task");
        CancelOutcome::Revoking
    }

    /// WAITING でなくなったタスクをレーンから外し、どの worker にも pop させない
    async fn withdraw(&self, record: &TaskRecord) -> Result<()> {
        let withdrawn = if record.resource_tags.is_empty() {
            self.queue.remove(None, record.task_id).await?
        } else {
            self.reservations.withdraw(record.task_id).await?
        };
        if !withdrawn {
            debug!(task_id = %record.task_id, "task already popped; worker will skip it");
        }
        Ok(())
    }
}

fn expect_waiting(record: &TaskRecord, to: TaskState) -> Result<()> {
    if record.state == TaskState::Waiting {
        Ok(())
    } else {
        Err(StewardError::InvalidTransition {
            task_id: record.task_id,
            from: record.state,
            to,
        })
    }
}
