//! ScheduleRegistry - 定期実行（scheduled call）
//!
//! # フロー
//! 1. `ScheduleRegistry::add` が `ScheduledCall` を登録
//! 2. `run` が `scheduler.check_interval_ms` ごとに起きて `run_due` を呼ぶ
//! 3. `run_due` はまず過去の実行結果を投入順に集計し、次に時刻の来た call を投入する
//!
//! 投入順に集計するので、後から終わった実行が失敗の連続を途中で断ち切ることはありません。
//! 履歴の定期削除もこの call の一つで、`Coordinator::start` が登録します。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::app::dispatcher::Dispatcher;
use crate::domain::{
    PayloadRef, ResourceTag, Schedule, ScheduleId, ScheduledCall, TaskId, TaskState,
};
use crate::error::{Result, StewardError};
use crate::ports::{Clock, IdGenerator, TaskStore};

/// ScheduleRequest は何をいつ実行するか
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleRequest {
    pub payload: PayloadRef,
    pub resource_tags: Vec<ResourceTag>,
    pub schedule: Schedule,
    pub failure_threshold: Option<u32>,
}

impl ScheduleRequest {
    /// payload の必須タグ付き、失敗しきい値なしのリクエスト
    pub fn new(payload: PayloadRef, schedule: Schedule) -> Self {
        Self {
            resource_tags: payload.required_tags(),
            payload,
            schedule,
            failure_threshold: None,
        }
    }

    pub fn with_tags(mut self, resource_tags: Vec<ResourceTag>) -> Self {
        self.resource_tags = resource_tags;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }
}

pub struct ScheduleRegistry {
    calls: Mutex<BTreeMap<ScheduleId, ScheduledCall>>,
    dispatcher: Arc<Dispatcher>,
    tasks: Arc<dyn TaskStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl ScheduleRegistry {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        tasks: Arc<dyn TaskStore>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            calls: Mutex::new(BTreeMap::new()),
            dispatcher,
            tasks,
            ids,
            clock,
        }
    }

    /// `submit` と同じ検証をしてから call を登録する。
    /// 初回はスケジュールの開始時刻、なければ今。
    pub async fn add(&self, request: ScheduleRequest) -> Result<ScheduledCall> {
        Dispatcher::validate(&request.payload, &request.resource_tags)?;
        if request.failure_threshold == Some(0) {
            return Err(StewardError::Validation(
                "failure_threshold must be at least 1".into(),
            ));
        }

        let call = ScheduledCall::new(
            self.ids.generate_schedule_id(),
            request.schedule,
            request.payload,
            request.resource_tags,
            request.failure_threshold,
            self.clock.now(),
        );
        info!(
            schedule_id = %call.schedule_id,
            kind = %call.payload.kind(),
            schedule = %call.schedule,
            first_run = %call.first_run,
            "scheduled call added"
        );
        self.calls.lock().await.insert(call.schedule_id, call.clone());
        Ok(call)
    }

    pub async fn get(&self, schedule_id: ScheduleId) -> Option<ScheduledCall> {
        self.calls.lock().await.get(&schedule_id).cloned()
    }

    /// 有効・無効を問わず全 call を作成順で
    pub async fn list(&self) -> Vec<ScheduledCall> {
        self.calls.lock().await.values().cloned().collect()
    }

    pub async fn set_enabled(&self, schedule_id: ScheduleId, enabled: bool) -> Result<ScheduledCall> {
        let mut calls = self.calls.lock().await;
        let call = calls
            .get_mut(&schedule_id)
            .ok_or(StewardError::ScheduleNotFound(schedule_id))?;
        call.set_enabled(enabled);
        info!(schedule_id = %schedule_id, enabled, "scheduled call updated");
        Ok(call.clone())
    }

    /// この call が投入済みのタスクには触れない。
    pub async fn remove(&self, schedule_id: ScheduleId) -> Result<ScheduledCall> {
        let removed = self
            .calls
            .lock()
            .await
            .remove(&schedule_id)
            .ok_or(StewardError::ScheduleNotFound(schedule_id))?;
        info!(schedule_id = %schedule_id, "scheduled call removed");
        Ok(removed)
    }

    /// 終わった実行を集計し、`now` に時刻の来た call をすべて投入
    ///
    /// dispatcher に拒否された投入は失敗として数える。
    pub async fn run_due(&self, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut calls = self.calls.lock().await;
        let mut submitted = Vec::new();

        for call in calls.values_mut() {
            self.settle(call).await;
            if !call.is_due(now) {
                continue;
            }

            let result = self
                .dispatcher
                .submit(call.payload.clone(), call.resource_tags.clone(), None)
                .await;
            match result {
                Ok(task_id) => {
                    call.record_dispatch(Some(task_id), now);
                    debug!(
                        schedule_id = %call.schedule_id,
                        task_id = %task_id,
                        next_run = ?call.next_run,
                        "scheduled call submitted"
                    );
                    submitted.push(task_id);
                }
                Err(err) => {
                    warn!(schedule_id = %call.schedule_id, error = %err, "scheduled submission failed");
                    call.record_dispatch(None, now);
                    if call.record_outcome(TaskState::Error) {
                        disabled(call);
                    }
                }
            }
            if !call.enabled && call.next_run.is_none() {
                info!(schedule_id = %call.schedule_id, runs = call.total_run_count, "scheduled call exhausted");
            }
        }
        submitted
    }

    /// 過去の実行の終端結果を古い順に失敗カウントへ畳み込む。
    /// まだ終わっていない実行に当たったらそこで止める。
    async fn settle(&self, call: &mut ScheduledCall) {
        while let Some(&task_id) = call.pending.first() {
            let state = match self.tasks.get(task_id).await {
                Ok(Some(record)) if record.state.is_terminal() => Some(record.state),
                Ok(Some(_)) => return,
                // 見る前に reap された。結果は不明
                Ok(None) => None,
                Err(err) => {
                    warn!(schedule_id = %call.schedule_id, task_id = %task_id, error = %err, "reading scheduled task failed");
                    return;
                }
            };
            call.pending.remove(0);
            if let Some(state) = state
                && call.record_outcome(state)
            {
                disabled(call);
            }
        }
    }

    /// シャットダウンまで `every` ごとに時刻の来た call を確認
    pub async fn run(self: Arc<Self>, every: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let submitted = self.run_due(self.clock.now()).await;
                    if !submitted.is_empty() {
                        debug!(tasks = submitted.len(), "scheduled calls submitted");
                    }
                }
            }
        }
        debug!("scheduler stopped");
    }
}

fn disabled(call: &ScheduledCall) {
    warn!(
        schedule_id = %call.schedule_id,
        kind = %call.payload.kind(),
        consecutive_failures = call.consecutive_failures,
        "scheduled call disabled after consecutive failures"
    );
}
