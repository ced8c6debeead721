//! TaskRecord - 非同期処理 1 単位の永続ステータス

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{GroupId, TaskId};
use super::payload::PayloadRef;
use super::state::TaskState;
use super::tags::{ResourceTag, action_tag};
use crate::error::StewardError;

/// TaskError はタスクに保存する構造化エラー
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub code: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl TaskError {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// TaskFailure は handler が返す失敗
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}: {}", .error.code, .error.description)]
pub struct TaskFailure {
    pub error: TaskError,
    pub traceback: Option<String>,
}

impl TaskFailure {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            error: TaskError::new(code, description),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }
}

/// TaskOutput は handler の成功時の出力
///
/// FINISHED のタスクも致命的でない `error` を持ちうる。
/// 例えば publish 自体は成功したが副次的なステップが失敗した場合。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    pub spawned_tasks: Vec<TaskId>,
}

impl TaskOutput {
    pub fn with_result(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }
}

/// TaskRecord はタスクのステータス
///
/// 状態は遷移メソッド経由でしか変わらない。
/// 許されない遷移は拒否し、レコードはそのまま残す。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub state: TaskState,
    pub payload: PayloadRef,
    pub resource_tags: Vec<ResourceTag>,
    pub tags: Vec<String>,
    pub group_id: Option<GroupId>,
    pub spawned_tasks: Vec<TaskId>,
    pub worker_name: Option<String>,
    pub progress_report: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    pub traceback: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(
        task_id: TaskId,
        payload: PayloadRef,
        resource_tags: Vec<ResourceTag>,
        group_id: Option<GroupId>,
    ) -> Self {
        let mut tags: Vec<String> = resource_tags.iter().map(ResourceTag::to_tag).collect();
        tags.push(action_tag(payload.kind().action()));
        Self {
            task_id,
            state: TaskState::Waiting,
            payload,
            resource_tags,
            tags,
            group_id,
            spawned_tasks: Vec::new(),
            worker_name: None,
            progress_report: None,
            result: None,
            error: None,
            traceback: None,
            start_time: None,
            finish_time: None,
        }
    }

    fn transition(&mut self, next: TaskState) -> Result<(), StewardError> {
        if !self.state.can_transition_to(next) {
            return Err(StewardError::InvalidTransition {
                task_id: self.task_id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Waiting -> Running（`worker_name` 上で）
    pub fn start(&mut self, worker_name: &str, at: DateTime<Utc>) -> Result<(), StewardError> {
        self.transition(TaskState::Running)?;
        self.worker_name = Some(worker_name.to_string());
        self.start_time = Some(at);
        Ok(())
    }

    pub fn finish(&mut self, output: TaskOutput, at: DateTime<Utc>) -> Result<(), StewardError> {
        self.transition(TaskState::Finished)?;
        self.result = output.result;
        self.error = output.error;
        for child in output.spawned_tasks {
            self.add_spawned(child);
        }
        self.finish_time = Some(at);
        Ok(())
    }

    pub fn fail(&mut self, failure: TaskFailure, at: DateTime<Utc>) -> Result<(), StewardError> {
        self.transition(TaskState::Error)?;
        self.error = Some(failure.error);
        self.traceback = failure.traceback;
        self.finish_time = Some(at);
        Ok(())
    }

    pub fn cancel(&mut self, at: DateTime<Utc>) -> Result<(), StewardError> {
        self.transition(TaskState::Canceled)?;
        self.finish_time = Some(at);
        Ok(())
    }

    pub fn skip(&mut self, at: DateTime<Utc>) -> Result<(), StewardError> {
        self.transition(TaskState::Skipped)?;
        self.finish_time = Some(at);
        Ok(())
    }

    pub fn time_out(&mut self, at: DateTime<Utc>) -> Result<(), StewardError> {
        self.transition(TaskState::TimedOut)?;
        self.finish_time = Some(at);
        Ok(())
    }

    /// 進捗レポートを上書き。終端状態なら無視
    pub fn set_progress(&mut self, report: serde_json::Value) {
        if self.state.is_incomplete() {
            self.progress_report = Some(report);
        }
    }

    /// 実行中に spawn した子を、最終遷移の前に記録
    pub fn add_spawned(&mut self, task_id: TaskId) {
        if !self.spawned_tasks.contains(&task_id) {
            self.spawned_tasks.push(task_id);
        }
    }

    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        tags.iter().any(|tag| self.tags.contains(tag))
    }
}
