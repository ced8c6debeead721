//! StewardError - クレート共通のエラー型

use thiserror::Error;

use crate::domain::{PayloadKind, ScheduleId, TaskId, TaskState};

pub type Result<T> = std::result::Result<T, StewardError>;

#[derive(Debug, Error)]
pub enum StewardError {
    /// 投入時に拒否。タスクレコードは作られていない
    #[error("invalid submission: {0}")]
    Validation(String),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("scheduled call not found: {0}")]
    ScheduleNotFound(ScheduleId),

    #[error("invalid state transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("no live worker available to take a reservation")]
    NoAvailableWorker,

    #[error("handler not found for payload kind={0}")]
    HandlerNotFound(PayloadKind),

    #[error("duplicate handler for payload kind={0}")]
    DuplicateHandler(PayloadKind),

    #[error("reservation manager is shut down")]
    ReservationClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}
