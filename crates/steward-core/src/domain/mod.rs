//! Domain - ドメインモデル（ids, 状態遷移, タグ, payload, レコード, スケジュール）

pub mod ids;
pub mod payload;
pub mod schedule;
pub mod state;
pub mod tags;
pub mod task;
pub mod worker;

pub use ids::{GroupId, LaneId, RecordId, ScheduleId, TaskId};
pub use payload::{PayloadKind, PayloadRef};
pub use schedule::{Schedule, ScheduleError, ScheduledCall};
pub use state::TaskState;
pub use tags::{ReservationKey, ResourceKind, ResourceTag, action_tag};
pub use task::{TaskError, TaskFailure, TaskOutput, TaskRecord};
pub use worker::WorkerRecord;
