//! IdGenerator port - ID 採番
//!
//! ID は注入した `Clock` の時刻で刻んだ ULID です。テスト用の clock なら作成時刻が既知の ID になります。
//! 同一ミリ秒内は単調増加で採番するので、投入順が ID 順にそのまま現れます。

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::domain::{GroupId, LaneId, RecordId, ScheduleId, TaskId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_group_id(&self) -> GroupId;

    fn generate_lane_id(&self) -> LaneId;

    fn generate_record_id(&self) -> RecordId;

    fn generate_schedule_id(&self) -> ScheduleId;
}

pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
    last: Mutex<Option<Ulid>>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last: Mutex::new(None),
        }
    }

    fn next(&self) -> Ulid {
        let now_ms = self.clock.now().timestamp_millis().max(0) as u64;
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let ulid = match *last {
            Some(prev) if prev.timestamp_ms() == now_ms => prev
                .increment()
                .unwrap_or_else(|| Ulid::from_parts(now_ms, rand::random())),
            _ => Ulid::from_parts(now_ms, rand::random()),
        };
        *last = Some(ulid);
        ulid
    }
}

impl IdGenerator for UlidGenerator {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next())
    }

    fn generate_group_id(&self) -> GroupId {
        GroupId::from(self.next())
    }

    fn generate_lane_id(&self) -> LaneId {
        LaneId::from(self.next())
    }

    fn generate_record_id(&self) -> RecordId {
        RecordId::from(self.next())
    }

    fn generate_schedule_id(&self) -> ScheduleId {
        ScheduleId::from(self.next())
    }
}

/// `at` に作られたエントリの RecordId（generator に依存しない）
pub fn record_id_at(at: DateTime<Utc>) -> RecordId {
    RecordId::from(Ulid::from_parts(
        at.timestamp_millis().max(0) as u64,
        rand::random(),
    ))
}
