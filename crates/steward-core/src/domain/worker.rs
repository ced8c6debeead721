//! WorkerRecord - worker の生存記録

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// WorkerRecord は worker 1 つの生存記録
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub name: String,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn new(name: impl Into<String>, last_heartbeat: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            last_heartbeat,
        }
    }

    /// heartbeat は前にしか進まない
    pub fn refresh(&mut self, at: DateTime<Utc>) {
        if at > self.last_heartbeat {
            self.last_heartbeat = at;
        }
    }

    /// 表現可能な最古の時刻を越えるタイムアウトは期限切れにならない
    pub fn is_alive(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now.checked_sub_signed(timeout)
            .is_none_or(|cutoff| self.last_heartbeat >= cutoff)
    }
}
